//! # Error Policy
//!
//! Error handling for the controller pipeline: what a reconcile outcome
//! means for the request's next attempt, and which watch failures are
//! programming errors rather than transient faults.

use crate::cache::CacheError;
use crate::controller::{Request, RequeueAfter};
use crate::observability::metrics;
use crate::resource::{ResourceError, Type};
use std::any::Any;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("controller {controller} failed to initialize: {source}")]
    Initialize {
        controller: String,
        #[source]
        source: anyhow::Error,
    },
    /// The watch request itself was rejected: the controller declared a
    /// type or tenancy the resource service does not accept.
    #[error("invalid watch on {resource_type}: {message}")]
    InvalidWatch {
        resource_type: String,
        message: String,
    },
    #[error("watch on {resource_type} failed: {source}")]
    Watch {
        resource_type: String,
        #[source]
        source: ResourceError,
    },
    #[error("watch stream for {0} closed")]
    StreamClosed(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RunnerError {
    /// Fatal errors are never retried by the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidWatch { .. })
    }
}

/// What to do with a request after a reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Success: clear backoff history.
    Forget,
    /// Explicit re-schedule after exactly this delay.
    RequeueAfter(Duration),
    /// Failure: retry with escalating backoff.
    RateLimited,
}

/// Decide the retry action for a reconcile result.
pub fn retry_action(result: &anyhow::Result<()>) -> RetryAction {
    match result {
        Ok(()) => RetryAction::Forget,
        Err(err) => match err.downcast_ref::<RequeueAfter>() {
            Some(RequeueAfter(delay)) => RetryAction::RequeueAfter(*delay),
            None => RetryAction::RateLimited,
        },
    }
}

/// Log and record a reconcile outcome, returning the retry action.
pub fn handle_reconcile_result(
    controller: &str,
    request: &Request,
    result: &anyhow::Result<()>,
    elapsed: Duration,
) -> RetryAction {
    let action = retry_action(result);
    let seconds = elapsed.as_secs_f64();
    match (&action, result) {
        (RetryAction::Forget, _) => {
            debug!(resource_id = %request.id, "reconcile succeeded");
            metrics::record_reconcile(controller, "success", seconds);
        }
        (RetryAction::RequeueAfter(delay), _) => {
            debug!(resource_id = %request.id, delay = ?delay, "reconcile requested requeue");
            metrics::record_reconcile(controller, "requeue", seconds);
            metrics::increment_requeues(controller, "requeue-after");
        }
        (RetryAction::RateLimited, Err(err)) => {
            let message = format!("{err:#}");
            error!(resource_id = %request.id, error = %message, "error executing reconcile");
            metrics::record_reconcile(controller, "error", seconds);
            metrics::increment_requeues(controller, "error-backoff");
        }
        (RetryAction::RateLimited, Ok(())) => {}
    }
    action
}

/// Map a watch failure onto a pipeline error.
///
/// `InvalidArgument` means the watch declaration is malformed and retrying
/// can never help, so it becomes the fatal [`RunnerError::InvalidWatch`].
pub fn classify_watch_error(resource_type: &Type, err: ResourceError) -> RunnerError {
    match err {
        ResourceError::InvalidArgument(message) => {
            error!(resource_type = %resource_type, %message, "watch rejected as invalid");
            RunnerError::InvalidWatch {
                resource_type: resource_type.to_string(),
                message,
            }
        }
        source => {
            warn!(resource_type = %resource_type, error = %source, "watch failed");
            RunnerError::Watch {
                resource_type: resource_type.to_string(),
                source,
            }
        }
    }
}

/// Best-effort message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::requeue_after;
    use crate::resource::{Id, Tenancy};

    fn request() -> Request {
        Request::new(Id::new(
            Type::new("demo", "v2", "Artist"),
            Tenancy::namespaced(),
            "queen",
        ))
    }

    #[test]
    fn test_retry_action() {
        assert_eq!(retry_action(&Ok(())), RetryAction::Forget);
        assert_eq!(
            retry_action(&Err(anyhow::anyhow!("KABOOM"))),
            RetryAction::RateLimited
        );
        assert_eq!(
            retry_action(&Err(requeue_after(Duration::from_secs(1)))),
            RetryAction::RequeueAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_handle_reconcile_result_returns_action() {
        let action = handle_reconcile_result(
            "error-policy-test",
            &request(),
            &Err(anyhow::anyhow!("KABOOM")),
            Duration::from_millis(3),
        );
        assert_eq!(action, RetryAction::RateLimited);
    }

    #[test]
    fn test_invalid_argument_is_fatal() {
        let artist = Type::new("demo", "v2", "Artist");
        let err = classify_watch_error(
            &artist,
            ResourceError::InvalidArgument("bad tenancy".to_string()),
        );
        assert!(err.is_fatal());

        let err = classify_watch_error(&artist, ResourceError::Unavailable("down".to_string()));
        assert!(!err.is_fatal());
        assert!(matches!(err, RunnerError::Watch { .. }));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 1");
    }
}
