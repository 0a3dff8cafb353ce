//! # Supervisor
//!
//! Runs a single pipeline task under lease control.
//!
//! - Lease held, nothing running, no backoff pending: start the task with a
//!   fresh child token.
//! - Lease lost while running: cancel the task and reset backoff.
//! - Task exits after running at least the flap threshold: restart at once.
//! - Task exits sooner: wait out the next crash-loop backoff delay, then
//!   restart if the lease is still held.
//! - Task fails with a fatal error: stop supervising for good.
//! - Outer token cancelled: cancel the task and return.

use super::backoff::RestartBackoff;
use super::error_policy::RunnerError;
use super::lease::Lease;
use crate::observability::metrics;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Restartable unit of work. Each call must start from scratch.
pub type Task =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), RunnerError>> + Send + Sync>;

struct Running {
    handle: JoinHandle<Result<(), RunnerError>>,
    token: CancellationToken,
    started: Instant,
}

enum Wake {
    Shutdown,
    LeaseChanged,
    TaskExited(Result<Result<(), RunnerError>, JoinError>),
    BackoffElapsed,
}

pub struct Supervisor {
    name: String,
    task: Task,
    lease: Arc<dyn Lease>,
    backoff: RestartBackoff,
    flap_threshold: Duration,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .field("flap_threshold", &self.flap_threshold)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        name: impl Into<String>,
        task: Task,
        lease: Arc<dyn Lease>,
        backoff: RestartBackoff,
        flap_threshold: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            lease,
            backoff,
            flap_threshold,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut running: Option<Running> = None;
        let mut backoff_until: Option<Instant> = None;

        loop {
            if running.is_none() && backoff_until.is_none() && self.lease.held() {
                running = Some(self.start(&cancel));
            }

            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Shutdown,
                () = self.lease.changed() => Wake::LeaseChanged,
                exited = join(&mut running) => Wake::TaskExited(exited),
                () = wait_until(backoff_until) => Wake::BackoffElapsed,
            };

            match wake {
                Wake::Shutdown => {
                    if let Some(task) = running.take() {
                        self.stop(task).await;
                    }
                    info!(controller = %self.name, "supervisor stopped");
                    return;
                }
                Wake::LeaseChanged => {
                    if !self.lease.held() {
                        if let Some(task) = running.take() {
                            info!(controller = %self.name, "lease lost, stopping controller");
                            self.stop(task).await;
                            self.backoff.reset();
                        }
                    }
                }
                Wake::TaskExited(exited) => {
                    let Some(task) = running.take() else { continue };
                    metrics::set_controller_running(&self.name, false);
                    let elapsed = task.started.elapsed();

                    match exited {
                        Ok(Ok(())) => {
                            info!(controller = %self.name, ?elapsed, "controller exited");
                        }
                        Ok(Err(err)) if err.is_fatal() => {
                            error!(
                                controller = %self.name,
                                error = %err,
                                "controller failed with a non-retryable error, not restarting"
                            );
                            metrics::increment_pipeline_failures(&self.name);
                            return;
                        }
                        Ok(Err(err)) => {
                            warn!(controller = %self.name, error = %err, ?elapsed, "controller failed");
                            metrics::increment_pipeline_failures(&self.name);
                        }
                        Err(join_err) => {
                            error!(controller = %self.name, error = %join_err, "controller task aborted");
                            metrics::increment_pipeline_failures(&self.name);
                        }
                    }

                    if elapsed >= self.flap_threshold {
                        self.backoff.reset();
                    } else {
                        let delay = self.backoff.next_delay();
                        warn!(controller = %self.name, ?delay, "controller is flapping, backing off");
                        backoff_until = Some(Instant::now() + delay);
                    }
                }
                Wake::BackoffElapsed => backoff_until = None,
            }
        }
    }

    fn start(&self, cancel: &CancellationToken) -> Running {
        info!(controller = %self.name, "starting controller");
        let token = cancel.child_token();
        let handle = tokio::spawn((self.task)(token.clone()));
        metrics::set_controller_running(&self.name, true);
        Running {
            handle,
            token,
            started: Instant::now(),
        }
    }

    async fn stop(&self, task: Running) {
        task.token.cancel();
        match task.handle.await {
            Ok(Err(err)) => warn!(controller = %self.name, error = %err, "controller stopped with error"),
            Err(join_err) => warn!(controller = %self.name, error = %join_err, "controller task aborted"),
            Ok(Ok(())) => {}
        }
        metrics::set_controller_running(&self.name, false);
    }
}

async fn join(running: &mut Option<Running>) -> Result<Result<(), RunnerError>, JoinError> {
    match running {
        Some(task) => (&mut task.handle).await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
