//! # Manager
//!
//! Owns the registered controllers and supervises one pipeline per
//! controller once [`Manager::run`] is called.
//!
//! Singleton controllers run only while this server is the raft leader;
//! each gets its own [`LeaderLease`] on the manager's [`LeadershipSource`].
//! That is a [`RaftLeadership`] flag unless another source is injected with
//! [`Manager::with_leadership`]. Each-server controllers hold an
//! [`EternalLease`].

use super::builder::{Controller, Placement};
use crate::config::RuntimeConfig;
use crate::resource::SharedResourceService;
use crate::runtime::{
    ControllerRunner, EternalLease, LeaderLease, Lease, LeadershipSource, RaftLeadership,
    RestartBackoff, RunnerSettings, Supervisor,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

pub struct Manager {
    client: SharedResourceService,
    config: RuntimeConfig,
    leadership: Arc<dyn LeadershipSource>,
    /// Set while leadership is the built-in flag rather than an injected source.
    raft: Option<Arc<RaftLeadership>>,
    controllers: Mutex<Vec<Arc<Controller>>>,
    running: AtomicBool,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let controllers = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>();
        f.debug_struct("Manager")
            .field("controllers", &controllers)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("leader", &self.leadership.is_leader())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Manager with default settings and its own leadership flag (not leader).
    pub fn new(client: SharedResourceService) -> Self {
        Self::with_config(client, RuntimeConfig::default())
    }

    pub fn with_config(client: SharedResourceService, config: RuntimeConfig) -> Self {
        let raft = Arc::new(RaftLeadership::new());
        Self {
            client,
            config,
            leadership: Arc::clone(&raft) as Arc<dyn LeadershipSource>,
            raft: Some(raft),
            controllers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Take leadership from a source owned by the consensus layer.
    /// [`Manager::set_raft_leader`] has no effect afterwards.
    #[must_use]
    pub fn with_leadership(mut self, leadership: Arc<dyn LeadershipSource>) -> Self {
        self.leadership = leadership;
        self.raft = None;
        self
    }

    /// Add a controller to be run by [`Manager::run`].
    ///
    /// # Panics
    ///
    /// Misconfiguration is a programming error and fails fast:
    /// - the controller has no reconciler
    /// - the manager is already running
    /// - the managed or a watched type is missing its group, version or kind
    pub fn register(&self, controller: Controller) {
        assert!(
            controller.has_reconciler(),
            "cannot register controller without a reconciler {controller}"
        );
        assert!(
            !self.running.load(Ordering::SeqCst),
            "cannot register controller {} after the manager is running",
            controller.name()
        );
        assert!(
            controller.managed_type().is_valid(),
            "controller {} manages invalid type {}",
            controller.name(),
            controller.managed_type()
        );
        if let Some(invalid) = controller.watched_types().find(|t| !t.is_valid()) {
            panic!("controller {} watches invalid type {invalid}", controller.name());
        }

        info!(controller = %controller.name(), "registered controller {controller}");
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(controller));
    }

    /// Start a supervisor per registered controller and return at once.
    /// Supervision continues until `cancel` fires. Later calls are ignored.
    pub fn run(&self, cancel: &CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("manager is already running");
            return;
        }
        let controllers = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for controller in controllers {
            let lease: Arc<dyn Lease> = match controller.placement() {
                Placement::Singleton => Arc::new(LeaderLease::new(
                    Arc::clone(&self.leadership) as Arc<dyn LeadershipSource>
                )),
                Placement::EachServer => Arc::new(EternalLease),
            };
            let name = controller.name().to_string();
            let placement = controller.placement();
            let settings = self.runner_settings(&controller);
            let runner = ControllerRunner::new(controller, Arc::clone(&self.client), settings);
            let supervisor = Supervisor::new(
                name.clone(),
                runner.into_task(),
                lease,
                RestartBackoff::new(
                    self.config.supervisor_min_backoff(),
                    self.config.supervisor_max_backoff(),
                    self.config.supervisor_jitter_percent,
                ),
                self.config.flap_threshold(),
            );

            let span = tracing::info_span!("controller.supervisor", controller = %name, %placement);
            tokio::spawn(supervisor.run(cancel.clone()).instrument(span));
        }
    }

    /// Record whether this server is the raft leader.
    pub fn set_raft_leader(&self, held: bool) {
        let Some(raft) = &self.raft else {
            warn!(leader = held, "ignoring raft leadership change, leadership is injected");
            return;
        };
        info!(leader = held, "raft leadership changed");
        raft.set_leader(held);
    }

    pub fn leadership(&self) -> Arc<dyn LeadershipSource> {
        Arc::clone(&self.leadership)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn runner_settings(&self, controller: &Controller) -> RunnerSettings {
        let (base_backoff, max_backoff) = controller
            .backoff()
            .unwrap_or((self.config.base_backoff(), self.config.max_backoff()));
        RunnerSettings {
            base_backoff,
            max_backoff,
            heartbeat: self.config.defer_queue_heartbeat(),
            force_reconcile_every: controller
                .force_reconcile_every()
                .unwrap_or_else(|| self.config.force_reconcile_every()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::dependency::map_owner;
    use crate::controller::{Request, Runtime};
    use crate::resource::memory::InMemoryResourceService;
    use crate::resource::Type;
    use std::time::Duration;

    fn manager() -> Manager {
        Manager::new(Arc::new(InMemoryResourceService::new()))
    }

    struct Noop;

    #[async_trait::async_trait]
    impl crate::controller::Reconciler for Noop {
        async fn reconcile(&self, _rt: &Runtime, _request: Request) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    #[should_panic(expected = "cannot register controller without a reconciler")]
    fn test_register_requires_reconciler() {
        manager().register(Controller::new("artist", Type::new("demo", "v2", "Artist"), []));
    }

    #[test]
    #[should_panic(expected = "watches invalid type")]
    fn test_register_rejects_invalid_watch() {
        manager().register(
            Controller::new("artist", Type::new("demo", "v2", "Artist"), [])
                .with_watch(Type::new("demo", "", "Album"), map_owner(), [])
                .with_reconciler(Noop),
        );
    }

    #[tokio::test]
    #[should_panic(expected = "after the manager is running")]
    async fn test_register_after_run_panics() {
        let mgr = manager();
        mgr.run(&CancellationToken::new());
        mgr.register(
            Controller::new("artist", Type::new("demo", "v2", "Artist"), []).with_reconciler(Noop),
        );
    }

    #[test]
    fn test_runner_settings_prefer_controller_values() {
        let mgr = manager();
        let ctrl = Controller::new("artist", Type::new("demo", "v2", "Artist"), [])
            .with_backoff(Duration::from_millis(10), Duration::from_secs(1))
            .with_force_reconcile_every(Duration::ZERO);
        let settings = mgr.runner_settings(&ctrl);
        assert_eq!(settings.base_backoff, Duration::from_millis(10));
        assert_eq!(settings.max_backoff, Duration::from_secs(1));
        assert!(settings.force_reconcile_every.is_zero());

        let defaults = mgr.runner_settings(&Controller::new(
            "album",
            Type::new("demo", "v2", "Album"),
            [],
        ));
        assert_eq!(defaults.base_backoff, Duration::from_millis(5));
        assert_eq!(defaults.force_reconcile_every, Duration::from_secs(8 * 60 * 60));
    }

    struct FixedLeadership(bool);

    impl LeadershipSource for FixedLeadership {
        fn is_leader(&self) -> bool {
            self.0
        }

        fn subscribe(&self) -> tokio::sync::mpsc::Receiver<()> {
            tokio::sync::mpsc::channel(1).1
        }
    }

    #[test]
    fn test_injected_leadership_replaces_raft_flag() {
        let mgr = manager().with_leadership(Arc::new(FixedLeadership(true)));
        assert!(mgr.leadership().is_leader());
        mgr.set_raft_leader(false);
        assert!(mgr.leadership().is_leader());
    }

    #[tokio::test]
    async fn test_second_run_is_ignored() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        mgr.run(&cancel);
        mgr.run(&cancel);
        assert!(mgr.is_running());
        cancel.cancel();
    }

    #[test]
    fn test_set_raft_leader() {
        let mgr = manager();
        assert!(!mgr.leadership().is_leader());
        mgr.set_raft_leader(true);
        assert!(mgr.leadership().is_leader());
    }
}
