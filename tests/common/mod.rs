//! Common test utilities shared by the integration tests.

#![allow(dead_code, reason = "each test binary uses a subset of the helpers")]

use anyhow::anyhow;
use async_trait::async_trait;
use controller_runtime::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long to wait for a reconcile that should happen.
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn artist_type() -> Type {
    Type::new("demo", "v2", "Artist")
}

pub fn album_type() -> Type {
    Type::new("demo", "v2", "Album")
}

pub fn service() -> Arc<InMemoryResourceService> {
    Arc::new(InMemoryResourceService::with_types([
        artist_type(),
        album_type(),
    ]))
}

/// Fast supervisor settings without jitter.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        supervisor_min_backoff_ms: 50,
        supervisor_max_backoff_ms: 1_000,
        supervisor_jitter_percent: 0,
        ..RuntimeConfig::default()
    }
}

pub fn manager(service: &Arc<InMemoryResourceService>) -> Manager {
    Manager::with_config(
        Arc::clone(service) as SharedResourceService,
        test_config(),
    )
}

pub async fn write_artist(service: &InMemoryResourceService, name: &str) -> Resource {
    service
        .write(
            Resource::new(Id::new(artist_type(), Tenancy::namespaced(), name))
                .with_data(serde_json::json!({ "genre": "rock" })),
        )
        .await
        .expect("write artist")
}

pub async fn write_album(service: &InMemoryResourceService, name: &str, owner: &Id) -> Resource {
    service
        .write(
            Resource::new(Id::new(album_type(), Tenancy::namespaced(), name))
                .with_owner(owner.clone()),
        )
        .await
        .expect("write album")
}

/// Event object for custom sources: a concert by an artist.
pub struct Concert {
    pub artist: Id,
}

impl EventObject for Concert {
    fn key(&self) -> String {
        format!("concert/{}", self.artist.key())
    }
}

enum Outcome {
    Fail(String),
    Panic(String),
    RequeueAfter(Duration),
}

struct Inner {
    tx: mpsc::UnboundedSender<Request>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Request>>,
    outcomes: Mutex<VecDeque<Outcome>>,
    runtime: Mutex<Option<Runtime>>,
}

/// Reconciler that reports every request it sees and succeeds unless told
/// otherwise for its next call.
#[derive(Clone)]
pub struct TestReconciler {
    inner: Arc<Inner>,
}

impl TestReconciler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                outcomes: Mutex::new(VecDeque::new()),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.push(Outcome::Fail(message.to_string()));
    }

    pub fn panic_next(&self, message: &str) {
        self.push(Outcome::Panic(message.to_string()));
    }

    pub fn requeue_next(&self, delay: Duration) {
        self.push(Outcome::RequeueAfter(delay));
    }

    fn push(&self, outcome: Outcome) {
        self.inner.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Runtime of the most recent reconcile call.
    pub fn runtime(&self) -> Runtime {
        self.inner
            .runtime
            .lock()
            .unwrap()
            .clone()
            .expect("reconciler has not run yet")
    }

    async fn next(&self, within: Duration) -> Option<Request> {
        let mut rx = self.inner.rx.lock().await;
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    pub async fn expect_request(&self, id: &Id) -> Request {
        self.expect_request_within(id, RECONCILE_TIMEOUT).await
    }

    pub async fn expect_request_within(&self, id: &Id, within: Duration) -> Request {
        let request = self
            .next(within)
            .await
            .unwrap_or_else(|| panic!("timed out waiting for a reconcile of {id}"));
        assert_eq!(&request.id, id, "reconciled the wrong resource");
        request
    }

    /// Expect one request per id, in any order.
    pub async fn expect_requests(&self, ids: &[&Id]) {
        let mut expected: Vec<String> = ids.iter().map(|id| id.key()).collect();
        let mut seen = Vec::new();
        for _ in ids {
            let request = self
                .next(RECONCILE_TIMEOUT)
                .await
                .expect("timed out waiting for reconciles");
            seen.push(request.id.key());
        }
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    pub async fn expect_no_request(&self, within: Duration) {
        if let Some(request) = self.next(within).await {
            panic!("unexpected reconcile of {}", request.id);
        }
    }
}

#[async_trait]
impl Reconciler for TestReconciler {
    async fn reconcile(&self, rt: &Runtime, request: Request) -> anyhow::Result<()> {
        *self.inner.runtime.lock().unwrap() = Some(rt.clone());
        let outcome = self.inner.outcomes.lock().unwrap().pop_front();
        self.inner.tx.send(request).expect("test receiver dropped");

        match outcome {
            None => Ok(()),
            Some(Outcome::Fail(message)) => Err(anyhow!(message)),
            Some(Outcome::Panic(message)) => panic!("{message}"),
            Some(Outcome::RequeueAfter(delay)) => Err(requeue_after(delay)),
        }
    }
}
