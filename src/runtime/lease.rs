//! # Leases
//!
//! A [`Lease`] answers "may this controller run right now". Change
//! notifications are edge triggers only and may coalesce, so consumers must
//! re-check [`Lease::held`] after every wake-up.
//!
//! Leadership comes from a [`LeadershipSource`] injected into the manager.
//! [`RaftLeadership`] is the in-process source flipped by the consensus
//! layer; each singleton controller gets its own [`LeaderLease`] subscribed
//! to it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[async_trait]
pub trait Lease: Send + Sync {
    /// Point-in-time, non-blocking.
    fn held(&self) -> bool;

    /// Resolves after the held state may have changed.
    async fn changed(&self);
}

/// Always held. Used for controllers placed on every server.
#[derive(Debug, Default, Clone, Copy)]
pub struct EternalLease;

#[async_trait]
impl Lease for EternalLease {
    fn held(&self) -> bool {
        true
    }

    async fn changed(&self) {
        std::future::pending::<()>().await;
    }
}

pub trait LeadershipSource: Send + Sync {
    fn is_leader(&self) -> bool;

    /// New change subscription. The channel has capacity one; a pending
    /// signal stands in for any number of transitions.
    fn subscribe(&self) -> mpsc::Receiver<()>;
}

/// Leadership flag set by the consensus layer.
#[derive(Debug, Default)]
pub struct RaftLeadership {
    leader: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl RaftLeadership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the leadership state and signal every subscriber without blocking.
    pub fn set_leader(&self, held: bool) {
        self.leader.store(held, Ordering::SeqCst);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }
}

impl LeadershipSource for RaftLeadership {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

/// Held while the leadership source says this server leads.
pub struct LeaderLease {
    source: Arc<dyn LeadershipSource>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for LeaderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderLease")
            .field("held", &self.held())
            .finish_non_exhaustive()
    }
}

impl LeaderLease {
    pub fn new(source: Arc<dyn LeadershipSource>) -> Self {
        let rx = source.subscribe();
        Self {
            source,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Lease for LeaderLease {
    fn held(&self) -> bool {
        self.source.is_leader()
    }

    async fn changed(&self) {
        let mut rx = self.rx.lock().await;
        if rx.recv().await.is_none() {
            drop(rx);
            std::future::pending::<()>().await;
        }
    }
}
