//! HA Coordinator (`spec.md` §4.6): single-writer leader election for the
//! scaling, auto-scaler and cleanup control loops, built atop the shared
//! store's atomic lease primitives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::HaSettings;
use crate::error::{Classify, ErrorKind};
use crate::events_bus::{EventBus, LeaderEvent};
use crate::store::{SharedStore, StoreError};

const FOLLOWER_POLL_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Error)]
pub enum HaError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for HaError {
    fn kind(&self) -> ErrorKind {
        match self {
            HaError::Store(e) => e.kind(),
        }
    }
}

/// Tracks this node's belief about its own leadership so control loops can
/// check `is_leader()` cheaply without round-tripping the store.
pub struct HaCoordinator {
    store: Arc<dyn SharedStore>,
    events: Arc<EventBus>,
    settings: HaSettings,
    is_leader: AtomicBool,
    term: std::sync::atomic::AtomicU64,
}

impl HaCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, events: Arc<EventBus>, settings: HaSettings) -> Self {
        Self {
            store,
            events,
            settings,
            is_leader: AtomicBool::new(false),
            term: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn is_leader(&self) -> bool {
        !self.settings.enabled || self.is_leader.load(Ordering::Acquire)
    }

    fn set_leader(&self, leader: bool, term: u64) {
        let was_leader = self.is_leader.swap(leader, Ordering::AcqRel);
        self.term.store(term, Ordering::Release);
        if was_leader != leader {
            info!(node_id = %self.settings.node_id, term, leader, "leadership changed");
            self.events.publish_leader(LeaderEvent {
                node_id: self.settings.node_id.clone(),
                term,
                became_leader: leader,
                at: Utc::now(),
            });
        }
    }

    /// One election attempt or renewal, called on every tick of the HA
    /// loop regardless of current role (`spec.md` §4.6).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), HaError> {
        let now = Utc::now();
        if self.is_leader.load(Ordering::Acquire) {
            match self
                .store
                .renew_lease(&self.settings.node_id, self.settings.leader_ttl_secs, now)
                .await?
            {
                Some(lease) => self.set_leader(true, lease.term),
                None => {
                    warn!(node_id = %self.settings.node_id, "lease renewal failed, relinquishing leadership");
                    self.set_leader(false, self.term.load(Ordering::Acquire));
                }
            }
            return Ok(());
        }

        match self
            .store
            .try_acquire_lease(&self.settings.node_id, self.settings.leader_ttl_secs, now)
            .await?
        {
            Some(lease) => self.set_leader(true, lease.term),
            None => {
                if let Some(lease) = self.store.get_lease().await? {
                    self.set_leader(false, lease.term);
                }
            }
        }
        Ok(())
    }

    pub async fn relinquish(&self) -> Result<(), HaError> {
        if self.is_leader.load(Ordering::Acquire) {
            self.store.release_lease(&self.settings.node_id).await?;
            self.set_leader(false, self.term.load(Ordering::Acquire));
        }
        Ok(())
    }
}

/// Drives leadership acquisition, renewal (every `leader_renew_interval_secs`
/// while leading), and follower polling (every 3s), always on the faster of
/// the two cadences so a follower notices a takeover promptly.
pub async fn run_ha_loop(coordinator: Arc<HaCoordinator>, cancel: CancellationToken) {
    if !coordinator.settings.enabled {
        return;
    }

    let mut tick = tokio::time::interval(StdDuration::from_secs(
        coordinator
            .settings
            .leader_renew_interval_secs
            .min(FOLLOWER_POLL_INTERVAL_SECS),
    ));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = coordinator.relinquish().await;
                return;
            }
            _ = tick.tick() => {
                if let Err(e) = coordinator.tick().await {
                    warn!(error = %e, "HA tick failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn settings(node_id: &str) -> HaSettings {
        HaSettings {
            enabled: true,
            node_id: node_id.to_string(),
            leader_ttl_secs: 15,
            leader_renew_interval_secs: 5,
        }
    }

    #[tokio::test]
    async fn first_candidate_becomes_leader() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let coordinator = HaCoordinator::new(store, Arc::new(EventBus::new()), settings("node-a"));
        coordinator.tick().await.unwrap();
        assert!(coordinator.is_leader());
    }

    #[tokio::test]
    async fn second_candidate_stays_follower_while_lease_is_held() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = HaCoordinator::new(store.clone(), Arc::new(EventBus::new()), settings("node-a"));
        let b = HaCoordinator::new(store, Arc::new(EventBus::new()), settings("node-b"));

        a.tick().await.unwrap();
        b.tick().await.unwrap();

        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn relinquish_lets_another_node_take_over() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = HaCoordinator::new(store.clone(), Arc::new(EventBus::new()), settings("node-a"));
        let b = HaCoordinator::new(store, Arc::new(EventBus::new()), settings("node-b"));

        a.tick().await.unwrap();
        a.relinquish().await.unwrap();
        b.tick().await.unwrap();

        assert!(!a.is_leader());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn ha_disabled_always_reports_leader() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mut disabled = settings("node-a");
        disabled.enabled = false;
        let coordinator = HaCoordinator::new(store, Arc::new(EventBus::new()), disabled);
        assert!(coordinator.is_leader());
    }
}
