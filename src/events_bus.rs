//! Internal domain event bus (`spec.md` §4.1 step 7, §9 "Dynamic event bus ->
//! typed message channels"). The source this crate is modeled on used an
//! untyped `emit`/`on` pair; this is a small set of named, typed
//! `tokio::sync::broadcast` channels, one per event kind, instead.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::model::{Conclusion, JobState, RunnerState, ScalingDecision};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub repository: String,
    pub state: JobState,
    pub conclusion: Option<Conclusion>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub runner_id: String,
    pub pool: String,
    pub state: RunnerState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScalingEvent {
    pub decision: ScalingDecision,
}

#[derive(Debug, Clone)]
pub struct LeaderEvent {
    pub node_id: String,
    pub term: u64,
    pub became_leader: bool,
    pub at: DateTime<Utc>,
}

/// Fan-out point for the dashboard/WebSocket edge (kept external to this
/// crate per `spec.md` §1); components publish, nothing in this crate
/// subscribes except tests.
#[derive(Clone)]
pub struct EventBus {
    jobs: broadcast::Sender<JobEvent>,
    runners: broadcast::Sender<RunnerEvent>,
    scaling: broadcast::Sender<ScalingEvent>,
    leader: broadcast::Sender<LeaderEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            jobs: broadcast::channel(CHANNEL_CAPACITY).0,
            runners: broadcast::channel(CHANNEL_CAPACITY).0,
            scaling: broadcast::channel(CHANNEL_CAPACITY).0,
            leader: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Publishing never fails the caller: a fan-out edge with no current
    /// subscribers is a normal, not exceptional, state.
    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.jobs.send(event);
    }

    pub fn publish_runner(&self, event: RunnerEvent) {
        let _ = self.runners.send(event);
    }

    pub fn publish_scaling(&self, event: ScalingEvent) {
        let _ = self.scaling.send(event);
    }

    pub fn publish_leader(&self, event: LeaderEvent) {
        let _ = self.leader.send(event);
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }

    pub fn subscribe_runners(&self) -> broadcast::Receiver<RunnerEvent> {
        self.runners.subscribe()
    }

    pub fn subscribe_scaling(&self) -> broadcast::Receiver<ScalingEvent> {
        self.scaling.subscribe()
    }

    pub fn subscribe_leader(&self) -> broadcast::Receiver<LeaderEvent> {
        self.leader.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_job_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_jobs();

        bus.publish_job(JobEvent {
            job_id: "1".into(),
            repository: "acme/svc".into(),
            state: JobState::Pending,
            conclusion: None,
            at: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id, "1");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_runner(RunnerEvent {
            runner_id: "r1".into(),
            pool: "acme/svc".into(),
            state: RunnerState::Idle,
            at: Utc::now(),
        });
    }
}
