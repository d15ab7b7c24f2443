//! In-memory stand-in for the cluster metadata service (spec.md §6): a
//! pub/sub + key-value store delivering node add/remove, worker failure,
//! actor state transitions, resource add/update/delete, heartbeat batches,
//! and job add/finish. Real deployments subscribe to this over the wire;
//! this fake lets a scenario publish an event directly and assert on what
//! subscribers observed.

use std::sync::Arc;

use parking_lot::Mutex;
use ray_core_common::{ActorId, Address, JobId, NodeId, ResourceSet};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub enum ActorState {
    Alive { address: Address },
    Reconstructing,
    Dead,
}

#[derive(Clone, Debug)]
pub enum ClusterEvent {
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    WorkerFailed { node_id: NodeId, worker_id: u64 },
    ActorStateChanged { actor_id: ActorId, state: ActorState },
    ResourceUpdated { node_id: NodeId, resources: ResourceSet },
    ResourceDeleted { node_id: NodeId, label: String },
    Heartbeat { node_id: NodeId },
    JobAdded(JobId),
    JobFinished(JobId),
}

/// A fake of the cluster metadata service's pub/sub half. `subscribe`
/// mirrors the daemon startup subscription named in spec.md §6; `publish`
/// is the test's hand standing in for a real node's announcement.
pub struct FakeClusterMetadata {
    tx: broadcast::Sender<ClusterEvent>,
    history: Mutex<Vec<ClusterEvent>>,
}

impl FakeClusterMetadata {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event to current subscribers and records it, so a
    /// scenario can both react live and assert on the full event history
    /// afterward.
    pub fn publish(&self, event: ClusterEvent) {
        self.history.lock().push(event.clone());
        // No subscribers is a normal startup race, not an error.
        let _ = self.tx.send(event);
    }

    pub fn history(&self) -> Vec<ClusterEvent> {
        self.history.lock().clone()
    }

    /// Posts a heartbeat on behalf of `node_id`, as a live node would do
    /// periodically (spec.md §6 "posts heartbeat data periodically").
    pub fn heartbeat(&self, node_id: NodeId) {
        self.publish(ClusterEvent::Heartbeat { node_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_published_events_in_order() {
        let metadata = FakeClusterMetadata::new();
        let mut rx = metadata.subscribe();

        let node = NodeId::from_random();
        metadata.publish(ClusterEvent::NodeAdded(node));
        metadata.publish(ClusterEvent::NodeRemoved(node));

        assert!(matches!(rx.recv().await.unwrap(), ClusterEvent::NodeAdded(n) if n == node));
        assert!(matches!(rx.recv().await.unwrap(), ClusterEvent::NodeRemoved(n) if n == node));
    }

    #[test]
    fn history_accumulates_without_a_subscriber() {
        let metadata = FakeClusterMetadata::new();
        let job = JobId::from_int(7);
        metadata.publish(ClusterEvent::JobAdded(job));
        metadata.publish(ClusterEvent::JobFinished(job));
        assert_eq!(metadata.history().len(), 2);
    }

    #[tokio::test]
    async fn late_subscriber_misses_history_but_sees_future_events() {
        let metadata = FakeClusterMetadata::new();
        metadata.publish(ClusterEvent::Heartbeat { node_id: NodeId::from_random() });

        let mut rx = metadata.subscribe();
        let node = NodeId::from_random();
        metadata.heartbeat(node);
        assert!(matches!(rx.recv().await.unwrap(), ClusterEvent::Heartbeat { node_id } if node_id == node));
    }
}
