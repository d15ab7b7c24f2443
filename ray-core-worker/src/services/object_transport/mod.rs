//! The object transport layer (spec.md §4.2): demand pulls, rate-limited
//! pushes, and a `Wait` that resolves once enough of a requested id set is
//! available.

pub mod pull;
pub mod push_manager;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ray_core_common::{Address, NodeId, ObjectId};
use tokio::sync::Notify;

pub use pull::{LocationUpdate, PullManager, PullTransportPort};
pub use push_manager::{PushManager, SendChunkFn};

/// Whether an id is currently materialized in this process (either the
/// `MemoryStore` or the local plasma-style object store).
pub trait LocalObjectPresence: Send + Sync {
    fn is_local(&self, id: ObjectId) -> bool;
}

pub struct ObjectTransport {
    pub pull: Arc<PullManager>,
    pub push: Arc<PushManager>,
    presence: Arc<dyn LocalObjectPresence>,
    location_port: Arc<dyn PullTransportPort>,
}

impl ObjectTransport {
    pub fn new(
        self_node_id: NodeId,
        pull_timeout: Duration,
        repeated_push_delay: Duration,
        max_chunks_in_flight: i64,
        presence: Arc<dyn LocalObjectPresence>,
        location_port: Arc<dyn PullTransportPort>,
    ) -> Self {
        Self {
            pull: PullManager::new(self_node_id, pull_timeout, location_port.clone()),
            push: Arc::new(PushManager::new(max_chunks_in_flight, repeated_push_delay)),
            presence,
            location_port,
        }
    }

    /// Resolves once at least `k` of `ids` are available (locally, or —
    /// unless `local_only` — known to exist at some node), preserving input
    /// order in the returned `found` list (spec.md §4.2 `Wait`).
    pub async fn wait(
        &self,
        ids: &[ObjectId],
        k: usize,
        deadline: Option<Duration>,
        local_only: bool,
        owner_of: impl Fn(ObjectId) -> Address,
    ) -> (Vec<ObjectId>, Vec<ObjectId>) {
        let mut found: Vec<ObjectId> = Vec::new();
        let mut pending: Vec<ObjectId> = Vec::new();
        for &id in ids {
            if self.presence.is_local(id) {
                found.push(id);
            } else {
                pending.push(id);
            }
        }
        if found.len() >= k || pending.is_empty() {
            return Self::split(ids, &found, k);
        }

        let notify = Arc::new(Notify::new());
        let newly_found: Arc<parking_lot::Mutex<HashSet<ObjectId>>> = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let mut tokens = Vec::new();

        for &id in &pending {
            if !local_only {
                self.pull.pull(id, owner_of(id)).await;
            }
            let presence = self.presence.clone();
            let newly_found = newly_found.clone();
            let notify = notify.clone();
            let token = self.location_port.clone().subscribe_object_locations(
                id,
                owner_of(id),
                Box::new(move |_update| {
                    if presence.is_local(id) {
                        newly_found.lock().insert(id);
                        notify.notify_waiters();
                    }
                }),
            );
            tokens.push((id, token));
        }

        let wait_body = async {
            loop {
                {
                    let nf = newly_found.lock();
                    let total_found = found.len() + nf.len();
                    if total_found >= k {
                        break;
                    }
                }
                notify.notified().await;
            }
        };

        match deadline {
            Some(d) => {
                let _ = tokio::time::timeout(d, wait_body).await;
            }
            None => wait_body.await,
        }

        for (id, token) in tokens {
            self.location_port.unsubscribe_object_locations(token);
            let _ = id;
        }

        let extra = newly_found.lock();
        for &id in &pending {
            if extra.contains(&id) {
                found.push(id);
            }
        }

        Self::split(ids, &found, k)
    }

    fn split(ids: &[ObjectId], found: &[ObjectId], _k: usize) -> (Vec<ObjectId>, Vec<ObjectId>) {
        let found_set: HashSet<ObjectId> = found.iter().copied().collect();
        let found_ordered: Vec<ObjectId> = ids.iter().copied().filter(|id| found_set.contains(id)).collect();
        let remaining: Vec<ObjectId> = ids.iter().copied().filter(|id| !found_set.contains(id)).collect();
        (found_ordered, remaining)
    }
}
