//! Demand-driven object materialization (spec.md §4.2 "Pull algorithm"),
//! grounded on `ObjectManager::Pull`/`TryPull` in
//! `examples/original_source/src/ray/object_manager/object_manager.cc`.
//!
//! A `Pull` subscribes to the object's location channel and, on each
//! notification, either restores from a spilled-storage URL or asks a
//! random known holder for the bytes, retrying against a different holder
//! every `pull_timeout` until the object arrives or the pull is canceled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use ray_core_common::{Address, NodeId, ObjectId, RayCoreError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// A location-channel notification: the current known holders of an object,
/// plus an optional spilled-storage URL.
#[derive(Clone, Debug, Default)]
pub struct LocationUpdate {
    pub node_ids: Vec<NodeId>,
    pub spilled_url: Option<String>,
}

/// Collaborator contract this module consumes — the cluster metadata
/// service's object-location pub/sub (spec.md §6) and the peer RPC's
/// `PullRequest` send path.
#[async_trait]
pub trait PullTransportPort: Send + Sync {
    /// Subscribes to location updates for `id`; updates are delivered via
    /// `on_update` until `unsubscribe` is called with the returned token.
    fn subscribe_object_locations(
        self: Arc<Self>,
        id: ObjectId,
        owner_addr: Address,
        on_update: Box<dyn Fn(LocationUpdate) + Send + Sync>,
    ) -> u64;

    fn unsubscribe_object_locations(&self, token: u64);

    async fn send_pull_request(&self, node: NodeId, id: ObjectId, requester: NodeId) -> Result<(), RayCoreError>;

    async fn restore_spilled_object(&self, id: ObjectId, url: String) -> Result<(), RayCoreError>;
}

struct PullState {
    locations: Vec<NodeId>,
    subscription_token: u64,
    retry_timer: Option<JoinHandle<()>>,
}

pub struct PullManager {
    self_node_id: NodeId,
    pull_timeout: Duration,
    transport: Arc<dyn PullTransportPort>,
    pulls: AsyncMutex<HashMap<ObjectId, PullState>>,
}

impl PullManager {
    pub fn new(self_node_id: NodeId, pull_timeout: Duration, transport: Arc<dyn PullTransportPort>) -> Arc<Self> {
        Arc::new(Self {
            self_node_id,
            pull_timeout,
            transport,
            pulls: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Begins pulling `id`, idempotently — a repeat call for an in-flight
    /// pull is a no-op (spec.md §4.2 `Pull`).
    pub async fn pull(self: &Arc<Self>, id: ObjectId, owner_addr: Address) {
        {
            let pulls = self.pulls.lock().await;
            if pulls.contains_key(&id) {
                return;
            }
        }

        let this = self.clone();
        let token = self.transport.clone().subscribe_object_locations(
            id,
            owner_addr,
            Box::new(move |update| {
                let this = this.clone();
                tokio::spawn(async move {
                    this.on_location_update(id, update).await;
                });
            }),
        );

        let mut pulls = self.pulls.lock().await;
        pulls.entry(id).or_insert(PullState {
            locations: Vec::new(),
            subscription_token: token,
            retry_timer: None,
        });
    }

    /// Stops pulling `id` — also called once the object arrives locally
    /// through any means (spec.md §4.2 `CancelPull`).
    pub async fn cancel_pull(&self, id: ObjectId) {
        let mut pulls = self.pulls.lock().await;
        if let Some(state) = pulls.remove(&id) {
            self.transport.unsubscribe_object_locations(state.subscription_token);
            if let Some(timer) = state.retry_timer {
                timer.abort();
            }
        }
    }

    async fn on_location_update(self: &Arc<Self>, id: ObjectId, update: LocationUpdate) {
        let exists = {
            let mut pulls = self.pulls.lock().await;
            let Some(state) = pulls.get_mut(&id) else {
                return;
            };
            state.locations = update.node_ids;
            true
        };
        if !exists {
            return;
        }

        if let Some(url) = update.spilled_url {
            let this = self.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if transport.restore_spilled_object(id, url).await.is_err() {
                    this.try_pull(id).await;
                }
            });
            return;
        }

        let is_empty = {
            let mut pulls = self.pulls.lock().await;
            let Some(state) = pulls.get_mut(&id) else {
                return;
            };
            if state.locations.is_empty() {
                if let Some(timer) = state.retry_timer.take() {
                    timer.abort();
                }
                true
            } else {
                false
            }
        };
        if is_empty {
            return;
        }

        self.try_pull(id).await;
    }

    /// Picks a random non-self holder and sends it a `PullRequest`, arming a
    /// retry timer that tries the next holder on expiry.
    fn try_pull(self: &Arc<Self>, id: ObjectId) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let node = {
                let mut pulls = self.pulls.lock().await;
                let Some(state) = pulls.get_mut(&id) else {
                    return;
                };
                if state.locations.is_empty() {
                    return;
                }
                let mut candidates: Vec<NodeId> =
                    state.locations.iter().copied().filter(|n| *n != self.self_node_id).collect();
                if candidates.is_empty() {
                    // Every known holder is us; nothing to do until a fresh
                    // notification arrives.
                    state.retry_timer = None;
                    return;
                }
                let idx = rand::rng().random_range(0..candidates.len());
                candidates.swap_remove(idx)
            };

            let transport = self.transport.clone();
            let self_node_id = self.self_node_id;
            let _ = transport.send_pull_request(node, id, self_node_id).await;

            let this = self.clone();
            let timeout = self.pull_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.try_pull(id).await;
            });

            let mut pulls = self.pulls.lock().await;
            if let Some(state) = pulls.get_mut(&id) {
                if let Some(old) = state.retry_timer.replace(timer) {
                    old.abort();
                }
            }
        })
    }

    pub async fn is_pulling(&self, id: ObjectId) -> bool {
        self.pulls.lock().await.contains_key(&id)
    }
}

/// Handles an incoming `PullRequest(id, requester)` RPC: per spec.md §4.2
/// step 4, a node holding `id` locally responds by pushing it to the
/// requester. The actual push dispatch is provided by the caller (the
/// `ray-core-worker` service wiring owns the `PushManager`).
pub async fn handle_pull_request(
    requester: NodeId,
    id: ObjectId,
    is_local: impl Fn(ObjectId) -> bool,
    push: impl Fn(ObjectId, NodeId),
) {
    if is_local(id) {
        push(id, requester);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use ray_core_common::{ActorId, JobId, ObjectKind, TaskIdOrigin, TransportClass};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn fresh_object(index: u32) -> ObjectId {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        ObjectId::new(task, ObjectKind::Put, TransportClass::Plasma, index)
    }

    fn fake_address() -> Address {
        Address::new(NodeId::from_random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9))
    }

    struct FakeTransport {
        pull_requests: SyncMutex<Vec<(NodeId, ObjectId)>>,
        next_token: AtomicU64,
        callback: SyncMutex<Option<Box<dyn Fn(LocationUpdate) + Send + Sync>>>,
    }

    #[async_trait]
    impl PullTransportPort for FakeTransport {
        fn subscribe_object_locations(
            self: Arc<Self>,
            _id: ObjectId,
            _owner_addr: Address,
            on_update: Box<dyn Fn(LocationUpdate) + Send + Sync>,
        ) -> u64 {
            *self.callback.lock() = Some(on_update);
            self.next_token.fetch_add(1, Ordering::SeqCst)
        }

        fn unsubscribe_object_locations(&self, _token: u64) {}

        async fn send_pull_request(&self, node: NodeId, id: ObjectId, _requester: NodeId) -> Result<(), RayCoreError> {
            self.pull_requests.lock().push((node, id));
            Ok(())
        }

        async fn restore_spilled_object(&self, _id: ObjectId, _url: String) -> Result<(), RayCoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pull_sends_request_to_a_non_self_holder() {
        let self_node = NodeId::from_random();
        let other_node = NodeId::from_random();
        let transport = Arc::new(FakeTransport {
            pull_requests: SyncMutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
            callback: SyncMutex::new(None),
        });
        let pm = PullManager::new(self_node, Duration::from_secs(30), transport.clone());

        let id = fresh_object(0);
        pm.pull(id, fake_address()).await;
        assert!(pm.is_pulling(id).await);

        let callback = transport.callback.lock().take().unwrap();
        callback(LocationUpdate {
            node_ids: vec![self_node, other_node],
            spilled_url: None,
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let requests = transport.pull_requests.lock().clone();
        assert_eq!(requests, vec![(other_node, id)]);
    }

    #[tokio::test]
    async fn pull_is_idempotent_while_in_flight() {
        let self_node = NodeId::from_random();
        let transport = Arc::new(FakeTransport {
            pull_requests: SyncMutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
            callback: SyncMutex::new(None),
        });
        let pm = PullManager::new(self_node, Duration::from_secs(30), transport);

        let id = fresh_object(0);
        pm.pull(id, fake_address()).await;
        pm.pull(id, fake_address()).await;
        assert!(pm.is_pulling(id).await);
    }

    #[tokio::test]
    async fn cancel_pull_removes_state() {
        let self_node = NodeId::from_random();
        let transport = Arc::new(FakeTransport {
            pull_requests: SyncMutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
            callback: SyncMutex::new(None),
        });
        let pm = PullManager::new(self_node, Duration::from_secs(30), transport);

        let id = fresh_object(0);
        pm.pull(id, fake_address()).await;
        pm.cancel_pull(id).await;
        assert!(!pm.is_pulling(id).await);
    }
}
