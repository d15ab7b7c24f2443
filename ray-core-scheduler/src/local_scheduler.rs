//! Node-local placement: matches lease requests to local resources and
//! warm workers, spills back when overloaded (spec.md §4.5
//! "LocalScheduler + WorkerPool"), grounded on
//! `examples/original_source/src/ray/raylet/node_manager.cc`'s
//! `HandleRequestWorkerLease` / `HandleReturnWorker`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use prometheus::IntGauge;
use ray_core_common::{ActorId, Address, JobId, ResourceId, ResourceSet, TaskId, TaskIdOrigin};
use tokio::sync::oneshot;

use crate::resource_ledger::NamedResourcePool;
use crate::worker_pool::WorkerPool;

/// What a lease request needs scheduled: the fields of `TaskSpec` the
/// scheduler cares about, independent of the wire encoding.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub actor_id: ActorId,
    pub language: String,
    pub required_resources: ResourceSet,
}

impl LeaseRequest {
    fn is_actor_creation(&self) -> bool {
        !self.actor_id.is_nil() && self.task_id == TaskId::for_origin(self.actor_id, TaskIdOrigin::ActorCreation)
    }

    fn is_actor_method(&self) -> bool {
        !self.actor_id.is_nil() && !self.is_actor_creation()
    }
}

/// Outcome of `HandleRequestWorkerLease` (spec.md §6).
#[derive(Debug)]
pub enum LeaseDecision {
    Granted {
        worker_id: u64,
        worker_addr: Address,
        resource_ids: Vec<ResourceId>,
    },
    RetryAt(Address),
    Error(String),
}

/// Consulted only when local resources can't satisfy a request, to decide
/// between spillback and queueing (spec.md §4.5 step 1). A concrete
/// implementation is backed by the cluster metadata service's resource
/// pub/sub (spec.md §6); out of scope here.
#[async_trait]
pub trait ClusterResourceView: Send + Sync {
    fn find_node_satisfying(&self, required: &ResourceSet) -> Option<Address>;
}

struct ActiveLease {
    held_resources: ResourceSet,
    blocked: bool,
    class_key: String,
    /// Named instances granted alongside `held_resources`, label-tagged so
    /// they can be released back to the right `NamedResourcePool` bucket.
    named_resource_ids: Vec<(String, ResourceId)>,
}

struct QueuedLease {
    request: LeaseRequest,
    reply: oneshot::Sender<LeaseDecision>,
}

#[derive(Default)]
struct ClassQueue {
    running_count: u64,
    queue: std::collections::VecDeque<QueuedLease>,
}

fn scheduling_class_key(language: &str, resources: &ResourceSet) -> String {
    format!("{language}:{resources:?}")
}

/// Per-node placement authority: resource bookkeeping, starvation-controlled
/// dispatch across scheduling classes, and the blocked/unblocked CPU-release
/// protocol (spec.md §4.5).
pub struct LocalScheduler {
    self_address: Address,
    resources: Mutex<ResourceSet>,
    named_resources: Mutex<NamedResourcePool>,
    worker_pool: Arc<WorkerPool>,
    cluster_view: Arc<dyn ClusterResourceView>,
    classes: Mutex<IndexMap<String, ClassQueue>>,
    leases: Mutex<HashMap<u64, ActiveLease>>,
    leases_outstanding_gauge: IntGauge,
}

impl LocalScheduler {
    pub fn new(
        self_address: Address,
        declared_resources: ResourceSet,
        worker_pool: Arc<WorkerPool>,
        cluster_view: Arc<dyn ClusterResourceView>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_address,
            resources: Mutex::new(declared_resources),
            named_resources: Mutex::new(NamedResourcePool::new()),
            worker_pool,
            cluster_view,
            classes: Mutex::new(IndexMap::new()),
            leases: Mutex::new(HashMap::new()),
            leases_outstanding_gauge: IntGauge::new(
                "ray_core_leases_outstanding",
                "Number of workers currently leased out by this node's scheduler",
            )
            .expect("static metric name/help are valid"),
        })
    }

    /// Attaches the leases-outstanding gauge to an externally owned
    /// registry. Exported for scraping, not rendered anywhere in-process.
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.leases_outstanding_gauge.clone()))
    }

    /// Declares `count` named instances of `label` (e.g. accelerators) as
    /// fractionally allocatable on top of the fungible count already carried
    /// in `declared_resources` (spec.md §4.5 "Named resource instances").
    pub fn declare_named_resource(&self, label: impl Into<String>, count: u32) {
        self.named_resources.lock().declare(label, count);
    }

    /// `HandleRequestWorkerLease(spec)` (spec.md §4.5, §6).
    ///
    /// Commits to reserve-then-spill (`SPEC_FULL.md` §14): a spillback
    /// check runs before any local resources are tentatively reserved, so a
    /// request never double-books itself across nodes.
    pub async fn handle_request_worker_lease(self: &Arc<Self>, request: LeaseRequest) -> LeaseDecision {
        let locally_satisfiable = self.resources.lock().covers(&request.required_resources);
        if !locally_satisfiable {
            if let Some(node) = self.cluster_view.find_node_satisfying(&request.required_resources) {
                if node != self.self_address {
                    return LeaseDecision::RetryAt(node);
                }
            }
        }

        let class_key = scheduling_class_key(&request.language, &request.required_resources);
        let (tx, rx) = oneshot::channel();
        {
            let mut classes = self.classes.lock();
            classes.entry(class_key).or_default().queue.push_back(QueuedLease { request, reply: tx });
        }
        self.dispatch();
        rx.await.unwrap_or_else(|_| LeaseDecision::Error("scheduler dropped lease request".to_string()))
    }

    /// `HandleReturnWorker(worker_id)` (spec.md §4.5, §6).
    pub fn handle_return_worker(self: &Arc<Self>, worker_id: u64, disconnect: bool, owner_died: bool) {
        let lease = self.leases.lock().remove(&worker_id);
        let Some(lease) = lease else {
            return;
        };
        self.leases_outstanding_gauge.set(self.leases.lock().len() as i64);
        if !lease.blocked {
            self.resources.lock().add(&lease.held_resources);
        }
        if !lease.named_resource_ids.is_empty() {
            let mut named = self.named_resources.lock();
            for (label, id) in &lease.named_resource_ids {
                named.release(label, std::slice::from_ref(id));
            }
        }
        self.decrement_running_count(&lease.class_key);

        if owner_died {
            // SPEC_FULL.md §14: kill immediately, discard any in-progress
            // result; `TaskManager` observes this as an ordinary WorkerDied
            // lease failure, not a special case.
            self.worker_pool.remove_worker(worker_id);
        } else if disconnect {
            self.worker_pool.remove_worker(worker_id);
        } else {
            self.worker_pool.return_worker_to_pool(worker_id);
        }
        self.dispatch();
    }

    /// A leased worker blocked on a remote `Get` releases its CPU share so
    /// other work can proceed (spec.md §4.5 "Blocked / unblocked").
    pub fn handle_worker_blocked(&self, worker_id: u64) {
        let cpu = {
            let mut leases = self.leases.lock();
            let Some(lease) = leases.get_mut(&worker_id) else {
                return;
            };
            if lease.blocked {
                return;
            }
            lease.blocked = true;
            ResourceSet::new().with("CPU", lease.held_resources.get("CPU"))
        };
        if !cpu.get("CPU").is_zero() {
            self.resources.lock().add(&cpu);
            self.dispatch();
        }
    }

    /// On unblock, CPU is reacquired if available; otherwise the worker
    /// proceeds oversubscribed until it's naturally returned (spec.md §4.5,
    /// confirmed verbatim by `node_manager.cc`, `SPEC_FULL.md` §13).
    pub fn handle_worker_unblocked(&self, worker_id: u64) {
        let cpu_needed = {
            let mut leases = self.leases.lock();
            let Some(lease) = leases.get_mut(&worker_id) else {
                return;
            };
            if !lease.blocked {
                return;
            }
            lease.blocked = false;
            ResourceSet::new().with("CPU", lease.held_resources.get("CPU"))
        };
        if cpu_needed.get("CPU").is_zero() {
            return;
        }
        let mut resources = self.resources.lock();
        if resources.covers(&cpu_needed) {
            resources.subtract(&cpu_needed);
        }
    }

    fn decrement_running_count(&self, class_key: &str) {
        if let Some(class) = self.classes.lock().get_mut(class_key) {
            class.running_count = class.running_count.saturating_sub(1);
        }
    }

    /// Starvation control (spec.md §4.5): classes with fewer currently
    /// running leases dispatch first; within a class, FIFO; stop once a
    /// class's head no longer fits available resources.
    fn dispatch(self: &Arc<Self>) {
        loop {
            let popped = {
                let mut resources = self.resources.lock();
                let mut classes = self.classes.lock();
                let mut keys: Vec<String> = classes.keys().cloned().collect();
                keys.sort_by_key(|k| classes.get(k).map(|c| c.running_count).unwrap_or(0));

                let mut popped = None;
                for key in keys {
                    let Some(class) = classes.get_mut(&key) else {
                        continue;
                    };
                    let Some(front) = class.queue.front() else {
                        continue;
                    };
                    if resources.covers(&front.request.required_resources) {
                        let lease = class.queue.pop_front().expect("front checked above");
                        resources.subtract(&lease.request.required_resources);
                        class.running_count += 1;
                        popped = Some((key, lease));
                        break;
                    }
                }
                popped
            };

            let Some((class_key, lease)) = popped else {
                break;
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.grant_reserved_lease(class_key, lease).await;
            });
        }
    }

    /// Acquires a worker for an already resource-reserved lease and replies
    /// to its waiting `RequestWorkerLease` call.
    async fn grant_reserved_lease(self: Arc<Self>, class_key: String, lease: QueuedLease) {
        let QueuedLease { request, reply } = lease;

        let worker = if request.is_actor_method() {
            self.worker_pool.pop_worker_for_actor(request.actor_id)
        } else {
            self.worker_pool.pop_worker_for_job(&request.language, request.job_id)
        };

        let worker = match worker {
            Some(w) => Some(w),
            None => {
                let affinity = request.is_actor_creation().then_some(request.actor_id);
                self.worker_pool
                    .start_and_await_registration(&request.language, request.job_id, affinity)
                    .await
            }
        };

        let Some(worker) = worker else {
            self.resources.lock().add(&request.required_resources);
            self.decrement_running_count(&class_key);
            let _ = reply.send(LeaseDecision::Error("worker process failed to start".to_string()));
            return;
        };

        // Any label the request asks for that's also declared in the named
        // pool gets real instance ids allocated alongside the fungible
        // reservation `dispatch()` already made; undeclared labels (the
        // common case) are untouched.
        let mut named_resource_ids: Vec<(String, ResourceId)> = Vec::new();
        {
            let mut named = self.named_resources.lock();
            for label in request.required_resources.labels() {
                let qty = request.required_resources.get(label);
                if qty.is_zero() {
                    continue;
                }
                if let Some(ids) = named.allocate(label, qty) {
                    named_resource_ids.extend(ids.into_iter().map(|id| (label.to_string(), id)));
                }
            }
        }

        {
            let mut leases = self.leases.lock();
            leases.insert(
                worker.worker_id,
                ActiveLease {
                    held_resources: request.required_resources,
                    blocked: false,
                    class_key,
                    named_resource_ids: named_resource_ids.clone(),
                },
            );
            self.leases_outstanding_gauge.set(leases.len() as i64);
        }

        let _ = reply.send(LeaseDecision::Granted {
            worker_id: worker.worker_id,
            worker_addr: worker.address,
            resource_ids: named_resource_ids.into_iter().map(|(_, id)| id).collect(),
        });
    }
}
