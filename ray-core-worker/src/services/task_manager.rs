//! Tracks pending submitted tasks through to completion or failure (spec.md
//! §4.6 "TaskManager"), the integration point between `TaskSubmitter`,
//! `MemoryStore` and `ReferenceCounter`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use ray_core_common::{
    Address, ErrorSentinel, Object, ObjectId, ObjectKind, RayCoreError, TaskId, TransportClass,
};

use crate::model::{ReturnObject, TaskSpec};
use crate::services::memory_store::MemoryStore;
use crate::services::reference_counter::ReferenceCounter;

/// A `PushTask` reply, or the dispatch-failure/worker-crash equivalent
/// (spec.md §6 `PushTask(spec) → {return_values[], borrower_refs}`).
pub struct TaskReply {
    pub return_values: Vec<ReturnObject>,
    pub borrower_refs: crate::model::ReferenceTable,
    pub error: Option<RayCoreError>,
}

/// How many times a task is retried before its failure is made permanent.
/// Spec.md §4.6 names the mechanism (`retries_left`) without mandating a
/// default; this mirrors Ray's own `DEFAULT_MAX_TASK_RETRIES` of 3.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;

struct PendingTask {
    spec: TaskSpec,
    retries_left: u32,
    executions: u32,
}

/// Installed by `TaskSubmitter` so `TaskManager` can re-enqueue a failed
/// task without needing to depend on the submitter directly (spec.md §9
/// "no true cycles — only callback registration").
pub trait RetrySubmit: Send + Sync {
    fn retry(&self, spec: TaskSpec);
}

pub struct TaskManager {
    self_address: Address,
    memory_store: Arc<MemoryStore>,
    reference_counter: Arc<ReferenceCounter>,
    pending: Mutex<HashMap<TaskId, PendingTask>>,
    lineage_pinning_enabled: bool,
    retry: Mutex<Option<Arc<dyn RetrySubmit>>>,
}

impl TaskManager {
    pub fn new(
        self_address: Address,
        memory_store: Arc<MemoryStore>,
        reference_counter: Arc<ReferenceCounter>,
        lineage_pinning_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_address,
            memory_store,
            reference_counter,
            pending: Mutex::new(HashMap::new()),
            lineage_pinning_enabled,
            retry: Mutex::new(None),
        })
    }

    pub fn set_retry_callback(&self, cb: Arc<dyn RetrySubmit>) {
        *self.retry.lock() = Some(cb);
    }

    /// Registers a resolved task as submitted: declares ownership of its
    /// (not-yet-populated) return ids and bumps submitted-task refs on its
    /// by-reference args (spec.md §4.1 step 1).
    pub fn track(&self, spec: TaskSpec) {
        for i in 0..spec.num_returns {
            let id = ObjectId::new(spec.task_id, ObjectKind::TaskReturn, TransportClass::Direct, i);
            self.reference_counter.add_owned_object(id, spec.task_id, self.self_address);
        }
        self.reference_counter.add_submitted_task_references(&spec.referenced_arg_ids());

        self.pending.lock().insert(
            spec.task_id,
            PendingTask {
                spec,
                retries_left: DEFAULT_MAX_TASK_RETRIES,
                executions: 0,
            },
        );
    }

    fn return_id(task_id: TaskId, index: u32) -> ObjectId {
        ObjectId::new(task_id, ObjectKind::TaskReturn, TransportClass::Direct, index)
    }

    /// Handles a `PushTask` reply arriving from `worker_addr` (spec.md §4.6).
    pub fn handle_reply(self: &Arc<Self>, task_id: TaskId, worker_addr: Address, reply: TaskReply) {
        if let Some(err) = reply.error {
            self.handle_failure(task_id, err);
            return;
        }

        let spec = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&task_id) else {
                return;
            };
            entry.executions += 1;
            entry.spec.clone()
        };

        for ret in &reply.return_values {
            if !ret.in_plasma {
                self.memory_store.put(
                    ret.object_id,
                    Object {
                        data: ret.data.clone(),
                        metadata: ret.metadata.clone(),
                    },
                );
            }
        }

        let arg_ids = spec.referenced_arg_ids();
        self.reference_counter
            .remove_submitted_task_references_and_watch(&arg_ids, worker_addr, &reply.borrower_refs);

        self.evict_if_possible(task_id);
    }

    /// A task never reached a worker, or the worker crashed mid-lease
    /// (spec.md §4.3 step 5, Scenario G).
    pub fn handle_dispatch_failure(self: &Arc<Self>, task_id: TaskId) {
        self.handle_failure(task_id, RayCoreError::WorkerDied("worker died or was never reached".to_string()));
    }

    fn handle_failure(self: &Arc<Self>, task_id: TaskId, error: RayCoreError) {
        let retry_spec = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&task_id) else {
                return;
            };
            if entry.retries_left > 0 {
                entry.retries_left -= 1;
                Some(entry.spec.clone())
            } else {
                None
            }
        };

        if let Some(spec) = retry_spec {
            if let Some(cb) = self.retry.lock().as_ref() {
                cb.retry(spec);
                return;
            }
        }

        let spec = {
            let mut pending = self.pending.lock();
            pending.remove(&task_id)
        };
        let Some(entry) = spec else {
            return;
        };

        let sentinel = ErrorSentinel {
            kind: error_kind_name(&error).to_string(),
            message: error.to_string(),
        };
        for i in 0..entry.spec.num_returns {
            let id = Self::return_id(task_id, i);
            self.memory_store.put_error(id, sentinel.clone());
            self.reference_counter.remove_local_reference(id);
        }

        // No borrower ever replied (the task never executed, or its worker
        // died before doing so): release the submitted-task refs against an
        // empty harvested table, which adds no new known holders.
        let arg_ids = entry.spec.referenced_arg_ids();
        if !arg_ids.is_empty() {
            self.reference_counter.remove_submitted_task_references_and_watch(
                &arg_ids,
                self.self_address,
                &crate::model::ReferenceTable::default(),
            );
        }
    }

    /// Removes the task entry unless lineage pinning is enabled and at
    /// least one return id is still referenced (spec.md §4.6, §3 "Lineage
    /// entry").
    fn evict_if_possible(&self, task_id: TaskId) {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get(&task_id) else {
            return;
        };
        if self.lineage_pinning_enabled {
            let still_referenced = (0..entry.spec.num_returns)
                .any(|i| self.reference_counter.is_tracked(Self::return_id(task_id, i)));
            if still_referenced {
                return;
            }
        }
        pending.remove(&task_id);
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.pending.lock().contains_key(&task_id)
    }
}

fn error_kind_name(error: &RayCoreError) -> &'static str {
    match error {
        RayCoreError::ObjectUnreconstructable(_) => "ObjectUnreconstructable",
        RayCoreError::WorkerDied(_) => "WorkerDied",
        RayCoreError::ActorDied(_) => "ActorDied",
        RayCoreError::TaskCancelled(_) => "TaskCancelled",
        RayCoreError::OwnerDied(_) => "OwnerDied",
        RayCoreError::Transient(_) => "Transient",
        RayCoreError::Rpc(_) => "Rpc",
        RayCoreError::Io(_) => "Io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ray_core_common::{ActorId, JobId, NodeId, ResourceSet, TaskIdOrigin};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(port: u16) -> Address {
        Address::new(NodeId::from_random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn fresh_spec(num_returns: u32) -> TaskSpec {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task_id = TaskId::for_origin(actor, TaskIdOrigin::Root);
        TaskSpec {
            task_id,
            job_id: job,
            sequence_number: 0,
            client_processed_up_to: 0,
            args: vec![],
            required_resources: ResourceSet::default(),
            language: "rust".to_string(),
            num_returns,
        }
    }

    struct NoopPort;
    #[async_trait::async_trait]
    impl crate::services::reference_counter::RefRemovalPort for NoopPort {
        async fn wait_for_ref_removed(&self, _address: Address, _id: ObjectId) -> Result<(), RayCoreError> {
            Ok(())
        }
    }

    #[test]
    fn successful_reply_stores_returns_and_evicts_task() {
        let self_addr = addr(0);
        let store = Arc::new(MemoryStore::new());
        let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
        let tm = TaskManager::new(self_addr, store.clone(), rc, false);

        let spec = fresh_spec(1);
        let task_id = spec.task_id;
        tm.track(spec);
        assert!(tm.is_pending(task_id));

        let return_id = TaskManager::return_id(task_id, 0);
        let reply = TaskReply {
            return_values: vec![ReturnObject {
                object_id: return_id,
                data: Bytes::from_static(b"ok"),
                metadata: Bytes::new(),
                in_plasma: false,
            }],
            borrower_refs: crate::model::ReferenceTable::default(),
            error: None,
        };
        tm.handle_reply(task_id, addr(1), reply);

        assert!(!tm.is_pending(task_id));
        assert!(store.contains(return_id));
    }

    #[test]
    fn failure_with_retries_left_calls_retry_callback() {
        let self_addr = addr(0);
        let store = Arc::new(MemoryStore::new());
        let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
        let tm = TaskManager::new(self_addr, store, rc, false);

        struct Recorder(Arc<AtomicUsize>);
        impl RetrySubmit for Recorder {
            fn retry(&self, _spec: TaskSpec) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        tm.set_retry_callback(Arc::new(Recorder(calls.clone())));

        let spec = fresh_spec(1);
        let task_id = spec.task_id;
        tm.track(spec);
        tm.handle_dispatch_failure(task_id);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tm.is_pending(task_id));
    }

    #[test]
    fn failure_with_no_retries_left_stores_sentinels() {
        let self_addr = addr(0);
        let store = Arc::new(MemoryStore::new());
        let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
        let tm = TaskManager::new(self_addr, store.clone(), rc, false);

        let spec = fresh_spec(1);
        let task_id = spec.task_id;
        tm.track(spec);

        for _ in 0..=DEFAULT_MAX_TASK_RETRIES {
            tm.handle_dispatch_failure(task_id);
        }

        let return_id = TaskManager::return_id(task_id, 0);
        assert!(!tm.is_pending(task_id));
        let err = futures::executor::block_on(store.get(return_id, None)).unwrap_err();
        assert!(matches!(err, RayCoreError::ObjectUnreconstructable(_)));
    }
}
