//! End-to-end scenarios from spec.md §8 that span more than one
//! `ray-core-worker` instance or component, exercised here against the
//! fakes in this crate rather than real sockets or a real cluster.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ray_core_common::{
    ActorId, Address, JobId, NodeId, ObjectId, ObjectKind, RayCoreError, ResourceSet, TaskId, TaskIdOrigin,
    TransportClass,
};
use ray_core_worker::model::{BorrowerRefEntry, ReferenceTable, ReturnObject, TaskSpec};
use ray_core_worker::services::memory_store::MemoryStore;
use ray_core_worker::services::reference_counter::{RefRemovalPort, ReferenceCounter};
use ray_core_worker::services::task_manager::{TaskManager, DEFAULT_MAX_TASK_RETRIES};

fn addr(port: u16) -> Address {
    Address::new(NodeId::from_random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

fn fresh_task_id() -> TaskId {
    let job = JobId::from_int(1);
    let actor = ActorId::from_random(job);
    TaskId::for_origin(actor, TaskIdOrigin::Root)
}

fn fresh_object(task: TaskId, index: u32) -> ObjectId {
    ObjectId::new(task, ObjectKind::Put, TransportClass::Plasma, index)
}

struct NoopPort;
#[async_trait]
impl RefRemovalPort for NoopPort {
    async fn wait_for_ref_removed(&self, _address: Address, _id: ObjectId) -> Result<(), RayCoreError> {
        Ok(())
    }
}

/// Forwards every long-poll request to another `ReferenceCounter` directly,
/// standing in for the `WaitForRefRemoved` RPC (spec.md §6) between two
/// in-process fakes of separate worker processes.
struct Forwarding {
    target: Arc<ReferenceCounter>,
}

#[async_trait]
impl RefRemovalPort for Forwarding {
    async fn wait_for_ref_removed(&self, _address: Address, id: ObjectId) -> Result<(), RayCoreError> {
        self.target.handle_wait_for_ref_removed(id).await;
        Ok(())
    }
}

/// Scenario C — Borrower tree (spec.md §8): W1 executes T(o), wraps i in a
/// fresh o2, submits T2(o2) to W2 and returns to the owner without waiting.
/// W2 borrows i via o2 and finishes without waiting for any nested work of
/// its own. The owner only ever talks to W1; it learns of W2's borrow
/// transitively through W1's own merge of W2's reply. The owner's entry for
/// i must not drain until both W1 and W2 have dropped it.
#[tokio::test]
async fn scenario_c_borrower_tree() {
    let owner_addr = addr(0);
    let w1_addr = addr(1);
    let w2_addr = addr(2);

    let task = fresh_task_id();
    let i = fresh_object(task, 0);
    let o = fresh_object(task, 1);

    let w1_rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
    // W1 received o (and so, transitively, i) as a borrowed argument.
    w1_rc.add_borrowed_object(o, i, task, owner_addr);
    w1_rc.add_local_reference(i);
    // W1 wraps i into a fresh o2 and submits T2(o2) to W2.
    let o2 = fresh_object(task, 2);
    w1_rc.wrap_object_id(o2, &[i], None);
    w1_rc.add_submitted_task_references(&[o2]);

    // The owner, wired to long-poll W1 directly.
    let owner_rc = Arc::new(ReferenceCounter::new(Arc::new(Forwarding { target: w1_rc.clone() })));
    owner_rc.add_owned_object(i, task, owner_addr);
    owner_rc.add_owned_object(o, task, owner_addr);
    owner_rc.wrap_object_id(o, &[i], None);
    owner_rc.add_submitted_task_references(&[o]);

    // W1 returns to the owner without having waited for T2. It still holds
    // i locally (it hasn't dropped it, and the wrap into o2 added its own
    // grip); its harvested table for the argument o reflects exactly that —
    // W2 isn't in it, since the owner only ever learns of W2 through W1.
    let w1_harvested = w1_rc.pop_borrower_refs(o);
    let released = owner_rc.remove_submitted_task_references_and_watch(&[o], w1_addr, &w1_harvested);
    assert!(released.contains(&o));
    assert!(owner_rc.is_tracked(i));
    assert_eq!(owner_rc.known_holders(i), vec![w1_addr]);

    // W2 borrows i via o2, finishes without waiting on anything of its own,
    // and W1 merges W2's reply — W1 now also knows of W2 as a holder of i.
    let mut w2_table = ReferenceTable::default();
    w2_table.insert(BorrowerRefEntry {
        object_id: i,
        local_ref_count: 1,
        further_borrowers: vec![],
        is_owned_here: false,
    });
    w1_rc.remove_submitted_task_references_and_watch(&[o2], w2_addr, &w2_table);
    assert_eq!(w1_rc.known_holders(i), vec![w2_addr]);

    // The owner now long-polls W1 for release of i. W1 in turn must cascade
    // that long-poll down to W2 before it can honestly report drained.
    let handle = {
        let owner_rc = owner_rc.clone();
        tokio::spawn(async move {
            owner_rc.handle_wait_for_ref_removed(i).await;
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // The wrap-into-o2 grip on i already released when o2 drained above;
    // W1's own local reference is the last thing keeping i alive on its
    // side. W2 (via the noop port standing in for a real long-poll reply)
    // is presumed to have already dropped it.
    w1_rc.remove_local_reference(i);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    handle.await.unwrap();
    assert!(!owner_rc.is_tracked(i), "owner's entry for i must clear only after both W1 and W2 drop it");
}

/// Scenario G — Worker crash mid-lease (spec.md §8): a non-actor task is
/// dispatched and its leased worker crashes before replying. The task's
/// return ids must end up populated with `WorkerDied` sentinels, and a
/// waiter blocked on `Get` observes the failure instead of hanging forever.
#[tokio::test]
async fn scenario_g_worker_crash_mid_lease() {
    let self_addr = addr(0);
    let store = Arc::new(MemoryStore::new());
    let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
    let tm = TaskManager::new(self_addr, store.clone(), rc, false);

    let spec = TaskSpec {
        task_id: fresh_task_id(),
        job_id: JobId::from_int(1),
        sequence_number: 0,
        client_processed_up_to: 0,
        args: vec![],
        required_resources: ResourceSet::default(),
        language: "rust".to_string(),
        num_returns: 1,
    };
    let task_id = spec.task_id;
    tm.track(spec);

    let return_id = ObjectId::new(task_id, ObjectKind::TaskReturn, TransportClass::Direct, 0);
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.get(return_id, None).await })
    };
    tokio::task::yield_now().await;

    // The leased worker never replies — every retry also crashes mid-lease,
    // until retries are exhausted.
    for _ in 0..=DEFAULT_MAX_TASK_RETRIES {
        tm.handle_dispatch_failure(task_id);
    }

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, RayCoreError::ObjectUnreconstructable(ref msg) if msg.contains("WorkerDied")));
    assert!(!tm.is_pending(task_id));
}

/// A successful reply case alongside scenario G's failure case, checking
/// that a waiter blocked before dispatch sees the real value rather than a
/// crash sentinel when the worker does reply.
#[tokio::test]
async fn reply_before_failure_resolves_waiter_with_the_real_value() {
    let self_addr = addr(0);
    let store = Arc::new(MemoryStore::new());
    let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
    let tm = TaskManager::new(self_addr, store.clone(), rc, false);

    let spec = TaskSpec {
        task_id: fresh_task_id(),
        job_id: JobId::from_int(1),
        sequence_number: 0,
        client_processed_up_to: 0,
        args: vec![],
        required_resources: ResourceSet::default(),
        language: "rust".to_string(),
        num_returns: 1,
    };
    let task_id = spec.task_id;
    tm.track(spec);
    let return_id = ObjectId::new(task_id, ObjectKind::TaskReturn, TransportClass::Direct, 0);

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.get(return_id, None).await })
    };
    tokio::task::yield_now().await;

    tm.handle_reply(
        task_id,
        addr(1),
        ray_core_worker::services::task_manager::TaskReply {
            return_values: vec![ReturnObject {
                object_id: return_id,
                data: Bytes::from_static(b"done"),
                metadata: Bytes::new(),
                in_plasma: false,
            }],
            borrower_refs: ReferenceTable::default(),
            error: None,
        },
    );

    let obj = waiter.await.unwrap().unwrap();
    assert_eq!(obj.data.as_ref(), b"done");
}
