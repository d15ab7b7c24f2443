//! Distributed reference counting over `ObjectId`s (spec.md §4.1).
//!
//! No global view exists; an owner learns that nobody in the cluster still
//! references an object by piggybacking on task submission/completion and,
//! for a held-open tail, by a cascading `WaitForRefRemoved` long-poll chain:
//! each borrower only replies to whoever is waiting on *it* once its own
//! local references AND its own further borrowers have drained. That
//! recursive condition is what lets an owner's knowledge of a single direct
//! borrower (say W1) correctly wait out a sub-borrower (W2) it never talks
//! to directly — see scenario C in spec.md §8 and the design note in
//! `DESIGN.md`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexSet;
use parking_lot::Mutex;
use prometheus::IntGauge;
use tokio::sync::Notify;

use ray_core_common::{Address, ObjectId, RayCoreError, TaskId};

use crate::model::{BorrowerRefEntry, ReferenceTable};

/// Port used to ask a remote process to tell us when it has released an id
/// (spec.md §6 `WaitForRefRemoved`). Implemented over `ray-core-rpc` in
/// production, faked in tests.
#[async_trait]
pub trait RefRemovalPort: Send + Sync {
    async fn wait_for_ref_removed(&self, address: Address, id: ObjectId) -> Result<(), RayCoreError>;
}

#[derive(Clone, Debug)]
pub struct OwnerInfo {
    pub task_id: TaskId,
    pub address: Address,
}

struct RefEntry {
    local_ref_count: u64,
    submitted_task_ref_count: u64,
    owner: Option<OwnerInfo>,
    /// Inner ids kept alive by this (owned, wrapping) id — spec.md §3
    /// "dependencies".
    dependencies: Vec<ObjectId>,
    /// Addresses known to hold/borrow this id, whether we are its owner or
    /// ourselves only a borrower relaying the information upward.
    known_holders: IndexSet<Address>,
    /// The argument id this entry arrived nested inside, if any — used by
    /// `pop_borrower_refs` to find the subtree rooted at an argument.
    introduced_via: Option<ObjectId>,
    on_delete_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    /// Fired (and cleared) whenever this entry's total count transitions to
    /// zero with no outstanding known holders.
    drain_notify: Arc<Notify>,
}

impl RefEntry {
    fn new() -> Self {
        Self {
            local_ref_count: 0,
            submitted_task_ref_count: 0,
            owner: None,
            dependencies: Vec::new(),
            known_holders: IndexSet::new(),
            introduced_via: None,
            on_delete_callbacks: Vec::new(),
            drain_notify: Arc::new(Notify::new()),
        }
    }

    fn total(&self) -> u64 {
        self.local_ref_count + self.submitted_task_ref_count + self.known_holders.len() as u64
    }

    fn is_drained(&self) -> bool {
        self.total() == 0
    }
}

pub struct ReferenceCounter {
    entries: Mutex<HashMap<ObjectId, RefEntry>>,
    long_poll: Arc<dyn RefRemovalPort>,
    release_lineage_callback: Mutex<Option<Box<dyn Fn(ObjectId) + Send + Sync>>>,
    table_size_gauge: IntGauge,
}

impl ReferenceCounter {
    pub fn new(long_poll: Arc<dyn RefRemovalPort>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            long_poll,
            release_lineage_callback: Mutex::new(None),
            table_size_gauge: IntGauge::new(
                "ray_core_refcount_table_size",
                "Number of object ids currently tracked by this process's reference table",
            )
            .expect("static metric name/help are valid"),
        }
    }

    /// Attaches the reference table's size gauge to an externally owned
    /// registry. Exported for scraping, not rendered anywhere in-process.
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.table_size_gauge.clone()))
    }

    fn sync_table_size_gauge(&self) {
        self.table_size_gauge.set(self.entries.lock().len() as i64);
    }

    /// Installed by `TaskManager` to be notified when an id's lineage may be
    /// evicted (spec.md §4.1 `SetReleaseLineageCallback`).
    pub fn set_release_lineage_callback(&self, cb: impl Fn(ObjectId) + Send + Sync + 'static) {
        *self.release_lineage_callback.lock() = Some(Box::new(cb));
    }

    pub fn add_local_reference(&self, id: ObjectId) {
        let mut entries = self.entries.lock();
        entries.entry(id).or_insert_with(RefEntry::new).local_ref_count += 1;
        drop(entries);
        self.sync_table_size_gauge();
    }

    /// Decrements the in-process count. On decrement-to-zero (with no
    /// outstanding known holders), returns the transitively released
    /// dependency ids (spec.md §4.1 `RemoveLocalReference`).
    pub fn remove_local_reference(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut released = Vec::new();
        self.remove_local_reference_inner(id, &mut released);
        self.sync_table_size_gauge();
        released
    }

    fn remove_local_reference_inner(&self, id: ObjectId, released: &mut Vec<ObjectId>) {
        let (drained, dependencies) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if entry.local_ref_count == 0 {
                return;
            }
            entry.local_ref_count -= 1;
            let drained = entry.is_drained();
            let deps = if drained { std::mem::take(&mut entry.dependencies) } else { Vec::new() };
            (drained, deps)
        };

        if drained {
            self.finalize_drain(id);
            released.push(id);
            for dep in dependencies {
                self.remove_local_reference_inner(dep, released);
            }
        }
    }

    /// Declares that this process is the owner of `id`. Idempotent.
    pub fn add_owned_object(&self, id: ObjectId, task_id: TaskId, owner_addr: Address) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(id).or_insert_with(RefEntry::new);
        if entry.owner.is_none() {
            entry.owner = Some(OwnerInfo { task_id, address: owner_addr });
        }
        drop(entries);
        self.sync_table_size_gauge();
    }

    /// Records that we received `inner_id` because we were given `outer_id`,
    /// whose owner is elsewhere (spec.md §4.1 `AddBorrowedObject`).
    pub fn add_borrowed_object(
        &self,
        outer_id: ObjectId,
        inner_id: ObjectId,
        owner_task_id: TaskId,
        owner_addr: Address,
    ) {
        let mut entries = self.entries.lock();
        let root = Self::root_argument(&entries, outer_id);
        let entry = entries.entry(inner_id).or_insert_with(RefEntry::new);
        entry.owner = entry.owner.take().or(Some(OwnerInfo {
            task_id: owner_task_id,
            address: owner_addr,
        }));
        entry.introduced_via = entry.introduced_via.or(root);
        drop(entries);
        self.sync_table_size_gauge();
    }

    fn root_argument(entries: &HashMap<ObjectId, RefEntry>, mut id: ObjectId) -> Option<ObjectId> {
        let mut seen_root = id;
        while let Some(entry) = entries.get(&id) {
            match entry.introduced_via {
                Some(next) if next != id => {
                    id = next;
                    seen_root = id;
                }
                _ => break,
            }
        }
        Some(seen_root)
    }

    /// Declares that `outer_id`'s value contains `inner_ids`; while
    /// `outer_id` is in scope, the inner ids must remain in scope (spec.md
    /// §4.1 `WrapObjectId`). `stored_in_owner` is the address `outer_id` was
    /// placed at, if different from us — a borrow relation is recorded for
    /// the inner ids against that address.
    pub fn wrap_object_id(
        &self,
        outer_id: ObjectId,
        inner_ids: &[ObjectId],
        stored_in_owner: Option<Address>,
    ) {
        let mut entries = self.entries.lock();
        for &inner in inner_ids {
            entries.entry(inner).or_insert_with(RefEntry::new).local_ref_count += 1;
            if let Some(addr) = stored_in_owner {
                entries
                    .entry(inner)
                    .or_insert_with(RefEntry::new)
                    .known_holders
                    .insert(addr);
            }
        }
        entries
            .entry(outer_id)
            .or_insert_with(RefEntry::new)
            .dependencies
            .extend_from_slice(inner_ids);
        drop(entries);
        self.sync_table_size_gauge();
    }

    pub fn add_submitted_task_references(&self, ids: &[ObjectId]) {
        let mut entries = self.entries.lock();
        for &id in ids {
            entries.entry(id).or_insert_with(RefEntry::new).submitted_task_ref_count += 1;
        }
        drop(entries);
        self.sync_table_size_gauge();
    }

    /// Drops the submitted-task reference for each id and merges the
    /// borrower's harvested reference table (spec.md §4.1 step 4, "Merge").
    /// Returns the subset of `ids` that reached zero total count as an
    /// immediate (synchronous) result of this call.
    pub fn remove_submitted_task_references(
        &self,
        ids: &[ObjectId],
        borrower_addr: Address,
        borrower_refs: &ReferenceTable,
    ) -> Vec<ObjectId> {
        let mut released = Vec::new();
        let mut newly_added_holders: Vec<(ObjectId, Vec<Address>)> = Vec::new();

        {
            let mut entries = self.entries.lock();
            for &id in ids {
                if let Some(entry) = entries.get_mut(&id) {
                    if entry.submitted_task_ref_count > 0 {
                        entry.submitted_task_ref_count -= 1;
                    }
                }
            }

            // The harvested table is authoritative for what the borrower
            // (and its own transitive callees) still hold: an id absent from
            // it means the borrower already dropped it before replying.
            for (obj_id, rt_entry) in &borrower_refs.entries {
                let entry = entries.entry(*obj_id).or_insert_with(RefEntry::new);
                let mut added = Vec::new();
                // The sender itself (borrower_addr) still holds this id
                // locally, and/or knows of further borrowers beneath it —
                // both become known holders from our point of view.
                if rt_entry.local_ref_count > 0 && entry.known_holders.insert(borrower_addr) {
                    added.push(borrower_addr);
                }
                for &addr in &rt_entry.further_borrowers {
                    if entry.known_holders.insert(addr) {
                        added.push(addr);
                    }
                }
                if !added.is_empty() {
                    newly_added_holders.push((*obj_id, added));
                }
            }

            for &id in ids {
                if let Some(entry) = entries.get(&id) {
                    if entry.is_drained() {
                        released.push(id);
                    }
                }
            }
        }

        let _ = newly_added_holders;

        // Capture each released id's dependencies before finalize_drain
        // removes its entry: wrap_object_id bumped their local_ref_count to
        // keep them alive while this (now-drained) id was in scope, so that
        // grip must be released in turn — same cascade remove_local_reference
        // performs, reused here via remove_local_reference_inner.
        let dependents: Vec<(ObjectId, Vec<ObjectId>)> = {
            let entries = self.entries.lock();
            released
                .iter()
                .map(|&id| (id, entries.get(&id).map(|e| e.dependencies.clone()).unwrap_or_default()))
                .collect()
        };

        for &id in &released {
            self.finalize_drain(id);
        }

        for (_, deps) in dependents {
            for dep in deps {
                self.remove_local_reference_inner(dep, &mut released);
            }
        }

        self.sync_table_size_gauge();
        released
    }

    fn finalize_drain(&self, id: ObjectId) {
        let callbacks = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(&id) {
                if !entry.is_drained() {
                    return;
                }
            } else {
                return;
            }
            let entry = entries.remove(&id).unwrap();
            entry.drain_notify.notify_waiters();
            entry.on_delete_callbacks
        };
        for cb in callbacks {
            cb();
        }
        if let Some(cb) = self.release_lineage_callback.lock().as_ref() {
            cb(id);
        }
    }

    /// Registers a callback fired exactly once when `id`'s total count
    /// reaches zero (spec.md §3 "on_delete_callbacks").
    pub fn on_delete(&self, id: ObjectId, cb: impl FnOnce() + Send + 'static) {
        let mut entries = self.entries.lock();
        entries.entry(id).or_insert_with(RefEntry::new).on_delete_callbacks.push(Box::new(cb));
        drop(entries);
        self.sync_table_size_gauge();
    }

    /// Returns the subtree of the local table rooted at `arg_id`: `arg_id`
    /// itself plus every id introduced (directly or transitively) because
    /// of it (spec.md §4.1 `PopBorrowerRefs`).
    pub fn pop_borrower_refs(&self, arg_id: ObjectId) -> ReferenceTable {
        let entries = self.entries.lock();
        let mut table = ReferenceTable::default();
        for (&id, entry) in entries.iter() {
            let root = if id == arg_id {
                Some(arg_id)
            } else {
                Self::root_argument(&entries, id)
            };
            if root == Some(arg_id) {
                table.insert(BorrowerRefEntry {
                    object_id: id,
                    local_ref_count: entry.local_ref_count,
                    further_borrowers: entry.known_holders.iter().copied().collect(),
                    is_owned_here: entry.owner.is_some(),
                });
            }
        }
        table
    }

    pub fn local_ref_count(&self, id: ObjectId) -> u64 {
        self.entries.lock().get(&id).map(|e| e.local_ref_count).unwrap_or(0)
    }

    pub fn known_holders(&self, id: ObjectId) -> Vec<Address> {
        self.entries
            .lock()
            .get(&id)
            .map(|e| e.known_holders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, id: ObjectId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Owner-to-borrower long-poll handler (spec.md §4.1
    /// `HandleWaitForRefRemoved`): resolves once `id` is no longer held
    /// locally and all of its known holders have themselves drained.
    pub async fn handle_wait_for_ref_removed(self: &Arc<Self>, id: ObjectId) {
        loop {
            let (drained, notify, holders) = {
                let entries = self.entries.lock();
                match entries.get(&id) {
                    None => (true, None, Vec::new()),
                    Some(entry) => (
                        entry.is_drained(),
                        Some(entry.drain_notify.clone()),
                        entry.known_holders.iter().copied().collect::<Vec<_>>(),
                    ),
                }
            };
            if drained {
                return;
            }
            // Built before draining known holders below: `Notify` guarantees
            // delivery to a future created before `notify_waiters` fires
            // even if it hasn't been polled yet, so a holder drain that
            // synchronously finishes this entry off can't race us into a
            // lost wakeup the way awaiting a *freshly* fetched notify after
            // the fact would.
            let Some(notify) = notify else {
                return;
            };
            let notified = notify.notified();

            for holder in holders {
                self.clone().drain_holder(id, holder).await;
            }

            notified.await;
        }
    }

    async fn drain_holder(self: Arc<Self>, id: ObjectId, holder: Address) {
        if self.long_poll.wait_for_ref_removed(holder, id).await.is_ok() {
            let drained = {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(&id) {
                    entry.known_holders.swap_remove(&holder);
                    entry.is_drained()
                } else {
                    false
                }
            };
            if drained {
                self.finalize_drain(id);
            }
        }
    }

    /// Public entry point for merging a reply's borrower table that also
    /// kicks off the cascading drain watchers — use this instead of the raw
    /// `remove_submitted_task_references` when the caller holds the counter
    /// behind an `Arc` and wants the background drains to actually run.
    pub fn remove_submitted_task_references_and_watch(
        self: &Arc<Self>,
        ids: &[ObjectId],
        borrower_addr: Address,
        borrower_refs: &ReferenceTable,
    ) -> Vec<ObjectId> {
        let before: HashMap<ObjectId, IndexSet<Address>> = {
            let entries = self.entries.lock();
            ids.iter()
                .chain(borrower_refs.entries.keys())
                .filter_map(|id| entries.get(id).map(|e| (*id, e.known_holders.clone())))
                .collect()
        };

        let released = self.remove_submitted_task_references(ids, borrower_addr, borrower_refs);

        let entries = self.entries.lock();
        let mut to_watch = Vec::new();
        for (&id, before_holders) in &before {
            if let Some(entry) = entries.get(&id) {
                for &holder in entry.known_holders.iter() {
                    if !before_holders.contains(&holder) {
                        to_watch.push((id, holder));
                    }
                }
            }
        }
        drop(entries);

        for (id, holder) in to_watch {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain_holder(id, holder).await;
            });
        }

        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_core_common::{JobId, NodeId, ObjectKind, TaskIdOrigin, TransportClass};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(port: u16) -> Address {
        Address::new(
            NodeId::from_random(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        )
    }

    fn fresh_task_id() -> TaskId {
        let job = JobId::from_int(1);
        let actor = ray_core_common::ActorId::from_random(job);
        TaskId::for_origin(actor, TaskIdOrigin::Root)
    }

    fn fresh_object(task: TaskId, index: u32) -> ObjectId {
        ObjectId::new(task, ObjectKind::TaskReturn, TransportClass::Plasma, index)
    }

    struct NoopPort;
    #[async_trait]
    impl RefRemovalPort for NoopPort {
        async fn wait_for_ref_removed(&self, _address: Address, _id: ObjectId) -> Result<(), RayCoreError> {
            Ok(())
        }
    }

    #[test]
    fn add_remove_local_reference_basic() {
        let rc = ReferenceCounter::new(Arc::new(NoopPort));
        let task = fresh_task_id();
        let obj = fresh_object(task, 0);

        rc.add_local_reference(obj);
        rc.add_local_reference(obj);
        assert_eq!(rc.local_ref_count(obj), 2);

        let released = rc.remove_local_reference(obj);
        assert!(released.is_empty());
        assert_eq!(rc.local_ref_count(obj), 1);

        let released = rc.remove_local_reference(obj);
        assert_eq!(released, vec![obj]);
        assert!(!rc.is_tracked(obj));
    }

    #[test]
    fn on_delete_callback_fires_exactly_once() {
        let rc = ReferenceCounter::new(Arc::new(NoopPort));
        let task = fresh_task_id();
        let obj = fresh_object(task, 0);
        let count = Arc::new(AtomicUsize::new(0));

        rc.add_local_reference(obj);
        let c = count.clone();
        rc.on_delete(obj, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        rc.remove_local_reference(obj);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrap_object_id_keeps_inner_alive_while_outer_in_scope() {
        let rc = ReferenceCounter::new(Arc::new(NoopPort));
        let task = fresh_task_id();
        let inner = fresh_object(task, 0);
        let outer = fresh_object(task, 1);

        rc.add_local_reference(outer);
        rc.wrap_object_id(outer, &[inner], None);
        assert_eq!(rc.local_ref_count(inner), 1);

        // Outer leaving scope releases the dependency contribution too.
        let released = rc.remove_local_reference(outer);
        assert!(released.contains(&outer));
        assert!(released.contains(&inner));
    }

    #[test]
    fn no_spurious_gc_through_wrap_chain() {
        // Property #2: a chain x -> wrap -> y -> wrap -> z stays alive as
        // long as x is referenced.
        let rc = ReferenceCounter::new(Arc::new(NoopPort));
        let task = fresh_task_id();
        let x = fresh_object(task, 0);
        let y = fresh_object(task, 1);
        let z = fresh_object(task, 2);

        rc.add_local_reference(x);
        rc.wrap_object_id(x, &[y], None);
        rc.wrap_object_id(y, &[z], None);

        assert!(rc.is_tracked(z));
        assert_eq!(rc.local_ref_count(z), 1);
    }

    #[tokio::test]
    async fn scenario_a_no_borrow_clears_after_nested_task_waited_on() {
        // Owner O creates inner i, wraps outer o = wrap(i); submits T(o) to
        // W; W waits for T' before returning, so by the time W's reply
        // reaches O, W has already dropped its references.
        let rc = Arc::new(ReferenceCounter::new(Arc::new(NoopPort)));
        let task = fresh_task_id();
        let i = fresh_object(task, 0);
        let o = fresh_object(task, 1);
        let w = addr(1);

        rc.add_owned_object(i, task, addr(0));
        rc.add_owned_object(o, task, addr(0));
        rc.wrap_object_id(o, &[i], None);
        rc.add_submitted_task_references(&[o]);

        // W executes, waits for its nested task, then drops everything
        // before replying — so its harvested table is empty.
        let empty_table = ReferenceTable::default();
        let released = rc.remove_submitted_task_references_and_watch(&[o], w, &empty_table);
        assert!(released.contains(&o));
        assert!(!rc.is_tracked(o));
        assert!(!rc.is_tracked(i));
    }

    #[tokio::test]
    async fn scenario_b_simple_borrow_then_release_via_long_poll() {
        struct RecordingPort {
            released: Arc<Mutex<Vec<(Address, ObjectId)>>>,
        }
        #[async_trait]
        impl RefRemovalPort for RecordingPort {
            async fn wait_for_ref_removed(&self, address: Address, id: ObjectId) -> Result<(), RayCoreError> {
                self.released.lock().push((address, id));
                Ok(())
            }
        }

        let released_calls = Arc::new(Mutex::new(Vec::new()));
        let rc = Arc::new(ReferenceCounter::new(Arc::new(RecordingPort {
            released: released_calls.clone(),
        })));
        let task = fresh_task_id();
        let i = fresh_object(task, 0);
        let o = fresh_object(task, 1);
        let w = addr(1);

        rc.add_owned_object(i, task, addr(0));
        rc.add_owned_object(o, task, addr(0));
        rc.wrap_object_id(o, &[i], None);
        rc.add_submitted_task_references(&[o]);

        // W returns before finishing its nested task while still
        // referencing i: harvested table shows i still locally referenced.
        let mut table = ReferenceTable::default();
        table.insert(BorrowerRefEntry {
            object_id: i,
            local_ref_count: 1,
            further_borrowers: vec![],
            is_owned_here: false,
        });

        let released = rc.remove_submitted_task_references_and_watch(&[o], w, &table);
        assert!(released.contains(&o));
        assert!(rc.is_tracked(i));
        assert_eq!(rc.known_holders(i), vec![w]);

        // The owner now long-polls W for release of i.
        let handle = tokio::spawn({
            let rc = rc.clone();
            async move {
                rc.handle_wait_for_ref_removed(i).await;
            }
        });
        // Give the cascading drain watcher a moment against our fake port.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.await.unwrap();
        assert!(!rc.is_tracked(i));
    }
}
