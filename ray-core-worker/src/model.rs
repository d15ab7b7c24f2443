//! Rust-native task/reference model used by the services in this crate.
//!
//! These are distinct from the generated `ray_core_rpc::proto` wire types:
//! the wire types are what actually crosses a socket; these are what the
//! services reason about. Conversions live in [`crate::rpc`].

use std::collections::BTreeMap;

use bytes::Bytes;
use ray_core_common::{Address, JobId, ObjectId, ResourceSet, TaskId};

/// A task's by-reference or already-inlined argument.
#[derive(Clone, Debug)]
pub enum ArgRef {
    /// Still a reference; the executing worker (for plasma-transport ids)
    /// or the dependency resolver (for direct-transport ids) must resolve
    /// it before/at execution.
    Reference(ObjectId),
    /// Resolved: the dependency resolver inlined the payload onto the wire
    /// (spec.md §4.3).
    Inlined { data: Bytes, metadata: Bytes },
}

impl ArgRef {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            ArgRef::Reference(id) => Some(*id),
            ArgRef::Inlined { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub job_id: JobId,
    /// Non-actor tasks carry `TaskId::actor_id().is_nil()`.
    pub sequence_number: u64,
    pub client_processed_up_to: u64,
    pub args: Vec<ArgRef>,
    pub required_resources: ResourceSet,
    pub language: String,
    pub num_returns: u32,
}

impl TaskSpec {
    pub fn is_actor_task(&self) -> bool {
        self.task_id.is_actor_task()
    }

    /// Ids of all by-reference arguments still unresolved.
    pub fn referenced_arg_ids(&self) -> Vec<ObjectId> {
        self.args.iter().filter_map(ArgRef::object_id).collect()
    }
}

#[derive(Clone, Debug)]
pub struct ReturnObject {
    pub object_id: ObjectId,
    pub data: Bytes,
    pub metadata: Bytes,
    pub in_plasma: bool,
}

/// One entry of a [`ReferenceTable`] harvested by `PopBorrowerRefs` (spec.md
/// §4.1) and shipped back in a task reply.
#[derive(Clone, Debug)]
pub struct BorrowerRefEntry {
    pub object_id: ObjectId,
    pub local_ref_count: u64,
    pub further_borrowers: Vec<Address>,
    pub is_owned_here: bool,
}

/// The subtree of a borrower's local reference table rooted at the argument
/// it received, describing what it (and its transitive callees) are still
/// borrowing. Keyed by object id for fast lookup during the owner merge
/// (spec.md §4.1 step 4).
#[derive(Clone, Debug, Default)]
pub struct ReferenceTable {
    pub entries: BTreeMap<ObjectId, BorrowerRefEntry>,
}

impl ReferenceTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: BorrowerRefEntry) {
        self.entries.insert(entry.object_id, entry);
    }
}

/// A worker leased out to a caller (spec.md §3 "Lease entry").
#[derive(Clone, Debug)]
pub struct Lease {
    pub worker_id: u64,
    pub caller_worker_id: u64,
    pub caller_node_id: ray_core_common::NodeId,
    pub held_resources: ResourceSet,
    pub direct_actor: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerDiedReason {
    Crashed,
    KilledByOwnerDeath,
}
