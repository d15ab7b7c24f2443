//! Per-node task manager / scheduler (spec.md §2): worker leasing, resource
//! placement, the warm worker pool, and spillback. See `SPEC_FULL.md` §10
//! for how this crate fits into the workspace.

pub mod local_scheduler;
pub mod peer_client;
pub mod resource_ledger;
pub mod rpc;
pub mod service;
pub mod worker_pool;
