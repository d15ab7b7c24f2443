//! The per-process core worker library (spec.md §2): the services a language
//! frontend embeds to put/get objects, submit tasks, and answer RPCs from
//! its local scheduler and peer workers.

pub mod client_registry;
pub mod model;
pub mod rpc;
pub mod services;
