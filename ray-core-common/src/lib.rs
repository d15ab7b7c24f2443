//! Shared model for the core worker runtime: structured identifiers, the
//! object value type, resource accounting, process addressing, error
//! taxonomy and configuration. See `SPEC_FULL.md` §10 for how this crate
//! fits into the workspace.

pub mod address;
pub mod config;
pub mod error;
pub mod ids;
pub mod object;
pub mod resources;

pub use address::{Address, NodeId, RequestId};
pub use config::RayCoreConfig;
pub use error::{FatalError, RayCoreError};
pub use ids::{ActorId, JobId, ObjectId, ObjectKind, TaskId, TaskIdOrigin, TransportClass};
pub use object::{ErrorSentinel, Object, SizeClass};
pub use resources::{Quantity, ResourceId, ResourceSet};
