//! Process and node addressing.
//!
//! `NodeId` is a random 20-byte identifier (following the sizing convention
//! of `examples/original_source/src/ray/common/id.h`'s `UniqueID`, used
//! there for node/worker identifiers outside the structured job/actor/task/
//! object hierarchy). `Address` is what gets attached to leases, borrower
//! sets and RPC routing: a node id plus the `ip:port` of the process itself.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{FatalError, RayCoreError};

pub const NODE_ID_SIZE: usize = 20;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn from_random() -> Self {
        let mut buf = [0u8; NODE_ID_SIZE];
        rand::rng().fill_bytes(&mut buf);
        Self(buf)
    }

    pub fn nil() -> Self {
        Self([0u8; NODE_ID_SIZE])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses a wire-format node id. Per spec.md §7, a length mismatch here
    /// is a fatal condition, not a recoverable error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RayCoreError> {
        if bytes.len() != NODE_ID_SIZE {
            FatalError::InvalidIdLength {
                type_name: "NodeId",
                expected: NODE_ID_SIZE,
                actual: bytes.len(),
            }
            .abort();
        }
        let mut buf = [0u8; NODE_ID_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A routable process address: which node it's on, and where its RPC server
/// listens. Equality/hashing is by socket address, since two distinct
/// processes never share one.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct Address {
    pub node_id: NodeId,
    pub socket: SocketAddr,
}

impl Address {
    pub fn new(node_id: NodeId, socket: SocketAddr) -> Self {
        Self { node_id, socket }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.socket)
    }
}

/// Tags one outbound RPC call for tracing correlation across process
/// boundaries. Unlike `TaskId`/`ObjectId`/`ActorId`, request ids aren't part
/// of the job/actor/task/object hierarchy and carry no derivation rule, so
/// they're a plain random UUID rather than a structured id.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod request_id_tests {
    use super::RequestId;

    #[test]
    fn two_random_ids_differ() {
        assert_ne!(RequestId::new_random(), RequestId::new_random());
    }

    #[test]
    fn display_matches_uuid_format() {
        let id = RequestId::new_random();
        assert_eq!(id.to_string().len(), 36);
    }
}
