//! Structured identifiers for jobs, actors, tasks and objects.
//!
//! Every id is a fixed-width, opaque byte string with internal structure: an
//! [`ObjectId`] discloses the [`TaskId`] that created it, a [`TaskId`]
//! discloses its [`ActorId`] (nil for non-actor tasks), and an [`ActorId`]
//! discloses its [`JobId`]. No id is registered anywhere; ids are generated
//! locally by their creator and carry all the structure a reader needs.
//!
//! Byte widths and the `ObjectId` flag-bit layout follow
//! `examples/original_source/src/ray/common/id.h`.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{FatalError, RayCoreError};

pub const JOB_ID_SIZE: usize = 4;
pub const ACTOR_UNIQUE_BYTES: usize = 4;
pub const ACTOR_ID_SIZE: usize = JOB_ID_SIZE + ACTOR_UNIQUE_BYTES;
pub const TASK_UNIQUE_BYTES: usize = 6;
pub const TASK_ID_SIZE: usize = ACTOR_ID_SIZE + TASK_UNIQUE_BYTES;
pub const OBJECT_ID_FLAGS_SIZE: usize = 2;
pub const OBJECT_ID_INDEX_SIZE: usize = 4;
pub const OBJECT_ID_SIZE: usize = TASK_ID_SIZE + OBJECT_ID_FLAGS_SIZE + OBJECT_ID_INDEX_SIZE;

/// Bit offset of the object-kind flag (0 = put, 1 = task-return) within the
/// 16-bit little-endian `ObjectId` flags field.
const OBJECT_KIND_BIT: u16 = 0;
/// Bit offset of the transport-class flag (0 = plasma/shared-store,
/// 1 = direct/in-memory).
const TRANSPORT_CLASS_BIT: u16 = 1;

macro_rules! fixed_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
        pub struct $name([u8; $size]);

        impl $name {
            pub const SIZE: usize = $size;

            pub const fn nil() -> Self {
                Self([0u8; $size])
            }

            pub fn is_nil(&self) -> bool {
                self.0 == [0u8; $size]
            }

            pub fn from_binary(bytes: &[u8]) -> Result<Self, RayCoreError> {
                if bytes.len() != $size {
                    // Fatal per spec §7: an id-byte-length mismatch during
                    // FromBinary aborts the process rather than propagating.
                    FatalError::InvalidIdLength {
                        type_name: stringify!($name),
                        expected: $size,
                        actual: bytes.len(),
                    }
                    .abort();
                }
                let mut buf = [0u8; $size];
                buf.copy_from_slice(bytes);
                Ok(Self(buf))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

fixed_id!(JobId, JOB_ID_SIZE);
fixed_id!(ActorId, ACTOR_ID_SIZE);
fixed_id!(TaskId, TASK_ID_SIZE);
fixed_id!(ObjectId, OBJECT_ID_SIZE);

impl JobId {
    /// Jobs are dense integers assigned by the cluster metadata service; the
    /// core only ever wraps an already-assigned value.
    pub fn from_int(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_int(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl ActorId {
    pub fn new(job_id: JobId, unique: [u8; ACTOR_UNIQUE_BYTES]) -> Self {
        let mut buf = [0u8; ACTOR_ID_SIZE];
        buf[..JOB_ID_SIZE].copy_from_slice(job_id.as_bytes());
        buf[JOB_ID_SIZE..].copy_from_slice(&unique);
        Self(buf)
    }

    pub fn from_random(job_id: JobId) -> Self {
        let mut unique = [0u8; ACTOR_UNIQUE_BYTES];
        rand::rng().fill_bytes(&mut unique);
        Self::new(job_id, unique)
    }

    pub fn job_id(&self) -> JobId {
        let mut buf = [0u8; JOB_ID_SIZE];
        buf.copy_from_slice(&self.0[..JOB_ID_SIZE]);
        JobId(buf)
    }
}

/// Where a `TaskId`'s trailing unique bytes came from; used only to document
/// the three derivation paths named in spec.md §3, not retained on the id.
pub enum TaskIdOrigin<'a> {
    /// The first task of a new actor handle or a plain (non-actor) task.
    Root,
    /// A child task, derived deterministically from its parent so that
    /// re-execution of the parent reproduces the same child id.
    Child {
        parent_task_id: &'a TaskId,
        child_index: u64,
    },
    /// The canonical actor-creation task of an actor, derived from the
    /// `ActorId` so any process can compute it without being told.
    ActorCreation,
}

impl TaskId {
    pub fn new(actor_id: ActorId, unique: [u8; TASK_UNIQUE_BYTES]) -> Self {
        let mut buf = [0u8; TASK_ID_SIZE];
        buf[..ACTOR_ID_SIZE].copy_from_slice(actor_id.as_bytes());
        buf[ACTOR_ID_SIZE..].copy_from_slice(&unique);
        Self(buf)
    }

    pub fn for_origin(actor_id: ActorId, origin: TaskIdOrigin<'_>) -> Self {
        match origin {
            TaskIdOrigin::Root => {
                let mut unique = [0u8; TASK_UNIQUE_BYTES];
                rand::rng().fill_bytes(&mut unique);
                Self::new(actor_id, unique)
            }
            TaskIdOrigin::Child {
                parent_task_id,
                child_index,
            } => {
                // Deterministic: hash the parent id and the child's ordinal
                // so concurrent resubmission of the parent reproduces the
                // same child TaskId (required for lineage re-execution,
                // spec.md §3 "Lineage entry").
                let mut hasher = blake_like_hash(parent_task_id.as_bytes(), child_index);
                let mut unique = [0u8; TASK_UNIQUE_BYTES];
                unique.copy_from_slice(&hasher[..TASK_UNIQUE_BYTES]);
                let _ = &mut hasher;
                Self::new(actor_id, unique)
            }
            TaskIdOrigin::ActorCreation => {
                // Canonical derivation: every process can compute the
                // actor-creation TaskId from the ActorId alone, without any
                // message exchange.
                let mut hasher = blake_like_hash(actor_id.as_bytes(), 0);
                let mut unique = [0u8; TASK_UNIQUE_BYTES];
                unique.copy_from_slice(&hasher[..TASK_UNIQUE_BYTES]);
                let _ = &mut hasher;
                Self::new(actor_id, unique)
            }
        }
    }

    pub fn actor_id(&self) -> ActorId {
        let mut buf = [0u8; ACTOR_ID_SIZE];
        buf.copy_from_slice(&self.0[..ACTOR_ID_SIZE]);
        ActorId(buf)
    }

    pub fn job_id(&self) -> JobId {
        self.actor_id().job_id()
    }

    pub fn is_actor_task(&self) -> bool {
        !self.actor_id().is_nil()
    }
}

/// A cheap, dependency-free 48-bit mixing function used only to derive
/// deterministic sub-ids. Not a cryptographic hash; collisions would only
/// ever manifest as two children of the same parent colliding, which is
/// acceptable risk at 48 bits of derived entropy for this use case.
fn blake_like_hash(seed: &[u8], salt: u64) -> [u8; 8] {
    // FNV-1a, extended to 64 bits, salted with the child index / actor tag.
    let mut hash: u64 = 0xcbf29ce484222325 ^ salt;
    for &b in seed {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash.to_be_bytes()
}

/// Whether an `ObjectId` was created by a `put` call or is a task's return
/// value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ObjectKind {
    Put,
    TaskReturn,
}

/// Which transport class an object uses: large objects go through the
/// shared-memory object store (plasma), small/ephemeral ones can be sent
/// directly in RPC payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransportClass {
    Plasma,
    Direct,
}

impl ObjectId {
    pub fn new(
        creating_task: TaskId,
        kind: ObjectKind,
        transport: TransportClass,
        index: u32,
    ) -> Self {
        let mut flags: u16 = 0;
        if matches!(kind, ObjectKind::TaskReturn) {
            flags |= 1 << OBJECT_KIND_BIT;
        }
        if matches!(transport, TransportClass::Direct) {
            flags |= 1 << TRANSPORT_CLASS_BIT;
        }

        let mut buf = [0u8; OBJECT_ID_SIZE];
        buf[..TASK_ID_SIZE].copy_from_slice(creating_task.as_bytes());
        buf[TASK_ID_SIZE..TASK_ID_SIZE + OBJECT_ID_FLAGS_SIZE]
            .copy_from_slice(&flags.to_le_bytes());
        buf[TASK_ID_SIZE + OBJECT_ID_FLAGS_SIZE..].copy_from_slice(&index.to_be_bytes());
        Self(buf)
    }

    pub fn creating_task_id(&self) -> TaskId {
        let mut buf = [0u8; TASK_ID_SIZE];
        buf.copy_from_slice(&self.0[..TASK_ID_SIZE]);
        TaskId(buf)
    }

    fn flags(&self) -> u16 {
        u16::from_le_bytes([
            self.0[TASK_ID_SIZE],
            self.0[TASK_ID_SIZE + 1],
        ])
    }

    pub fn kind(&self) -> ObjectKind {
        if self.flags() & (1 << OBJECT_KIND_BIT) != 0 {
            ObjectKind::TaskReturn
        } else {
            ObjectKind::Put
        }
    }

    pub fn transport_class(&self) -> TransportClass {
        if self.flags() & (1 << TRANSPORT_CLASS_BIT) != 0 {
            TransportClass::Direct
        } else {
            TransportClass::Plasma
        }
    }

    pub fn index(&self) -> u32 {
        let mut buf = [0u8; OBJECT_ID_INDEX_SIZE];
        buf.copy_from_slice(&self.0[TASK_ID_SIZE + OBJECT_ID_FLAGS_SIZE..]);
        u32::from_be_bytes(buf)
    }
}
