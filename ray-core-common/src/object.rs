//! The object value type: an opaque (data, metadata) payload pair, plus the
//! inline/plasma size classification from spec.md §3.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Threshold below which an object is kept inline in a `MemoryStore` instead
/// of being handed to the shared-memory object store. Mirrors the
/// `max_direct_call_object_size`-style knob named informally in spec.md §4.3.
pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 100 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeClass {
    Inline,
    Plasma,
}

impl SizeClass {
    pub fn classify(total_size: usize, inline_threshold: usize) -> Self {
        if total_size <= inline_threshold {
            SizeClass::Inline
        } else {
            SizeClass::Plasma
        }
    }
}

/// An immutable object value: opaque application bytes plus an opaque
/// metadata blob (spec.md §1 "Language-level serialization ... is out of
/// scope; core handles opaque byte payloads plus a metadata blob").
#[derive(Clone, Debug)]
pub struct Object {
    pub data: Bytes,
    pub metadata: Bytes,
}

impl Object {
    pub fn new(data: Bytes, metadata: Bytes) -> Self {
        Self { data, metadata }
    }

    pub fn total_size(&self) -> usize {
        self.data.len() + self.metadata.len()
    }

    pub fn size_class(&self, inline_threshold: usize) -> SizeClass {
        SizeClass::classify(self.total_size(), inline_threshold)
    }
}

/// A failure sentinel stored in place of a return value (spec.md §7
/// "Propagation"): waiters observe this on `Get` and surface the kind to the
/// caller instead of the (never produced) real object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorSentinel {
    pub kind: String,
    pub message: String,
}
