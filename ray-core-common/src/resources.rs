//! Resource accounting (spec.md §4.5, §9).
//!
//! Quantities are represented as an integer numerator over a fixed
//! denominator of 10000 rather than as floats, so repeated allocate/release
//! cycles can never accumulate drift (spec.md §9 "ResourceIds fractional
//! accounting").

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const FRACTION_DENOMINATOR: i64 = 10_000;

/// A resource quantity, stored as a numerator over [`FRACTION_DENOMINATOR`].
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_whole(n: i64) -> Self {
        Quantity(n * FRACTION_DENOMINATOR)
    }

    pub fn from_numerator(n: i64) -> Self {
        Quantity(n)
    }

    pub fn numerator(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(&self, other: Quantity) -> Option<Quantity> {
        if self.0 < other.0 {
            None
        } else {
            Some(Quantity(self.0 - other.0))
        }
    }

    pub fn add(&self, other: Quantity) -> Quantity {
        Quantity(self.0 + other.0)
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, FRACTION_DENOMINATOR)
    }
}

/// A labeled resource bundle (e.g. `{"CPU": 4.0, "memory": 16.0}`). Used for
/// both declared node capacity and per-task resource requests.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet(BTreeMap<String, Quantity>);

impl ResourceSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, label: impl Into<String>, quantity: Quantity) -> Self {
        self.0.insert(label.into(), quantity);
        self
    }

    pub fn get(&self, label: &str) -> Quantity {
        self.0.get(label).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }

    /// True if `self` has at least as much of every resource `other` asks
    /// for (unmentioned labels in `other` are trivially satisfied).
    pub fn covers(&self, other: &ResourceSet) -> bool {
        other
            .0
            .iter()
            .all(|(label, qty)| self.get(label) >= *qty)
    }

    /// Subtracts `other` from `self` in place. Panics if `other` is not
    /// covered — callers must check `covers` first; a resource ledger going
    /// negative is an invariant violation (spec.md §7 "Fatal conditions"),
    /// not a recoverable error.
    pub fn subtract(&mut self, other: &ResourceSet) {
        for (label, qty) in other.0.iter() {
            let remaining = self.get(label).checked_sub(*qty).unwrap_or_else(|| {
                panic!("resource ledger underflow for {label}: have {:?}, need {:?}",
                    self.get(label), qty)
            });
            self.0.insert(label.clone(), remaining);
        }
    }

    pub fn add(&mut self, other: &ResourceSet) {
        for (label, qty) in other.0.iter() {
            let updated = self.get(label).add(*qty);
            self.0.insert(label.clone(), updated);
        }
    }
}

/// A named resource instance (e.g. accelerator index 2 of 8) together with
/// the fraction of it allocated. Supports fractional allocation of discrete
/// resources, as opposed to the fungible quantities in [`ResourceSet`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceId {
    pub id: u32,
    pub fraction: Quantity,
}
