//! Node-local resource accounting (spec.md §4.5 "Resource model").
//!
//! Fungible quantities (CPU, memory, custom labels) live in a plain
//! `ResourceSet`; named, fractionally-allocatable instances (accelerators)
//! live in [`NamedResourcePool`]. Both are guarded by the same mutex as
//! `LocalScheduler`'s dispatch loop so a grant never observes a torn view.

use std::collections::HashMap;

use ray_core_common::{Quantity, ResourceId, ResourceSet};

/// A pool of named instances for one resource label (e.g. 4 accelerators
/// under the "GPU" label), each fractionally allocatable.
#[derive(Clone, Debug)]
struct NamedInstance {
    id: u32,
    available: Quantity,
}

/// Tracks `ResourceId` allocation for labels that declare named instances,
/// on top of the fungible `ResourceSet` a [`LocalScheduler`] also holds
/// (spec.md §4.5 "Named resource instances ... tracked as ResourceIds
/// supporting fractional allocation").
#[derive(Default)]
pub struct NamedResourcePool {
    instances: HashMap<String, Vec<NamedInstance>>,
}

impl NamedResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `count` whole instances of `label`, each starting fully free.
    pub fn declare(&mut self, label: impl Into<String>, count: u32) {
        let instances = (0..count)
            .map(|id| NamedInstance {
                id,
                available: Quantity::from_whole(1),
            })
            .collect();
        self.instances.insert(label.into(), instances);
    }

    /// Greedily allocates `quantity` of `label` across as few instances as
    /// possible, returning `None` (allocating nothing) if the pool can't
    /// cover the request in full.
    pub fn allocate(&mut self, label: &str, quantity: Quantity) -> Option<Vec<ResourceId>> {
        let instances = self.instances.get_mut(label)?;
        let total: i64 = instances.iter().map(|i| i.available.numerator()).sum();
        if total < quantity.numerator() {
            return None;
        }

        let mut remaining = quantity;
        let mut granted = Vec::new();
        for instance in instances.iter_mut() {
            if remaining.is_zero() {
                break;
            }
            if instance.available.is_zero() {
                continue;
            }
            let take = if instance.available.numerator() <= remaining.numerator() {
                instance.available
            } else {
                remaining
            };
            instance.available = instance.available.checked_sub(take).expect("take <= available by construction");
            remaining = remaining.checked_sub(take).expect("take <= remaining by construction");
            granted.push(ResourceId { id: instance.id, fraction: take });
        }
        Some(granted)
    }

    pub fn release(&mut self, label: &str, ids: &[ResourceId]) {
        let Some(instances) = self.instances.get_mut(label) else {
            return;
        };
        for returned in ids {
            if let Some(instance) = instances.iter_mut().find(|i| i.id == returned.id) {
                instance.available = instance.available.add(returned.fraction);
            }
        }
    }
}

/// Whether `available` has enough of every label `request` names.
pub fn covers(available: &ResourceSet, request: &ResourceSet) -> bool {
    available.covers(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_spans_multiple_instances_when_one_is_partially_used() {
        let mut pool = NamedResourcePool::new();
        pool.declare("GPU", 2);
        let first = pool.allocate("GPU", Quantity::from_numerator(7_000)).unwrap();
        assert_eq!(first.len(), 1);

        // 0.7 used on instance 0; a request for 1.0 more must span both
        // remaining fractions (0.3 left on instance 0, 1.0 on instance 1).
        let second = pool.allocate("GPU", Quantity::from_whole(1)).unwrap();
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn allocate_fails_atomically_when_pool_is_insufficient() {
        let mut pool = NamedResourcePool::new();
        pool.declare("GPU", 1);
        assert!(pool.allocate("GPU", Quantity::from_whole(2)).is_none());
        // Nothing was consumed by the failed attempt.
        assert!(pool.allocate("GPU", Quantity::from_whole(1)).is_some());
    }

    #[test]
    fn release_then_reallocate_has_no_drift() {
        let mut pool = NamedResourcePool::new();
        pool.declare("GPU", 1);
        for _ in 0..100 {
            let ids = pool.allocate("GPU", Quantity::from_whole(1)).unwrap();
            pool.release("GPU", &ids);
        }
        let ids = pool.allocate("GPU", Quantity::from_whole(1)).unwrap();
        assert_eq!(ids[0].fraction, Quantity::from_whole(1));
    }
}
