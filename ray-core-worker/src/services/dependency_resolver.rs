//! Resolves a task's by-reference arguments before submission (spec.md
//! §4.3 "DependencyResolver").
//!
//! Direct-transport ids are inlined by waiting on the local `MemoryStore`;
//! plasma-transport ids are left as references for the executing worker to
//! resolve itself. An id that resolves to an in-plasma-error sentinel is
//! promoted back to a by-reference (plasma-transport) argument rather than
//! inlined, since the sentinel itself is the kind of payload too large/wrong
//! to ship inline.

use std::sync::Arc;
use std::time::Duration;

use ray_core_common::{ObjectId, RayCoreError, TransportClass};

use crate::model::{ArgRef, TaskSpec};
use crate::services::memory_store::MemoryStore;

pub struct DependencyResolver {
    memory_store: Arc<MemoryStore>,
    resolve_timeout: Option<Duration>,
}

impl DependencyResolver {
    pub fn new(memory_store: Arc<MemoryStore>, resolve_timeout: Option<Duration>) -> Self {
        Self {
            memory_store,
            resolve_timeout,
        }
    }

    /// Resolves every direct-transport argument of `spec` in place. Returns
    /// once all have been inlined (or promoted to by-reference, on error) —
    /// plasma-transport arguments are left untouched.
    pub async fn resolve(&self, mut spec: TaskSpec) -> Result<TaskSpec, RayCoreError> {
        for arg in spec.args.iter_mut() {
            let ArgRef::Reference(id) = *arg else {
                continue;
            };
            if id.transport_class() != TransportClass::Direct {
                continue;
            }
            *arg = self.resolve_one(id).await?;
        }
        Ok(spec)
    }

    async fn resolve_one(&self, id: ObjectId) -> Result<ArgRef, RayCoreError> {
        match self.memory_store.get(id, self.resolve_timeout).await {
            Ok(obj) => Ok(ArgRef::Inlined {
                data: obj.data,
                metadata: obj.metadata,
            }),
            Err(RayCoreError::ObjectUnreconstructable(_)) => {
                // The stored value is itself an error sentinel too large or
                // unsuitable to ship inline; leave the argument by-reference
                // so the executing worker resolves it (and observes the
                // same sentinel) directly against plasma.
                Ok(ArgRef::Reference(id))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ray_core_common::{ActorId, ErrorSentinel, JobId, ObjectKind, Quantity, ResourceSet, TaskIdOrigin};

    fn fresh_spec(args: Vec<ArgRef>) -> TaskSpec {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task_id = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        TaskSpec {
            task_id,
            job_id: job,
            sequence_number: 0,
            client_processed_up_to: 0,
            args,
            required_resources: ResourceSet::default(),
            language: "rust".to_string(),
            num_returns: 1,
        }
    }

    fn direct_id(index: u32) -> ObjectId {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        ObjectId::new(task, ObjectKind::Put, TransportClass::Direct, index)
    }

    fn plasma_id(index: u32) -> ObjectId {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        ObjectId::new(task, ObjectKind::Put, TransportClass::Plasma, index)
    }

    #[tokio::test]
    async fn inlines_direct_transport_arg() {
        let store = Arc::new(MemoryStore::new());
        let id = direct_id(0);
        store.put(
            id,
            ray_core_common::Object {
                data: Bytes::from_static(b"payload"),
                metadata: Bytes::new(),
            },
        );

        let resolver = DependencyResolver::new(store, None);
        let spec = fresh_spec(vec![ArgRef::Reference(id)]);
        let resolved = resolver.resolve(spec).await.unwrap();

        match &resolved.args[0] {
            ArgRef::Inlined { data, .. } => assert_eq!(data.as_ref(), b"payload"),
            ArgRef::Reference(_) => panic!("expected inlined arg"),
        }
    }

    #[tokio::test]
    async fn leaves_plasma_transport_arg_by_reference() {
        let store = Arc::new(MemoryStore::new());
        let resolver = DependencyResolver::new(store, Some(Duration::from_millis(10)));
        let id = plasma_id(0);
        let spec = fresh_spec(vec![ArgRef::Reference(id)]);
        let resolved = resolver.resolve(spec).await.unwrap();
        assert!(matches!(resolved.args[0], ArgRef::Reference(_)));
    }

    #[tokio::test]
    async fn promotes_error_sentinel_to_by_reference() {
        let store = Arc::new(MemoryStore::new());
        let id = direct_id(0);
        store.put_error(
            id,
            ErrorSentinel {
                kind: "WorkerDied".to_string(),
                message: "boom".to_string(),
            },
        );

        let resolver = DependencyResolver::new(store, None);
        let spec = fresh_spec(vec![ArgRef::Reference(id)]);
        let resolved = resolver.resolve(spec).await.unwrap();
        assert!(matches!(resolved.args[0], ArgRef::Reference(r) if r == id));
    }
}
