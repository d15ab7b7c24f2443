//! In-process cache for inlined (direct-transport) object values (spec.md
//! §4.1 "MemoryStore"). Values that never touch the plasma-style object
//! store daemon — small task returns and small by-value arguments — live
//! here, keyed by `ObjectId`, with async `get` callers parked until a value
//! (or an error sentinel) is sealed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use ray_core_common::{ErrorSentinel, Object, ObjectId, RayCoreError};

#[derive(Clone, Debug)]
enum Slot {
    Value(Object),
    Error(ErrorSentinel),
}

struct Inner {
    slots: HashMap<ObjectId, Slot>,
    waiters: HashMap<ObjectId, Arc<Notify>>,
}

/// Mirrors Ray's `CoreWorkerMemoryStore`: a condition-variable-guarded map,
/// except here the condition variable is a per-id `tokio::sync::Notify` so
/// waiting callers don't block an executor thread.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Seals a value into the store, waking any pending `get`/`get_async`
    /// callers. Overwriting an already-sealed id is a no-op: spec.md §4.1
    /// requires put to be idempotent under task retries.
    pub fn put(&self, id: ObjectId, object: Object) {
        self.seal(id, Slot::Value(object));
    }

    pub fn put_error(&self, id: ObjectId, error: ErrorSentinel) {
        self.seal(id, Slot::Error(error));
    }

    fn seal(&self, id: ObjectId, slot: Slot) {
        let notify = {
            let mut inner = self.inner.lock();
            if inner.slots.contains_key(&id) {
                return;
            }
            inner.slots.insert(id, slot);
            inner.waiters.get(&id).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.lock().slots.contains_key(&id)
    }

    /// Removes a value once it is no longer referenced (called by
    /// `ReferenceCounter`'s on-delete hook, not directly by clients).
    pub fn delete(&self, id: ObjectId) {
        self.inner.lock().slots.remove(&id);
    }

    fn try_get(&self, id: ObjectId) -> Option<Result<Object, RayCoreError>> {
        match self.inner.lock().slots.get(&id)? {
            Slot::Value(obj) => Some(Ok(obj.clone())),
            Slot::Error(sentinel) => Some(Err(RayCoreError::ObjectUnreconstructable(format!(
                "{}: {}",
                sentinel.kind, sentinel.message
            )))),
        }
    }

    /// Waits (up to `timeout`, if given) for `id` to be sealed.
    pub async fn get(&self, id: ObjectId, timeout: Option<Duration>) -> Result<Object, RayCoreError> {
        if let Some(result) = self.try_get(id) {
            return result;
        }
        let notify = {
            let mut inner = self.inner.lock();
            inner.waiters.entry(id).or_insert_with(|| Arc::new(Notify::new())).clone()
        };

        let wait = notify.notified();
        let wait_result = match timeout {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| RayCoreError::Transient(format!("timed out waiting for object {id:?}"))),
            None => Ok(wait.await),
        };
        wait_result?;

        self.try_get(id).ok_or_else(|| {
            RayCoreError::Transient(format!("object {id:?} not sealed after notify"))
        })
    }

    /// Waits for several ids at once, as `DependencyResolver` does when
    /// inlining a task's direct-transport arguments (spec.md §4.3).
    pub async fn get_many(
        &self,
        ids: &[ObjectId],
        timeout: Option<Duration>,
    ) -> Result<Vec<Object>, RayCoreError> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push(self.get(id, timeout).await?);
        }
        Ok(results)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ray_core_common::{ActorId, JobId, ObjectKind, TaskIdOrigin, TransportClass};
    use std::sync::Arc as StdArc;

    fn fresh_object_id(index: u32) -> ObjectId {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        ObjectId::new(task, ObjectKind::TaskReturn, TransportClass::Direct, index)
    }

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let store = MemoryStore::new();
        let id = fresh_object_id(0);
        store.put(
            id,
            Object {
                data: Bytes::from_static(b"hello"),
                metadata: Bytes::new(),
            },
        );
        let obj = store.get(id, None).await.unwrap();
        assert_eq!(obj.data.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn get_blocks_until_put_then_wakes() {
        let store = StdArc::new(MemoryStore::new());
        let id = fresh_object_id(0);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get(id, None).await })
        };

        tokio::task::yield_now().await;
        store.put(
            id,
            Object {
                data: Bytes::from_static(b"late"),
                metadata: Bytes::new(),
            },
        );

        let obj = waiter.await.unwrap().unwrap();
        assert_eq!(obj.data.as_ref(), b"late");
    }

    #[tokio::test]
    async fn get_times_out_when_never_sealed() {
        let store = MemoryStore::new();
        let id = fresh_object_id(0);
        let err = store.get(id, Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, RayCoreError::Transient { .. }));
    }

    #[tokio::test]
    async fn put_is_idempotent_under_retry() {
        let store = MemoryStore::new();
        let id = fresh_object_id(0);
        store.put(
            id,
            Object {
                data: Bytes::from_static(b"first"),
                metadata: Bytes::new(),
            },
        );
        store.put(
            id,
            Object {
                data: Bytes::from_static(b"second"),
                metadata: Bytes::new(),
            },
        );
        let obj = store.get(id, None).await.unwrap();
        assert_eq!(obj.data.as_ref(), b"first");
    }
}
