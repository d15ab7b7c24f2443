//! In-memory stand-in for the object store daemon (spec.md §6): a process
//! this crate does not implement, normally reached over a unix socket with
//! `Create(id, data_size, metadata_size) -> buffer; Seal(id); Get(ids,
//! timeout) -> buffers; Delete(ids); Contains(id); Refresh(ids)`. This fake
//! answers the same five verbs against a `HashMap` so the scenarios in
//! spec.md §8 can exercise plasma-transport object flow without a real
//! daemon, mirroring the waiter/`Notify` shape of
//! `ray_core_worker::services::memory_store::MemoryStore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ray_core_common::{Object, ObjectId, RayCoreError};
use tokio::sync::Notify;

#[derive(Clone)]
struct Buffer {
    capacity: usize,
    metadata_capacity: usize,
    data: Vec<u8>,
    metadata: Vec<u8>,
    sealed: bool,
}

struct Inner {
    buffers: HashMap<ObjectId, Buffer>,
    waiters: HashMap<ObjectId, Arc<Notify>>,
}

/// A fake plasma-style store daemon: `Create` reserves a buffer of the
/// requested size, `write_and_seal` (there being no real shared-memory
/// region to write into out of band) fills and seals it in one call, and
/// `get` blocks callers until the id is sealed or the timeout expires.
pub struct FakeObjectStore {
    inner: Mutex<Inner>,
}

impl FakeObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                waiters: HashMap::new(),
            }),
        })
    }

    /// `Create(id, data_size, metadata_size)`. Re-creating an id already
    /// present (sealed or not) is rejected, as the real daemon does.
    pub fn create(&self, id: ObjectId, data_size: usize, metadata_size: usize) -> Result<(), RayCoreError> {
        let mut inner = self.inner.lock();
        if inner.buffers.contains_key(&id) {
            return Err(RayCoreError::Transient(format!("object {id:?} already exists in store")));
        }
        inner.buffers.insert(
            id,
            Buffer {
                capacity: data_size,
                metadata_capacity: metadata_size,
                data: Vec::new(),
                metadata: Vec::new(),
                sealed: false,
            },
        );
        Ok(())
    }

    /// Writes into a previously `create`d buffer. Not part of the daemon's
    /// own wire protocol (the real write happens directly into a
    /// shared-memory region the client mapped via the out-of-band fd) but
    /// stands in for it here.
    pub fn write(&self, id: ObjectId, data: &[u8], metadata: &[u8]) -> Result<(), RayCoreError> {
        let mut inner = self.inner.lock();
        let buf = inner
            .buffers
            .get_mut(&id)
            .ok_or_else(|| RayCoreError::Transient(format!("object {id:?} not created")))?;
        if buf.sealed {
            return Err(RayCoreError::Transient(format!("object {id:?} already sealed")));
        }
        if data.len() > buf.capacity || metadata.len() > buf.metadata_capacity {
            return Err(RayCoreError::Transient(format!("object {id:?} write exceeds reserved capacity")));
        }
        buf.data = data.to_vec();
        buf.metadata = metadata.to_vec();
        Ok(())
    }

    /// `Seal(id)`: makes a previously written buffer visible to `get`,
    /// waking anyone already blocked on it.
    pub fn seal(&self, id: ObjectId) -> Result<(), RayCoreError> {
        let notify = {
            let mut inner = self.inner.lock();
            let buf = inner
                .buffers
                .get_mut(&id)
                .ok_or_else(|| RayCoreError::Transient(format!("object {id:?} not created")))?;
            buf.sealed = true;
            inner.waiters.get(&id).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(())
    }

    /// `Contains(id)`.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.lock().buffers.get(&id).is_some_and(|b| b.sealed)
    }

    /// `Delete(ids)`.
    pub fn delete(&self, ids: &[ObjectId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.buffers.remove(id);
        }
    }

    /// `Refresh(ids)`: bumps the LRU clock on ids this client still cares
    /// about. Eviction is out of scope (spec.md §13), so this is a no-op
    /// beyond confirming every id is still present.
    pub fn refresh(&self, ids: &[ObjectId]) -> Vec<bool> {
        let inner = self.inner.lock();
        ids.iter().map(|id| inner.buffers.contains_key(id)).collect()
    }

    /// `Get(ids, timeout)`: waits for every id to be sealed, up to
    /// `timeout` if given, and returns each one's bytes in order.
    pub async fn get(&self, ids: &[ObjectId], timeout: Option<Duration>) -> Result<Vec<Object>, RayCoreError> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push(self.get_one(id, timeout).await?);
        }
        Ok(results)
    }

    async fn get_one(&self, id: ObjectId, timeout: Option<Duration>) -> Result<Object, RayCoreError> {
        if let Some(obj) = self.try_get(id) {
            return Ok(obj);
        }
        let notify = {
            let mut inner = self.inner.lock();
            inner.waiters.entry(id).or_insert_with(|| Arc::new(Notify::new())).clone()
        };
        let wait = notify.notified();
        match timeout {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| RayCoreError::Transient(format!("timed out waiting for object {id:?}")))?,
            None => wait.await,
        };
        self.try_get(id)
            .ok_or_else(|| RayCoreError::Transient(format!("object {id:?} not sealed after notify")))
    }

    fn try_get(&self, id: ObjectId) -> Option<Object> {
        let inner = self.inner.lock();
        let buf = inner.buffers.get(&id)?;
        if !buf.sealed {
            return None;
        }
        Some(Object {
            data: buf.data.clone().into(),
            metadata: buf.metadata.clone().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ray_core_common::{ActorId, JobId, ObjectKind, TaskIdOrigin, TransportClass};

    fn fresh_object(index: u32) -> ObjectId {
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);
        let task = ray_core_common::TaskId::for_origin(actor, TaskIdOrigin::Root);
        ObjectId::new(task, ObjectKind::Put, TransportClass::Plasma, index)
    }

    #[tokio::test]
    async fn create_write_seal_then_get_round_trips() {
        let store = FakeObjectStore::new();
        let id = fresh_object(0);
        store.create(id, 5, 0).unwrap();
        assert!(!store.contains(id));
        store.write(id, b"hello", b"").unwrap();
        store.seal(id).unwrap();
        assert!(store.contains(id));

        let got = store.get(&[id], None).await.unwrap();
        assert_eq!(got[0].data.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn get_blocks_until_sealed_then_wakes() {
        let store = FakeObjectStore::new();
        let id = fresh_object(0);
        store.create(id, 4, 0).unwrap();
        store.write(id, b"late", b"").unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get(&[id], None).await })
        };
        tokio::task::yield_now().await;
        store.seal(id).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got[0].data.as_ref(), b"late");
    }

    #[tokio::test]
    async fn get_times_out_when_never_sealed() {
        let store = FakeObjectStore::new();
        let id = fresh_object(0);
        store.create(id, 4, 0).unwrap();
        let err = store.get(&[id], Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, RayCoreError::Transient(_)));
    }

    #[test]
    fn write_rejects_oversized_payload() {
        let store = FakeObjectStore::new();
        let id = fresh_object(0);
        store.create(id, 2, 0).unwrap();
        let err = store.write(id, b"too big", b"").unwrap_err();
        assert!(matches!(err, RayCoreError::Transient(_)));
    }

    #[test]
    fn delete_then_refresh_reports_absence() {
        let store = FakeObjectStore::new();
        let id = fresh_object(0);
        store.create(id, 1, 0).unwrap();
        store.delete(&[id]);
        assert_eq!(store.refresh(&[id]), vec![false]);
    }
}
