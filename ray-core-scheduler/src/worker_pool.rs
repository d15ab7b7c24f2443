//! Warm pool of worker processes, per language, with actor affinity and
//! job affinity (spec.md §4.5 "WorkerPool"), grounded on
//! `examples/original_source/src/ray/raylet/worker_pool.cc`'s
//! `StartWorkerProcess` / `RegisterWorker` / `PushWorker` / `PopWorker`
//! shape.

use std::collections::HashMap;

use ray_core_common::{ActorId, Address, JobId};
use tokio::sync::{oneshot, Notify};

use parking_lot::Mutex;

/// A registered worker process (spec.md §4.5: "a process may host N
/// workers"; this rewrite models one worker per process, the common case).
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub worker_id: u64,
    pub pid: u32,
    pub address: Address,
    pub language: String,
    pub assigned_job_id: JobId,
    pub actor_id: Option<ActorId>,
}

/// Collaborator contract for actually starting a worker process. Process
/// launching itself is out of scope (spec.md §1 Non-goals); this crate only
/// needs to know whether a launch was *initiated*, keyed by the pid the
/// launched process will present when it later registers.
pub trait WorkerProcessLauncher: Send + Sync {
    fn launch(&self, language: &str, job_id: JobId) -> Option<u32>;
}

struct StartingSlot {
    language: String,
    job_id: JobId,
    actor_affinity: Option<ActorId>,
    waiter: oneshot::Sender<WorkerHandle>,
}

struct Inner {
    registered: HashMap<u64, WorkerHandle>,
    idle: Vec<u64>,
    idle_actor: HashMap<ActorId, u64>,
    starting: HashMap<u32, StartingSlot>,
    next_worker_id: u64,
}

/// Per-language warm pools plus the bounded-concurrency process-startup
/// path. `max_startup_concurrency` is global across languages, mirroring
/// `maximum_startup_concurrency_` in the original.
pub struct WorkerPool {
    max_startup_concurrency: usize,
    launcher: Box<dyn WorkerProcessLauncher>,
    inner: Mutex<Inner>,
    startup_slot_freed: Notify,
}

impl WorkerPool {
    pub fn new(max_startup_concurrency: usize, launcher: Box<dyn WorkerProcessLauncher>) -> Self {
        Self {
            max_startup_concurrency,
            launcher,
            inner: Mutex::new(Inner {
                registered: HashMap::new(),
                idle: Vec::new(),
                idle_actor: HashMap::new(),
                starting: HashMap::new(),
                next_worker_id: 1,
            }),
            startup_slot_freed: Notify::new(),
        }
    }

    /// `PopWorker` actor-task branch: 1:1 binding to the worker that owns
    /// the target actor.
    pub fn pop_worker_for_actor(&self, actor_id: ActorId) -> Option<WorkerHandle> {
        let mut inner = self.inner.lock();
        let id = inner.idle_actor.remove(&actor_id)?;
        inner.registered.get(&id).cloned()
    }

    /// `PopWorker` plain-task branch: any idle warm worker whose assigned
    /// job id matches.
    pub fn pop_worker_for_job(&self, language: &str, job_id: JobId) -> Option<WorkerHandle> {
        let mut inner = self.inner.lock();
        let pos = inner.idle.iter().position(|id| {
            inner
                .registered
                .get(id)
                .map(|w| w.language == language && w.assigned_job_id == job_id)
                .unwrap_or(false)
        })?;
        let id = inner.idle.remove(pos);
        inner.registered.get(&id).cloned()
    }

    /// Starts a new worker process and waits for it to register, enqueueing
    /// behind the startup concurrency cap rather than rejecting the request
    /// when the cap is already saturated (spec.md §13 supplemented feature,
    /// from `worker_pool.cc`'s `maximum_startup_concurrency_` handling).
    /// Returns `None` only if the launcher itself declines the request
    /// outright (not merely because the cap is full).
    pub async fn start_and_await_registration(
        &self,
        language: &str,
        job_id: JobId,
        actor_affinity: Option<ActorId>,
    ) -> Option<WorkerHandle> {
        loop {
            let rx = {
                let mut inner = self.inner.lock();
                if inner.starting.len() >= self.max_startup_concurrency {
                    None
                } else {
                    let pid = self.launcher.launch(language, job_id)?;
                    let (tx, rx) = oneshot::channel();
                    inner.starting.insert(
                        pid,
                        StartingSlot {
                            language: language.to_string(),
                            job_id,
                            actor_affinity,
                            waiter: tx,
                        },
                    );
                    Some(rx)
                }
            };

            match rx {
                Some(rx) => return rx.await.ok(),
                None => self.startup_slot_freed.notified().await,
            }
        }
    }

    /// `RegisterWorker(worker)`: validates the pid against a pending start,
    /// assigns a worker id, and wakes whichever lease is waiting on it.
    pub fn register_worker(&self, pid: u32, address: Address) -> Option<WorkerHandle> {
        let (handle, notify_startup) = {
            let mut inner = self.inner.lock();
            let slot = inner.starting.remove(&pid)?;
            let worker_id = inner.next_worker_id;
            inner.next_worker_id += 1;
            let handle = WorkerHandle {
                worker_id,
                pid,
                address,
                language: slot.language,
                assigned_job_id: slot.job_id,
                actor_id: slot.actor_affinity,
            };
            inner.registered.insert(worker_id, handle.clone());
            let _ = slot.waiter.send(handle.clone());
            (handle, ())
        };
        let _ = notify_startup;
        self.startup_slot_freed.notify_one();
        Some(handle)
    }

    /// `PushWorker(worker)`: return to idle, preserving actor affinity.
    pub fn return_worker_to_pool(&self, worker_id: u64) {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.registered.get(&worker_id).cloned() else {
            return;
        };
        if let Some(actor_id) = handle.actor_id {
            inner.idle_actor.insert(actor_id, worker_id);
        } else {
            inner.idle.push(worker_id);
        }
    }

    /// The caller disconnected the worker (or the scheduler is killing it):
    /// forget it entirely rather than returning it to the pool.
    pub fn remove_worker(&self, worker_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.registered.remove(&worker_id) {
            if let Some(actor_id) = handle.actor_id {
                inner.idle_actor.remove(&actor_id);
            }
        }
        inner.idle.retain(|id| *id != worker_id);
    }

    pub fn handle(&self, worker_id: u64) -> Option<WorkerHandle> {
        self.inner.lock().registered.get(&worker_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use ray_core_common::NodeId;

    fn addr(port: u16) -> Address {
        Address::new(NodeId::from_random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    struct CountingLauncher(AtomicU32);
    impl WorkerProcessLauncher for CountingLauncher {
        fn launch(&self, _language: &str, _job_id: JobId) -> Option<u32> {
            Some(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct DecliningLauncher;
    impl WorkerProcessLauncher for DecliningLauncher {
        fn launch(&self, _language: &str, _job_id: JobId) -> Option<u32> {
            None
        }
    }

    #[tokio::test]
    async fn start_then_register_resolves_the_waiting_lease() {
        let pool = WorkerPool::new(4, Box::new(CountingLauncher(AtomicU32::new(0))));
        let job = JobId::from_int(1);

        let waiter = {
            let pool = std::sync::Arc::new(pool);
            let p = pool.clone();
            let handle = tokio::spawn(async move { p.start_and_await_registration("rust", job, None).await });
            tokio::task::yield_now().await;
            let registered = pool.register_worker(1, addr(10)).unwrap();
            assert_eq!(registered.pid, 1);
            handle.await.unwrap()
        };
        assert!(waiter.is_some());
        assert_eq!(waiter.unwrap().assigned_job_id, job);
    }

    #[tokio::test]
    async fn register_worker_rejects_unknown_pid() {
        let pool = WorkerPool::new(4, Box::new(CountingLauncher(AtomicU32::new(0))));
        assert!(pool.register_worker(999, addr(1)).is_none());
    }

    #[tokio::test]
    async fn pop_worker_for_actor_requires_prior_affinity() {
        let pool = WorkerPool::new(4, Box::new(CountingLauncher(AtomicU32::new(0))));
        let job = JobId::from_int(1);
        let actor = ActorId::from_random(job);

        let handle = pool.register_worker(1, addr(1));
        assert!(handle.is_none()); // no pending start yet

        let p = std::sync::Arc::new(pool);
        let p2 = p.clone();
        let started = tokio::spawn(async move { p2.start_and_await_registration("rust", job, Some(actor)).await });
        tokio::task::yield_now().await;
        let registered = p.register_worker(1, addr(2)).unwrap();
        started.await.unwrap();
        p.return_worker_to_pool(registered.worker_id);

        let popped = p.pop_worker_for_actor(actor).unwrap();
        assert_eq!(popped.worker_id, registered.worker_id);
        assert!(p.pop_worker_for_actor(actor).is_none());
    }

    #[tokio::test]
    async fn startup_at_capacity_enqueues_rather_than_rejects() {
        let pool = std::sync::Arc::new(WorkerPool::new(1, Box::new(CountingLauncher(AtomicU32::new(0)))));
        let job = JobId::from_int(1);

        let p1 = pool.clone();
        let first = tokio::spawn(async move { p1.start_and_await_registration("rust", job, None).await });
        tokio::task::yield_now().await;

        let p2 = pool.clone();
        let second = tokio::spawn(async move { p2.start_and_await_registration("rust", job, None).await });
        tokio::task::yield_now().await;

        // Only one startup slot exists; the second caller must still be
        // waiting, not have been told no.
        pool.register_worker(1, addr(1)).unwrap();
        first.await.unwrap();

        pool.register_worker(2, addr(2)).unwrap();
        let second_result = second.await.unwrap();
        assert!(second_result.is_some());
    }

    #[tokio::test]
    async fn declining_launcher_fails_the_lease_outright() {
        let pool = WorkerPool::new(4, Box::new(DecliningLauncher));
        let job = JobId::from_int(1);
        assert!(pool.start_and_await_registration("rust", job, None).await.is_none());
    }
}
