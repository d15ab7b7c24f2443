//! Actor location tracking and per-handle method ordering (spec.md §4.4
//! "receiver SchedulingQueue" and §2 "ActorRegistry + ActorManager").
//!
//! `ActorRegistry` is the map side: actor-id to latest known location/state,
//! fed by the cluster metadata service's actor-state pub/sub (spec.md §6).
//! `SchedulingQueue` is the ordering side: one instance per actor handle on
//! the receiving worker, holding out-of-order method submissions until they
//! can execute strictly in sequence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ray_core_common::{ActorId, Address};

/// Latest known state of an actor (spec.md §6 "actor state transitions
/// Alive/Reconstructing/Dead with location").
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActorState {
    Alive(Address),
    Reconstructing,
    Dead,
}

/// Maps actor-id to its latest location/state, as reported by the cluster
/// metadata service.
pub struct ActorRegistry {
    states: Mutex<HashMap<ActorId, ActorState>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, id: ActorId, state: ActorState) {
        self.states.lock().insert(id, state);
    }

    pub fn location(&self, id: ActorId) -> Option<ActorState> {
        self.states.lock().get(&id).cloned()
    }

    pub fn is_dead(&self, id: ActorId) -> bool {
        matches!(self.states.lock().get(&id), Some(ActorState::Dead))
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

type AcceptCb = Box<dyn FnOnce() + Send>;
type RejectCb = Box<dyn FnOnce() + Send>;

struct PendingEntry {
    accept: AcceptCb,
    reject: RejectCb,
}

struct QueueState {
    next_seq_no: u64,
    pending: BTreeMap<u64, PendingEntry>,
    reorder_timer: Option<tokio::task::JoinHandle<()>>,
}

/// Per-actor-handle receiver-side ordering (spec.md §4.4). Executes method
/// submissions strictly in sequence-number order regardless of arrival
/// order, bounding how long a gap can be held open.
pub struct SchedulingQueue {
    reorder_wait: Duration,
    state: Mutex<QueueState>,
}

impl SchedulingQueue {
    pub fn new(reorder_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            reorder_wait,
            state: Mutex::new(QueueState {
                // Sequence numbers are 1-indexed; `client_processed_up_to ==
                // 0` is the default sentinel meaning "nothing yet" and must
                // not advance the watermark on its own.
                next_seq_no: 1,
                pending: BTreeMap::new(),
                reorder_timer: None,
            }),
        })
    }

    /// `Add(seq_no, client_processed_up_to, accept, reject)` (spec.md §4.4).
    pub fn add(
        self: &Arc<Self>,
        seq_no: u64,
        client_processed_up_to: u64,
        accept: impl FnOnce() + Send + 'static,
        reject: impl FnOnce() + Send + 'static,
    ) {
        let (to_reject, to_accept) = {
            let mut state = self.state.lock();

            if client_processed_up_to >= state.next_seq_no {
                state.next_seq_no = client_processed_up_to + 1;
            }
            state.pending.insert(
                seq_no,
                PendingEntry {
                    accept: Box::new(accept),
                    reject: Box::new(reject),
                },
            );

            let stale: Vec<u64> = state
                .pending
                .keys()
                .copied()
                .filter(|&k| k < state.next_seq_no)
                .collect();
            let mut to_reject = Vec::new();
            for k in stale {
                if let Some(entry) = state.pending.remove(&k) {
                    to_reject.push(entry.reject);
                }
            }

            let mut to_accept = Vec::new();
            loop {
                match state.pending.keys().next().copied() {
                    Some(min_key) if min_key == state.next_seq_no => {
                        let entry = state.pending.remove(&min_key).unwrap();
                        to_accept.push(entry.accept);
                        state.next_seq_no += 1;
                    }
                    _ => break,
                }
            }

            if state.pending.is_empty() {
                if let Some(timer) = state.reorder_timer.take() {
                    timer.abort();
                }
            } else if state.reorder_timer.is_none() {
                let this = self.clone();
                let wait = self.reorder_wait;
                state.reorder_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    this.fire_reorder_timeout();
                }));
            }

            (to_reject, to_accept)
        };

        for cb in to_reject {
            cb();
        }
        for cb in to_accept {
            cb();
        }
    }

    /// Declares the missing seq_nos lost: rejects everything still pending
    /// (spec.md §4.4, §8 invariant 6 "Reorder bound").
    fn fire_reorder_timeout(self: &Arc<Self>) {
        let rejected: Vec<RejectCb> = {
            let mut state = self.state.lock();
            state.reorder_timer = None;
            std::mem::take(&mut state.pending)
                .into_values()
                .map(|e| e.reject)
                .collect()
        };
        for cb in rejected {
            cb();
        }
    }

    pub fn next_seq_no(&self) -> u64 {
        self.state.lock().next_seq_no
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn out_of_order_delivery_executes_in_sequence_order() {
        // Scenario D: network delivers 3, 1, 4, 2; must execute 1,2,3,4.
        let queue = SchedulingQueue::new(Duration::from_secs(30));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let push = |seq: u64, order: Arc<StdMutex<Vec<u64>>>| {
            let order2 = order.clone();
            queue.add(
                seq,
                0,
                move || order2.lock().unwrap().push(seq),
                || panic!("unexpected reject"),
            );
        };

        push(3, order.clone());
        assert_eq!(order.lock().unwrap().len(), 0);
        push(1, order.clone());
        assert_eq!(*order.lock().unwrap(), vec![1]);
        push(4, order.clone());
        assert_eq!(*order.lock().unwrap(), vec![1]);
        push(2, order.clone());
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn gap_left_open_past_reorder_wait_rejects_pending() {
        let queue = SchedulingQueue::new(Duration::from_millis(20));
        let rejected = Arc::new(AtomicU64::new(0));

        let r = rejected.clone();
        queue.add(5, 0, || panic!("unexpected accept"), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(queue.pending_count(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn client_processed_up_to_advances_watermark_and_rejects_stale() {
        let queue = SchedulingQueue::new(Duration::from_secs(30));
        let rejected = Arc::new(AtomicU64::new(0));
        let accepted = Arc::new(AtomicU64::new(0));

        // A reconnect informs us the client already knows seq_nos 1..4 are
        // settled; seq_no 5 itself arrives and executes immediately.
        let a = accepted.clone();
        queue.add(5, 4, move || { a.fetch_add(1, Ordering::SeqCst); }, || panic!("unexpected reject"));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(queue.next_seq_no(), 6);

        // A late, now-stale message for seq_no 2 must be rejected, not queued.
        let r = rejected.clone();
        queue.add(2, 0, || panic!("unexpected accept"), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert_eq!(queue.next_seq_no(), 6);
    }
}
