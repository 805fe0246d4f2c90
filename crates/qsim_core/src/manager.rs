//! Process-wide rotation synthesis manager.
//!
//! A fixed-size worker pool serves `(angle, precision)` synthesis requests.
//! Requests are scheduled without blocking; `find` blocks until the result
//! is ready. Results are reference counted: concurrent schedules of the
//! same key perform exactly one synthesis, every waiter sees the same
//! sequence, and the ready entry is freed after the last waiter consumes
//! it.
//!
//! One mutex guards the pending deque, the ready map, and the done flag;
//! workers wait on `pending_updated`, clients wait on `value_ready`.
//! Workers never hold the lock across a synthesis call.

use crate::fixed_point::Fpa;
use crate::synthesis::synthesize_rotation;
use qsim_common::opcode::Opcode;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Key = (Fpa, i64);

struct Promise {
    ready: bool,
    ref_count: usize,
    urotseq: Vec<Opcode>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Key>,
    ready: HashMap<Key, Promise>,
    done: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    pending_updated: Condvar,
    value_ready: Condvar,
}

impl Shared {
    fn schedule(&self, angle: Fpa, precision: i64) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back((angle, precision));
        self.pending_updated.notify_one();
    }

    fn find(&self, angle: Fpa, precision: i64) -> Vec<Opcode> {
        let key = (angle, precision);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(p) = state.ready.get_mut(&key) {
                if p.ready {
                    let urotseq = p.urotseq.clone();
                    p.ref_count -= 1;
                    if p.ref_count == 0 {
                        state.ready.remove(&key);
                    }
                    return urotseq;
                }
            }
            state = self.value_ready.wait(state).unwrap();
        }
    }

    fn worker_iteration(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.pending.is_empty() && !state.done {
            state = self.pending_updated.wait(state).unwrap();
        }
        if state.done {
            return false;
        }

        let key = state.pending.pop_front().unwrap();
        if let Some(p) = state.ready.get_mut(&key) {
            // Another request already claimed this key; the duplicate just
            // bumps the reference count.
            p.ref_count += 1;
            return true;
        }
        state.ready.insert(
            key,
            Promise {
                ready: false,
                ref_count: 1,
                urotseq: Vec::new(),
            },
        );
        drop(state);

        // Parallel region: synthesis runs outside the lock.
        let urotseq = synthesize_rotation(&key.0, key.1);

        let mut state = self.state.lock().unwrap();
        let p = state.ready.get_mut(&key).expect("claimed promise");
        p.urotseq = urotseq;
        p.ready = true;
        self.value_ready.notify_all();
        true
    }
}

/// A synthesis worker pool. Most callers use the process-wide instance via
/// [`init`] / [`shutdown`] / [`schedule`] / [`find`]; owning an instance
/// directly is useful in tests.
pub struct RotationManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl RotationManager {
    pub fn start(num_threads: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("rotation-worker-{i}"))
                    .spawn(move || while shared.worker_iteration() {})
                    .expect("spawn rotation worker")
            })
            .collect();
        Self { shared, workers }
    }

    /// Enqueues a synthesis request without blocking.
    pub fn schedule(&self, angle: Fpa, precision: i64) {
        self.shared.schedule(angle, precision);
    }

    /// Blocks until the sequence for `(angle, precision)` is ready, then
    /// consumes one reference to it.
    pub fn find(&self, angle: Fpa, precision: i64) -> Vec<Opcode> {
        self.shared.find(angle, precision)
    }

    /// Signals the done flag, wakes everything, joins the workers, and
    /// clears both the pending queue and the ready map.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.done = true;
            self.pending_cv_notify_all();
            self.shared.value_ready.notify_all();
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        let mut state = self.shared.state.lock().unwrap();
        state.pending.clear();
        state.ready.clear();
    }

    fn pending_cv_notify_all(&self) {
        self.shared.pending_updated.notify_all();
    }
}

impl Drop for RotationManager {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

////////////////////////////////////////////////////////////
// Process-wide instance
////////////////////////////////////////////////////////////

static GLOBAL: Mutex<Option<RotationManager>> = Mutex::new(None);

/// Starts the process-wide pool. Initializing twice is a programming
/// error.
pub fn init(num_threads: usize) {
    let mut slot = GLOBAL.lock().unwrap();
    assert!(slot.is_none(), "rotation manager initialized twice");
    *slot = Some(RotationManager::start(num_threads));
}

/// Stops the process-wide pool. A no-op if it was never started.
pub fn shutdown() {
    let manager = GLOBAL.lock().unwrap().take();
    if let Some(mut m) = manager {
        m.stop();
    }
}

fn with_global<R>(f: impl FnOnce(&RotationManager) -> R) -> R {
    // Clone the shared handle out so long waits in `find` do not hold the
    // global slot lock.
    let shared = {
        let slot = GLOBAL.lock().unwrap();
        let m = slot.as_ref().expect("rotation manager not initialized");
        Arc::clone(&m.shared)
    };
    f(&RotationManager {
        shared,
        workers: Vec::new(),
    })
}

pub fn schedule(angle: Fpa, precision: i64) {
    with_global(|m| m.schedule(angle, precision));
}

pub fn find(angle: Fpa, precision: i64) -> Vec<Opcode> {
    with_global(|m| m.find(angle, precision))
}
