//! Bounded logical-qubit storage.
//!
//! A storage is a `[[n, k, d]]` block: only `k` (the logical capacity)
//! matters to the simulation, `n` and `d` feed reporting. Accesses contend
//! for adapters, each with its own free cycle; a successful access swaps
//! the load qubit out of the containment set and the store qubit in
//! atomically, and advances the chosen adapter by the access latency.

use crate::operable::Clock;
use qsim_common::ids::{Cycle, QubitKey};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, Default)]
pub struct AccessResult {
    pub success: bool,
    /// Latency in this storage's cycles; callers convert to their domain.
    pub latency: Cycle,
    pub storage_freq_khz: f64,
}

pub struct Storage {
    pub clock: Clock,
    pub physical_qubit_count: usize,
    pub logical_qubit_count: usize,
    pub code_distance: usize,
    pub load_latency: Cycle,
    pub store_latency: Cycle,
    contents: HashSet<QubitKey>,
    adapters: Vec<Cycle>,
}

impl Storage {
    pub fn new(
        freq_khz: f64,
        n: usize,
        k: usize,
        d: usize,
        num_adapters: usize,
        load_latency: Cycle,
        store_latency: Cycle,
        max_cycles_with_no_progress: Cycle,
    ) -> Self {
        Self {
            clock: Clock::new(format!("[[{n}, {k}, {d}]]"), freq_khz, max_cycles_with_no_progress),
            physical_qubit_count: n,
            logical_qubit_count: k,
            code_distance: d,
            load_latency,
            store_latency,
            contents: HashSet::with_capacity(k),
            adapters: vec![0; num_adapters],
        }
    }

    /// Storages always make progress; the clock only needs stepping.
    pub fn tick(&mut self) {
        if self.clock.begin_tick() {
            let _ = self.clock.finish_tick(1);
        }
    }

    pub fn contains(&self, q: QubitKey) -> bool {
        self.contents.contains(&q)
    }

    pub fn contents(&self) -> &HashSet<QubitKey> {
        &self.contents
    }

    pub fn free_capacity(&self) -> usize {
        self.logical_qubit_count - self.contents.len()
    }

    /// Seeds the containment set; initialization only.
    pub fn insert(&mut self, q: QubitKey) {
        assert!(
            self.contents.len() < self.logical_qubit_count,
            "{}: inserting into a full storage",
            self.clock.name
        );
        self.contents.insert(q);
    }

    fn claim_adapter(&mut self, busy_for: Cycle) -> bool {
        let current = self.clock.current_cycle();
        match self.adapters.iter_mut().find(|c| **c <= current) {
            Some(adapter) => {
                *adapter = current + busy_for;
                true
            }
            None => false,
        }
    }

    /// Removes `q` from the containment set (it moves to the caller).
    pub fn do_load(&mut self, q: QubitKey) -> AccessResult {
        assert!(self.contents.contains(&q), "{}: loading absent qubit {q}", self.clock.name);
        if !self.claim_adapter(self.load_latency) {
            return AccessResult::default();
        }
        self.contents.remove(&q);
        AccessResult {
            success: true,
            latency: self.load_latency,
            storage_freq_khz: self.clock.freq_khz,
        }
    }

    /// Inserts `q` into the containment set.
    pub fn do_store(&mut self, q: QubitKey) -> AccessResult {
        assert!(!self.contents.contains(&q), "{}: storing resident qubit {q}", self.clock.name);
        assert!(self.free_capacity() > 0, "{}: storing into a full storage", self.clock.name);
        if !self.claim_adapter(self.store_latency) {
            return AccessResult::default();
        }
        self.contents.insert(q);
        AccessResult {
            success: true,
            latency: self.store_latency,
            storage_freq_khz: self.clock.freq_khz,
        }
    }

    /// Swaps `ld` out and `st` in through one adapter.
    pub fn do_coupled_load_store(&mut self, ld: QubitKey, st: QubitKey) -> AccessResult {
        assert!(self.contents.contains(&ld), "{}: loading absent qubit {ld}", self.clock.name);
        assert!(!self.contents.contains(&st), "{}: storing resident qubit {st}", self.clock.name);
        if !self.claim_adapter(self.load_latency + self.store_latency) {
            return AccessResult::default();
        }
        self.contents.remove(&ld);
        self.contents.insert(st);
        AccessResult {
            success: true,
            latency: self.load_latency + self.store_latency,
            storage_freq_khz: self.clock.freq_khz,
        }
    }

    pub fn has_free_adapter(&self) -> bool {
        let current = self.clock.current_cycle();
        self.adapters.iter().any(|&c| c <= current)
    }

    pub fn next_free_adapter_cycle(&self) -> Cycle {
        self.adapters.iter().copied().min().unwrap_or(0)
    }

    pub fn adapter_debug_info(&self) -> String {
        let current = self.clock.current_cycle() as i64;
        let deltas: Vec<String> = self
            .adapters
            .iter()
            .map(|&c| (c as i64 - current).to_string())
            .collect();
        format!("{} adapters (free cycle delta): {}", self.clock.name, deltas.join(" "))
    }
}

/// Initializes qubit placement by striping clients across storages.
///
/// The first storage is the compute subsystem's local memory and is split
/// between the active clients only; every other storage round-robins over
/// all clients. Failing to place every qubit is fatal.
pub fn storage_striped_initialization(
    storages: &mut [&mut Storage],
    qubits_by_client: &[Vec<QubitKey>],
    num_active_clients: usize,
) {
    let mut allocated = vec![0usize; qubits_by_client.len()];

    fill_up_storage_round_robin(storages[0], &mut allocated, qubits_by_client, num_active_clients);
    for s in storages.iter_mut().skip(1) {
        fill_up_storage_round_robin(s, &mut allocated, qubits_by_client, qubits_by_client.len());
    }

    let incomplete: Vec<String> = qubits_by_client
        .iter()
        .enumerate()
        .filter(|(i, qs)| allocated[*i] < qs.len())
        .map(|(i, qs)| format!("client {i}: allocated {} of {}", allocated[i], qs.len()))
        .collect();
    if !incomplete.is_empty() {
        panic!(
            "storage_striped_initialization: storage was insufficient to allocate memory for \
             all clients:\n\t{}",
            incomplete.join("\n\t")
        );
    }
}

fn fill_up_storage_round_robin(
    storage: &mut Storage,
    allocated: &mut [usize],
    qubits: &[Vec<QubitKey>],
    idx_upper_bound: usize,
) {
    if idx_upper_bound == 0 || storage.logical_qubit_count == 0 {
        return;
    }

    let needs_allocation = |allocated: &[usize]| {
        (0..idx_upper_bound).any(|i| allocated[i] < qubits[i].len())
    };

    let mut client_idx = 0;
    while storage.free_capacity() > 0 && needs_allocation(allocated) {
        if allocated[client_idx] >= qubits[client_idx].len() {
            client_idx = (client_idx + 1) % idx_upper_bound;
            continue;
        }
        storage.insert(qubits[client_idx][allocated[client_idx]]);
        allocated[client_idx] += 1;
        client_idx = (client_idx + 1) % idx_upper_bound;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsim_common::ids::QubitKey;

    fn q(c: i8, id: i64) -> QubitKey {
        QubitKey::new(c, id)
    }

    fn storage(k: usize, adapters: usize) -> Storage {
        Storage::new(1000.0, 100, k, 9, adapters, 2, 1, 5000)
    }

    #[test]
    fn coupled_access_swaps_atomically() {
        let mut s = storage(2, 1);
        s.insert(q(0, 0));
        s.insert(q(0, 1));

        let r = s.do_coupled_load_store(q(0, 0), q(0, 5));
        assert!(r.success);
        assert_eq!(r.latency, 3);
        assert!(!s.contains(q(0, 0)));
        assert!(s.contains(q(0, 5)));
        assert_eq!(s.contents().len(), 2);
    }

    #[test]
    fn busy_adapter_rejects_access() {
        let mut s = storage(4, 1);
        s.insert(q(0, 0));
        s.insert(q(0, 1));

        assert!(s.do_coupled_load_store(q(0, 0), q(0, 5)).success);
        // The single adapter is busy for 3 cycles.
        assert!(!s.do_coupled_load_store(q(0, 1), q(0, 6)).success);
        assert!(!s.has_free_adapter());
        assert_eq!(s.next_free_adapter_cycle(), 3);

        for _ in 0..3 {
            s.tick();
        }
        assert!(s.do_coupled_load_store(q(0, 1), q(0, 6)).success);
    }

    #[test]
    fn second_adapter_serves_concurrent_access() {
        let mut s = storage(4, 2);
        s.insert(q(0, 0));
        s.insert(q(0, 1));
        assert!(s.do_coupled_load_store(q(0, 0), q(0, 5)).success);
        assert!(s.do_coupled_load_store(q(0, 1), q(0, 6)).success);
    }

    #[test]
    #[should_panic(expected = "loading absent qubit")]
    fn loading_missing_qubit_is_fatal() {
        let mut s = storage(2, 1);
        s.do_load(q(0, 3));
    }

    #[test]
    #[should_panic(expected = "inserting into a full storage")]
    fn overfilling_is_fatal() {
        let mut s = storage(1, 1);
        s.insert(q(0, 0));
        s.insert(q(0, 1));
    }

    #[test]
    fn striped_initialization_splits_local_memory_between_active_clients() {
        let qubits: Vec<Vec<QubitKey>> = (0..3)
            .map(|c| (0..4).map(|i| q(c, i)).collect())
            .collect();

        let mut local = storage(4, 4);
        let mut remote = storage(8, 1);
        storage_striped_initialization(&mut [&mut local, &mut remote], &qubits, 2);

        // Local memory holds only qubits of the two active clients.
        assert_eq!(local.contents().len(), 4);
        assert!(local.contents().iter().all(|k| k.client < 2));
        assert_eq!(local.contents().iter().filter(|k| k.client == 0).count(), 2);
        // Everything else spilled to the remote storage.
        assert_eq!(remote.contents().len(), 8);
        assert_eq!(remote.contents().iter().filter(|k| k.client == 2).count(), 4);
    }

    #[test]
    #[should_panic(expected = "insufficient")]
    fn underallocation_is_fatal() {
        let qubits: Vec<Vec<QubitKey>> = vec![(0..10).map(|i| q(0, i)).collect()];
        let mut local = storage(4, 4);
        storage_striped_initialization(&mut [&mut local], &qubits, 1);
    }
}
