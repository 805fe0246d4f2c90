//! Off-critical-path rotation precomputation.
//!
//! A second compute base with its own logical qubits executes the unrolled
//! sequences of *future* rotation instructions while the main compute is
//! busy elsewhere. The contract with the compute subsystem: submit a
//! pending rotation to a free qubit, query whether it is in progress,
//! consume it once complete (the caller then finishes the rotation with a
//! single teleport and a probabilistic correction), or invalidate it to
//! reclaim the qubit early.
//!
//! Magic-state consumption is watermark-gated: a non-critical rotation
//! refuses a T state whenever taking it would drop the factory buffers
//! below `watermark` times the count at cycle start, so precomputation
//! never starves the main compute.

use crate::client::Client;
use crate::compute::{ComputeBase, Operand};
use crate::memory::MemorySubsystem;
use crate::production::{Producer, count_available_states};
use qsim_core::dag::NodeId;
use qsim_common::ids::{Cycle, QubitId, QubitKey};
use qsim_common::knobs::SimKnobs;
use rand::rngs::StdRng;
use std::cell::Cell;
use std::collections::BTreeMap;

/// Identity of a precompute request: client index plus DAG handle of the
/// rotation instruction.
pub type RpcKey = (usize, NodeId);

pub struct RotationSubsystem {
    pub base: ComputeBase,
    pub watermark: f64,
    pub rotations_completed: u64,
    /// In-flight requests. `Some(slot)` is executing on that qubit;
    /// `None` is complete and awaiting consumption.
    assignments: BTreeMap<RpcKey, Option<usize>>,
    free_qubits: Vec<usize>,
    qubit_avail: Vec<Cell<Cycle>>,
}

impl RotationSubsystem {
    pub fn new(
        freq_khz: f64,
        code_distance: usize,
        capacity: usize,
        watermark: f64,
        knobs: &SimKnobs,
    ) -> Self {
        let mut base = ComputeBase::new("rotation_subsystem", freq_khz, code_distance, capacity, knobs);
        for i in 0..capacity {
            base.local_memory.insert(QubitKey::new(-1, i as QubitId));
        }
        Self {
            base,
            watermark,
            rotations_completed: 0,
            assignments: BTreeMap::new(),
            free_qubits: (0..capacity).rev().collect(),
            qubit_avail: (0..capacity).map(|_| Cell::new(0)).collect(),
        }
    }

    pub fn can_accept_request(&self) -> bool {
        !self.free_qubits.is_empty()
    }

    /// Ties the rotation to a free qubit. Returns false when none is free.
    pub fn submit_request(&mut self, key: RpcKey) -> bool {
        assert!(
            !self.is_request_pending(key),
            "rotation request submitted twice for client {} node {:?}",
            key.0,
            key.1
        );
        let Some(q) = self.free_qubits.pop() else {
            return false;
        };
        self.assignments.insert(key, Some(q));
        true
    }

    pub fn is_request_pending(&self, key: RpcKey) -> bool {
        self.assignments.contains_key(&key)
    }

    /// Consumes a completed request. Returns true exactly once per
    /// completed precomputation.
    pub fn find_and_delete_request_if_done(&mut self, key: RpcKey) -> bool {
        match self.assignments.get(&key) {
            Some(None) => {
                self.assignments.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Reclaims the qubit of a request, complete or not. A no-op for
    /// unknown keys, so retirement can call it unconditionally.
    pub fn invalidate(&mut self, key: RpcKey) {
        if let Some(slot) = self.assignments.remove(&key) {
            if let Some(q) = slot {
                self.free_qubits.push(q);
            }
        }
    }

    /// Invalidates every request of this client whose rotation targets the
    /// given qubit; called when that qubit leaves compute-local memory.
    pub fn invalidate_for_qubit(&mut self, client: &Client, client_idx: usize, qubit: QubitId) {
        let stale: Vec<RpcKey> = self
            .assignments
            .keys()
            .copied()
            .filter(|&(idx, node)| idx == client_idx && client.dag.inst(node).qubits()[0] == qubit)
            .collect();
        for key in stale {
            self.invalidate(key);
        }
    }

    /// True while any request is still executing.
    pub fn is_active(&self) -> bool {
        self.assignments.values().any(|s| s.is_some())
    }

    pub fn deadlock_info(&self) -> String {
        format!(
            "rotation_subsystem: {} assignments, {} free qubits",
            self.assignments.len(),
            self.free_qubits.len()
        )
    }

    pub fn tick(
        &mut self,
        clients: &mut [Client],
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) {
        if !self.base.clock.begin_tick() {
            return;
        }
        let progress = self.operate(clients, factories, memory, knobs, rng);
        if self.base.clock.finish_tick(progress) {
            panic!("{}: deadlock: {}", self.base.clock.name, self.deadlock_info());
        }
    }

    fn operate(
        &mut self,
        clients: &mut [Client],
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> i64 {
        if !self.is_active() {
            return 1;
        }

        let total_at_cycle_start = count_available_states(factories);
        let floor = ((self.watermark * total_at_cycle_start as f64) as usize).max(1);

        let keys: Vec<RpcKey> = self.assignments.keys().copied().collect();
        let mut progress = 0i64;
        for key in keys {
            let Some(Some(slot)) = self.assignments.get(&key).copied() else {
                continue;
            };
            if self.qubit_avail[slot].get() > self.base.clock.current_cycle() {
                continue;
            }

            let inst = clients[key.0].dag.inst_mut(key.1);
            let max_teleports = if inst.rpc_critical {
                knobs.t_teleport_max
            } else {
                0
            };
            let q = Operand {
                key: QubitKey::new(-1, slot as QubitId),
                avail: &self.qubit_avail[slot],
            };

            let result = self.base.do_rotation_gate_with_teleportation(
                inst,
                q,
                max_teleports,
                factories,
                memory,
                knobs,
                rng,
                |x, _uop, factories| {
                    x.rpc_critical || count_available_states(factories) > floor
                },
                |_, _| {},
                |_, _| {},
            );
            progress += result.progress;

            if result.progress > 0 && inst.current_uop().is_none() {
                // Complete: reset uop progress so the consumer replays the
                // teleport, park the request, and free the qubit.
                inst.reset_uops();
                self.free_qubits.push(slot);
                self.assignments.insert(key, None);
                self.rotations_completed += 1;
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsim_core::fixed_point::Fpa;
    use qsim_core::instruction::Instruction;
    use qsim_common::opcode::Opcode;
    use qsim_io::trace::TraceWriter;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn client_with_rotation(dir: &TempDir, seq: Vec<Opcode>) -> Client {
        let path = dir.path().join("t.bin");
        let mut w = TraceWriter::create(&path, 2).unwrap();
        let rot = Instruction::new_rotation(Opcode::Rz, 0, Fpa::from_angle(0.5), seq);
        w.write_instruction(&rot).unwrap();
        w.finish().unwrap();
        let mut c = Client::open(path.to_str().unwrap(), 0).unwrap();
        c.refill_dag(8, &SimKnobs::default()).unwrap();
        c
    }

    fn full_factory(states: usize) -> Producer {
        let knobs = SimKnobs::default();
        let mut f = Producer::cultivation(1000.0, 1e-6, states, 1.0, 1, &knobs);
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..states {
            f.tick(&mut [], &knobs, &mut rng);
        }
        f
    }

    #[test]
    fn request_lifecycle() {
        let knobs = SimKnobs::default();
        let dir = TempDir::new().unwrap();
        let mut clients = vec![client_with_rotation(&dir, vec![Opcode::T, Opcode::S])];
        let id = clients[0].dag.front_layer()[0];
        let key = (0usize, id);

        let mut rs = RotationSubsystem::new(1000.0, 9, 1, 0.0, &knobs);
        assert!(rs.can_accept_request());
        assert!(rs.submit_request(key));
        assert!(rs.is_request_pending(key));
        assert!(!rs.can_accept_request());
        assert!(!rs.find_and_delete_request_if_done(key));

        let mut factories = vec![full_factory(8)];
        let mut memory = MemorySubsystem::new(vec![], 2);
        let mut rng = StdRng::seed_from_u64(3);

        // Two uops at one per cycle (no teleport budget): the request
        // completes and frees its qubit.
        for _ in 0..8 {
            rs.tick(&mut clients, &mut factories, &mut memory, &knobs, &mut rng);
        }
        assert!(!rs.is_active());
        assert!(rs.can_accept_request());
        assert!(rs.find_and_delete_request_if_done(key));
        assert!(!rs.is_request_pending(key));
        assert_eq!(rs.rotations_completed, 1);
        // The consumer replays the gate from the start.
        assert_eq!(clients[0].dag.inst(id).uops_retired(), 0);
    }

    #[test]
    fn watermark_blocks_noncritical_consumption() {
        let knobs = SimKnobs::default();
        let dir = TempDir::new().unwrap();
        let mut clients = vec![client_with_rotation(&dir, vec![Opcode::T])];
        let id = clients[0].dag.front_layer()[0];

        // Watermark 1.0: consuming any T state would dip below the cycle
        // start count, so the rotation never advances.
        let mut rs = RotationSubsystem::new(1000.0, 9, 1, 1.0, &knobs);
        rs.submit_request((0, id));

        let mut factories = vec![full_factory(4)];
        let mut memory = MemorySubsystem::new(vec![], 2);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            rs.tick(&mut clients, &mut factories, &mut memory, &knobs, &mut rng);
        }
        assert!(rs.is_active());
        assert_eq!(factories[0].buffer_occupancy(), 4);
    }

    #[test]
    fn invalidation_frees_the_qubit() {
        let knobs = SimKnobs::default();
        let dir = TempDir::new().unwrap();
        let clients = vec![client_with_rotation(&dir, vec![Opcode::T, Opcode::T])];
        let id = clients[0].dag.front_layer()[0];
        let key = (0usize, id);

        let mut rs = RotationSubsystem::new(1000.0, 9, 1, 0.0, &knobs);
        rs.submit_request(key);
        assert!(!rs.can_accept_request());
        rs.invalidate(key);
        assert!(rs.can_accept_request());
        assert!(!rs.is_request_pending(key));

        // Invalidating an unknown key is a no-op.
        rs.invalidate(key);
    }

    #[test]
    fn invalidate_for_qubit_targets_only_that_qubit() {
        let knobs = SimKnobs::default();
        let dir = TempDir::new().unwrap();
        let client = client_with_rotation(&dir, vec![Opcode::T]);
        let id = client.dag.front_layer()[0];

        let mut rs = RotationSubsystem::new(1000.0, 9, 2, 0.0, &knobs);
        rs.submit_request((0, id));
        rs.invalidate_for_qubit(&client, 0, 1); // different qubit
        assert!(rs.is_request_pending((0, id)));
        rs.invalidate_for_qubit(&client, 0, 0); // the rotation's target
        assert!(!rs.is_request_pending((0, id)));
    }
}
