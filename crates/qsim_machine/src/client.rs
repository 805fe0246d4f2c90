//! A simulated workload: one trace file, its dependency DAG, and the
//! runtime state of its qubits.
//!
//! Instructions are fetched lazily from the trace as the DAG drains. Each
//! qubit carries a `cycle_available` stamp, monotonically nondecreasing,
//! giving the earliest cycle it accepts a new operation; the stamps live
//! in `Cell`s because in-flight instructions alias their operand qubits.

use anyhow::{Context, Result};
use qsim_core::dag::{Dag, NodeId};
use qsim_common::ids::{ClientId, Cycle, QubitId, QubitKey};
use qsim_common::knobs::SimKnobs;
use qsim_io::stream::ByteSource;
use qsim_io::trace::TraceReader;
use std::cell::Cell;

#[derive(Clone, Copy, Debug, Default)]
pub struct ClientStats {
    pub inst_read: u64,
    pub inst_done: u64,
    pub unrolled_inst_done: u64,
    pub t_gates_done: u64,
    pub rotation_latency: u64,
    pub total_rotation_uops: u64,
    pub memory_accesses: u64,
    pub memory_access_latency: u64,
    pub cycle_complete: Cycle,
}

pub struct Client {
    pub trace_file: String,
    pub id: ClientId,
    pub num_qubits: usize,
    pub dag: Dag,
    pub stats: ClientStats,
    /// Per-qubit earliest-available cycle; `Cell` because in-flight
    /// instructions alias their operand qubits.
    pub qubit_avail: Vec<Cell<Cycle>>,
    reader: TraceReader<ByteSource>,
}

impl Client {
    pub fn open(trace_file: &str, id: ClientId) -> Result<Self> {
        let reader = TraceReader::open(trace_file)
            .with_context(|| format!("opening trace for client {id}"))?;
        let num_qubits = reader.qubit_count() as usize;
        Ok(Self {
            trace_file: trace_file.to_string(),
            id,
            num_qubits,
            dag: Dag::new(num_qubits),
            stats: ClientStats {
                cycle_complete: Cycle::MAX,
                ..ClientStats::default()
            },
            qubit_avail: (0..num_qubits).map(|_| Cell::new(0)).collect(),
            reader,
        })
    }

    pub fn eof(&self) -> bool {
        self.reader.at_end()
    }

    pub fn qubit_key(&self, q: QubitId) -> QubitKey {
        QubitKey::new(self.id, q)
    }

    pub fn qubit_keys(&self) -> Vec<QubitKey> {
        (0..self.num_qubits as QubitId).map(|q| self.qubit_key(q)).collect()
    }

    pub fn avail(&self, q: QubitId) -> Cycle {
        self.qubit_avail[q as usize].get()
    }

    pub fn avail_cell(&self, q: QubitId) -> &Cell<Cycle> {
        &self.qubit_avail[q as usize]
    }

    pub fn bump_avail(&self, q: QubitId, cycle: Cycle) {
        let cell = &self.qubit_avail[q as usize];
        cell.set(cell.get().max(cycle));
    }

    /// Refills the DAG from the trace up to `capacity` pending
    /// instructions. Running dry mid-simulation is expected (the client is
    /// simply out of program); the trace format itself being malformed is
    /// fatal upstream.
    pub fn refill_dag(&mut self, capacity: usize, knobs: &SimKnobs) -> Result<()> {
        while self.dag.inst_count() < capacity && !self.reader.at_end() {
            let Some((mut inst, _)) = self
                .reader
                .read_instruction()
                .with_context(|| format!("client {} trace \"{}\"", self.id, self.trace_file))?
            else {
                break;
            };

            if knobs.elide_cliffords
                && !inst.kind().is_rotation()
                && !inst.kind().is_memory_access()
            {
                continue;
            }

            inst.number = self.stats.inst_read as i64;
            self.stats.inst_read += 1;
            inst.clean_urotseqs(knobs.elide_cliffords);
            self.dag.add_instruction(inst);
        }
        Ok(())
    }

    /// Retires a front-layer instruction, folding its timing into the
    /// client statistics. The caller must have stamped `cycle_done`.
    pub fn retire_instruction(&mut self, id: NodeId) {
        let inst = self.dag.remove_instruction_from_front_layer(id);
        let latency = inst.cycle_done.saturating_sub(inst.first_ready_cycle);

        if inst.kind().is_memory_access() {
            self.stats.memory_accesses += 1;
            self.stats.memory_access_latency += latency;
            return;
        }

        self.stats.inst_done += 1;
        self.stats.unrolled_inst_done += inst.original_unrolled_count as u64;

        if inst.kind().is_t_like() {
            self.stats.t_gates_done += 1;
        }
        if inst.kind().is_rotation() {
            self.stats.rotation_latency += latency;
            self.stats.total_rotation_uops += inst.original_unrolled_count as u64;
            self.stats.t_gates_done +=
                inst.urotseq().iter().filter(|g| g.is_t_like()).count() as u64;
        }
    }

    /// True once the client has retired its share of the simulation.
    pub fn is_done(&self, simulation_instructions: u64) -> bool {
        self.stats.unrolled_inst_done >= simulation_instructions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsim_core::fixed_point::Fpa;
    use qsim_core::instruction::Instruction;
    use qsim_common::opcode::Opcode;
    use qsim_io::trace::TraceWriter;
    use tempfile::TempDir;

    fn write_trace(dir: &TempDir, name: &str, qubits: u32, program: &[Instruction]) -> String {
        let path = dir.path().join(name);
        let mut w = TraceWriter::create(&path, qubits).unwrap();
        for inst in program {
            w.write_instruction(inst).unwrap();
        }
        w.finish().unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn lazy_refill_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let program: Vec<Instruction> =
            (0..10).map(|i| Instruction::new(Opcode::H, &[i % 4])).collect();
        let path = write_trace(&dir, "t.bin", 4, &program);

        let mut c = Client::open(&path, 0).unwrap();
        let knobs = SimKnobs::default();
        c.refill_dag(4, &knobs).unwrap();
        assert_eq!(c.dag.inst_count(), 4);
        assert_eq!(c.stats.inst_read, 4);
        assert!(!c.eof());

        c.refill_dag(100, &knobs).unwrap();
        assert_eq!(c.dag.inst_count(), 10);
        assert!(c.eof());
    }

    #[test]
    fn retire_accounts_unrolled_instructions() {
        let dir = TempDir::new().unwrap();
        let rot = Instruction::new_rotation(
            Opcode::Rz,
            0,
            Fpa::from_angle(0.5),
            vec![Opcode::H, Opcode::T, Opcode::H, Opcode::Tdg],
        );
        let path = write_trace(&dir, "t.bin", 1, &[rot]);

        let mut c = Client::open(&path, 0).unwrap();
        c.refill_dag(8, &SimKnobs::default()).unwrap();
        let id = c.dag.front_layer()[0];
        {
            let inst = c.dag.inst_mut(id);
            inst.first_ready_cycle = 10;
            inst.cycle_done = 30;
        }
        c.retire_instruction(id);
        assert_eq!(c.stats.inst_done, 1);
        assert_eq!(c.stats.unrolled_inst_done, 4);
        assert_eq!(c.stats.t_gates_done, 2);
        assert_eq!(c.stats.rotation_latency, 20);
    }

    #[test]
    fn clifford_elision_drops_non_rotations() {
        let dir = TempDir::new().unwrap();
        let program = vec![
            Instruction::new(Opcode::H, &[0]),
            Instruction::new(Opcode::T, &[0]),
            Instruction::new_rotation(Opcode::Rz, 0, Fpa::zero(), vec![Opcode::T, Opcode::S]),
            Instruction::new(Opcode::MSwap, &[1, 0]),
        ];
        let path = write_trace(&dir, "t.bin", 2, &program);

        let mut c = Client::open(&path, 0).unwrap();
        let knobs = SimKnobs {
            elide_cliffords: true,
            ..SimKnobs::default()
        };
        c.refill_dag(16, &knobs).unwrap();
        // Only the rotation and the memory access survive, and the
        // rotation's urotseq is reduced to its T gates.
        assert_eq!(c.dag.inst_count(), 2);
        let front = c.dag.front_layer();
        assert_eq!(c.dag.inst(front[0]).urotseq(), &[Opcode::T]);
    }

    #[test]
    fn qubit_availability_is_monotone() {
        let dir = TempDir::new().unwrap();
        let path = write_trace(&dir, "t.bin", 2, &[]);
        let c = Client::open(&path, 3).unwrap();
        c.bump_avail(1, 10);
        c.bump_avail(1, 5);
        assert_eq!(c.avail(1), 10);
        assert_eq!(c.qubit_key(1), QubitKey::new(3, 1));
    }
}
