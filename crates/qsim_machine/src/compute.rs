//! Instruction execution core shared by the compute subsystem and the
//! rotation precompute subsystem.
//!
//! A `ComputeBase` owns its clock, its local working-set storage, and the
//! dispatch table mapping instruction kinds to latencies and resource
//! claims. Magic-state consumption draws from the top-level factory list
//! passed in by the driver; memory operations delegate to the memory
//! subsystem. Transient failures (no magic state buffered, busy route or
//! adapter) are zero-progress results retried next cycle.

use crate::memory::MemorySubsystem;
use crate::operable::Clock;
use crate::production::{Producer, count_available_states};
use crate::storage::Storage;
use qsim_core::instruction::{Instruction, Uop};
use qsim_common::ids::{Cycle, QubitKey};
use qsim_common::knobs::SimKnobs;
use qsim_common::opcode::Opcode;
use rand::Rng;
use rand::rngs::StdRng;
use std::cell::Cell;

/// One qubit operand: its machine-wide identity plus its availability
/// stamp. The stamp sits in a `Cell` because an instruction may alias the
/// same qubit record through several operand slots.
#[derive(Clone, Copy)]
pub struct Operand<'a> {
    pub key: QubitKey,
    pub avail: &'a Cell<Cycle>,
}

impl Operand<'_> {
    pub fn bump_avail(&self, cycle: Cycle) {
        self.avail.set(self.avail.get().max(cycle));
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExecResult {
    pub progress: i64,
    pub latency: Cycle,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ComputeStats {
    pub t_gates: u64,
    pub t_gate_teleports: u64,
    pub t_gate_teleport_episodes: u64,
}

pub struct ComputeBase {
    pub clock: Clock,
    pub code_distance: usize,
    pub local_memory_capacity: usize,
    pub local_memory: Storage,
    pub stats: ComputeStats,
}

impl ComputeBase {
    pub fn new(
        name: impl Into<String>,
        freq_khz: f64,
        code_distance: usize,
        local_memory_capacity: usize,
        knobs: &SimKnobs,
    ) -> Self {
        // Local memory is modeled with one adapter per qubit and zero
        // internal latency; timing comes from qubit availability stamps.
        let local_memory = Storage::new(
            freq_khz,
            0,
            local_memory_capacity,
            0,
            local_memory_capacity,
            0,
            0,
            knobs.max_cycles_with_no_progress,
        );
        Self {
            clock: Clock::new(name, freq_khz, knobs.max_cycles_with_no_progress),
            code_distance,
            local_memory_capacity,
            local_memory,
            stats: ComputeStats::default(),
        }
    }

    pub fn count_available_magic_states(&self, factories: &[Producer]) -> usize {
        count_available_states(factories)
    }

    /// Dispatches one atomic instruction (or uop).
    pub fn execute_instruction(
        &mut self,
        kind: Opcode,
        operands: &[Operand<'_>],
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> ExecResult {
        if kind.is_software() {
            return ExecResult {
                progress: 1,
                latency: 0,
            };
        }

        use Opcode::*;
        match kind {
            H | S | Sx | Sdg | Sxdg | Mz | Mx => self.do_single_qubit_gate(operands[0]),
            Cx | Cz => self.do_cx_like_gate(operands[0], operands[1]),
            T | Tx | Tdg | Txdg => self.do_t_like_gate(operands[0], factories, knobs, rng),
            // A rotation whose unrolled sequence reduced to nothing.
            Rx | Rz => ExecResult {
                progress: 1,
                latency: 0,
            },
            MSwap => self.do_coupled_memory_access(operands[0], operands[1], memory, false),
            MPrefetch => self.do_coupled_memory_access(operands[0], operands[1], memory, true),
            MLoad => self.do_load(operands[0], memory),
            MStore => self.do_store(operands[0], memory),
            _ => panic!("{}: cannot execute instruction kind {kind}", self.clock.name),
        }
    }

    fn do_single_qubit_gate(&mut self, q: Operand<'_>) -> ExecResult {
        q.bump_avail(self.clock.current_cycle() + 2);
        ExecResult {
            progress: 1,
            latency: 2,
        }
    }

    fn do_cx_like_gate(&mut self, q1: Operand<'_>, q2: Operand<'_>) -> ExecResult {
        let done = self.clock.current_cycle() + 2;
        q1.bump_avail(done);
        q2.bump_avail(done);
        ExecResult {
            progress: 1,
            latency: 2,
        }
    }

    fn do_t_like_gate(
        &mut self,
        q: Operand<'_>,
        factories: &mut [Producer],
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> ExecResult {
        let Some(f) = factories.iter_mut().find(|f| f.buffer_occupancy() > 0) else {
            return ExecResult::default();
        };
        f.consume(1);

        // Half of all teleported T gates need an S correction, modeled as
        // a latency coin flip.
        let latency = if knobs.zero_latency_t {
            0
        } else if rng.r#gen::<bool>() {
            4
        } else {
            2
        };
        q.bump_avail(self.clock.current_cycle() + latency);
        self.stats.t_gates += 1;
        ExecResult {
            progress: 1,
            latency,
        }
    }

    /// Coupled access: `ld` comes into local memory, `st` is evicted. The
    /// remote side decides success; the local swap cannot fail (local
    /// memory has an adapter per qubit).
    fn do_coupled_memory_access(
        &mut self,
        ld: Operand<'_>,
        st: Operand<'_>,
        memory: &mut MemorySubsystem,
        off_critical_path: bool,
    ) -> ExecResult {
        let result = memory.do_coupled_load_store(
            ld.key,
            st.key,
            self.clock.current_cycle(),
            self.clock.freq_khz,
        );
        if !result.success {
            return ExecResult::default();
        }

        let local = self.local_memory.do_coupled_load_store(st.key, ld.key);
        if !local.success {
            panic!(
                "{}: local memory access failed\n{}",
                self.clock.name,
                self.local_memory.adapter_debug_info()
            );
        }

        let latency = result.latency + 2;
        ld.bump_avail(self.clock.current_cycle() + latency);
        st.bump_avail(self.clock.current_cycle() + latency);
        ExecResult {
            progress: 1,
            latency: if off_critical_path { 0 } else { latency },
        }
    }

    fn do_load(&mut self, q: Operand<'_>, memory: &mut MemorySubsystem) -> ExecResult {
        let result = memory.do_load(q.key, self.clock.current_cycle(), self.clock.freq_khz);
        if !result.success {
            return ExecResult::default();
        }
        let local = self.local_memory.do_store(q.key);
        assert!(local.success);
        let latency = result.latency + 2;
        q.bump_avail(self.clock.current_cycle() + latency);
        ExecResult {
            progress: 1,
            latency,
        }
    }

    fn do_store(&mut self, q: Operand<'_>, memory: &mut MemorySubsystem) -> ExecResult {
        let result = memory.do_store(q.key, self.clock.current_cycle(), self.clock.freq_khz);
        if !result.success {
            return ExecResult::default();
        }
        let local = self.local_memory.do_load(q.key);
        assert!(local.success);
        let latency = result.latency + 2;
        q.bump_avail(self.clock.current_cycle() + latency);
        ExecResult {
            progress: 1,
            latency,
        }
    }

    /// Executes uops of a rotation gate, teleporting past the first uop
    /// while budget remains.
    ///
    /// The loop continues while `loop_pred` holds, budget remains, and
    /// each uop's execution succeeds; `iter_cb` fires per visited uop and
    /// `retire_cb` just before each uop retires. Every T-like uop retired
    /// beyond the first consumes one teleport. On any teleport episode an
    /// auto-correction cost of `2 * code_distance` is added (or a
    /// probabilistic per-gate correction when auto-correction is off).
    #[allow(clippy::too_many_arguments)]
    pub fn do_rotation_gate_with_teleportation<P, I, R>(
        &mut self,
        inst: &mut Instruction,
        q: Operand<'_>,
        max_teleports: u64,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
        mut loop_pred: P,
        mut iter_cb: I,
        mut retire_cb: R,
    ) -> ExecResult
    where
        P: FnMut(&Instruction, &Uop, &[Producer]) -> bool,
        I: FnMut(&Instruction, &Uop),
        R: FnMut(&Instruction, &Uop),
    {
        let Some(uop) = inst.current_uop() else {
            return ExecResult::default();
        };
        if !loop_pred(inst, &uop, factories) {
            return ExecResult::default();
        }
        iter_cb(inst, &uop);

        let mut out = self.execute_instruction(uop.kind, &[q], factories, memory, knobs, rng);
        if out.progress == 0 {
            return out;
        }
        retire_cb(inst, &uop);
        if inst.retire_current_uop() {
            if knobs.zero_latency_t {
                out.latency = 0;
            }
            return out;
        }

        let mut tp_remaining = max_teleports;
        let mut any_teleports = false;
        while tp_remaining > 0 {
            let uop = inst.current_uop().expect("unretired uop");
            if !loop_pred(inst, &uop, factories) {
                break;
            }
            iter_cb(inst, &uop);

            let result = self.execute_instruction(uop.kind, &[q], factories, memory, knobs, rng);
            if result.progress == 0 {
                break;
            }

            if uop.kind.is_t_like() {
                tp_remaining -= 1;
                self.stats.t_gate_teleports += 1;
                if !knobs.t_autocorrect && rng.r#gen::<u8>() & 3 != 0 {
                    out.latency += 2 * self.code_distance as Cycle;
                }
                any_teleports = true;
            }

            out.progress += result.progress;
            retire_cb(inst, &uop);
            if inst.retire_current_uop() {
                break;
            }
        }

        if any_teleports {
            self.stats.t_gate_teleport_episodes += 1;
            if knobs.t_autocorrect {
                out.latency += 2 * self.code_distance as Cycle;
            }
        }
        if knobs.zero_latency_t {
            out.latency = 0;
        }
        out
    }
}
