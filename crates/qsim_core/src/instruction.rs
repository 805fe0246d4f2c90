//! The compiled instruction record.
//!
//! An instruction is one basis operation over up to three qubit operands.
//! Rotation gates additionally carry a fixed-point angle and the unrolled
//! Clifford+T sequence approximating them; Toffoli-like gates expand to a
//! fixed CX+T network. Both are exposed through the uop cursor: the parent
//! instruction is retired exactly when the cursor reaches the uop count.
//!
//! The mutable tail of the struct (instruction number, readiness stamps,
//! uop cursor, correction queue) belongs to the simulator.

use crate::fixed_point::Fpa;
use qsim_common::ids::{Cycle, QubitId};
use qsim_common::opcode::Opcode;
use std::collections::VecDeque;
use std::fmt;

pub const MAX_QUBITS: usize = 3;

const INVALID_NUMBER: i64 = -1;

/// One gate of the CCX/CCZ decomposition: opcode plus operand-slot indices
/// into the parent instruction's qubit tuple.
type NetworkGate = (Opcode, [usize; 2], usize);

/// The 13-gate CCZ network (7 T-like, 6 CX). CCX conjugates the target
/// with H on either side, giving 15 gates.
const CCZ_NETWORK: [NetworkGate; 13] = [
    (Opcode::Cx, [1, 2], 2),
    (Opcode::Tdg, [2, 0], 1),
    (Opcode::Cx, [0, 2], 2),
    (Opcode::T, [2, 0], 1),
    (Opcode::Cx, [1, 2], 2),
    (Opcode::Tdg, [2, 0], 1),
    (Opcode::Cx, [0, 2], 2),
    (Opcode::T, [1, 0], 1),
    (Opcode::T, [2, 0], 1),
    (Opcode::Cx, [0, 1], 2),
    (Opcode::T, [0, 0], 1),
    (Opcode::Tdg, [1, 0], 1),
    (Opcode::Cx, [0, 1], 2),
];

/// A lightweight view of the currently pending uop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Uop {
    pub kind: Opcode,
    qubits: [QubitId; MAX_QUBITS],
}

impl Uop {
    pub fn qubits(&self) -> &[QubitId] {
        &self.qubits[..self.kind.qubit_count()]
    }
}

pub struct Instruction {
    kind: Opcode,
    qubits: [QubitId; MAX_QUBITS],
    angle: Fpa,
    urotseq: Vec<Opcode>,
    corrections: VecDeque<Vec<Opcode>>,

    /// Monotonically assigned on fetch from the trace.
    pub number: i64,
    /// First cycle at which all dependencies had retired.
    pub first_ready_cycle: Cycle,
    /// Cycle at which the instruction finished executing.
    pub cycle_done: Cycle,
    /// Unrolled count stamped at read time, before any later rewriting of
    /// the urotseq (e.g. swapping in a correction sequence).
    pub original_unrolled_count: usize,

    /// Rotation-precompute bookkeeping owned by the compute subsystem.
    pub rpc_visited: bool,
    pub rpc_critical: bool,

    uops_retired: usize,
}

impl Instruction {
    /// Builds an instruction from its operand list. The operand count must
    /// match the opcode's arity; a mismatch is a programming error.
    pub fn new(kind: Opcode, qubits: &[QubitId]) -> Self {
        assert_eq!(
            qubits.len(),
            kind.qubit_count(),
            "instruction {kind} expects {} operands, got {}",
            kind.qubit_count(),
            qubits.len()
        );
        let mut q = [0; MAX_QUBITS];
        q[..qubits.len()].copy_from_slice(qubits);
        Self::from_parts(kind, q, Fpa::zero(), Vec::new(), VecDeque::new())
    }

    /// Builds a rotation instruction with its angle and unrolled sequence.
    pub fn new_rotation(kind: Opcode, qubit: QubitId, angle: Fpa, urotseq: Vec<Opcode>) -> Self {
        assert!(kind.is_rotation(), "{kind} is not a rotation gate");
        Self::from_parts(kind, [qubit, 0, 0], angle, urotseq, VecDeque::new())
    }

    /// Raw constructor used by the trace reader.
    pub fn from_parts(
        kind: Opcode,
        qubits: [QubitId; MAX_QUBITS],
        angle: Fpa,
        urotseq: Vec<Opcode>,
        corrections: VecDeque<Vec<Opcode>>,
    ) -> Self {
        let mut inst = Self {
            kind,
            qubits,
            angle,
            urotseq,
            corrections,
            number: INVALID_NUMBER,
            first_ready_cycle: Cycle::MAX,
            cycle_done: Cycle::MAX,
            original_unrolled_count: 0,
            rpc_visited: false,
            rpc_critical: false,
            uops_retired: 0,
        };
        inst.original_unrolled_count = inst.unrolled_inst_count();
        inst
    }

    pub fn kind(&self) -> Opcode {
        self.kind
    }

    /// The meaningful operand prefix; trailing slots are zero-padded.
    pub fn qubits(&self) -> &[QubitId] {
        &self.qubits[..self.kind.qubit_count()]
    }

    pub fn raw_qubits(&self) -> &[QubitId; MAX_QUBITS] {
        &self.qubits
    }

    pub fn angle(&self) -> &Fpa {
        &self.angle
    }

    pub fn urotseq(&self) -> &[Opcode] {
        &self.urotseq
    }

    pub fn corrections(&self) -> &VecDeque<Vec<Opcode>> {
        &self.corrections
    }

    pub fn push_correction(&mut self, seq: Vec<Opcode>) {
        self.corrections.push_back(seq);
    }

    /// Replaces the unrolled sequence with the next queued correction
    /// sequence. An empty queue here means the precompute protocol was
    /// violated, which is fatal.
    pub fn apply_next_correction(&mut self) {
        let seq = self
            .corrections
            .pop_front()
            .unwrap_or_else(|| panic!("no correction sequence queued for {self}"));
        self.urotseq = seq;
        self.uops_retired = 0;
    }

    /// Number of uops that must execute to implement this instruction.
    /// Zero means the instruction executes atomically.
    pub fn uop_count(&self) -> usize {
        match self.kind {
            Opcode::Rx | Opcode::Rz => self.urotseq.len(),
            Opcode::Ccz => CCZ_NETWORK.len(),
            Opcode::Ccx => CCZ_NETWORK.len() + 2,
            _ => 0,
        }
    }

    /// `max(1, uop_count)`; the unit used by instruction-completion
    /// accounting.
    pub fn unrolled_inst_count(&self) -> usize {
        self.uop_count().max(1)
    }

    pub fn uops_retired(&self) -> usize {
        self.uops_retired
    }

    /// The pending uop, or `None` for atomic instructions or once all uops
    /// have retired.
    pub fn current_uop(&self) -> Option<Uop> {
        if self.uops_retired >= self.uop_count() {
            return None;
        }
        match self.kind {
            Opcode::Rx | Opcode::Rz => Some(Uop {
                kind: self.urotseq[self.uops_retired],
                qubits: [self.qubits[0], 0, 0],
            }),
            Opcode::Ccz => Some(self.network_uop(self.uops_retired)),
            Opcode::Ccx => {
                // H conjugation on the target around the CCZ network.
                if self.uops_retired == 0 || self.uops_retired == self.uop_count() - 1 {
                    Some(Uop {
                        kind: Opcode::H,
                        qubits: [self.qubits[2], 0, 0],
                    })
                } else {
                    Some(self.network_uop(self.uops_retired - 1))
                }
            }
            _ => None,
        }
    }

    fn network_uop(&self, idx: usize) -> Uop {
        let (kind, slots, arity) = CCZ_NETWORK[idx];
        let mut qubits = [0; MAX_QUBITS];
        for (i, &slot) in slots.iter().take(arity).enumerate() {
            qubits[i] = self.qubits[slot];
        }
        Uop { kind, qubits }
    }

    /// Advances the uop cursor. Returns true when every uop has retired.
    pub fn retire_current_uop(&mut self) -> bool {
        debug_assert!(self.uops_retired < self.uop_count());
        self.uops_retired += 1;
        self.uops_retired == self.uop_count()
    }

    pub fn reset_uops(&mut self) {
        self.uops_retired = 0;
    }

    /// Strips software gates from the unrolled and correction sequences;
    /// with `elide_cliffords` everything but T-like gates goes. Called once
    /// on trace read, before the original unrolled count is stamped.
    pub fn clean_urotseqs(&mut self, elide_cliffords: bool) {
        let keep = |g: &Opcode| !(g.is_software() || (elide_cliffords && !g.is_t_like()));
        self.urotseq.retain(keep);
        for c in &mut self.corrections {
            c.retain(keep);
        }
        self.original_unrolled_count = self.unrolled_inst_count();
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for q in self.qubits() {
            write!(f, " {q}")?;
        }
        if self.kind.is_rotation() {
            write!(
                f,
                " (angle = {}, urotseq len = {})",
                self.angle.to_hex_string(),
                self.urotseq.len()
            )?;
        }
        if self.number != INVALID_NUMBER {
            write!(f, " #{}", self.number)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_instructions_have_no_uops() {
        let inst = Instruction::new(Opcode::Cx, &[0, 1]);
        assert_eq!(inst.uop_count(), 0);
        assert_eq!(inst.unrolled_inst_count(), 1);
        assert!(inst.current_uop().is_none());
    }

    #[test]
    #[should_panic(expected = "expects 2 operands")]
    fn operand_arity_is_checked() {
        let _ = Instruction::new(Opcode::Cx, &[0]);
    }

    #[test]
    fn rotation_uop_cursor() {
        let seq = vec![Opcode::H, Opcode::T, Opcode::H];
        let mut inst = Instruction::new_rotation(Opcode::Rz, 5, Fpa::from_angle(0.25), seq.clone());
        assert_eq!(inst.uop_count(), 3);
        for (i, g) in seq.iter().enumerate() {
            let uop = inst.current_uop().unwrap();
            assert_eq!(uop.kind, *g);
            assert_eq!(uop.qubits(), &[5]);
            let done = inst.retire_current_uop();
            assert_eq!(done, i + 1 == seq.len());
        }
        assert!(inst.current_uop().is_none());
        assert_eq!(inst.uops_retired(), inst.uop_count());
    }

    #[test]
    fn toffoli_decompositions() {
        let ccz = Instruction::new(Opcode::Ccz, &[0, 1, 2]);
        assert_eq!(ccz.uop_count(), 13);
        let ccx = Instruction::new(Opcode::Ccx, &[3, 4, 5]);
        assert_eq!(ccx.uop_count(), 15);

        // CCX starts and ends with H on the target.
        let mut inst = ccx;
        let first = inst.current_uop().unwrap();
        assert_eq!(first.kind, Opcode::H);
        assert_eq!(first.qubits(), &[5]);
        while !inst.retire_current_uop() {}
        assert_eq!(inst.uops_retired(), 15);

        // T-like count in the CCZ network is 7, CX count is 6.
        let t_count = CCZ_NETWORK.iter().filter(|(g, _, _)| g.is_t_like()).count();
        let cx_count = CCZ_NETWORK.iter().filter(|(g, _, _)| *g == Opcode::Cx).count();
        assert_eq!((t_count, cx_count), (7, 6));
    }

    #[test]
    fn correction_queue() {
        let mut inst =
            Instruction::new_rotation(Opcode::Rz, 0, Fpa::zero(), vec![Opcode::T, Opcode::T]);
        inst.push_correction(vec![Opcode::Tdg]);
        while !inst.retire_current_uop() {}
        inst.apply_next_correction();
        assert_eq!(inst.uop_count(), 1);
        assert_eq!(inst.uops_retired(), 0);
        assert_eq!(inst.current_uop().unwrap().kind, Opcode::Tdg);
    }

    #[test]
    #[should_panic(expected = "no correction sequence queued")]
    fn missing_correction_is_fatal() {
        let mut inst = Instruction::new_rotation(Opcode::Rz, 0, Fpa::zero(), vec![Opcode::T]);
        inst.apply_next_correction();
    }

    #[test]
    fn urotseq_cleaning() {
        let seq = vec![Opcode::H, Opcode::X, Opcode::T, Opcode::Z, Opcode::S];
        let mut inst = Instruction::new_rotation(Opcode::Rz, 0, Fpa::zero(), seq.clone());
        inst.clean_urotseqs(false);
        assert_eq!(inst.urotseq(), &[Opcode::H, Opcode::T, Opcode::S]);
        assert_eq!(inst.original_unrolled_count, 3);

        let mut inst = Instruction::new_rotation(Opcode::Rz, 0, Fpa::zero(), seq);
        inst.clean_urotseqs(true);
        assert_eq!(inst.urotseq(), &[Opcode::T]);
    }
}
