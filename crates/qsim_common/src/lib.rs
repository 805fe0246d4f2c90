//! Common definitions shared across the fault-tolerant quantum machine
//! simulator.
//!
//! This crate provides the scalar identifier types used throughout the
//! system, the basis-gate opcode enumeration with its wire encoding and
//! classification predicates, and the simulation-wide knob structure that
//! every subsystem consults. It has no dependencies so that both the
//! compiler-side and simulator-side crates can share it freely.

/// Scalar identifier types for the simulation domain.
///
/// These aliases fix the width and signedness of the identifiers that cross
/// crate boundaries: qubit ids are program-scoped 64-bit signed integers,
/// client ids are 8-bit signed workload identifiers, and cycles are 64-bit
/// unsigned ticks of one component's clock domain.
pub mod ids {
    use core::fmt;

    /// Program-scoped logical qubit identifier.
    pub type QubitId = i64;

    /// Workload-instance identifier. Negative values are reserved for
    /// qubits that belong to no client (e.g. the rotation precompute
    /// subsystem's private qubits).
    pub type ClientId = i8;

    /// Logical tick of one component's clock domain.
    pub type Cycle = u64;

    /// Identity of a logical qubit across the whole machine.
    ///
    /// Storage contents and routing decisions are keyed by this pair; the
    /// per-qubit runtime state (the `cycle_available` stamp) lives with the
    /// owning client.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QubitKey {
        pub client: ClientId,
        pub qubit: QubitId,
    }

    impl QubitKey {
        pub fn new(client: ClientId, qubit: QubitId) -> Self {
            Self { client, qubit }
        }
    }

    impl fmt::Display for QubitKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "(qubit {}, client {})", self.qubit, self.client)
        }
    }
}

/// Basis-gate opcode enumeration and classification helpers.
///
/// The numeric values double as the zero-based wire encoding used by the
/// binary trace format, so the enum order must never change without a
/// corresponding trace-format revision.
pub mod opcode {
    use core::fmt;

    /// One basis operation of the compiled instruction set.
    ///
    /// The set covers the Clifford+T gate library (with X-basis variants of
    /// the S/T family produced by the synthesis post-optimizer), rotations,
    /// Toffoli-like gates, measurements, the memory operations inserted by
    /// the memory-access scheduler, and a `Nil` sentinel used for in-place
    /// deletion during sequence rewriting.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum Opcode {
        H = 0,
        X,
        Y,
        Z,
        S,
        Sx,
        Sdg,
        Sxdg,
        T,
        Tx,
        Tdg,
        Txdg,
        Cx,
        Cz,
        Swap,
        Rx,
        Rz,
        Ccx,
        Ccz,
        Mz,
        Mx,
        /// Loads the qubit operand into compute-local memory.
        MLoad,
        /// Stores the qubit operand out to the memory subsystem.
        MStore,
        /// Coupled load/store: loads operand 0 and evicts operand 1.
        MSwap,
        /// Coupled load/store issued off the critical path.
        MPrefetch,
        Nil,
    }

    /// Mnemonics indexed by opcode value; used by trace dumps and
    /// diagnostics.
    pub const MNEMONICS: [&str; 26] = [
        "h", "x", "y", "z", "s", "sx", "sdg", "sxdg", "t", "tx", "tdg", "txdg", "cx", "cz",
        "swap", "rx", "rz", "ccx", "ccz", "mz", "mx", "mload", "mstore", "mswap", "mprefetch",
        "nil",
    ];

    impl Opcode {
        /// Decodes a wire value. Returns `None` for out-of-range bytes so
        /// the trace reader can reject malformed records.
        pub fn from_wire(v: u16) -> Option<Self> {
            if v < 26 {
                // The enum is repr(u8) with contiguous discriminants.
                Some(unsafe { core::mem::transmute::<u8, Opcode>(v as u8) })
            } else {
                None
            }
        }

        pub fn wire(self) -> u16 {
            self as u16
        }

        pub fn mnemonic(self) -> &'static str {
            MNEMONICS[self as usize]
        }

        /// Number of meaningful qubit operands for this opcode. Trailing
        /// operand slots beyond this count are ignored.
        pub fn qubit_count(self) -> usize {
            use Opcode::*;
            match self {
                Nil => 0,
                Cx | Cz | Swap | MSwap | MPrefetch => 2,
                Ccx | Ccz => 3,
                _ => 1,
            }
        }

        /// Software-only operations tracked in the Pauli frame; they cost
        /// no cycles and claim no resources.
        pub fn is_software(self) -> bool {
            matches!(self, Opcode::X | Opcode::Y | Opcode::Z | Opcode::Swap)
        }

        pub fn is_memory_access(self) -> bool {
            matches!(
                self,
                Opcode::MLoad | Opcode::MStore | Opcode::MSwap | Opcode::MPrefetch
            )
        }

        /// T-family gates; each execution consumes one magic state.
        pub fn is_t_like(self) -> bool {
            matches!(self, Opcode::T | Opcode::Tx | Opcode::Tdg | Opcode::Txdg)
        }

        pub fn is_rotation(self) -> bool {
            matches!(self, Opcode::Rx | Opcode::Rz)
        }

        pub fn is_toffoli_like(self) -> bool {
            matches!(self, Opcode::Ccx | Opcode::Ccz)
        }
    }

    impl fmt::Display for Opcode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.mnemonic())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn wire_round_trip() {
            for v in 0..26u16 {
                let op = Opcode::from_wire(v).unwrap();
                assert_eq!(op.wire(), v);
            }
            assert!(Opcode::from_wire(26).is_none());
            assert!(Opcode::from_wire(0xffff).is_none());
        }

        #[test]
        fn arity_table() {
            assert_eq!(Opcode::H.qubit_count(), 1);
            assert_eq!(Opcode::Cx.qubit_count(), 2);
            assert_eq!(Opcode::MSwap.qubit_count(), 2);
            assert_eq!(Opcode::Ccz.qubit_count(), 3);
            assert_eq!(Opcode::Nil.qubit_count(), 0);
        }

        #[test]
        fn classification() {
            assert!(Opcode::Swap.is_software());
            assert!(!Opcode::H.is_software());
            assert!(Opcode::Tdg.is_t_like());
            assert!(Opcode::MPrefetch.is_memory_access());
            assert!(Opcode::Rz.is_rotation());
            assert!(Opcode::Ccx.is_toffoli_like());
        }
    }
}

/// Simulation-wide switches.
///
/// These replace ad-hoc process globals: the driver builds one `SimKnobs`
/// from the command line and threads it by reference into every subsystem
/// that needs it.
pub mod knobs {
    /// Behavior switches consulted throughout the cycle simulation.
    #[derive(Clone, Debug)]
    pub struct SimKnobs {
        /// Maximum number of T-gate teleportations executed after the
        /// initial uop of a rotation within one dispatch.
        pub t_teleport_max: u64,

        /// When set, teleported T gates pay a single deterministic
        /// auto-correction cost per episode instead of a per-gate
        /// probabilistic correction.
        pub t_autocorrect: bool,

        /// Zero out T-gate latency (bandwidth speed-of-light analysis).
        pub zero_latency_t: bool,

        /// Drop Clifford gates on trace read (bandwidth speed-of-light
        /// analysis).
        pub elide_cliffords: bool,

        /// Always search for further precomputable rotations after a
        /// precompute hit.
        pub rpc_always_runahead: bool,

        /// Number of future rotations the precompute subsystem tries to
        /// allocate per trigger.
        pub rpc_degree: usize,

        /// A future rotation is only precomputed if its instruction number
        /// is within this distance of the triggering instruction.
        pub rpc_inst_delta_limit: i64,

        /// Consecutive zero-progress cycles after which a component is
        /// declared deadlocked.
        pub max_cycles_with_no_progress: u64,

        /// Physical error rate assumed by state injection and resource
        /// estimation.
        pub physical_error_rate: f64,
    }

    impl Default for SimKnobs {
        fn default() -> Self {
            Self {
                t_teleport_max: 0,
                t_autocorrect: false,
                zero_latency_t: false,
                elide_cliffords: false,
                rpc_always_runahead: false,
                rpc_degree: 1,
                rpc_inst_delta_limit: 10_000,
                max_cycles_with_no_progress: 5_000,
                physical_error_rate: 1e-3,
            }
        }
    }
}
