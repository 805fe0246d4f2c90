//! End-to-end simulation scenarios over small hand-built traces.

#![feature(generic_const_exprs)]
#![allow(incomplete_features)]

use qsim_core::fixed_point::Fpa;
use qsim_core::instruction::Instruction;
use qsim_common::ids::Cycle;
use qsim_common::knobs::SimKnobs;
use qsim_common::opcode::Opcode;
use qsim_io::trace::TraceWriter;
use qsim_machine::memory::MemorySubsystem;
use qsim_machine::production::Producer;
use qsim_machine::storage::Storage;
use qsim_machine::subsystem::{ComputeSubsystem, ExtendedComputeConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

const FREQ_KHZ: f64 = 1000.0;
const CODE_DISTANCE: usize = 9;

fn write_trace(dir: &TempDir, name: &str, qubits: u32, program: &[Instruction]) -> String {
    let path = dir.path().join(name);
    let mut w = TraceWriter::create(&path, qubits).unwrap();
    for inst in program {
        w.write_instruction(inst).unwrap();
    }
    w.finish().unwrap();
    path.to_string_lossy().into_owned()
}

fn remote_storage(capacity: usize) -> Storage {
    Storage::new(FREQ_KHZ, 100, capacity, CODE_DISTANCE, 1, 2, 1, 5000)
}

/// A cultivation factory producing one state every `period` cycles.
fn factory(period: usize, capacity: usize, knobs: &SimKnobs) -> Producer {
    Producer::cultivation(FREQ_KHZ, 1e-6, capacity, 1.0, period, knobs)
}

struct Driver {
    compute: ComputeSubsystem,
    memory: MemorySubsystem,
    factories: Vec<Producer>,
    knobs: SimKnobs,
    rng: StdRng,
}

impl Driver {
    fn new(
        traces: &[String],
        local_capacity: usize,
        concurrent: usize,
        inst_limit: u64,
        remote_capacity: usize,
        factories: Vec<Producer>,
        conf: ExtendedComputeConfig,
    ) -> Self {
        let knobs = SimKnobs::default();
        let storages = if remote_capacity > 0 {
            vec![remote_storage(remote_capacity)]
        } else {
            Vec::new()
        };
        let mut memory = MemorySubsystem::new(storages, 2);
        let compute = ComputeSubsystem::new(
            FREQ_KHZ,
            traces,
            CODE_DISTANCE,
            local_capacity,
            concurrent,
            inst_limit,
            conf,
            &mut memory,
            &knobs,
        )
        .unwrap();
        Self {
            compute,
            memory,
            factories,
            knobs,
            rng: StdRng::seed_from_u64(0xfeed),
        }
    }

    /// Runs until the simulation completes or `max_ticks` elapse; returns
    /// the number of ticks consumed.
    fn run(&mut self, max_ticks: u64) -> u64 {
        for tick in 0..max_ticks {
            if self.compute.done() {
                return tick;
            }
            self.compute
                .tick(&mut self.factories, &mut self.memory, &self.knobs, &mut self.rng)
                .unwrap();
            self.compute.tick_rotation_subsystem(
                &mut self.factories,
                &mut self.memory,
                &self.knobs,
                &mut self.rng,
            );
            self.memory.tick_storages();
            for f in &mut self.factories {
                f.tick(&mut [], &self.knobs, &mut self.rng);
            }
        }
        max_ticks
    }
}

#[test]
fn empty_trace_completes_with_zero_instructions() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(&dir, "empty.bin", 4, &[]);
    let mut driver = Driver::new(
        &[trace],
        4,
        1,
        0,
        0,
        Vec::new(),
        ExtendedComputeConfig::default(),
    );
    let ticks = driver.run(100);
    assert_eq!(ticks, 0);
    assert_eq!(driver.compute.clients[0].stats.unrolled_inst_done, 0);
    assert_eq!(driver.compute.clients[0].stats.inst_done, 0);
}

#[test]
fn single_h_gate_retires_after_two_cycles() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(&dir, "h.bin", 1, &[Instruction::new(Opcode::H, &[0])]);
    let mut driver = Driver::new(
        &[trace],
        4,
        1,
        1,
        0,
        Vec::new(),
        ExtendedComputeConfig::default(),
    );
    driver.run(100);
    let stats = driver.compute.clients[0].stats;
    assert_eq!(stats.unrolled_inst_done, 1);
    assert_eq!(stats.inst_done, 1);
    // Fetched at cycle 0, dispatched with a 2-cycle latency.
    assert!(driver.compute.clients[0].avail(0) >= 2);
}

#[test]
fn t_gate_starvation_is_paced_by_factory_production() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(
        &dir,
        "tt.bin",
        1,
        &[
            Instruction::new(Opcode::T, &[0]),
            Instruction::new(Opcode::T, &[0]),
        ],
    );
    let knobs = SimKnobs::default();
    // Buffer capacity 1, one state every 10 cycles.
    let mut driver = Driver::new(
        &[trace],
        4,
        1,
        2,
        0,
        vec![factory(10, 1, &knobs)],
        ExtendedComputeConfig::default(),
    );

    // Track the cycle at which each T retires.
    let mut first_done: Option<Cycle> = None;
    let mut second_done: Option<Cycle> = None;
    for _ in 0..400 {
        if driver.compute.done() {
            break;
        }
        driver.run(1);
        let done = driver.compute.clients[0].stats.inst_done;
        if done >= 1 && first_done.is_none() {
            first_done = Some(driver.compute.base.clock.current_cycle());
        }
        if done >= 2 && second_done.is_none() {
            second_done = Some(driver.compute.base.clock.current_cycle());
        }
    }
    let (first, second) = (first_done.unwrap(), second_done.unwrap());
    // The second T cannot retire before the factory has produced another
    // state: at least 10 production cycles later.
    assert!(second >= first + 10, "first = {first}, second = {second}");
}

#[test]
fn context_switch_drains_one_access_per_active_qubit() {
    let dir = TempDir::new().unwrap();
    let trace_a = write_trace(&dir, "a.bin", 4, &[Instruction::new(Opcode::H, &[0])]);
    let trace_b = write_trace(&dir, "b.bin", 4, &[Instruction::new(Opcode::H, &[0])]);

    // Window of one client, local capacity 4: client A's four qubits are
    // resident, client B's four sit in remote storage.
    let mut driver = Driver::new(
        &[trace_a, trace_b],
        4,
        1,
        1,
        8,
        Vec::new(),
        ExtendedComputeConfig::default(),
    );
    driver.run(500);

    assert!(driver.compute.done());
    assert_eq!(driver.compute.stats.context_switches, 1);
    assert_eq!(driver.compute.pending_context_switch_accesses(), 0);
    // After the switch, local memory belongs entirely to client B.
    assert!(
        driver
            .compute
            .base
            .local_memory
            .contents()
            .iter()
            .all(|k| k.client == 1)
    );
    assert_eq!(driver.compute.base.local_memory.contents().len(), 4);
    assert_eq!(driver.compute.clients[1].stats.unrolled_inst_done, 1);
}

#[test]
fn rotation_precompute_serves_a_future_rotation() {
    let dir = TempDir::new().unwrap();
    let seq = vec![Opcode::T, Opcode::T, Opcode::T, Opcode::T];
    let r1 = Instruction::new_rotation(Opcode::Rz, 0, Fpa::from_angle(0.5), seq.clone());
    let mut r2 = Instruction::new_rotation(Opcode::Rz, 0, Fpa::from_angle(0.5), seq.clone());
    r2.push_correction(vec![Opcode::Tdg]);
    // Enough unrelated work between the rotations that the precompute
    // subsystem finishes R2 before it reaches the front layer even under
    // worst-case correction latencies.
    let mut program = vec![r1];
    for _ in 0..6 {
        program.push(Instruction::new(Opcode::H, &[0]));
    }
    program.push(r2);
    let trace = write_trace(&dir, "rot.bin", 1, &program);

    let knobs = SimKnobs::default();
    let conf = ExtendedComputeConfig {
        rpc_enabled: true,
        rpc_capacity: 2,
        rpc_watermark: 0.1,
        ..ExtendedComputeConfig::default()
    };
    let mut driver = Driver::new(
        &[trace],
        4,
        1,
        14,
        0,
        vec![factory(1, 16, &knobs)],
        conf,
    );
    driver.run(2000);

    assert!(driver.compute.done());
    // R2 was precomputed while R1 executed and consumed on arrival.
    assert_eq!(driver.compute.stats.total_rotations, 2);
    assert_eq!(driver.compute.stats.total_rpc, 1);
    let rs = driver.compute.rotation.as_ref().unwrap();
    assert_eq!(rs.rotations_completed, 1);
}

#[test]
fn mswap_moves_qubits_between_tiers() {
    let dir = TempDir::new().unwrap();
    // Qubits 0..4 resident, 4..8 remote. Compute on 0, swap 4 in for 1,
    // then compute on 4.
    let program = vec![
        Instruction::new(Opcode::H, &[0]),
        Instruction::new(Opcode::MSwap, &[4, 1]),
        Instruction::new(Opcode::H, &[4]),
    ];
    let trace = write_trace(&dir, "mswap.bin", 8, &program);
    let mut driver = Driver::new(
        &[trace],
        4,
        1,
        2,
        8,
        Vec::new(),
        ExtendedComputeConfig::default(),
    );
    driver.run(500);

    assert!(driver.compute.done());
    let local = &driver.compute.base.local_memory;
    assert!(local.contains(driver.compute.clients[0].qubit_key(4)));
    assert!(!local.contains(driver.compute.clients[0].qubit_key(1)));
    let stats = driver.compute.clients[0].stats;
    assert_eq!(stats.memory_accesses, 1);
    assert_eq!(stats.unrolled_inst_done, 2);
}
