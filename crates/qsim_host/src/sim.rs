//! The `sim` subcommand: compose the machine and run the main simulation
//! loop.

use crate::report::{print_indented_stat_line, print_stat_line, print_stat_line_f64};
use anyhow::{Context, Result, bail};
use clap::Args;
use qsim_compiler::policy::Eif;
use qsim_compiler::scheduler::{self, SchedulerConfig};
use qsim_common::knobs::SimKnobs;
use qsim_io::trace::{TraceReader, TraceWriter};
use qsim_machine::allocator::{Allocation, FactorySpec, throughput_aware_allocation};
use qsim_machine::estimation::{
    bivariate_bicycle_code_logical_qubit_count, bivariate_bicycle_code_physical_qubit_count,
    surface_code_physical_qubit_count,
};
use qsim_machine::memory::MemorySubsystem;
use qsim_machine::operable::{
    Clock, compute_freq_khz, convert_cycles_to_time_ns, coordinate_clock_scale,
};
use qsim_machine::production::Pipeline;
use qsim_machine::protocols;
use qsim_machine::stats;
use qsim_machine::storage::Storage;
use qsim_machine::subsystem::{ComputeSubsystem, ExtendedComputeConfig, StallType};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::Path;
use std::time::Instant;

#[derive(Args)]
pub struct SimArgs {
    /// Trace file path, or several paths separated by `;`.
    pub trace_string: String,
    /// Number of unrolled instructions to simulate per workload.
    pub inst_sim: u64,

    /// Progress print frequency in compute cycles (0 disables).
    #[arg(long, default_value_t = 0)]
    pub print_progress: u64,

    /// With a single trace file, the number of clients sharing it.
    #[arg(long, default_value_t = 1)]
    pub ratemode: usize,

    /// Run the memory-access scheduler on the input traces first.
    #[arg(long)]
    pub jit: bool,

    /// M, G, or T (megaquop / gigaquop / teraquop): selects code
    /// distances and the factory configuration.
    #[arg(long, default_value = "T")]
    pub regime: String,

    /// Number of concurrently active clients.
    #[arg(short = 'c', long, default_value_t = 1)]
    pub concurrent_clients: usize,

    /// Number of active qubits in compute-local memory.
    #[arg(short = 'a', long, default_value_t = 12)]
    pub compute_local_memory_capacity: usize,

    /// Surface-code syndrome extraction round latency (ns).
    #[arg(long, default_value_t = 1200)]
    pub compute_syndrome_extraction_round_time_ns: u64,

    /// QLDPC-memory syndrome extraction round latency (ns).
    #[arg(long, default_value_t = 1300)]
    pub memory_syndrome_extraction_round_time_ns: u64,

    /// Max T-gate teleportations after the initial uop of a rotation.
    #[arg(long, default_value_t = 0)]
    pub t_teleport_limit: u64,

    /// Use auto-correction when applying teleported T gates.
    #[arg(long)]
    pub enable_t_autocorrect: bool,

    /// Enable rotation precomputation.
    #[arg(long)]
    pub rpc: bool,

    /// Rotation precomputation storage capacity.
    #[arg(long, default_value_t = 2)]
    pub rpc_capacity: usize,

    /// Watermark for rotation precomputation.
    #[arg(long, default_value_t = 0.5)]
    pub rpc_watermark: f64,

    /// Magic states stored in an L2 factory buffer.
    #[arg(long, default_value_t = 4)]
    pub factory_l2_buffer_capacity: usize,

    /// Physical qubits granted to the factory allocator.
    #[arg(short = 'f', long, default_value_t = 50_000)]
    pub factory_physical_qubit_budget: usize,

    /// Entanglement-distillation protocol family (protocol_0 ..
    /// protocol_5); omitted means no ED units.
    #[arg(long)]
    pub ed_protocol: Option<String>,

    /// Physical qubits granted to the ED allocator.
    #[arg(long, default_value_t = 50_000)]
    pub ed_physical_qubit_budget: usize,

    /// Fast-forward across provably idle stretches.
    #[arg(long)]
    pub fast_forward: bool,

    /* Bandwidth speed-of-light analysis knobs */
    #[arg(long)]
    pub bsol_elide_cliffords: bool,
    #[arg(long)]
    pub bsol_zero_latency_t: bool,
}

pub fn run(args: SimArgs, seed: u64) -> Result<()> {
    let knobs = SimKnobs {
        t_teleport_max: args.t_teleport_limit,
        t_autocorrect: args.enable_t_autocorrect,
        zero_latency_t: args.bsol_zero_latency_t,
        elide_cliffords: args.bsol_elide_cliffords,
        ..SimKnobs::default()
    };
    let mut rng = StdRng::seed_from_u64(seed);

    /* Trace list: split, replicate for ratemode, JIT-compile. */

    let mut traces: Vec<String> = args
        .trace_string
        .split(';')
        .map(str::to_string)
        .collect();
    if args.ratemode > 1 {
        if traces.len() > 1 {
            bail!("cannot have multiple input traces if ratemode > 1");
        }
        traces = vec![traces[0].clone(); args.ratemode];
    }
    if args.jit {
        let compiled = jit_compile(
            &traces[0],
            args.inst_sim,
            args.compute_local_memory_capacity,
        )?;
        for t in &mut traces {
            *t = compiled.clone();
        }
    }

    /* Regime: code distances and the first-level factory. */

    let round_ns = args.compute_syndrome_extraction_round_time_ns;
    let mut l1_spec = FactorySpec {
        is_cultivation: true,
        syndrome_extraction_round_time_ns: round_ns,
        buffer_capacity: 1,
        output_error_rate: 1e-6,
        escape_distance: 13,
        rounds: 18,
        probability_of_success: 0.2,
        ..FactorySpec::default()
    };
    let l2_spec = FactorySpec {
        is_cultivation: false,
        syndrome_extraction_round_time_ns: round_ns,
        buffer_capacity: args.factory_l2_buffer_capacity,
        output_error_rate: 1e-12,
        ..FactorySpec::default()
    };

    let (compute_code_distance, memory_code_distance) = match args.regime.as_str() {
        "M" => (11usize, 12usize),
        "G" => {
            l1_spec.output_error_rate = 1e-8;
            l1_spec.escape_distance = 15;
            l1_spec.rounds = 25;
            l1_spec.probability_of_success = 0.02;
            (17, 18)
        }
        "T" => (21, 24),
        other => bail!("unknown regime \"{other}\" (expected M, G, or T)"),
    };

    let factory_specs = if args.regime == "T" {
        vec![l1_spec, l2_spec]
    } else {
        vec![l1_spec]
    };
    let alloc = throughput_aware_allocation(
        args.factory_physical_qubit_budget,
        &factory_specs,
        &knobs,
    );
    if alloc.levels.last().is_none_or(|l| l.is_empty()) {
        bail!(
            "factory allocation failed: budget {} cannot fit one production chain",
            args.factory_physical_qubit_budget
        );
    }
    let factory_qubits = alloc.physical_qubit_count;
    let factory_throughput = alloc.estimated_throughput;
    let mut factories = Pipeline::new(alloc.levels);

    /* Memory subsystem: BB-code blocks holding everything that does not
     * fit in compute-local memory. */

    let total_qubits: u64 = traces
        .iter()
        .map(|t| Ok(TraceReader::open(t)?.qubit_count() as u64))
        .collect::<Result<Vec<u64>>>()?
        .iter()
        .sum();
    let main_memory_qubits =
        total_qubits.saturating_sub(args.compute_local_memory_capacity as u64) as usize;
    let block_capacity = bivariate_bicycle_code_logical_qubit_count(memory_code_distance);
    let num_blocks = main_memory_qubits.div_ceil(block_capacity.max(1));
    let m_freq_khz = compute_freq_khz(
        memory_code_distance as u64 * args.memory_syndrome_extraction_round_time_ns,
    );
    let blocks: Vec<Storage> = (0..num_blocks)
        .map(|_| {
            Storage::new(
                m_freq_khz,
                bivariate_bicycle_code_physical_qubit_count(memory_code_distance),
                block_capacity,
                memory_code_distance,
                1, // adapters
                2, // load latency
                1, // store latency
                knobs.max_cycles_with_no_progress,
            )
        })
        .collect();
    let mut memory = MemorySubsystem::new(blocks, 2);

    /* Entanglement distillation units. */

    let mut ed_units: Option<Pipeline> = match &args.ed_protocol {
        Some(name) => {
            let specs = protocols::by_name(name, round_ns, args.factory_l2_buffer_capacity)
                .with_context(|| format!("unknown ED protocol \"{name}\""))?;
            let ed_alloc: Allocation =
                throughput_aware_allocation(args.ed_physical_qubit_budget, &specs, &knobs);
            Some(Pipeline::new(ed_alloc.levels))
        }
        None => None,
    };

    /* Compute subsystem. */

    let c_freq_khz = compute_freq_khz(compute_code_distance as u64 * round_ns);
    let conf = ExtendedComputeConfig {
        rpc_enabled: args.rpc,
        rpc_freq_khz: compute_freq_khz((compute_code_distance as u64 - 4) * round_ns),
        rpc_capacity: args.rpc_capacity,
        rpc_watermark: args.rpc_watermark,
        ed_in_use: ed_units.is_some(),
    };
    let mut compute = ComputeSubsystem::new(
        c_freq_khz,
        &traces,
        compute_code_distance,
        args.compute_local_memory_capacity,
        args.concurrent_clients,
        args.inst_sim,
        conf,
        &mut memory,
        &knobs,
    )?;

    /* Clock coordination across every component. */

    {
        let mut clocks: Vec<&mut Clock> = vec![&mut compute.base.clock];
        if let Some(rs) = &mut compute.rotation {
            clocks.push(&mut rs.base.clock);
        }
        for s in memory.storages_mut() {
            clocks.push(&mut s.clock);
        }
        clocks.extend(factories.clocks_mut());
        if let Some(ed) = &mut ed_units {
            clocks.extend(ed.clocks_mut());
        }
        coordinate_clock_scale(&mut clocks);
    }

    println!(
        "simulation parameters:\n\tqubits in local memory = {}\n\tqubits in main memory \
         (blocks) = {main_memory_qubits} ({num_blocks})\n\tfactories by level = {:?}\n\tcompute \
         frequency = {c_freq_khz:.2} kHz",
        args.compute_local_memory_capacity,
        factories.levels.iter().map(Vec::len).collect::<Vec<_>>(),
    );

    /* Main simulation loop. */

    let wall_start = Instant::now();
    let mut last_print_cycle = 0u64;
    while !compute.done() {
        if args.print_progress > 0 {
            let cc = compute.base.clock.current_cycle();
            if cc >= last_print_cycle + args.print_progress {
                last_print_cycle = cc;
                print_progress(&compute, compute_code_distance, wall_start);
            }
        }

        compute.tick(factories.top_level_mut(), &mut memory, &knobs, &mut rng)?;
        compute.tick_rotation_subsystem(
            factories.top_level_mut(),
            &mut memory,
            &knobs,
            &mut rng,
        );
        memory.tick_storages();
        factories.tick(&knobs, &mut rng);
        if let Some(ed) = &mut ed_units {
            ed.tick(&knobs, &mut rng);
        }

        if args.fast_forward {
            if let Some(target) =
                compute.skip_to_cycle(factories.top_level(), ed_units.as_ref(), &memory)
            {
                let cc = compute.base.clock.current_cycle();
                if target > cc + 1 {
                    let t_ns = convert_cycles_to_time_ns(target, compute.base.clock.freq_khz);
                    fast_forward_all(&mut compute, &mut memory, &mut factories, &mut ed_units, t_ns);
                }
            }
        }
    }

    /* Final report. */

    let cc = compute.base.clock.current_cycle();
    println!("\nSIMULATION_STATS{}", "-".repeat(60));
    print_stat_line("TOTAL_CYCLES", cc);
    print_stat_line_f64("COMPUTE_FREQ_KHZ", c_freq_khz);
    print_stat_line_f64(
        "EXECUTION_TIME_MS",
        cc as f64 / c_freq_khz,
    );
    print_stat_line_f64("WALLTIME_S", wall_start.elapsed().as_secs_f64());

    for c in &compute.clients {
        println!("CLIENT_{}", c.id);
        print_indented_stat_line("VIRTUAL_INST_DONE", c.stats.inst_done);
        print_indented_stat_line("UNROLLED_INST_DONE", c.stats.unrolled_inst_done);
        print_indented_stat_line("T_GATES_DONE", c.stats.t_gates_done);
        print_indented_stat_line("MEMORY_ACCESSES", c.stats.memory_accesses);
        print_indented_stat_line("CYCLE_COMPLETE", c.stats.cycle_complete);
        print_stat_line_f64("\tIPC", stats::ipc(c.stats.unrolled_inst_done, cc));
        print_stat_line_f64(
            "\tIPdC",
            stats::ipdc(c.stats.unrolled_inst_done, cc, compute_code_distance),
        );
        print_stat_line_f64(
            "\tKIPS",
            stats::kips(c.stats.unrolled_inst_done, cc, c_freq_khz),
        );
    }

    for (level, producers) in factories.levels.iter().enumerate() {
        println!("FACTORY_L{}", level + 1);
        let attempts: u64 = producers.iter().map(|f| f.stats.production_attempts).sum();
        let failures: u64 = producers.iter().map(|f| f.stats.failures).sum();
        let consumed: u64 = producers.iter().map(|f| f.stats.consumed).sum();
        print_indented_stat_line("FACTORY_COUNT", producers.len());
        print_indented_stat_line("PROD_TRIES", attempts);
        print_indented_stat_line("FAILURES", failures);
        print_indented_stat_line("STATES_CONSUMED", consumed);
        print_stat_line_f64(
            "\tKILL_RATE",
            stats::mean(failures as f64, attempts as f64),
        );
    }

    print_stat_line("CONTEXT_SWITCHES", compute.stats.context_switches);
    print_stat_line("TOTAL_ROTATIONS", compute.stats.total_rotations);
    print_stat_line(
        "CYCLES_WITH_STALLS",
        compute.stall_monitor.cycles_with_stalls(),
    );
    for (name, t) in [
        ("MEMORY", StallType::Memory),
        ("MAGIC_STATE", StallType::MagicState),
        ("RPC", StallType::Rpc),
        ("EPR", StallType::Epr),
    ] {
        print_indented_stat_line(
            &format!("STALLS_{name}"),
            compute.stall_monitor.stalls_for(t),
        );
        print_indented_stat_line(
            &format!("ISOLATED_STALLS_{name}"),
            compute.stall_monitor.isolated_stalls_for(t),
        );
    }
    if compute.is_rpc_enabled() {
        print_stat_line("RPC_TOTAL", compute.stats.total_rpc);
        print_stat_line("RPC_SUCCESSFUL", compute.stats.successful_rpc);
        print_stat_line("RPC_STALL_CYCLES", compute.stats.cycles_with_rpc_stalls);
    }

    let compute_physical_qubits = surface_code_physical_qubit_count(compute_code_distance)
        * args.compute_local_memory_capacity;
    let memory_physical_qubits: usize = memory
        .storages()
        .iter()
        .map(|s| s.physical_qubit_count)
        .sum();
    print_stat_line("COMPUTE_PHYSICAL_QUBITS", compute_physical_qubits);
    print_stat_line("MEMORY_PHYSICAL_QUBITS", memory_physical_qubits);
    print_stat_line("FACTORY_PHYSICAL_QUBITS", factory_qubits);
    print_stat_line_f64(
        "T_BANDWIDTH_MAX_PER_CYCLE",
        factory_throughput / (1e3 * c_freq_khz),
    );
    print_stat_line_f64("T_BANDWIDTH_MAX_PER_S", factory_throughput);

    Ok(())
}

fn print_progress(compute: &ComputeSubsystem, code_distance: usize, wall_start: Instant) {
    let cc = compute.base.clock.current_cycle();
    println!(
        "cycle {cc} {} walltime = {:.1}s",
        "-".repeat(40),
        wall_start.elapsed().as_secs_f64()
    );
    for (i, c) in compute.clients.iter().enumerate() {
        let marker = if compute.active_clients().contains(&i) {
            '*'
        } else {
            ' '
        };
        println!(
            " {marker} client {}: inst = {}, IPC = {:.6}, IPdC = {:.6}",
            c.id,
            c.stats.unrolled_inst_done,
            stats::ipc(c.stats.unrolled_inst_done, cc),
            stats::ipdc(c.stats.unrolled_inst_done, cc, code_distance),
        );
    }
}

fn fast_forward_all(
    compute: &mut ComputeSubsystem,
    memory: &mut MemorySubsystem,
    factories: &mut Pipeline,
    ed_units: &mut Option<Pipeline>,
    t_ns: u64,
) {
    compute.base.clock.fast_forward_to_time_ns(t_ns);
    if let Some(rs) = &mut compute.rotation {
        rs.base.clock.fast_forward_to_time_ns(t_ns);
    }
    for s in memory.storages_mut() {
        s.clock.fast_forward_to_time_ns(t_ns);
    }
    for c in factories.clocks_mut() {
        c.fast_forward_to_time_ns(t_ns);
    }
    if let Some(ed) = ed_units {
        for c in ed.clocks_mut() {
            c.fast_forward_to_time_ns(t_ns);
        }
    }
}

/// Runs the memory-access scheduler over an uncompiled trace, placing the
/// result next to it under `jit/`.
fn jit_compile(trace: &str, inst_sim: u64, active_set_capacity: usize) -> Result<String> {
    let path = Path::new(trace);
    let dir = path.parent().unwrap_or(Path::new(".")).join("jit");
    std::fs::create_dir_all(&dir).context("creating jit directory")?;

    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let base = file_name.split(".gz").next().unwrap_or(&file_name);
    let base = base.split(".bin").next().unwrap_or(base);
    let compiled = dir.join(format!(
        "{base}_a{active_set_capacity}_{}M.gz",
        inst_sim / 1_000_000
    ));
    let compiled = compiled.to_string_lossy().into_owned();

    println!("(jit) running memory access scheduler for {trace} -> {compiled}");

    let config = SchedulerConfig {
        active_set_capacity: active_set_capacity as i64,
        inst_compile_limit: (5 * inst_sim) as i64,
        print_progress_frequency: 0,
        dag_inst_capacity: 100_000,
        hint_lookahead_depth: 256,
        ..SchedulerConfig::default()
    };
    let mut reader = TraceReader::open(trace)?;
    let mut writer = TraceWriter::create(&compiled, reader.qubit_count())?;
    scheduler::run(&mut reader, &mut writer, &Eif, &config)?;
    writer.finish()?;
    Ok(compiled)
}
