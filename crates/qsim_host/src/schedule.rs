//! The `schedule` subcommand: trace-to-trace memory-access scheduling.

use crate::report::{print_stat_line, print_stat_line_f64};
use anyhow::{Context, Result, bail};
use clap::Args;
use qsim_compiler::policy::{Eif, Hint};
use qsim_compiler::scheduler::{self, SchedulerConfig};
use qsim_io::trace::{TraceReader, TraceWriter};
use std::time::Instant;

#[derive(Args)]
pub struct ScheduleArgs {
    /// The trace file (without memory instructions) to compile.
    pub input_file: String,
    /// The output trace file path.
    pub output_file: String,

    /// Number of program qubits in the active set.
    #[arg(short = 'c', long, default_value_t = 12)]
    pub active_set_capacity: i64,

    /// Number of instructions to compile.
    #[arg(short = 'i', long, default_value_t = 15_000_000)]
    pub inst_limit: i64,

    /// Progress print frequency (instructions).
    #[arg(long, default_value_t = 1_000_000)]
    pub print_progress: i64,

    /// DAG instruction capacity.
    #[arg(long, default_value_t = 8192)]
    pub dag_capacity: i64,

    /// Scheduler policy (0 = EIF, 1 = HINT).
    #[arg(short = 's', long, default_value_t = 0)]
    pub scheduler: i64,

    /* HINT parameters */
    /// HINT lookahead depth (layers).
    #[arg(long, default_value_t = 16)]
    pub hint_lookahead_depth: i64,

    /// Comma-separated active-set capacities to sweep; each run writes
    /// `<output>_a<capacity>` and reports one stat block.
    #[arg(long)]
    pub sweep_capacities: Option<String>,
}

pub fn run(args: ScheduleArgs) -> Result<()> {
    let capacities: Vec<i64> = match &args.sweep_capacities {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().parse().with_context(|| format!("bad capacity \"{s}\"")))
            .collect::<Result<_>>()?,
        None => vec![args.active_set_capacity],
    };

    for capacity in capacities {
        let config = SchedulerConfig {
            active_set_capacity: capacity,
            inst_compile_limit: args.inst_limit,
            print_progress_frequency: args.print_progress,
            dag_inst_capacity: args.dag_capacity,
            verbose: false,
            hint_lookahead_depth: args.hint_lookahead_depth,
        };
        let output = if args.sweep_capacities.is_some() {
            format!("{}_a{capacity}", args.output_file)
        } else {
            args.output_file.clone()
        };
        run_one(&args, &config, &output)?;
    }
    Ok(())
}

fn run_one(args: &ScheduleArgs, config: &SchedulerConfig, output: &str) -> Result<()> {
    let mut reader = TraceReader::open(&args.input_file)?;
    let mut writer = TraceWriter::create(output, reader.qubit_count())?;

    let start = Instant::now();
    let stats = match args.scheduler {
        0 => scheduler::run(&mut reader, &mut writer, &Eif, config)?,
        1 => scheduler::run(&mut reader, &mut writer, &Hint, config)?,
        id => bail!("unknown memory scheduler id: {id}"),
    };
    writer.finish()?;
    let elapsed = start.elapsed().as_secs_f64();

    let compute_intensity = stats.unrolled_inst_done as f64 / stats.memory_accesses.max(1) as f64;
    let mean_unused_bw =
        stats.total_unused_bandwidth as f64 / stats.scheduler_epochs.max(1) as f64;

    print_stat_line("ACTIVE_SET_CAPACITY", config.active_set_capacity);
    print_stat_line("INST_DONE", stats.unrolled_inst_done);
    print_stat_line("MEMORY_ACCESSES", stats.memory_accesses);
    print_stat_line("SCHEDULING_EPOCHS", stats.scheduler_epochs);
    print_stat_line_f64("COMPUTE_INTENSITY", compute_intensity);
    print_stat_line_f64("MEAN_UNUSED_BANDWIDTH", mean_unused_bw);
    print_stat_line_f64("COMPILATION_TIME_SECONDS", elapsed);
    Ok(())
}
