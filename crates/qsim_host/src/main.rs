#![feature(generic_const_exprs)]
#![allow(incomplete_features)]

mod bench;
mod lut;
mod report;
mod rot_eval;
mod schedule;
mod sim;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "qsim", about = "Fault-tolerant quantum machine simulator")]
struct Cli {
    /// Seed for every random choice in the process.
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cycle-level simulation over one or more trace files.
    Sim(sim::SimArgs),
    /// Run the memory-access scheduler over a trace.
    Schedule(schedule::ScheduleArgs),
    /// Generate a benchmark trace.
    Gen(bench::GenArgs),
    /// Build a rotation lookup table over an angle range.
    BuildLut(lut::BuildLutArgs),
    /// Exercise the rotation synthesis pipeline and validate its output.
    RotEval(rot_eval::RotEvalArgs),
    /// Print a trace file record by record.
    Dump {
        /// Trace file (plain or .gz).
        trace: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Sim(args) => sim::run(args, cli.seed),
        Commands::Schedule(args) => schedule::run(args),
        Commands::Gen(args) => bench::run(args, cli.seed),
        Commands::BuildLut(args) => lut::run(args),
        Commands::RotEval(args) => rot_eval::run(args),
        Commands::Dump { trace } => dump(&trace),
    }
}

fn dump(trace: &str) -> Result<()> {
    let mut reader = qsim_io::trace::TraceReader::open(trace)?;
    println!("num_qubits: {}", reader.qubit_count());
    let mut count = 0u64;
    let mut bytes = 4u64;
    while let Some((inst, consumed)) = reader.read_instruction()? {
        println!("{inst}");
        count += 1;
        bytes += consumed;
    }
    println!("{count} instructions, {bytes} bytes");
    Ok(())
}
