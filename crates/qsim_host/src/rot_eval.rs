//! The `rot-eval` subcommand: drive the rotation manager over angle
//! regions and validate every synthesized sequence against the
//! state-simulation helper.

use crate::report::{print_stat_line, print_stat_line_f64};
use anyhow::Result;
use clap::Args;
use qsim_core::fixed_point::Fpa;
use qsim_core::manager;
use qsim_core::synthesis::validate_urotseq;

#[derive(Args)]
pub struct RotEvalArgs {
    /// Angles per region.
    #[arg(short = 'n', long, default_value_t = 64)]
    pub num_angles: usize,

    /// Number of synthesis threads.
    #[arg(short = 't', long, default_value_t = 8)]
    pub num_threads: usize,

    /// Synthesis precision exponent.
    #[arg(short = 'p', long, default_value_t = 1)]
    pub precision: i64,

    /// Number of angle regions over (0, 2*pi).
    #[arg(long, default_value_t = 8)]
    pub regions: usize,
}

pub fn run(args: RotEvalArgs) -> Result<()> {
    let total = args.regions * args.num_angles;
    println!(
        "rot-eval: {} regions, {} angles/region, {} total, {} threads",
        args.regions, args.num_angles, total, args.num_threads
    );

    manager::init(args.num_threads);

    let mut valid = 0u64;
    let mut total_gates = 0u64;
    let region_width = 2.0 * std::f64::consts::PI / args.regions as f64;
    for region in 0..args.regions {
        let lo = region as f64 * region_width;
        let angles: Vec<Fpa> = (0..args.num_angles)
            .map(|i| Fpa::from_angle(lo + (i as f64 + 0.5) * region_width / args.num_angles as f64))
            .collect();

        // Schedule the whole region up front, then retrieve and validate
        // each result as it completes.
        for a in &angles {
            manager::schedule(*a, args.precision);
        }
        for a in &angles {
            let seq = manager::find(*a, args.precision);
            total_gates += seq.len() as u64;
            if validate_urotseq(&seq, a, args.precision) {
                valid += 1;
            }
        }
        print!(".");
    }
    println!();
    manager::shutdown();

    print_stat_line("ANGLES_SYNTHESIZED", total);
    print_stat_line("ANGLES_VALID", valid);
    print_stat_line_f64("VALID_FRACTION", valid as f64 / total.max(1) as f64);
    print_stat_line_f64("MEAN_SEQUENCE_LENGTH", total_gates as f64 / total.max(1) as f64);
    Ok(())
}
