//! The `build-lut` subcommand: batch rotation synthesis into a lookup
//! table file.

use anyhow::{Result, bail};
use clap::Args;
use qsim_core::fixed_point::Fpa;
use qsim_core::synthesis::synthesize_rotation;
use qsim_io::lut::{LutEntry, write_lut};
use rayon::prelude::*;

#[derive(Args)]
pub struct BuildLutArgs {
    /// Lower bound of the angle range (radians).
    pub lower_bound: f64,
    /// Upper bound of the angle range (radians).
    pub upper_bound: f64,
    /// Number of angles to generate.
    pub count: usize,
    /// Output file path (plain or .gz).
    pub output: String,

    /// Synthesis precision exponent; defaults per angle to
    /// ceil(-log10(|angle|)) + 1.
    #[arg(short = 'p', long)]
    pub precision: Option<i64>,
}

pub fn run(args: BuildLutArgs) -> Result<()> {
    if args.lower_bound < 0.0 && args.upper_bound > 0.0 {
        bail!("build-lut: angle range must not cross zero");
    }

    // Negative ranges synthesize as their positive mirror; the angle view
    // wraps them back below 2*pi.
    let negative = args.lower_bound < 0.0;
    let lo = args.lower_bound.abs().min(args.upper_bound.abs());
    let hi = args.lower_bound.abs().max(args.upper_bound.abs());

    // Increasing |angle| order keeps the output file sorted the way the
    // reader requires.
    let step = (hi - lo) / args.count.max(1) as f64;
    let angles: Vec<f64> = (0..args.count)
        .map(|i| {
            let a = lo + step * i as f64;
            if negative { -a } else { a }
        })
        .collect();

    let mut entries: Vec<LutEntry> = angles
        .par_iter()
        .map(|&a| {
            let p = args
                .precision
                .unwrap_or_else(|| (-(a.abs().max(1e-12)).log10()).ceil() as i64 + 1)
                .max(1);
            let angle = Fpa::from_angle(a);
            LutEntry {
                angle,
                urotseq: synthesize_rotation(&angle, p),
            }
        })
        .collect();
    entries.sort_by(|a, b| a.magnitude().total_cmp(&b.magnitude()));

    write_lut(&args.output, &entries)?;
    println!("build-lut: wrote {} entries to {}", entries.len(), args.output);
    Ok(())
}
