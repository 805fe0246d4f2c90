//! The `gen` subcommand: benchmark trace generation.
//!
//! Three generators: the quantum Fourier transform, Shor's algorithm
//! (period finding by controlled modular multiplication, built from
//! Fourier-basis adders), and a seeded random Clifford+T+rotation mix for
//! smoke-testing the pipeline. Rotation instructions embed Clifford+T
//! sequences obtained through the rotation manager, deduplicated by
//! angle.

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use qsim_core::bigint::{self, BigInt};
use qsim_core::fixed_point::Fpa;
use qsim_core::instruction::Instruction;
use qsim_core::manager;
use qsim_common::ids::QubitId;
use qsim_common::opcode::Opcode;
use qsim_io::lut::{LutEntry, read_lut};
use qsim_io::trace::TraceWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::PI;

/// Key width for the Shor generator; products of half-width moduli fit
/// without truncation.
const SHOR_BITS: usize = 4096;
type ShorInt = BigInt<SHOR_BITS>;

#[derive(Args)]
pub struct GenArgs {
    /// Rotation lookup table: sequences come from the nearest-magnitude
    /// entry instead of fresh synthesis.
    #[arg(long, global = true)]
    pub lut: Option<String>,

    #[command(subcommand)]
    pub benchmark: Benchmark,
}

#[derive(Subcommand)]
pub enum Benchmark {
    /// Quantum Fourier transform over n qubits.
    Qft {
        #[arg(short, long)]
        qubits: usize,
        #[arg(short, long)]
        output: String,
        #[arg(short = 'p', long, default_value_t = 1)]
        precision: i64,
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
    },
    /// Shor period finding against a hex public key.
    Shor {
        /// The modulus to factor, as a hex string.
        key: String,
        #[arg(short, long)]
        output: String,
        #[arg(short = 'p', long, default_value_t = 1)]
        precision: i64,
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
    },
    /// Seeded random gate mix.
    Random {
        #[arg(short, long)]
        qubits: usize,
        #[arg(short = 'n', long)]
        count: usize,
        #[arg(short, long)]
        output: String,
        #[arg(short = 'p', long, default_value_t = 1)]
        precision: i64,
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
    },
}

pub fn run(args: GenArgs, seed: u64) -> Result<()> {
    let lut = match &args.lut {
        Some(path) => Some(read_lut(path)?),
        None => None,
    };
    let lut = lut.as_deref();

    match args.benchmark {
        Benchmark::Qft {
            qubits,
            output,
            precision,
            threads,
        } => {
            let mut prog = ProgramBuilder::new(qubits);
            prog.qft(0, qubits as QubitId, false);
            for q in 0..qubits as QubitId {
                prog.plain(Opcode::Mz, &[q]);
            }
            prog.write(&output, precision, threads, lut)
        }
        Benchmark::Shor {
            key,
            output,
            precision,
            threads,
        } => {
            let n = bigint::from_hex_string::<SHOR_BITS>(&key);
            let prog = build_shor_program(n, seed)?;
            prog.write(&output, precision, threads, lut)
        }
        Benchmark::Random {
            qubits,
            count,
            output,
            precision,
            threads,
        } => {
            let mut prog = ProgramBuilder::new(qubits);
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..count {
                let a = rng.gen_range(0..qubits as QubitId);
                match rng.gen_range(0..6) {
                    0 => prog.plain(Opcode::H, &[a]),
                    1 => prog.plain(Opcode::S, &[a]),
                    2 => prog.plain(Opcode::T, &[a]),
                    3 => prog.rotation(Opcode::Rz, a, rng.r#gen::<f64>() * 2.0 * PI),
                    4 => {
                        let b = distinct(&mut rng, qubits, &[a]);
                        prog.plain(Opcode::Cx, &[a, b]);
                    }
                    _ => {
                        if qubits < 3 {
                            prog.plain(Opcode::X, &[a]);
                        } else {
                            let b = distinct(&mut rng, qubits, &[a]);
                            let c = distinct(&mut rng, qubits, &[a, b]);
                            prog.plain(Opcode::Ccx, &[a, b, c]);
                        }
                    }
                }
            }
            prog.write(&output, precision, threads, lut)
        }
    }
}

/// The LUT entry closest to the target angle on the circle. Entries are
/// sorted by magnitude, so a binary search brackets the target; the
/// neighboring entries (which include the mirrored angle of the same
/// magnitude) are compared by actual angular distance.
fn lookup_nearest(entries: &[LutEntry], angle: &Fpa) -> Vec<Opcode> {
    let theta = angle.to_angle();
    let target_magnitude = theta.min(2.0 * PI - theta);
    let circle_dist = |a: f64, b: f64| {
        let d = (a - b).abs();
        d.min(2.0 * PI - d)
    };

    let split = entries.partition_point(|e| e.magnitude() < target_magnitude);
    let lo = split.saturating_sub(2);
    let hi = (split + 2).min(entries.len());
    entries[lo..hi]
        .iter()
        .min_by(|a, b| {
            circle_dist(a.angle.to_angle(), theta)
                .total_cmp(&circle_dist(b.angle.to_angle(), theta))
        })
        .map(|e| e.urotseq.clone())
        .unwrap_or_default()
}

fn distinct(rng: &mut StdRng, qubits: usize, taken: &[QubitId]) -> QubitId {
    loop {
        let q = rng.gen_range(0..qubits as QubitId);
        if !taken.contains(&q) {
            return q;
        }
    }
}

////////////////////////////////////////////////////////////
// Program builder
////////////////////////////////////////////////////////////

enum GateOp {
    Plain(Opcode, Vec<QubitId>),
    Rotation(Opcode, QubitId, f64),
}

/// Collects gates, then synthesizes every distinct rotation angle in one
/// batch through the rotation manager and writes the trace.
struct ProgramBuilder {
    num_qubits: usize,
    ops: Vec<GateOp>,
}

impl ProgramBuilder {
    fn new(num_qubits: usize) -> Self {
        Self {
            num_qubits,
            ops: Vec::new(),
        }
    }

    fn plain(&mut self, kind: Opcode, qubits: &[QubitId]) {
        self.ops.push(GateOp::Plain(kind, qubits.to_vec()));
    }

    fn rotation(&mut self, kind: Opcode, qubit: QubitId, theta: f64) {
        self.ops.push(GateOp::Rotation(kind, qubit, theta));
    }

    /// Controlled phase: `cp(theta)` on (control, target) decomposed into
    /// two CX and three RZ.
    fn cp(&mut self, theta: f64, control: QubitId, target: QubitId) {
        self.rotation(Opcode::Rz, control, theta / 2.0);
        self.rotation(Opcode::Rz, target, theta / 2.0);
        self.plain(Opcode::Cx, &[control, target]);
        self.rotation(Opcode::Rz, target, -theta / 2.0);
        self.plain(Opcode::Cx, &[control, target]);
    }

    /// Doubly-controlled phase via the controlled-phase halves.
    fn ccp(&mut self, theta: f64, c1: QubitId, c2: QubitId, target: QubitId) {
        self.cp(theta / 2.0, c2, target);
        self.plain(Opcode::Cx, &[c1, c2]);
        self.cp(-theta / 2.0, c2, target);
        self.plain(Opcode::Cx, &[c1, c2]);
        self.cp(theta / 2.0, c1, target);
    }

    /// QFT (or its inverse) over the register `[begin, end)`.
    fn qft(&mut self, begin: QubitId, end: QubitId, inverse: bool) {
        let sign = if inverse { -1.0 } else { 1.0 };
        let qubits: Vec<QubitId> = (begin..end).collect();
        for (i, &qi) in qubits.iter().enumerate() {
            self.plain(Opcode::H, &[qi]);
            for (j, &qj) in qubits.iter().enumerate().skip(i + 1) {
                let theta = sign * PI / 2f64.powi((j - i) as i32);
                self.cp(theta, qj, qi);
            }
        }
        for k in 0..qubits.len() / 2 {
            self.plain(Opcode::Swap, &[qubits[k], qubits[qubits.len() - 1 - k]]);
        }
    }

    fn write(
        &self,
        output: &str,
        precision: i64,
        threads: usize,
        lut: Option<&[LutEntry]>,
    ) -> Result<()> {
        // One sequence per distinct angle: from the lookup table when one
        // was supplied, otherwise synthesized through the manager (which
        // deduplicates concurrent requests; the cache deduplicates ours).
        let mut cache: HashMap<Fpa, Vec<Opcode>> = HashMap::new();
        match lut {
            Some(entries) => {
                for op in &self.ops {
                    if let GateOp::Rotation(_, _, theta) = op {
                        let fpa = Fpa::from_angle(*theta);
                        cache
                            .entry(fpa)
                            .or_insert_with(|| lookup_nearest(entries, &fpa));
                    }
                }
            }
            None => {
                manager::init(threads.max(1));
                for op in &self.ops {
                    if let GateOp::Rotation(_, _, theta) = op {
                        let fpa = Fpa::from_angle(*theta);
                        if !cache.contains_key(&fpa) {
                            cache.insert(fpa, Vec::new());
                            manager::schedule(fpa, precision);
                        }
                    }
                }
                for (fpa, seq) in cache.iter_mut() {
                    *seq = manager::find(*fpa, precision);
                }
                manager::shutdown();
            }
        }

        let mut writer = TraceWriter::create(output, self.num_qubits as u32)
            .with_context(|| format!("creating trace \"{output}\""))?;
        let mut records = 0u64;
        for op in &self.ops {
            let inst = match op {
                GateOp::Plain(kind, qubits) => Instruction::new(*kind, qubits),
                GateOp::Rotation(kind, qubit, theta) => {
                    let fpa = Fpa::from_angle(*theta);
                    Instruction::new_rotation(*kind, *qubit, fpa, cache[&fpa].clone())
                }
            };
            writer.write_instruction(&inst)?;
            records += 1;
        }
        writer.finish()?;
        println!("gen: wrote {records} instructions over {} qubits to {output}", self.num_qubits);
        Ok(())
    }
}

////////////////////////////////////////////////////////////
// Shor period finding
////////////////////////////////////////////////////////////

/// Builds the controlled-modular-exponentiation circuit for the given
/// modulus. Register layout: `2n` counting qubits, the `n`-qubit product
/// register, an `n+1`-qubit Fourier work register, and one comparison
/// ancilla.
fn build_shor_program(modulus: ShorInt, seed: u64) -> Result<ProgramBuilder> {
    let n = match modulus.msb() {
        Some(m) => m + 1,
        None => bail!("shor: modulus is zero"),
    };
    if bigint::cmp(&modulus, &ShorInt::from_word(3)) == std::cmp::Ordering::Less {
        bail!("shor: modulus must be at least 3");
    }
    if 2 * n > SHOR_BITS / 2 {
        bail!("shor: modulus too wide ({n} bits)");
    }

    // A random base coprime to the modulus.
    let mut rng = StdRng::seed_from_u64(seed);
    let base = loop {
        let candidate = ShorInt::from_word(rng.gen_range(2..u64::MAX));
        let (_, r) = bigint::divrem(candidate, modulus);
        if !r.is_zero() && gcd(r, modulus) == ShorInt::from_word(1) {
            break r;
        }
    };

    let counting = 2 * n;
    let x0 = counting as QubitId; // product register
    let b0 = x0 + n as QubitId; // Fourier work register (n + 1 qubits)
    let anc = b0 + (n + 1) as QubitId;
    let total = anc + 1;

    let mut prog = ProgramBuilder::new(total as usize);

    // |1> in the product register, superposition over the counting
    // register.
    prog.plain(Opcode::X, &[x0]);
    for c in 0..counting as QubitId {
        prog.plain(Opcode::H, &[c]);
    }

    let mut a_j = base;
    for j in 0..counting {
        let a_inv = modinv(a_j, modulus)
            .with_context(|| format!("base power 2^{j} is not invertible"))?;
        prog.cunitary(j as QubitId, x0, b0, anc, n, a_j, a_inv, modulus);
        a_j = modmul(a_j, a_j, modulus);
    }

    prog.qft(0, counting as QubitId, true);
    for c in 0..counting as QubitId {
        prog.plain(Opcode::Mz, &[c]);
    }
    Ok(prog)
}

impl ProgramBuilder {
    /// Adds `a` to the Fourier-transformed register starting at `b0`
    /// (`width` qubits), optionally controlled.
    fn fourier_adder(
        &mut self,
        controls: &[QubitId],
        b0: QubitId,
        width: usize,
        a: ShorInt,
        invert: bool,
    ) {
        let sign = if invert { -1.0 } else { 1.0 };
        for k in 0..width {
            let theta = sign * 2.0 * PI * fourier_fraction(&a, k);
            if theta == 0.0 {
                continue;
            }
            let target = b0 + k as QubitId;
            match controls {
                [] => self.rotation(Opcode::Rz, target, theta),
                [c] => self.cp(theta, *c, target),
                [c1, c2] => self.ccp(theta, *c1, *c2, target),
                _ => unreachable!("at most two controls"),
            }
        }
    }

    /// Doubly-controlled modular addition of `a` into the Fourier-basis
    /// register, using the comparison ancilla to absorb overflow.
    #[allow(clippy::too_many_arguments)]
    fn mod_adder(
        &mut self,
        c1: QubitId,
        c2: QubitId,
        b0: QubitId,
        width: usize,
        anc: QubitId,
        a: ShorInt,
        modulus: ShorInt,
    ) {
        let msb = b0 + (width - 1) as QubitId;

        self.fourier_adder(&[c1, c2], b0, width, a, false);
        self.fourier_adder(&[], b0, width, modulus, true);
        self.qft(b0, b0 + width as QubitId, true);
        self.plain(Opcode::Cx, &[msb, anc]);
        self.qft(b0, b0 + width as QubitId, false);
        self.fourier_adder(&[anc], b0, width, modulus, false);
        self.fourier_adder(&[c1, c2], b0, width, a, true);
        self.qft(b0, b0 + width as QubitId, true);
        self.plain(Opcode::X, &[msb]);
        self.plain(Opcode::Cx, &[msb, anc]);
        self.plain(Opcode::X, &[msb]);
        self.qft(b0, b0 + width as QubitId, false);
        self.fourier_adder(&[c1, c2], b0, width, a, false);
    }

    /// Controlled multiplication of the product register by `a` mod the
    /// modulus, accumulating through the Fourier work register.
    #[allow(clippy::too_many_arguments)]
    fn cmul(
        &mut self,
        control: QubitId,
        x0: QubitId,
        b0: QubitId,
        anc: QubitId,
        n: usize,
        a: ShorInt,
        modulus: ShorInt,
        invert: bool,
    ) {
        let width = n + 1;
        self.qft(b0, b0 + width as QubitId, false);
        let mut shifted = a;
        for i in 0..n {
            let addend = if invert {
                modulus.wrapping_sub(shifted)
            } else {
                shifted
            };
            self.mod_adder(control, x0 + i as QubitId, b0, width, anc, addend, modulus);
            shifted = modmul(shifted, ShorInt::from_word(2), modulus);
        }
        self.qft(b0, b0 + width as QubitId, true);
    }

    /// One controlled-U step: multiply, swap the registers, un-multiply by
    /// the inverse.
    #[allow(clippy::too_many_arguments)]
    fn cunitary(
        &mut self,
        control: QubitId,
        x0: QubitId,
        b0: QubitId,
        anc: QubitId,
        n: usize,
        a: ShorInt,
        a_inv: ShorInt,
        modulus: ShorInt,
    ) {
        self.cmul(control, x0, b0, anc, n, a, modulus, false);
        // Controlled register swap via CX conjugation.
        for i in 0..n {
            let (xq, bq) = (x0 + i as QubitId, b0 + i as QubitId);
            self.plain(Opcode::Cx, &[bq, xq]);
            self.plain(Opcode::Ccx, &[control, xq, bq]);
            self.plain(Opcode::Cx, &[bq, xq]);
        }
        self.cmul(control, x0, b0, anc, n, a_inv, modulus, true);
    }
}

/// `(a mod 2^(k+1)) / 2^(k+1)`, the phase fraction of Fourier-adder
/// qubit `k`.
fn fourier_fraction(a: &ShorInt, k: usize) -> f64 {
    let mut frac = 0.0f64;
    for (i, &w) in a.words().iter().enumerate() {
        let lo = i * 64;
        if lo > k {
            break;
        }
        // Mask off bits above k within this word.
        let w = if k - lo >= 63 {
            w
        } else {
            w & ((1u64 << (k - lo + 1)) - 1)
        };
        frac += w as f64 * 2f64.powi(lo as i32 - (k as i32 + 1));
    }
    frac
}

fn modmul(a: ShorInt, b: ShorInt, n: ShorInt) -> ShorInt {
    bigint::divrem(bigint::mul(a, b), n).1
}

fn gcd(mut a: ShorInt, mut b: ShorInt) -> ShorInt {
    while !b.is_zero() {
        let (_, r) = bigint::divrem(a, b);
        a = b;
        b = r;
    }
    a
}

/// Modular inverse by the extended Euclidean algorithm, tracking
/// coefficient signs explicitly since the word arrays are unsigned.
fn modinv(a: ShorInt, n: ShorInt) -> Option<ShorInt> {
    let (mut old_r, mut r) = (a, n);
    // (magnitude, is_negative)
    let (mut old_t, mut t) = ((ShorInt::from_word(1), false), (ShorInt::zero(), false));

    while !r.is_zero() {
        let (q, rem) = bigint::divrem(old_r, r);
        old_r = r;
        r = rem;

        // new_t = old_t - q * t
        let qt = bigint::mul(q, t.0);
        let new_t = signed_sub(old_t, (qt, t.1));
        old_t = t;
        t = new_t;
    }

    if old_r != ShorInt::from_word(1) {
        return None;
    }
    let (mag, neg) = old_t;
    let (_, mag) = bigint::divrem(mag, n);
    Some(if neg && !mag.is_zero() {
        n.wrapping_sub(mag)
    } else {
        mag
    })
}

fn signed_sub(a: (ShorInt, bool), b: (ShorInt, bool)) -> (ShorInt, bool) {
    match (a.1, b.1) {
        // a - (-b) = a + b; -a - b = -(a + b)
        (false, true) => (a.0.wrapping_add(b.0), false),
        (true, false) => (a.0.wrapping_add(b.0), true),
        // Same sign: the larger magnitude wins.
        (an, _) => {
            if bigint::cmp(&a.0, &b.0) == std::cmp::Ordering::Less {
                (b.0.wrapping_sub(a.0), !an)
            } else {
                (a.0.wrapping_sub(b.0), an)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(v: u64) -> ShorInt {
        ShorInt::from_word(v)
    }

    #[test]
    fn modular_inverse() {
        let n = word(15);
        for a in [2u64, 4, 7, 8, 11, 13] {
            let inv = modinv(word(a), n).unwrap();
            assert_eq!(modmul(word(a), inv, n), word(1), "a = {a}");
        }
        assert!(modinv(word(3), n).is_none());
        assert!(modinv(word(5), n).is_none());
    }

    #[test]
    fn fourier_fractions() {
        let a = word(0b1011);
        // k = 0: (a mod 2) / 2 = 1/2.
        assert_eq!(fourier_fraction(&a, 0), 0.5);
        // k = 2: (a mod 8) / 8 = 3/8.
        assert_eq!(fourier_fraction(&a, 2), 0.375);
        // k = 70: a / 2^71, tiny but nonzero.
        assert!(fourier_fraction(&a, 70) > 0.0);
    }

    #[test]
    fn qft_gate_counts() {
        let mut prog = ProgramBuilder::new(4);
        prog.qft(0, 4, false);
        let h = prog
            .ops
            .iter()
            .filter(|op| matches!(op, GateOp::Plain(Opcode::H, _)))
            .count();
        let swaps = prog
            .ops
            .iter()
            .filter(|op| matches!(op, GateOp::Plain(Opcode::Swap, _)))
            .count();
        assert_eq!(h, 4);
        assert_eq!(swaps, 2);
        // 6 controlled phases, 5 gates each.
        assert_eq!(prog.ops.len(), 4 + 2 + 6 * 5);
    }

    #[test]
    fn lut_lookup_prefers_the_right_sign() {
        let entries = vec![
            LutEntry {
                angle: Fpa::from_angle(0.1),
                urotseq: vec![Opcode::T],
            },
            LutEntry {
                angle: Fpa::from_angle(2.0 * PI - 0.11),
                urotseq: vec![Opcode::Tdg],
            },
            LutEntry {
                angle: Fpa::from_angle(1.0),
                urotseq: vec![Opcode::S],
            },
        ];
        let near = |theta: f64| lookup_nearest(&entries, &Fpa::from_angle(theta));
        assert_eq!(near(2.0 * PI - 0.1), vec![Opcode::Tdg]);
        assert_eq!(near(0.12), vec![Opcode::T]);
        assert_eq!(near(1.2), vec![Opcode::S]);
    }

    #[test]
    fn shor_register_layout_is_wide_enough() {
        let prog = build_shor_program(word(15), 1).unwrap();
        // n = 4: 8 counting + 4 product + 5 work + 1 ancilla.
        assert_eq!(prog.num_qubits, 18);
        assert!(!prog.ops.is_empty());
    }
}
