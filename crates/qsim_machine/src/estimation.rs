//! Physical-resource estimation formulas.
//!
//! Code-distance and qubit-count models for the rotated surface code and
//! the `[[12d, 12, d]]` bivariate-bicycle memory family, plus the factory
//! footprint estimates the throughput-aware allocator charges against its
//! budget.

/// `2d(d+1)`, counting the slack qubits surrounding the patch.
pub const fn surface_code_physical_qubit_count(d: usize) -> usize {
    2 * d * (d + 1)
}

pub const fn surface_code_physical_qubit_count_xz(dx: usize, dz: usize) -> usize {
    2 * dx * dz
}

pub fn surface_code_logical_error_rate(d: usize, p: f64) -> f64 {
    0.1 * (100.0 * p).powf(0.5 * (d as f64 + 1.0))
}

/// Smallest distance whose logical error rate undercuts `e` at physical
/// error rate `p`. Rounds down when the fractional part is small enough
/// to be floating-point noise.
pub fn surface_code_distance_for_target_logical_error_rate(e: f64, p: f64) -> usize {
    const ROUNDING_TOL: f64 = 0.3;

    let d = 2.0 * ((e.ln() - 0.1f64.ln()) / (100.0 * p).ln()) - 1.0;
    let d_out = if d - d.floor() < ROUNDING_TOL {
        d.floor()
    } else {
        d.ceil()
    };
    (d_out as usize).max(2)
}

/// Physical qubits of one `[[12d, 12, d]]` bivariate-bicycle block,
/// including the check qubits.
pub const fn bivariate_bicycle_code_physical_qubit_count(d: usize) -> usize {
    2 * 72 * (d / 6)
}

pub const fn bivariate_bicycle_code_logical_qubit_count(_d: usize) -> usize {
    12
}

/// Measured block error rates for the supported distances; anything else
/// is outside the calibrated range and fatal.
pub fn bivariate_bicycle_code_block_error_rate(d: usize) -> f64 {
    match d {
        6 => 7e-5,
        12 => 2e-7,
        18 => 2e-12,
        24 => 2e-17,
        _ => panic!("bivariate_bicycle_code_block_error_rate: unsupported distance {d}"),
    }
}

pub fn bivariate_bicycle_code_distance_for_target_block_error_rate(e: f64) -> usize {
    if e >= 7e-5 {
        6
    } else if e >= 2e-7 {
        12
    } else if e >= 2e-12 {
        18
    } else {
        24
    }
}

/// Footprint of a magic-state cultivation unit at its escape distance.
pub const fn magic_state_cultivation_physical_qubit_count(escape_distance: usize) -> usize {
    surface_code_physical_qubit_count(escape_distance)
}

/// Footprint of a distillation factory. Routing overhead is assumed to be
/// `(input_count + output_count) / 2` extra patches.
pub const fn magic_state_distillation_physical_qubit_count(
    input_count: usize,
    output_count: usize,
    dx: usize,
    dz: usize,
) -> usize {
    let patches = input_count + output_count + (input_count + output_count) / 2;
    surface_code_physical_qubit_count_xz(dx, dz) * patches
}
