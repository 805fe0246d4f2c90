//! Throughput-aware producer allocation.
//!
//! Given a physical-qubit budget and an ordered list of per-level
//! specifications, the allocator greedily adds one producer at a time —
//! always at the topmost level whose addition still increases the
//! estimated end-to-end throughput — until no addition fits the budget or
//! helps. Estimated throughput of a multi-level allocation is the top
//! level's bandwidth scaled by `min(1, prev_bandwidth / consumption)`
//! cascaded up the levels, so accepted steps are monotone nondecreasing
//! in throughput by construction.
//!
//! The allocator is generic over a small capability trait instead of
//! virtual dispatch, keeping it monomorphizable per specification type.

use crate::estimation::{
    magic_state_cultivation_physical_qubit_count, magic_state_distillation_physical_qubit_count,
    surface_code_distance_for_target_logical_error_rate, surface_code_physical_qubit_count,
};
use crate::operable::compute_freq_khz;
use crate::production::Producer;
use qsim_common::knobs::SimKnobs;

/// What the allocator needs to know about one production level.
pub trait ProducerSpec {
    fn alloc(&self, knobs: &SimKnobs) -> Producer;
    fn qubit_cost(&self) -> usize;
    /// Production rate in states per second, assuming the previous level
    /// keeps up.
    fn bandwidth(&self, previous_level_throughput: f64) -> f64;
    /// Consumption rate in states per second, matched against the
    /// previous level's bandwidth.
    fn consumption_rate(&self) -> f64;
}

pub struct Allocation {
    /// Producers by level; index 0 is the first (lowest) level.
    pub levels: Vec<Vec<Producer>>,
    pub physical_qubit_count: usize,
    pub estimated_throughput: f64,
}

/// Estimated states-per-second of an allocation described by per-level
/// producer counts.
pub fn estimate_throughput<S: ProducerSpec>(specs: &[S], counts: &[usize]) -> f64 {
    let mut throughput = 0.0;
    for (i, spec) in specs.iter().enumerate() {
        let n = counts[i] as f64;
        if counts[i] == 0 {
            return 0.0;
        }
        let raw = n * spec.bandwidth(throughput);
        throughput = if i == 0 {
            raw
        } else {
            let consumption = n * spec.consumption_rate();
            raw * (throughput / consumption).min(1.0)
        };
    }
    throughput
}

pub fn throughput_aware_allocation<S: ProducerSpec>(
    budget: usize,
    specs: &[S],
    knobs: &SimKnobs,
) -> Allocation {
    // Bootstrap one producer per level: the cascade yields zero until the
    // chain is complete, so no single addition could otherwise get
    // accepted. A budget too small for the full chain allocates nothing.
    let chain_cost: usize = specs.iter().map(ProducerSpec::qubit_cost).sum();
    if specs.is_empty() || chain_cost > budget {
        return Allocation {
            levels: specs.iter().map(|_| Vec::new()).collect(),
            physical_qubit_count: 0,
            estimated_throughput: 0.0,
        };
    }
    let mut counts = vec![1usize; specs.len()];
    let mut used = chain_cost;
    let mut throughput = estimate_throughput(specs, &counts);

    loop {
        let mut accepted = None;
        for level in (0..specs.len()).rev() {
            if used + specs[level].qubit_cost() > budget {
                continue;
            }
            counts[level] += 1;
            let candidate = estimate_throughput(specs, &counts);
            counts[level] -= 1;
            if candidate > throughput {
                accepted = Some((level, candidate));
                break;
            }
        }
        match accepted {
            Some((level, candidate)) => {
                counts[level] += 1;
                used += specs[level].qubit_cost();
                throughput = candidate;
            }
            None => break,
        }
    }

    let levels = specs
        .iter()
        .zip(&counts)
        .map(|(spec, &n)| (0..n).map(|_| spec.alloc(knobs)).collect())
        .collect();
    Allocation {
        levels,
        physical_qubit_count: used,
        estimated_throughput: throughput,
    }
}

////////////////////////////////////////////////////////////
// Magic-state factory specifications
////////////////////////////////////////////////////////////

/// One level of magic-state production: cultivation or distillation.
#[derive(Clone, Debug)]
pub struct FactorySpec {
    pub is_cultivation: bool,

    pub syndrome_extraction_round_time_ns: u64,
    pub buffer_capacity: usize,
    pub output_error_rate: f64,

    /* Cultivation (defaults are d = 3 color-code cultivation) */
    pub escape_distance: usize,
    pub rounds: usize,
    pub probability_of_success: f64,

    /* Distillation (defaults are 15:1 with (dx, dz, dm) = (25, 11, 11)) */
    pub dx: usize,
    pub dz: usize,
    pub dm: usize,
    pub input_count: usize,
    pub output_count: usize,
    pub rotations: usize,
}

impl Default for FactorySpec {
    fn default() -> Self {
        Self {
            is_cultivation: false,
            syndrome_extraction_round_time_ns: 1200,
            buffer_capacity: 4,
            output_error_rate: 1e-12,
            escape_distance: 13,
            rounds: 25,
            probability_of_success: 0.2,
            dx: 25,
            dz: 11,
            dm: 11,
            input_count: 4,
            output_count: 1,
            rotations: 11,
        }
    }
}

impl FactorySpec {
    fn freq_khz(&self) -> f64 {
        if self.is_cultivation {
            compute_freq_khz(self.syndrome_extraction_round_time_ns)
        } else {
            // One protocol step spans dm syndrome-extraction rounds.
            compute_freq_khz(self.syndrome_extraction_round_time_ns * self.dm as u64)
        }
    }
}

impl ProducerSpec for FactorySpec {
    fn alloc(&self, knobs: &SimKnobs) -> Producer {
        if self.is_cultivation {
            Producer::cultivation(
                self.freq_khz(),
                self.output_error_rate,
                self.buffer_capacity,
                self.probability_of_success,
                self.rounds,
                knobs,
            )
        } else {
            Producer::distillation(
                self.freq_khz(),
                self.output_error_rate,
                self.buffer_capacity,
                self.input_count,
                self.output_count,
                self.rotations,
                knobs,
            )
        }
    }

    fn qubit_cost(&self) -> usize {
        let mut p = if self.is_cultivation {
            magic_state_cultivation_physical_qubit_count(self.escape_distance)
        } else {
            magic_state_distillation_physical_qubit_count(
                self.input_count,
                self.output_count,
                self.dx,
                self.dz,
            )
        };
        // Buffer slots beyond the output batch cost a patch each.
        let output_count = if self.is_cultivation { 1 } else { self.output_count };
        let d_buffer =
            surface_code_distance_for_target_logical_error_rate(self.output_error_rate, 1e-3);
        p += self.buffer_capacity.saturating_sub(output_count)
            * surface_code_physical_qubit_count(d_buffer);
        p
    }

    fn bandwidth(&self, _previous_level_throughput: f64) -> f64 {
        let freq_khz = compute_freq_khz(self.syndrome_extraction_round_time_ns);
        if self.is_cultivation {
            // On average a failed attempt dies midway through the
            // protocol.
            let mean_tries_until_success = 1.0 / self.probability_of_success;
            let failure_rounds = mean_tries_until_success * self.rounds as f64 * 0.5;
            (1e3 * freq_khz) / (self.rounds as f64 + failure_rounds)
        } else {
            let step_count = (self.rotations + 1) as f64;
            (1e3 * freq_khz * self.output_count as f64) / (self.dm as f64 * step_count)
        }
    }

    fn consumption_rate(&self) -> f64 {
        assert!(!self.is_cultivation, "cultivation consumes no magic states");
        let freq_khz = compute_freq_khz(self.syndrome_extraction_round_time_ns);
        let states_consumed = (self.input_count + self.rotations) as f64;
        let step_count = (self.rotations + 1) as f64;
        (1e3 * freq_khz * states_consumed) / (self.dm as f64 * step_count)
    }
}

////////////////////////////////////////////////////////////
// Entanglement-distillation specifications
////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct EdSpec {
    pub syndrome_extraction_round_time_ns: u64,
    pub buffer_capacity: usize,
    pub output_error_rate: f64,
    pub input_count: usize,
    pub output_count: usize,

    /// Parameters of the distilling code itself, not the underlying
    /// logical qubits.
    pub dx: usize,
    pub dz: usize,
}

impl Default for EdSpec {
    fn default() -> Self {
        // Distillation via a [[2, 1, 2]]_X code.
        Self {
            syndrome_extraction_round_time_ns: 1200,
            buffer_capacity: 1,
            output_error_rate: 1e-3,
            input_count: 2,
            output_count: 1,
            dx: 2,
            dz: 1,
        }
    }
}

impl EdSpec {
    fn measurement_distance(&self) -> usize {
        surface_code_distance_for_target_logical_error_rate(self.output_error_rate, 1e-3)
    }

    fn rounds_per_attempt(&self) -> f64 {
        (self.measurement_distance() * (self.input_count - self.output_count)) as f64
    }
}

impl ProducerSpec for EdSpec {
    fn alloc(&self, knobs: &SimKnobs) -> Producer {
        Producer::ent_distillation(
            compute_freq_khz(self.syndrome_extraction_round_time_ns),
            self.output_error_rate,
            self.buffer_capacity,
            self.input_count,
            self.output_count,
            self.measurement_distance() as u64,
            self.input_count - self.output_count,
            knobs,
        )
    }

    fn qubit_cost(&self) -> usize {
        let d_base = self.measurement_distance();
        let idx = (d_base / self.dx).max(1);
        let idz = (d_base / self.dz).max(1);
        let mut p = 2 * idx * idz * self.input_count;
        p += self.buffer_capacity.saturating_sub(self.output_count)
            * surface_code_physical_qubit_count(d_base);
        p
    }

    fn bandwidth(&self, _previous_level_throughput: f64) -> f64 {
        let freq_khz = compute_freq_khz(self.syndrome_extraction_round_time_ns);
        (1e3 * freq_khz * self.output_count as f64) / self.rounds_per_attempt()
    }

    fn consumption_rate(&self) -> f64 {
        let freq_khz = compute_freq_khz(self.syndrome_extraction_round_time_ns);
        (1e3 * freq_khz * self.input_count as f64) / self.rounds_per_attempt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_specs() -> Vec<FactorySpec> {
        vec![
            FactorySpec {
                is_cultivation: true,
                buffer_capacity: 1,
                output_error_rate: 1e-6,
                ..FactorySpec::default()
            },
            FactorySpec::default(),
        ]
    }

    #[test]
    fn allocation_respects_budget() {
        let knobs = SimKnobs::default();
        let specs = two_level_specs();
        let budget = 60_000;
        let alloc = throughput_aware_allocation(budget, &specs, &knobs);
        assert!(alloc.physical_qubit_count <= budget);
        assert!(alloc.estimated_throughput > 0.0);
        assert_eq!(alloc.levels.len(), 2);
        assert!(!alloc.levels[0].is_empty());
        assert!(!alloc.levels[1].is_empty());
    }

    #[test]
    fn throughput_is_monotone_in_budget() {
        let knobs = SimKnobs::default();
        let specs = two_level_specs();
        let mut last = 0.0;
        for budget in [0, 20_000, 40_000, 80_000, 160_000] {
            let alloc = throughput_aware_allocation(budget, &specs, &knobs);
            assert!(
                alloc.estimated_throughput >= last,
                "throughput regressed at budget {budget}"
            );
            last = alloc.estimated_throughput;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn tiny_budget_allocates_nothing() {
        let knobs = SimKnobs::default();
        let alloc = throughput_aware_allocation(10, &two_level_specs(), &knobs);
        assert_eq!(alloc.physical_qubit_count, 0);
        assert_eq!(alloc.estimated_throughput, 0.0);
        assert!(alloc.levels.iter().all(Vec::is_empty));
    }

    #[test]
    fn ed_allocation_balances_levels() {
        let knobs = SimKnobs::default();
        let specs = vec![
            EdSpec {
                output_error_rate: 3e-6,
                input_count: 17,
                output_count: 9,
                dx: 4,
                dz: 4,
                buffer_capacity: 9,
                ..EdSpec::default()
            },
            EdSpec {
                output_error_rate: 3e-13,
                input_count: 25,
                output_count: 18,
                dx: 3,
                dz: 3,
                buffer_capacity: 18,
                ..EdSpec::default()
            },
        ];
        let alloc = throughput_aware_allocation(100_000, &specs, &knobs);
        assert!(alloc.estimated_throughput > 0.0);
        assert!(!alloc.levels[0].is_empty());
    }
}
