//! Resource-state producers.
//!
//! A producer runs a protocol on its own clock and installs resource
//! states into a bounded buffer; consumers drain the buffer through
//! [`Producer::consume`] on their own clocks. Three protocols exist:
//! single-stage probabilistic T-cultivation, multi-step T-distillation
//! (consuming lower-fidelity magic states from the previous level), and
//! entanglement distillation over EPR pairs. Production failures are
//! silent stalls; consuming more than is buffered is a precondition
//! violation.

use crate::operable::{Clock, convert_cycles_between_frequencies};
use qsim_common::ids::Cycle;
use qsim_common::knobs::SimKnobs;
use rand::Rng;
use rand::rngs::StdRng;

#[derive(Clone, Copy, Debug, Default)]
pub struct ProducerStats {
    pub production_attempts: u64,
    pub failures: u64,
    pub consumed: u64,
}

enum Protocol {
    Cultivation {
        probability_of_success: f64,
        rounds: usize,
        step: usize,
        failure_round: Option<usize>,
    },
    Distillation {
        initial_input_count: usize,
        num_rotation_steps: usize,
        step: usize,
    },
    EntDistillation {
        num_checks: usize,
        measurement_distance: Cycle,
        step: usize,
        inputs_available: usize,
        error_probability: f64,
        cycle_available: Cycle,
    },
}

pub struct Producer {
    pub clock: Clock,
    pub output_error_probability: f64,
    pub buffer_capacity: usize,
    pub input_count: usize,
    pub output_count: usize,
    pub stats: ProducerStats,
    buffer_occupancy: usize,
    protocol: Protocol,
}

impl Producer {
    pub fn cultivation(
        freq_khz: f64,
        output_error_probability: f64,
        buffer_capacity: usize,
        probability_of_success: f64,
        rounds: usize,
        knobs: &SimKnobs,
    ) -> Self {
        let name = format!("C_p={}%", (100.0 * probability_of_success) as i64);
        Self::new(
            name,
            freq_khz,
            output_error_probability,
            buffer_capacity,
            0,
            1,
            Protocol::Cultivation {
                probability_of_success,
                rounds,
                step: 0,
                failure_round: None,
            },
            knobs,
        )
    }

    pub fn distillation(
        freq_khz: f64,
        output_error_probability: f64,
        buffer_capacity: usize,
        initial_input_count: usize,
        output_count: usize,
        num_rotation_steps: usize,
        knobs: &SimKnobs,
    ) -> Self {
        let name = format!("D_{}_{output_count}", initial_input_count + num_rotation_steps);
        Self::new(
            name,
            freq_khz,
            output_error_probability,
            buffer_capacity,
            initial_input_count,
            output_count,
            Protocol::Distillation {
                initial_input_count,
                num_rotation_steps,
                step: 0,
            },
            knobs,
        )
    }

    pub fn ent_distillation(
        freq_khz: f64,
        output_error_probability: f64,
        buffer_capacity: usize,
        input_count: usize,
        output_count: usize,
        measurement_distance: Cycle,
        num_checks: usize,
        knobs: &SimKnobs,
    ) -> Self {
        let name = format!("E_{input_count}_{output_count}");
        Self::new(
            name,
            freq_khz,
            output_error_probability,
            buffer_capacity,
            input_count,
            output_count,
            Protocol::EntDistillation {
                num_checks,
                measurement_distance,
                step: 0,
                inputs_available: 0,
                error_probability: 0.0,
                cycle_available: 0,
            },
            knobs,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        name: String,
        freq_khz: f64,
        output_error_probability: f64,
        buffer_capacity: usize,
        input_count: usize,
        output_count: usize,
        protocol: Protocol,
        knobs: &SimKnobs,
    ) -> Self {
        assert!(
            output_count <= buffer_capacity,
            "in instantiation of producer {name}: buffer capacity cannot hold all output \
             resource states"
        );
        Self {
            clock: Clock::new(name, freq_khz, knobs.max_cycles_with_no_progress),
            output_error_probability,
            buffer_capacity,
            input_count,
            output_count,
            stats: ProducerStats::default(),
            buffer_occupancy: 0,
            protocol,
        }
    }

    pub fn buffer_occupancy(&self) -> usize {
        self.buffer_occupancy
    }

    pub fn buffer_is_full(&self) -> bool {
        self.buffer_occupancy + self.output_count > self.buffer_capacity
    }

    /// Removes `count` resource states. The consumer's clock drives this;
    /// over-consumption is a precondition violation.
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.buffer_occupancy,
            "{}: consuming {count} of {} buffered states",
            self.clock.name,
            self.buffer_occupancy
        );
        self.buffer_occupancy -= count;
        self.stats.consumed += count as u64;
    }

    pub fn deadlock_info(&self) -> String {
        format!(
            "{}: buffer occupancy = {} of {}",
            self.clock.name, self.buffer_occupancy, self.buffer_capacity
        )
    }

    /// One tick of this producer's clock. `previous_level` is the producer
    /// list feeding this one; empty means a leaf (state injection).
    pub fn tick(&mut self, previous_level: &mut [Producer], knobs: &SimKnobs, rng: &mut StdRng) {
        if !self.clock.begin_tick() {
            return;
        }
        let progress = if self.buffer_is_full() || self.production_step(previous_level, knobs, rng)
        {
            1
        } else {
            0
        };
        if self.clock.finish_tick(progress) {
            panic!("{}: deadlock: {}", self.clock.name, self.deadlock_info());
        }
    }

    /// Advances the protocol by one cycle. Returns true if anything was
    /// attempted, failure included; false is a silent stall.
    fn production_step(
        &mut self,
        previous_level: &mut [Producer],
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> bool {
        let current_cycle = self.clock.current_cycle();
        match &mut self.protocol {
            Protocol::Cultivation {
                probability_of_success,
                rounds,
                step,
                failure_round,
            } => {
                if *step == 0 {
                    // The discard round is chosen up front when the attempt
                    // is slated to fail.
                    *failure_round = if rng.r#gen::<f64>() > *probability_of_success {
                        Some(rng.gen_range(0..*rounds))
                    } else {
                        None
                    };
                }
                if Some(*step) == *failure_round {
                    *step = 0;
                    self.stats.production_attempts += 1;
                    self.stats.failures += 1;
                } else {
                    *step += 1;
                    if *step == *rounds {
                        *step = 0;
                        self.stats.production_attempts += 1;
                        assert!(self.buffer_occupancy + self.output_count <= self.buffer_capacity);
                        self.buffer_occupancy += self.output_count;
                    }
                }
                true
            }

            Protocol::Distillation {
                initial_input_count,
                num_rotation_steps,
                step,
            } => {
                let mut needed = if *step == 0 { *initial_input_count } else { 1 };
                let p_sampled = rng.r#gen::<f64>();

                let mut p_error = 0.0;
                if previous_level.is_empty() {
                    // Leaf factory: inputs come from state injection.
                    p_error = 10.0 * knobs.physical_error_rate * needed as f64;
                } else {
                    let available: usize =
                        previous_level.iter().map(|f| f.buffer_occupancy()).sum();
                    if available < needed {
                        return false;
                    }
                    for f in previous_level.iter_mut() {
                        if f.buffer_occupancy() == 0 {
                            continue;
                        }
                        let count = f.buffer_occupancy().min(needed);
                        f.consume(count);
                        needed -= count;
                        p_error += f.output_error_probability * count as f64;
                        if needed == 0 {
                            break;
                        }
                    }
                }

                if p_sampled < p_error {
                    *step = 0;
                    self.stats.production_attempts += 1;
                    self.stats.failures += 1;
                } else {
                    *step += 1;
                    if *step == *num_rotation_steps + 1 {
                        *step = 0;
                        self.stats.production_attempts += 1;
                        assert!(self.buffer_occupancy + self.output_count <= self.buffer_capacity);
                        self.buffer_occupancy += self.output_count;
                    }
                }
                true
            }

            Protocol::EntDistillation {
                num_checks,
                measurement_distance,
                step,
                inputs_available,
                error_probability,
                cycle_available,
            } => {
                if current_cycle < *cycle_available {
                    return true;
                }

                if *step == *num_checks {
                    // Syndromes are only compared at the end of the
                    // protocol, so the accept/reject coin is flipped here.
                    self.stats.production_attempts += 1;
                    if rng.r#gen::<f64>() > *error_probability {
                        assert!(self.buffer_occupancy + self.output_count <= self.buffer_capacity);
                        self.buffer_occupancy += self.output_count;
                    } else {
                        self.stats.failures += 1;
                    }
                    *step = 0;
                    *inputs_available = 0;
                    *error_probability = 0.0;
                }

                if *step == 0 && previous_level.is_empty() {
                    *inputs_available = self.input_count;
                    *error_probability =
                        self.input_count as f64 * 10.0 * knobs.physical_error_rate;
                }

                if *step == 0 && *inputs_available < self.input_count {
                    while *inputs_available < self.input_count {
                        let Some(f) = previous_level.iter_mut().find(|f| f.buffer_occupancy() > 0)
                        else {
                            return false;
                        };
                        let count = f.buffer_occupancy().min(self.input_count - *inputs_available);
                        f.consume(count);
                        *error_probability += f.output_error_probability * count as f64;
                        *inputs_available += count;
                    }
                }

                if *inputs_available >= self.input_count {
                    *step += 1;
                    *cycle_available = current_cycle + *measurement_distance;
                }
                true
            }
        }
    }

    /// Earliest cycle (in this producer's domain) at which the protocol
    /// can advance, looking recursively through the previous levels.
    pub fn next_progression_cycle(&self, levels_below: &[Vec<Producer>]) -> Cycle {
        let next_avail_cycle = match &self.protocol {
            Protocol::EntDistillation { cycle_available, .. } => {
                (*cycle_available).max(self.clock.current_cycle() + 1)
            }
            _ => self.clock.current_cycle() + 1,
        };

        let waiting_for_inputs = match &self.protocol {
            Protocol::EntDistillation {
                step,
                inputs_available,
                ..
            } => *step == 0 && *inputs_available < self.input_count,
            Protocol::Distillation { .. } => true,
            Protocol::Cultivation { .. } => false,
        };
        let Some((prev, rest)) = levels_below.split_last() else {
            return next_avail_cycle;
        };
        if !waiting_for_inputs {
            return next_avail_cycle;
        }

        let mut any_have_available_state = false;
        let mut previous_level_avail_cycle = next_avail_cycle;
        for p in prev {
            let c = convert_cycles_between_frequencies(
                p.next_progression_cycle(rest),
                p.clock.freq_khz,
                self.clock.freq_khz,
            );
            previous_level_avail_cycle = previous_level_avail_cycle.min(c);
            any_have_available_state |= p.buffer_occupancy() > 0;
        }
        if any_have_available_state {
            next_avail_cycle
        } else {
            previous_level_avail_cycle
        }
    }
}

/// A tiered production pipeline. Index 0 is the first (lowest) level; the
/// last level is what consumers draw from.
pub struct Pipeline {
    pub levels: Vec<Vec<Producer>>,
}

impl Pipeline {
    pub fn new(levels: Vec<Vec<Producer>>) -> Self {
        Self { levels }
    }

    pub fn tick(&mut self, knobs: &SimKnobs, rng: &mut StdRng) {
        for i in 0..self.levels.len() {
            let (below, rest) = self.levels.split_at_mut(i);
            let prev: &mut [Producer] = match below.last_mut() {
                Some(level) => level,
                None => &mut [],
            };
            for p in &mut rest[0] {
                p.tick(prev, knobs, rng);
            }
        }
    }

    pub fn top_level(&self) -> &[Producer] {
        self.levels.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn top_level_mut(&mut self) -> &mut [Producer] {
        self.levels.last_mut().map(Vec::as_mut_slice).unwrap_or(&mut [])
    }

    pub fn clocks_mut(&mut self) -> Vec<&mut Clock> {
        self.levels
            .iter_mut()
            .flatten()
            .map(|p| &mut p.clock)
            .collect()
    }

    /// Minimum next-progression cycle across every producer, in each
    /// producer's own domain; the caller converts frequencies.
    pub fn min_next_progression_cycle_in(&self, caller_freq_khz: f64) -> Option<Cycle> {
        let mut min_cycle = None;
        for (i, level) in self.levels.iter().enumerate() {
            for p in level {
                let c = convert_cycles_between_frequencies(
                    p.next_progression_cycle(&self.levels[..i]),
                    p.clock.freq_khz,
                    caller_freq_khz,
                );
                min_cycle = Some(min_cycle.map_or(c, |m: Cycle| m.min(c)));
            }
        }
        min_cycle
    }
}

/// Total buffered states across a producer list.
pub fn count_available_states(producers: &[Producer]) -> usize {
    producers.iter().map(|p| p.buffer_occupancy()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn knobs() -> SimKnobs {
        SimKnobs::default()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn cultivation_fills_buffer_when_it_cannot_fail() {
        let k = knobs();
        let mut rng = rng();
        let mut c = Producer::cultivation(1000.0, 1e-6, 2, 1.0, 5, &k);
        // 5 rounds per state, capacity 2: after 10 operating cycles the
        // buffer holds 2 states and further ticks are full-buffer no-ops.
        for _ in 0..12 {
            c.tick(&mut [], &k, &mut rng);
        }
        assert_eq!(c.buffer_occupancy(), 2);
        assert_eq!(c.stats.production_attempts, 2);
        assert_eq!(c.stats.failures, 0);
    }

    #[test]
    fn cultivation_always_failing_never_produces() {
        let k = knobs();
        let mut rng = rng();
        let mut c = Producer::cultivation(1000.0, 1e-6, 2, 0.0, 5, &k);
        for _ in 0..100 {
            c.tick(&mut [], &k, &mut rng);
        }
        assert_eq!(c.buffer_occupancy(), 0);
        assert!(c.stats.failures > 0);
        assert_eq!(c.stats.failures, c.stats.production_attempts);
    }

    #[test]
    fn leaf_distillation_produces_from_injection() {
        let mut k = knobs();
        k.physical_error_rate = 0.0; // no sampled failures
        let mut rng = rng();
        let mut d = Producer::distillation(1000.0, 1e-12, 4, 4, 1, 11, &k);
        // 12 steps per output state.
        for _ in 0..12 {
            d.tick(&mut [], &k, &mut rng);
        }
        assert_eq!(d.buffer_occupancy(), 1);
    }

    #[test]
    fn distillation_stalls_without_inputs() {
        let mut k = knobs();
        k.max_cycles_with_no_progress = 1_000_000;
        let mut rng = rng();
        let mut lower = vec![Producer::cultivation(1000.0, 1e-6, 4, 0.0, 5, &k)];
        let mut d = Producer::distillation(1000.0, 1e-12, 4, 4, 1, 11, &k);
        for _ in 0..50 {
            let (a, b) = (&mut lower, &mut d);
            for f in a.iter_mut() {
                f.tick(&mut [], &k, &mut rng);
            }
            b.tick(a, &k, &mut rng);
        }
        // The lower level never succeeds, so the distiller never starts.
        assert_eq!(d.buffer_occupancy(), 0);
        assert_eq!(d.stats.production_attempts, 0);
    }

    #[test]
    fn distillation_consumes_previous_level() {
        let mut k = knobs();
        k.physical_error_rate = 0.0;
        let mut rng = rng();
        let mut lower = vec![Producer::cultivation(1000.0, 0.0, 16, 1.0, 1, &k)];
        let mut d = Producer::distillation(1000.0, 1e-12, 4, 4, 1, 3, &k);
        for _ in 0..40 {
            for f in lower.iter_mut() {
                f.tick(&mut [], &k, &mut rng);
            }
            d.tick(&mut lower, &k, &mut rng);
        }
        assert!(d.buffer_occupancy() > 0);
        assert!(lower[0].stats.consumed > 0);
    }

    #[test]
    #[should_panic(expected = "consuming")]
    fn overconsumption_is_fatal() {
        let k = knobs();
        let mut c = Producer::cultivation(1000.0, 1e-6, 2, 1.0, 5, &k);
        c.consume(1);
    }

    #[test]
    fn ent_distillation_accepts_with_zero_error() {
        let mut k = knobs();
        k.physical_error_rate = 0.0;
        let mut rng = rng();
        // 2 checks of 3 cycles each, leaf inputs.
        let mut e = Producer::ent_distillation(1000.0, 1e-9, 4, 2, 1, 3, 2, &k);
        for _ in 0..20 {
            e.tick(&mut [], &k, &mut rng);
        }
        assert!(e.buffer_occupancy() > 0);
        assert_eq!(e.stats.failures, 0);
    }

    #[test]
    fn pipeline_ticks_levels_bottom_up() {
        let mut k = knobs();
        k.physical_error_rate = 0.0;
        let mut rng = rng();
        let mut pipeline = Pipeline::new(vec![
            vec![Producer::cultivation(1000.0, 0.0, 16, 1.0, 1, &k)],
            vec![Producer::distillation(1000.0, 1e-12, 4, 2, 1, 2, &k)],
        ]);
        for _ in 0..60 {
            pipeline.tick(&k, &mut rng);
        }
        assert!(count_available_states(pipeline.top_level()) > 0);
    }
}
