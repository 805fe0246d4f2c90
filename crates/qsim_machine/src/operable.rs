//! The clock core every simulated component embeds.
//!
//! The simulation is cycle-driven across heterogeneous clock domains. Each
//! component declares its frequency in kHz; the coordinator sets every
//! clock's scale to `max_freq / self_freq`. On each tick, a component
//! whose `leap` is below one operates and accumulates `leap` by the scale;
//! otherwise it sheds one unit of leap and idles. Fast components thus
//! operate on every tick and slow ones every ceil(scale)-th tick.
//!
//! `operate` reports a nonnegative progress count; a component reporting
//! zero progress for the configured number of consecutive cycles is
//! declared deadlocked, which aborts the simulation with a diagnostic
//! dump.

use qsim_common::ids::Cycle;

pub struct Clock {
    pub name: String,
    pub freq_khz: f64,
    current_cycle: Cycle,
    leap: f64,
    clock_scale: f64,
    cycles_with_no_progress: Cycle,
    max_cycles_with_no_progress: Cycle,
}

impl Clock {
    pub fn new(name: impl Into<String>, freq_khz: f64, max_cycles_with_no_progress: Cycle) -> Self {
        Self {
            name: name.into(),
            freq_khz,
            current_cycle: 0,
            leap: 0.0,
            clock_scale: 1.0,
            cycles_with_no_progress: 0,
            max_cycles_with_no_progress,
        }
    }

    pub fn current_cycle(&self) -> Cycle {
        self.current_cycle
    }

    /// Returns true when this tick should call `operate`. Otherwise the
    /// component idles and one unit of leap is shed.
    pub fn begin_tick(&mut self) -> bool {
        if self.leap < 1.0 {
            true
        } else {
            self.leap -= 1.0;
            false
        }
    }

    /// Books one executed cycle. Returns true when the component has hit
    /// its consecutive-zero-progress threshold; the caller must then dump
    /// its diagnostics and abort.
    #[must_use]
    pub fn finish_tick(&mut self, progress: i64) -> bool {
        let deadlocked = if progress == 0 {
            self.cycles_with_no_progress += 1;
            self.cycles_with_no_progress >= self.max_cycles_with_no_progress
        } else {
            self.cycles_with_no_progress = 0;
            false
        };
        self.leap += self.clock_scale;
        self.current_cycle += 1;
        deadlocked
    }

    pub fn set_scale_for_max_freq(&mut self, max_freq_khz: f64) {
        self.clock_scale = max_freq_khz / self.freq_khz;
    }

    /// Jumps this clock forward to the given wall-clock time; a no-op if
    /// the clock is already past it.
    pub fn fast_forward_to_time_ns(&mut self, t_ns: u64) {
        self.current_cycle = self.current_cycle.max(convert_time_ns_to_cycles(t_ns, self.freq_khz));
    }
}

/// Sets the clock scale of every clock relative to the fastest one.
pub fn coordinate_clock_scale(clocks: &mut [&mut Clock]) {
    let max_freq = clocks
        .iter()
        .map(|c| c.freq_khz)
        .fold(f64::MIN, f64::max);
    for c in clocks {
        c.set_scale_for_max_freq(max_freq);
    }
}

/// Frequency (kHz) of a component with the given period (ns).
pub fn compute_freq_khz(period_ns: u64) -> f64 {
    1.0e6 / period_ns as f64
}

/// Converts a cycle count between clock domains, rounding up.
pub fn convert_cycles_between_frequencies(c: Cycle, from_khz: f64, to_khz: f64) -> Cycle {
    (c as f64 * from_khz / to_khz).ceil() as Cycle
}

pub fn convert_cycles_to_time_ns(c: Cycle, freq_khz: f64) -> u64 {
    (c as f64 * 1.0e6 / freq_khz).ceil() as u64
}

pub fn convert_time_ns_to_cycles(t_ns: u64, freq_khz: f64) -> Cycle {
    (t_ns as f64 * freq_khz / 1.0e6) as Cycle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_helpers() {
        assert_eq!(compute_freq_khz(1000), 1000.0);
        assert_eq!(convert_cycles_between_frequencies(10, 1000.0, 500.0), 20);
        assert_eq!(convert_cycles_between_frequencies(10, 500.0, 1000.0), 5);
        // Rounding is always up.
        assert_eq!(convert_cycles_between_frequencies(3, 1000.0, 900.0), 4);
    }

    #[test]
    fn slow_clock_operates_every_other_tick() {
        let mut fast = Clock::new("fast", 1000.0, 100);
        let mut slow = Clock::new("slow", 500.0, 100);
        coordinate_clock_scale(&mut [&mut fast, &mut slow]);

        let mut fast_ops = 0;
        let mut slow_ops = 0;
        for _ in 0..100 {
            if fast.begin_tick() {
                fast_ops += 1;
                assert!(!fast.finish_tick(1));
            }
            if slow.begin_tick() {
                slow_ops += 1;
                assert!(!slow.finish_tick(1));
            }
        }
        assert_eq!(fast_ops, 100);
        assert_eq!(slow_ops, 50);
    }

    #[test]
    fn deadlock_threshold() {
        let mut c = Clock::new("stuck", 1000.0, 3);
        assert!(!c.finish_tick(0));
        assert!(!c.finish_tick(0));
        assert!(c.finish_tick(0));

        let mut c = Clock::new("ok", 1000.0, 3);
        assert!(!c.finish_tick(0));
        assert!(!c.finish_tick(1)); // progress resets the counter
        assert!(!c.finish_tick(0));
        assert!(!c.finish_tick(0));
        assert!(c.finish_tick(0));
    }

    #[test]
    fn fast_forward_never_rewinds() {
        let mut c = Clock::new("c", 1000.0, 100);
        c.fast_forward_to_time_ns(5_000_000); // 5 ms at 1 MHz = 5000 cycles
        assert_eq!(c.current_cycle(), 5000);
        c.fast_forward_to_time_ns(1_000_000);
        assert_eq!(c.current_cycle(), 5000);
    }
}
