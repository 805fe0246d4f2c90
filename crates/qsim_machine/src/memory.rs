//! The multi-storage memory subsystem.
//!
//! Owns every storage beyond the compute subsystem's local memory plus the
//! routing model connecting them. Loads must name a resident qubit
//! (anything else is a fatal lookup failure with a contents dump); stores
//! go to any storage with free capacity and a permitted route. Latencies
//! are translated into the caller's clock domain, and every successful
//! access locks the route for two storage cycles.

use crate::operable::convert_cycles_between_frequencies;
use crate::routing::{MultiChannelBus, RoutingModel};
use crate::storage::{AccessResult, Storage};
use qsim_common::ids::{Cycle, QubitKey};

pub struct MemorySubsystem {
    storages: Vec<Storage>,
    routing: Box<dyn RoutingModel>,
}

impl MemorySubsystem {
    pub fn new(storages: Vec<Storage>, num_channels: usize) -> Self {
        Self {
            storages,
            routing: Box::new(MultiChannelBus::new(num_channels)),
        }
    }

    pub fn storages(&self) -> &[Storage] {
        &self.storages
    }

    pub fn storages_mut(&mut self) -> &mut [Storage] {
        &mut self.storages
    }

    pub fn tick_storages(&mut self) {
        for s in &mut self.storages {
            s.tick();
        }
    }

    fn locate(&self, q: QubitKey) -> usize {
        match self.storages.iter().position(|s| s.contains(q)) {
            Some(idx) => idx,
            None => {
                let mut dump = String::new();
                for s in &self.storages {
                    dump.push_str(&format!("\n\t{} :", s.clock.name));
                    for x in s.contents() {
                        dump.push_str(&format!(" {x}"));
                    }
                }
                panic!("memory subsystem: qubit {q} not found in any storage{dump}");
            }
        }
    }

    fn handle_access_outcome(
        &mut self,
        mut result: AccessResult,
        storage_idx: usize,
        caller_current_cycle: Cycle,
        caller_freq_khz: f64,
    ) -> AccessResult {
        if result.success {
            let routing_cycles =
                convert_cycles_between_frequencies(2, result.storage_freq_khz, caller_freq_khz);
            result.latency = convert_cycles_between_frequencies(
                result.latency,
                result.storage_freq_khz,
                caller_freq_khz,
            );
            self.routing
                .lock_route_to(storage_idx, caller_current_cycle + routing_cycles);
        }
        result
    }

    /// Loads `q` out of whatever storage holds it. A missing qubit is
    /// fatal; a busy route or adapter is a transient failure.
    pub fn do_load(
        &mut self,
        q: QubitKey,
        caller_current_cycle: Cycle,
        caller_freq_khz: f64,
    ) -> AccessResult {
        let idx = self.locate(q);
        if !self.routing.can_route_to(idx, caller_current_cycle) {
            return AccessResult::default();
        }
        let result = self.storages[idx].do_load(q);
        self.handle_access_outcome(result, idx, caller_current_cycle, caller_freq_khz)
    }

    /// Stores `q` into the first storage with free capacity and a
    /// permitted route. Stores are off the critical path; callers normally
    /// only look at `success`.
    pub fn do_store(
        &mut self,
        q: QubitKey,
        caller_current_cycle: Cycle,
        caller_freq_khz: f64,
    ) -> AccessResult {
        let idx = (0..self.storages.len()).find(|&i| {
            self.storages[i].free_capacity() > 0
                && self.storages[i].has_free_adapter()
                && self.routing.can_route_to(i, caller_current_cycle)
        });
        match idx {
            Some(i) => {
                let result = self.storages[i].do_store(q);
                self.handle_access_outcome(result, i, caller_current_cycle, caller_freq_khz)
            }
            None => AccessResult::default(),
        }
    }

    /// Atomic combined access: loads `ld` and stores `st` through one
    /// adapter of `ld`'s storage.
    pub fn do_coupled_load_store(
        &mut self,
        ld: QubitKey,
        st: QubitKey,
        caller_current_cycle: Cycle,
        caller_freq_khz: f64,
    ) -> AccessResult {
        let idx = self.locate(ld);
        if !self.routing.can_route_to(idx, caller_current_cycle) {
            return AccessResult::default();
        }
        let result = self.storages[idx].do_coupled_load_store(ld, st);
        self.handle_access_outcome(result, idx, caller_current_cycle, caller_freq_khz)
    }

    /// Earliest cycle (in caller units) at which a load of `q` could be
    /// served: the later of the route's ready cycle and the storage's
    /// earliest free adapter.
    pub fn get_next_ready_cycle_for_load(&self, q: QubitKey, caller_freq_khz: f64) -> Cycle {
        let idx = self.locate(q);
        // Route locks are recorded in caller cycles already.
        let routing_free_cycle = self.routing.ready_cycle(idx);
        let storage_free_cycle = convert_cycles_between_frequencies(
            self.storages[idx].next_free_adapter_cycle(),
            self.storages[idx].clock.freq_khz,
            caller_freq_khz,
        );
        routing_free_cycle.max(storage_free_cycle)
    }
}
