//! The multi-client compute subsystem.
//!
//! Owns the clients, the active/inactive window, the context-switch
//! machinery, and the rotation precompute subsystem. Each operating cycle
//! it drains pending context-switch memory accesses first, then fetches
//! ready front-layer instructions from the active clients starting at a
//! rotating index so no client is starved, dispatching through the shared
//! compute base and retiring into per-client statistics.

use crate::client::Client;
use crate::compute::{ComputeBase, ExecResult, Operand};
use crate::memory::MemorySubsystem;
use crate::production::{Pipeline, Producer, count_available_states};
use crate::rotation::RotationSubsystem;
use crate::storage::{Storage, storage_striped_initialization};
use anyhow::Result;
use qsim_core::dag::NodeId;
use qsim_common::ids::{Cycle, QubitId, QubitKey};
use qsim_common::knobs::SimKnobs;
use qsim_common::opcode::Opcode;
use rand::Rng;
use rand::rngs::StdRng;
use std::collections::VecDeque;

const RPC_DAG_LOOKAHEAD_START_LAYER: usize = 0;
const RPC_DAG_LOOKAHEAD_DEPTH: usize = 16;

/// How many instructions each client keeps buffered in its DAG.
const CLIENT_DAG_CAPACITY: usize = 1024;

/// Optional capabilities of the compute subsystem.
#[derive(Clone, Debug)]
pub struct ExtendedComputeConfig {
    pub rpc_enabled: bool,
    /// Rotation-subsystem frequency; zero inherits the compute frequency.
    pub rpc_freq_khz: f64,
    pub rpc_capacity: usize,
    pub rpc_watermark: f64,
    /// Entanglement distillation feeds the memory fabric; affects stall
    /// attribution and skip-to-cycle bounds.
    pub ed_in_use: bool,
}

impl Default for ExtendedComputeConfig {
    fn default() -> Self {
        Self {
            rpc_enabled: false,
            rpc_freq_khz: 0.0,
            rpc_capacity: 2,
            rpc_watermark: 0.5,
            ed_in_use: false,
        }
    }
}

/// Saved program state of a descheduled client.
#[derive(Clone, Debug, Default)]
pub struct ClientContext {
    pub active_qubits: Vec<QubitKey>,
    pub cycle_saved: Cycle,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SubsystemStats {
    pub context_switches: u64,
    pub total_rotations: u64,
    pub successful_rpc: u64,
    pub total_rpc: u64,
    pub cycles_with_rpc_stalls: u64,
    pub magic_states_produced_sum: u64,
}

/// Where the compute subsystem stalled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallType {
    Memory = 0,
    MagicState = 1,
    Rpc = 2,
    Epr = 3,
}

/// Per-cycle stall attribution: which stall kinds occurred each cycle,
/// and how often a cycle stalled on exactly one kind.
#[derive(Clone, Copy, Debug, Default)]
pub struct StallMonitor {
    counts: [u64; 4],
    isolated: [u64; 4],
    cycles_with_stalls: u64,
    flags: u8,
}

impl StallMonitor {
    pub fn flag(&mut self, t: StallType) {
        self.flags |= 1 << (t as u8);
    }

    pub fn end_cycle(&mut self) {
        if self.flags != 0 {
            self.cycles_with_stalls += 1;
            for i in 0..4 {
                if self.flags & (1 << i) != 0 {
                    self.counts[i] += 1;
                }
            }
            if self.flags.count_ones() == 1 {
                self.isolated[self.flags.trailing_zeros() as usize] += 1;
            }
        }
        self.flags = 0;
    }

    pub fn stalls_for(&self, t: StallType) -> u64 {
        self.counts[t as usize]
    }

    pub fn isolated_stalls_for(&self, t: StallType) -> u64 {
        self.isolated[t as usize]
    }

    pub fn cycles_with_stalls(&self) -> u64 {
        self.cycles_with_stalls
    }
}

pub struct ComputeSubsystem {
    pub base: ComputeBase,
    pub clients: Vec<Client>,
    pub rotation: Option<RotationSubsystem>,
    pub concurrent_clients: usize,
    pub simulation_instructions: u64,
    pub stats: SubsystemStats,
    pub stall_monitor: StallMonitor,
    ed_in_use: bool,
    active: Vec<usize>,
    inactive: VecDeque<usize>,
    last_used_client_idx: usize,
    contexts: Vec<ClientContext>,
    /// Memory accesses owed to an in-flight context switch; drained with
    /// priority over normal dispatch.
    ctx_switch_buffer: Vec<(QubitKey, QubitKey)>,
    magic_states_avail_last_cycle: usize,
    had_rpc_stall_this_cycle: bool,
}

impl ComputeSubsystem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        freq_khz: f64,
        client_trace_files: &[String],
        code_distance: usize,
        local_memory_capacity: usize,
        concurrent_clients: usize,
        simulation_instructions: u64,
        conf: ExtendedComputeConfig,
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
    ) -> Result<Self> {
        assert!(
            client_trace_files.len() >= concurrent_clients,
            "more concurrent clients than trace files"
        );

        let mut base = ComputeBase::new(
            "compute_subsystem",
            freq_khz,
            code_distance,
            local_memory_capacity,
            knobs,
        );

        let mut clients = Vec::with_capacity(client_trace_files.len());
        for (i, trace) in client_trace_files.iter().enumerate() {
            clients.push(Client::open(trace, i as i8)?);
        }
        let total = clients.len();
        let active: Vec<usize> = (0..concurrent_clients).collect();
        let inactive: VecDeque<usize> = (concurrent_clients..total).collect();

        // Stripe all qubits over local memory (active clients only) and
        // the rest of the hierarchy.
        let qubits_by_client: Vec<Vec<QubitKey>> =
            clients.iter().map(|c| c.qubit_keys()).collect();
        {
            let mut storages: Vec<&mut Storage> = vec![&mut base.local_memory];
            storages.extend(memory.storages_mut().iter_mut());
            storage_striped_initialization(&mut storages, &qubits_by_client, concurrent_clients);
        }

        // Every inactive client's first residency window is its leading
        // qubits, one local-memory share per concurrent slot.
        let active_qubits_per_client = local_memory_capacity / concurrent_clients.max(1);
        let mut contexts = vec![ClientContext::default(); total];
        for &i in &inactive {
            contexts[i].active_qubits = clients[i]
                .qubit_keys()
                .into_iter()
                .take(active_qubits_per_client)
                .collect();
        }

        let rotation = if conf.rpc_enabled {
            let rpc_freq = if conf.rpc_freq_khz > 0.0 {
                conf.rpc_freq_khz
            } else {
                freq_khz
            };
            Some(RotationSubsystem::new(
                rpc_freq,
                code_distance,
                conf.rpc_capacity,
                conf.rpc_watermark,
                knobs,
            ))
        } else {
            None
        };

        Ok(Self {
            base,
            clients,
            rotation,
            concurrent_clients,
            simulation_instructions,
            stats: SubsystemStats::default(),
            stall_monitor: StallMonitor::default(),
            ed_in_use: conf.ed_in_use,
            active,
            inactive,
            last_used_client_idx: 0,
            contexts,
            ctx_switch_buffer: Vec::new(),
            magic_states_avail_last_cycle: 0,
            had_rpc_stall_this_cycle: false,
        })
    }

    pub fn is_rpc_enabled(&self) -> bool {
        self.rotation.is_some()
    }

    /// True once every client has retired its instruction share.
    pub fn done(&self) -> bool {
        self.clients
            .iter()
            .all(|c| c.is_done(self.simulation_instructions))
    }

    pub fn active_clients(&self) -> &[usize] {
        &self.active
    }

    pub fn contexts(&self) -> &[ClientContext] {
        &self.contexts
    }

    pub fn pending_context_switch_accesses(&self) -> usize {
        self.ctx_switch_buffer.len()
    }

    /// One tick of the compute clock.
    pub fn tick(
        &mut self,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> Result<()> {
        if !self.base.clock.begin_tick() {
            return Ok(());
        }
        let progress = self.operate(factories, memory, knobs, rng)?;
        // A finished simulation idles without being deadlocked.
        let effective = if self.done() { 1 } else { progress };
        if self.base.clock.finish_tick(effective) {
            panic!(
                "{}: deadlock:\n{}",
                self.base.clock.name,
                self.deadlock_info(factories)
            );
        }
        Ok(())
    }

    /// Ticks the rotation precompute subsystem's clock (the driver treats
    /// it as a separate operable).
    pub fn tick_rotation_subsystem(
        &mut self,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) {
        if let Some(rs) = &mut self.rotation {
            rs.tick(&mut self.clients, factories, memory, knobs, rng);
        }
    }

    fn operate(
        &mut self,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> Result<i64> {
        let mut progress = 0i64;

        let magic_states_before = count_available_states(factories);
        self.stats.magic_states_produced_sum +=
            magic_states_before.saturating_sub(self.magic_states_avail_last_cycle) as u64;
        self.had_rpc_stall_this_cycle = false;

        self.handle_completed_clients();

        progress += self.drain_context_switch_buffer(memory, knobs, rng);

        // Rotate the starting client so one busy client cannot starve the
        // others.
        let n = self.active.len();
        if n > 0 {
            let start = self.last_used_client_idx % n;
            for i in 0..n {
                let idx = self.active[(start + i) % n];
                progress += self.fetch_and_execute_instructions_from_client(
                    idx, factories, memory, knobs, rng,
                )?;
            }
            self.last_used_client_idx = (self.last_used_client_idx + 1) % n;
        }

        self.magic_states_avail_last_cycle = count_available_states(factories);
        if self.had_rpc_stall_this_cycle {
            self.stats.cycles_with_rpc_stalls += 1;
        }
        self.stall_monitor.end_cycle();
        Ok(progress)
    }

    fn handle_completed_clients(&mut self) {
        let cc = self.base.clock.current_cycle();
        let mut i = 0;
        while i < self.active.len() {
            let idx = self.active[i];
            if self.clients[idx].is_done(self.simulation_instructions) {
                let c = &mut self.clients[idx];
                c.stats.cycle_complete = c.stats.cycle_complete.min(cc);
                if let Some(incoming) = self.inactive.pop_front() {
                    self.do_context_switch(incoming, idx, i);
                    i += 1;
                } else {
                    self.active.remove(i);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Swaps `incoming` into the active slot `position` held by
    /// `outgoing`, queueing one memory access per residency pair.
    fn do_context_switch(&mut self, incoming: usize, outgoing: usize, position: usize) {
        let cc = self.base.clock.current_cycle();
        self.active[position] = incoming;

        let out_id = self.clients[outgoing].id;
        let mut out_active: Vec<QubitKey> = self
            .base
            .local_memory
            .contents()
            .iter()
            .copied()
            .filter(|k| k.client == out_id)
            .collect();
        out_active.sort_by_key(|k| k.qubit);

        let in_qubits = self.contexts[incoming].active_qubits.clone();
        for (in_q, out_q) in in_qubits.iter().zip(out_active.iter()) {
            self.ctx_switch_buffer.push((*in_q, *out_q));
        }

        self.contexts[outgoing] = ClientContext {
            active_qubits: out_active,
            cycle_saved: cc,
        };
        self.stats.context_switches += 1;
    }

    fn drain_context_switch_buffer(
        &mut self,
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> i64 {
        if self.ctx_switch_buffer.is_empty() {
            return 0;
        }

        let cc = self.base.clock.current_cycle();
        let mut drained = 0i64;
        let mut remaining = Vec::new();
        for (in_q, out_q) in std::mem::take(&mut self.ctx_switch_buffer) {
            let in_cell = self.clients[in_q.client as usize].avail_cell(in_q.qubit);
            let out_cell = self.clients[out_q.client as usize].avail_cell(out_q.qubit);
            if in_cell.get() > cc || out_cell.get() > cc {
                remaining.push((in_q, out_q));
                continue;
            }
            let result = self.base.execute_instruction(
                Opcode::MSwap,
                &[
                    Operand {
                        key: in_q,
                        avail: in_cell,
                    },
                    Operand {
                        key: out_q,
                        avail: out_cell,
                    },
                ],
                &mut [],
                memory,
                knobs,
                rng,
            );
            if result.progress > 0 {
                drained += 1;
                if let Some(rs) = &mut self.rotation {
                    rs.invalidate_for_qubit(
                        &self.clients[out_q.client as usize],
                        out_q.client as usize,
                        out_q.qubit,
                    );
                }
            } else {
                self.stall_monitor.flag(StallType::Memory);
                remaining.push((in_q, out_q));
            }
        }
        self.ctx_switch_buffer = remaining;
        drained
    }

    fn fetch_and_execute_instructions_from_client(
        &mut self,
        idx: usize,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> Result<i64> {
        let mut total = 0i64;
        loop {
            let pass = self.fetch_pass(idx, factories, memory, knobs, rng)?;
            total += pass;
            if pass == 0 {
                break;
            }
        }
        Ok(total)
    }

    fn fetch_pass(
        &mut self,
        idx: usize,
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> Result<i64> {
        let cc = self.base.clock.current_cycle();

        self.clients[idx].refill_dag(CLIENT_DAG_CAPACITY, knobs)?;
        let front: Vec<NodeId> = {
            let c = &self.clients[idx];
            c.dag
                .front_layer_if(|inst| inst.qubits().iter().all(|&q| c.avail(q) <= cc))
        };

        let mut success = 0i64;
        for id in front {
            let kind = self.clients[idx].dag.inst(id).kind();
            if knobs.elide_cliffords
                && !kind.is_rotation()
                && !kind.is_t_like()
                && !kind.is_memory_access()
            {
                panic!(
                    "fetch: unexpected clifford under elision: {}",
                    self.clients[idx].dag.inst(id)
                );
            }

            {
                let inst = self.clients[idx].dag.inst_mut(id);
                inst.first_ready_cycle = inst.first_ready_cycle.min(cc);
            }

            // The executed instruction is the pending uop for uop-bearing
            // kinds, the instruction itself otherwise.
            let (exec_kind, exec_qubits): (Opcode, Vec<QubitId>) = {
                let inst = self.clients[idx].dag.inst(id);
                match inst.current_uop() {
                    Some(u) => (u.kind, u.qubits().to_vec()),
                    None => (inst.kind(), inst.qubits().to_vec()),
                }
            };

            // Non-memory operands must be resident in local memory.
            let any_not_in_memory = exec_qubits.iter().any(|&q| {
                !self
                    .base
                    .local_memory
                    .contains(self.clients[idx].qubit_key(q))
            });
            if any_not_in_memory
                && !matches!(kind, Opcode::MLoad | Opcode::MSwap | Opcode::MPrefetch)
            {
                continue;
            }

            // First visit to a rotation consults the precompute subsystem.
            if kind.is_rotation()
                && self.rotation.is_some()
                && !self.clients[idx].dag.inst(id).rpc_visited
                && self.rpc_handle_instruction(idx, id, knobs, rng, &mut success)
            {
                continue;
            }

            if kind.is_rotation() && knobs.t_teleport_max > 0 {
                let result = {
                    let base = &mut self.base;
                    let c = &mut self.clients[idx];
                    let q0 = exec_qubits[0];
                    let operand = Operand {
                        key: QubitKey::new(c.id, q0),
                        avail: &c.qubit_avail[q0 as usize],
                    };
                    let inst = c.dag.inst_mut(id);
                    base.do_rotation_gate_with_teleportation(
                        inst,
                        operand,
                        knobs.t_teleport_max,
                        factories,
                        memory,
                        knobs,
                        rng,
                        |_, _, _| true,
                        |_, _| {},
                        |_, _| {},
                    )
                };
                success += result.progress;
                if result.progress == 0 {
                    self.stall_monitor.flag(StallType::MagicState);
                }
                let done = {
                    let inst = self.clients[idx].dag.inst(id);
                    inst.uops_retired() == inst.uop_count()
                };
                if done {
                    self.retire_instruction(idx, id, result.latency);
                }
            } else {
                let result =
                    self.dispatch(idx, exec_kind, &exec_qubits, factories, memory, knobs, rng);
                success += result.progress;
                if result.progress > 0 {
                    let has_uops = self.clients[idx].dag.inst(id).uop_count() > 0;
                    let done = if has_uops {
                        self.clients[idx].dag.inst_mut(id).retire_current_uop()
                    } else {
                        true
                    };
                    if done {
                        self.retire_instruction(idx, id, result.latency);
                    }
                } else if exec_kind.is_t_like() {
                    self.stall_monitor.flag(StallType::MagicState);
                } else if exec_kind.is_memory_access() {
                    self.stall_monitor.flag(StallType::Memory);
                    if self.ed_in_use {
                        self.stall_monitor.flag(StallType::Epr);
                    }
                }
            }
        }

        Ok(success)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        idx: usize,
        exec_kind: Opcode,
        exec_qubits: &[QubitId],
        factories: &mut [Producer],
        memory: &mut MemorySubsystem,
        knobs: &SimKnobs,
        rng: &mut StdRng,
    ) -> ExecResult {
        let result = {
            let base = &mut self.base;
            let c = &self.clients[idx];
            let operands: Vec<Operand<'_>> = exec_qubits
                .iter()
                .map(|&q| Operand {
                    key: c.qubit_key(q),
                    avail: c.avail_cell(q),
                })
                .collect();
            base.execute_instruction(exec_kind, &operands, factories, memory, knobs, rng)
        };

        // A qubit leaving local memory invalidates precomputations tied to
        // it.
        if result.progress > 0 && exec_kind.is_memory_access() {
            let victim = match exec_kind {
                Opcode::MStore => Some(exec_qubits[0]),
                Opcode::MSwap | Opcode::MPrefetch => Some(exec_qubits[1]),
                _ => None,
            };
            if let (Some(victim), Some(rs)) = (victim, &mut self.rotation) {
                rs.invalidate_for_qubit(&self.clients[idx], idx, victim);
            }
        }
        result
    }

    fn retire_instruction(&mut self, idx: usize, id: NodeId, latency: Cycle) {
        let cc = self.base.clock.current_cycle();
        let c = &mut self.clients[idx];
        if c.dag.inst(id).kind().is_rotation() {
            self.stats.total_rotations += 1;
        }
        if let Some(rs) = &mut self.rotation {
            rs.invalidate((idx, id));
        }
        c.dag.inst_mut(id).cycle_done = cc + latency;
        c.retire_instruction(id);
    }

    /// First-visit handling of a rotation against the precompute
    /// subsystem. Returns true when the instruction is finished (or must
    /// be skipped) this cycle.
    fn rpc_handle_instruction(
        &mut self,
        idx: usize,
        id: NodeId,
        knobs: &SimKnobs,
        rng: &mut StdRng,
        success: &mut i64,
    ) -> bool {
        enum Lookup {
            NotFound,
            InProgress,
            NeedsCorrection,
            Retire,
        }

        let cc = self.base.clock.current_cycle();
        let rpc_fetch_cycles = 2 * self.base.code_distance as Cycle;
        let rpc_apply_cycles = 2 * self.base.code_distance as Cycle;
        let key = (idx, id);

        let lookup = {
            let rs = self.rotation.as_mut().expect("rpc enabled");
            if rs.find_and_delete_request_if_done(key) {
                let hit_is_clean = rng.r#gen::<bool>();
                let q0 = self.clients[idx].dag.inst(id).qubits()[0];
                self.clients[idx].bump_avail(q0, cc + rpc_fetch_cycles + rpc_apply_cycles);
                self.stats.total_rpc += 1;
                if hit_is_clean {
                    self.stats.successful_rpc += 1;
                    Lookup::Retire
                } else {
                    Lookup::NeedsCorrection
                }
            } else if rs.is_request_pending(key) {
                Lookup::InProgress
            } else {
                Lookup::NotFound
            }
        };

        match lookup {
            Lookup::Retire => {
                if knobs.rpc_always_runahead {
                    self.rpc_find_and_attempt_allocate_for_future_rotation(idx, id, knobs);
                }
                self.retire_instruction(idx, id, rpc_apply_cycles);
                *success += 1;
                true
            }
            Lookup::NeedsCorrection => {
                // The precomputed state mismatched: the rotation continues
                // as the queued corrective sequence.
                self.clients[idx].dag.inst_mut(id).apply_next_correction();
                self.rpc_find_and_attempt_allocate_for_future_rotation(idx, id, knobs);
                false
            }
            Lookup::InProgress => {
                self.had_rpc_stall_this_cycle = true;
                self.stall_monitor.flag(StallType::Rpc);
                let rs = self.rotation.as_mut().expect("rpc enabled");
                rs.invalidate(key);
                self.rpc_find_and_attempt_allocate_for_future_rotation(idx, id, knobs);
                false
            }
            Lookup::NotFound => {
                self.rpc_find_and_attempt_allocate_for_future_rotation(idx, id, knobs);
                false
            }
        }
    }

    /// Looks deeper into the client's DAG for rotations worth
    /// precomputing and claims subsystem qubits for them.
    fn rpc_find_and_attempt_allocate_for_future_rotation(
        &mut self,
        idx: usize,
        id: NodeId,
        knobs: &SimKnobs,
    ) {
        self.clients[idx].dag.inst_mut(id).rpc_visited = true;

        let Some(rs) = &mut self.rotation else {
            return;
        };
        let origin_number = self.clients[idx].dag.inst(id).number;

        for _ in 0..knobs.rpc_degree {
            if !rs.can_accept_request() {
                break;
            }
            let found = self.clients[idx].dag.find_earliest_dependent_such_that(
                |nid, x| {
                    nid != id
                        && x.kind().is_rotation()
                        && !rs.is_request_pending((idx, nid))
                        && (x.number - origin_number) < knobs.rpc_inst_delta_limit
                },
                id,
                RPC_DAG_LOOKAHEAD_START_LAYER,
                RPC_DAG_LOOKAHEAD_START_LAYER + RPC_DAG_LOOKAHEAD_DEPTH,
            );
            match found {
                Some((dep, _layer)) => {
                    rs.submit_request((idx, dep));
                }
                None => break,
            }
        }
    }

    /// When every factory buffer is full, the rotation subsystem is idle,
    /// and every active client is stalled on an unready operand, returns
    /// the earliest cycle at which anything becomes ready so the driver
    /// can fast-forward.
    pub fn skip_to_cycle(
        &self,
        factories: &[Producer],
        ed_units: Option<&Pipeline>,
        memory: &MemorySubsystem,
    ) -> Option<Cycle> {
        let factories_full = factories.iter().all(|f| f.buffer_is_full());
        let rotation_idle = self.rotation.as_ref().is_none_or(|rs| !rs.is_active());
        if !factories_full || !rotation_idle || !self.ctx_switch_buffer.is_empty() {
            return None;
        }

        let mut min_cycle: Option<Cycle> = None;
        for &idx in &self.active {
            let c = &self.clients[idx];
            for id in c.dag.front_layer() {
                if let Some(r) = self.next_ready_cycle_for_instruction(c, id, ed_units, memory) {
                    min_cycle = Some(min_cycle.map_or(r, |m| m.min(r)));
                }
            }
        }
        min_cycle
    }

    fn next_ready_cycle_for_instruction(
        &self,
        c: &Client,
        id: NodeId,
        ed_units: Option<&Pipeline>,
        memory: &MemorySubsystem,
    ) -> Option<Cycle> {
        let inst = c.dag.inst(id);
        if inst.kind().is_memory_access() {
            let qs = inst.qubits();
            let (ld, st) = (c.qubit_key(qs[0]), c.qubit_key(qs[qs.len() - 1]));
            if inst.kind() != Opcode::MLoad && !self.base.local_memory.contains(st) {
                return None;
            }
            let mut ready = memory.get_next_ready_cycle_for_load(ld, self.base.clock.freq_khz);

            // Entanglement distillation is as slow as memory; never jump
            // past its next progression point.
            if let Some(ed) = ed_units {
                if let Some(ed_next) = ed.min_next_progression_cycle_in(self.base.clock.freq_khz) {
                    ready = ready.min(ed_next);
                }
            }
            Some(ready)
        } else {
            let mut ready = 0;
            for &q in inst.qubits() {
                if !self.base.local_memory.contains(c.qubit_key(q)) {
                    return None;
                }
                ready = ready.max(c.avail(q));
            }
            Some(ready)
        }
    }

    pub fn deadlock_info(&self, factories: &[Producer]) -> String {
        let mut out = String::new();
        for f in factories {
            out.push_str(&f.deadlock_info());
            out.push('\n');
        }
        out.push_str("local memory contents:");
        let mut contents: Vec<&QubitKey> = self.base.local_memory.contents().iter().collect();
        contents.sort_by_key(|k| (k.client, k.qubit));
        for q in contents {
            out.push_str(&format!(" {q}"));
        }
        out.push('\n');

        for &idx in &self.active {
            let c = &self.clients[idx];
            out.push_str(&format!("client {} front layer:\n", c.id));
            for id in c.dag.front_layer() {
                let inst = c.dag.inst(id);
                out.push_str(&format!("\t{inst}\tcycle ready:"));
                for &q in inst.qubits() {
                    out.push_str(&format!(" {}", c.avail(q)));
                }
                out.push_str("\tin memory:");
                for &q in inst.qubits() {
                    out.push_str(&format!(
                        " {}",
                        self.base.local_memory.contains(c.qubit_key(q)) as u8
                    ));
                }
                out.push('\n');
            }
        }
        if let Some(rs) = &self.rotation {
            out.push_str(&rs.deadlock_info());
            out.push('\n');
        }
        out
    }

}
