//! Epoch-based memory-access scheduler.
//!
//! Reshapes an instruction trace so that every compute instruction's
//! operands are resident in a bounded active set when it executes. The
//! scheduler maintains a dependency DAG over a sliding window of the input
//! trace; each epoch it drains every front-layer instruction that is ready
//! on the current active set, and when nothing is ready it asks the policy
//! for a target active set and emits the `MSWAP` operations that realize
//! it.

use crate::policy::Policy;
use anyhow::{Result, bail};
use qsim_core::dag::Dag;
use qsim_core::instruction::Instruction;
use qsim_common::ids::QubitId;
use qsim_common::opcode::Opcode;
use qsim_io::trace::{TraceReader, TraceWriter};
use std::collections::BTreeSet;
use std::io::{Read, Write};

/// The set of qubits resident in compute-local memory. Ordered so victim
/// selection and MSWAP emission are deterministic.
pub type ActiveSet = BTreeSet<QubitId>;

/// Execution knobs for one scheduling run.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub active_set_capacity: i64,
    pub inst_compile_limit: i64,
    pub print_progress_frequency: i64,
    pub dag_inst_capacity: i64,
    pub verbose: bool,

    /* Policy specific parameters */
    pub hint_lookahead_depth: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_set_capacity: 12,
            inst_compile_limit: 15_000_000,
            print_progress_frequency: 1_000_000,
            dag_inst_capacity: 8192,
            verbose: false,
            hint_lookahead_depth: 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub unrolled_inst_done: u64,
    pub memory_accesses: u64,
    pub scheduler_epochs: u64,
    pub total_unused_bandwidth: u64,
}

/// Output of one policy invocation.
pub struct TransformResult {
    /// MSWAP operations realizing the transition, in emission order.
    pub memory_accesses: Vec<Instruction>,
    /// The active set after the transition.
    pub active_set: ActiveSet,
    /// Residency slots the policy left untouched this epoch.
    pub unused_bandwidth: u64,
}

/// True if the instruction can be emitted against the given active set.
/// Software instructions never require residency.
pub fn instruction_is_ready(inst: &Instruction, active_set: &ActiveSet) -> bool {
    inst.kind().is_software() || inst.qubits().iter().all(|q| active_set.contains(q))
}

/// Converts `current` into `target` by pairing each incoming qubit with an
/// evictable resident one and emitting one MSWAP per pair. Failing to find
/// a victim is a precondition violation.
pub fn transform_active_set(current: &ActiveSet, target: &ActiveSet) -> TransformResult {
    let mut out = TransformResult {
        memory_accesses: Vec::new(),
        active_set: current.clone(),
        unused_bandwidth: (current.len() as u64).saturating_sub(target.len() as u64),
    };

    for &q in target {
        if out.active_set.contains(&q) {
            continue;
        }
        let victim = out
            .active_set
            .iter()
            .copied()
            .find(|v| !target.contains(v))
            .unwrap_or_else(|| panic!("transform_active_set: could not find victim for qubit {q}"));
        out.memory_accesses.push(Instruction::new(Opcode::MSwap, &[q, victim]));
        out.active_set.remove(&victim);
        out.active_set.insert(q);
    }
    out
}

/// Reads instructions into the DAG until it holds `until_capacity`
/// instructions or the stream is exhausted.
fn read_instructions_into_dag<R: Read>(
    dag: &mut Dag,
    reader: &mut TraceReader<R>,
    until_capacity: usize,
    inst_read: &mut u64,
) -> Result<()> {
    while dag.inst_count() < until_capacity && !reader.at_end() {
        match reader.read_instruction()? {
            Some((mut inst, _)) => {
                inst.number = *inst_read as i64;
                *inst_read += 1;
                dag.add_instruction(inst);
            }
            None => break,
        }
    }
    Ok(())
}

/// Runs the scheduler over the whole input trace (or until the compile
/// limit), writing the rewritten trace to `writer`.
pub fn run<R: Read, W: Write, P: Policy>(
    reader: &mut TraceReader<R>,
    writer: &mut TraceWriter<W>,
    policy: &P,
    config: &SchedulerConfig,
) -> Result<SchedulerStats> {
    let mut stats = SchedulerStats::default();
    let mut inst_read = 0u64;
    let mut dag = Dag::new(reader.qubit_count() as usize);

    // The initial active set is the identity mapping over the first
    // `active_set_capacity` qubits.
    let capacity = config.active_set_capacity.max(0) as usize;
    let mut active_set: ActiveSet =
        (0..(reader.qubit_count() as i64).min(capacity as i64)).collect();

    let mut last_progress_mark = 0u64;
    while stats.unrolled_inst_done < config.inst_compile_limit as u64 {
        read_instructions_into_dag(&mut dag, reader, config.dag_inst_capacity as usize, &mut inst_read)?;
        if dag.inst_count() == 0 {
            break;
        }

        let ready = dag.front_layer_if(|inst| instruction_is_ready(inst, &active_set));
        if !ready.is_empty() {
            for id in ready {
                let inst = dag.remove_instruction_from_front_layer(id);
                stats.unrolled_inst_done += inst.unrolled_inst_count() as u64;
                writer.write_instruction(&inst)?;
            }

            if config.print_progress_frequency > 0
                && stats.unrolled_inst_done - last_progress_mark
                    >= config.print_progress_frequency as u64
            {
                last_progress_mark = stats.unrolled_inst_done;
                log::info!(
                    "memory scheduler progress: {} instructions done, {} memory accesses, \
                     {} epochs",
                    stats.unrolled_inst_done,
                    stats.memory_accesses,
                    stats.scheduler_epochs
                );
            }
            continue;
        }

        let result = policy.emit_memory_instructions(&active_set, &dag, config);
        if result.memory_accesses.is_empty() {
            bail!(
                "memory scheduler stuck: nothing ready and the policy emitted no accesses \
                 ({} instructions pending)",
                dag.inst_count()
            );
        }
        for m in &result.memory_accesses {
            writer.write_instruction(m)?;
            stats.memory_accesses += 1;
        }
        stats.scheduler_epochs += 1;
        stats.total_unused_bandwidth += result.unused_bandwidth;
        active_set = result.active_set;
    }

    Ok(stats)
}
