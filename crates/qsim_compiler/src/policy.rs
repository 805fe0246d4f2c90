//! Scheduling policies: how the next target active set is chosen.

use crate::scheduler::{ActiveSet, SchedulerConfig, TransformResult, transform_active_set};
use qsim_core::dag::Dag;
use qsim_common::ids::QubitId;
use std::collections::HashMap;

/// A memory-scheduling policy. Invoked only when no front-layer
/// instruction is ready on the current active set; produces the memory
/// accesses that unblock the next epoch.
pub trait Policy {
    fn emit_memory_instructions(
        &self,
        active_set: &ActiveSet,
        dag: &Dag,
        config: &SchedulerConfig,
    ) -> TransformResult;
}

/// EIF (Earliest Instructions First).
///
/// Scores each front-layer instruction by how many of its operands are
/// already resident, then greedily packs whole instructions into the
/// target set in descending score order, skipping any instruction that
/// would overflow the capacity.
pub struct Eif;

impl Policy for Eif {
    fn emit_memory_instructions(
        &self,
        active_set: &ActiveSet,
        dag: &Dag,
        config: &SchedulerConfig,
    ) -> TransformResult {
        let capacity = config.active_set_capacity.max(0) as usize;
        let mut front = dag.front_layer();

        let mut scores: HashMap<_, usize> = HashMap::with_capacity(front.len());
        for &id in &front {
            let s = dag
                .inst(id)
                .qubits()
                .iter()
                .filter(|q| active_set.contains(q))
                .count();
            scores.insert(id, s);
        }
        front.sort_by(|a, b| scores[b].cmp(&scores[a]).then(a.cmp(b)));

        let mut target = ActiveSet::new();
        for id in front {
            if target.len() >= capacity {
                break;
            }
            let inst = dag.inst(id);
            if inst.kind().qubit_count() > capacity - target.len() {
                continue;
            }
            target.extend(inst.qubits().iter().copied());
        }

        transform_active_set(active_set, &target)
    }
}

/// HINT: lookahead-weighted demand.
///
/// Every qubit referenced within `hint_lookahead_depth` layers of the DAG
/// receives a demand score discounted by `2^-layer`; the top-capacity
/// qubits form the target set, subject to the constraint that at least one
/// whole front-layer instruction fits (otherwise the epoch could emit
/// accesses without unblocking anything).
pub struct Hint;

impl Policy for Hint {
    fn emit_memory_instructions(
        &self,
        active_set: &ActiveSet,
        dag: &Dag,
        config: &SchedulerConfig,
    ) -> TransformResult {
        let capacity = config.active_set_capacity.max(0) as usize;

        let mut scores: HashMap<QubitId, f64> = HashMap::new();
        dag.for_each_instruction_in_layer_order(
            |_, inst, layer| {
                let weight = 2f64.powi(-(layer as i32));
                for &q in inst.qubits() {
                    *scores.entry(q).or_insert(0.0) += weight;
                }
            },
            config.hint_lookahead_depth.max(1) as usize,
        );

        let mut ranked: Vec<(QubitId, f64)> = scores.iter().map(|(&q, &s)| (q, s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut target: ActiveSet = ranked.iter().take(capacity).map(|&(q, _)| q).collect();

        // Guarantee progress: some front-layer instruction must fit whole.
        let front = dag.front_layer();
        let fits = |t: &ActiveSet| {
            front
                .iter()
                .any(|&id| dag.inst(id).qubits().iter().all(|q| t.contains(q)))
        };
        if !fits(&target) && !front.is_empty() {
            // Force in the highest-demand front-layer instruction, evicting
            // the lowest-scoring picks to make room.
            let score_of = |q: QubitId| scores.get(&q).copied().unwrap_or(0.0);
            let best = front
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    let sa: f64 = dag.inst(a).qubits().iter().map(|&q| score_of(q)).sum();
                    let sb: f64 = dag.inst(b).qubits().iter().map(|&q| score_of(q)).sum();
                    sa.total_cmp(&sb).then(b.cmp(&a))
                })
                .unwrap();
            let needed: Vec<QubitId> = dag.inst(best).qubits().to_vec();

            let mut evictable: Vec<QubitId> = target
                .iter()
                .copied()
                .filter(|q| !needed.contains(q))
                .collect();
            evictable.sort_by(|&a, &b| score_of(a).total_cmp(&score_of(b)).then(a.cmp(&b)));
            let mut evict = evictable.into_iter();
            for q in needed {
                if target.contains(&q) {
                    continue;
                }
                if target.len() >= capacity {
                    let victim = evict
                        .next()
                        .expect("front-layer instruction wider than the active set");
                    target.remove(&victim);
                }
                target.insert(q);
            }
        }

        transform_active_set(active_set, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsim_core::instruction::Instruction;
    use qsim_common::opcode::Opcode;

    #[test]
    fn eif_prefers_instructions_with_resident_operands() {
        let mut dag = Dag::new(6);
        dag.add_instruction(Instruction::new(Opcode::Cx, &[4, 5]));
        dag.add_instruction(Instruction::new(Opcode::Cx, &[1, 2]));

        let active: ActiveSet = [0, 1].into_iter().collect();
        let config = SchedulerConfig {
            active_set_capacity: 2,
            ..SchedulerConfig::default()
        };
        let result = Eif.emit_memory_instructions(&active, &dag, &config);
        // CX(1,2) scores 1 and wins the two slots.
        assert_eq!(result.active_set, [1, 2].into_iter().collect());
        assert_eq!(result.memory_accesses.len(), 1);
    }

    #[test]
    fn hint_weighs_future_layers() {
        let mut dag = Dag::new(8);
        // Front layer: H(0) and H(1). Qubit 1 is also demanded by deeper
        // instructions, so it must outrank qubit 0's partner-less use.
        dag.add_instruction(Instruction::new(Opcode::H, &[0]));
        dag.add_instruction(Instruction::new(Opcode::H, &[1]));
        dag.add_instruction(Instruction::new(Opcode::H, &[1]));
        dag.add_instruction(Instruction::new(Opcode::H, &[1]));

        let active: ActiveSet = [6, 7].into_iter().collect();
        let config = SchedulerConfig {
            active_set_capacity: 1,
            hint_lookahead_depth: 4,
            ..SchedulerConfig::default()
        };
        let result = Hint.emit_memory_instructions(&active, &dag, &config);
        // The transform swaps qubit 1 in; the set keeps its current size,
        // with the shrink surfacing as unused bandwidth.
        assert!(result.active_set.contains(&1));
        assert_eq!(result.active_set.len(), 2);
        assert_eq!(result.unused_bandwidth, 1);
        assert_eq!(result.memory_accesses.len(), 1);
    }

    #[test]
    fn hint_always_fits_one_front_layer_instruction() {
        let mut dag = Dag::new(8);
        // A two-operand front-layer instruction over low-demand qubits,
        // with heavy single-qubit demand elsewhere.
        dag.add_instruction(Instruction::new(Opcode::Cx, &[6, 7]));
        for _ in 0..4 {
            dag.add_instruction(Instruction::new(Opcode::H, &[0]));
            dag.add_instruction(Instruction::new(Opcode::H, &[1]));
            dag.add_instruction(Instruction::new(Opcode::H, &[2]));
        }

        let active: ActiveSet = [3, 4, 5].into_iter().collect();
        let config = SchedulerConfig {
            active_set_capacity: 3,
            hint_lookahead_depth: 8,
            ..SchedulerConfig::default()
        };
        let result = Hint.emit_memory_instructions(&active, &dag, &config);
        let target = &result.active_set;
        // H(0), H(1), or H(2) fitting would be fine too, but the CX must be
        // schedulable if no single-qubit instruction fits; either way some
        // whole front-layer instruction is resident.
        let front_ok = [vec![0], vec![1], vec![2], vec![6, 7]]
            .iter()
            .any(|ops| ops.iter().all(|q| target.contains(q)));
        assert!(front_ok, "target {target:?} fits no front-layer instruction");
    }
}
