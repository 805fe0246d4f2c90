//! Per-client instruction dependency graph.
//!
//! Nodes live in an indexed arena; handles are stable across insertions and
//! removals. Each qubit has a back pointer to the node of the youngest
//! instruction touching it, so insertion links an instruction to its
//! producers in O(operands). The front layer (nodes with no pending
//! predecessors) is kept as an ordered set for O(log n) removal by handle
//! and deterministic iteration.

use crate::instruction::Instruction;
use qsim_common::ids::QubitId;
use std::collections::{BTreeSet, VecDeque};

/// Stable handle to a DAG node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

struct Node {
    inst: Instruction,
    dependents: Vec<NodeId>,
    pred_count: usize,
}

pub struct Dag {
    qubit_count: usize,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    front_layer: BTreeSet<NodeId>,
    /// Per-qubit node of the youngest instruction referencing that qubit.
    back: Vec<Option<NodeId>>,
    inst_count: usize,
}

impl Dag {
    pub fn new(qubit_count: usize) -> Self {
        Self {
            qubit_count,
            nodes: Vec::new(),
            free: Vec::new(),
            front_layer: BTreeSet::new(),
            back: vec![None; qubit_count],
            inst_count: 0,
        }
    }

    pub fn qubit_count(&self) -> usize {
        self.qubit_count
    }

    pub fn inst_count(&self) -> usize {
        self.inst_count
    }

    pub fn inst(&self, id: NodeId) -> &Instruction {
        &self.node(id).inst
    }

    pub fn inst_mut(&mut self, id: NodeId) -> &mut Instruction {
        &mut self.node_mut(id).inst
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale DAG handle {id:?}"))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("stale DAG handle {id:?}"))
    }

    fn check_qubit(&self, q: QubitId, inst: &Instruction) {
        if q < 0 || q as usize >= self.qubit_count {
            panic!(
                "DAG::add_instruction: qubit {q} of instruction \"{inst}\" is out of range \
                 (qubit count = {})",
                self.qubit_count
            );
        }
    }

    /// Inserts an instruction, linking it after the youngest instruction on
    /// each of its operands. Referencing an out-of-range qubit is fatal.
    pub fn add_instruction(&mut self, inst: Instruction) -> NodeId {
        for &q in inst.qubits() {
            self.check_qubit(q, &inst);
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id.0 as usize] = Some(Node {
                    inst,
                    dependents: Vec::new(),
                    pred_count: 0,
                });
                id
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(Some(Node {
                    inst,
                    dependents: Vec::new(),
                    pred_count: 0,
                }));
                id
            }
        };

        // Link to the back pointer of each operand, deduplicating so an
        // instruction touching two qubits owned by the same producer only
        // counts the dependency once.
        let operands: Vec<QubitId> = self.node(id).inst.qubits().to_vec();
        let mut linked: Vec<NodeId> = Vec::with_capacity(operands.len());
        for q in operands {
            if let Some(back_id) = self.back[q as usize] {
                if !linked.contains(&back_id) {
                    self.node_mut(back_id).dependents.push(id);
                    self.node_mut(id).pred_count += 1;
                    linked.push(back_id);
                }
            }
            self.back[q as usize] = Some(id);
        }

        if self.node(id).pred_count == 0 {
            self.front_layer.insert(id);
        }
        self.inst_count += 1;
        id
    }

    /// Retires a front-layer instruction, promoting any dependents whose
    /// predecessor count reaches zero. Removing a non-front-layer
    /// instruction is fatal. Returns the retired instruction.
    pub fn remove_instruction_from_front_layer(&mut self, id: NodeId) -> Instruction {
        if !self.front_layer.remove(&id) {
            let inst = &self.node(id).inst;
            panic!(
                "DAG::remove_instruction_from_front_layer: instruction \"{inst}\" \
                 is not in the front layer ({} front-layer entries)",
                self.front_layer.len()
            );
        }

        let node = self.nodes[id.0 as usize].take().expect("front-layer node");
        for dep in &node.dependents {
            let d = self.node_mut(*dep);
            d.pred_count -= 1;
            if d.pred_count == 0 {
                self.front_layer.insert(*dep);
            }
        }

        // Clear back pointers that still reference the retired node.
        for &q in node.inst.qubits() {
            if self.back[q as usize] == Some(id) {
                self.back[q as usize] = None;
            }
        }

        self.free.push(id);
        self.inst_count -= 1;
        node.inst
    }

    /// Front-layer instructions whose node satisfies the predicate, in
    /// handle order.
    pub fn front_layer_if<P>(&self, mut pred: P) -> Vec<NodeId>
    where
        P: FnMut(&Instruction) -> bool,
    {
        self.front_layer
            .iter()
            .copied()
            .filter(|id| pred(&self.node(*id).inst))
            .collect()
    }

    pub fn front_layer(&self) -> Vec<NodeId> {
        self.front_layer_if(|_| true)
    }

    /// Breadth-first walk from the front layer, stopping after `max_layer`
    /// layers. The callback sees each instruction once, in layer order.
    pub fn for_each_instruction_in_layer_order<F>(&self, mut cb: F, max_layer: usize)
    where
        F: FnMut(NodeId, &Instruction, usize),
    {
        let mut visited: Vec<bool> = vec![false; self.nodes.len()];
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        for &id in &self.front_layer {
            visited[id.0 as usize] = true;
            queue.push_back((id, 0));
        }

        while let Some((id, layer)) = queue.pop_front() {
            if layer >= max_layer {
                break;
            }
            let node = self.node(id);
            cb(id, &node.inst, layer);
            for &dep in &node.dependents {
                if !visited[dep.0 as usize] {
                    visited[dep.0 as usize] = true;
                    queue.push_back((dep, layer + 1));
                }
            }
        }
    }

    /// BFS restricted to the transitive dependents of `root`; returns the
    /// first instruction in layer order within `[start_layer, end_layer)`
    /// satisfying the predicate, plus the layer it was found in. The root
    /// itself sits at layer 0.
    pub fn find_earliest_dependent_such_that<P>(
        &self,
        mut pred: P,
        root: NodeId,
        start_layer: usize,
        end_layer: usize,
    ) -> Option<(NodeId, usize)>
    where
        P: FnMut(NodeId, &Instruction) -> bool,
    {
        let mut visited: Vec<bool> = vec![false; self.nodes.len()];
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        visited[root.0 as usize] = true;
        queue.push_back((root, 0));

        while let Some((id, layer)) = queue.pop_front() {
            if layer >= end_layer {
                break;
            }
            if layer >= start_layer && pred(id, &self.node(id).inst) {
                return Some((id, layer));
            }
            for &dep in &self.node(id).dependents {
                if !visited[dep.0 as usize] {
                    visited[dep.0 as usize] = true;
                    queue.push_back((dep, layer + 1));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsim_common::opcode::Opcode;

    fn cx(a: QubitId, b: QubitId) -> Instruction {
        Instruction::new(Opcode::Cx, &[a, b])
    }

    fn h(q: QubitId) -> Instruction {
        Instruction::new(Opcode::H, &[q])
    }

    #[test]
    fn front_layer_promotion() {
        let mut dag = Dag::new(4);
        let a = dag.add_instruction(h(0));
        let b = dag.add_instruction(cx(0, 1));
        let c = dag.add_instruction(cx(2, 3));
        assert_eq!(dag.front_layer(), vec![a, c]);

        dag.remove_instruction_from_front_layer(a);
        assert_eq!(dag.front_layer(), vec![b, c]);
        assert_eq!(dag.inst_count(), 2);
    }

    #[test]
    fn retirement_respects_per_qubit_program_order() {
        let mut dag = Dag::new(3);
        let program = [cx(0, 1), h(1), cx(1, 2), h(0), h(2)];
        let mut numbers = Vec::new();
        for (i, mut inst) in program.into_iter().enumerate() {
            inst.number = i as i64;
            numbers.push(dag.add_instruction(inst));
        }

        // Retire in front-layer order and record per-qubit sequences.
        let mut retired_per_qubit: Vec<Vec<i64>> = vec![Vec::new(); 3];
        while dag.inst_count() > 0 {
            let layer = dag.front_layer();
            for id in layer {
                let inst = dag.remove_instruction_from_front_layer(id);
                for &q in inst.qubits() {
                    retired_per_qubit[q as usize].push(inst.number);
                }
            }
        }
        for seq in retired_per_qubit {
            let mut sorted = seq.clone();
            sorted.sort();
            assert_eq!(seq, sorted);
        }
    }

    #[test]
    fn duplicate_operand_dependency_counted_once() {
        let mut dag = Dag::new(2);
        let a = dag.add_instruction(cx(0, 1));
        let b = dag.add_instruction(cx(0, 1));
        assert_eq!(dag.front_layer(), vec![a]);
        dag.remove_instruction_from_front_layer(a);
        // If the dependency were double counted, b would still be blocked.
        assert_eq!(dag.front_layer(), vec![b]);
    }

    #[test]
    #[should_panic(expected = "not in the front layer")]
    fn removing_blocked_instruction_is_fatal() {
        let mut dag = Dag::new(2);
        dag.add_instruction(h(0));
        let b = dag.add_instruction(h(0));
        dag.remove_instruction_from_front_layer(b);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_qubit_is_fatal() {
        let mut dag = Dag::new(2);
        dag.add_instruction(h(5));
    }

    #[test]
    fn layer_order_walk() {
        let mut dag = Dag::new(2);
        dag.add_instruction(h(0)); // layer 0
        dag.add_instruction(h(0)); // layer 1
        dag.add_instruction(h(0)); // layer 2
        dag.add_instruction(h(1)); // layer 0

        let mut layers = Vec::new();
        dag.for_each_instruction_in_layer_order(|_, _, layer| layers.push(layer), 2);
        assert_eq!(layers, vec![0, 0, 1]);
    }

    #[test]
    fn earliest_dependent_search() {
        let mut dag = Dag::new(2);
        let root = dag.add_instruction(h(0));
        dag.add_instruction(h(0)); // layer 1
        let deep = dag.add_instruction(cx(0, 1)); // layer 2
        let unrelated = dag.add_instruction(h(1));
        assert_eq!(dag.front_layer(), vec![root, unrelated]);

        let found = dag.find_earliest_dependent_such_that(
            |_, inst| inst.kind() == Opcode::Cx,
            root,
            0,
            8,
        );
        assert_eq!(found, Some((deep, 2)));

        // Bounded depth misses it.
        let found = dag.find_earliest_dependent_such_that(
            |_, inst| inst.kind() == Opcode::Cx,
            root,
            0,
            2,
        );
        assert_eq!(found, None);
    }

    #[test]
    fn handles_are_reused_from_free_list() {
        let mut dag = Dag::new(1);
        let a = dag.add_instruction(h(0));
        dag.remove_instruction_from_front_layer(a);
        let b = dag.add_instruction(h(0));
        assert_eq!(a, b);
    }
}
