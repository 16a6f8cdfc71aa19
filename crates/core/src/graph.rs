use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::{
    node::{Liveness, Node, NodeArena, NodeId, ScheduleOrder},
    tensor::Tensor,
    value::{ValueArena, ValueId},
};

/// Owns every node and value. The producer/user relation between them is
/// kept mutually consistent by `add_node`, `detach` and `replace_input`.
#[derive(Default, Clone)]
pub struct Graph {
    nodes: NodeArena,
    pub values: ValueArena,
    /// Parameters: tensors bound to producer-less values.
    pub inits: FxHashMap<ValueId, Tensor>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

impl Graph {
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let inputs = node.inputs.clone();
        let outputs = node.outputs.clone();
        let id = self.nodes.alloc(node);
        for input in inputs {
            self.values[input].users.push(id);
        }
        for output in outputs {
            let value = &mut self.values[output];
            if let Some(prev) = value.producer {
                assert!(
                    !self.nodes[prev].is_live(),
                    "value '{}' already has a live producer",
                    value.display_name()
                );
            }
            value.producer = Some(id);
        }
        id
    }

    /// Marks `id` dead. Its inputs no longer list it as a user and its
    /// outputs lose their producer, so any remaining consumer of those
    /// outputs must be rewired by the caller.
    pub fn detach(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        if node.liveness == Liveness::Detached {
            return;
        }
        node.liveness = Liveness::Detached;
        for &input in &node.inputs {
            self.values[input].users.retain(|&u| u != id);
        }
        for &output in &node.outputs {
            let value = &mut self.values[output];
            if value.producer == Some(id) {
                value.producer = None;
            }
        }
    }

    /// Makes `node` consume `new` wherever it consumed `old`.
    pub fn replace_input(&mut self, node: NodeId, old: ValueId, new: ValueId) {
        let mut replaced = 0;
        for input in self.nodes[node].inputs.iter_mut() {
            if *input == old {
                *input = new;
                replaced += 1;
            }
        }
        if replaced == 0 {
            return;
        }
        self.values[old].users.retain(|&u| u != node);
        for _ in 0..replaced {
            self.values[new].users.push(node);
        }
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn set_order(&mut self, id: NodeId, order: ScheduleOrder) {
        self.nodes[id].order = order;
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_live())
            .map(|(id, _)| id)
            .collect()
    }

    /// Declared inputs followed by parameters that are not declared inputs.
    pub fn input_values(&self) -> Vec<ValueId> {
        let mut params = self
            .inits
            .keys()
            .filter(|&v| !self.inputs.contains(v))
            .copied()
            .collect::<Vec<_>>();
        params.sort_by_key(|v| v.index());
        self.inputs.iter().copied().chain(params).collect()
    }

    pub fn num_actual_inputs(&self, id: NodeId) -> usize {
        self.nodes[id]
            .inputs
            .iter()
            .filter(|&&v| !self.values[v].is_null())
            .count()
    }

    /// Walks backward from `outputs` and returns every node needed to
    /// produce them, mapped to the number of its non-null inputs that have
    /// to become available before it can run. Output-less users (stack
    /// pushes) of any value on the way are needed as well.
    pub fn necessary_nodes_and_input_counts(&self, outputs: &[ValueId]) -> FxHashMap<NodeId, usize> {
        let mut queue = outputs
            .iter()
            .filter_map(|&v| self.values[v].producer)
            .collect::<VecDeque<_>>();
        let mut input_counts = FxHashMap::default();

        while let Some(id) = queue.pop_front() {
            let node = &self.nodes[id];
            if !node.is_live() || input_counts.contains_key(&id) {
                continue;
            }
            input_counts.insert(id, self.num_actual_inputs(id));
            for &input in &node.inputs {
                let value = &self.values[input];
                queue.extend(value.producer);
                queue.extend(
                    value
                        .users
                        .iter()
                        .filter(|&&u| self.nodes[u].outputs.is_empty()),
                );
            }
        }

        input_counts
    }

    /// The largest stamp across the whole graph, or 0.
    pub fn max_order(&self) -> u64 {
        self.nodes
            .iter()
            .filter_map(|(_, node)| node.stamp())
            .max()
            .unwrap_or(0)
    }

    /// Live, scheduled nodes sorted by their stamp.
    pub fn scheduled_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self
            .nodes
            .iter()
            .filter(|(_, node)| node.is_live())
            .filter_map(|(id, node)| node.stamp().map(|s| (s, id)))
            .collect::<Vec<_>>();
        nodes.sort_by_key(|&(s, _)| s);
        nodes.into_iter().map(|(_, id)| id).collect()
    }

    pub fn debug_string(&self, id: NodeId) -> String {
        let node = &self.nodes[id];
        let names = |vals: &[ValueId]| {
            vals.iter()
                .map(|&v| self.values[v].display_name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{}({}) inputs=[{}] outputs=[{}]",
            node.display_name(),
            node.op.name(),
            names(&node.inputs),
            names(&node.outputs)
        )
    }
}

#[cfg(test)]
fn diamond() -> (Graph, [NodeId; 4]) {
    use crate::op::Op;

    let mut g = Graph::default();
    let input = g.values.new_val_named("input");
    let x = g.values.new_val_named("x");
    let y = g.values.new_val_named("y");
    let z = g.values.new_val_named("z");
    let out = g.values.new_val_named("out");
    let a = g.add_node(Node::new(Op::Identity).with_in(input).with_out(x));
    let b = g.add_node(Node::new(Op::ReLU).with_in(x).with_out(y));
    let c = g.add_node(Node::new(Op::Neg).with_in(x).with_out(z));
    let d = g.add_node(Node::new(Op::Add).with_ins(vec![y, z]).with_out(out));
    g.inputs.push(input);
    g.outputs.push(out);
    (g, [a, b, c, d])
}

#[test]
fn producers_and_users_are_consistent() {
    let (g, [a, b, c, d]) = diamond();
    let x = g.node(a).outputs[0];
    assert_eq!(g.values[x].producer(), Some(a));
    assert_eq!(g.values[x].users(), &[b, c]);
    assert_eq!(g.values[g.node(d).inputs[0]].producer(), Some(b));
}

#[test]
fn detach_updates_edges() {
    let (mut g, [a, b, c, _]) = diamond();
    g.detach(b);
    let x = g.node(a).outputs[0];
    let y = g.node(b).outputs[0];
    assert_eq!(g.values[x].users(), &[c]);
    assert_eq!(g.values[y].producer(), None);
    assert_eq!(g.live_nodes().len(), 3);
    g.detach(b);
    assert_eq!(g.live_nodes().len(), 3);
}

#[test]
fn replace_input_moves_users() {
    let (mut g, [a, b, _, d]) = diamond();
    let x = g.node(a).outputs[0];
    let y = g.node(b).outputs[0];
    g.replace_input(d, y, x);
    assert_eq!(g.node(d).inputs[0], x);
    assert!(g.values[y].users().is_empty());
    assert_eq!(g.values[x].users().len(), 3);
}

#[test]
fn necessary_nodes() {
    let (g, [a, b, c, d]) = diamond();
    let counts = g.necessary_nodes_and_input_counts(&g.outputs);
    assert_eq!(counts.len(), 4);
    assert_eq!(counts[&a], 1);
    assert_eq!(counts[&b], 1);
    assert_eq!(counts[&c], 1);
    assert_eq!(counts[&d], 2);

    let y = g.node(b).outputs[0];
    let counts = g.necessary_nodes_and_input_counts(&[y]);
    assert_eq!(counts.len(), 2);
    assert!(!counts.contains_key(&c));
}

#[test]
#[should_panic]
fn second_live_producer() {
    use crate::op::Op;

    let (mut g, [a, ..]) = diamond();
    let x = g.node(a).outputs[0];
    let input = g.inputs[0];
    g.add_node(Node::new(Op::Identity).with_in(input).with_out(x));
}
