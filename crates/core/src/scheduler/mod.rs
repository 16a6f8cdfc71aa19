mod delay;
mod greedy;
mod memory;
mod naive;
mod stack;

use std::time::Instant;

use rustc_hash::FxHashSet;
use thiserror::Error;

pub use memory::{estimate_memory_increase, simulate_memory_usage, SimulatedMemoryUsage};

use crate::{
    graph::Graph,
    node::{NodeId, ScheduleOrder},
    value::ValueId,
};

/// Stands in for the cost of a node that is cheap to run again, so it is
/// picked as late as possible.
pub const DEFAULT_RECOMPUTE_PENALTY: i64 = 1000 * 1000 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerType {
    Naive,
    #[default]
    Greedy,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub ty: SchedulerType,
    pub recompute_penalty: i64,
    pub simulate_memory: bool,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Failed to schedule {} node(s): {}", .0.len(), describe_unschedulable(.0))]
    Unschedulable(Vec<UnschedulableNode>),

    #[error("Node scheduled more than once: {0}")]
    DuplicateNode(String),

    #[error("Stack pop must have exactly one consumed output: {0}")]
    MalformedStackPop(String),
}

#[derive(Debug, Clone)]
pub struct UnschedulableNode {
    pub node: NodeId,
    pub description: String,
    /// Names of the inputs that never became available.
    pub unavailable_inputs: Vec<String>,
}

fn describe_unschedulable(nodes: &[UnschedulableNode]) -> String {
    nodes
        .iter()
        .map(|n| {
            if n.unavailable_inputs.is_empty() {
                n.description.clone()
            } else {
                format!(
                    "{} ({} cannot be ready)",
                    n.description,
                    n.unavailable_inputs.join(", ")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchedulerConfig {
    pub const fn new(ty: SchedulerType) -> Self {
        Self {
            ty,
            recompute_penalty: DEFAULT_RECOMPUTE_PENALTY,
            simulate_memory: false,
        }
    }

    pub const fn with_recompute_penalty(mut self, recompute_penalty: i64) -> Self {
        self.recompute_penalty = recompute_penalty;
        self
    }

    pub const fn with_memory_simulation(mut self, simulate_memory: bool) -> Self {
        self.simulate_memory = simulate_memory;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(SchedulerType::default())
    }
}

/// Orders every node needed to compute `output_values` from `input_values`
/// and stamps them after anything scheduled by earlier calls. Nodes that
/// already carry a stamp are treated as available and left untouched.
pub fn schedule_computation(
    graph: &mut Graph,
    input_values: &[ValueId],
    output_values: &[ValueId],
    config: &SchedulerConfig,
) -> Result<Vec<NodeId>, ScheduleError> {
    let start = Instant::now();

    let nodes = match config.ty {
        SchedulerType::Naive => naive::schedule_naively(graph, input_values, output_values),
        SchedulerType::Greedy => greedy::schedule_greedy(
            graph,
            input_values,
            output_values,
            config.recompute_penalty,
        ),
    };
    let nodes = stack::schedule_stack_push_pop(graph, input_values, &nodes)?;

    check_sanity(graph, input_values, output_values, &nodes)?;

    let mut max_order = graph.max_order();
    for &id in &nodes {
        max_order += 1;
        graph.set_order(id, ScheduleOrder::ScheduledAt(max_order));
    }

    log::info!(
        "schedule_computation({:?}, {} nodes): {:?}",
        config.ty,
        nodes.len(),
        start.elapsed()
    );

    if config.simulate_memory {
        let usage = simulate_memory_usage(graph);
        if usage.num_unknowns > 0 {
            log::warn!(
                "Incomplete memory simulation due to unknown shapes ({}/{})",
                usage.num_unknowns,
                usage.num_values
            );
        }
        log::info!(
            "Simulated memory usage: param={}MB peak={}MB all={}MB",
            usage.param / 1000 / 1000,
            usage.peak / 1000 / 1000,
            usage.all / 1000 / 1000
        );
    }

    Ok(nodes)
}

/// Schedules the whole graph: from its inputs and parameters to its outputs.
pub fn schedule_graph(
    graph: &mut Graph,
    config: &SchedulerConfig,
) -> Result<Vec<NodeId>, ScheduleError> {
    let inputs = graph.input_values();
    let outputs = graph.outputs.clone();
    schedule_computation(graph, &inputs, &outputs, config)
}

fn check_sanity(
    graph: &Graph,
    input_values: &[ValueId],
    output_values: &[ValueId],
    nodes: &[NodeId],
) -> Result<(), ScheduleError> {
    let mut scheduled = FxHashSet::default();
    for &id in nodes {
        if !scheduled.insert(id) {
            return Err(ScheduleError::DuplicateNode(graph.debug_string(id)));
        }
    }

    let mut available = input_values.iter().copied().collect::<FxHashSet<_>>();
    for &id in nodes {
        available.extend(graph.node(id).outputs.iter().copied());
    }
    let finalized = graph
        .nodes()
        .iter()
        .filter(|(_, n)| n.is_live() && n.is_scheduled());
    for (_, node) in finalized {
        available.extend(node.outputs.iter().copied());
    }

    let mut missing = graph
        .necessary_nodes_and_input_counts(output_values)
        .into_keys()
        .filter(|id| !graph.node(*id).is_scheduled() && !scheduled.contains(id))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_by_key(|id| id.index());

    let missing = missing
        .into_iter()
        .map(|id| {
            let description = graph.debug_string(id);
            log::error!("Failed to schedule: {}", description);
            let unavailable_inputs = graph
                .node(id)
                .inputs
                .iter()
                .filter(|v| !available.contains(v))
                .filter_map(|&v| graph.values[v].name.clone())
                .collect::<Vec<_>>();
            for name in &unavailable_inputs {
                log::error!(" {} cannot be ready", name);
            }
            UnschedulableNode {
                node: id,
                description,
                unavailable_inputs,
            }
        })
        .collect();
    Err(ScheduleError::Unschedulable(missing))
}

#[cfg(test)]
fn named(g: &Graph, nodes: &[NodeId]) -> Vec<String> {
    nodes
        .iter()
        .map(|&id| g.node(id).display_name().to_string())
        .collect()
}

#[cfg(test)]
fn diamond(sizes: Option<[usize; 5]>) -> (Graph, [NodeId; 4]) {
    diamond_with(sizes, crate::op::Op::Neg)
}

/// A -> {B, C} -> D, where B runs `b_op`.
#[cfg(test)]
fn diamond_with(sizes: Option<[usize; 5]>, b_op: crate::op::Op) -> (Graph, [NodeId; 4]) {
    use crate::{
        node::Node,
        op::Op,
        tensor::TensorElemType,
        value::{ValueArena, ValueType},
    };

    let mut g = Graph::default();
    let new_val = |values: &mut ValueArena, name: &str, i: usize| match sizes {
        Some(sizes) => values.new_val_named_and_typed(
            name,
            ValueType::new(TensorElemType::F32, vec![sizes[i] / 4]),
        ),
        None => values.new_val_named(name),
    };
    let input = new_val(&mut g.values, "input", 0);
    let x = new_val(&mut g.values, "x", 1);
    let y = new_val(&mut g.values, "y", 2);
    let z = new_val(&mut g.values, "z", 3);
    let out = new_val(&mut g.values, "out", 4);
    let a = g.add_node(Node::new(Op::Identity).with_name("A").with_in(input).with_out(x));
    let b = g.add_node(Node::new(b_op).with_name("B").with_in(x).with_out(y));
    let c = g.add_node(Node::new(Op::Exp).with_name("C").with_in(x).with_out(z));
    let d = g.add_node(
        Node::new(Op::Add)
            .with_name("D")
            .with_ins(vec![y, z])
            .with_out(out),
    );
    g.inputs.push(input);
    g.outputs.push(out);
    (g, [a, b, c, d])
}

#[cfg(test)]
fn assert_topological(g: &Graph, order: &[NodeId], inputs: &[ValueId]) {
    let mut available = inputs.iter().copied().collect::<FxHashSet<_>>();
    for &id in order {
        for input in &g.node(id).inputs {
            assert!(available.contains(input), "{}", g.debug_string(id));
        }
        available.extend(g.node(id).outputs.iter().copied());
    }
}

#[test]
fn naive_diamond() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut g, [a, b, c, d]) = diamond(None);
    let order = schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Naive)).unwrap();
    insta::assert_debug_snapshot!(named(&g, &order), @r###"
    [
        "A",
        "B",
        "C",
        "D",
    ]
    "###);
    assert_eq!(g.node(a).stamp(), Some(1));
    assert_eq!(g.node(b).stamp(), Some(2));
    assert_eq!(g.node(c).stamp(), Some(3));
    assert_eq!(g.node(d).stamp(), Some(4));
    assert_eq!(g.scheduled_nodes(), order);
}

#[test]
fn greedy_prefers_smaller_increase() {
    // y is much larger than z, so C runs before B.
    let (mut g, _) = diamond(Some([40, 40, 400, 4, 400]));
    let order = schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Greedy)).unwrap();
    assert_eq!(named(&g, &order), vec!["A", "C", "B", "D"]);
    assert_topological(&g, &order, &g.inputs);
}

#[test]
fn greedy_penalizes_recompute_friendly_nodes() {
    use crate::op::Op;

    // B and C grow memory equally, but Relu output is cheap to recompute.
    let (g, _) = diamond_with(Some([40, 40, 40, 40, 40]), Op::ReLU);
    let (order, _) = greedy::greedy_order(&g, &g.inputs, &g.outputs, DEFAULT_RECOMPUTE_PENALTY);
    assert_eq!(named(&g, &order), vec!["A", "C", "B", "D"]);
    let (order, _) = greedy::greedy_order(&g, &g.inputs, &g.outputs, 0);
    assert_eq!(named(&g, &order), vec!["A", "B", "C", "D"]);

    let mut g = g;
    let order = schedule_graph(&mut g, &SchedulerConfig::default()).unwrap();
    assert_eq!(named(&g, &order), vec!["A", "C", "B", "D"]);
    assert_topological(&g, &order, &g.inputs);
}

#[test]
fn greedy_is_deterministic() {
    let (g, _) = diamond(None);
    let orders = (0..3)
        .map(|_| {
            let mut g = g.clone();
            let order = schedule_graph(&mut g, &SchedulerConfig::default()).unwrap();
            named(&g, &order)
        })
        .collect::<Vec<_>>();
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[1], orders[2]);
    assert_eq!(orders[0].len(), 4);
}

#[test]
fn greedy_ties_follow_arrival() {
    let (g, _) = diamond(None);
    let (order, has_finalized_nodes) =
        greedy::greedy_order(&g, &g.inputs, &g.outputs, DEFAULT_RECOMPUTE_PENALTY);
    assert!(!has_finalized_nodes);
    assert_eq!(named(&g, &order), vec!["A", "B", "C", "D"]);
}

#[test]
fn delay_memory_growing_node() {
    use crate::{node::Node, op::Op, tensor::TensorElemType, value::ValueType};

    let mut g = Graph::default();
    let ty = |bytes: usize| ValueType::new(TensorElemType::F32, vec![bytes / 4]);
    let a = g.values.new_val_named_and_typed("a", ty(4));
    let b = g.values.new_val_named_and_typed("b", ty(4));
    let big = g.values.new_val_named_and_typed("big", ty(400));
    let huge = g.values.new_val_named_and_typed("huge", ty(1000));
    let out = g.values.new_val_named_and_typed("out", ty(4));
    g.add_node(Node::new(Op::Exp).with_name("E").with_in(a).with_out(big));
    g.add_node(Node::new(Op::Exp).with_name("F").with_in(b).with_out(huge));
    g.add_node(
        Node::new(Op::Add)
            .with_name("H")
            .with_ins(vec![big, huge])
            .with_out(out),
    );
    g.inputs = vec![a, b];
    g.outputs = vec![out];

    let (order, _) = greedy::greedy_order(&g, &g.inputs, &g.outputs, DEFAULT_RECOMPUTE_PENALTY);
    assert_eq!(named(&g, &order), vec!["E", "F", "H"]);
    let delayed = delay::delay_simple_nodes(&g, &order);
    assert_eq!(named(&g, &delayed), vec!["F", "E", "H"]);

    let order = schedule_graph(&mut g, &SchedulerConfig::default()).unwrap();
    assert_eq!(named(&g, &order), vec!["F", "E", "H"]);
}

#[cfg(test)]
fn stack_graph() -> (Graph, ValueId, ValueId) {
    use crate::{
        node::Node,
        op::{Op, StackPop, StackPush},
    };

    let mut g = Graph::default();
    let input = g.values.new_val_named("input");
    let x = g.values.new_val_named("x");
    let y = g.values.new_val_named("y");
    let p = g.values.new_val_named("p");
    let out = g.values.new_val_named("out");
    g.add_node(Node::new(Op::Identity).with_name("A").with_in(input).with_out(x));
    g.add_node(
        Node::new(Op::StackPush(StackPush { id: 0 }))
            .with_name("Push")
            .with_in(x),
    );
    g.add_node(Node::new(Op::ReLU).with_name("B").with_in(x).with_out(y));
    g.add_node(
        Node::new(Op::StackPop(StackPop { id: 0 }))
            .with_name("Pop")
            .with_out(p),
    );
    g.add_node(
        Node::new(Op::Mul)
            .with_name("C")
            .with_ins(vec![y, p])
            .with_out(out),
    );
    g.inputs.push(input);
    g.outputs.push(out);
    (g, y, out)
}

#[test]
fn stack_push_pop_placement() {
    let (mut g, _, _) = stack_graph();
    let order = schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Naive)).unwrap();
    assert_eq!(named(&g, &order), vec!["A", "Push", "B", "Pop", "C"]);
}

#[test]
fn stamps_grow_across_passes() {
    let (mut g, y, out) = stack_graph();
    let inputs = g.inputs.clone();
    let config = SchedulerConfig::new(SchedulerType::Naive);

    let forward = schedule_computation(&mut g, &inputs, &[y], &config).unwrap();
    assert_eq!(named(&g, &forward), vec!["A", "Push", "B"]);
    let stamps = forward
        .iter()
        .map(|&id| g.node(id).stamp())
        .collect::<Vec<_>>();
    assert_eq!(stamps, vec![Some(1), Some(2), Some(3)]);

    let backward = schedule_computation(&mut g, &inputs, &[out], &config).unwrap();
    assert_eq!(named(&g, &backward), vec!["Pop", "C"]);
    assert_eq!(g.node(backward[0]).stamp(), Some(4));
    assert_eq!(g.node(backward[1]).stamp(), Some(5));
    assert_eq!(g.node(forward[0]).stamp(), Some(1));

    // Finalized nodes also count as available for the greedy scheduler.
    let (mut g, y, out) = stack_graph();
    let inputs = g.inputs.clone();
    let greedy = SchedulerConfig::new(SchedulerType::Greedy);
    schedule_computation(&mut g, &inputs, &[y], &greedy).unwrap();
    let backward = schedule_computation(&mut g, &inputs, &[out], &greedy).unwrap();
    assert_eq!(named(&g, &backward), vec!["Pop", "C"]);
}

#[test]
fn push_of_value_from_earlier_pass() {
    use crate::{
        node::Node,
        op::{Op, StackPush},
    };

    let _ = env_logger::builder().is_test(true).try_init();

    for ty in [SchedulerType::Naive, SchedulerType::Greedy] {
        let mut g = Graph::default();
        let input = g.values.new_val_named("input");
        let x1 = g.values.new_val_named("x1");
        let x2 = g.values.new_val_named("x2");
        let out = g.values.new_val_named("out");
        g.add_node(
            Node::new(Op::Identity)
                .with_name("A")
                .with_in(input)
                .with_outs(vec![x1, x2]),
        );
        g.add_node(
            Node::new(Op::StackPush(StackPush { id: 0 }))
                .with_name("Push")
                .with_in(x1),
        );
        g.add_node(Node::new(Op::Exp).with_name("C").with_in(x1).with_out(out));
        g.inputs.push(input);
        let inputs = g.inputs.clone();
        let config = SchedulerConfig::new(ty);

        let first = schedule_computation(&mut g, &inputs, &[x2], &config).unwrap();
        assert_eq!(named(&g, &first), vec!["A"]);
        let second = schedule_computation(&mut g, &inputs, &[out], &config).unwrap();
        assert_eq!(named(&g, &second), vec!["Push", "C"]);
        assert_eq!(g.node(second[0]).stamp(), Some(2));
    }
}

#[test]
fn unavailable_input() {
    use crate::{node::Node, op::Op};

    let (mut g, [.., d]) = diamond(None);
    let missing = g.values.new_val_named("missing");
    let out2 = g.values.new_val_named("out2");
    let out = g.node(d).outputs[0];
    let e = g.add_node(
        Node::new(Op::Add)
            .with_name("E")
            .with_ins(vec![out, missing])
            .with_out(out2),
    );
    let inputs = g.inputs.clone();
    let err = schedule_computation(
        &mut g,
        &inputs,
        &[out2],
        &SchedulerConfig::new(SchedulerType::Naive),
    )
    .unwrap_err();
    match &err {
        ScheduleError::Unschedulable(nodes) => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].node, e);
            assert_eq!(nodes[0].unavailable_inputs, vec!["missing".to_string()]);
        }
        e => panic!("unexpected error: {e}"),
    }
    assert_eq!(
        err.to_string(),
        "Failed to schedule 1 node(s): E(Add) inputs=[out, missing] outputs=[out2] (missing cannot be ready)"
    );
    // Nothing is stamped on failure.
    assert_eq!(g.max_order(), 0);
}

#[test]
fn malformed_stack_pop() {
    use crate::{
        node::Node,
        op::{Op, StackPop},
    };

    let mut g = Graph::default();
    let p = g.values.new_val_named("p");
    let q = g.values.new_val_named("q");
    let out = g.values.new_val_named("out");
    g.add_node(
        Node::new(Op::StackPop(StackPop { id: 1 }))
            .with_name("Pop")
            .with_outs(vec![p, q]),
    );
    g.add_node(Node::new(Op::Identity).with_in(p).with_out(out));
    g.outputs.push(out);
    let err = schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Naive)).unwrap_err();
    assert!(matches!(err, ScheduleError::MalformedStackPop(_)));
}

#[test]
fn memory_estimates() {
    let (g, [a, b, c, d]) = diamond(Some([40, 40, 400, 4, 400]));
    assert_eq!(estimate_memory_increase(&g, a), 0);
    assert_eq!(estimate_memory_increase(&g, b), 380);
    assert_eq!(estimate_memory_increase(&g, c), -16);
    assert_eq!(estimate_memory_increase(&g, d), 400 - 404);

    let (g, [a, ..]) = diamond(None);
    assert_eq!(estimate_memory_increase(&g, a), 0);
}

#[test]
fn simulated_memory() {
    let (mut g, _) = diamond(Some([40, 40, 400, 4, 400]));
    schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Naive)).unwrap();
    let usage = simulate_memory_usage(&g);
    assert_eq!(usage.num_unknowns, 0);
    assert_eq!(usage.num_values, 5);
    assert_eq!(usage.all, 40 + 40 + 400 + 4 + 400);
    // While D runs: input, y, z and out are alive.
    assert_eq!(usage.peak, 40 + 400 + 4 + 400);
}
