use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::{delay::delay_simple_nodes, memory::estimate_memory_increase};
use crate::{graph::Graph, node::NodeId, value::ValueId};

/// Schedulable nodes keyed by (estimated memory increase, arrival), so the
/// cheapest node wins and ties go to the earliest arrival.
struct ReadyQueue<'a> {
    graph: &'a Graph,
    input_counts: FxHashMap<NodeId, usize>,
    queue: BTreeMap<(i64, u64), NodeId>,
    arrivals: u64,
    recompute_penalty: i64,
}

impl<'a> ReadyQueue<'a> {
    fn enqueue(&mut self, id: NodeId) {
        let mut increase = estimate_memory_increase(self.graph, id);
        if self.graph.node(id).op.is_recompute_friendly() {
            increase = increase.saturating_add(self.recompute_penalty);
        }
        self.queue.insert((increase, self.arrivals), id);
        self.arrivals += 1;
    }

    fn make_value_ready(&mut self, value: ValueId) {
        let value = &self.graph.values[value];
        if value.is_null() {
            return;
        }
        for user in value.users() {
            let Some(count) = self.input_counts.get_mut(user) else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                self.enqueue(*user);
            }
        }
    }
}

/// The greedy order before any post-processing, and whether it ran into
/// nodes finalized by an earlier pass.
pub(super) fn greedy_order(
    graph: &Graph,
    input_values: &[ValueId],
    output_values: &[ValueId],
    recompute_penalty: i64,
) -> (Vec<NodeId>, bool) {
    let input_counts = graph.necessary_nodes_and_input_counts(output_values);
    let mut ready = input_counts
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| id)
        .collect::<Vec<_>>();
    ready.sort_by_key(|id| id.index());

    let mut queue = ReadyQueue {
        graph,
        input_counts,
        queue: BTreeMap::new(),
        arrivals: 0,
        recompute_penalty,
    };

    // Nodes which are already schedulable (e.g., Constant).
    for id in ready {
        queue.enqueue(id);
    }
    for &value in input_values {
        queue.make_value_ready(value);
    }

    let mut nodes = vec![];
    let mut has_finalized_nodes = false;
    while let Some((_, id)) = queue.queue.pop_first() {
        let node = graph.node(id);
        if node.is_scheduled() {
            has_finalized_nodes = true;
        } else {
            nodes.push(id);
        }
        for &output in &node.outputs {
            queue.make_value_ready(output);
        }
    }

    (nodes, has_finalized_nodes)
}

/// Greedily picks the schedulable node that grows the working set least.
pub(super) fn schedule_greedy(
    graph: &Graph,
    input_values: &[ValueId],
    output_values: &[ValueId],
    recompute_penalty: i64,
) -> Vec<NodeId> {
    let (nodes, has_finalized_nodes) =
        greedy_order(graph, input_values, output_values, recompute_penalty);
    // TODO: Delaying is limited to a fresh pass until the delay pass learns
    // to step over nodes stamped by an earlier pass.
    if has_finalized_nodes {
        log::debug!("schedule_greedy: skipped delaying simple nodes");
        return nodes;
    }
    delay_simple_nodes(graph, &nodes)
}
