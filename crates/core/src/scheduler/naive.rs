use std::collections::VecDeque;

use crate::{graph::Graph, node::NodeId, value::ValueId};

/// A simple topological sort. A node is appended as soon as its last input
/// becomes available; values are processed in FIFO order.
pub(super) fn schedule_naively(
    graph: &Graph,
    input_values: &[ValueId],
    output_values: &[ValueId],
) -> Vec<NodeId> {
    let mut input_counts = graph.necessary_nodes_and_input_counts(output_values);
    let mut queue = input_values.iter().copied().collect::<VecDeque<_>>();
    let mut nodes = vec![];

    let schedule_node = |id: NodeId, nodes: &mut Vec<NodeId>, queue: &mut VecDeque<ValueId>| {
        let node = graph.node(id);
        if !node.is_scheduled() {
            nodes.push(id);
        }
        queue.extend(node.outputs.iter().copied());
    };

    // Nodes which are already schedulable (e.g., Constant).
    let mut ready = input_counts
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| id)
        .collect::<Vec<_>>();
    ready.sort_by_key(|id| id.index());
    for id in ready {
        schedule_node(id, &mut nodes, &mut queue);
    }

    while let Some(value) = queue.pop_front() {
        let value = &graph.values[value];
        if value.is_null() {
            continue;
        }
        for user in value.users() {
            let Some(count) = input_counts.get_mut(user) else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                schedule_node(*user, &mut nodes, &mut queue);
            }
        }
    }

    nodes
}
