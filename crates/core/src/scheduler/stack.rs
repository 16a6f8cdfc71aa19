use rustc_hash::{FxHashMap, FxHashSet};

use super::ScheduleError;
use crate::{graph::Graph, node::NodeId, value::ValueId};

/// Places stack pushes right after the producer of the pushed value and
/// stack pops right before their first consumer. A push has no output, so it
/// would otherwise float freely, and a pop has no input, so it would be
/// ready from the very start.
pub(super) fn schedule_stack_push_pop(
    graph: &Graph,
    input_values: &[ValueId],
    nodes: &[NodeId],
) -> Result<Vec<NodeId>, ScheduleError> {
    let node_to_index = nodes
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect::<FxHashMap<_, _>>();
    let mut reordered = Vec::with_capacity(nodes.len());
    let mut pushed = FxHashSet::default();

    let mut schedule_push = |value: ValueId, reordered: &mut Vec<NodeId>| {
        for &user in graph.values[value].users() {
            if graph.node(user).op.is_stack_push()
                && node_to_index.contains_key(&user)
                && pushed.insert(user)
            {
                reordered.push(user);
            }
        }
    };

    for &input in input_values {
        schedule_push(input, &mut reordered);
    }
    // Values produced by nodes finalized in an earlier pass are available
    // from the start as well.
    for &id in nodes {
        let node = graph.node(id);
        if !node.op.is_stack_push() {
            continue;
        }
        for &input in &node.inputs {
            let finalized = graph.values[input]
                .producer()
                .map_or(false, |p| graph.node(p).is_scheduled());
            if finalized {
                schedule_push(input, &mut reordered);
            }
        }
    }

    let mut delayed: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for &id in nodes {
        let node = graph.node(id);
        if node.op.is_stack_pop() {
            let malformed = || ScheduleError::MalformedStackPop(graph.debug_string(id));
            let [output] = node.outputs.as_slice() else {
                return Err(malformed());
            };
            let first_user = graph.values[*output]
                .users()
                .iter()
                .filter_map(|user| node_to_index.get(user))
                .min()
                .ok_or_else(malformed)?;
            delayed.entry(nodes[*first_user]).or_default().push(id);
        } else if !node.op.is_stack_push() {
            if let Some(pops) = delayed.remove(&id) {
                reordered.extend(pops);
            }
            reordered.push(id);
            for &output in &node.outputs {
                schedule_push(output, &mut reordered);
            }
        }
    }

    Ok(reordered)
}
