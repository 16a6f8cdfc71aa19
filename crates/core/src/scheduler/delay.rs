use rustc_hash::FxHashMap;

use super::memory::estimate_memory_increase;
use crate::{graph::Graph, node::NodeId};

/// Moves chains of single-input single-output producers that do not free
/// memory to just before their earliest consumer, so their outputs stay
/// alive for a shorter time.
pub(super) fn delay_simple_nodes(graph: &Graph, nodes: &[NodeId]) -> Vec<NodeId> {
    let mut slots = nodes.iter().map(|&id| vec![id]).collect::<Vec<_>>();
    let node_to_index = nodes
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect::<FxHashMap<_, _>>();

    for i in (0..slots.len()).rev() {
        if slots[i].len() != 1 {
            continue;
        }
        let node = graph.node(slots[i][0]);
        for &input in &node.inputs {
            let mut input = input;
            let mut to = i;
            while let Some(prev_id) = graph.values[input].producer() {
                let prev = graph.node(prev_id);
                if prev.inputs.len() != 1 || prev.outputs.len() != 1 {
                    break;
                }
                if estimate_memory_increase(graph, prev_id) < 0 {
                    break;
                }
                for user in graph.values[input].users() {
                    if let Some(&index) = node_to_index.get(user) {
                        to = to.min(index);
                    }
                }

                let Some(&index) = node_to_index.get(&prev_id) else {
                    break;
                };
                // Already delayed, or another node has been delayed here.
                if slots[index].as_slice() != [prev_id] {
                    break;
                }
                log::debug!(
                    "Delayed: from {} to {} {}",
                    index,
                    to,
                    graph.debug_string(prev_id)
                );
                slots[index].clear();
                slots[to].push(prev_id);
                input = prev.inputs[0];
            }
        }
    }

    slots
        .into_iter()
        .flat_map(|slot| slot.into_iter().rev())
        .collect()
}
