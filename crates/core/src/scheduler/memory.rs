use rustc_hash::{FxHashMap, FxHashSet};

use crate::{graph::Graph, node::NodeId, value::ValueId};

/// Estimated change of the working set when `node` runs: bytes of its
/// outputs minus the share of each input it releases. An input consumed by
/// `n` users is only `1/n` released by one of them. Any unknown size makes
/// the estimate neutral.
pub fn estimate_memory_increase(graph: &Graph, node: NodeId) -> i64 {
    let node = graph.node(node);
    let input_size = node.inputs.iter().try_fold(0i64, |acc, &v| {
        let value = &graph.values[v];
        if value.is_null() {
            return Some(acc);
        }
        let users = value.users().len().max(1) as i64;
        value.nbytes().map(|s| acc + s as i64 / users)
    });
    let output_size = node.outputs.iter().try_fold(0i64, |acc, &v| {
        let value = &graph.values[v];
        if value.is_null() {
            return Some(acc);
        }
        value.nbytes().map(|s| acc + s as i64)
    });
    match (input_size, output_size) {
        (Some(input_size), Some(output_size)) => output_size - input_size,
        _ => 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedMemoryUsage {
    /// Bytes held by parameters.
    pub param: i64,
    /// Largest number of simultaneously live bytes.
    pub peak: i64,
    /// Bytes of every value the simulation saw.
    pub all: i64,
    pub num_unknowns: usize,
    pub num_values: usize,
}

impl SimulatedMemoryUsage {
    fn count(&mut self, graph: &Graph, value: ValueId) -> i64 {
        self.num_values += 1;
        match graph.values[value].nbytes() {
            Some(s) => s as i64,
            None => {
                self.num_unknowns += 1;
                0
            }
        }
    }
}

/// Replays the current global order. Inputs and parameters stay resident;
/// every other value lives from its producer until its last scheduled
/// consumer, except graph outputs, which are never released.
pub fn simulate_memory_usage(graph: &Graph) -> SimulatedMemoryUsage {
    let order = graph.scheduled_nodes();
    let graph_outputs = graph.outputs.iter().copied().collect::<FxHashSet<_>>();
    let mut last_use = FxHashMap::default();
    for (i, &id) in order.iter().enumerate() {
        for &input in &graph.node(id).inputs {
            last_use.insert(input, i);
        }
    }

    let mut usage = SimulatedMemoryUsage::default();
    let mut current = 0;
    for value in graph.input_values() {
        let s = usage.count(graph, value);
        if graph.inits.contains_key(&value) {
            usage.param += s;
        }
        usage.all += s;
        current += s;
    }
    usage.peak = current;

    let mut live = FxHashMap::default();
    for (i, &id) in order.iter().enumerate() {
        let node = graph.node(id);
        for &output in &node.outputs {
            if graph.values[output].is_null() {
                continue;
            }
            let s = usage.count(graph, output);
            usage.all += s;
            current += s;
            live.insert(output, s);
        }
        usage.peak = usage.peak.max(current);

        let releasable = node
            .inputs
            .iter()
            .filter(|v| last_use.get(v) == Some(&i))
            .chain(node.outputs.iter().filter(|v| !last_use.contains_key(v)));
        for value in releasable {
            if graph_outputs.contains(value) {
                continue;
            }
            if let Some(s) = live.remove(value) {
                current -= s;
            }
        }
    }

    usage
}
