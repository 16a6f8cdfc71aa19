use crate::{graph::Graph, node::NodeId, op::Op};

/// Estimated floating-point operation count of `node`. Shapes that are not
/// fully known count as zero.
pub fn estimate_flops(graph: &Graph, node_id: NodeId) -> u64 {
    let node = graph.node(node_id);
    let shape_of = |v| graph.values[v].ty.dims.as_ref().and_then(|d| d.to_fixed());

    match &node.op {
        Op::MatMul => {
            let [a, b, ..] = node.inputs[..] else {
                return 0;
            };
            let (Some(a), Some(b)) = (shape_of(a), shape_of(b)) else {
                return 0;
            };
            if a.len() < 2 || b.len() < 2 {
                return 0;
            }
            let m = a[a.len() - 2];
            let k = a[a.len() - 1];
            let n = b[b.len() - 1];
            let rem = a[..a.len() - 2].iter().product::<usize>();
            (2 * rem * m * n * k) as u64
        }
        op if op.is_elemwise() => node
            .outputs
            .first()
            .and_then(|&v| shape_of(v))
            .map_or(0, |s| s.total_elems() as u64),
        _ => 0,
    }
}

#[test]
fn matmul_flops() {
    use crate::{node::Node, tensor::TensorElemType, value::ValueType};

    let mut g = Graph::default();
    let a = g
        .values
        .new_val_named_and_typed("a", ValueType::new(TensorElemType::F32, vec![2, 8, 4]));
    let b = g
        .values
        .new_val_named_and_typed("b", ValueType::new(TensorElemType::F32, vec![4, 3]));
    let c = g
        .values
        .new_val_named_and_typed("c", ValueType::new(TensorElemType::F32, vec![2, 8, 3]));
    let d = g.values.new_val_named("d");
    let e = g.values.new_val_named("e");
    let mm = g.add_node(Node::new(Op::MatMul).with_ins(vec![a, b]).with_out(c));
    let relu = g.add_node(Node::new(Op::ReLU).with_in(c).with_out(d));
    let relu_known = g.add_node(Node::new(Op::ReLU).with_in(a).with_out(e));
    g.values[e].ty = ValueType::new(TensorElemType::F32, vec![2, 8, 4]);
    assert_eq!(estimate_flops(&g, mm), 2 * 2 * 8 * 3 * 4);
    assert_eq!(estimate_flops(&g, relu), 0);
    assert_eq!(estimate_flops(&g, relu_known), 64);
}

#[test]
fn matmul_missing_operand() {
    use crate::{node::Node, tensor::TensorElemType, value::ValueType};

    let mut g = Graph::default();
    let a = g
        .values
        .new_val_named_and_typed("a", ValueType::new(TensorElemType::F32, vec![2, 4]));
    let c = g.values.new_val_named("c");
    let id = g.add_node(Node::new(Op::MatMul).with_in(a).with_out(c));
    assert_eq!(estimate_flops(&g, id), 0);
}
