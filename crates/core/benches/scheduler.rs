use criterion::{criterion_group, criterion_main, Criterion};
use tensorvm_core::{
    graph::Graph,
    node::Node,
    op::Op,
    scheduler::{schedule_graph, SchedulerConfig, SchedulerType},
    tensor::TensorElemType,
    value::ValueType,
};

const WIDTH: usize = 64;
const DEPTH: usize = 32;

/// `DEPTH` layers of `WIDTH` nodes; each node reads two neighbours of the
/// previous layer.
fn layered_graph() -> Graph {
    let mut g = Graph::default();
    let ty = || ValueType::new(TensorElemType::F32, vec![16, 16]);
    let mut layer = (0..WIDTH)
        .map(|i| {
            g.values
                .new_val_named_and_typed(format!("input{i}"), ty())
        })
        .collect::<Vec<_>>();
    g.inputs = layer.clone();

    for d in 0..DEPTH {
        let next = (0..WIDTH)
            .map(|i| {
                g.values
                    .new_val_named_and_typed(format!("v{d}_{i}"), ty())
            })
            .collect::<Vec<_>>();
        for i in 0..WIDTH {
            let op = if i % 2 == 0 { Op::Add } else { Op::Mul };
            g.add_node(
                Node::new(op)
                    .with_ins(vec![layer[i], layer[(i + 1) % WIDTH]])
                    .with_out(next[i]),
            );
        }
        layer = next;
    }

    g.outputs = layer;
    g
}

fn naive(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = layered_graph();
    let config = SchedulerConfig::new(SchedulerType::Naive);
    c.bench_function("Naive", |b| {
        b.iter(|| schedule_graph(&mut g.clone(), &config).unwrap())
    });
}

fn greedy(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = layered_graph();
    let config = SchedulerConfig::new(SchedulerType::Greedy);
    c.bench_function("Greedy", |b| {
        b.iter(|| schedule_graph(&mut g.clone(), &config).unwrap())
    });
}

criterion_group!(scheduler, naive, greedy);
criterion_main!(scheduler);
