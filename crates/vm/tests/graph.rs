use rustc_hash::FxHashMap;
use tensorvm_core::{
    graph::Graph,
    node::Node,
    op::{Op, StackPop, StackPush},
    scheduler::{schedule_computation, schedule_graph, SchedulerConfig, SchedulerType},
    tensor::{Tensor, TensorElemType},
    value::ValueType,
};
use tensorvm_vm::{emit::emit_program, Opcode, Var, VirtualMachine, VmOptions};

fn f32x2() -> ValueType {
    ValueType::new(TensorElemType::F32, vec![2])
}

#[test]
fn schedule_emit_run() {
    let _ = env_logger::builder().is_test(true).try_init();

    // y = relu(x + w) * x
    let mut g = Graph::default();
    let x = g.values.new_val_named_and_typed("x", f32x2());
    let w = g.values.new_val_named_and_typed("w", f32x2());
    let h = g.values.new_val_named_and_typed("h", f32x2());
    let r = g.values.new_val_named_and_typed("r", f32x2());
    let y = g.values.new_val_named_and_typed("y", f32x2());
    g.inits
        .insert(w, Tensor::new(vec![2].into(), vec![1.0f32, -5.0]));
    g.add_node(Node::new(Op::Add).with_ins(vec![x, w]).with_out(h));
    g.add_node(Node::new(Op::ReLU).with_in(h).with_out(r));
    g.add_node(Node::new(Op::Mul).with_ins(vec![r, x]).with_out(y));
    g.inputs.push(x);
    g.outputs.push(y);

    for ty in [SchedulerType::Naive, SchedulerType::Greedy] {
        let mut g = g.clone();
        schedule_graph(&mut g, &SchedulerConfig::new(ty).with_memory_simulation(true)).unwrap();
        let program = emit_program(&g).unwrap();
        assert!(program
            .instructions
            .iter()
            .any(|inst| inst.opcode == Opcode::Free));

        let vm = VirtualMachine::new(program, true).unwrap();
        let inputs = [(
            "x".to_string(),
            Var::from(Tensor::new(vec![2].into(), vec![2.0f32, 3.0])),
        )]
        .into_iter()
        .collect::<FxHashMap<_, _>>();
        let outputs = vm
            .run(&inputs, VmOptions::default().with_type_check(true))
            .unwrap();
        assert!(outputs["y"].as_array().unwrap().allclose(&[6.0f32, 0.0]));
    }
}

#[test]
fn forward_and_backward_passes() {
    // Forward: h = relu(x), saved on stack 0, y = -h.
    // Backward: h' = pop(0), z = exp(h').
    let mut g = Graph::default();
    let x = g.values.new_val_named_and_typed("x", f32x2());
    let h = g.values.new_val_named_and_typed("h", f32x2());
    let y = g.values.new_val_named_and_typed("y", f32x2());
    let h_saved = g.values.new_val_named_and_typed("h_saved", f32x2());
    let z = g.values.new_val_named_and_typed("z", f32x2());
    g.add_node(Node::new(Op::ReLU).with_in(x).with_out(h));
    g.add_node(Node::new(Op::StackPush(StackPush { id: 0 })).with_in(h));
    g.add_node(Node::new(Op::Neg).with_in(h).with_out(y));
    g.add_node(Node::new(Op::StackPop(StackPop { id: 0 })).with_out(h_saved));
    g.add_node(Node::new(Op::Exp).with_in(h_saved).with_out(z));
    g.inputs.push(x);
    g.outputs.extend([y, z]);

    let config = SchedulerConfig::default();
    let forward = schedule_computation(&mut g, &[x], &[y], &config).unwrap();
    let backward = schedule_computation(&mut g, &[], &[z], &config).unwrap();
    assert_eq!(forward.len(), 3);
    assert_eq!(backward.len(), 2);

    let program = emit_program(&g).unwrap();
    let opcodes = program
        .instructions
        .iter()
        .map(|inst| inst.opcode)
        .filter(|&op| op != Opcode::Free)
        .collect::<Vec<_>>();
    assert_eq!(opcodes[0], Opcode::Relu);
    assert_eq!(&opcodes[3..], &[Opcode::StackPop, Opcode::Exp]);

    let vm = VirtualMachine::new(program, true).unwrap();
    let inputs = [(
        "x".to_string(),
        Var::from(Tensor::new(vec![2].into(), vec![1.0f32, -2.0])),
    )]
    .into_iter()
    .collect::<FxHashMap<_, _>>();
    let outputs = vm.run(&inputs, VmOptions::default()).unwrap();
    assert!(outputs["y"].as_array().unwrap().allclose(&[-1.0f32, 0.0]));
    assert!(outputs["z"]
        .as_array()
        .unwrap()
        .allclose(&[std::f32::consts::E, 1.0]));
}
