use rustc_hash::{FxHashMap, FxHashSet};
use tensorvm_core::{
    flops::estimate_flops,
    graph::Graph,
    node::NodeId,
    op::Op,
    value::{Value, ValueId},
};

use crate::{
    program::{Attr, InputDesc, Instruction, Opcode, OutputDesc, Program, TypeDecl, NO_VALUE},
    VmError,
};

/// Lowers the scheduled part of `graph` into a program. Nodes are emitted
/// in stamp order and every node-produced value that is not a graph output
/// is freed right after its last consumer.
pub fn emit_program(graph: &Graph) -> Result<Program, VmError> {
    let order = graph.scheduled_nodes();
    let mut emitter = Emitter {
        graph,
        slots: FxHashMap::default(),
        program: Program::new(),
    };

    for &input in &graph.inputs {
        let slot = emitter.alloc(input);
        let value = &graph.values[input];
        let ty = value
            .ty
            .to_fixed()
            .map(|shape| TypeDecl::new(shape.elem_ty, shape.dims));
        emitter.program.inputs.push(InputDesc {
            name: value.display_name().to_string(),
            slot,
            ty,
        });
    }

    for param in graph.input_values() {
        let Some(tensor) = graph.inits.get(&param) else {
            continue;
        };
        if graph.inputs.contains(&param) {
            continue;
        }
        let slot = emitter.alloc(param);
        let value = &graph.values[param];
        emitter.program.push(
            Instruction::new(Opcode::Constant)
                .with_attr(Attr::Constant(tensor.clone()))
                .with_outs(vec![slot])
                .with_output_types(vec![output_type(value)])
                .with_output_names(vec![value.name.clone()])
                .with_debug_info(format!("param {}", value.display_name())),
        );
    }

    let graph_outputs = graph.outputs.iter().copied().collect::<FxHashSet<_>>();
    let mut last_use = FxHashMap::default();
    for (i, &id) in order.iter().enumerate() {
        for &input in &graph.node(id).inputs {
            last_use.insert(input, i);
        }
    }

    for (i, &id) in order.iter().enumerate() {
        emitter.emit_node(id)?;

        let node = graph.node(id);
        let mut to_free = node
            .inputs
            .iter()
            .filter(|v| last_use.get(v) == Some(&i))
            .chain(node.outputs.iter().filter(|v| !last_use.contains_key(v)))
            .filter(|v| !graph_outputs.contains(v) && graph.values[**v].producer().is_some())
            .filter_map(|v| emitter.slots.get(v).copied())
            .filter(|&slot| slot != NO_VALUE)
            .collect::<Vec<_>>();
        to_free.sort_unstable();
        to_free.dedup();
        if !to_free.is_empty() {
            emitter
                .program
                .push(Instruction::new(Opcode::Free).with_ins(to_free));
        }
    }

    for &output in &graph.outputs {
        let slot = emitter.slot(output)?;
        emitter.program.outputs.push(OutputDesc {
            name: graph.values[output].display_name().to_string(),
            slot,
        });
    }

    log::debug!(
        "emit_program: {} nodes, {} instructions, {} variables",
        order.len(),
        emitter.program.instructions.len(),
        emitter.program.num_variables()
    );

    Ok(emitter.program)
}

struct Emitter<'a> {
    graph: &'a Graph,
    slots: FxHashMap<ValueId, usize>,
    program: Program,
}

impl<'a> Emitter<'a> {
    fn alloc(&mut self, value: ValueId) -> usize {
        if self.graph.values[value].is_null() {
            return NO_VALUE;
        }
        let next = self.slots.len() + 1;
        *self.slots.entry(value).or_insert(next)
    }

    fn slot(&self, value: ValueId) -> Result<usize, VmError> {
        if self.graph.values[value].is_null() {
            return Ok(NO_VALUE);
        }
        self.slots.get(&value).copied().ok_or_else(|| {
            VmError::InvalidProgram(
                format!(
                    "'{}' is used before it is computed",
                    self.graph.values[value].display_name()
                )
                .into(),
            )
        })
    }

    fn emit_node(&mut self, id: NodeId) -> Result<(), VmError> {
        let graph = self.graph;
        let node = graph.node(id);
        let (opcode, attr) = lower_op(&node.op);

        let inputs = node
            .inputs
            .iter()
            .map(|&v| self.slot(v))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = node
            .outputs
            .iter()
            .map(|&v| self.alloc(v))
            .collect::<Vec<_>>();
        let values = node
            .outputs
            .iter()
            .map(|&v| &graph.values[v])
            .collect::<Vec<_>>();

        self.program.push(
            Instruction::new(opcode)
                .with_attr(attr)
                .with_ins(inputs)
                .with_outs(outputs)
                .with_output_types(values.iter().map(|v| output_type(v)).collect())
                .with_output_names(values.iter().map(|v| v.name.clone()).collect())
                .with_debug_info(graph.debug_string(id))
                .with_flops(estimate_flops(graph, id)),
        );
        Ok(())
    }
}

fn output_type(value: &Value) -> Option<TypeDecl> {
    value
        .ty
        .to_fixed()
        .map(|shape| TypeDecl::new(shape.elem_ty, shape.dims))
}

fn lower_op(op: &Op) -> (Opcode, Attr) {
    match op {
        Op::Identity => (Opcode::Identity, Attr::None),
        Op::Add => (Opcode::Add, Attr::None),
        Op::Sub => (Opcode::Sub, Attr::None),
        Op::Mul => (Opcode::Mul, Attr::None),
        Op::Div => (Opcode::Div, Attr::None),
        Op::Pow => (Opcode::Pow, Attr::None),
        Op::Neg => (Opcode::Neg, Attr::None),
        Op::ReLU => (Opcode::Relu, Attr::None),
        Op::Sigmoid => (Opcode::Sigmoid, Attr::None),
        Op::Tanh => (Opcode::Tanh, Attr::None),
        Op::Exp => (Opcode::Exp, Attr::None),
        Op::Sqrt => (Opcode::Sqrt, Attr::None),
        Op::MatMul => (Opcode::MatMul, Attr::None),
        Op::Dropout(d) => (Opcode::Dropout, Attr::Dropout { ratio: d.ratio }),
        Op::Constant(c) => (Opcode::Constant, Attr::Constant(c.value.clone())),
        Op::StackPush(s) => (Opcode::StackPush, Attr::Stack { id: s.id }),
        Op::StackPop(s) => (Opcode::StackPop, Attr::Stack { id: s.id }),
        Op::FusedElemwise(f) => (
            Opcode::FusedElemwise,
            Attr::FusedElemwise {
                name: f.name.clone(),
                code: f.code.clone(),
            },
        ),
        Op::Custom(c) => (Opcode::Custom, Attr::Custom { name: c.name.clone() }),
    }
}

#[cfg(test)]
fn relu_add_graph() -> Graph {
    use tensorvm_core::{
        node::Node,
        scheduler::{schedule_graph, SchedulerConfig, SchedulerType},
        tensor::{Tensor, TensorElemType},
        value::ValueType,
    };

    let ty = || ValueType::new(TensorElemType::F32, vec![2]);
    let mut g = Graph::default();
    let x = g.values.new_val_named_and_typed("x", ty());
    let w = g.values.new_val_named_and_typed("w", ty());
    let h = g.values.new_val_named_and_typed("h", ty());
    let y = g.values.new_val_named_and_typed("y", ty());
    g.inits
        .insert(w, Tensor::new(vec![2].into(), vec![1.0f32, -1.0]));
    g.add_node(
        Node::new(Op::Add)
            .with_name("add0")
            .with_ins(vec![x, w])
            .with_out(h),
    );
    g.add_node(Node::new(Op::ReLU).with_name("relu0").with_in(h).with_out(y));
    g.inputs.push(x);
    g.outputs.push(y);
    schedule_graph(&mut g, &SchedulerConfig::new(SchedulerType::Naive)).unwrap();
    g
}

#[test]
fn lower_relu_add() {
    let program = emit_program(&relu_add_graph()).unwrap();
    let listing = program
        .instructions
        .iter()
        .map(|inst| {
            format!(
                "#{} {:?} {:?} -> {:?}",
                inst.id, inst.opcode, inst.inputs, inst.outputs
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    insta::assert_snapshot!(listing, @r###"
    #0 Constant [] -> [2]
    #1 Add [1, 2] -> [3]
    #2 Relu [3] -> [4]
    #3 Free [3] -> []
    "###);
    assert_eq!(program.inputs[0].name, "x");
    assert_eq!(program.inputs[0].slot, 1);
    assert_eq!(format!("{:?}", program.inputs[0].ty), "Some(F32[2])");
    assert_eq!(program.outputs[0].name, "y");
    assert_eq!(program.outputs[0].slot, 4);
    assert_eq!(program.num_variables(), 5);
    assert_eq!(program.instructions[1].flops, 2);
    assert_eq!(program.instructions[1].output_name(0), Some("h"));
}

#[test]
fn null_values_use_no_value_slot() {
    use tensorvm_core::{
        node::Node,
        op::Dropout,
        scheduler::{schedule_graph, SchedulerConfig},
    };

    let mut g = Graph::default();
    let x = g.values.new_val_named("x");
    let y = g.values.new_val_named("y");
    let mask = g.values.new_null();
    g.add_node(
        Node::new(Op::Dropout(Dropout { ratio: 0.5 }))
            .with_in(x)
            .with_outs(vec![y, mask]),
    );
    g.inputs.push(x);
    g.outputs.push(y);
    schedule_graph(&mut g, &SchedulerConfig::default()).unwrap();

    let program = emit_program(&g).unwrap();
    assert_eq!(program.instructions.len(), 1);
    assert_eq!(program.instructions[0].outputs, vec![2, NO_VALUE]);
    assert_eq!(program.instructions[0].attr, Attr::Dropout { ratio: 0.5 });
}
