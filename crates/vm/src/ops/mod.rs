mod custom;
mod elemwise;
mod fused;
mod matmul;
mod misc;
mod sequence;
mod stack;

use std::ops::RangeInclusive;

use crate::{
    handler::OpRegistry,
    program::{Instruction, Opcode},
    VmError,
};

pub(crate) fn register_builtins(registry: &mut OpRegistry) {
    use elemwise::{BinaryOp, UnaryOp};

    registry.register(Opcode::Identity, misc::identity);
    registry.register(Opcode::Constant, misc::constant);
    registry.register(Opcode::Free, misc::free);
    registry.register(Opcode::Dropout, misc::dropout);
    registry.register(Opcode::Add, |inst| elemwise::binary(inst, BinaryOp::Add));
    registry.register(Opcode::Sub, |inst| elemwise::binary(inst, BinaryOp::Sub));
    registry.register(Opcode::Mul, |inst| elemwise::binary(inst, BinaryOp::Mul));
    registry.register(Opcode::Div, |inst| elemwise::binary(inst, BinaryOp::Div));
    registry.register(Opcode::Pow, |inst| elemwise::binary(inst, BinaryOp::Pow));
    registry.register(Opcode::Neg, |inst| elemwise::unary(inst, UnaryOp::Neg));
    registry.register(Opcode::Relu, |inst| elemwise::unary(inst, UnaryOp::Relu));
    registry.register(Opcode::Sigmoid, |inst| {
        elemwise::unary(inst, UnaryOp::Sigmoid)
    });
    registry.register(Opcode::Tanh, |inst| elemwise::unary(inst, UnaryOp::Tanh));
    registry.register(Opcode::Exp, |inst| elemwise::unary(inst, UnaryOp::Exp));
    registry.register(Opcode::Sqrt, |inst| elemwise::unary(inst, UnaryOp::Sqrt));
    registry.register(Opcode::MatMul, matmul::matmul);
    registry.register(Opcode::StackPush, stack::push);
    registry.register(Opcode::StackPop, stack::pop);
    registry.register(Opcode::SequenceCreate, sequence::create);
    registry.register(Opcode::SequenceAppend, sequence::append);
    registry.register(Opcode::SequenceLookup, sequence::lookup);
    registry.register(Opcode::FusedElemwise, fused::fused_elemwise);
    registry.register(Opcode::Custom, custom::custom);
}

fn check_arity(
    inst: &Instruction,
    inputs: RangeInclusive<usize>,
    outputs: RangeInclusive<usize>,
) -> Result<(), VmError> {
    if inputs.contains(&inst.inputs.len()) && outputs.contains(&inst.outputs.len()) {
        return Ok(());
    }
    Err(VmError::InvalidProgram(
        format!(
            "{} takes {:?} inputs and {:?} outputs: {}",
            inst.opcode.name(),
            inputs,
            outputs,
            inst.debug_string()
        )
        .into(),
    ))
}

fn missing_attr(inst: &Instruction) -> VmError {
    VmError::InvalidProgram(format!("Missing attribute: {}", inst.debug_string()).into())
}

fn kernel_error(inst: &Instruction, msg: impl std::fmt::Display) -> VmError {
    VmError::Message(format!("{}: {}", inst.opcode.name(), msg).into())
}
