use tensorvm_core::tensor::{Tensor, TensorElemType};

use super::{check_arity, kernel_error};
use crate::{handler::OpHandler, program::Instruction, state::State, var::Var, VmError};

struct SequenceCreate;

struct SequenceAppend;

struct SequenceLookup;

pub(super) fn create(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 0..=usize::MAX, 1..=1)?;
    Ok(Box::new(SequenceCreate))
}

pub(super) fn append(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 2..=2, 1..=1)?;
    Ok(Box::new(SequenceAppend))
}

pub(super) fn lookup(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 2..=2, 1..=1)?;
    Ok(Box::new(SequenceLookup))
}

fn sequence<'a>(inst: &Instruction, var: &'a Var) -> Result<&'a [Tensor], VmError> {
    var.as_sequence()
        .ok_or_else(|| kernel_error(inst, format!("Expected a sequence, but got {}", var.kind())))
}

impl OpHandler for SequenceCreate {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let seq = inst
            .inputs
            .iter()
            .map(|&id| state.array(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        state.set_var(inst.outputs[0], Var::Sequence(seq))
    }
}

impl OpHandler for SequenceAppend {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let mut seq = sequence(inst, state.var(inst.inputs[0])?)?.to_vec();
        seq.push(state.array(inst.inputs[1])?.clone());
        state.set_var(inst.outputs[0], Var::Sequence(seq))
    }
}

impl OpHandler for SequenceLookup {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let seq = sequence(inst, state.var(inst.inputs[0])?)?;
        let index = state.array(inst.inputs[1])?;
        let index = match index.elem_ty() {
            TensorElemType::I64 if index.num_elems() == 1 => index.data::<i64>()[0],
            TensorElemType::I32 if index.num_elems() == 1 => index.data::<i32>()[0] as i64,
            _ => return Err(kernel_error(inst, "Index must be an integer scalar")),
        };
        let len = seq.len() as i64;
        let resolved = if index < 0 { index + len } else { index };
        if !(0..len).contains(&resolved) {
            return Err(kernel_error(
                inst,
                format!("Index {index} is out of range for a sequence of {len}"),
            ));
        }
        let tensor = seq[resolved as usize].clone();
        state.set_var(inst.outputs[0], tensor)
    }
}
