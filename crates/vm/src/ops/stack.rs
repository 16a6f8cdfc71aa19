use super::{check_arity, missing_attr};
use crate::{
    handler::OpHandler,
    program::{Attr, Instruction},
    state::State,
    VmError,
};

/// Saves a value for a later pass.
struct StackPush {
    id: i64,
}

struct StackPop {
    id: i64,
}

fn stack_id(inst: &Instruction) -> Result<i64, VmError> {
    match inst.attr {
        Attr::Stack { id } => Ok(id),
        _ => Err(missing_attr(inst)),
    }
}

pub(super) fn push(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 1..=1, 0..=0)?;
    Ok(Box::new(StackPush {
        id: stack_id(inst)?,
    }))
}

pub(super) fn pop(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 0..=0, 1..=1)?;
    Ok(Box::new(StackPop {
        id: stack_id(inst)?,
    }))
}

impl OpHandler for StackPush {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let var = state.var(inst.inputs[0])?.clone();
        state.push_stack(self.id, var);
        Ok(())
    }
}

impl OpHandler for StackPop {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let var = state.pop_stack(self.id)?;
        state.set_var(inst.outputs[0], var)
    }
}
