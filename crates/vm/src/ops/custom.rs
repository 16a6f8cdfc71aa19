use super::{check_arity, missing_attr};
use crate::{
    handler::OpHandler,
    program::{Attr, Instruction},
    state::State,
    VmError,
};

/// Calls a host function registered in the run options.
struct Custom {
    name: String,
}

pub(super) fn custom(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 0..=usize::MAX, 0..=usize::MAX)?;
    match &inst.attr {
        Attr::Custom { name } => Ok(Box::new(Custom { name: name.clone() })),
        _ => Err(missing_attr(inst)),
    }
}

impl OpHandler for Custom {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let error = |message: String| VmError::CustomOp {
            name: self.name.clone(),
            message,
        };
        let func = state
            .options()
            .custom_op_funcs
            .get(&self.name)
            .cloned()
            .ok_or_else(|| error("No such function".to_string()))?;
        let inputs = inst
            .inputs
            .iter()
            .map(|&id| state.array(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = func(&inputs).map_err(error)?;
        if outputs.len() != inst.outputs.len() {
            return Err(error(format!(
                "{} outputs are returned, but {} are expected",
                outputs.len(),
                inst.outputs.len()
            )));
        }
        for (&id, output) in inst.outputs.iter().zip(outputs) {
            state.set_var(id, output)?;
        }
        Ok(())
    }

    fn describe(&self, inst: &Instruction) -> String {
        format!("{} func={}", inst.debug_string(), self.name)
    }
}
