use rand::Rng;
use tensorvm_core::tensor::{Tensor, TensorElemType};

use super::{check_arity, kernel_error, missing_attr};
use crate::{
    handler::OpHandler,
    program::{Attr, Instruction},
    state::State,
    var::Var,
    VmError,
};

struct Identity;

struct Constant(Tensor);

struct Free;

struct Dropout {
    ratio: f32,
}

pub(super) fn identity(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 1..=1, 1..=1)?;
    Ok(Box::new(Identity))
}

pub(super) fn constant(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 0..=0, 1..=1)?;
    match &inst.attr {
        Attr::Constant(value) => Ok(Box::new(Constant(value.clone()))),
        _ => Err(missing_attr(inst)),
    }
}

pub(super) fn free(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 0..=usize::MAX, 0..=0)?;
    Ok(Box::new(Free))
}

pub(super) fn dropout(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 1..=1, 1..=2)?;
    match inst.attr {
        Attr::Dropout { ratio } if (0.0..1.0).contains(&ratio) => Ok(Box::new(Dropout { ratio })),
        Attr::Dropout { ratio } => Err(VmError::InvalidProgram(
            format!("Dropout ratio must be in [0, 1): {ratio}").into(),
        )),
        _ => Err(missing_attr(inst)),
    }
}

impl OpHandler for Identity {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let var = state.var(inst.inputs[0])?.clone();
        state.set_var(inst.outputs[0], var)
    }
}

impl OpHandler for Constant {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        state.set_var(inst.outputs[0], self.0.clone())
    }
}

impl OpHandler for Free {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        for &id in &inst.inputs {
            state.free_var(id);
        }
        Ok(())
    }
}

impl OpHandler for Dropout {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let x = state.array(inst.inputs[0])?;
        let training = state.options().is_training && self.ratio > 0.0;
        if !training {
            let mask = Tensor::new(x.dims().clone(), vec![true; x.dims().total_elems()]);
            let y = x.clone();
            state.set_var(inst.outputs[0], y)?;
            if let Some(&mask_id) = inst.outputs.get(1) {
                state.set_var(mask_id, mask)?;
            }
            return Ok(());
        }

        if x.elem_ty() != TensorElemType::F32 {
            return Err(kernel_error(
                inst,
                format!("{:?} is not supported in training", x.elem_ty()),
            ));
        }
        let scale = 1.0 / (1.0 - self.ratio);
        let mut rng = rand::thread_rng();
        let mask = (0..x.dims().total_elems())
            .map(|_| rng.gen::<f32>() >= self.ratio)
            .collect::<Vec<_>>();
        let y = x
            .data::<f32>()
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect::<Vec<_>>();
        let dims = x.dims().clone();
        let device = x.device().clone();
        state.set_var(inst.outputs[0], Tensor::new(dims.clone(), y).with_device(device))?;
        if let Some(&mask_id) = inst.outputs.get(1) {
            state.set_var(mask_id, Var::Array(Tensor::new(dims, mask)))?;
        }
        Ok(())
    }
}
