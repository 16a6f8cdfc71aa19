use std::sync::Arc;

use ndarray::IxDyn;
use tensorvm_core::{fixed_dim::broadcast, tensor::Tensor};

use super::{check_arity, kernel_error, missing_attr};
use crate::{
    handler::OpHandler,
    kernel_cache::{CompiledKernel, KernelCache},
    program::{Attr, Instruction},
    state::State,
    VmError,
};

/// An element-wise region compiled once in `init`.
struct FusedElemwise {
    name: String,
    code: String,
    kernel: Option<Arc<CompiledKernel>>,
}

pub(super) fn fused_elemwise(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 1..=usize::MAX, 1..=1)?;
    match &inst.attr {
        Attr::FusedElemwise { name, code } => Ok(Box::new(FusedElemwise {
            name: name.clone(),
            code: code.clone(),
            kernel: None,
        })),
        _ => Err(missing_attr(inst)),
    }
}

impl OpHandler for FusedElemwise {
    fn init(&mut self, kernels: &KernelCache) -> Result<(), VmError> {
        let kernel = kernels.get_or_compile(&self.code)?;
        log::debug!("Fused kernel {} ready", self.name);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let kernel = self.kernel.as_ref().ok_or(VmError::NotInitialized)?;
        if kernel.num_inputs() > inst.inputs.len() {
            return Err(VmError::Kernel(
                format!(
                    "{} reads {} inputs, but {} are given",
                    self.name,
                    kernel.num_inputs(),
                    inst.inputs.len()
                )
                .into(),
            ));
        }
        let inputs = inst
            .inputs
            .iter()
            .map(|&id| state.array(id))
            .collect::<Result<Vec<_>, _>>()?;
        let output = run_kernel(kernel, &inputs).map_err(|e| kernel_error(inst, e))?;
        state.set_var(inst.outputs[0], output)
    }

    fn describe(&self, inst: &Instruction) -> String {
        format!("{} kernel={}", inst.debug_string(), self.name)
    }
}

fn run_kernel(kernel: &CompiledKernel, inputs: &[&Tensor]) -> Result<Tensor, String> {
    let dims = broadcast(&inputs.iter().map(|t| t.dims()).collect::<Vec<_>>())
        .ok_or("Inputs cannot be broadcast")?;
    let shape = IxDyn(dims.as_slice());
    let views = inputs
        .iter()
        .map(|t| {
            t.view::<f32>()
                .ok_or_else(|| format!("Fused kernels take F32, but got {:?}", t.elem_ty()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let views = views
        .iter()
        .map(|v| v.broadcast(shape.clone()).ok_or("Inputs cannot be broadcast"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut iters = views.iter().map(|v| v.iter()).collect::<Vec<_>>();
    let mut args = vec![0.0f32; iters.len()];
    let mut stack = vec![];
    let mut data = Vec::with_capacity(dims.total_elems());
    for _ in 0..dims.total_elems() {
        for (arg, it) in args.iter_mut().zip(iters.iter_mut()) {
            *arg = it.next().copied().unwrap_or_default();
        }
        data.push(kernel.eval(&args, &mut stack));
    }
    Ok(Tensor::new(dims, data).with_device(inputs[0].device().clone()))
}

#[test]
fn fused_broadcast() {
    let kernel = CompiledKernel::compile("$0 $1 mul 1 add").unwrap();
    let a = Tensor::new(vec![2, 2].into(), vec![1.0f32, 2.0, 3.0, 4.0]);
    let b = Tensor::new(vec![2].into(), vec![10.0f32, 100.0]);
    let c = run_kernel(&kernel, &[&a, &b]).unwrap();
    assert!(c.allclose(&[11.0f32, 201.0, 31.0, 401.0]));
}
