use ndarray::{ArrayView2, Ix2, LinalgScalar};
use tensorvm_core::tensor::{Tensor, TensorElemType, TensorElemTypeExt};

use super::{check_arity, kernel_error};
use crate::{handler::OpHandler, program::Instruction, state::State, VmError};

struct MatMul;

pub(super) fn matmul(inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 2..=2, 1..=1)?;
    Ok(Box::new(MatMul))
}

impl OpHandler for MatMul {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let a = state.array(inst.inputs[0])?;
        let b = state.array(inst.inputs[1])?;
        let output = compute_matmul(a, b).map_err(|e| kernel_error(inst, e))?;
        state.set_var(inst.outputs[0], output)
    }
}

fn as_matrix<T: TensorElemTypeExt>(t: &Tensor) -> Result<ArrayView2<'_, T>, String> {
    t.view::<T>()
        .and_then(|v| v.into_dimensionality::<Ix2>().ok())
        .ok_or_else(|| format!("Expected a matrix, but got {:?}", t.dims()))
}

fn dot<T: TensorElemTypeExt + LinalgScalar>(a: &Tensor, b: &Tensor) -> Result<Tensor, String> {
    let (ma, mb) = (as_matrix::<T>(a)?, as_matrix::<T>(b)?);
    if ma.ncols() != mb.nrows() {
        return Err(format!(
            "Inner dimensions differ: {:?} and {:?}",
            a.dims(),
            b.dims()
        ));
    }
    Ok(Tensor::from_array(ma.dot(&mb).into_dyn()).with_device(a.device().clone()))
}

/// Product of two 2-D tensors of the same element type.
pub(crate) fn compute_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, String> {
    if a.elem_ty() != b.elem_ty() {
        return Err(format!(
            "Element types differ: {:?} and {:?}",
            a.elem_ty(),
            b.elem_ty()
        ));
    }
    match a.elem_ty() {
        TensorElemType::F32 => dot::<f32>(a, b),
        TensorElemType::F64 => dot::<f64>(a, b),
        TensorElemType::I32 => dot::<i32>(a, b),
        TensorElemType::I64 => dot::<i64>(a, b),
        TensorElemType::Bool => Err("Bool tensors are not supported".to_string()),
    }
}

#[test]
fn matmul_2d() {
    let a = Tensor::new(vec![2, 3].into(), vec![1.0f32, 2., 3., 4., 5., 6.]);
    let b = Tensor::new(vec![3, 2].into(), vec![7.0f32, 8., 9., 10., 11., 12.]);
    let c = compute_matmul(&a, &b).unwrap();
    assert_eq!(c.dims().as_slice(), &[2, 2]);
    assert!(c.allclose(&[58.0f32, 64., 139., 154.]));

    assert!(compute_matmul(&a, &a)
        .unwrap_err()
        .starts_with("Inner dimensions differ"));
    let v = Tensor::new(vec![3].into(), vec![1.0f32, 2., 3.]);
    assert!(compute_matmul(&v, &b)
        .unwrap_err()
        .starts_with("Expected a matrix"));
}
