use ndarray::{IxDyn, Zip};
use tensorvm_core::tensor::{Tensor, TensorElemType, TensorElemTypeExt};

use super::{check_arity, kernel_error};
use crate::{handler::OpHandler, program::Instruction, state::State, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Sqrt,
}

struct Binary(BinaryOp);

struct Unary(UnaryOp);

pub(super) fn binary(inst: &Instruction, op: BinaryOp) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 2..=2, 1..=1)?;
    Ok(Box::new(Binary(op)))
}

pub(super) fn unary(inst: &Instruction, op: UnaryOp) -> Result<Box<dyn OpHandler>, VmError> {
    check_arity(inst, 1..=1, 1..=1)?;
    Ok(Box::new(Unary(op)))
}

impl OpHandler for Binary {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let a = state.array(inst.inputs[0])?;
        let b = state.array(inst.inputs[1])?;
        let output = compute_binary(self.0, a, b).map_err(|e| kernel_error(inst, e))?;
        state.set_var(inst.outputs[0], output)
    }
}

impl OpHandler for Unary {
    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError> {
        let x = state.array(inst.inputs[0])?;
        let output = compute_unary(self.0, x).map_err(|e| kernel_error(inst, e))?;
        state.set_var(inst.outputs[0], output)
    }
}

/// Numpy-style broadcasting of `f` over `a` and `b`.
pub(crate) fn broadcast_binary<T: TensorElemTypeExt>(
    a: &Tensor,
    b: &Tensor,
    f: impl Fn(T, T) -> T,
) -> Result<Tensor, String> {
    let dims = a
        .dims()
        .broadcast(b.dims())
        .ok_or_else(|| format!("Cannot broadcast {:?} and {:?}", a.dims(), b.dims()))?;
    let shape = IxDyn(dims.as_slice());
    let (Some(va), Some(vb)) = (a.view::<T>(), b.view::<T>()) else {
        return Err(format!(
            "Unexpected element types {:?} and {:?}",
            a.elem_ty(),
            b.elem_ty()
        ));
    };
    let (Some(va), Some(vb)) = (va.broadcast(shape.clone()), vb.broadcast(shape)) else {
        return Err(format!("Cannot broadcast {:?} and {:?}", a.dims(), b.dims()));
    };
    let output = Zip::from(&va).and(&vb).map_collect(|&x, &y| f(x, y));
    Ok(Tensor::from_array(output).with_device(a.device().clone()))
}

fn map_unary<T: TensorElemTypeExt>(x: &Tensor, f: impl Fn(T) -> T) -> Tensor {
    let data = x.data::<T>().iter().map(|&v| f(v)).collect::<Vec<_>>();
    Tensor::new(x.dims().clone(), data).with_device(x.device().clone())
}

macro_rules! float_binary {
    ($op:expr) => {
        |x, y| match $op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Pow => x.powf(y),
        }
    };
}

macro_rules! int_binary {
    ($op:expr) => {
        |x, y| match $op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => x.checked_div(y).unwrap_or_default(),
            BinaryOp::Pow => x.wrapping_pow(y.max(0) as u32),
        }
    };
}

pub(crate) fn compute_binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor, String> {
    if a.elem_ty() != b.elem_ty() {
        return Err(format!(
            "Element types differ: {:?} and {:?}",
            a.elem_ty(),
            b.elem_ty()
        ));
    }
    match a.elem_ty() {
        TensorElemType::F32 => broadcast_binary::<f32>(a, b, float_binary!(op)),
        TensorElemType::F64 => broadcast_binary::<f64>(a, b, float_binary!(op)),
        TensorElemType::I32 => broadcast_binary::<i32>(a, b, int_binary!(op)),
        TensorElemType::I64 => broadcast_binary::<i64>(a, b, int_binary!(op)),
        TensorElemType::Bool => Err("Bool tensors are not supported".to_string()),
    }
}

macro_rules! float_unary {
    ($op:expr) => {
        |x| match $op {
            UnaryOp::Neg => -x,
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    };
}

pub(crate) fn compute_unary(op: UnaryOp, x: &Tensor) -> Result<Tensor, String> {
    match (x.elem_ty(), op) {
        (TensorElemType::F32, _) => Ok(map_unary::<f32>(x, float_unary!(op))),
        (TensorElemType::F64, _) => Ok(map_unary::<f64>(x, float_unary!(op))),
        (TensorElemType::I32, UnaryOp::Neg) => Ok(map_unary::<i32>(x, |v| v.wrapping_neg())),
        (TensorElemType::I32, UnaryOp::Relu) => Ok(map_unary::<i32>(x, |v| v.max(0))),
        (TensorElemType::I64, UnaryOp::Neg) => Ok(map_unary::<i64>(x, |v| v.wrapping_neg())),
        (TensorElemType::I64, UnaryOp::Relu) => Ok(map_unary::<i64>(x, |v| v.max(0))),
        (ty, op) => Err(format!("{op:?} is not supported for {ty:?}")),
    }
}

#[test]
fn add_broadcast() {
    let a = Tensor::new(vec![2, 3].into(), vec![1.0f32, 2., 3., 4., 5., 6.]);
    let b = Tensor::new(vec![3].into(), vec![10.0f32, 20., 30.]);
    let c = compute_binary(BinaryOp::Add, &a, &b).unwrap();
    assert_eq!(c.dims().as_slice(), &[2, 3]);
    assert!(c.allclose(&[11.0f32, 22., 33., 14., 25., 36.]));

    let a = Tensor::new(vec![2, 3].into(), vec![1.0f32, 2., 3., 4., 9., 16.]);
    let b = Tensor::new(vec![2, 1].into(), vec![2.0f32, 0.5]);
    let c = compute_binary(BinaryOp::Pow, &a, &b).unwrap();
    assert!(c.allclose(&[1.0f32, 4., 9., 2., 3., 4.]));
}

#[test]
fn int_ops() {
    let a = Tensor::new(vec![3].into(), vec![7i64, -4, 9]);
    let b = Tensor::new(vec![3].into(), vec![2i64, 0, 3]);
    let c = compute_binary(BinaryOp::Div, &a, &b).unwrap();
    assert_eq!(c.data::<i64>(), &[3, 0, 3]);
    let c = compute_unary(UnaryOp::Relu, &a).unwrap();
    assert_eq!(c.data::<i64>(), &[7, 0, 9]);
    assert!(compute_unary(UnaryOp::Exp, &a).is_err());
}

#[test]
fn mismatches() {
    let a = Tensor::new(vec![2].into(), vec![1.0f32, 2.0]);
    let b = Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.0]);
    assert!(compute_binary(BinaryOp::Add, &a, &b)
        .unwrap_err()
        .starts_with("Cannot broadcast"));
    let b = Tensor::new(vec![2].into(), vec![1i32, 2]);
    assert!(compute_binary(BinaryOp::Add, &a, &b)
        .unwrap_err()
        .starts_with("Element types differ"));
}

#[test]
fn unary_floats() {
    let x = Tensor::new(vec![4].into(), vec![-1.0f32, 0.0, 1.0, 4.0]);
    let y = compute_unary(UnaryOp::Relu, &x).unwrap();
    assert!(y.allclose(&[0.0f32, 0.0, 1.0, 4.0]));
    let y = compute_unary(UnaryOp::Sigmoid, &x).unwrap();
    assert!(y.allclose(&[0.26894143f32, 0.5, 0.7310586, 0.98201376]));
    let y = compute_unary(UnaryOp::Sqrt, &Tensor::new(vec![2].into(), vec![4.0f64, 9.0])).unwrap();
    assert!(y.allclose(&[2.0f64, 3.0]));
}
