use std::{cell::RefCell, fmt, sync::Arc};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rand::{
    distributions::Standard, prelude::Distribution, rngs::StdRng, thread_rng, Rng, SeedableRng,
};

use crate::fixed_dim::FixedDimensions;

thread_local!(static RNG: RefCell<StdRng> =
    RefCell::new(StdRng::from_rng(thread_rng()).expect("Failed to seed StdRng.")));

/// A typed, shaped, device-placed array. Storage is shared and cloned on
/// write, so cloning a `Tensor` is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: FixedDimensions,
    data: Arc<TensorData>,
    device: Device,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// Where the storage of a tensor lives. The core never moves data between
/// devices; the tag is carried along for handlers and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    Named(String),
}

/// Represents a type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedFixedShape {
    pub dims: FixedDimensions,
    pub elem_ty: TensorElemType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorElemType {
    Bool,
    F32,
    F64,
    I32,
    I64,
}

pub trait TensorElemTypeExt: PartialEq + PartialOrd + Copy + fmt::Debug + Send + Sync {
    fn get_type() -> TensorElemType;
    fn zero() -> Self;
    fn close(a: Self, b: Self) -> bool;
    fn wrap(data: Vec<Self>) -> TensorData;
    fn unwrap_ref(data: &TensorData) -> Option<&[Self]>;
    fn unwrap_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

impl Tensor {
    pub fn new<T: TensorElemTypeExt>(dims: FixedDimensions, data: Vec<T>) -> Self {
        Self {
            dims,
            data: Arc::new(T::wrap(data)),
            device: Device::Cpu,
        }
    }

    pub fn scalar<T: TensorElemTypeExt>(value: T) -> Self {
        Self::new(FixedDimensions::default(), vec![value])
    }

    pub fn zeros<T: TensorElemTypeExt>(dims: FixedDimensions) -> Self {
        let total_elems = dims.total_elems();
        Self::new(dims, vec![T::zero(); total_elems])
    }

    pub fn zeros_of_type(ty: TensorElemType, dims: FixedDimensions) -> Self {
        match ty {
            TensorElemType::Bool => Self::zeros::<bool>(dims),
            TensorElemType::F32 => Self::zeros::<f32>(dims),
            TensorElemType::F64 => Self::zeros::<f64>(dims),
            TensorElemType::I32 => Self::zeros::<i32>(dims),
            TensorElemType::I64 => Self::zeros::<i64>(dims),
        }
    }

    pub fn rand<T>(dims: FixedDimensions) -> Self
    where
        T: TensorElemTypeExt,
        Standard: Distribution<T>,
    {
        let total_elems = dims.total_elems();
        Self::new(
            dims,
            RNG.with(|r| {
                (&mut *r.borrow_mut())
                    .sample_iter(Standard)
                    .take(total_elems)
                    .collect::<Vec<T>>()
            }),
        )
    }

    pub fn rand_of_type(ty: TensorElemType, dims: FixedDimensions) -> Self {
        match ty {
            TensorElemType::Bool => Self::rand::<bool>(dims),
            TensorElemType::F32 => Self::rand::<f32>(dims),
            TensorElemType::F64 => Self::rand::<f64>(dims),
            TensorElemType::I32 => Self::rand::<i32>(dims),
            TensorElemType::I64 => Self::rand::<i64>(dims),
        }
    }

    pub fn seed_rng_from_u64(seed: u64) {
        RNG.with(|r| *r.borrow_mut() = StdRng::seed_from_u64(seed));
    }

    /// Builds a tensor from an owned ndarray, copying it into standard layout.
    pub fn from_array<T: TensorElemTypeExt>(arr: ArrayD<T>) -> Self {
        let dims = FixedDimensions::from(arr.shape());
        Self::new(dims, arr.iter().copied().collect())
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn dims(&self) -> &FixedDimensions {
        &self.dims
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn elem_ty(&self) -> TensorElemType {
        match *self.data {
            TensorData::Bool(_) => TensorElemType::Bool,
            TensorData::F32(_) => TensorElemType::F32,
            TensorData::F64(_) => TensorElemType::F64,
            TensorData::I32(_) => TensorElemType::I32,
            TensorData::I64(_) => TensorElemType::I64,
        }
    }

    pub fn typed_shape(&self) -> TypedFixedShape {
        TypedFixedShape::new(self.dims.clone(), self.elem_ty())
    }

    pub fn data<T: TensorElemTypeExt>(&self) -> &[T] {
        assert_eq!(self.elem_ty(), T::get_type());
        self.try_data().unwrap_or_default()
    }

    pub fn try_data<T: TensorElemTypeExt>(&self) -> Option<&[T]> {
        T::unwrap_ref(&self.data)
    }

    pub fn data_mut<T: TensorElemTypeExt>(&mut self) -> &mut [T] {
        assert_eq!(self.elem_ty(), T::get_type());
        T::unwrap_mut(Arc::make_mut(&mut self.data)).unwrap_or_default()
    }

    pub fn raw(&self) -> &TensorData {
        &self.data
    }

    /// Returns an ndarray view if the element type is `T` and the storage
    /// matches the dimensions.
    pub fn view<T: TensorElemTypeExt>(&self) -> Option<ArrayViewD<'_, T>> {
        ArrayViewD::from_shape(IxDyn(self.dims.as_slice()), self.try_data::<T>()?).ok()
    }

    pub fn reshape(&self, dims: FixedDimensions) -> Option<Self> {
        if dims.total_elems() != self.dims.total_elems() {
            return None;
        }
        Some(Self {
            dims,
            data: self.data.clone(),
            device: self.device.clone(),
        })
    }

    pub fn num_elems(&self) -> usize {
        match &*self.data {
            TensorData::Bool(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn nbytes(&self) -> usize {
        self.num_elems() * self.elem_ty().size()
    }

    pub fn verify(&self) -> bool {
        self.num_elems() == self.dims.total_elems()
    }

    pub fn has_nan(&self) -> bool {
        match &*self.data {
            TensorData::F32(v) => v.iter().any(|x| x.is_nan()),
            TensorData::F64(v) => v.iter().any(|x| x.is_nan()),
            _ => false,
        }
    }

    pub fn has_inf(&self) -> bool {
        match &*self.data {
            TensorData::F32(v) => v.iter().any(|x| x.is_infinite()),
            TensorData::F64(v) => v.iter().any(|x| x.is_infinite()),
            _ => false,
        }
    }

    pub fn allclose<T: TensorElemTypeExt>(&self, other: &[T]) -> bool {
        let Some(x) = self.try_data::<T>() else {
            return false;
        };
        x.len() == other.len() && x.iter().zip(other).all(|(&x, &y)| T::close(x, y))
    }
}

impl TypedFixedShape {
    pub fn new(dims: FixedDimensions, elem_ty: TensorElemType) -> Self {
        Self { dims, elem_ty }
    }

    pub fn nbytes(&self) -> usize {
        self.dims.total_elems() * self.elem_ty.size()
    }
}

impl TensorElemType {
    pub fn size(&self) -> usize {
        match self {
            TensorElemType::Bool => std::mem::size_of::<bool>(),
            TensorElemType::F32 => std::mem::size_of::<f32>(),
            TensorElemType::F64 => std::mem::size_of::<f64>(),
            TensorElemType::I32 => std::mem::size_of::<i32>(),
            TensorElemType::I64 => std::mem::size_of::<i64>(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

macro_rules! impl_elem_type {
    ($ty:ty, $variant:ident, $zero:expr, $close:expr) => {
        impl TensorElemTypeExt for $ty {
            fn get_type() -> TensorElemType {
                TensorElemType::$variant
            }

            fn zero() -> Self {
                $zero
            }

            fn close(a: Self, b: Self) -> bool {
                $close(a, b)
            }

            fn wrap(data: Vec<Self>) -> TensorData {
                TensorData::$variant(data)
            }

            fn unwrap_ref(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn unwrap_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

fn exact<T: PartialEq>(a: T, b: T) -> bool {
    a == b
}

impl_elem_type!(bool, Bool, false, exact);
impl_elem_type!(i32, I32, 0, exact);
impl_elem_type!(i64, I64, 0, exact);
impl_elem_type!(f32, F32, 0.0, |a: f32, b: f32| {
    ((a - b).abs() <= (1e-5 + 1e-8 * b.abs()))
        || (a.is_infinite() && b.is_infinite() && a.is_sign_positive() == b.is_sign_positive())
});
impl_elem_type!(f64, F64, 0.0, |a: f64, b: f64| {
    ((a - b).abs() <= (1e-8 + 1e-12 * b.abs()))
        || (a.is_infinite() && b.is_infinite() && a.is_sign_positive() == b.is_sign_positive())
});

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dump<T: fmt::Debug>(f: &mut fmt::Formatter<'_>, data: &[T]) -> fmt::Result {
            const MAX_ELEMS: usize = 10;
            if data.len() > MAX_ELEMS {
                write!(f, "[")?;
                for e in data[0..MAX_ELEMS / 2].iter() {
                    write!(f, "{e:?}, ")?;
                }
                write!(f, "...")?;
                for e in data[data.len() - MAX_ELEMS / 2..].iter() {
                    write!(f, ", {e:?}")?;
                }
                write!(f, "]")
            } else {
                write!(f, "{data:?}")
            }
        }

        write!(f, "Tensor({:?}, {:?}, ", self.dims, self.elem_ty())?;
        match &*self.data {
            TensorData::Bool(v) => dump(f, v)?,
            TensorData::F32(v) => dump(f, v)?,
            TensorData::F64(v) => dump(f, v)?,
            TensorData::I32(v) => dump(f, v)?,
            TensorData::I64(v) => dump(f, v)?,
        }
        write!(f, ")")
    }
}

#[test]
fn dump_f32_tensor() {
    let t = Tensor::new(vec![2, 2].into(), vec![1.0f32, 2.0, 3.0, 4.0]);
    insta::assert_snapshot!(t, @"Tensor([2, 2], F32, [1.0, 2.0, 3.0, 4.0])");
}

#[test]
fn dump_long_tensor() {
    let t = Tensor::new(vec![12].into(), (0..12).collect::<Vec<i64>>());
    insta::assert_snapshot!(t, @"Tensor([12], I64, [0, 1, 2, 3, 4, ..., 7, 8, 9, 10, 11])");
}

#[test]
fn create_tensors() {
    assert!(Tensor::zeros::<bool>(vec![1, 1, 28, 28].into()).verify());
    assert!(Tensor::zeros::<f32>(vec![1, 1, 28, 28].into()).verify());
    assert!(Tensor::zeros_of_type(TensorElemType::I64, vec![3, 4].into()).verify());
    assert!(!Tensor::new::<f32>(vec![3, 4].into(), vec![]).verify());
    assert_eq!(Tensor::scalar(1.5f64).dims().total_elems(), 1);
}

#[test]
fn copy_on_write() {
    let a = Tensor::new(vec![2].into(), vec![1i32, 2]);
    let mut b = a.clone();
    b.data_mut::<i32>()[0] = 10;
    assert_eq!(a.data::<i32>(), &[1, 2]);
    assert_eq!(b.data::<i32>(), &[10, 2]);
}

#[test]
fn nbytes_and_checks() {
    let t = Tensor::new(vec![3].into(), vec![1.0f32, f32::NAN, f32::INFINITY]);
    assert_eq!(t.nbytes(), 12);
    assert!(t.has_nan());
    assert!(t.has_inf());
    assert!(!Tensor::zeros::<f64>(vec![4].into()).has_nan());
    assert_eq!(TensorElemType::I64.size(), 8);
    assert_eq!(TensorElemType::Bool.size(), 1);
}

#[test]
fn view_and_from_array() {
    let t = Tensor::new(vec![2, 3].into(), vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let v = t.view::<f32>().unwrap();
    assert_eq!(v.shape(), &[2, 3]);
    assert!(t.view::<i32>().is_none());
    let transposed = Tensor::from_array(v.t().to_owned());
    assert_eq!(transposed.dims().as_slice(), &[3, 2]);
    assert!(transposed.allclose(&[0.0f32, 3.0, 1.0, 4.0, 2.0, 5.0]));
}

#[test]
fn tensor_rand_of_type() {
    Tensor::seed_rng_from_u64(42);
    let x = Tensor::rand_of_type(TensorElemType::F32, vec![3, 6, 2].into());
    let y = Tensor::rand_of_type(TensorElemType::F32, vec![3, 6, 2].into());
    assert_ne!(x, y);
    assert_eq!(x.device(), &Device::Cpu);
}
