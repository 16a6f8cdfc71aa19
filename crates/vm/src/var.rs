use std::{any::Any, fmt, sync::Arc};

use tensorvm_core::tensor::Tensor;

/// Content of a variable slot.
#[derive(Clone)]
pub enum Var {
    /// Intentionally no value, which is different from an unset slot.
    Null,
    Array(Tensor),
    Sequence(Vec<Tensor>),
    /// Anything else a handler wants to keep in a slot.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Var {
    pub fn is_null(&self) -> bool {
        matches!(self, Var::Null)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Var::Array(_))
    }

    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            Var::Array(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Tensor> {
        match self {
            Var::Array(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Tensor]> {
        match self {
            Var::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn nbytes(&self) -> usize {
        match self {
            Var::Array(t) => t.nbytes(),
            Var::Sequence(s) => s.iter().map(Tensor::nbytes).sum(),
            Var::Null | Var::Opaque(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Var::Null => "null",
            Var::Array(_) => "array",
            Var::Sequence(_) => "sequence",
            Var::Opaque(_) => "opaque",
        }
    }

    /// Short description for logs: type and shape, not contents.
    pub fn debug_string(&self) -> String {
        match self {
            Var::Array(t) => format!("{:?}{:?}", t.elem_ty(), t.dims()),
            Var::Sequence(s) => format!("sequence({})", s.len()),
            v => v.kind().to_string(),
        }
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Null => write!(f, "Null"),
            Var::Array(t) => write!(f, "Array({})", t),
            Var::Sequence(s) => f.debug_tuple("Sequence").field(s).finish(),
            Var::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

impl From<Tensor> for Var {
    fn from(t: Tensor) -> Self {
        Var::Array(t)
    }
}

#[test]
fn var_kinds() {
    let t = Tensor::new(vec![2].into(), vec![1.0f32, 2.0]);
    let v = Var::from(t.clone());
    assert!(v.is_array());
    assert_eq!(v.nbytes(), 8);
    assert_eq!(v.debug_string(), "F32[2]");
    let s = Var::Sequence(vec![t.clone(), t]);
    assert!(!s.is_array());
    assert_eq!(s.nbytes(), 16);
    assert_eq!(s.debug_string(), "sequence(2)");
    assert!(Var::Null.is_null());
    assert_eq!(Var::Opaque(Arc::new(42u32)).kind(), "opaque");
}
