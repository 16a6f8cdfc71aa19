use std::fmt;

use crate::fixed_dim::{FixedDimension, FixedDimensions};

/// A single static dimension. `Dynamic` dimensions carry the symbolic name
/// they were declared with (e.g. `batch`).
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Fixed(FixedDimension),
    Dynamic(String),
}

/// A shape whose dimensions may be partially unknown.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Dimensions(Vec<Dimension>);

impl Dimensions {
    pub fn new(dims: Vec<Dimension>) -> Self {
        Self(dims)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Dimension] {
        &self.0
    }

    pub fn is_fixed(&self) -> bool {
        self.0.iter().all(|d| matches!(d, Dimension::Fixed(_)))
    }

    /// Returns the shape if every dimension is known.
    pub fn to_fixed(&self) -> Option<FixedDimensions> {
        self.0
            .iter()
            .map(|d| match d {
                Dimension::Fixed(n) => Some(*n),
                Dimension::Dynamic(_) => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(FixedDimensions)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(n) => write!(f, "{n}"),
            Dimension::Dynamic(s) => write!(f, "{s}"),
        }
    }
}

impl fmt::Debug for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<FixedDimensions> for Dimensions {
    fn from(dims: FixedDimensions) -> Self {
        Dimensions(dims.0.into_iter().map(Dimension::Fixed).collect())
    }
}

impl From<Vec<FixedDimension>> for Dimensions {
    fn from(dims: Vec<FixedDimension>) -> Self {
        Dimensions(dims.into_iter().map(Dimension::Fixed).collect())
    }
}

#[test]
fn to_fixed() {
    let dims = Dimensions::from(vec![1, 3, 224, 224]);
    assert!(dims.is_fixed());
    assert_eq!(dims.to_fixed(), Some(vec![1, 3, 224, 224].into()));

    let dims = Dimensions::new(vec![
        Dimension::Dynamic("batch".into()),
        Dimension::Fixed(8),
    ]);
    assert!(!dims.is_fixed());
    assert_eq!(dims.to_fixed(), None);
    assert_eq!(format!("{dims:?}"), "[batch, 8]");
}
