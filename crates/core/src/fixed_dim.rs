use std::{
    fmt,
    ops::{Deref, Index},
    slice::SliceIndex,
};

pub type FixedDimension = usize;

/// A fully known shape.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct FixedDimensions(pub Vec<FixedDimension>);

impl fmt::Debug for FixedDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl FixedDimensions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_elems(&self) -> usize {
        self.0.iter().product()
    }

    pub fn as_slice(&self) -> &[FixedDimension] {
        self.0.as_slice()
    }

    pub fn broadcast(&self, other: impl AsRef<Self>) -> Option<Self> {
        broadcast(&[self, other.as_ref()])
    }
}

/// Numpy-style broadcasting of all `shapes` into one. Returns `None` if any
/// pair of trailing dimensions is incompatible.
pub fn broadcast(shapes: &[impl AsRef<FixedDimensions>]) -> Option<FixedDimensions> {
    let rank = shapes.iter().map(|s| s.as_ref().len()).max()?;
    let mut out = vec![1; rank];
    for shape in shapes.iter().map(AsRef::as_ref) {
        let offset = rank - shape.len();
        for (i, &dim) in shape.iter().enumerate() {
            let slot = &mut out[offset + i];
            match (*slot, dim) {
                (_, 1) => {}
                (1, d) => *slot = d,
                (s, d) if s == d => {}
                _ => return None,
            }
        }
    }
    Some(out.into())
}

impl AsRef<FixedDimensions> for FixedDimensions {
    fn as_ref(&self) -> &FixedDimensions {
        self
    }
}

impl<I> Index<I> for FixedDimensions
where
    I: SliceIndex<[FixedDimension]>,
{
    type Output = <I as SliceIndex<[FixedDimension]>>::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<FixedDimension>> for FixedDimensions {
    fn from(v: Vec<FixedDimension>) -> FixedDimensions {
        FixedDimensions(v)
    }
}

impl From<&[FixedDimension]> for FixedDimensions {
    fn from(v: &[FixedDimension]) -> FixedDimensions {
        FixedDimensions(v.to_vec())
    }
}

impl Deref for FixedDimensions {
    type Target = Vec<usize>;
    fn deref(&self) -> &Vec<usize> {
        &self.0
    }
}

#[test]
fn total_elems_of_scalar() {
    assert_eq!(FixedDimensions(vec![]).total_elems(), 1);
    assert_eq!(FixedDimensions(vec![2, 3, 4]).total_elems(), 24);
}

#[test]
fn broadcast_trailing_ones() {
    let x = FixedDimensions::from(vec![1, 3, 1]);
    let y = FixedDimensions::from(vec![5, 3, 10]);
    assert_eq!(x.broadcast(&y), Some(vec![5, 3, 10].into()));
}

#[test]
fn broadcast_rank_extension() {
    let x = FixedDimensions::from(vec![3, 1, 1]);
    let y = FixedDimensions::from(vec![1, 3, 4, 4]);
    assert_eq!(broadcast(&[x, y]), Some(vec![1, 3, 4, 4].into()));
}

#[test]
fn broadcast_mismatch() {
    let x = FixedDimensions::from(vec![10, 20]);
    let y = FixedDimensions::from(vec![10, 20, 30]);
    assert_eq!(broadcast(&[x, y]), None);
}
