use std::ops::{Index, IndexMut};

use id_arena::{Arena, Id};

use crate::{
    dim::Dimensions,
    node::NodeId,
    tensor::{TensorElemType, TypedFixedShape},
};

pub type ValueId = Id<Value>;

/// A typed edge of the graph. `producer` and `users` are maintained by
/// [`Graph`](crate::graph::Graph); they are never edited directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub name: Option<String>,
    pub ty: ValueType,
    pub(crate) producer: Option<NodeId>,
    // One entry per consuming input slot.
    pub(crate) users: Vec<NodeId>,
    null: bool,
}

/// Best-known static type of a value. Either part may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ValueType {
    pub elem_ty: Option<TensorElemType>,
    pub dims: Option<Dimensions>,
}

#[derive(Debug, Default, Clone)]
pub struct ValueArena(Arena<Value>);

impl Value {
    fn new(name: Option<String>, ty: ValueType, null: bool) -> Self {
        Self {
            name,
            ty,
            producer: None,
            users: Vec::new(),
            null,
        }
    }

    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    /// A null value stands for "intentionally no tensor", e.g. a gradient
    /// that must not be accumulated.
    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn nbytes(&self) -> Option<usize> {
        self.ty.nbytes()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anon>")
    }
}

impl ValueType {
    pub fn new(elem_ty: TensorElemType, dims: impl Into<Dimensions>) -> Self {
        Self {
            elem_ty: Some(elem_ty),
            dims: Some(dims.into()),
        }
    }

    pub fn to_fixed(&self) -> Option<TypedFixedShape> {
        Some(TypedFixedShape::new(
            self.dims.as_ref()?.to_fixed()?,
            self.elem_ty?,
        ))
    }

    /// Byte size, known only when the element type and every dimension are.
    pub fn nbytes(&self) -> Option<usize> {
        self.to_fixed().map(|s| s.nbytes())
    }
}

impl From<TypedFixedShape> for ValueType {
    fn from(shape: TypedFixedShape) -> Self {
        Self::new(shape.elem_ty, shape.dims)
    }
}

impl ValueArena {
    pub fn new_val(&mut self) -> ValueId {
        self.0.alloc(Value::new(None, ValueType::default(), false))
    }

    pub fn new_val_named(&mut self, name: impl Into<String>) -> ValueId {
        self.0
            .alloc(Value::new(Some(name.into()), ValueType::default(), false))
    }

    pub fn new_val_named_and_typed(
        &mut self,
        name: impl Into<String>,
        ty: impl Into<ValueType>,
    ) -> ValueId {
        self.0
            .alloc(Value::new(Some(name.into()), ty.into(), false))
    }

    pub fn new_null(&mut self) -> ValueId {
        self.0.alloc(Value::new(None, ValueType::default(), true))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &Value)> {
        self.0.iter()
    }
}

impl Index<ValueId> for ValueArena {
    type Output = Value;

    fn index(&self, index: ValueId) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<ValueId> for ValueArena {
    fn index_mut(&mut self, index: ValueId) -> &mut Self::Output {
        &mut self.0[index]
    }
}

#[test]
fn value_nbytes() {
    let mut values = ValueArena::default();
    let x = values.new_val_named_and_typed(
        "x",
        TypedFixedShape::new(vec![4, 2].into(), TensorElemType::F32),
    );
    let y = values.new_val_named("y");
    let z = values.new_null();
    assert_eq!(values[x].nbytes(), Some(32));
    assert_eq!(values[y].nbytes(), None);
    assert!(values[z].is_null());
    assert_eq!(values[y].display_name(), "y");
    assert_eq!(values.len(), 3);
}
