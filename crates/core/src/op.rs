use crate::tensor::Tensor;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Identity,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    ReLU,
    Sigmoid,
    Tanh,
    Exp,
    Sqrt,
    MatMul,
    Dropout(Dropout),
    Constant(Constant),
    StackPush(StackPush),
    StackPop(StackPop),
    FusedElemwise(FusedElemwise),
    Custom(Custom),
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Dropout>
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dropout {
    pub ratio: f32,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Constant>
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: Tensor,
}

/// Saves its single input on the backprop stack `id`. Has no outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackPush {
    pub id: i64,
}

/// Retrieves the most recently pushed value of stack `id`. Has no inputs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackPop {
    pub id: i64,
}

/// A chain of element-wise ops collapsed into one kernel. `code` is the
/// kernel source (postfix, `$N` refers to the N-th input).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FusedElemwise {
    pub name: String,
    pub code: String,
}

/// An op implemented by the host; resolved by name at run time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Custom {
    pub name: String,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Identity => "Identity",
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Div => "Div",
            Op::Pow => "Pow",
            Op::Neg => "Neg",
            Op::ReLU => "ReLU",
            Op::Sigmoid => "Sigmoid",
            Op::Tanh => "Tanh",
            Op::Exp => "Exp",
            Op::Sqrt => "Sqrt",
            Op::MatMul => "MatMul",
            Op::Dropout(_) => "Dropout",
            Op::Constant(_) => "Constant",
            Op::StackPush(_) => "StackPush",
            Op::StackPop(_) => "StackPop",
            Op::FusedElemwise(_) => "FusedElemwise",
            Op::Custom(_) => "Custom",
        }
    }

    pub fn is_elemwise(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Pow
                | Op::Neg
                | Op::ReLU
                | Op::Sigmoid
                | Op::Tanh
                | Op::Exp
                | Op::Sqrt
                | Op::Dropout(_)
                | Op::FusedElemwise(_)
        )
    }

    /// Ops whose outputs are cheap to recompute, so the greedy scheduler
    /// prefers to postpone them.
    pub fn is_recompute_friendly(&self) -> bool {
        matches!(self, Op::ReLU)
    }

    pub fn is_stack_push(&self) -> bool {
        matches!(self, Op::StackPush(_))
    }

    pub fn is_stack_pop(&self) -> bool {
        matches!(self, Op::StackPop(_))
    }
}
