use std::fmt;

use tensorvm_core::{
    fixed_dim::FixedDimensions,
    tensor::{Tensor, TensorElemType},
};

/// Slot id that stands for "no value".
pub const NO_VALUE: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Identity,
    Constant,
    Free,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Sqrt,
    MatMul,
    Dropout,
    StackPush,
    StackPop,
    SequenceCreate,
    SequenceAppend,
    SequenceLookup,
    FusedElemwise,
    Custom,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Identity => "Identity",
            Opcode::Constant => "Constant",
            Opcode::Free => "Free",
            Opcode::Add => "Add",
            Opcode::Sub => "Sub",
            Opcode::Mul => "Mul",
            Opcode::Div => "Div",
            Opcode::Pow => "Pow",
            Opcode::Neg => "Neg",
            Opcode::Relu => "Relu",
            Opcode::Sigmoid => "Sigmoid",
            Opcode::Tanh => "Tanh",
            Opcode::Exp => "Exp",
            Opcode::Sqrt => "Sqrt",
            Opcode::MatMul => "MatMul",
            Opcode::Dropout => "Dropout",
            Opcode::StackPush => "StackPush",
            Opcode::StackPop => "StackPop",
            Opcode::SequenceCreate => "SequenceCreate",
            Opcode::SequenceAppend => "SequenceAppend",
            Opcode::SequenceLookup => "SequenceLookup",
            Opcode::FusedElemwise => "FusedElemwise",
            Opcode::Custom => "Custom",
        }
    }
}

/// Opcode-specific operands that are not variable slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Attr {
    #[default]
    None,
    Constant(Tensor),
    Dropout {
        ratio: f32,
    },
    Stack {
        id: i64,
    },
    FusedElemwise {
        name: String,
        code: String,
    },
    Custom {
        name: String,
    },
}

/// Expected type of a variable. An unknown element type disables checking.
#[derive(Clone, PartialEq, Eq)]
pub struct TypeDecl {
    pub elem_ty: Option<TensorElemType>,
    pub dims: FixedDimensions,
}

impl TypeDecl {
    pub fn new(elem_ty: TensorElemType, dims: impl Into<FixedDimensions>) -> Self {
        Self {
            elem_ty: Some(elem_ty),
            dims: dims.into(),
        }
    }

    pub fn unknown() -> Self {
        Self {
            elem_ty: None,
            dims: FixedDimensions::default(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.elem_ty.is_none()
    }

    /// Whether `tensor` has this type. Always true for an unknown type.
    pub fn matches(&self, tensor: &Tensor) -> bool {
        match self.elem_ty {
            None => true,
            Some(elem_ty) => elem_ty == tensor.elem_ty() && &self.dims == tensor.dims(),
        }
    }
}

impl fmt::Debug for TypeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.elem_ty {
            Some(elem_ty) => write!(f, "{:?}{:?}", elem_ty, self.dims),
            None => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub attr: Attr,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    /// Expected type of each output, `None` to skip checking.
    pub output_types: Vec<Option<TypeDecl>>,
    /// Names of outputs for dumping.
    pub output_names: Vec<Option<String>>,
    pub id: usize,
    pub debug_info: String,
    /// Estimated floating-point operation count.
    pub flops: u64,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            attr: Attr::None,
            inputs: vec![],
            outputs: vec![],
            output_types: vec![],
            output_names: vec![],
            id: 0,
            debug_info: String::new(),
            flops: 0,
        }
    }

    pub fn with_attr(mut self, attr: Attr) -> Self {
        self.attr = attr;
        self
    }

    pub fn with_ins(mut self, mut ids: Vec<usize>) -> Self {
        self.inputs.append(&mut ids);
        self
    }

    pub fn with_outs(mut self, mut ids: Vec<usize>) -> Self {
        self.outputs.append(&mut ids);
        self
    }

    pub fn with_output_types(mut self, types: Vec<Option<TypeDecl>>) -> Self {
        self.output_types = types;
        self
    }

    pub fn with_output_names(mut self, names: Vec<Option<String>>) -> Self {
        self.output_names = names;
        self
    }

    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    pub fn with_debug_info(mut self, debug_info: impl Into<String>) -> Self {
        self.debug_info = debug_info.into();
        self
    }

    pub fn with_flops(mut self, flops: u64) -> Self {
        self.flops = flops;
        self
    }

    pub fn output_type(&self, i: usize) -> Option<&TypeDecl> {
        self.output_types.get(i).and_then(Option::as_ref)
    }

    pub fn output_name(&self, i: usize) -> Option<&str> {
        self.output_names.get(i).and_then(Option::as_deref)
    }

    pub fn debug_string(&self) -> String {
        let slots = |ids: &[usize]| {
            ids.iter()
                .map(|id| format!("${id}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut s = format!(
            "#{} {}({}) -> ({})",
            self.id,
            self.opcode.name(),
            slots(&self.inputs),
            slots(&self.outputs)
        );
        if !self.debug_info.is_empty() {
            s.push_str(" @ ");
            s.push_str(&self.debug_info);
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct InputDesc {
    pub name: String,
    pub slot: usize,
    pub ty: Option<TypeDecl>,
}

#[derive(Debug, Clone)]
pub struct OutputDesc {
    pub name: String,
    pub slot: usize,
}

/// A linear instruction stream. Built once and never modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub inputs: Vec<InputDesc>,
    pub outputs: Vec<OutputDesc>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `inst`, numbering it by its position.
    pub fn push(&mut self, inst: Instruction) -> usize {
        let id = self.instructions.len();
        self.instructions.push(inst.with_id(id));
        id
    }

    pub fn with_input(mut self, name: impl Into<String>, slot: usize, ty: Option<TypeDecl>) -> Self {
        self.inputs.push(InputDesc {
            name: name.into(),
            slot,
            ty,
        });
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, slot: usize) -> Self {
        self.outputs.push(OutputDesc {
            name: name.into(),
            slot,
        });
        self
    }

    pub fn with_instruction(mut self, inst: Instruction) -> Self {
        self.push(inst);
        self
    }

    /// Size of the variable table: one past the largest output slot.
    pub fn num_variables(&self) -> usize {
        self.instructions
            .iter()
            .flat_map(|inst| inst.outputs.iter().copied())
            .max()
            .map_or(1, |max| max + 1)
    }
}

#[test]
fn num_variables() {
    let program = Program::new()
        .with_instruction(Instruction::new(Opcode::Add).with_ins(vec![1, 2]).with_outs(vec![3]))
        .with_instruction(Instruction::new(Opcode::Mul).with_ins(vec![3, 1]).with_outs(vec![4]));
    assert_eq!(program.num_variables(), 5);
    assert_eq!(program.instructions[1].id, 1);
    assert_eq!(Program::new().num_variables(), 1);
}

#[test]
fn instruction_debug_string() {
    let inst = Instruction::new(Opcode::Add)
        .with_ins(vec![1, 2])
        .with_outs(vec![3])
        .with_id(7)
        .with_debug_info("add0");
    assert_eq!(inst.debug_string(), "#7 Add($1, $2) -> ($3) @ add0");
}

#[test]
fn type_decl_matches() {
    let t = Tensor::zeros::<f32>(vec![2, 3].into());
    assert!(TypeDecl::new(TensorElemType::F32, vec![2, 3]).matches(&t));
    assert!(!TypeDecl::new(TensorElemType::F32, vec![3, 2]).matches(&t));
    assert!(!TypeDecl::new(TensorElemType::I64, vec![2, 3]).matches(&t));
    assert!(TypeDecl::unknown().matches(&t));
    assert_eq!(format!("{:?}", TypeDecl::new(TensorElemType::F32, vec![2, 3])), "F32[2, 3]");
}
