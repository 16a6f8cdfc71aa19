use rustc_hash::FxHashMap;

use crate::{
    kernel_cache::KernelCache,
    ops,
    program::{Instruction, Opcode},
    state::State,
    VmError,
};

/// Executes one instruction. Handlers are built once per instruction and
/// shared by every state running the program.
pub trait OpHandler: Send + Sync {
    /// One-time preparation such as compiling a kernel. Runs before any
    /// execution and never concurrently with itself.
    fn init(&mut self, _kernels: &KernelCache) -> Result<(), VmError> {
        Ok(())
    }

    fn run(&self, inst: &Instruction, state: &mut State) -> Result<(), VmError>;

    fn describe(&self, inst: &Instruction) -> String {
        inst.debug_string()
    }
}

pub type HandlerFactory = fn(&Instruction) -> Result<Box<dyn OpHandler>, VmError>;

/// Maps opcodes to handler factories.
#[derive(Clone)]
pub struct OpRegistry {
    factories: FxHashMap<Opcode, HandlerFactory>,
}

impl OpRegistry {
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        ops::register_builtins(&mut registry);
        registry
    }

    /// Registers `factory` for `opcode`, returning the factory it replaces.
    pub fn register(&mut self, opcode: Opcode, factory: HandlerFactory) -> Option<HandlerFactory> {
        self.factories.insert(opcode, factory)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.factories.contains_key(&opcode)
    }

    pub fn build(&self, inst: &Instruction) -> Result<Box<dyn OpHandler>, VmError> {
        let factory = self
            .factories
            .get(&inst.opcode)
            .ok_or_else(|| VmError::UnknownOpcode(inst.opcode.name().to_string()))?;
        factory(inst)
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[test]
fn unknown_opcode() {
    let inst = Instruction::new(Opcode::Add)
        .with_ins(vec![1, 2])
        .with_outs(vec![3]);
    assert!(matches!(
        OpRegistry::empty().build(&inst),
        Err(VmError::UnknownOpcode(name)) if name == "Add"
    ));
    assert!(OpRegistry::default().build(&inst).is_ok());
}

#[test]
fn override_handler() {
    struct Nop;
    impl OpHandler for Nop {
        fn run(&self, _: &Instruction, _: &mut State) -> Result<(), VmError> {
            Ok(())
        }
    }

    let mut registry = OpRegistry::with_builtins();
    assert!(registry.contains(Opcode::Relu));
    let prev = registry.register(Opcode::Relu, |_| Ok(Box::new(Nop)));
    assert!(prev.is_some());
    let inst = Instruction::new(Opcode::Relu).with_id(3);
    // The builtin would reject an instruction without operands.
    let handler = registry.build(&inst).unwrap();
    assert_eq!(handler.describe(&inst), "#3 Relu() -> ()");
}
