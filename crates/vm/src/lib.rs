pub mod builder;
pub mod emit;
pub mod feeder;
pub mod handler;
pub mod kernel_cache;
pub mod npy;
pub mod ops;
pub mod options;
pub mod probe;
pub mod program;
pub mod state;
pub mod trace;
pub mod var;
pub mod vm;

use std::borrow::Cow;

use thiserror::Error;

pub use builder::VmBuilder;
pub use options::VmOptions;
pub use program::{Instruction, Opcode, Program};
pub use state::State;
pub use var::Var;
pub use vm::VirtualMachine;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("Required input '{0}' is not given")]
    MissingInput(String),

    #[error("Input '{name}' has {actual}, but {expected} is expected")]
    InputType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Output of {instruction} has {actual}, but {expected} is expected")]
    OutputType {
        instruction: String,
        expected: String,
        actual: String,
    },

    /// No handler is registered for the opcode.
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(String),

    #[error("Invalid program: {0}")]
    InvalidProgram(Cow<'static, str>),

    #[error("No such variable: ${0}")]
    NoSuchVariable(usize),

    #[error("Variable ${0} is not an array")]
    NotArray(usize),

    #[error("The virtual machine is not initialized")]
    NotInitialized,

    #[error("NaN detected in ${slot} produced by {instruction}")]
    NanDetected { instruction: String, slot: usize },

    #[error("Inf detected in ${slot} produced by {instruction}")]
    InfDetected { instruction: String, slot: usize },

    /// Errors arised from compiling or running a fused kernel.
    #[error("Kernel: {0}")]
    Kernel(Cow<'static, str>),

    #[error("Custom op '{name}': {message}")]
    CustomOp { name: String, message: String },

    #[error("Stack {0} is empty")]
    EmptyStack(i64),

    #[error("Io: {0}")]
    Io(#[from] std::io::Error),

    /// General error messages.
    #[error("Something went wrong: {0}")]
    Message(Cow<'static, str>),
}
