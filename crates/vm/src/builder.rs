use std::{sync::Arc, time::Instant};

use crate::{
    handler::OpRegistry,
    kernel_cache::KernelCache,
    probe::{default_probe, MemoryProbe},
    program::Program,
    vm::VirtualMachine,
    VmError,
};

pub struct VmBuilder {
    program: Program,
    run_init: bool,
    registry: Option<OpRegistry>,
    kernel_cache: Option<Arc<KernelCache>>,
    memory_probe: Option<Box<dyn MemoryProbe>>,
}

impl VmBuilder {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            run_init: true,
            registry: None,
            kernel_cache: None,
            memory_probe: None,
        }
    }

    /// Whether `build` runs the one-time initialization. When disabled,
    /// `VirtualMachine::init` must be called before any run.
    pub fn with_init(mut self, run_init: bool) -> Self {
        self.run_init = run_init;
        self
    }

    pub fn with_registry(mut self, registry: OpRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_kernel_cache(mut self, kernel_cache: Arc<KernelCache>) -> Self {
        self.kernel_cache = Some(kernel_cache);
        self
    }

    pub fn with_memory_probe(mut self, memory_probe: Box<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(memory_probe);
        self
    }

    pub fn build(self) -> Result<VirtualMachine, VmError> {
        let start = Instant::now();

        let program = self.program;
        let num_variables = program.num_variables();
        validate_slots(&program, num_variables)?;

        let registry = self.registry.unwrap_or_default();
        let handlers = program
            .instructions
            .iter()
            .map(|inst| registry.build(inst))
            .collect::<Result<Vec<_>, _>>()?;

        let mut vm = VirtualMachine {
            program,
            handlers,
            num_variables,
            initialized: false,
            kernel_cache: self.kernel_cache.unwrap_or_default(),
            memory_probe: self.memory_probe.unwrap_or_else(default_probe),
        };
        log::info!(
            "VmBuilder::build({} instructions, {} variables): {:?}",
            vm.program.instructions.len(),
            num_variables,
            start.elapsed()
        );

        if self.run_init {
            vm.init()?;
        }
        Ok(vm)
    }
}

/// Every slot a program touches must fit in the variable table.
fn validate_slots(program: &Program, num_variables: usize) -> Result<(), VmError> {
    let out_of_range = |what: &str, slot: usize| {
        VmError::InvalidProgram(
            format!("{what} ${slot} exceeds the variable table of {num_variables}").into(),
        )
    };
    for inst in &program.instructions {
        if let Some(&slot) = inst.inputs.iter().find(|&&s| s >= num_variables) {
            return Err(out_of_range(&inst.debug_string(), slot));
        }
    }
    for input in &program.inputs {
        if input.slot >= num_variables {
            return Err(out_of_range(&input.name, input.slot));
        }
    }
    for output in &program.outputs {
        if output.slot >= num_variables {
            return Err(out_of_range(&output.name, output.slot));
        }
    }
    Ok(())
}
