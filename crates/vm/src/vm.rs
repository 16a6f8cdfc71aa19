use std::{sync::Arc, time::Instant};

use rustc_hash::FxHashMap;

use crate::{
    handler::OpHandler,
    kernel_cache::KernelCache,
    npy::save_npy,
    options::VmOptions,
    probe::MemoryProbe,
    program::{Instruction, Program, TypeDecl, NO_VALUE},
    state::State,
    var::Var,
    VmBuilder, VmError,
};

/// Interprets one program. The program and its handlers are immutable once
/// initialized, so a single machine can run many states at once.
pub struct VirtualMachine {
    pub(crate) program: Program,
    pub(crate) handlers: Vec<Box<dyn OpHandler>>,
    pub(crate) num_variables: usize,
    pub(crate) initialized: bool,
    pub(crate) kernel_cache: Arc<KernelCache>,
    pub(crate) memory_probe: Box<dyn MemoryProbe>,
}

impl VirtualMachine {
    pub fn new(program: Program, run_init: bool) -> Result<Self, VmError> {
        VmBuilder::new(program).with_init(run_init).build()
    }

    /// Runs the one-time initialization of every handler. Calling it again
    /// does nothing.
    pub fn init(&mut self) -> Result<(), VmError> {
        if self.initialized {
            return Ok(());
        }
        let start = Instant::now();
        for handler in &mut self.handlers {
            handler.init(&self.kernel_cache)?;
        }
        self.initialized = true;
        log::info!("VirtualMachine::init: {:?}", start.elapsed());
        Ok(())
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    pub fn kernel_cache(&self) -> &Arc<KernelCache> {
        &self.kernel_cache
    }

    /// Creates a state with every declared input stored in its slot.
    pub fn prepare(
        &self,
        inputs: &FxHashMap<String, Var>,
        options: VmOptions,
    ) -> Result<State, VmError> {
        let mut state = State::new(self.num_variables, options);
        for desc in &self.program.inputs {
            let var = inputs
                .get(&desc.name)
                .ok_or_else(|| VmError::MissingInput(desc.name.clone()))?;
            if state.options().check_types {
                if let Some(ty) = desc.ty.as_ref().filter(|ty| !ty.is_unknown()) {
                    check_input_type(&desc.name, ty, var)?;
                }
            }
            state.set_var(desc.slot, var.clone())?;
        }
        Ok(state)
    }

    /// Executes the remaining instructions of `state`.
    pub fn run_state(&self, state: &mut State) -> Result<(), VmError> {
        if !self.initialized {
            return Err(VmError::NotInitialized);
        }
        let start = Instant::now();
        let options = state.options().clone();
        let _run_event = options
            .chrome_tracing
            .as_ref()
            .map(|t| t.scoped_event("Run", "run", None));

        while let Some(inst) = self.program.instructions.get(state.pc()) {
            let handler = &self.handlers[state.pc()];
            if options.verbose_ops.contains(&inst.opcode) {
                log::info!("{}", handler.describe(inst));
            }

            let result = {
                let _event = options
                    .chrome_tracing
                    .as_ref()
                    .map(|t| t.scoped_event("Op", inst.opcode.name(), Some(inst.flops)));
                handler.run(inst, state)
            };
            if let Err(err) = result {
                if options.catch_exception {
                    log::error!("Exception in {}", handler.describe(inst));
                }
                return Err(err);
            }

            self.after_instruction(inst, handler.as_ref(), state, &options)?;
            state.advance();
        }

        if options.dump_memory_usage >= 1 {
            let peak = state.peak_memory() as f64 / 1000. / 1000.;
            match self.memory_probe.peak_bytes() {
                Some(process_peak) => log::info!(
                    "Peak memory usage={}MB process peak={}MB",
                    peak,
                    process_peak as f64 / 1000. / 1000.
                ),
                None => log::info!("Peak memory usage={}MB", peak),
            }
        }
        log::debug!("VirtualMachine::run_state: {:?}", start.elapsed());
        Ok(())
    }

    /// `prepare` followed by `run_state`, returning the declared outputs.
    pub fn run(
        &self,
        inputs: &FxHashMap<String, Var>,
        options: VmOptions,
    ) -> Result<FxHashMap<String, Var>, VmError> {
        let mut state = self.prepare(inputs, options)?;
        self.run_state(&mut state)?;
        self.program
            .outputs
            .iter()
            .map(|desc| Ok((desc.name.clone(), state.take_var(desc.slot)?)))
            .collect()
    }

    fn after_instruction(
        &self,
        inst: &Instruction,
        handler: &dyn OpHandler,
        state: &mut State,
        options: &VmOptions,
    ) -> Result<(), VmError> {
        for (i, &slot) in inst.outputs.iter().enumerate() {
            if slot == NO_VALUE || !state.is_set(slot) {
                continue;
            }
            let var = state.var(slot)?;

            if options.trace_level >= 1 {
                log::info!(" ${} = {}", slot, var.debug_string());
            }
            if options.trace_level >= 2 {
                log::info!("   {:?}", var);
            }

            let Some(tensor) = var.as_array() else {
                if options.check_types && !var.is_null() {
                    if let Some(ty) = inst.output_type(i).filter(|ty| !ty.is_unknown()) {
                        return Err(VmError::OutputType {
                            instruction: handler.describe(inst),
                            expected: format!("{ty:?}"),
                            actual: var.kind().to_string(),
                        });
                    }
                }
                continue;
            };

            if options.check_types {
                if let Some(ty) = inst.output_type(i) {
                    if !ty.matches(tensor) {
                        return Err(VmError::OutputType {
                            instruction: handler.describe(inst),
                            expected: format!("{ty:?}"),
                            actual: var.debug_string(),
                        });
                    }
                }
            }
            if options.check_nans && tensor.has_nan() {
                return Err(VmError::NanDetected {
                    instruction: handler.describe(inst),
                    slot,
                });
            }
            if options.check_infs && tensor.has_inf() {
                return Err(VmError::InfDetected {
                    instruction: handler.describe(inst),
                    slot,
                });
            }
            if let (Some(dir), Some(name)) = (&options.dump_outputs_dir, inst.output_name(i)) {
                let name = name.replace(['/', '\\'], "_");
                save_npy(dir.join(format!("{:05}_{}.npy", inst.id, name)), tensor)?;
            }
        }

        if options.dump_memory_usage >= 1 {
            let usage = state.update_peak_memory();
            if options.dump_memory_usage >= 2 {
                let allocated = options
                    .base_memory_usage
                    .zip(self.memory_probe.current_bytes())
                    .map(|(base, current)| current - base);
                match allocated {
                    Some(allocated) => log::info!(
                        "Memory usage={}MB allocated={}MB after {}",
                        usage as f64 / 1000. / 1000.,
                        allocated as f64 / 1000. / 1000.,
                        inst.debug_string()
                    ),
                    None => log::info!(
                        "Memory usage={}MB after {}",
                        usage as f64 / 1000. / 1000.,
                        inst.debug_string()
                    ),
                }
            }
        }
        Ok(())
    }
}

fn check_input_type(name: &str, ty: &TypeDecl, var: &Var) -> Result<(), VmError> {
    let error = |actual: String| VmError::InputType {
        name: name.to_string(),
        expected: format!("{ty:?}"),
        actual,
    };
    match var.as_array() {
        Some(tensor) if ty.matches(tensor) => Ok(()),
        Some(_) => Err(error(var.debug_string())),
        None => Err(error(var.kind().to_string())),
    }
}
