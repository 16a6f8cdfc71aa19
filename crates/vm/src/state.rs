use std::sync::Arc;

use rustc_hash::FxHashMap;
use tensorvm_core::tensor::Tensor;

use crate::{options::VmOptions, program::NO_VALUE, var::Var, VmError};

/// Everything one execution of a program mutates. A program can back many
/// states at once; each state owns its slots.
#[derive(Debug)]
pub struct State {
    /// `None` marks a slot that was never set or has been freed.
    vars: Vec<Option<Var>>,
    pc: usize,
    options: Arc<VmOptions>,
    /// Values saved by stack pushes, keyed by stack id.
    stacks: FxHashMap<i64, Vec<Var>>,
    peak_memory: usize,
}

impl State {
    pub fn new(num_variables: usize, options: VmOptions) -> Self {
        Self {
            vars: vec![None; num_variables],
            pc: 0,
            options: Arc::new(options),
            stacks: FxHashMap::default(),
            peak_memory: 0,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub(crate) fn advance(&mut self) {
        self.pc += 1;
    }

    pub fn options(&self) -> &Arc<VmOptions> {
        &self.options
    }

    pub fn num_variables(&self) -> usize {
        self.vars.len()
    }

    pub fn var(&self, id: usize) -> Result<&Var, VmError> {
        if id == NO_VALUE {
            return Err(VmError::NoSuchVariable(id));
        }
        self.vars
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(VmError::NoSuchVariable(id))
    }

    pub fn array(&self, id: usize) -> Result<&Tensor, VmError> {
        self.var(id)?.as_array().ok_or(VmError::NotArray(id))
    }

    pub fn is_set(&self, id: usize) -> bool {
        id != NO_VALUE && matches!(self.vars.get(id), Some(Some(_)))
    }

    /// Stores `var` into slot `id`. Writes to the no-value slot are dropped.
    pub fn set_var(&mut self, id: usize, var: impl Into<Var>) -> Result<(), VmError> {
        if id == NO_VALUE {
            return Ok(());
        }
        let slot = self.vars.get_mut(id).ok_or(VmError::NoSuchVariable(id))?;
        *slot = Some(var.into());
        Ok(())
    }

    pub fn take_var(&mut self, id: usize) -> Result<Var, VmError> {
        if id == NO_VALUE {
            return Err(VmError::NoSuchVariable(id));
        }
        self.vars
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(VmError::NoSuchVariable(id))
    }

    pub fn free_var(&mut self, id: usize) {
        if let Some(slot) = self.vars.get_mut(id) {
            *slot = None;
        }
    }

    pub fn push_stack(&mut self, id: i64, var: Var) {
        self.stacks.entry(id).or_default().push(var);
    }

    pub fn pop_stack(&mut self, id: i64) -> Result<Var, VmError> {
        self.stacks
            .get_mut(&id)
            .and_then(Vec::pop)
            .ok_or(VmError::EmptyStack(id))
    }

    pub fn stack_depth(&self, id: i64) -> usize {
        self.stacks.get(&id).map_or(0, Vec::len)
    }

    /// Bytes currently held by the slot table.
    pub fn memory_usage(&self) -> usize {
        self.vars.iter().flatten().map(Var::nbytes).sum()
    }

    pub(crate) fn update_peak_memory(&mut self) -> usize {
        let usage = self.memory_usage();
        self.peak_memory = self.peak_memory.max(usage);
        usage
    }

    pub fn peak_memory(&self) -> usize {
        self.peak_memory
    }
}

#[test]
fn slots() {
    let mut state = State::new(4, VmOptions::default());
    assert!(matches!(state.var(1), Err(VmError::NoSuchVariable(1))));
    state.set_var(1, Tensor::scalar(1.0f32)).unwrap();
    state.set_var(2, Var::Null).unwrap();
    assert!(state.array(1).is_ok());
    assert!(matches!(state.array(2), Err(VmError::NotArray(2))));

    // The no-value slot is never read or written.
    state.set_var(0, Tensor::scalar(1.0f32)).unwrap();
    assert!(!state.is_set(0));
    assert!(state.var(0).is_err());

    assert!(state.set_var(4, Var::Null).is_err());
    assert_eq!(state.memory_usage(), 4);
    state.free_var(1);
    assert!(!state.is_set(1));
    assert_eq!(state.memory_usage(), 0);
}

#[test]
fn stacks() {
    let mut state = State::new(1, VmOptions::default());
    state.push_stack(3, Var::Array(Tensor::scalar(1i64)));
    state.push_stack(3, Var::Array(Tensor::scalar(2i64)));
    assert_eq!(state.stack_depth(3), 2);
    let top = state.pop_stack(3).unwrap();
    assert_eq!(top.as_array().unwrap().data::<i64>(), &[2]);
    state.pop_stack(3).unwrap();
    assert!(matches!(state.pop_stack(3), Err(VmError::EmptyStack(3))));
    assert!(matches!(state.pop_stack(4), Err(VmError::EmptyStack(4))));
}
