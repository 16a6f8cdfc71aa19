use std::{fmt, path::PathBuf, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};
use tensorvm_core::tensor::Tensor;

use crate::{program::Opcode, trace::ChromeTracing};

/// A host-provided implementation of a `Custom` instruction.
pub type CustomOpFunc = Arc<dyn Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync>;

/// Per-run switches. Every check and dump is off by default, except that
/// faults are reported before being returned.
#[derive(Clone)]
pub struct VmOptions {
    /// 1 logs output types, 2 also logs output values.
    pub trace_level: u32,
    /// Opcodes whose instructions are logged before they run.
    pub verbose_ops: FxHashSet<Opcode>,
    pub is_training: bool,
    pub check_types: bool,
    pub check_nans: bool,
    pub check_infs: bool,
    pub catch_exception: bool,
    /// 1 reports the peak at the end of a run, 2 reports every step.
    pub dump_memory_usage: u32,
    /// Process memory in bytes before the run; enables allocation reports.
    pub base_memory_usage: Option<i64>,
    pub dump_outputs_dir: Option<PathBuf>,
    pub custom_op_funcs: FxHashMap<String, CustomOpFunc>,
    pub chrome_tracing: Option<Arc<ChromeTracing>>,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_level(mut self, trace_level: u32) -> Self {
        self.trace_level = trace_level;
        self
    }

    pub fn with_verbose_op(mut self, opcode: Opcode) -> Self {
        self.verbose_ops.insert(opcode);
        self
    }

    pub fn with_training(mut self, is_training: bool) -> Self {
        self.is_training = is_training;
        self
    }

    pub fn with_type_check(mut self, check_types: bool) -> Self {
        self.check_types = check_types;
        self
    }

    pub fn with_nan_check(mut self, check_nans: bool) -> Self {
        self.check_nans = check_nans;
        self
    }

    pub fn with_inf_check(mut self, check_infs: bool) -> Self {
        self.check_infs = check_infs;
        self
    }

    pub fn with_catch_exception(mut self, catch_exception: bool) -> Self {
        self.catch_exception = catch_exception;
        self
    }

    pub fn with_memory_dump(mut self, level: u32, base_memory_usage: Option<i64>) -> Self {
        self.dump_memory_usage = level;
        self.base_memory_usage = base_memory_usage;
        self
    }

    pub fn with_dump_outputs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_outputs_dir = Some(dir.into());
        self
    }

    pub fn with_custom_op(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&[Tensor]) -> Result<Vec<Tensor>, String> + Send + Sync + 'static,
    ) -> Self {
        self.custom_op_funcs.insert(name.into(), Arc::new(f));
        self
    }

    pub fn with_chrome_tracing(mut self, tracing: Arc<ChromeTracing>) -> Self {
        self.chrome_tracing = Some(tracing);
        self
    }
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            trace_level: 0,
            verbose_ops: FxHashSet::default(),
            is_training: false,
            check_types: false,
            check_nans: false,
            check_infs: false,
            catch_exception: true,
            dump_memory_usage: 0,
            base_memory_usage: None,
            dump_outputs_dir: None,
            custom_op_funcs: FxHashMap::default(),
            chrome_tracing: None,
        }
    }
}

impl fmt::Debug for VmOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom_ops = self.custom_op_funcs.keys().collect::<Vec<_>>();
        custom_ops.sort();
        f.debug_struct("VmOptions")
            .field("trace_level", &self.trace_level)
            .field("verbose_ops", &self.verbose_ops)
            .field("is_training", &self.is_training)
            .field("check_types", &self.check_types)
            .field("check_nans", &self.check_nans)
            .field("check_infs", &self.check_infs)
            .field("catch_exception", &self.catch_exception)
            .field("dump_memory_usage", &self.dump_memory_usage)
            .field("base_memory_usage", &self.base_memory_usage)
            .field("dump_outputs_dir", &self.dump_outputs_dir)
            .field("custom_op_funcs", &custom_ops)
            .field("chrome_tracing", &self.chrome_tracing.is_some())
            .finish()
    }
}

#[test]
fn defaults() {
    let options = VmOptions::default();
    assert!(options.catch_exception);
    assert!(!options.check_types);
    assert_eq!(options.trace_level, 0);

    let options = VmOptions::new()
        .with_type_check(true)
        .with_verbose_op(Opcode::Add)
        .with_custom_op("twice", |xs| Ok(xs.to_vec()));
    assert!(options.check_types);
    assert!(options.verbose_ops.contains(&Opcode::Add));
    assert!(options.custom_op_funcs.contains_key("twice"));
}
