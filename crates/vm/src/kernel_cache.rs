use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::VmError;

/// One step of a compiled element-wise kernel, evaluated on a value stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelOp {
    Input(usize),
    Const(f32),
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
}

/// A kernel compiled from postfix source such as `$0 $1 add relu`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledKernel {
    ops: Vec<KernelOp>,
    num_inputs: usize,
}

impl CompiledKernel {
    pub fn compile(code: &str) -> Result<Self, VmError> {
        let mut ops = vec![];
        let mut depth = 0usize;
        let mut num_inputs = 0;
        for token in code.split_whitespace() {
            let (op, pops) = match token {
                "add" => (KernelOp::Add, 2),
                "sub" => (KernelOp::Sub, 2),
                "mul" => (KernelOp::Mul, 2),
                "div" => (KernelOp::Div, 2),
                "pow" => (KernelOp::Pow, 2),
                "neg" => (KernelOp::Neg, 1),
                "relu" => (KernelOp::Relu, 1),
                "sigmoid" => (KernelOp::Sigmoid, 1),
                "tanh" => (KernelOp::Tanh, 1),
                "exp" => (KernelOp::Exp, 1),
                "sqrt" => (KernelOp::Sqrt, 1),
                _ => {
                    if let Some(index) = token.strip_prefix('$') {
                        let index = index.parse::<usize>().map_err(|_| {
                            VmError::Kernel(format!("Bad input reference '{token}'").into())
                        })?;
                        num_inputs = num_inputs.max(index + 1);
                        (KernelOp::Input(index), 0)
                    } else {
                        let value = token.parse::<f32>().map_err(|_| {
                            VmError::Kernel(format!("Unknown token '{token}'").into())
                        })?;
                        (KernelOp::Const(value), 0)
                    }
                }
            };
            if depth < pops {
                return Err(VmError::Kernel(
                    format!("Stack underflow at '{token}'").into(),
                ));
            }
            depth = depth - pops + 1;
            ops.push(op);
        }
        if depth != 1 {
            return Err(VmError::Kernel(
                format!("Kernel must leave exactly one value, but leaves {depth}").into(),
            ));
        }
        Ok(Self { ops, num_inputs })
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Evaluates the kernel on one element of each input. `stack` is scratch
    /// space reused across elements.
    pub fn eval(&self, inputs: &[f32], stack: &mut Vec<f32>) -> f32 {
        stack.clear();
        for op in &self.ops {
            let v = match *op {
                KernelOp::Input(i) => inputs[i],
                KernelOp::Const(c) => c,
                KernelOp::Neg
                | KernelOp::Relu
                | KernelOp::Sigmoid
                | KernelOp::Tanh
                | KernelOp::Exp
                | KernelOp::Sqrt => {
                    let x = stack.pop().unwrap_or_default();
                    match *op {
                        KernelOp::Neg => -x,
                        KernelOp::Relu => x.max(0.0),
                        KernelOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                        KernelOp::Tanh => x.tanh(),
                        KernelOp::Exp => x.exp(),
                        _ => x.sqrt(),
                    }
                }
                _ => {
                    let y = stack.pop().unwrap_or_default();
                    let x = stack.pop().unwrap_or_default();
                    match *op {
                        KernelOp::Add => x + y,
                        KernelOp::Sub => x - y,
                        KernelOp::Mul => x * y,
                        KernelOp::Div => x / y,
                        _ => x.powf(y),
                    }
                }
            };
            stack.push(v);
        }
        stack.pop().unwrap_or_default()
    }
}

/// Compiled kernels keyed by the SHA-1 of their source, so identical fused
/// regions are compiled once even across programs sharing the cache.
#[derive(Debug, Default)]
pub struct KernelCache {
    kernels: Mutex<FxHashMap<[u8; 20], Arc<CompiledKernel>>>,
    compilations: Mutex<usize>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, code: &str) -> Result<Arc<CompiledKernel>, VmError> {
        let key = compute_sha1(code);
        let mut kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kernel) = kernels.get(&key) {
            return Ok(kernel.clone());
        }
        let kernel = Arc::new(CompiledKernel::compile(code)?);
        log::debug!("Compiled kernel: {}", code);
        *self
            .compilations
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub fn len(&self) -> usize {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cache misses that compiled successfully.
    pub fn num_compilations(&self) -> usize {
        *self
            .compilations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn compute_sha1(code: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(code.as_bytes());
    let hash = hasher.finalize();
    let mut key = [0; 20];
    key.copy_from_slice(&hash[..20]);
    key
}

#[test]
fn compile_and_eval() {
    let kernel = CompiledKernel::compile("$0 $1 add 2 mul relu").unwrap();
    assert_eq!(kernel.num_inputs(), 2);
    let mut stack = vec![];
    assert_eq!(kernel.eval(&[1.0, 2.0], &mut stack), 6.0);
    assert_eq!(kernel.eval(&[1.0, -3.0], &mut stack), 0.0);
}

#[test]
fn compile_errors() {
    assert!(matches!(
        CompiledKernel::compile("$0 add"),
        Err(VmError::Kernel(_))
    ));
    assert!(matches!(
        CompiledKernel::compile("$0 $1"),
        Err(VmError::Kernel(_))
    ));
    assert!(matches!(
        CompiledKernel::compile("$x"),
        Err(VmError::Kernel(_))
    ));
    assert!(matches!(
        CompiledKernel::compile("$0 gelu"),
        Err(VmError::Kernel(_))
    ));
}

#[test]
fn cache_hits() {
    let cache = KernelCache::new();
    let a = cache.get_or_compile("$0 exp").unwrap();
    let b = cache.get_or_compile("$0 exp").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    cache.get_or_compile("$0 neg").unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.num_compilations(), 2);
    assert!(cache.get_or_compile("neg").is_err());
    assert_eq!(cache.len(), 2);
}
