use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rustc_hash::FxHashMap;
use tensorvm_core::tensor::{Tensor, TensorElemType};
use tensorvm_vm::{
    handler::OpRegistry,
    kernel_cache::KernelCache,
    npy::load_npy,
    probe::MemoryProbe,
    program::{Attr, TypeDecl, NO_VALUE},
    trace::ChromeTracing,
    Instruction, Opcode, Program, Var, VirtualMachine, VmBuilder, VmError, VmOptions,
};

fn scalar(x: f32) -> Var {
    Tensor::new(vec![1].into(), vec![x]).into()
}

fn inputs(vars: Vec<(&str, Var)>) -> FxHashMap<String, Var> {
    vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn f32_of(var: &Var) -> Vec<f32> {
    var.as_array().unwrap().data::<f32>().to_vec()
}

/// `c = a + b; d = c * a`
fn add_mul() -> Program {
    Program::new()
        .with_input("a", 1, Some(TypeDecl::new(TensorElemType::F32, vec![1])))
        .with_input("b", 2, Some(TypeDecl::new(TensorElemType::F32, vec![1])))
        .with_instruction(
            Instruction::new(Opcode::Add)
                .with_ins(vec![1, 2])
                .with_outs(vec![3])
                .with_output_names(vec![Some("sum".into())]),
        )
        .with_instruction(
            Instruction::new(Opcode::Mul)
                .with_ins(vec![3, 1])
                .with_outs(vec![4])
                .with_output_names(vec![Some("prod".into())]),
        )
        .with_output("c", 3)
        .with_output("d", 4)
}

#[test]
fn add_mul_numbers() {
    let _ = env_logger::builder().is_test(true).try_init();

    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    assert_eq!(vm.num_variables(), 5);

    let mut state = vm
        .prepare(
            &inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]),
            VmOptions::default(),
        )
        .unwrap();
    vm.run_state(&mut state).unwrap();
    assert_eq!(state.pc(), 2);
    assert_eq!(f32_of(state.var(3).unwrap()), vec![5.0]);
    assert_eq!(f32_of(state.var(4).unwrap()), vec![10.0]);
    assert!(!state.is_set(NO_VALUE));
}

#[test]
fn run_returns_declared_outputs() {
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    let outputs = vm
        .run(
            &inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]),
            VmOptions::default().with_trace_level(2).with_verbose_op(Opcode::Mul),
        )
        .unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(f32_of(&outputs["c"]), vec![5.0]);
    assert_eq!(f32_of(&outputs["d"]), vec![10.0]);
}

#[test]
fn missing_input() {
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    let err = vm
        .prepare(&inputs(vec![("a", scalar(2.0))]), VmOptions::default())
        .unwrap_err();
    assert!(matches!(err, VmError::MissingInput(name) if name == "b"));
}

#[test]
fn input_type_check() {
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    let wrong = Var::from(Tensor::new(vec![1].into(), vec![2i64]));
    let given = inputs(vec![("a", scalar(2.0)), ("b", wrong)]);

    let err = vm
        .prepare(&given, VmOptions::default().with_type_check(true))
        .unwrap_err();
    assert!(matches!(err, VmError::InputType { ref name, .. } if name == "b"));

    let err = vm
        .prepare(
            &inputs(vec![("a", scalar(2.0)), ("b", Var::Null)]),
            VmOptions::default().with_type_check(true),
        )
        .unwrap_err();
    assert!(matches!(err, VmError::InputType { .. }));

    assert!(vm.prepare(&given, VmOptions::default()).is_ok());
}

#[test]
fn output_type_check() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_instruction(
            Instruction::new(Opcode::Neg)
                .with_ins(vec![1])
                .with_outs(vec![2])
                .with_output_types(vec![Some(TypeDecl::new(TensorElemType::F32, vec![2]))]),
        )
        .with_output("b", 2);
    let vm = VirtualMachine::new(program, true).unwrap();
    let given = inputs(vec![("a", scalar(1.0))]);

    let err = vm
        .run(&given, VmOptions::default().with_type_check(true))
        .unwrap_err();
    assert!(matches!(err, VmError::OutputType { .. }));
    assert_eq!(
        f32_of(&vm.run(&given, VmOptions::default()).unwrap()["b"]),
        vec![-1.0]
    );
}

#[test]
fn sequence_output_against_tensor_type() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_instruction(
            Instruction::new(Opcode::SequenceCreate)
                .with_ins(vec![1])
                .with_outs(vec![2])
                .with_output_types(vec![Some(TypeDecl::new(TensorElemType::F32, vec![1]))]),
        )
        .with_output("seq", 2);
    let vm = VirtualMachine::new(program, true).unwrap();
    let given = inputs(vec![("a", scalar(1.0))]);

    let err = vm
        .run(&given, VmOptions::default().with_type_check(true))
        .unwrap_err();
    assert!(matches!(err, VmError::OutputType { .. }));
    assert!(vm.run(&given, VmOptions::default()).is_ok());
}

#[test]
fn failing_instruction_stops_the_run() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_input("b", 2, None)
        .with_instruction(Instruction::new(Opcode::Add).with_ins(vec![1, 2]).with_outs(vec![3]))
        .with_instruction(Instruction::new(Opcode::Neg).with_ins(vec![3]).with_outs(vec![4]))
        .with_output("c", 4);
    let vm = VirtualMachine::new(program, true).unwrap();
    let given = inputs(vec![
        ("a", Tensor::new(vec![2].into(), vec![1.0f32, 2.0]).into()),
        ("b", Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.0]).into()),
    ]);

    for catch_exception in [true, false] {
        let mut state = vm
            .prepare(
                &given,
                VmOptions::default().with_catch_exception(catch_exception),
            )
            .unwrap();
        assert!(vm.run_state(&mut state).is_err());
        assert_eq!(state.pc(), 0);
        assert!(!state.is_set(4));
    }
}

#[test]
fn nan_and_inf_checks() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_input("b", 2, None)
        .with_instruction(Instruction::new(Opcode::Div).with_ins(vec![1, 2]).with_outs(vec![3]))
        .with_output("c", 3);
    let vm = VirtualMachine::new(program, true).unwrap();

    let inf = inputs(vec![("a", scalar(1.0)), ("b", scalar(0.0))]);
    let err = vm
        .run(&inf, VmOptions::default().with_inf_check(true))
        .unwrap_err();
    assert!(matches!(err, VmError::InfDetected { slot: 3, .. }));
    assert!(vm.run(&inf, VmOptions::default()).is_ok());

    let nan = inputs(vec![("a", scalar(0.0)), ("b", scalar(0.0))]);
    let err = vm
        .run(&nan, VmOptions::default().with_nan_check(true))
        .unwrap_err();
    assert!(matches!(err, VmError::NanDetected { slot: 3, .. }));
}

#[test]
fn deferred_init() {
    let mut vm = VmBuilder::new(add_mul()).with_init(false).build().unwrap();
    let given = inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]);
    let err = vm.run(&given, VmOptions::default()).unwrap_err();
    assert!(matches!(err, VmError::NotInitialized));

    vm.init().unwrap();
    vm.init().unwrap();
    assert_eq!(f32_of(&vm.run(&given, VmOptions::default()).unwrap()["d"]), vec![10.0]);
}

#[test]
fn slots_out_of_range() {
    let program = Program::new()
        .with_input("a", 7, None)
        .with_instruction(Instruction::new(Opcode::Neg).with_ins(vec![7]).with_outs(vec![1]));
    assert!(matches!(
        VirtualMachine::new(program, true),
        Err(VmError::InvalidProgram(_))
    ));
}

#[test]
fn unknown_opcode() {
    let result = VmBuilder::new(add_mul())
        .with_registry(OpRegistry::empty())
        .build();
    assert!(matches!(result, Err(VmError::UnknownOpcode(name)) if name == "Add"));
}

#[test]
fn freed_output() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_instruction(Instruction::new(Opcode::Neg).with_ins(vec![1]).with_outs(vec![2]))
        .with_instruction(Instruction::new(Opcode::Free).with_ins(vec![2]))
        .with_output("b", 2);
    let vm = VirtualMachine::new(program, true).unwrap();
    let err = vm
        .run(&inputs(vec![("a", scalar(1.0))]), VmOptions::default())
        .unwrap_err();
    assert!(matches!(err, VmError::NoSuchVariable(2)));
}

#[test]
fn dump_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    vm.run(
        &inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]),
        VmOptions::default().with_dump_outputs_dir(dir.path()),
    )
    .unwrap();

    let sum = load_npy(dir.path().join("00000_sum.npy")).unwrap();
    let prod = load_npy(dir.path().join("00001_prod.npy")).unwrap();
    assert!(sum.allclose(&[5.0f32]));
    assert!(prod.allclose(&[10.0f32]));
}

#[test]
fn chrome_tracing() {
    let tracing = Arc::new(ChromeTracing::new());
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    vm.run(
        &inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]),
        VmOptions::default().with_chrome_tracing(tracing.clone()),
    )
    .unwrap();
    assert_eq!(tracing.num_events(), 3);

    let file = tempfile::NamedTempFile::new().unwrap();
    tracing.write(file.path()).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
    let events = json["traceEvents"].as_array().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().any(|e| e["name"] == "Add"));
}

#[test]
fn memory_dump() {
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    let mut state = vm
        .prepare(
            &inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]),
            VmOptions::default().with_memory_dump(2, Some(0)),
        )
        .unwrap();
    vm.run_state(&mut state).unwrap();
    assert_eq!(state.peak_memory(), 16);
}

#[test]
fn memory_dump_reports_process_peak() {
    struct CountingMemory(Arc<AtomicUsize>);

    impl MemoryProbe for CountingMemory {
        fn current_bytes(&self) -> Option<i64> {
            None
        }

        fn peak_bytes(&self) -> Option<i64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(4 << 20)
        }
    }

    let _ = env_logger::builder().is_test(true).try_init();

    let peak_reads = Arc::new(AtomicUsize::new(0));
    let vm = VmBuilder::new(add_mul())
        .with_memory_probe(Box::new(CountingMemory(peak_reads.clone())))
        .build()
        .unwrap();
    let given = inputs(vec![("a", scalar(2.0)), ("b", scalar(3.0))]);

    vm.run(&given, VmOptions::default()).unwrap();
    assert_eq!(peak_reads.load(Ordering::SeqCst), 0);
    vm.run(&given, VmOptions::default().with_memory_dump(1, None))
        .unwrap();
    assert_eq!(peak_reads.load(Ordering::SeqCst), 1);
}

#[test]
fn stack_push_pop() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_instruction(
            Instruction::new(Opcode::StackPush)
                .with_attr(Attr::Stack { id: 3 })
                .with_ins(vec![1]),
        )
        .with_instruction(Instruction::new(Opcode::Neg).with_ins(vec![1]).with_outs(vec![2]))
        .with_instruction(
            Instruction::new(Opcode::StackPop)
                .with_attr(Attr::Stack { id: 3 })
                .with_outs(vec![3]),
        )
        .with_output("b", 2)
        .with_output("c", 3);
    let vm = VirtualMachine::new(program, true).unwrap();
    let outputs = vm
        .run(&inputs(vec![("a", scalar(4.0))]), VmOptions::default())
        .unwrap();
    assert_eq!(f32_of(&outputs["b"]), vec![-4.0]);
    assert_eq!(f32_of(&outputs["c"]), vec![4.0]);

    let pop_only = Program::new().with_instruction(
        Instruction::new(Opcode::StackPop)
            .with_attr(Attr::Stack { id: 3 })
            .with_outs(vec![1]),
    );
    let vm = VirtualMachine::new(pop_only, true).unwrap();
    let err = vm.run(&FxHashMap::default(), VmOptions::default()).unwrap_err();
    assert!(matches!(err, VmError::EmptyStack(3)));
}

fn fused_program(code: &str) -> Program {
    Program::new()
        .with_input("a", 1, None)
        .with_input("b", 2, None)
        .with_instruction(
            Instruction::new(Opcode::FusedElemwise)
                .with_attr(Attr::FusedElemwise {
                    name: "fma_relu".into(),
                    code: code.into(),
                })
                .with_ins(vec![1, 2])
                .with_outs(vec![3]),
        )
        .with_output("c", 3)
}

#[test]
fn fused_kernels_share_the_cache() {
    let cache = Arc::new(KernelCache::new());
    let code = "$0 $1 mul 1 sub relu";
    let vm0 = VmBuilder::new(fused_program(code))
        .with_kernel_cache(cache.clone())
        .build()
        .unwrap();
    let vm1 = VmBuilder::new(fused_program(code))
        .with_kernel_cache(cache.clone())
        .build()
        .unwrap();
    assert_eq!(cache.num_compilations(), 1);
    assert_eq!(cache.len(), 1);

    let given = inputs(vec![
        ("a", Tensor::new(vec![3].into(), vec![1.0f32, 2.0, 3.0]).into()),
        ("b", scalar(0.5)),
    ]);
    for vm in [&vm0, &vm1] {
        let c = vm.run(&given, VmOptions::default()).unwrap();
        assert!(c["c"].as_array().unwrap().allclose(&[0.0f32, 0.0, 0.5]));
    }
}

#[test]
fn fused_kernel_compile_error() {
    let result = VirtualMachine::new(fused_program("$0 frobnicate"), true);
    assert!(matches!(result, Err(VmError::Kernel(_))));
}

#[test]
fn custom_op() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_instruction(
            Instruction::new(Opcode::Custom)
                .with_attr(Attr::Custom {
                    name: "double".into(),
                })
                .with_ins(vec![1])
                .with_outs(vec![2]),
        )
        .with_output("b", 2);
    let vm = VirtualMachine::new(program, true).unwrap();
    let given = inputs(vec![("a", scalar(21.0))]);

    let options = VmOptions::default().with_custom_op("double", |inputs| {
        let x = inputs[0].data::<f32>();
        Ok(vec![Tensor::new(
            inputs[0].dims().clone(),
            x.iter().map(|x| x * 2.0).collect::<Vec<f32>>(),
        )])
    });
    assert_eq!(f32_of(&vm.run(&given, options).unwrap()["b"]), vec![42.0]);

    let err = vm.run(&given, VmOptions::default()).unwrap_err();
    assert!(matches!(err, VmError::CustomOp { ref name, .. } if name == "double"));

    let failing = VmOptions::default().with_custom_op("double", |_| Err("boom".to_string()));
    let err = vm.run(&given, failing).unwrap_err();
    assert_eq!(err.to_string(), "Custom op 'double': boom");
}

#[test]
fn sequences() {
    let program = Program::new()
        .with_input("a", 1, None)
        .with_input("b", 2, None)
        .with_input("i", 3, None)
        .with_instruction(
            Instruction::new(Opcode::SequenceCreate)
                .with_ins(vec![1])
                .with_outs(vec![4]),
        )
        .with_instruction(
            Instruction::new(Opcode::SequenceAppend)
                .with_ins(vec![4, 2])
                .with_outs(vec![5]),
        )
        .with_instruction(
            Instruction::new(Opcode::SequenceLookup)
                .with_ins(vec![5, 3])
                .with_outs(vec![6]),
        )
        .with_output("seq", 5)
        .with_output("x", 6);
    let vm = VirtualMachine::new(program, true).unwrap();
    let run = |index: i64| {
        vm.run(
            &inputs(vec![
                ("a", scalar(1.0)),
                ("b", scalar(2.0)),
                ("i", Tensor::scalar(index).into()),
            ]),
            VmOptions::default(),
        )
    };

    let outputs = run(-1).unwrap();
    assert_eq!(outputs["seq"].as_sequence().unwrap().len(), 2);
    assert_eq!(f32_of(&outputs["x"]), vec![2.0]);
    assert_eq!(f32_of(&run(0).unwrap()["x"]), vec![1.0]);
    assert!(run(2).is_err());
}

#[test]
fn dropout() {
    let program = Program::new()
        .with_input("x", 1, None)
        .with_instruction(
            Instruction::new(Opcode::Dropout)
                .with_attr(Attr::Dropout { ratio: 0.5 })
                .with_ins(vec![1])
                .with_outs(vec![2, 3]),
        )
        .with_output("y", 2)
        .with_output("mask", 3);
    let vm = VirtualMachine::new(program, true).unwrap();
    let given = inputs(vec![("x", Tensor::new(vec![64].into(), vec![1.0f32; 64]).into())]);

    let outputs = vm.run(&given, VmOptions::default()).unwrap();
    assert_eq!(f32_of(&outputs["y"]), vec![1.0; 64]);
    assert!(outputs["mask"]
        .as_array()
        .unwrap()
        .data::<bool>()
        .iter()
        .all(|&m| m));

    let outputs = vm
        .run(&given, VmOptions::default().with_training(true))
        .unwrap();
    let y = f32_of(&outputs["y"]);
    let mask = outputs["mask"].as_array().unwrap().data::<bool>().to_vec();
    for (y, keep) in y.iter().zip(mask) {
        assert_eq!(*y, if keep { 2.0 } else { 0.0 });
    }
}

#[test]
fn concurrent_states() {
    let vm = VirtualMachine::new(add_mul(), true).unwrap();
    std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|i| {
                let vm = &vm;
                scope.spawn(move || {
                    let a = i as f32;
                    let outputs = vm
                        .run(
                            &inputs(vec![("a", scalar(a)), ("b", scalar(1.0))]),
                            VmOptions::default(),
                        )
                        .unwrap();
                    (f32_of(&outputs["d"])[0], (a + 1.0) * a)
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let (actual, expected) = handle.join().unwrap();
            assert_eq!(actual, expected);
        }
    });
}

#[test]
fn matmul_matches_ndarray() {
    use ndarray::Ix2;

    let a = Tensor::rand::<f32>(vec![3, 4].into());
    let b = Tensor::rand::<f32>(vec![4, 2].into());
    let expected = a
        .view::<f32>()
        .unwrap()
        .into_dimensionality::<Ix2>()
        .unwrap()
        .dot(&b.view::<f32>().unwrap().into_dimensionality::<Ix2>().unwrap());

    let program = Program::new()
        .with_input("a", 1, Some(TypeDecl::new(TensorElemType::F32, vec![3, 4])))
        .with_input("b", 2, Some(TypeDecl::new(TensorElemType::F32, vec![4, 2])))
        .with_instruction(
            Instruction::new(Opcode::MatMul)
                .with_ins(vec![1, 2])
                .with_outs(vec![3])
                .with_output_types(vec![Some(TypeDecl::new(TensorElemType::F32, vec![3, 2]))]),
        )
        .with_output("c", 3);
    let vm = VirtualMachine::new(program, true).unwrap();
    let outputs = vm
        .run(
            &inputs(vec![("a", a.into()), ("b", b.into())]),
            VmOptions::default().with_type_check(true),
        )
        .unwrap();
    let c = outputs["c"].as_array().unwrap();
    assert_eq!(c.dims().as_slice(), &[3, 2]);
    assert!(c.allclose(&expected.iter().copied().collect::<Vec<f32>>()));
}
