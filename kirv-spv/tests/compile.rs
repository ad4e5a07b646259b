//! End-to-end compiles: IR module in, side-car header plus SPIR-V body out.
use kirv_core::KernelModule;
use kirv_ir::expr::{self, Expr, ForKind, Stmt};
use kirv_ir::Type;
use kirv_spv::{emit, IrModule, Kernel, KernelArg};
use num_traits::FromPrimitive;
use pretty_assertions::assert_eq;
use spirv::{Capability, ExecutionMode, Op};

fn compile(kernels: Vec<Kernel>) -> KernelModule {
    let _ = env_logger::builder().is_test(true).try_init();
    emit(&IrModule { kernels }).unwrap()
}

fn ops_of(module: &KernelModule) -> Vec<(Op, Vec<u32>)> {
    module
        .body
        .instrs()
        .unwrap()
        .map(|instr| {
            let instr = instr.unwrap();
            (
                Op::from_u32(instr.opcode()).expect("unknown opcode"),
                instr.words()[1..].to_vec(),
            )
        })
        .collect()
}

fn instr_views(module: &KernelModule) -> Vec<Vec<u32>> {
    module
        .body
        .instrs()
        .unwrap()
        .map(|instr| instr.unwrap().words().to_vec())
        .collect()
}

fn extensions_of(module: &KernelModule) -> Vec<String> {
    module
        .body
        .instrs()
        .unwrap()
        .filter_map(|instr| {
            let instr = instr.unwrap();
            if instr.opcode() == Op::Extension as u32 {
                Some(instr.operands().read_str().unwrap())
            } else {
                None
            }
        })
        .collect()
}

fn capabilities_of(module: &KernelModule) -> Vec<u32> {
    module
        .body
        .instrs()
        .unwrap()
        .filter_map(|instr| {
            let instr = instr.unwrap();
            if instr.opcode() == Op::Capability as u32 {
                Some(instr.words()[1])
            } else {
                None
            }
        })
        .collect()
}

/// The S6 kernel: `f[i] = f[i] + 1` over u8, blocks (4,1,1), threads
/// (64,1,1).
fn increment_kernel() -> Kernel {
    let i32s = Type::i32(1);
    let u8s = Type::u8(1);
    let block = expr::var(i32s, "f__block_id_x");
    let thread = expr::var(i32s, "f__thread_id_x");
    let index = expr::var(i32s, "idx");
    let value = expr::load(u8s, "f", index.clone()) + expr::const_of(u8s, 1);
    let body = Stmt::For {
        name: "f__block_id_x".to_owned(),
        kind: ForKind::GpuBlock,
        min: expr::int_imm(i32s, 0),
        extent: expr::int_imm(i32s, 4),
        body: Box::new(Stmt::For {
            name: "f__thread_id_x".to_owned(),
            kind: ForKind::GpuThread,
            min: expr::int_imm(i32s, 0),
            extent: expr::int_imm(i32s, 64),
            body: Box::new(Stmt::LetStmt {
                name: "idx".to_owned(),
                value: block * expr::int_imm(i32s, 64) + thread,
                body: Box::new(Stmt::Store {
                    buffer: "f".to_owned(),
                    index,
                    value,
                    predicate: None,
                }),
            }),
        }),
    };
    Kernel {
        name: "f".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "f".to_owned(),
            elem_ty: u8s,
            writable: true,
        }],
        body,
    }
}

#[test]
fn increment_kernel_module_shape() {
    let module = compile(vec![increment_kernel()]);

    // Side-car header: one entry point, no uniform buffer, one storage
    // buffer.
    assert_eq!(module.header.entry_points.len(), 1);
    let entry = &module.header.entry_points[0];
    assert_eq!(entry.name, "f");
    assert_eq!(entry.uniform_buffer_count, 0);
    assert_eq!(entry.storage_buffer_count, 1);

    // 8-bit data pulls in the capability and the storage extension.
    assert!(capabilities_of(&module).contains(&(Capability::Int8 as u32)));
    assert!(extensions_of(&module).contains(&"SPV_KHR_8bit_storage".to_owned()));

    // Execution mode LocalSize 64 1 1.
    let ops = ops_of(&module);
    let local_size = ops
        .iter()
        .find(|(op, _)| *op == Op::ExecutionMode)
        .expect("no execution mode");
    assert_eq!(local_size.1[1], ExecutionMode::LocalSize as u32);
    assert_eq!(&local_size.1[2..5], &[64, 1, 1]);

    // The header round-trips through its binary form.
    let words = module.encode();
    let decoded = KernelModule::decode(&words).unwrap();
    assert_eq!(decoded.header, module.header);
}

#[test]
fn scalar_args_pack_into_one_uniform_struct() {
    let i32s = Type::i32(1);
    let body = Stmt::Store {
        buffer: "out".to_owned(),
        index: expr::int_imm(i32s, 0),
        value: expr::var(i32s, "gain") + expr::var(i32s, "bias"),
        predicate: None,
    };
    let kernel = Kernel {
        name: "mix".to_owned(),
        args: vec![
            KernelArg::Scalar {
                name: "gain".to_owned(),
                ty: i32s,
            },
            KernelArg::Scalar {
                name: "bias".to_owned(),
                ty: i32s,
            },
            KernelArg::Buffer {
                name: "out".to_owned(),
                elem_ty: i32s,
                writable: true,
            },
        ],
        body,
    };
    let module = compile(vec![kernel]);
    let entry = &module.header.entry_points[0];
    assert_eq!(entry.uniform_buffer_count, 1);
    assert_eq!(entry.storage_buffer_count, 1);
}

#[test]
fn value_conditional_makes_four_blocks_and_a_phi() {
    let i32s = Type::i32(1);
    let selected = expr::if_then_else(
        expr::gt(expr::var(i32s, "p"), expr::int_imm(i32s, 0)),
        expr::var(i32s, "p") + expr::int_imm(i32s, 1),
        expr::int_imm(i32s, 7),
    );
    let kernel = Kernel {
        name: "pick".to_owned(),
        args: vec![
            KernelArg::Scalar {
                name: "p".to_owned(),
                ty: i32s,
            },
            KernelArg::Buffer {
                name: "out".to_owned(),
                elem_ty: i32s,
                writable: true,
            },
        ],
        body: Stmt::Store {
            buffer: "out".to_owned(),
            index: expr::int_imm(i32s, 0),
            value: selected,
            predicate: None,
        },
    };
    let module = compile(vec![kernel]);
    let ops = ops_of(&module);

    let labels = ops.iter().filter(|(op, _)| *op == Op::Label).count();
    assert_eq!(labels, 4, "if, then, else, merge");

    let phis: Vec<&(Op, Vec<u32>)> = ops.iter().filter(|(op, _)| *op == Op::Phi).collect();
    assert_eq!(phis.len(), 1);
    // type, result, then two (value, parent) pairs.
    assert_eq!(phis[0].1.len(), 6);
}

#[test]
fn serial_loop_emits_the_five_block_machine() {
    let i32s = Type::i32(1);
    let body = Stmt::For {
        name: "i".to_owned(),
        kind: ForKind::Serial,
        min: expr::int_imm(i32s, 0),
        extent: expr::int_imm(i32s, 10),
        body: Box::new(Stmt::Store {
            buffer: "out".to_owned(),
            index: expr::var(i32s, "i"),
            value: expr::var(i32s, "i"),
            predicate: None,
        }),
    };
    let kernel = Kernel {
        name: "iota".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body,
    };
    let module = compile(vec![kernel]);
    let ops = ops_of(&module);

    // entry, header, top, body, continue, merge.
    let labels = ops.iter().filter(|(op, _)| *op == Op::Label).count();
    assert_eq!(labels, 6);
    assert_eq!(ops.iter().filter(|(op, _)| *op == Op::LoopMerge).count(), 1);
    assert_eq!(
        ops.iter()
            .filter(|(op, _)| *op == Op::BranchConditional)
            .count(),
        1
    );

    // The loop merge declaration precedes the conditional branch.
    let merge_pos = ops.iter().position(|(op, _)| *op == Op::LoopMerge).unwrap();
    let cond_pos = ops
        .iter()
        .position(|(op, _)| *op == Op::BranchConditional)
        .unwrap();
    assert!(merge_pos < cond_pos);
}

#[test]
fn every_block_ends_with_exactly_one_terminator() {
    let module = compile(vec![increment_kernel()]);
    let is_terminator = |op: Op| {
        matches!(
            op,
            Op::Branch
                | Op::BranchConditional
                | Op::Switch
                | Op::Kill
                | Op::Return
                | Op::ReturnValue
                | Op::Unreachable
        )
    };
    let ops = ops_of(&module);
    let mut in_block = false;
    let mut terminated = false;
    for (op, _) in &ops {
        match op {
            Op::Label => {
                assert!(!in_block || terminated, "block entered before terminator");
                in_block = true;
                terminated = false;
            }
            Op::FunctionEnd => {
                assert!(terminated, "function ended with unterminated block");
                in_block = false;
            }
            _ => {
                if in_block {
                    assert!(!terminated, "instruction {:?} after terminator", op);
                    if is_terminator(*op) {
                        terminated = true;
                    }
                }
            }
        }
    }
}

#[test]
fn emitted_word_counts_are_consistent() {
    let module = compile(vec![increment_kernel()]);
    let views = instr_views(&module);
    let mut total = 5usize;
    for words in &views {
        assert_eq!(words.len(), (words[0] >> 16) as usize);
        total += words.len();
    }
    assert_eq!(total, module.body.words().len());
}

#[test]
fn conflicting_workgroup_extents_fail_compilation() {
    let i32s = Type::i32(1);
    let store = |i: i64| Stmt::Store {
        buffer: "out".to_owned(),
        index: expr::int_imm(i32s, i),
        value: expr::var(i32s, "t__thread_id_x"),
        predicate: None,
    };
    let loop_of = |extent: i64, body: Stmt| Stmt::For {
        name: "t__thread_id_x".to_owned(),
        kind: ForKind::GpuThread,
        min: expr::int_imm(i32s, 0),
        extent: expr::int_imm(i32s, extent),
        body: Box::new(body),
    };
    let kernel = Kernel {
        name: "t".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body: Stmt::Block {
            stmts: vec![loop_of(64, store(0)), loop_of(32, store(1))],
        },
    };
    let err = emit(&IrModule {
        kernels: vec![kernel],
    })
    .unwrap_err();
    assert!(err.to_string().contains("conflicting extents"));
}

#[test]
fn unknown_gpu_suffix_is_a_compile_error() {
    let i32s = Type::i32(1);
    let kernel = Kernel {
        name: "t".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body: Stmt::For {
            name: "t__warp_id_x".to_owned(),
            kind: ForKind::GpuThread,
            min: expr::int_imm(i32s, 0),
            extent: expr::int_imm(i32s, 64),
            body: Box::new(Stmt::Store {
                buffer: "out".to_owned(),
                index: expr::int_imm(i32s, 0),
                value: expr::int_imm(i32s, 0),
                predicate: None,
            }),
        },
    };
    assert!(emit(&IrModule {
        kernels: vec![kernel]
    })
    .is_err());
}

#[test]
fn predicated_vector_store_is_scalarized() {
    let i32v = Type::i32(4);
    let i32s = Type::i32(1);
    let index = expr::ramp(expr::int_imm(i32s, 0), expr::int_imm(i32s, 1), 4);
    let kernel = Kernel {
        name: "masked".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body: Stmt::Store {
            buffer: "out".to_owned(),
            index: index.clone(),
            value: expr::broadcast(expr::int_imm(i32s, 9), 4),
            predicate: Some(expr::lt(index, expr::broadcast(expr::int_imm(i32s, 2), 4))),
        },
    };
    let module = compile(vec![kernel]);
    let ops = ops_of(&module);
    // Four lanes, each behind its own conditional branch.
    let stores = ops.iter().filter(|(op, _)| *op == Op::Store).count();
    assert_eq!(stores, 4);
    let conditionals = ops
        .iter()
        .filter(|(op, _)| *op == Op::BranchConditional)
        .count();
    assert_eq!(conditionals, 4);
}

#[test]
fn thread_barrier_emits_a_control_barrier() {
    let i32s = Type::i32(1);
    let barrier = expr::call(
        Type::handle(),
        kirv_ir::CallOp::GpuThreadBarrier,
        vec![expr::int_imm(i32s, kirv_spv::emit::BARRIER_SHARED as i64)],
    );
    let kernel = Kernel {
        name: "sync".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body: Stmt::Block {
            stmts: vec![
                Stmt::Store {
                    buffer: "out".to_owned(),
                    index: expr::int_imm(i32s, 0),
                    value: expr::int_imm(i32s, 1),
                    predicate: None,
                },
                Stmt::Evaluate { value: barrier },
            ],
        },
    };
    let module = compile(vec![kernel]);
    let ops = ops_of(&module);
    assert_eq!(
        ops.iter().filter(|(op, _)| *op == Op::ControlBarrier).count(),
        1
    );
}

#[test]
fn two_kernels_share_one_module_with_distinct_descriptor_sets() {
    let module = compile(vec![
        increment_kernel(),
        {
            let mut second = increment_kernel();
            second.name = "g".to_owned();
            second.body = rename_kernel_vars(&second.body, "f", "g");
            second
        },
    ]);
    assert_eq!(module.header.entry_points.len(), 2);
    assert_eq!(module.header.entry_points[0].name, "f");
    assert_eq!(module.header.entry_points[1].name, "g");

    let ops = ops_of(&module);
    let entry_points = ops.iter().filter(|(op, _)| *op == Op::EntryPoint).count();
    assert_eq!(entry_points, 2);
}

fn rename_kernel_vars(stmt: &Stmt, from: &str, to: &str) -> Stmt {
    let rename = |s: &str| s.replace(from, to);
    match stmt {
        Stmt::For {
            name,
            kind,
            min,
            extent,
            body,
        } => Stmt::For {
            name: rename(name),
            kind: *kind,
            min: rename_expr(min, from, to),
            extent: rename_expr(extent, from, to),
            body: Box::new(rename_kernel_vars(body, from, to)),
        },
        Stmt::LetStmt { name, value, body } => Stmt::LetStmt {
            name: name.clone(),
            value: rename_expr(value, from, to),
            body: Box::new(rename_kernel_vars(body, from, to)),
        },
        Stmt::Store {
            buffer,
            index,
            value,
            predicate,
        } => Stmt::Store {
            buffer: rename(buffer),
            index: rename_expr(index, from, to),
            value: rename_expr(value, from, to),
            predicate: predicate.as_ref().map(|p| rename_expr(p, from, to)),
        },
        other => other.map(
            &mut |e| rename_expr(e, from, to),
            &mut |s| rename_kernel_vars(s, from, to),
        ),
    }
}

fn rename_expr(e: &Expr, from: &str, to: &str) -> Expr {
    match e {
        Expr::Var { ty, name } => Expr::Var {
            ty: *ty,
            name: name.replace(from, to),
        },
        Expr::Load {
            ty,
            buffer,
            index,
            predicate,
        } => Expr::Load {
            ty: *ty,
            buffer: buffer.replace(from, to),
            index: Box::new(rename_expr(index, from, to)),
            predicate: predicate
                .as_ref()
                .map(|p| Box::new(rename_expr(p, from, to))),
        },
        _ => e.map_children(&mut |child| rename_expr(child, from, to)),
    }
}
