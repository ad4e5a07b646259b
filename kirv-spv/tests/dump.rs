//! The SPIR-V dump switch. Its own binary: it mutates process state.
use kirv_ir::expr;
use kirv_ir::{Stmt, Type};
use kirv_spv::{emit, IrModule, Kernel, KernelArg};

#[test]
fn dump_file_receives_the_body_without_the_sidecar() {
    let path = std::env::temp_dir().join("kirv_dump_test.spv");
    std::env::set_var("HL_SPIRV_DUMP_FILE", &path);

    let i32s = Type::i32(1);
    let kernel = Kernel {
        name: "f".to_owned(),
        args: vec![KernelArg::Buffer {
            name: "out".to_owned(),
            elem_ty: i32s,
            writable: true,
        }],
        body: Stmt::Store {
            buffer: "out".to_owned(),
            index: expr::int_imm(i32s, 0),
            value: expr::int_imm(i32s, 1),
            predicate: None,
        },
    };
    let module = emit(&IrModule {
        kernels: vec![kernel],
    })
    .unwrap();
    std::env::remove_var("HL_SPIRV_DUMP_FILE");

    let dumped = std::fs::read(&path).unwrap();
    let expected: Vec<u8> = module
        .body
        .words()
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    assert_eq!(dumped, expected);
    // The side-car header never reaches the dump.
    assert_eq!(&dumped[0..4], &0x0723_0203u32.to_le_bytes());
    let _ = std::fs::remove_file(&path);
}
