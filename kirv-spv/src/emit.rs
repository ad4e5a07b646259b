//! Compute shader emitter: walk kernel IR depth-first and drive the
//! builder.
//!
//! The emitter keeps a stacked symbol table (ids plus storage classes), a
//! workgroup-size triplet discovered from GPU thread loops, and the
//! per-entry-point descriptor table that becomes the module's side-car
//! header. Intrinsic arithmetic that the target cannot express directly is
//! resolved through the semantic lowerer before emission.
use fnv::FnvHashMap as HashMap;

use kirv_core::binary::{InstructionBuilder, SpirvBinary};
use kirv_core::header::{EntryPointHeader, ModuleHeader};
use kirv_core::KernelModule;
use kirv_ir::expr::{self, BinOp, CallOp, CmpOp, Expr, ForKind, Stmt};
use kirv_ir::{lower, recognize, Type, TypeCode};
use spirv::{BuiltIn, Decoration, ExecutionModel, GLOp, Op, StorageClass};

use crate::builder::{Id, IdKind, SpvBuilder};
use crate::error::{anyhow, bail, Result};

/// Barrier mask bit: device-visible (global) memory is fenced.
pub const BARRIER_DEVICE: i128 = 1;
/// Barrier mask bit: workgroup-shared memory is fenced.
pub const BARRIER_SHARED: i128 = 2;

/// One kernel argument. Scalars are packed into a single uniform parameter
/// struct; every buffer becomes its own storage binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Scalar { name: String, ty: Type },
    Buffer { name: String, elem_ty: Type, writable: bool },
}

#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub args: Vec<KernelArg>,
    pub body: Stmt,
}

/// A compilation unit: one SPIR-V module, one entry point per kernel.
#[derive(Debug, Clone, Default)]
pub struct IrModule {
    pub kernels: Vec<Kernel>,
}

/// Compile a module to its binary form: side-car descriptor header plus
/// SPIR-V body. Runs intrinsic recognition on each kernel body first.
pub fn emit(module: &IrModule) -> Result<KernelModule> {
    let mut emitter = ShaderEmitter::new();
    for (index, kernel) in module.kernels.iter().enumerate() {
        emitter.emit_kernel(index as u32, kernel)?;
    }
    let ShaderEmitter {
        builder,
        descriptor_sets,
        ..
    } = emitter;
    let body = builder.finalize()?;
    dump_if_requested(&body);
    Ok(KernelModule {
        header: ModuleHeader {
            entry_points: descriptor_sets,
        },
        body,
    })
}

/// `HL_SPIRV_DUMP_FILE=path` writes the SPIR-V body, without the side-car
/// header, to disk.
fn dump_if_requested(body: &SpirvBinary) {
    if let Ok(path) = std::env::var("HL_SPIRV_DUMP_FILE") {
        if path.is_empty() {
            return;
        }
        let bytes: Vec<u8> = body.words().iter().flat_map(|w| w.to_le_bytes()).collect();
        match std::fs::write(&path, bytes) {
            Ok(()) => log::debug!("dumped spirv body to {}", path),
            Err(err) => log::warn!("could not dump spirv body to {}: {}", path, err),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SymbolClass {
    /// An SSA value: let binding, loop index, loaded scalar argument.
    Value,
    /// A struct-wrapped runtime-array buffer binding.
    Buffer { storage: StorageClass, elem_ty: Type },
    /// A local or shared array from `Allocate`.
    Array { storage: StorageClass, elem_ty: Type },
}

#[derive(Clone, Copy)]
struct Symbol {
    id: Id,
    class: SymbolClass,
}

/// Name-to-id bindings, stacked so `Let`/`LetStmt`/`Allocate` push and pop.
#[derive(Default)]
struct SymbolTable {
    frames: Vec<(String, Symbol)>,
}

impl SymbolTable {
    fn bind(&mut self, name: &str, symbol: Symbol) {
        self.frames.push((name.to_owned(), symbol));
    }
    fn unbind(&mut self, name: &str) {
        if let Some(pos) = self.frames.iter().rposition(|(n, _)| n == name) {
            self.frames.remove(pos);
        }
    }
    fn lookup(&self, name: &str) -> Result<Symbol> {
        self.frames
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| anyhow!("undefined symbol {}", name))
    }
    fn clear(&mut self) {
        self.frames.clear();
    }
}

struct ShaderEmitter {
    builder: SpvBuilder,
    symbols: SymbolTable,
    workgroup_size: [u32; 3],
    /// Module-scope builtin variables, shared between entry points.
    builtin_vars: HashMap<u32, Id>,
    /// Per-kernel loads of the builtin vectors, done once at entry.
    builtin_loads: HashMap<u32, Id>,
    /// Runtime array types already carrying an ArrayStride decoration.
    strided_arrays: Vec<Id>,
    /// Buffer structs already decorated, so interned repeats stay clean.
    decorated_structs: Vec<Id>,
    descriptor_sets: Vec<EntryPointHeader>,
}

impl ShaderEmitter {
    fn new() -> Self {
        ShaderEmitter {
            builder: SpvBuilder::new(),
            symbols: SymbolTable::default(),
            workgroup_size: [0; 3],
            builtin_vars: HashMap::default(),
            builtin_loads: HashMap::default(),
            strided_arrays: Vec::new(),
            decorated_structs: Vec::new(),
            descriptor_sets: Vec::new(),
        }
    }

    fn emit_kernel(&mut self, index: u32, kernel: &Kernel) -> Result<()> {
        log::debug!("emitting kernel {:?}", kernel.name);
        self.symbols.clear();
        self.builtin_loads.clear();
        self.workgroup_size = [0; 3];

        let body = recognize::find_intrinsics(&kernel.body);
        let body = scalarize_predicates(&body);

        let void = self.builder.declare_type(Type::handle());
        let fn_ty = self.builder.declare_function_type(void, &[]);
        let function = self.builder.begin_function(void, fn_ty, 0);
        self.builder.set_name(function, &kernel.name);

        let mut interface = Vec::new();
        let (uses_thread_id, uses_block_id) = scan_gpu_builtins(&body);
        if uses_thread_id {
            let var = self.builtin_variable(BuiltIn::LocalInvocationId);
            interface.push(var);
            self.load_builtin(BuiltIn::LocalInvocationId, var)?;
        }
        if uses_block_id {
            let var = self.builtin_variable(BuiltIn::WorkgroupId);
            interface.push(var);
            self.load_builtin(BuiltIn::WorkgroupId, var)?;
        }

        let mut binding = 0u32;
        let mut uniform_buffer_count = 0u32;
        let mut storage_buffer_count = 0u32;

        let scalars: Vec<(&String, Type)> = kernel
            .args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Scalar { name, ty } => Some((name, *ty)),
                _ => None,
            })
            .collect();
        if !scalars.is_empty() {
            self.bind_scalar_args(&kernel.name, &scalars, index, binding)?;
            binding += 1;
            uniform_buffer_count += 1;
        }
        for arg in &kernel.args {
            if let KernelArg::Buffer { name, elem_ty, .. } = arg {
                self.bind_buffer_arg(name, *elem_ty, index, binding)?;
                binding += 1;
                storage_buffer_count += 1;
            }
        }

        self.emit_stmt(&body, &mut interface)?;

        if !self.builder.current_block_terminated() {
            self.builder
                .push_instruction(InstructionBuilder::new(Op::Return).build())?;
        }
        self.builder.end_function()?;

        for dim in self.workgroup_size.iter_mut() {
            if *dim == 0 {
                *dim = 1;
            }
        }
        self.builder.set_local_size(function, self.workgroup_size);
        self.builder
            .add_entry_point(&kernel.name, ExecutionModel::GLCompute, function, interface)?;
        self.descriptor_sets.push(EntryPointHeader {
            name: kernel.name.clone(),
            uniform_buffer_count,
            storage_buffer_count,
        });
        Ok(())
    }

    // ----------------------------------------------------------------
    // Argument binding.
    // ----------------------------------------------------------------

    /// Scalar arguments are packed into one uniform struct with explicit
    /// offsets and loaded once at function entry.
    fn bind_scalar_args(
        &mut self,
        kernel_name: &str,
        scalars: &[(&String, Type)],
        set: u32,
        binding: u32,
    ) -> Result<()> {
        let member_ids: Vec<Id> = scalars
            .iter()
            .map(|(_, ty)| self.builder.declare_type(*ty))
            .collect();
        let struct_name = format!("{}_args", kernel_name);
        let struct_id = self.builder.declare_struct(&struct_name, &member_ids);
        let mut offset = 0u32;
        for (i, (name, ty)) in scalars.iter().enumerate() {
            let size = ty.bytes();
            offset = (offset + size - 1) / size * size;
            self.builder
                .decorate_member(struct_id, i as u32, Decoration::Offset, &[offset]);
            self.builder.set_member_name(struct_id, i as u32, name);
            offset += size;
        }
        self.builder.decorate(struct_id, Decoration::Block, &[]);
        let ptr = self
            .builder
            .declare_pointer_type(struct_id, StorageClass::Uniform);
        let var = self.builder.declare_global(ptr, StorageClass::Uniform);
        self.builder.set_name(var, &struct_name);
        self.builder
            .decorate(var, Decoration::DescriptorSet, &[set]);
        self.builder.decorate(var, Decoration::Binding, &[binding]);

        for (i, (name, ty)) in scalars.iter().enumerate() {
            let member_ptr = self.builder.declare_pointer_to(*ty, StorageClass::Uniform);
            let member_index = self.builder.declare_const_uint(Type::u32(1), i as u64);
            let chain = self.emit_result(
                Op::AccessChain,
                member_ptr,
                &[var, member_index],
                IdKind::AccessChain,
            )?;
            let type_id = self.builder.declare_type(*ty);
            let value = self.emit_result(Op::Load, type_id, &[chain], IdKind::Result)?;
            self.symbols.bind(
                name,
                Symbol {
                    id: value,
                    class: SymbolClass::Value,
                },
            );
        }
        Ok(())
    }

    /// A device buffer is a runtime array wrapped in a BufferBlock struct,
    /// bound as Uniform storage.
    fn bind_buffer_arg(&mut self, name: &str, elem_ty: Type, set: u32, binding: u32) -> Result<()> {
        let array = self.builder.declare_runtime_array_type(elem_ty);
        if !self.strided_arrays.contains(&array) {
            self.builder
                .decorate(array, Decoration::ArrayStride, &[elem_ty.bytes()]);
            self.strided_arrays.push(array);
        }
        let struct_name = format!("{}_buffer", name);
        let struct_id = self.builder.declare_struct(&struct_name, &[array]);
        if !self.decorated_structs.contains(&struct_id) {
            self.builder
                .decorate_member(struct_id, 0, Decoration::Offset, &[0]);
            self.builder
                .decorate(struct_id, Decoration::BufferBlock, &[]);
            self.decorated_structs.push(struct_id);
        }
        let ptr = self
            .builder
            .declare_pointer_type(struct_id, StorageClass::Uniform);
        let var = self.builder.declare_global(ptr, StorageClass::Uniform);
        self.builder.set_name(var, name);
        self.builder
            .decorate(var, Decoration::DescriptorSet, &[set]);
        self.builder.decorate(var, Decoration::Binding, &[binding]);
        self.symbols.bind(
            name,
            Symbol {
                id: var,
                class: SymbolClass::Buffer {
                    storage: StorageClass::Uniform,
                    elem_ty,
                },
            },
        );
        Ok(())
    }

    // ----------------------------------------------------------------
    // Builtins.
    // ----------------------------------------------------------------

    fn builtin_variable(&mut self, builtin: BuiltIn) -> Id {
        if let Some(id) = self.builtin_vars.get(&(builtin as u32)) {
            return *id;
        }
        let ptr = self
            .builder
            .declare_pointer_to(Type::u32(3), StorageClass::Input);
        let var = self.builder.declare_global(ptr, StorageClass::Input);
        self.builder
            .decorate(var, Decoration::BuiltIn, &[builtin as u32]);
        self.builtin_vars.insert(builtin as u32, var);
        var
    }

    fn load_builtin(&mut self, builtin: BuiltIn, var: Id) -> Result<()> {
        let vec_ty = self.builder.declare_type(Type::u32(3));
        let loaded = self.emit_result(Op::Load, vec_ty, &[var], IdKind::Result)?;
        self.builtin_loads.insert(builtin as u32, loaded);
        Ok(())
    }

    /// The loop variable of a GPU `For`: extract the dimension from the
    /// invocation id vector, as signed 32-bit.
    fn gpu_loop_index(&mut self, builtin: BuiltIn, dim: u32) -> Result<Id> {
        let vec = *self
            .builtin_loads
            .get(&(builtin as u32))
            .ok_or_else(|| anyhow!("builtin {:?} was not preloaded", builtin))?;
        let u32_ty = self.builder.declare_type(Type::u32(1));
        let component = {
            let id = self.builder.allocate(IdKind::Result);
            self.builder.push_instruction(
                InstructionBuilder::new(Op::CompositeExtract)
                    .push(u32_ty)
                    .push(id)
                    .push(vec)
                    .push(dim)
                    .build(),
            )?;
            id
        };
        let i32_ty = self.builder.declare_type(Type::i32(1));
        self.emit_result(Op::Bitcast, i32_ty, &[component], IdKind::Result)
    }

    // ----------------------------------------------------------------
    // Statements.
    // ----------------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt, interface: &mut Vec<Id>) -> Result<()> {
        match stmt {
            Stmt::Block { stmts } => {
                for s in stmts {
                    self.emit_stmt(s, interface)?;
                }
                Ok(())
            }
            Stmt::LetStmt { name, value, body } => {
                let id = self.emit_expr(value)?;
                self.symbols.bind(
                    name,
                    Symbol {
                        id,
                        class: SymbolClass::Value,
                    },
                );
                let result = self.emit_stmt(body, interface);
                self.symbols.unbind(name);
                result
            }
            Stmt::Evaluate { value } => match value {
                Expr::Call {
                    op: CallOp::GpuThreadBarrier,
                    args,
                    ..
                } => self.emit_barrier(&args[0]),
                _ => self.emit_expr(value).map(|_| ()),
            },
            Stmt::AssertStmt { condition, .. } => {
                // No assertion path on the device; checked host-side.
                log::debug!("dropping device-side assert on {}", condition);
                Ok(())
            }
            Stmt::Free { .. } => Ok(()),
            Stmt::Store {
                buffer,
                index,
                value,
                predicate,
            } => {
                if predicate.is_some() {
                    bail!("predicated store of {} survived scalarization", buffer);
                }
                self.emit_store(buffer, index, value)
            }
            Stmt::IfThenElse {
                condition,
                then_case,
                else_case,
            } => self.emit_if(condition, then_case, else_case.as_deref(), interface),
            Stmt::For {
                name,
                kind,
                min,
                extent,
                body,
            } => match kind {
                ForKind::Serial => self.emit_serial_for(name, min, extent, body, interface),
                ForKind::GpuThread | ForKind::GpuBlock => {
                    self.emit_gpu_for(name, *kind, min, extent, body, interface)
                }
            },
            Stmt::Allocate {
                name,
                elem_ty,
                extent,
                body,
            } => self.emit_allocate(name, *elem_ty, extent, body, interface),
        }
    }

    fn emit_if(
        &mut self,
        condition: &Expr,
        then_case: &Stmt,
        else_case: Option<&Stmt>,
        interface: &mut Vec<Id>,
    ) -> Result<()> {
        let cond = self.emit_expr(condition)?;
        let then_label = self.builder.reserve(IdKind::Label);
        let merge_label = self.builder.reserve(IdKind::Label);
        let else_label = if else_case.is_some() {
            self.builder.reserve(IdKind::Label)
        } else {
            merge_label
        };
        self.builder.push_instruction(
            InstructionBuilder::new(Op::SelectionMerge)
                .push(merge_label)
                .push(0)
                .build(),
        )?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::BranchConditional)
                .push(cond)
                .push(then_label)
                .push(else_label)
                .build(),
        )?;
        self.builder.append_block(then_label)?;
        self.emit_stmt(then_case, interface)?;
        if !self.builder.current_block_terminated() {
            self.builder.push_instruction(
                InstructionBuilder::new(Op::Branch).push(merge_label).build(),
            )?;
        }
        if let Some(else_case) = else_case {
            self.builder.append_block(else_label)?;
            self.emit_stmt(else_case, interface)?;
            if !self.builder.current_block_terminated() {
                self.builder.push_instruction(
                    InstructionBuilder::new(Op::Branch).push(merge_label).build(),
                )?;
            }
        }
        self.builder.append_block(merge_label)
    }

    /// The five-block structured loop:
    /// entry -> header -> top -> body -> continue -> header, top -> merge.
    fn emit_serial_for(
        &mut self,
        name: &str,
        min: &Expr,
        extent: &Expr,
        body: &Stmt,
        interface: &mut Vec<Id>,
    ) -> Result<()> {
        let ty = min.ty();
        if !ty.is_int_or_uint() || ty.is_vector() {
            bail!("loop bounds of {} must be scalar integers, got {}", name, ty);
        }
        let type_id = self.builder.declare_type(ty);
        let min_id = self.emit_expr(min)?;
        let extent_id = self.emit_expr(extent)?;
        let end = self.emit_result(Op::IAdd, type_id, &[min_id, extent_id], IdKind::Result)?;
        let one = self.const_scalar(ty, 1)?;

        let entry_label = self.builder.current_block_label()?;
        let header = self.builder.reserve(IdKind::Label);
        let top = self.builder.reserve(IdKind::Label);
        let body_label = self.builder.reserve(IdKind::Label);
        let continue_label = self.builder.reserve(IdKind::Label);
        let merge = self.builder.reserve(IdKind::Label);
        let next_index = self.builder.reserve(IdKind::Result);

        self.builder.append_block(header)?;
        let index = self.builder.allocate(IdKind::Result);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::Phi)
                .push(type_id)
                .push(index)
                .push(min_id)
                .push(entry_label)
                .push(next_index)
                .push(continue_label)
                .build(),
        )?;
        // The merge declaration must precede the branch in the same block.
        self.builder.push_instruction(
            InstructionBuilder::new(Op::LoopMerge)
                .push(merge)
                .push(continue_label)
                .push(0)
                .build(),
        )?;
        self.builder.append_block(top)?;
        let cmp_op = if ty.is_uint() {
            Op::ULessThan
        } else {
            Op::SLessThan
        };
        let bool_ty = self.builder.declare_type(Type::bool(1));
        let in_range = self.emit_result(cmp_op, bool_ty, &[index, end], IdKind::Result)?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::BranchConditional)
                .push(in_range)
                .push(body_label)
                .push(merge)
                .build(),
        )?;

        self.builder.append_block(body_label)?;
        self.symbols.bind(
            name,
            Symbol {
                id: index,
                class: SymbolClass::Value,
            },
        );
        let body_result = self.emit_stmt(body, interface);
        self.symbols.unbind(name);
        body_result?;

        self.builder.append_block(continue_label)?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::IAdd)
                .push(type_id)
                .push(next_index)
                .push(index)
                .push(one)
                .build(),
        )?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::Branch).push(header).build(),
        )?;
        self.builder.append_block(merge)
    }

    /// A GPU `For` binds its variable to a component of the matching
    /// invocation-id builtin; thread loops also fix the workgroup size.
    fn emit_gpu_for(
        &mut self,
        name: &str,
        kind: ForKind,
        min: &Expr,
        extent: &Expr,
        body: &Stmt,
        interface: &mut Vec<Id>,
    ) -> Result<()> {
        let dim = gpu_dim_from_name(name, kind)?;
        if kind == ForKind::GpuThread {
            let size = extent
                .const_int()
                .ok_or_else(|| anyhow!("workgroup extent of {} is not a constant", name))?;
            if size <= 0 || size > u32::MAX as i128 {
                bail!("workgroup extent {} of {} is out of range", size, name);
            }
            let size = size as u32;
            let current = self.workgroup_size[dim as usize];
            if current != 0 && current != size {
                bail!(
                    "workgroup dimension {} has conflicting extents {} and {}",
                    dim,
                    current,
                    size
                );
            }
            self.workgroup_size[dim as usize] = size;
        }
        let builtin = match kind {
            ForKind::GpuThread => BuiltIn::LocalInvocationId,
            _ => BuiltIn::WorkgroupId,
        };
        let raw = self.gpu_loop_index(builtin, dim)?;
        let ty = min.ty();
        let index = if min.is_const(0) {
            raw
        } else {
            let min_id = self.emit_expr(min)?;
            let type_id = self.builder.declare_type(ty);
            self.emit_result(Op::IAdd, type_id, &[min_id, raw], IdKind::Result)?
        };
        self.symbols.bind(
            name,
            Symbol {
                id: index,
                class: SymbolClass::Value,
            },
        );
        let result = self.emit_stmt(body, interface);
        self.symbols.unbind(name);
        result
    }

    fn emit_allocate(
        &mut self,
        name: &str,
        elem_ty: Type,
        extent: &Expr,
        body: &Stmt,
        interface: &mut Vec<Id>,
    ) -> Result<()> {
        let size = extent
            .const_int()
            .ok_or_else(|| anyhow!("allocation extent of {} is not a constant", name))?;
        if size <= 0 || size > u32::MAX as i128 {
            bail!("allocation extent {} of {} is out of range", size, name);
        }
        let array = self.builder.declare_array_type(elem_ty, size as u32);
        // Shared allocations live in workgroup storage, everything else in
        // function storage.
        let storage = if name.ends_with("__shared") {
            StorageClass::Workgroup
        } else {
            StorageClass::Function
        };
        let ptr = self.builder.declare_pointer_type(array, storage);
        let var = if storage == StorageClass::Workgroup {
            let var = self.builder.declare_global(ptr, storage);
            interface.push(var);
            var
        } else {
            self.builder.declare_local_variable(ptr)?
        };
        self.builder.set_name(var, name);
        self.symbols.bind(
            name,
            Symbol {
                id: var,
                class: SymbolClass::Array { storage, elem_ty },
            },
        );
        let result = self.emit_stmt(body, interface);
        self.symbols.unbind(name);
        result
    }

    fn emit_barrier(&mut self, mask: &Expr) -> Result<()> {
        let mask = mask
            .const_int()
            .ok_or_else(|| anyhow!("gpu_thread_barrier mask must be a constant"))?;
        use spirv::MemorySemantics;
        let mut semantics = MemorySemantics::ACQUIRE_RELEASE;
        let memory_scope = if mask & BARRIER_DEVICE != 0 {
            semantics |= MemorySemantics::UNIFORM_MEMORY;
            spirv::Scope::Device
        } else {
            spirv::Scope::Workgroup
        };
        if mask & BARRIER_SHARED != 0 {
            semantics |= MemorySemantics::WORKGROUP_MEMORY;
        }
        let exec = self
            .builder
            .declare_const_uint(Type::u32(1), spirv::Scope::Workgroup as u64);
        let memory = self
            .builder
            .declare_const_uint(Type::u32(1), memory_scope as u64);
        let semantics = self
            .builder
            .declare_const_uint(Type::u32(1), semantics.bits() as u64);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::ControlBarrier)
                .push(exec)
                .push(memory)
                .push(semantics)
                .build(),
        )
    }

    // ----------------------------------------------------------------
    // Loads and stores.
    // ----------------------------------------------------------------

    /// Pointer to one element of a bound buffer or array. Uniform buffers
    /// are struct-wrapped, so their chains lead with a zero member index.
    fn element_pointer(&mut self, symbol: &Symbol, access_ty: Type, index: Id) -> Result<Id> {
        let (storage, chain): (StorageClass, Vec<Id>) = match symbol.class {
            SymbolClass::Buffer { storage, .. } => {
                let zero = self.builder.declare_const_uint(Type::u32(1), 0);
                (storage, vec![symbol.id, zero, index])
            }
            SymbolClass::Array { storage, .. } => (storage, vec![symbol.id, index]),
            SymbolClass::Value => bail!("cannot index a plain value"),
        };
        let ptr_ty = self.builder.declare_pointer_to(access_ty, storage);
        self.emit_result(Op::AccessChain, ptr_ty, &chain, IdKind::AccessChain)
    }

    fn elem_ty_of(symbol: &Symbol, name: &str) -> Result<Type> {
        match symbol.class {
            SymbolClass::Buffer { elem_ty, .. } | SymbolClass::Array { elem_ty, .. } => Ok(elem_ty),
            SymbolClass::Value => bail!("{} is not a buffer", name),
        }
    }

    fn emit_load(&mut self, ty: Type, buffer: &str, index: &Expr) -> Result<Id> {
        let symbol = self.symbols.lookup(buffer)?;
        let elem_ty = Self::elem_ty_of(&symbol, buffer)?;
        if ty.is_scalar() {
            if elem_ty.is_vector() {
                bail!("scalar load from vector-element buffer {}", buffer);
            }
            let index_id = self.emit_expr(index)?;
            let ptr = self.element_pointer(&symbol, elem_ty, index_id)?;
            let type_id = self.builder.declare_type(ty);
            return self.emit_result(Op::Load, type_id, &[ptr], IdKind::Result);
        }
        // A dense ramp over a vector-element buffer is a single wide load.
        if let Some(base) = dense_ramp_base(index, elem_ty, ty) {
            let base_id = self.vector_base_index(&base, elem_ty)?;
            let ptr = self.element_pointer(&symbol, elem_ty, base_id)?;
            let type_id = self.builder.declare_type(ty);
            return self.emit_result(Op::Load, type_id, &[ptr], IdKind::Result);
        }
        // Gather lane by lane through scalar chains.
        if elem_ty.is_vector() {
            bail!("gather from vector-element buffer {} is not supported", buffer);
        }
        let index_id = self.emit_expr(index)?;
        let scalar_ty = ty.element_of();
        let scalar_type_id = self.builder.declare_type(scalar_ty);
        let index_scalar_ty = self.builder.declare_type(index.ty().element_of());
        let mut lanes = Vec::with_capacity(ty.lanes() as usize);
        for lane in 0..ty.lanes() as u32 {
            let lane_index = {
                let id = self.builder.allocate(IdKind::Result);
                self.builder.push_instruction(
                    InstructionBuilder::new(Op::CompositeExtract)
                        .push(index_scalar_ty)
                        .push(id)
                        .push(index_id)
                        .push(lane)
                        .build(),
                )?;
                id
            };
            let ptr = self.element_pointer(&symbol, elem_ty.element_of(), lane_index)?;
            lanes.push(self.emit_result(Op::Load, scalar_type_id, &[ptr], IdKind::Result)?);
        }
        let type_id = self.builder.declare_type(ty);
        self.emit_result(Op::CompositeConstruct, type_id, &lanes, IdKind::Result)
    }

    fn emit_store(&mut self, buffer: &str, index: &Expr, value: &Expr) -> Result<()> {
        let symbol = self.symbols.lookup(buffer)?;
        let elem_ty = Self::elem_ty_of(&symbol, buffer)?;
        let ty = value.ty();
        if ty.is_scalar() {
            if elem_ty.is_vector() {
                bail!("scalar store to vector-element buffer {}", buffer);
            }
            let index_id = self.emit_expr(index)?;
            let value_id = self.emit_expr(value)?;
            let ptr = self.element_pointer(&symbol, elem_ty, index_id)?;
            return self.builder.push_instruction(
                InstructionBuilder::new(Op::Store).push(ptr).push(value_id).build(),
            );
        }
        if let Some(base) = dense_ramp_base(index, elem_ty, ty) {
            let value_id = self.emit_expr(value)?;
            let base_id = self.vector_base_index(&base, elem_ty)?;
            let ptr = self.element_pointer(&symbol, elem_ty, base_id)?;
            return self.builder.push_instruction(
                InstructionBuilder::new(Op::Store).push(ptr).push(value_id).build(),
            );
        }
        // Scatter lane by lane.
        if elem_ty.is_vector() {
            bail!("scatter to vector-element buffer {} is not supported", buffer);
        }
        let index_id = self.emit_expr(index)?;
        let value_id = self.emit_expr(value)?;
        let index_scalar_ty = self.builder.declare_type(index.ty().element_of());
        let value_scalar_ty = self.builder.declare_type(ty.element_of());
        for lane in 0..ty.lanes() as u32 {
            let lane_index = {
                let id = self.builder.allocate(IdKind::Result);
                self.builder.push_instruction(
                    InstructionBuilder::new(Op::CompositeExtract)
                        .push(index_scalar_ty)
                        .push(id)
                        .push(index_id)
                        .push(lane)
                        .build(),
                )?;
                id
            };
            let lane_value = {
                let id = self.builder.allocate(IdKind::Result);
                self.builder.push_instruction(
                    InstructionBuilder::new(Op::CompositeExtract)
                        .push(value_scalar_ty)
                        .push(id)
                        .push(value_id)
                        .push(lane)
                        .build(),
                )?;
                id
            };
            let ptr = self.element_pointer(&symbol, elem_ty.element_of(), lane_index)?;
            self.builder.push_instruction(
                InstructionBuilder::new(Op::Store).push(ptr).push(lane_value).build(),
            )?;
        }
        Ok(())
    }

    /// `base + offset/lanes`: the element index of a dense vector access.
    fn vector_base_index(&mut self, base: &Expr, elem_ty: Type) -> Result<Id> {
        let base_id = self.emit_expr(base)?;
        let lanes = elem_ty.lanes();
        if lanes == 1 {
            return Ok(base_id);
        }
        let ty = base.ty();
        let type_id = self.builder.declare_type(ty);
        let lanes_id = self.const_scalar(ty, lanes as i128)?;
        let op = if ty.is_uint() { Op::UDiv } else { Op::SDiv };
        self.emit_result(op, type_id, &[base_id, lanes_id], IdKind::Result)
    }

    // ----------------------------------------------------------------
    // Expressions.
    // ----------------------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) -> Result<Id> {
        match expr {
            Expr::IntImm { ty, value } => self.const_scalar(*ty, *value as i128),
            Expr::UIntImm { ty, value } => {
                if ty.is_bool() {
                    Ok(self.builder.declare_const_bool(*value != 0))
                } else {
                    self.const_scalar(*ty, *value as i128)
                }
            }
            Expr::FloatImm { ty, value } => Ok(self.builder.declare_const_float(*ty, value.0)),
            Expr::StringImm { value } => Ok(self.builder.declare_string(value)),
            Expr::Var { name, .. } => {
                let symbol = self.symbols.lookup(name)?;
                match symbol.class {
                    SymbolClass::Value => Ok(symbol.id),
                    _ => bail!("{} names a buffer, not a value", name),
                }
            }
            Expr::Cast { ty, value } => self.emit_cast(*ty, value),
            Expr::Reinterpret { ty, value } => {
                let value_id = self.emit_expr(value)?;
                let type_id = self.builder.declare_type(*ty);
                self.emit_result(Op::Bitcast, type_id, &[value_id], IdKind::Result)
            }
            Expr::Binary { ty, op, a, b } => self.emit_binary(*ty, *op, a, b),
            Expr::Cmp { op, a, b, .. } => self.emit_compare(*op, a, b),
            Expr::Not { ty, value } => {
                let value_id = self.emit_expr(value)?;
                let type_id = self.builder.declare_type(*ty);
                self.emit_result(Op::LogicalNot, type_id, &[value_id], IdKind::Result)
            }
            Expr::Select {
                ty,
                condition,
                true_value,
                false_value,
            } => {
                let cond = self.emit_expr(condition)?;
                let t = self.emit_expr(true_value)?;
                let f = self.emit_expr(false_value)?;
                let type_id = self.builder.declare_type(*ty);
                self.emit_result(Op::Select, type_id, &[cond, t, f], IdKind::Result)
            }
            Expr::Load {
                ty,
                buffer,
                index,
                predicate,
            } => {
                if predicate.is_some() {
                    bail!("predicated load of {} survived scalarization", buffer);
                }
                self.emit_load(*ty, buffer, index)
            }
            Expr::Ramp {
                ty,
                base,
                stride,
                lanes,
            } => {
                let base_id = self.emit_expr(base)?;
                let stride_id = self.emit_expr(stride)?;
                let elem = ty.element_of();
                let elem_id = self.builder.declare_type(elem);
                let mut lane_ids = vec![base_id];
                let mut current = base_id;
                for _ in 1..*lanes {
                    current =
                        self.emit_result(Op::IAdd, elem_id, &[current, stride_id], IdKind::Result)?;
                    lane_ids.push(current);
                }
                let type_id = self.builder.declare_type(*ty);
                self.emit_result(Op::CompositeConstruct, type_id, &lane_ids, IdKind::Result)
            }
            Expr::Broadcast { ty, value, lanes } => {
                if let Some(constant) = self.try_const_composite(ty, value)? {
                    return Ok(constant);
                }
                let value_id = self.emit_expr(value)?;
                let type_id = self.builder.declare_type(*ty);
                let lane_ids = vec![value_id; *lanes as usize];
                self.emit_result(Op::CompositeConstruct, type_id, &lane_ids, IdKind::Result)
            }
            Expr::Shuffle {
                ty,
                vectors,
                indices,
            } => self.emit_shuffle(*ty, vectors, indices),
            Expr::Call { ty, op, args } => self.emit_call(*ty, op, args),
            Expr::Let {
                name, value, body, ..
            } => {
                let value_id = self.emit_expr(value)?;
                self.symbols.bind(
                    name,
                    Symbol {
                        id: value_id,
                        class: SymbolClass::Value,
                    },
                );
                let result = self.emit_expr(body);
                self.symbols.unbind(name);
                result
            }
        }
    }

    fn try_const_composite(&mut self, ty: &Type, value: &Expr) -> Result<Option<Id>> {
        let lane = match value {
            Expr::IntImm { ty, value } => self.builder.declare_const_int(*ty, *value),
            Expr::UIntImm { ty, value } => {
                if ty.is_bool() {
                    self.builder.declare_const_bool(*value != 0)
                } else {
                    self.builder.declare_const_uint(*ty, *value)
                }
            }
            Expr::FloatImm { ty, value } => self.builder.declare_const_float(*ty, value.0),
            _ => return Ok(None),
        };
        let lanes = vec![lane; ty.lanes() as usize];
        Ok(Some(self.builder.declare_composite_constant(*ty, &lanes)))
    }

    fn const_scalar(&mut self, ty: Type, value: i128) -> Result<Id> {
        match ty.code() {
            TypeCode::Int => Ok(self.builder.declare_const_int(ty, value as i64)),
            TypeCode::UInt => Ok(self.builder.declare_const_uint(ty, value as u64)),
            TypeCode::Bool => Ok(self.builder.declare_const_bool(value != 0)),
            _ => bail!("no scalar constant of type {}", ty),
        }
    }

    fn emit_cast(&mut self, to: Type, value: &Expr) -> Result<Id> {
        let from = value.ty();
        let value_id = self.emit_expr(value)?;
        let type_id = self.builder.declare_type(to);
        let op = match (from.code(), to.code()) {
            (TypeCode::Float, TypeCode::Float) => Op::FConvert,
            (TypeCode::Float, TypeCode::UInt) => Op::ConvertFToU,
            (TypeCode::Float, TypeCode::Int) => Op::ConvertFToS,
            (TypeCode::UInt, TypeCode::Float) => Op::ConvertUToF,
            (TypeCode::Int, TypeCode::Float) => Op::ConvertSToF,
            (TypeCode::Bool, _) => {
                // Booleans widen through a select of constants.
                let one = self.const_scalar_splat(to, 1)?;
                let zero = self.const_scalar_splat(to, 0)?;
                return self.emit_result(
                    Op::Select,
                    type_id,
                    &[value_id, one, zero],
                    IdKind::Result,
                );
            }
            (_, TypeCode::Bool) => {
                let zero = self.const_scalar_splat(from, 0)?;
                return self.emit_result(
                    Op::INotEqual,
                    type_id,
                    &[value_id, zero],
                    IdKind::Result,
                );
            }
            (from_code, _) if from.bits() == to.bits() => {
                debug_assert_ne!(from_code, to.code());
                Op::Bitcast
            }
            // Width-changing integer conversions extend by the source code.
            (TypeCode::UInt, _) => Op::UConvert,
            (TypeCode::Int, _) => Op::SConvert,
            _ => bail!("cannot cast {} to {}", from, to),
        };
        self.emit_result(op, type_id, &[value_id], IdKind::Result)
    }

    fn const_scalar_splat(&mut self, ty: Type, value: i128) -> Result<Id> {
        if ty.is_vector() {
            let lane = self.const_scalar(ty.element_of(), value)?;
            let lanes = vec![lane; ty.lanes() as usize];
            Ok(self.builder.declare_composite_constant(ty, &lanes))
        } else {
            self.const_scalar(ty, value)
        }
    }

    fn emit_binary(&mut self, ty: Type, op: BinOp, a: &Expr, b: &Expr) -> Result<Id> {
        // Integer division and modulo go through the shared euclidean
        // lowering; float ones map directly.
        if ty.is_int_or_uint() {
            match op {
                BinOp::Div => return self.emit_expr(&lower::lower_int_div(a, b)),
                BinOp::Mod => return self.emit_expr(&lower::lower_int_mod(a, b)),
                _ => {}
            }
        }
        let type_id = self.builder.declare_type(ty);
        let a_id = self.emit_expr(a)?;
        let b_id = self.emit_expr(b)?;
        let float = ty.is_float();
        let opcode = match op {
            BinOp::Add => {
                if float {
                    Op::FAdd
                } else {
                    Op::IAdd
                }
            }
            BinOp::Sub => {
                if float {
                    Op::FSub
                } else {
                    Op::ISub
                }
            }
            BinOp::Mul => {
                if float {
                    Op::FMul
                } else {
                    Op::IMul
                }
            }
            BinOp::Div => Op::FDiv,
            BinOp::Mod => Op::FMod,
            BinOp::And => Op::LogicalAnd,
            BinOp::Or => Op::LogicalOr,
            BinOp::Min | BinOp::Max => {
                // One evaluation per operand, then a select between the ids.
                let cmp = if float {
                    Op::FOrdLessThan
                } else if ty.is_uint() {
                    Op::ULessThan
                } else {
                    Op::SLessThan
                };
                let bool_ty = self.builder.declare_type(Type::bool(ty.lanes()));
                let less = self.emit_result(cmp, bool_ty, &[a_id, b_id], IdKind::Result)?;
                let (t, f) = if op == BinOp::Min {
                    (a_id, b_id)
                } else {
                    (b_id, a_id)
                };
                return self.emit_result(Op::Select, type_id, &[less, t, f], IdKind::Result);
            }
        };
        self.emit_result(opcode, type_id, &[a_id, b_id], IdKind::Result)
    }

    fn emit_compare(&mut self, op: CmpOp, a: &Expr, b: &Expr) -> Result<Id> {
        let ty = a.ty();
        let a_id = self.emit_expr(a)?;
        let b_id = self.emit_expr(b)?;
        let bool_ty = self.builder.declare_type(Type::bool(ty.lanes()));
        let opcode = match (ty.code(), op) {
            (TypeCode::Float, CmpOp::Eq) => Op::FOrdEqual,
            (TypeCode::Float, CmpOp::Ne) => Op::FOrdNotEqual,
            (TypeCode::Float, CmpOp::Lt) => Op::FOrdLessThan,
            (TypeCode::Float, CmpOp::Le) => Op::FOrdLessThanEqual,
            (TypeCode::Float, CmpOp::Gt) => Op::FOrdGreaterThan,
            (TypeCode::Float, CmpOp::Ge) => Op::FOrdGreaterThanEqual,
            (TypeCode::Bool, CmpOp::Eq) => Op::LogicalEqual,
            (TypeCode::Bool, CmpOp::Ne) => Op::LogicalNotEqual,
            (_, CmpOp::Eq) => Op::IEqual,
            (_, CmpOp::Ne) => Op::INotEqual,
            (TypeCode::UInt, CmpOp::Lt) => Op::ULessThan,
            (TypeCode::UInt, CmpOp::Le) => Op::ULessThanEqual,
            (TypeCode::UInt, CmpOp::Gt) => Op::UGreaterThan,
            (TypeCode::UInt, CmpOp::Ge) => Op::UGreaterThanEqual,
            (_, CmpOp::Lt) => Op::SLessThan,
            (_, CmpOp::Le) => Op::SLessThanEqual,
            (_, CmpOp::Gt) => Op::SGreaterThan,
            (_, CmpOp::Ge) => Op::SGreaterThanEqual,
        };
        self.emit_result(opcode, bool_ty, &[a_id, b_id], IdKind::Result)
    }

    fn emit_shuffle(&mut self, ty: Type, vectors: &[Expr], indices: &[u32]) -> Result<Id> {
        let type_id = self.builder.declare_type(ty);
        // Lane extraction: one source vector, one index, scalar result.
        if ty.is_scalar() && vectors.len() == 1 && indices.len() == 1 {
            let vec = self.emit_expr(&vectors[0])?;
            let id = self.builder.allocate(IdKind::Result);
            self.builder.push_instruction(
                InstructionBuilder::new(Op::CompositeExtract)
                    .push(type_id)
                    .push(id)
                    .push(vec)
                    .push(indices[0])
                    .build(),
            )?;
            return Ok(id);
        }
        // Concatenation of scalars, as the scalarization pre-pass builds.
        if vectors.iter().all(|v| v.ty().is_scalar()) {
            let identity = indices.iter().enumerate().all(|(i, x)| i as u32 == *x);
            if !identity || indices.len() != vectors.len() {
                bail!("unsupported scalar shuffle");
            }
            let lane_ids = vectors
                .iter()
                .map(|v| self.emit_expr(v))
                .collect::<Result<Vec<_>>>()?;
            return self.emit_result(Op::CompositeConstruct, type_id, &lane_ids, IdKind::Result);
        }
        if vectors.len() > 2 {
            bail!("shuffle of more than two vectors");
        }
        let first = self.emit_expr(&vectors[0])?;
        let second = if vectors.len() == 2 {
            self.emit_expr(&vectors[1])?
        } else {
            first
        };
        let id = self.builder.allocate(IdKind::Result);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::VectorShuffle)
                .push(type_id)
                .push(id)
                .push(first)
                .push(second)
                .push_list(indices)
                .build(),
        )?;
        Ok(id)
    }

    fn emit_call(&mut self, ty: Type, op: &CallOp, args: &[Expr]) -> Result<Id> {
        match op {
            CallOp::ShiftLeft => self.emit_shift(ty, Op::ShiftLeftLogical, args),
            CallOp::ShiftRight => {
                let opcode = if ty.is_int() {
                    Op::ShiftRightArithmetic
                } else {
                    Op::ShiftRightLogical
                };
                self.emit_shift(ty, opcode, args)
            }
            CallOp::DivRoundToZero => {
                let opcode = if ty.is_uint() { Op::UDiv } else { Op::SDiv };
                self.emit_simple(ty, opcode, args)
            }
            CallOp::ModRoundToZero => {
                let opcode = if ty.is_uint() { Op::UMod } else { Op::SRem };
                self.emit_simple(ty, opcode, args)
            }
            CallOp::IsNan => self.emit_simple(Type::bool(ty.lanes()), Op::IsNan, &args[..1]),
            CallOp::IsInf => self.emit_simple(Type::bool(ty.lanes()), Op::IsInf, &args[..1]),
            CallOp::IfThenElse => self.emit_if_then_else_value(ty, args),
            CallOp::GpuThreadBarrier => {
                bail!("gpu_thread_barrier is a statement, not a value")
            }
            CallOp::Abs => self.emit_abs(ty, &args[0]),
            CallOp::Extern(name) => self.emit_extern(ty, name, args),
            _ => {
                // Arithmetic intrinsics go through the reference lowering.
                match lower::lower_intrinsic_semantically(op, args, ty) {
                    Some(lowered) => self.emit_expr(&lowered),
                    None => bail!("unsupported call {} at {}", op, ty),
                }
            }
        }
    }

    fn emit_simple(&mut self, result_ty: Type, opcode: Op, args: &[Expr]) -> Result<Id> {
        let type_id = self.builder.declare_type(result_ty);
        let ids = args
            .iter()
            .map(|a| self.emit_expr(a))
            .collect::<Result<Vec<_>>>()?;
        self.emit_result(opcode, type_id, &ids, IdKind::Result)
    }

    fn emit_shift(&mut self, ty: Type, opcode: Op, args: &[Expr]) -> Result<Id> {
        let type_id = self.builder.declare_type(ty);
        let base = self.emit_expr(&args[0])?;
        let amount = self.emit_expr(&args[1])?;
        self.emit_result(opcode, type_id, &[base, amount], IdKind::Result)
    }

    /// `abs` returns the unsigned type; signed inputs take GLSL SAbs and a
    /// bit cast, floats FAbs.
    fn emit_abs(&mut self, ty: Type, arg: &Expr) -> Result<Id> {
        let from = arg.ty();
        let arg_id = self.emit_expr(arg)?;
        if from.is_uint() {
            return Ok(arg_id);
        }
        let ext = self.builder.import_instruction_set("GLSL.std.450");
        let glop = if from.is_float() { GLOp::FAbs } else { GLOp::SAbs };
        let same_ty = self.builder.declare_type(from);
        let id = self.builder.allocate(IdKind::Result);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::ExtInst)
                .push(same_ty)
                .push(id)
                .push(ext)
                .push(glop as u32)
                .push(arg_id)
                .build(),
        )?;
        if from == ty {
            return Ok(id);
        }
        let type_id = self.builder.declare_type(ty);
        self.emit_result(Op::Bitcast, type_id, &[id], IdKind::Result)
    }

    fn emit_extern(&mut self, ty: Type, name: &str, args: &[Expr]) -> Result<Id> {
        let glop = glsl_ext_op(name)
            .ok_or_else(|| anyhow!("unknown extern function {:?}", name))?;
        let ext = self.builder.import_instruction_set("GLSL.std.450");
        let type_id = self.builder.declare_type(ty);
        let ids = args
            .iter()
            .map(|a| self.emit_expr(a))
            .collect::<Result<Vec<_>>>()?;
        let id = self.builder.allocate(IdKind::Result);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::ExtInst)
                .push(type_id)
                .push(id)
                .push(ext)
                .push(glop as u32)
                .push_list(&ids)
                .build(),
        )?;
        Ok(id)
    }

    /// The expression form of a conditional: a four-block graph with a
    /// two-input phi at the merge.
    fn emit_if_then_else_value(&mut self, ty: Type, args: &[Expr]) -> Result<Id> {
        let cond = self.emit_expr(&args[0])?;
        let then_label = self.builder.reserve(IdKind::Label);
        let else_label = self.builder.reserve(IdKind::Label);
        let merge_label = self.builder.reserve(IdKind::Label);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::SelectionMerge)
                .push(merge_label)
                .push(0)
                .build(),
        )?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::BranchConditional)
                .push(cond)
                .push(then_label)
                .push(else_label)
                .build(),
        )?;
        self.builder.append_block(then_label)?;
        let true_value = self.emit_expr(&args[1])?;
        let true_exit = self.builder.current_block_label()?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::Branch).push(merge_label).build(),
        )?;
        self.builder.append_block(else_label)?;
        let false_value = self.emit_expr(&args[2])?;
        let false_exit = self.builder.current_block_label()?;
        self.builder.push_instruction(
            InstructionBuilder::new(Op::Branch).push(merge_label).build(),
        )?;
        self.builder.append_block(merge_label)?;
        let type_id = self.builder.declare_type(ty);
        let id = self.builder.allocate(IdKind::Result);
        self.builder.push_instruction(
            InstructionBuilder::new(Op::Phi)
                .push(type_id)
                .push(id)
                .push(true_value)
                .push(true_exit)
                .push(false_value)
                .push(false_exit)
                .build(),
        )?;
        Ok(id)
    }

    fn emit_result(
        &mut self,
        opcode: Op,
        type_id: Id,
        operands: &[Id],
        kind: IdKind,
    ) -> Result<Id> {
        let id = self.builder.allocate(kind);
        self.builder.push_instruction(
            InstructionBuilder::new(opcode)
                .push(type_id)
                .push(id)
                .push_list(operands)
                .build(),
        )?;
        Ok(id)
    }
}

/// Map the GPU loop-variable suffix to its dimension. Unknown suffixes are
/// a compile error, never a silently wrong builtin.
fn gpu_dim_from_name(name: &str, kind: ForKind) -> Result<u32> {
    let suffixes: [(&str, u32); 3] = match kind {
        ForKind::GpuThread => [
            ("__thread_id_x", 0),
            ("__thread_id_y", 1),
            ("__thread_id_z", 2),
        ],
        _ => [
            ("__block_id_x", 0),
            ("__block_id_y", 1),
            ("__block_id_z", 2),
        ],
    };
    for (suffix, dim) in &suffixes {
        if name.ends_with(suffix) {
            return Ok(*dim);
        }
    }
    bail!("gpu loop variable {:?} has no recognised dimension suffix", name)
}

fn scan_gpu_builtins(stmt: &Stmt) -> (bool, bool) {
    let mut thread = false;
    let mut block = false;
    scan_gpu_builtins_inner(stmt, &mut thread, &mut block);
    (thread, block)
}

fn scan_gpu_builtins_inner(stmt: &Stmt, thread: &mut bool, block: &mut bool) {
    match stmt {
        Stmt::For { kind, body, .. } => {
            match kind {
                ForKind::GpuThread => *thread = true,
                ForKind::GpuBlock => *block = true,
                ForKind::Serial => {}
            }
            scan_gpu_builtins_inner(body, thread, block);
        }
        Stmt::LetStmt { body, .. } | Stmt::Allocate { body, .. } => {
            scan_gpu_builtins_inner(body, thread, block);
        }
        Stmt::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            scan_gpu_builtins_inner(then_case, thread, block);
            if let Some(else_case) = else_case {
                scan_gpu_builtins_inner(else_case, thread, block);
            }
        }
        Stmt::Block { stmts } => {
            for s in stmts {
                scan_gpu_builtins_inner(s, thread, block);
            }
        }
        Stmt::AssertStmt { .. } | Stmt::Store { .. } | Stmt::Evaluate { .. } | Stmt::Free { .. } => {
        }
    }
}

/// `index` as a dense (stride-1) ramp whose span matches a vector element
/// type: the base expression of a single wide access.
fn dense_ramp_base(index: &Expr, elem_ty: Type, access_ty: Type) -> Option<Expr> {
    if !elem_ty.is_vector() || elem_ty != access_ty {
        return None;
    }
    match index {
        Expr::Ramp {
            base,
            stride,
            lanes,
            ..
        } if stride.is_const(1) && *lanes == access_ty.lanes() => Some((**base).clone()),
        _ => None,
    }
}

// ----------------------------------------------------------------
// Predicated access scalarization pre-pass.
// ----------------------------------------------------------------

/// The target has no predicated memory ops; split any predicated vector
/// access into per-lane conditional scalar accesses before emission.
pub fn scalarize_predicates(stmt: &Stmt) -> Stmt {
    let stmt = stmt.map(
        &mut |e| scalarize_predicated_loads(e),
        &mut |s| scalarize_predicates(s),
    );
    match &stmt {
        Stmt::Store {
            buffer,
            index,
            value,
            predicate: Some(predicate),
        } => scalarize_store(buffer, index, value, predicate),
        _ => stmt,
    }
}

fn lane_of(vector: &Expr, lane: u16) -> Expr {
    if vector.ty().is_scalar() {
        return vector.clone();
    }
    Expr::Shuffle {
        ty: vector.ty().element_of(),
        vectors: vec![vector.clone()],
        indices: vec![lane as u32],
    }
}

fn scalarize_store(buffer: &str, index: &Expr, value: &Expr, predicate: &Expr) -> Stmt {
    let lanes = value.ty().lanes();
    if lanes == 1 {
        return Stmt::IfThenElse {
            condition: predicate.clone(),
            then_case: Box::new(Stmt::Store {
                buffer: buffer.to_owned(),
                index: index.clone(),
                value: value.clone(),
                predicate: None,
            }),
            else_case: None,
        };
    }
    let value_name = format!("{}_store_value", buffer);
    let index_name = format!("{}_store_index", buffer);
    let predicate_name = format!("{}_store_mask", buffer);
    let value_var = expr::var(value.ty(), value_name.clone());
    let index_var = expr::var(index.ty(), index_name.clone());
    let predicate_var = expr::var(predicate.ty(), predicate_name.clone());
    let mut stores = Vec::with_capacity(lanes as usize);
    for lane in 0..lanes {
        stores.push(Stmt::IfThenElse {
            condition: lane_of(&predicate_var, lane),
            then_case: Box::new(Stmt::Store {
                buffer: buffer.to_owned(),
                index: lane_of(&index_var, lane),
                value: lane_of(&value_var, lane),
                predicate: None,
            }),
            else_case: None,
        });
    }
    Stmt::LetStmt {
        name: value_name,
        value: value.clone(),
        body: Box::new(Stmt::LetStmt {
            name: index_name,
            value: index.clone(),
            body: Box::new(Stmt::LetStmt {
                name: predicate_name,
                value: predicate.clone(),
                body: Box::new(Stmt::Block { stmts: stores }),
            }),
        }),
    }
}

fn scalarize_predicated_loads(expr: &Expr) -> Expr {
    let expr = expr.map_children(&mut |child| scalarize_predicated_loads(child));
    let (ty, buffer, index, predicate) = match &expr {
        Expr::Load {
            ty,
            buffer,
            index,
            predicate: Some(predicate),
        } => (*ty, buffer.clone(), (**index).clone(), (**predicate).clone()),
        _ => return expr,
    };
    let zero = zero_of(ty.element_of());
    if ty.is_scalar() {
        return expr::if_then_else(
            predicate,
            expr::load(ty, buffer, index),
            zero,
        );
    }
    let lanes = ty.lanes();
    let mut lane_values = Vec::with_capacity(lanes as usize);
    for lane in 0..lanes {
        lane_values.push(expr::if_then_else(
            lane_of(&predicate, lane),
            expr::load(ty.element_of(), buffer.clone(), lane_of(&index, lane)),
            zero.clone(),
        ));
    }
    Expr::Shuffle {
        ty,
        vectors: lane_values,
        indices: (0..lanes as u32).collect(),
    }
}

fn zero_of(ty: Type) -> Expr {
    match ty.code() {
        TypeCode::Float => expr::float_imm(ty, 0.0),
        _ => expr::const_of(ty, 0),
    }
}

/// Extern math names resolved against the GLSL.std.450 instruction set.
fn glsl_ext_op(name: &str) -> Option<GLOp> {
    let op = match name {
        "sin_f32" => GLOp::Sin,
        "cos_f32" => GLOp::Cos,
        "tan_f32" => GLOp::Tan,
        "asin_f32" => GLOp::Asin,
        "acos_f32" => GLOp::Acos,
        "atan_f32" => GLOp::Atan,
        "atan2_f32" => GLOp::Atan2,
        "sinh_f32" => GLOp::Sinh,
        "cosh_f32" => GLOp::Cosh,
        "tanh_f32" => GLOp::Tanh,
        "exp_f32" => GLOp::Exp,
        "log_f32" => GLOp::Log,
        "pow_f32" => GLOp::Pow,
        "sqrt_f32" => GLOp::Sqrt,
        "fast_inverse_sqrt_f32" => GLOp::InverseSqrt,
        "floor_f32" => GLOp::Floor,
        "ceil_f32" => GLOp::Ceil,
        "trunc_f32" => GLOp::Trunc,
        "round_f32" => GLOp::RoundEven,
        _ => return None,
    };
    Some(op)
}
