//! Deduplicating SPIR-V module builder.
//!
//! A data-only service: it never looks at kernel IR, it only assembles
//! module state. Ids come from a single monotone counter and every id's
//! kind is fixed at allocation. Types, pointer types, function types,
//! structs and constants are interned, so declaring the same entity twice
//! yields the same id.
use fnv::FnvHashMap as HashMap;

use kirv_core::binary::{Instruction, InstructionBuilder, SpirvBinary, SpirvHeader};
use kirv_ir::{Type, TypeCode};
use spirv::{
    AddressingModel, Capability, Decoration, ExecutionMode, ExecutionModel, MemoryModel, Op,
    StorageClass,
};

use crate::error::{anyhow, bail, Result};

pub type Id = u32;

/// What an id was allocated for. Fixed for the id's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IdKind {
    Module,
    Type,
    Constant,
    Variable,
    Function,
    Block,
    Label,
    Result,
    AccessChain,
    Import,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum ArraySize {
    NotArray,
    Fixed(u32),
    Runtime,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct TypeKey {
    code: TypeCode,
    bits: u8,
    lanes: u16,
    bytes: u32,
    array_size: ArraySize,
}

impl TypeKey {
    fn of(ty: Type) -> TypeKey {
        TypeKey {
            code: ty.code(),
            bits: ty.bits(),
            lanes: ty.lanes(),
            bytes: ty.bytes(),
            array_size: ArraySize::NotArray,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct StructKey {
    name: String,
    members: Vec<Id>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct FunctionTypeKey {
    return_type: Id,
    parameters: Vec<Id>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct ConstantKey {
    type_key: TypeKey,
    composite: bool,
    raw: Vec<u8>,
}

struct EntryPointDecl {
    name: String,
    exec_model: ExecutionModel,
    function: Id,
    interface: Vec<Id>,
}

struct BlockBuild {
    label: Id,
    variables: Vec<Instruction>,
    body: Vec<Instruction>,
}

impl BlockBuild {
    fn is_terminated(&self) -> bool {
        self.body
            .last()
            .map_or(false, |instr| is_terminator(instr.opcode()))
    }
}

struct FunctionBuild {
    id: Id,
    return_type: Id,
    function_type: Id,
    control_mask: u32,
    parameters: Vec<Instruction>,
    blocks: Vec<BlockBuild>,
}

/// A block's last instruction must be one of these, exactly once.
fn is_terminator(opcode: u32) -> bool {
    opcode == Op::Branch as u32
        || opcode == Op::BranchConditional as u32
        || opcode == Op::Switch as u32
        || opcode == Op::Kill as u32
        || opcode == Op::Return as u32
        || opcode == Op::ReturnValue as u32
        || opcode == Op::Unreachable as u32
}

pub struct SpvBuilder {
    next_id: Id,
    module_id: Id,
    kinds: HashMap<Id, IdKind>,
    capabilities: Vec<Capability>,
    extensions: Vec<String>,
    ext_imports: Vec<(String, Id)>,
    entry_points: Vec<EntryPointDecl>,
    execution_modes: Vec<Instruction>,
    debug_strings: Vec<Instruction>,
    debug_names: Vec<Instruction>,
    annotations: Vec<Instruction>,
    declarations: Vec<Instruction>,
    globals: Vec<Instruction>,
    functions: Vec<FunctionBuild>,
    current_function: Option<usize>,
    type_map: HashMap<TypeKey, Id>,
    struct_map: HashMap<StructKey, Id>,
    pointer_type_map: HashMap<(Id, StorageClass), Id>,
    function_type_map: HashMap<FunctionTypeKey, Id>,
    constant_map: HashMap<ConstantKey, Id>,
}

impl Default for SpvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpvBuilder {
    pub fn new() -> SpvBuilder {
        let mut builder = SpvBuilder {
            next_id: 1,
            module_id: 0,
            kinds: HashMap::default(),
            capabilities: Vec::new(),
            extensions: Vec::new(),
            ext_imports: Vec::new(),
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug_strings: Vec::new(),
            debug_names: Vec::new(),
            annotations: Vec::new(),
            declarations: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            current_function: None,
            type_map: HashMap::default(),
            struct_map: HashMap::default(),
            pointer_type_map: HashMap::default(),
            function_type_map: HashMap::default(),
            constant_map: HashMap::default(),
        };
        builder.module_id = builder.allocate(IdKind::Module);
        builder.require_capability(Capability::Shader);
        builder
    }

    // ----------------------------------------------------------------
    // Identifier allocation.
    // ----------------------------------------------------------------

    /// Allocate a fresh id of the given kind. Ids are never reused and a
    /// kind never changes.
    pub fn allocate(&mut self, kind: IdKind) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        let previous = self.kinds.insert(id, kind);
        assert!(previous.is_none(), "id {} allocated twice", id);
        id
    }

    /// Reserve an id for a forward reference, e.g. a merge label named by a
    /// terminator before its block exists.
    pub fn reserve(&mut self, kind: IdKind) -> Id {
        self.allocate(kind)
    }

    pub fn kind_of(&self, id: Id) -> Option<IdKind> {
        self.kinds.get(&id).copied()
    }

    /// The id the next allocation would return; after [`finalize`] this is
    /// the module's binding count.
    pub fn bound(&self) -> u32 {
        self.next_id
    }

    // ----------------------------------------------------------------
    // Capabilities and extensions.
    // ----------------------------------------------------------------

    pub fn require_capability(&mut self, capability: Capability) {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require_extension(&mut self, name: &str) {
        if !self.extensions.iter().any(|e| e == name) {
            self.extensions.push(name.to_owned());
        }
    }

    /// Import an extended instruction set, once.
    pub fn import_instruction_set(&mut self, name: &str) -> Id {
        if let Some((_, id)) = self.ext_imports.iter().find(|(n, _)| n == name) {
            return *id;
        }
        let id = self.allocate(IdKind::Import);
        self.ext_imports.push((name.to_owned(), id));
        id
    }

    // ----------------------------------------------------------------
    // Types.
    // ----------------------------------------------------------------

    /// Declare a scalar or vector type, interned. Narrow and 64-bit types
    /// pull in their capability.
    pub fn declare_type(&mut self, ty: Type) -> Id {
        let key = TypeKey::of(ty);
        if let Some(id) = self.type_map.get(&key) {
            return *id;
        }
        if ty.is_vector() {
            let elem = self.declare_type(ty.element_of());
            let id = self.allocate(IdKind::Type);
            self.declarations.push(
                InstructionBuilder::new(Op::TypeVector)
                    .push(id)
                    .push(elem)
                    .push(ty.lanes() as u32)
                    .build(),
            );
            self.type_map.insert(key, id);
            return id;
        }
        self.require_type_capability(ty);
        let id = self.allocate(IdKind::Type);
        let instr = match ty.code() {
            TypeCode::Handle => InstructionBuilder::new(Op::TypeVoid).push(id).build(),
            TypeCode::Bool => InstructionBuilder::new(Op::TypeBool).push(id).build(),
            TypeCode::Int => InstructionBuilder::new(Op::TypeInt)
                .push(id)
                .push(ty.bits() as u32)
                .push(1)
                .build(),
            TypeCode::UInt => InstructionBuilder::new(Op::TypeInt)
                .push(id)
                .push(ty.bits() as u32)
                .push(0)
                .build(),
            TypeCode::Float => InstructionBuilder::new(Op::TypeFloat)
                .push(id)
                .push(ty.bits() as u32)
                .build(),
        };
        self.declarations.push(instr);
        self.type_map.insert(key, id);
        id
    }

    fn require_type_capability(&mut self, ty: Type) {
        match (ty.code(), ty.bits()) {
            (TypeCode::Int, 8) | (TypeCode::UInt, 8) => self.require_capability(Capability::Int8),
            (TypeCode::Int, 16) | (TypeCode::UInt, 16) => {
                self.require_capability(Capability::Int16)
            }
            (TypeCode::Int, 64) | (TypeCode::UInt, 64) => {
                self.require_capability(Capability::Int64)
            }
            (TypeCode::Float, 16) => self.require_capability(Capability::Float16),
            (TypeCode::Float, 64) => self.require_capability(Capability::Float64),
            _ => {}
        }
    }

    /// Declare a fixed-size array of `elem`. The size becomes an interned
    /// u32 constant.
    pub fn declare_array_type(&mut self, elem: Type, size: u32) -> Id {
        let key = TypeKey {
            array_size: ArraySize::Fixed(size),
            ..TypeKey::of(elem)
        };
        if let Some(id) = self.type_map.get(&key) {
            return *id;
        }
        let elem_id = self.declare_type(elem);
        let size_id = self.declare_const_uint(Type::u32(1), size as u64);
        let id = self.allocate(IdKind::Type);
        self.declarations.push(
            InstructionBuilder::new(Op::TypeArray)
                .push(id)
                .push(elem_id)
                .push(size_id)
                .build(),
        );
        self.type_map.insert(key, id);
        id
    }

    /// Declare a runtime array of `elem`; legal only at the tail of a
    /// buffer block struct.
    pub fn declare_runtime_array_type(&mut self, elem: Type) -> Id {
        let key = TypeKey {
            array_size: ArraySize::Runtime,
            ..TypeKey::of(elem)
        };
        if let Some(id) = self.type_map.get(&key) {
            return *id;
        }
        let elem_id = self.declare_type(elem);
        let id = self.allocate(IdKind::Type);
        self.declarations.push(
            InstructionBuilder::new(Op::TypeRuntimeArray)
                .push(id)
                .push(elem_id)
                .build(),
        );
        self.type_map.insert(key, id);
        id
    }

    /// Declare a struct, deduplicated by symbolic name plus member id
    /// sequence. The same members under a different name make a new struct.
    pub fn declare_struct(&mut self, name: &str, members: &[Id]) -> Id {
        let key = StructKey {
            name: name.to_owned(),
            members: members.to_vec(),
        };
        if let Some(id) = self.struct_map.get(&key) {
            return *id;
        }
        let id = self.allocate(IdKind::Type);
        self.declarations.push(
            InstructionBuilder::new(Op::TypeStruct)
                .push(id)
                .push_list(members)
                .build(),
        );
        self.set_name(id, name);
        self.struct_map.insert(key, id);
        id
    }

    /// Declare a pointer type; a not-yet-declared base is declared first.
    pub fn declare_pointer_to(&mut self, base: Type, storage: StorageClass) -> Id {
        let base_id = self.declare_type(base);
        self.declare_pointer_type(base_id, storage)
    }

    pub fn declare_pointer_type(&mut self, base_id: Id, storage: StorageClass) -> Id {
        if let Some(id) = self.pointer_type_map.get(&(base_id, storage)) {
            return *id;
        }
        let id = self.allocate(IdKind::Type);
        self.declarations.push(
            InstructionBuilder::new(Op::TypePointer)
                .push(id)
                .push(storage as u32)
                .push(base_id)
                .build(),
        );
        self.pointer_type_map.insert((base_id, storage), id);
        id
    }

    pub fn declare_function_type(&mut self, return_type: Id, parameters: &[Id]) -> Id {
        let key = FunctionTypeKey {
            return_type,
            parameters: parameters.to_vec(),
        };
        if let Some(id) = self.function_type_map.get(&key) {
            return *id;
        }
        let id = self.allocate(IdKind::Type);
        self.declarations.push(
            InstructionBuilder::new(Op::TypeFunction)
                .push(id)
                .push(return_type)
                .push_list(parameters)
                .build(),
        );
        self.function_type_map.insert(key, id);
        id
    }

    // ----------------------------------------------------------------
    // Constants.
    // ----------------------------------------------------------------

    fn intern_constant(
        &mut self,
        key: ConstantKey,
        emit: impl FnOnce(&mut Self, Id) -> Instruction,
    ) -> Id {
        if let Some(id) = self.constant_map.get(&key) {
            return *id;
        }
        let id = self.allocate(IdKind::Constant);
        let instr = emit(self, id);
        self.declarations.push(instr);
        self.constant_map.insert(key, id);
        id
    }

    /// Booleans are their own instructions, not a byte pattern.
    pub fn declare_const_bool(&mut self, value: bool) -> Id {
        let ty = Type::bool(1);
        let key = ConstantKey {
            type_key: TypeKey::of(ty),
            composite: false,
            raw: vec![value as u8],
        };
        let type_id = self.declare_type(ty);
        self.intern_constant(key, |_, id| {
            let op = if value {
                Op::ConstantTrue
            } else {
                Op::ConstantFalse
            };
            InstructionBuilder::new(op).push(type_id).push(id).build()
        })
    }

    pub fn declare_const_int(&mut self, ty: Type, value: i64) -> Id {
        debug_assert!(ty.is_int() && ty.is_scalar());
        let raw = value.to_le_bytes()[..(ty.bytes() as usize)].to_vec();
        self.declare_const_words(ty, raw)
    }

    pub fn declare_const_uint(&mut self, ty: Type, value: u64) -> Id {
        debug_assert!(ty.is_uint() && ty.is_scalar());
        let raw = value.to_le_bytes()[..(ty.bytes() as usize)].to_vec();
        self.declare_const_words(ty, raw)
    }

    pub fn declare_const_float(&mut self, ty: Type, value: f64) -> Id {
        debug_assert!(ty.is_float() && ty.is_scalar());
        let raw = match ty.bits() {
            16 => half::f16::from_f64(value).to_bits().to_le_bytes().to_vec(),
            32 => bytemuck::cast::<f32, u32>(value as f32).to_le_bytes().to_vec(),
            _ => value.to_bits().to_le_bytes().to_vec(),
        };
        self.declare_const_words(ty, raw)
    }

    fn declare_const_words(&mut self, ty: Type, raw: Vec<u8>) -> Id {
        let key = ConstantKey {
            type_key: TypeKey::of(ty),
            composite: false,
            raw: raw.clone(),
        };
        let type_id = self.declare_type(ty);
        self.intern_constant(key, |_, id| {
            let mut builder = InstructionBuilder::new(Op::Constant).push(type_id).push(id);
            for chunk in raw.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                builder = builder.push(u32::from_le_bytes(word));
            }
            builder.build()
        })
    }

    pub fn declare_null_constant(&mut self, ty: Type) -> Id {
        let key = ConstantKey {
            type_key: TypeKey::of(ty),
            composite: false,
            raw: Vec::new(),
        };
        let type_id = self.declare_type(ty);
        self.intern_constant(key, |_, id| {
            InstructionBuilder::new(Op::ConstantNull)
                .push(type_id)
                .push(id)
                .build()
        })
    }

    /// A vector constant assembled from already-declared scalar constants.
    pub fn declare_composite_constant(&mut self, ty: Type, elements: &[Id]) -> Id {
        debug_assert!(ty.is_vector());
        debug_assert_eq!(ty.lanes() as usize, elements.len());
        let key = ConstantKey {
            type_key: TypeKey::of(ty),
            composite: true,
            raw: elements.iter().flat_map(|e| e.to_le_bytes()).collect(),
        };
        let type_id = self.declare_type(ty);
        self.intern_constant(key, |_, id| {
            InstructionBuilder::new(Op::ConstantComposite)
                .push(type_id)
                .push(id)
                .push_list(elements)
                .build()
        })
    }

    /// A debug string, usable as the target of OpSource-style references.
    pub fn declare_string(&mut self, value: &str) -> Id {
        let id = self.allocate(IdKind::Result);
        self.debug_strings.push(
            InstructionBuilder::new(Op::String)
                .push(id)
                .push_str(value)
                .build(),
        );
        id
    }

    // ----------------------------------------------------------------
    // Globals, names, decorations.
    // ----------------------------------------------------------------

    /// A module-scope variable of an already-declared pointer type.
    pub fn declare_global(&mut self, pointer_type: Id, storage: StorageClass) -> Id {
        let id = self.allocate(IdKind::Variable);
        self.globals.push(
            InstructionBuilder::new(Op::Variable)
                .push(pointer_type)
                .push(id)
                .push(storage as u32)
                .build(),
        );
        id
    }

    pub fn set_name(&mut self, id: Id, name: &str) {
        self.debug_names.push(
            InstructionBuilder::new(Op::Name)
                .push(id)
                .push_str(name)
                .build(),
        );
    }

    pub fn set_member_name(&mut self, struct_id: Id, member: u32, name: &str) {
        self.debug_names.push(
            InstructionBuilder::new(Op::MemberName)
                .push(struct_id)
                .push(member)
                .push_str(name)
                .build(),
        );
    }

    pub fn decorate(&mut self, id: Id, decoration: Decoration, operands: &[u32]) {
        self.annotations.push(
            InstructionBuilder::new(Op::Decorate)
                .push(id)
                .push(decoration as u32)
                .push_list(operands)
                .build(),
        );
    }

    pub fn decorate_member(
        &mut self,
        struct_id: Id,
        member: u32,
        decoration: Decoration,
        operands: &[u32],
    ) {
        self.annotations.push(
            InstructionBuilder::new(Op::MemberDecorate)
                .push(struct_id)
                .push(member)
                .push(decoration as u32)
                .push_list(operands)
                .build(),
        );
    }

    // ----------------------------------------------------------------
    // Functions and blocks.
    // ----------------------------------------------------------------

    /// Open a function and its entry block. The entry block is the only
    /// block that may hold variable declarations.
    pub fn begin_function(&mut self, return_type: Id, function_type: Id, control_mask: u32) -> Id {
        assert!(
            self.current_function.is_none(),
            "cannot nest function definitions"
        );
        let id = self.allocate(IdKind::Function);
        let entry_label = self.allocate(IdKind::Block);
        self.functions.push(FunctionBuild {
            id,
            return_type,
            function_type,
            control_mask,
            parameters: Vec::new(),
            blocks: vec![BlockBuild {
                label: entry_label,
                variables: Vec::new(),
                body: Vec::new(),
            }],
        });
        self.current_function = Some(self.functions.len() - 1);
        id
    }

    pub fn add_function_parameter(&mut self, type_id: Id) -> Result<Id> {
        let id = self.allocate(IdKind::Result);
        let function = self.current_function_mut()?;
        function.parameters.push(
            InstructionBuilder::new(Op::FunctionParameter)
                .push(type_id)
                .push(id)
                .build(),
        );
        Ok(id)
    }

    /// A function-storage variable, placed in the entry block.
    pub fn declare_local_variable(&mut self, pointer_type: Id) -> Result<Id> {
        let id = self.allocate(IdKind::Variable);
        let function = self.current_function_mut()?;
        function.blocks[0].variables.push(
            InstructionBuilder::new(Op::Variable)
                .push(pointer_type)
                .push(id)
                .push(StorageClass::Function as u32)
                .build(),
        );
        Ok(id)
    }

    /// Open a new block under a previously reserved label. If the previous
    /// tail block is not terminated, it first receives an unconditional
    /// branch to the new block.
    pub fn append_block(&mut self, label: Id) -> Result<()> {
        match self.kind_of(label) {
            Some(IdKind::Block) | Some(IdKind::Label) => {}
            other => bail!("id {} is not a block label (kind {:?})", label, other),
        }
        let function = self.current_function_mut()?;
        if let Some(tail) = function.blocks.last_mut() {
            if !tail.is_terminated() {
                tail.body
                    .push(InstructionBuilder::new(Op::Branch).push(label).build());
            }
        }
        function.blocks.push(BlockBuild {
            label,
            variables: Vec::new(),
            body: Vec::new(),
        });
        Ok(())
    }

    /// Append an instruction to the current block. Nothing may follow a
    /// terminator.
    pub fn push_instruction(&mut self, instr: Instruction) -> Result<()> {
        let function = self.current_function_mut()?;
        let block = function
            .blocks
            .last_mut()
            .ok_or_else(|| anyhow!("function has no open block"))?;
        if block.is_terminated() {
            bail!(
                "block %{} already terminated; cannot append {:?}",
                block.label,
                instr
            );
        }
        block.body.push(instr);
        Ok(())
    }

    pub fn current_block_terminated(&self) -> bool {
        self.current_function
            .and_then(|i| self.functions[i].blocks.last())
            .map_or(true, |b| b.is_terminated())
    }

    pub fn current_block_label(&self) -> Result<Id> {
        self.current_function
            .and_then(|i| self.functions[i].blocks.last())
            .map(|b| b.label)
            .ok_or_else(|| anyhow!("no open block"))
    }

    /// Close the current function; every block must be terminated.
    pub fn end_function(&mut self) -> Result<()> {
        let index = self
            .current_function
            .take()
            .ok_or_else(|| anyhow!("no function is open"))?;
        for block in &self.functions[index].blocks {
            if !block.is_terminated() {
                bail!("block %{} has no terminator", block.label);
            }
        }
        Ok(())
    }

    fn current_function_mut(&mut self) -> Result<&mut FunctionBuild> {
        let index = self
            .current_function
            .ok_or_else(|| anyhow!("no function is open"))?;
        Ok(&mut self.functions[index])
    }

    // ----------------------------------------------------------------
    // Entry points and execution modes.
    // ----------------------------------------------------------------

    /// Record an entry point. Keyed by symbol name; redefinition is an
    /// error.
    pub fn add_entry_point(
        &mut self,
        name: &str,
        exec_model: ExecutionModel,
        function: Id,
        interface: Vec<Id>,
    ) -> Result<()> {
        if self.entry_points.iter().any(|e| e.name == name) {
            bail!("entry point {:?} already declared", name);
        }
        self.entry_points.push(EntryPointDecl {
            name: name.to_owned(),
            exec_model,
            function,
            interface,
        });
        Ok(())
    }

    /// Declare the fixed workgroup size of an entry point, once.
    pub fn set_local_size(&mut self, function: Id, size: [u32; 3]) {
        self.execution_modes.push(
            InstructionBuilder::new(Op::ExecutionMode)
                .push(function)
                .push(ExecutionMode::LocalSize as u32)
                .push(size[0])
                .push(size[1])
                .push(size[2])
                .build(),
        );
    }

    // ----------------------------------------------------------------
    // Finalize and encode.
    // ----------------------------------------------------------------

    /// Infer storage extensions from the capabilities in use, fix the
    /// binding count, and encode the module once. The builder is consumed;
    /// the result is read-only.
    pub fn finalize(mut self) -> Result<SpirvBinary> {
        if self.current_function.is_some() {
            bail!("finalize with an unterminated function");
        }
        if self.has_capability(Capability::Int8) {
            self.require_extension("SPV_KHR_8bit_storage");
        }
        if self.has_capability(Capability::Int16) {
            self.require_extension("SPV_KHR_16bit_storage");
        }

        let header = SpirvHeader::with_bound(self.next_id);
        let mut words: Vec<u32> = header.words().to_vec();
        let mut push = |instr: &Instruction| words.extend_from_slice(instr.words());

        for capability in &self.capabilities {
            push(
                &InstructionBuilder::new(Op::Capability)
                    .push(*capability as u32)
                    .build(),
            );
        }
        for extension in &self.extensions {
            push(
                &InstructionBuilder::new(Op::Extension)
                    .push_str(extension)
                    .build(),
            );
        }
        for (name, id) in &self.ext_imports {
            push(
                &InstructionBuilder::new(Op::ExtInstImport)
                    .push(*id)
                    .push_str(name)
                    .build(),
            );
        }
        push(
            &InstructionBuilder::new(Op::MemoryModel)
                .push(AddressingModel::Logical as u32)
                .push(MemoryModel::GLSL450 as u32)
                .build(),
        );
        for entry_point in &self.entry_points {
            push(
                &InstructionBuilder::new(Op::EntryPoint)
                    .push(entry_point.exec_model as u32)
                    .push(entry_point.function)
                    .push_str(&entry_point.name)
                    .push_list(&entry_point.interface)
                    .build(),
            );
        }
        for instr in &self.execution_modes {
            push(instr);
        }
        for instr in &self.debug_strings {
            push(instr);
        }
        for instr in &self.debug_names {
            push(instr);
        }
        for instr in &self.annotations {
            push(instr);
        }
        for instr in &self.declarations {
            push(instr);
        }
        for instr in &self.globals {
            push(instr);
        }
        for function in &self.functions {
            push(
                &InstructionBuilder::new(Op::Function)
                    .push(function.return_type)
                    .push(function.id)
                    .push(function.control_mask)
                    .push(function.function_type)
                    .build(),
            );
            for parameter in &function.parameters {
                push(parameter);
            }
            for block in &function.blocks {
                push(&InstructionBuilder::new(Op::Label).push(block.label).build());
                for variable in &block.variables {
                    push(variable);
                }
                for instr in &block.body {
                    push(instr);
                }
                if !block.is_terminated() {
                    bail!("block %{} has no terminator at encode time", block.label);
                }
            }
            push(&InstructionBuilder::new(Op::FunctionEnd).build());
        }

        Ok(SpirvBinary::from(words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_are_unique_with_fixed_kinds() {
        let mut builder = SpvBuilder::new();
        let mut seen = std::collections::HashSet::new();
        for kind in &[IdKind::Type, IdKind::Constant, IdKind::Result, IdKind::Label] {
            for _ in 0..10 {
                let id = builder.allocate(*kind);
                assert!(seen.insert(id), "id {} reused", id);
                assert_eq!(builder.kind_of(id), Some(*kind));
            }
        }
    }

    #[test]
    fn types_and_constants_deduplicate() {
        let mut builder = SpvBuilder::new();
        let a = builder.declare_type(Type::i32(1));
        let b = builder.declare_type(Type::i32(1));
        assert_eq!(a, b);
        let v = builder.declare_type(Type::i32(4));
        assert_ne!(a, v);
        assert_eq!(builder.declare_type(Type::i32(4)), v);

        let c = builder.declare_const_int(Type::i32(1), 7);
        assert_eq!(builder.declare_const_int(Type::i32(1), 7), c);
        assert_ne!(builder.declare_const_int(Type::i32(1), 8), c);
        // Same bytes, different type: a distinct constant.
        assert_ne!(builder.declare_const_uint(Type::u32(1), 7), c);

        let p = builder.declare_pointer_to(Type::i32(1), StorageClass::Function);
        assert_eq!(
            builder.declare_pointer_to(Type::i32(1), StorageClass::Function),
            p
        );
        assert_ne!(
            builder.declare_pointer_to(Type::i32(1), StorageClass::Uniform),
            p
        );
    }

    #[test]
    fn structs_deduplicate_by_name_and_members() {
        let mut builder = SpvBuilder::new();
        let int_id = builder.declare_type(Type::i32(1));
        let a = builder.declare_struct("args", &[int_id]);
        assert_eq!(builder.declare_struct("args", &[int_id]), a);
        // Same members, different name: a new struct.
        assert_ne!(builder.declare_struct("argv", &[int_id]), a);
    }

    #[test]
    fn narrow_types_require_capabilities_and_extensions() {
        let mut builder = SpvBuilder::new();
        builder.declare_type(Type::u8(1));
        builder.declare_type(Type::i16(1));
        assert!(builder.has_capability(Capability::Int8));
        assert!(builder.has_capability(Capability::Int16));

        let void = builder.declare_type(Type::handle());
        let fn_ty = builder.declare_function_type(void, &[]);
        let f = builder.begin_function(void, fn_ty, 0);
        builder
            .push_instruction(InstructionBuilder::new(Op::Return).build())
            .unwrap();
        builder.end_function().unwrap();
        let _ = f;

        let binary = builder.finalize().unwrap();
        let mut extensions = Vec::new();
        for instr in binary.instrs().unwrap() {
            let instr = instr.unwrap();
            if instr.opcode() == Op::Extension as u32 {
                extensions.push(instr.operands().read_str().unwrap());
            }
        }
        assert!(extensions.contains(&"SPV_KHR_8bit_storage".to_owned()));
        assert!(extensions.contains(&"SPV_KHR_16bit_storage".to_owned()));
    }

    #[test]
    fn appending_a_block_branches_from_unterminated_tail() {
        let mut builder = SpvBuilder::new();
        let void = builder.declare_type(Type::handle());
        let fn_ty = builder.declare_function_type(void, &[]);
        builder.begin_function(void, fn_ty, 0);
        let next = builder.reserve(IdKind::Label);
        builder.append_block(next).unwrap();
        builder
            .push_instruction(InstructionBuilder::new(Op::Return).build())
            .unwrap();
        builder.end_function().unwrap();

        let binary = builder.finalize().unwrap();
        let mut ops = Vec::new();
        for instr in binary.instrs().unwrap() {
            ops.push(instr.unwrap().opcode());
        }
        // ... OpLabel, OpBranch, OpLabel, OpReturn, OpFunctionEnd.
        let tail: Vec<u32> = ops[ops.len() - 5..].to_vec();
        assert_eq!(
            tail,
            vec![
                Op::Label as u32,
                Op::Branch as u32,
                Op::Label as u32,
                Op::Return as u32,
                Op::FunctionEnd as u32
            ]
        );
    }

    #[test]
    fn instructions_after_a_terminator_are_rejected() {
        let mut builder = SpvBuilder::new();
        let void = builder.declare_type(Type::handle());
        let fn_ty = builder.declare_function_type(void, &[]);
        builder.begin_function(void, fn_ty, 0);
        builder
            .push_instruction(InstructionBuilder::new(Op::Return).build())
            .unwrap();
        let err = builder.push_instruction(InstructionBuilder::new(Op::Nop).build());
        assert!(err.is_err());
    }

    #[test]
    fn binding_count_is_highest_id_plus_one() {
        let mut builder = SpvBuilder::new();
        builder.declare_type(Type::f32(1));
        builder.declare_const_float(Type::f32(1), 1.5);
        let expected = builder.bound();
        let binary = builder.finalize().unwrap();
        assert_eq!(binary.header().unwrap().bound, expected);
    }

    #[test]
    fn duplicate_entry_point_names_are_rejected() {
        let mut builder = SpvBuilder::new();
        let void = builder.declare_type(Type::handle());
        let fn_ty = builder.declare_function_type(void, &[]);
        let f = builder.begin_function(void, fn_ty, 0);
        builder
            .push_instruction(InstructionBuilder::new(Op::Return).build())
            .unwrap();
        builder.end_function().unwrap();
        builder
            .add_entry_point("k", ExecutionModel::GLCompute, f, vec![])
            .unwrap();
        assert!(builder
            .add_entry_point("k", ExecutionModel::GLCompute, f, vec![])
            .is_err());
    }
}
