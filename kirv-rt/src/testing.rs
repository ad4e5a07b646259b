//! In-memory device backend for tests.
//!
//! Implements [`DeviceApi`](crate::device::DeviceApi) over plain host
//! memory, records every dispatch, and can be told to fail its next
//! allocation. Blocks live on the heap so mapped pointers stay valid while
//! entries move around the registry.
use std::sync::Mutex;

use fnv::FnvHashMap as HashMap;

use crate::device::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DeviceApi, DeviceContext, DeviceHandle,
    PipelineHandle, PipelineLayoutHandle, QueueHandle, ShaderModuleHandle,
};
use crate::error::{anyhow, bail, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    pub entry_name: String,
    pub blocks: (u32, u32, u32),
    pub uniform_buffer: Option<BufferHandle>,
    pub storage_buffers: Vec<BufferHandle>,
}

#[derive(Clone)]
enum Command {
    Bind {
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
    },
    Dispatch(u32, u32, u32),
}

#[derive(Default)]
struct MockState {
    next: u64,
    blocks: HashMap<u64, Vec<u8>>,
    modules: HashMap<u64, Vec<u32>>,
    pipelines: HashMap<u64, String>,
    sets: HashMap<u64, (Option<BufferHandle>, Vec<BufferHandle>)>,
    command_buffers: HashMap<u64, Vec<Command>>,
    dispatches: Vec<DispatchRecord>,
    shader_modules_created: u64,
    fail_next_allocation: bool,
}

impl MockState {
    fn fresh(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[derive(Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> DeviceContext {
        DeviceContext {
            device: DeviceHandle(1),
            queue: QueueHandle(1),
            command_pool: CommandPoolHandle(1),
        }
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.lock().unwrap().dispatches.clone()
    }

    pub fn live_blocks(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    pub fn shader_modules_created(&self) -> u64 {
        self.state.lock().unwrap().shader_modules_created
    }

    pub fn block_bytes(&self, buffer: BufferHandle) -> Vec<u8> {
        self.state.lock().unwrap().blocks[&buffer.0].clone()
    }

    pub fn write_block(&self, buffer: BufferHandle, offset: usize, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let block = state.blocks.get_mut(&buffer.0).expect("no such block");
        block[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Make the next `allocate_block` fail, as an exhausted device would.
    pub fn fail_next_allocation(&self) {
        self.state.lock().unwrap().fail_next_allocation = true;
    }
}

impl DeviceApi for MockDevice {
    fn create_shader_module(&self, _: DeviceHandle, words: &[u32]) -> Result<ShaderModuleHandle> {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh();
        state.modules.insert(id, words.to_vec());
        state.shader_modules_created += 1;
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_module(&self, _: DeviceHandle, module: ShaderModuleHandle) {
        self.state.lock().unwrap().modules.remove(&module.0);
    }

    fn create_descriptor_set_layout(
        &self,
        _: DeviceHandle,
        _: u32,
        _: u32,
    ) -> Result<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle(
            self.state.lock().unwrap().fresh(),
        ))
    }

    fn create_pipeline_layout(
        &self,
        _: DeviceHandle,
        _: DescriptorSetLayoutHandle,
    ) -> Result<PipelineLayoutHandle> {
        Ok(PipelineLayoutHandle(self.state.lock().unwrap().fresh()))
    }

    fn create_compute_pipeline(
        &self,
        _: DeviceHandle,
        _: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_name: &str,
    ) -> Result<PipelineHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.modules.contains_key(&module.0) {
            bail!("pipeline refers to a destroyed shader module");
        }
        let id = state.fresh();
        state.pipelines.insert(id, entry_name.to_owned());
        Ok(PipelineHandle(id))
    }

    fn create_descriptor_pool(
        &self,
        _: DeviceHandle,
        _: u32,
        _: u32,
    ) -> Result<DescriptorPoolHandle> {
        Ok(DescriptorPoolHandle(self.state.lock().unwrap().fresh()))
    }

    fn allocate_descriptor_set(
        &self,
        _: DeviceHandle,
        _: DescriptorPoolHandle,
        _: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh();
        state.sets.insert(id, (None, Vec::new()));
        Ok(DescriptorSetHandle(id))
    }

    fn update_descriptor_set(
        &self,
        _: DeviceHandle,
        set: DescriptorSetHandle,
        uniform_buffer: Option<BufferHandle>,
        storage_buffers: &[BufferHandle],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .sets
            .get_mut(&set.0)
            .ok_or_else(|| anyhow!("unknown descriptor set"))?;
        *slot = (uniform_buffer, storage_buffers.to_vec());
        Ok(())
    }

    fn allocate_block(&self, _: DeviceHandle, size: u64) -> Result<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_allocation {
            state.fail_next_allocation = false;
            bail!("simulated out-of-memory");
        }
        let id = state.fresh();
        state.blocks.insert(id, vec![0u8; size as usize]);
        Ok(BufferHandle(id))
    }

    fn free_block(&self, _: DeviceHandle, buffer: BufferHandle) {
        self.state.lock().unwrap().blocks.remove(&buffer.0);
    }

    fn map_block(
        &self,
        _: DeviceHandle,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<*mut u8> {
        let mut state = self.state.lock().unwrap();
        let block = state
            .blocks
            .get_mut(&buffer.0)
            .ok_or_else(|| anyhow!("mapping a freed block"))?;
        if (offset + size) as usize > block.len() {
            bail!("mapping beyond the end of the block");
        }
        // Heap storage keeps the pointer valid until the block is freed.
        Ok(unsafe { block.as_mut_ptr().add(offset as usize) })
    }

    fn unmap_block(&self, _: DeviceHandle, _: BufferHandle) {}

    fn copy_block(
        &self,
        _: DeviceHandle,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let data = {
            let src = state
                .blocks
                .get(&src.0)
                .ok_or_else(|| anyhow!("copy from a freed block"))?;
            src[src_offset as usize..(src_offset + size) as usize].to_vec()
        };
        let dst = state
            .blocks
            .get_mut(&dst.0)
            .ok_or_else(|| anyhow!("copy to a freed block"))?;
        dst[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&data);
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        _: DeviceHandle,
        _: CommandPoolHandle,
    ) -> Result<CommandBufferHandle> {
        let mut state = self.state.lock().unwrap();
        let id = state.fresh();
        state.command_buffers.insert(id, Vec::new());
        Ok(CommandBufferHandle(id))
    }

    fn begin_command_buffer(&self, _: CommandBufferHandle) -> Result<()> {
        Ok(())
    }

    fn cmd_bind(
        &self,
        cb: CommandBufferHandle,
        pipeline: PipelineHandle,
        _: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(commands) = state.command_buffers.get_mut(&cb.0) {
            commands.push(Command::Bind { pipeline, set });
        }
    }

    fn cmd_dispatch(&self, cb: CommandBufferHandle, x: u32, y: u32, z: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(commands) = state.command_buffers.get_mut(&cb.0) {
            commands.push(Command::Dispatch(x, y, z));
        }
    }

    fn end_command_buffer(&self, _: CommandBufferHandle) -> Result<()> {
        Ok(())
    }

    /// "Execute" the command buffer: resolve the bound pipeline and set
    /// into a dispatch record.
    fn submit(&self, _: QueueHandle, cb: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let commands = state
            .command_buffers
            .get(&cb.0)
            .ok_or_else(|| anyhow!("submitting a freed command buffer"))?
            .clone();
        let mut bound: Option<(PipelineHandle, DescriptorSetHandle)> = None;
        for command in commands {
            match command {
                Command::Bind { pipeline, set } => bound = Some((pipeline, set)),
                Command::Dispatch(x, y, z) => {
                    let (pipeline, set) =
                        bound.ok_or_else(|| anyhow!("dispatch without a bound pipeline"))?;
                    let entry_name = state
                        .pipelines
                        .get(&pipeline.0)
                        .ok_or_else(|| anyhow!("dispatch of an unknown pipeline"))?
                        .clone();
                    let (uniform_buffer, storage_buffers) = state
                        .sets
                        .get(&set.0)
                        .ok_or_else(|| anyhow!("dispatch with an unknown descriptor set"))?
                        .clone();
                    state.dispatches.push(DispatchRecord {
                        entry_name,
                        blocks: (x, y, z),
                        uniform_buffer,
                        storage_buffers,
                    });
                }
            }
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _: QueueHandle) -> Result<()> {
        Ok(())
    }

    fn free_command_buffer(&self, _: DeviceHandle, _: CommandPoolHandle, cb: CommandBufferHandle) {
        self.state.lock().unwrap().command_buffers.remove(&cb.0);
    }

    fn reset_command_pool(&self, _: DeviceHandle, _: CommandPoolHandle) -> Result<()> {
        self.state.lock().unwrap().command_buffers.clear();
        Ok(())
    }
}
