//! Raw device interface and the process-wide context.
//!
//! The compute back end talks to the driver through [`DeviceApi`], a trait
//! mirroring the Vulkan-style command-buffer surface at the granularity the
//! dispatcher needs. Backends implement it; the rest of this crate is
//! generic over it. All device work happens while the process-wide
//! [`SharedContext`] is held.
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::status::Status;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u64);
    };
}

handle_type!(DeviceHandle);
handle_type!(QueueHandle);
handle_type!(CommandPoolHandle);
handle_type!(CommandBufferHandle);
handle_type!(ShaderModuleHandle);
handle_type!(DescriptorSetLayoutHandle);
handle_type!(PipelineLayoutHandle);
handle_type!(PipelineHandle);
handle_type!(DescriptorPoolHandle);
handle_type!(DescriptorSetHandle);
/// A device memory block exposed as a buffer.
handle_type!(BufferHandle);

/// The raw device surface. Every call may fail with a device error; the
/// dispatcher maps failures to [`Status::DeviceError`] and reclaims partial
/// work.
pub trait DeviceApi {
    fn create_shader_module(&self, device: DeviceHandle, words: &[u32]) -> Result<ShaderModuleHandle>;
    fn destroy_shader_module(&self, device: DeviceHandle, module: ShaderModuleHandle);

    fn create_descriptor_set_layout(
        &self,
        device: DeviceHandle,
        uniform_buffers: u32,
        storage_buffers: u32,
    ) -> Result<DescriptorSetLayoutHandle>;
    fn create_pipeline_layout(
        &self,
        device: DeviceHandle,
        set_layout: DescriptorSetLayoutHandle,
    ) -> Result<PipelineLayoutHandle>;
    fn create_compute_pipeline(
        &self,
        device: DeviceHandle,
        layout: PipelineLayoutHandle,
        module: ShaderModuleHandle,
        entry_name: &str,
    ) -> Result<PipelineHandle>;
    fn create_descriptor_pool(
        &self,
        device: DeviceHandle,
        uniform_buffers: u32,
        storage_buffers: u32,
    ) -> Result<DescriptorPoolHandle>;
    fn allocate_descriptor_set(
        &self,
        device: DeviceHandle,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle>;
    /// Point the set at the caller's buffers: the optional scalar-argument
    /// uniform buffer first, then the storage buffers in binding order.
    fn update_descriptor_set(
        &self,
        device: DeviceHandle,
        set: DescriptorSetHandle,
        uniform_buffer: Option<BufferHandle>,
        storage_buffers: &[BufferHandle],
    ) -> Result<()>;

    fn allocate_block(&self, device: DeviceHandle, size: u64) -> Result<BufferHandle>;
    fn free_block(&self, device: DeviceHandle, buffer: BufferHandle);
    /// Map `size` bytes at `offset`; must be paired with `unmap_block`.
    fn map_block(
        &self,
        device: DeviceHandle,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Result<*mut u8>;
    fn unmap_block(&self, device: DeviceHandle, buffer: BufferHandle);
    fn copy_block(
        &self,
        device: DeviceHandle,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    fn allocate_command_buffer(
        &self,
        device: DeviceHandle,
        pool: CommandPoolHandle,
    ) -> Result<CommandBufferHandle>;
    fn begin_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;
    fn cmd_bind(
        &self,
        cb: CommandBufferHandle,
        pipeline: PipelineHandle,
        layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
    );
    fn cmd_dispatch(&self, cb: CommandBufferHandle, blocks_x: u32, blocks_y: u32, blocks_z: u32);
    fn end_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;
    fn submit(&self, queue: QueueHandle, cb: CommandBufferHandle) -> Result<()>;
    fn queue_wait_idle(&self, queue: QueueHandle) -> Result<()>;
    fn free_command_buffer(
        &self,
        device: DeviceHandle,
        pool: CommandPoolHandle,
        cb: CommandBufferHandle,
    );
    fn reset_command_pool(&self, device: DeviceHandle, pool: CommandPoolHandle) -> Result<()>;
}

/// The three resources every dispatch needs.
#[derive(Clone, Copy, Debug)]
pub struct DeviceContext {
    pub device: DeviceHandle,
    pub queue: QueueHandle,
    pub command_pool: CommandPoolHandle,
}

/// Process-wide context behind a test-and-set spinlock. At most one thread
/// holds the context at a time; every `acquire` is paired with a release by
/// the guard on all exit paths.
pub struct SharedContext {
    locked: AtomicBool,
    context: DeviceContext,
}

impl SharedContext {
    pub fn new(context: DeviceContext) -> Self {
        SharedContext {
            locked: AtomicBool::new(false),
            context,
        }
    }

    pub fn acquire(&self) -> ContextGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        ContextGuard { shared: self }
    }

    /// Non-blocking variant; `None` when another thread holds the context.
    pub fn try_acquire(&self) -> Option<ContextGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ContextGuard { shared: self })
        } else {
            None
        }
    }
}

pub struct ContextGuard<'a> {
    shared: &'a SharedContext,
}

impl<'a> ContextGuard<'a> {
    pub fn context(&self) -> &DeviceContext {
        &self.shared.context
    }
}

impl<'a> Drop for ContextGuard<'a> {
    fn drop(&mut self) {
        self.shared.locked.store(false, Ordering::Release);
    }
}

/// Map an internal failure onto the stable device error code, logging the
/// underlying cause.
pub fn device_failure(err: crate::error::Error) -> Status {
    log::warn!("device call failed: {:#}", err);
    Status::DeviceError
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context() -> DeviceContext {
        DeviceContext {
            device: DeviceHandle(1),
            queue: QueueHandle(1),
            command_pool: CommandPoolHandle(1),
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let shared = SharedContext::new(context());
        {
            let guard = shared.acquire();
            assert!(shared.try_acquire().is_none());
            let _ = guard.context();
        }
        assert!(shared.try_acquire().is_some());
    }

    #[test]
    fn contended_acquisition_serialises() {
        let shared = Arc::new(SharedContext::new(context()));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            let counter = Arc::clone(&counter);
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = shared.acquire();
                    // Non-atomic read-modify-write is safe only because the
                    // lock serialises us.
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
