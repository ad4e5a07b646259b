//! Kernel dispatch and the buffer lifecycle operations.
//!
//! Submission is synchronous: every path submits, waits for queue idle, and
//! releases its command buffer before returning, so dispatches never
//! overlap on the device. The command pool is reset explicitly after each
//! dispatch.
use crate::alloc::{MemoryAllocator, MemoryRequest, Region};
use crate::cache::CompilationCache;
use crate::device::{device_failure, BufferHandle, ContextGuard, DeviceApi};
use crate::status::{DeviceResult, Status};

/// Load a module into the cache ahead of its first dispatch.
pub fn initialize_kernels(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    cache: &mut CompilationCache,
    module_words: &[u32],
) -> DeviceResult<()> {
    cache.get_or_create(api, guard.context(), module_words)?;
    Ok(())
}

/// Drop a module's cache entry and device resources.
pub fn finalize_kernels(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    cache: &mut CompilationCache,
    module_words: &[u32],
) -> DeviceResult<()> {
    cache.remove(api, guard.context(), module_words)
}

/// Dispatch one kernel: reuse or create the cache entry, write the scalar
/// arguments, point the descriptor set at the caller's buffers, record and
/// submit, then wait for the queue to drain.
pub fn run(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    cache: &mut CompilationCache,
    alloc: &mut MemoryAllocator,
    module_words: &[u32],
    entry_name: &str,
    scalar_args: &[u8],
    buffers: &[Region],
    blocks: (u32, u32, u32),
) -> DeviceResult<()> {
    let ctx = *guard.context();
    let entry = cache.get_or_create(api, &ctx, module_words)?;
    let resources = entry.entry_point(entry_name);

    if resources.storage_buffer_count as usize != buffers.len() {
        log::warn!(
            "{} expects {} buffers, got {}",
            entry_name,
            resources.storage_buffer_count,
            buffers.len()
        );
        return Err(Status::InvalidArgument);
    }

    // Scalar arguments travel in the entry point's own uniform buffer,
    // created at first use and reused afterwards.
    let uniform_buffer = if resources.uniform_buffer_count > 0 {
        if scalar_args.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let buffer = match resources.uniform_buffer {
            Some((buffer, size)) if size >= scalar_args.len() as u64 => buffer,
            _ => {
                let buffer = api
                    .allocate_block(ctx.device, scalar_args.len() as u64)
                    .map_err(|_| Status::OutOfMemory)?;
                resources.uniform_buffer = Some((buffer, scalar_args.len() as u64));
                buffer
            }
        };
        write_bytes(api, &ctx, buffer, scalar_args)?;
        Some(buffer)
    } else {
        None
    };

    let storage: Vec<BufferHandle> = buffers
        .iter()
        .map(|region| alloc.native_handle(*region))
        .collect::<DeviceResult<_>>()?;
    api.update_descriptor_set(ctx.device, resources.descriptor_set, uniform_buffer, &storage)
        .map_err(device_failure)?;

    let cb = api
        .allocate_command_buffer(ctx.device, ctx.command_pool)
        .map_err(device_failure)?;
    // From here on the command buffer must be released on every path.
    let submit = (|| -> crate::error::Result<()> {
        api.begin_command_buffer(cb)?;
        api.cmd_bind(
            cb,
            resources.pipeline,
            resources.pipeline_layout,
            resources.descriptor_set,
        );
        api.cmd_dispatch(cb, blocks.0, blocks.1, blocks.2);
        api.end_command_buffer(cb)?;
        api.submit(ctx.queue, cb)?;
        api.queue_wait_idle(ctx.queue)?;
        Ok(())
    })();
    api.free_command_buffer(ctx.device, ctx.command_pool, cb);
    let reset = api.reset_command_pool(ctx.device, ctx.command_pool);
    submit.map_err(device_failure)?;
    reset.map_err(device_failure)?;
    log::debug!(
        "dispatched {} over {:?} blocks",
        entry_name,
        blocks
    );
    Ok(())
}

/// Allocate a device region.
pub fn device_malloc(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
    request: MemoryRequest,
) -> DeviceResult<Region> {
    alloc.reserve(api, guard.context(), request)
}

/// Return a region to the pool for reuse.
pub fn device_free(alloc: &mut MemoryAllocator, region: Region) -> DeviceResult<()> {
    alloc.release(region)
}

/// Allocate a region visible to both host and device: coherent, mappable,
/// usable as either transfer end.
pub fn device_and_host_malloc(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
    size: u64,
) -> DeviceResult<Region> {
    alloc.reserve(
        api,
        guard.context(),
        MemoryRequest {
            size,
            usage: crate::alloc::MemoryUsage::TransferSrcDst,
            caching: crate::alloc::MemoryCaching::Coherent,
            visibility: crate::alloc::MemoryVisibility::HostToDevice,
        },
    )
}

pub fn device_and_host_free(alloc: &mut MemoryAllocator, region: Region) -> DeviceResult<()> {
    alloc.release(region)
}

/// Copy host bytes into a device region through a mapping.
pub fn copy_to_device(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
    region: Region,
    data: &[u8],
) -> DeviceResult<()> {
    let ctx = *guard.context();
    if alloc.size_of(region)? < data.len() as u64 {
        return Err(Status::InvalidArgument);
    }
    let ptr = alloc.map(api, &ctx, region)?;
    // The mapping is exclusive while the context is held.
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }
    alloc.unmap(api, &ctx, region)
}

/// Copy a device region back to host memory through a mapping.
pub fn copy_to_host(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
    region: Region,
    data: &mut [u8],
) -> DeviceResult<()> {
    let ctx = *guard.context();
    if alloc.size_of(region)? < data.len() as u64 {
        return Err(Status::InvalidArgument);
    }
    let ptr = alloc.map(api, &ctx, region)?;
    unsafe {
        std::ptr::copy_nonoverlapping(ptr as *const u8, data.as_mut_ptr(), data.len());
    }
    alloc.unmap(api, &ctx, region)
}

/// Device-to-device copy. The queue is drained first so earlier dispatches
/// writing either buffer are complete.
pub fn buffer_copy(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
    src: Region,
    dst: Region,
    size: u64,
) -> DeviceResult<()> {
    let ctx = *guard.context();
    api.queue_wait_idle(ctx.queue).map_err(device_failure)?;
    let src_buffer = alloc.native_handle(src)?;
    let src_offset = alloc.head_offset(src)?;
    let dst_buffer = alloc.native_handle(dst)?;
    let dst_offset = alloc.head_offset(dst)?;
    api.copy_block(ctx.device, src_buffer, src_offset, dst_buffer, dst_offset, size)
        .map_err(device_failure)
}

/// An aliased sub-region; freed with [`device_release_crop`], never with
/// [`device_free`].
pub fn device_crop(
    alloc: &mut MemoryAllocator,
    region: Region,
    offset: u64,
    size: u64,
) -> DeviceResult<Region> {
    alloc.crop(region, offset, size)
}

/// A crop covering `count` elements starting at an element index.
pub fn device_slice(
    alloc: &mut MemoryAllocator,
    region: Region,
    elem_bytes: u64,
    first: u64,
    count: u64,
) -> DeviceResult<Region> {
    alloc.crop(region, first * elem_bytes, count * elem_bytes)
}

pub fn device_release_crop(alloc: &mut MemoryAllocator, region: Region) -> DeviceResult<()> {
    alloc.destroy_crop(region)
}

/// Wait for everything submitted to the queue.
pub fn device_sync(api: &dyn DeviceApi, guard: &ContextGuard<'_>) -> DeviceResult<()> {
    api.queue_wait_idle(guard.context().queue)
        .map_err(device_failure)
}

/// Adopt a caller-owned native buffer as a region.
pub fn wrap(
    alloc: &mut MemoryAllocator,
    buffer: BufferHandle,
    size: u64,
    request: MemoryRequest,
) -> Region {
    alloc.wrap(buffer, size, request)
}

/// Release a wrapped region back to the caller.
pub fn detach(alloc: &mut MemoryAllocator, region: Region) -> DeviceResult<BufferHandle> {
    alloc.detach(region)
}

pub fn get_native(alloc: &MemoryAllocator, region: Region) -> DeviceResult<BufferHandle> {
    alloc.native_handle(region)
}

/// Free every released-but-cached device allocation.
pub fn release_unused_device_allocations(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    alloc: &mut MemoryAllocator,
) -> u64 {
    alloc.collect(api, guard.context())
}

/// Tear down everything the runtime holds for this device: cached kernels
/// and pooled allocations.
pub fn device_release(
    api: &dyn DeviceApi,
    guard: &ContextGuard<'_>,
    cache: &mut CompilationCache,
    alloc: &mut MemoryAllocator,
) {
    cache.clear_device(api, guard.context());
    alloc.collect(api, guard.context());
}

fn write_bytes(
    api: &dyn DeviceApi,
    ctx: &crate::device::DeviceContext,
    buffer: BufferHandle,
    data: &[u8],
) -> DeviceResult<()> {
    let ptr = api
        .map_block(ctx.device, buffer, 0, data.len() as u64)
        .map_err(device_failure)?;
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }
    api.unmap_block(ctx.device, buffer);
    Ok(())
}
