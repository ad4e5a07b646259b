//! Host runtime surface for compiled kernel modules.
//!
//! The raw device API is a trait ([`device::DeviceApi`]) mirroring the
//! command-buffer interface the kernels run against; concrete backends live
//! with the embedder. Everything above it is provided here: the process-wide
//! device context and its spinlock, the block-reusing memory allocator, the
//! content-addressed compilation cache, and the synchronous dispatch path.
pub mod alloc;
pub mod cache;
pub mod device;
pub mod dispatch;
pub mod status;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use alloc::{MemoryAllocator, MemoryCaching, MemoryRequest, MemoryUsage, MemoryVisibility, Region};
pub use cache::CompilationCache;
pub use device::{ContextGuard, DeviceApi, DeviceContext, SharedContext};
pub use status::{DeviceResult, Status};

/// Error infrastructure for internal plumbing; the public surface speaks
/// [`status::Status`] codes.
pub mod error {
    pub use anyhow::{anyhow, bail, ensure, Error, Result};
}
