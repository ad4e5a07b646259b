//! SPIR-V back end: module builder and compute shader emitter.
//!
//! [`builder::SpvBuilder`] is a data-only service that assembles a
//! well-formed SPIR-V module with deduplicated ids. [`emit`] walks lowered
//! kernel IR, drives the builder, and produces a [`kirv_core::KernelModule`]
//! whose side-car header tells the runtime how many uniform and storage
//! buffers each entry point binds.
pub use spirv;

pub mod builder;
pub mod emit;

pub use builder::{Id, IdKind, SpvBuilder};
pub use emit::{emit, IrModule, Kernel, KernelArg};

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, ensure, Error, Result};
}
