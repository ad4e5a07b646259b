pub use spirv;

pub mod binary;
pub mod header;

pub use binary::{InstrIter, InstrView, Instruction, InstructionBuilder, SpirvBinary, SpirvHeader};
pub use header::{EntryPointHeader, KernelModule, ModuleHeader};

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, ensure, Error, Result};
}
