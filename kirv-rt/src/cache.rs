//! Content-addressed compilation cache.
//!
//! One entry per `(device, module fingerprint)`. An entry owns the loaded
//! shader module plus, per entry point, the descriptor-set layout, pipeline
//! layout, compute pipeline, descriptor pool and set, and the scalar
//! argument uniform buffer. Entries are created on first use and reused
//! across dispatches while the fingerprint matches.
use std::hash::Hasher;

use fnv::{FnvHashMap as HashMap, FnvHasher};
use kirv_core::KernelModule;

use crate::device::{
    BufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DeviceApi, DeviceContext, PipelineHandle, PipelineLayoutHandle, ShaderModuleHandle,
};
use crate::status::{DeviceResult, Status};

/// Stable fingerprint of a compiled module's words.
pub fn fingerprint(words: &[u32]) -> u64 {
    let mut hasher = FnvHasher::default();
    for word in words {
        hasher.write_u32(*word);
    }
    hasher.finish()
}

/// Everything one entry point needs to dispatch.
pub struct EntryPointResources {
    pub name: String,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
    pub set_layout: DescriptorSetLayoutHandle,
    pub pipeline_layout: PipelineLayoutHandle,
    pub pipeline: PipelineHandle,
    pub descriptor_pool: DescriptorPoolHandle,
    pub descriptor_set: DescriptorSetHandle,
    /// Created at first dispatch, sized by the caller's scalar arguments.
    pub uniform_buffer: Option<(BufferHandle, u64)>,
}

pub struct KernelEntry {
    pub shader_module: ShaderModuleHandle,
    pub entry_points: Vec<EntryPointResources>,
}

impl KernelEntry {
    /// Look up an entry point compiled into this module. Asking for a name
    /// that was never compiled is a caller bug and aborts.
    pub fn entry_point(&mut self, name: &str) -> &mut EntryPointResources {
        match self.entry_points.iter_mut().find(|e| e.name == name) {
            Some(resources) => resources,
            None => panic!("kernel entry point {:?} was never compiled", name),
        }
    }
}

#[derive(Default)]
pub struct CompilationCache {
    entries: HashMap<(u64, u64), KernelEntry>,
}

impl CompilationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ctx: &DeviceContext, words: &[u32]) -> bool {
        self.entries
            .contains_key(&(ctx.device.0, fingerprint(words)))
    }

    /// The cache entry for a compiled module, created on first use. The
    /// side-car header is parsed here; the SPIR-V body goes to the driver
    /// verbatim.
    pub fn get_or_create(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        words: &[u32],
    ) -> DeviceResult<&mut KernelEntry> {
        let key = (ctx.device.0, fingerprint(words));
        // Entry-API dance: building the entry can fail halfway, so assemble
        // it fully before inserting.
        if !self.entries.contains_key(&key) {
            let entry = create_entry(api, ctx, words)?;
            log::debug!(
                "compiled module {:#018x} with {} entry points",
                key.1,
                entry.entry_points.len()
            );
            self.entries.insert(key, entry);
        }
        Ok(self.entries.get_mut(&key).unwrap())
    }

    /// Drop a module's entry and destroy its device resources.
    pub fn remove(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        words: &[u32],
    ) -> DeviceResult<()> {
        let key = (ctx.device.0, fingerprint(words));
        let entry = self.entries.remove(&key).ok_or(Status::BadFingerprint)?;
        for resources in &entry.entry_points {
            if let Some((buffer, _)) = resources.uniform_buffer {
                api.free_block(ctx.device, buffer);
            }
        }
        api.destroy_shader_module(ctx.device, entry.shader_module);
        Ok(())
    }

    /// Drop every entry for the context's device.
    pub fn clear_device(&mut self, api: &dyn DeviceApi, ctx: &DeviceContext) {
        let keys: Vec<(u64, u64)> = self
            .entries
            .keys()
            .filter(|(device, _)| *device == ctx.device.0)
            .copied()
            .collect();
        for key in keys {
            let entry = self.entries.remove(&key).unwrap();
            for resources in &entry.entry_points {
                if let Some((buffer, _)) = resources.uniform_buffer {
                    api.free_block(ctx.device, buffer);
                }
            }
            api.destroy_shader_module(ctx.device, entry.shader_module);
        }
    }
}

fn create_entry(
    api: &dyn DeviceApi,
    ctx: &DeviceContext,
    words: &[u32],
) -> DeviceResult<KernelEntry> {
    let module = KernelModule::decode(words).map_err(|err| {
        log::warn!("module header rejected: {:#}", err);
        Status::BadFingerprint
    })?;
    let shader_module = api
        .create_shader_module(ctx.device, module.body.words())
        .map_err(crate::device::device_failure)?;

    let mut entry_points = Vec::with_capacity(module.header.entry_points.len());
    for header in &module.header.entry_points {
        let resources = (|| -> crate::error::Result<EntryPointResources> {
            let set_layout = api.create_descriptor_set_layout(
                ctx.device,
                header.uniform_buffer_count,
                header.storage_buffer_count,
            )?;
            let pipeline_layout = api.create_pipeline_layout(ctx.device, set_layout)?;
            let pipeline = api.create_compute_pipeline(
                ctx.device,
                pipeline_layout,
                shader_module,
                &header.name,
            )?;
            let descriptor_pool = api.create_descriptor_pool(
                ctx.device,
                header.uniform_buffer_count,
                header.storage_buffer_count,
            )?;
            let descriptor_set = api.allocate_descriptor_set(ctx.device, descriptor_pool, set_layout)?;
            Ok(EntryPointResources {
                name: header.name.clone(),
                uniform_buffer_count: header.uniform_buffer_count,
                storage_buffer_count: header.storage_buffer_count,
                set_layout,
                pipeline_layout,
                pipeline,
                descriptor_pool,
                descriptor_set,
                uniform_buffer: None,
            })
        })();
        match resources {
            Ok(resources) => entry_points.push(resources),
            Err(err) => {
                // Reclaim the half-built entry before surfacing the error.
                api.destroy_shader_module(ctx.device, shader_module);
                return Err(crate::device::device_failure(err));
            }
        }
    }
    Ok(KernelEntry {
        shader_module,
        entry_points,
    })
}
