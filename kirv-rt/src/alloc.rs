//! Device memory allocator with block reuse.
//!
//! `reserve` hands out regions backed by device blocks; `release` returns a
//! region's block to the free pool, `reclaim` destroys it outright.
//! Cropping produces aliased regions that carry a `head_offset` into their
//! owning allocation and never own memory themselves. `collect` frees every
//! unused block. The allocator is only touched while the device context is
//! held, so it carries no locking of its own.
use fnv::FnvHashMap as HashMap;

use crate::device::{BufferHandle, DeviceApi, DeviceContext};
use crate::status::{DeviceResult, Status};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryUsage {
    TransferSrc,
    TransferDst,
    TransferSrcDst,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryCaching {
    Cached,
    Uncached,
    Coherent,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryVisibility {
    DeviceOnly,
    HostToDevice,
    DeviceToHost,
    HostToHost,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MemoryRequest {
    pub size: u64,
    pub usage: MemoryUsage,
    pub caching: MemoryCaching,
    pub visibility: MemoryVisibility,
}

/// An allocator-issued region ticket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Region(u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegionState {
    InUse,
    Free,
    Mapped,
}

struct RegionInfo {
    buffer: BufferHandle,
    size: u64,
    request: MemoryRequest,
    /// Offset of this region within its owning allocation.
    head_offset: u64,
    /// The region that owns the device block; self for real allocations.
    owner: Region,
    /// Crops alias their owner's memory and never free it.
    is_crop: bool,
    /// Wrapped native handles are not ours to free.
    owned: bool,
    state: RegionState,
}

#[derive(Default)]
pub struct MemoryAllocator {
    regions: HashMap<u64, RegionInfo>,
    next_region: u64,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, info: RegionInfo) -> Region {
        self.next_region += 1;
        let region = Region(self.next_region);
        self.regions.insert(region.0, info);
        region
    }

    fn info(&self, region: Region) -> DeviceResult<&RegionInfo> {
        self.regions.get(&region.0).ok_or(Status::NotFound)
    }

    fn info_mut(&mut self, region: Region) -> DeviceResult<&mut RegionInfo> {
        self.regions.get_mut(&region.0).ok_or(Status::NotFound)
    }

    /// Hand out a region satisfying `request`, reusing a released block of
    /// compatible shape when one exists.
    pub fn reserve(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        request: MemoryRequest,
    ) -> DeviceResult<Region> {
        if request.size == 0 {
            return Err(Status::InvalidArgument);
        }
        let reusable = self
            .regions
            .iter()
            .filter(|(_, info)| {
                info.state == RegionState::Free
                    && !info.is_crop
                    && info.size >= request.size
                    && info.request.usage == request.usage
                    && info.request.caching == request.caching
                    && info.request.visibility == request.visibility
            })
            .min_by_key(|(_, info)| info.size)
            .map(|(id, _)| Region(*id));
        if let Some(region) = reusable {
            log::debug!("reusing region {:?} for {} bytes", region, request.size);
            self.info_mut(region)?.state = RegionState::InUse;
            return Ok(region);
        }
        let buffer = api
            .allocate_block(ctx.device, request.size)
            .map_err(|err| {
                log::warn!("device allocation of {} bytes failed: {:#}", request.size, err);
                Status::OutOfMemory
            })?;
        let region = self.insert(RegionInfo {
            buffer,
            size: request.size,
            request,
            head_offset: 0,
            owner: Region(self.next_region + 1),
            is_crop: false,
            owned: true,
            state: RegionState::InUse,
        });
        // A fresh allocation owns itself.
        self.info_mut(region).unwrap().owner = region;
        Ok(region)
    }

    /// Return the region's block to the pool for reuse.
    pub fn release(&mut self, region: Region) -> DeviceResult<()> {
        let info = self.info_mut(region)?;
        if info.state == RegionState::Mapped {
            return Err(Status::InvalidArgument);
        }
        info.state = RegionState::Free;
        Ok(())
    }

    /// Destroy the region's block immediately; it is never reused.
    pub fn reclaim(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        region: Region,
    ) -> DeviceResult<()> {
        let info = self.regions.remove(&region.0).ok_or(Status::NotFound)?;
        if info.is_crop {
            return Err(Status::InvalidArgument);
        }
        if info.owned {
            api.free_block(ctx.device, info.buffer);
        }
        Ok(())
    }

    /// Map the region's bytes; must be paired with [`MemoryAllocator::unmap`].
    pub fn map(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        region: Region,
    ) -> DeviceResult<*mut u8> {
        let (buffer, offset, size) = {
            let info = self.info(region)?;
            if info.state == RegionState::Mapped {
                return Err(Status::InvalidArgument);
            }
            (info.buffer, info.head_offset, info.size)
        };
        let ptr = api
            .map_block(ctx.device, buffer, offset, size)
            .map_err(crate::device::device_failure)?;
        self.info_mut(region)?.state = RegionState::Mapped;
        Ok(ptr)
    }

    pub fn unmap(
        &mut self,
        api: &dyn DeviceApi,
        ctx: &DeviceContext,
        region: Region,
    ) -> DeviceResult<()> {
        let info = self.info_mut(region)?;
        if info.state != RegionState::Mapped {
            return Err(Status::InvalidArgument);
        }
        info.state = RegionState::InUse;
        let buffer = info.buffer;
        api.unmap_block(ctx.device, buffer);
        Ok(())
    }

    /// The region that owns `region`'s device block.
    pub fn owner_of(&self, region: Region) -> DeviceResult<Region> {
        Ok(self.info(region)?.owner)
    }

    /// An aliased sub-region starting `offset` bytes into `region`.
    pub fn crop(&mut self, region: Region, offset: u64, size: u64) -> DeviceResult<Region> {
        let (buffer, head_offset, parent_size, request, owner) = {
            let info = self.info(region)?;
            (
                info.buffer,
                info.head_offset,
                info.size,
                info.request,
                info.owner,
            )
        };
        if offset + size > parent_size {
            return Err(Status::InvalidArgument);
        }
        Ok(self.insert(RegionInfo {
            buffer,
            size,
            request,
            head_offset: head_offset + offset,
            owner,
            is_crop: true,
            owned: false,
            state: RegionState::InUse,
        }))
    }

    /// Drop a crop alias; the owning allocation is untouched.
    pub fn destroy_crop(&mut self, region: Region) -> DeviceResult<()> {
        let info = self.info(region)?;
        if !info.is_crop {
            return Err(Status::InvalidArgument);
        }
        self.regions.remove(&region.0);
        Ok(())
    }

    /// Adopt a native buffer the caller owns. Never freed by the allocator.
    pub fn wrap(&mut self, buffer: BufferHandle, size: u64, request: MemoryRequest) -> Region {
        let region = self.insert(RegionInfo {
            buffer,
            size,
            request,
            head_offset: 0,
            owner: Region(self.next_region + 1),
            is_crop: false,
            owned: false,
            state: RegionState::InUse,
        });
        self.info_mut(region).unwrap().owner = region;
        region
    }

    /// Forget a wrapped region, returning its native handle.
    pub fn detach(&mut self, region: Region) -> DeviceResult<BufferHandle> {
        let info = self.info(region)?;
        if info.owned {
            return Err(Status::InvalidArgument);
        }
        let buffer = info.buffer;
        self.regions.remove(&region.0);
        Ok(buffer)
    }

    pub fn native_handle(&self, region: Region) -> DeviceResult<BufferHandle> {
        Ok(self.info(region)?.buffer)
    }

    pub fn head_offset(&self, region: Region) -> DeviceResult<u64> {
        Ok(self.info(region)?.head_offset)
    }

    pub fn size_of(&self, region: Region) -> DeviceResult<u64> {
        Ok(self.info(region)?.size)
    }

    /// Free every released block.
    pub fn collect(&mut self, api: &dyn DeviceApi, ctx: &DeviceContext) -> u64 {
        let free_ids: Vec<u64> = self
            .regions
            .iter()
            .filter(|(_, info)| info.state == RegionState::Free && !info.is_crop)
            .map(|(id, _)| *id)
            .collect();
        let mut freed_bytes = 0;
        for id in free_ids {
            let info = self.regions.remove(&id).unwrap();
            if info.owned {
                api.free_block(ctx.device, info.buffer);
                freed_bytes += info.size;
            }
        }
        log::debug!("collected {} bytes of unused device allocations", freed_bytes);
        freed_bytes
    }

    pub fn regions_in_use(&self) -> usize {
        self.regions
            .values()
            .filter(|info| info.state != RegionState::Free)
            .count()
    }
}
