//! Runtime surface behavior against the in-memory backend.
use kirv_core::binary::{SpirvBinary, SpirvHeader};
use kirv_core::header::{EntryPointHeader, ModuleHeader};
use kirv_core::KernelModule;
use kirv_rt::dispatch;
use kirv_rt::testing::MockDevice;
use kirv_rt::{
    CompilationCache, MemoryAllocator, MemoryCaching, MemoryRequest, MemoryUsage,
    MemoryVisibility, SharedContext, Status,
};
use pretty_assertions::assert_eq;

fn module_words(entries: &[(&str, u32, u32)]) -> Vec<u32> {
    let module = KernelModule {
        header: ModuleHeader {
            entry_points: entries
                .iter()
                .map(|(name, ub, sb)| EntryPointHeader {
                    name: (*name).to_owned(),
                    uniform_buffer_count: *ub,
                    storage_buffer_count: *sb,
                })
                .collect(),
        },
        body: SpirvBinary::from(SpirvHeader::with_bound(8).words().to_vec()),
    };
    module.encode()
}

fn request(size: u64) -> MemoryRequest {
    MemoryRequest {
        size,
        usage: MemoryUsage::TransferSrcDst,
        caching: MemoryCaching::Coherent,
        visibility: MemoryVisibility::HostToDevice,
    }
}

struct Harness {
    api: MockDevice,
    shared: SharedContext,
    cache: CompilationCache,
    alloc: MemoryAllocator,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let api = MockDevice::new();
        let shared = SharedContext::new(api.context());
        Harness {
            api,
            shared,
            cache: CompilationCache::new(),
            alloc: MemoryAllocator::new(),
        }
    }
}

#[test]
fn dispatch_records_blocks_and_buffers() {
    let mut h = Harness::new();
    let words = module_words(&[("f", 0, 1)]);
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(64)).unwrap();
    dispatch::run(
        &h.api,
        &guard,
        &mut h.cache,
        &mut h.alloc,
        &words,
        "f",
        &[],
        &[region],
        (4, 1, 1),
    )
    .unwrap();
    drop(guard);

    let dispatches = h.api.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].entry_name, "f");
    assert_eq!(dispatches[0].blocks, (4, 1, 1));
    assert_eq!(dispatches[0].storage_buffers.len(), 1);
    assert_eq!(dispatches[0].uniform_buffer, None);
}

#[test]
fn cache_entries_are_reused_across_dispatches() {
    let mut h = Harness::new();
    let words = module_words(&[("f", 0, 1)]);
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(16)).unwrap();
    for _ in 0..3 {
        dispatch::run(
            &h.api,
            &guard,
            &mut h.cache,
            &mut h.alloc,
            &words,
            "f",
            &[],
            &[region],
            (1, 1, 1),
        )
        .unwrap();
    }
    assert_eq!(h.cache.len(), 1);
    assert_eq!(h.api.shader_modules_created(), 1);
    assert_eq!(h.api.dispatches().len(), 3);
}

#[test]
fn scalar_args_land_in_the_uniform_buffer() {
    let mut h = Harness::new();
    let words = module_words(&[("scale", 1, 1)]);
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(16)).unwrap();
    let args = 42i32.to_le_bytes();
    dispatch::run(
        &h.api,
        &guard,
        &mut h.cache,
        &mut h.alloc,
        &words,
        "scale",
        &args,
        &[region],
        (1, 1, 1),
    )
    .unwrap();
    let record = &h.api.dispatches()[0];
    let uniform = record.uniform_buffer.expect("no uniform buffer bound");
    assert_eq!(h.api.block_bytes(uniform), args.to_vec());
}

#[test]
#[should_panic(expected = "never compiled")]
fn unknown_entry_point_aborts() {
    let mut h = Harness::new();
    let words = module_words(&[("f", 0, 0)]);
    let guard = h.shared.acquire();
    let _ = dispatch::run(
        &h.api,
        &guard,
        &mut h.cache,
        &mut h.alloc,
        &words,
        "g",
        &[],
        &[],
        (1, 1, 1),
    );
}

#[test]
fn wrong_buffer_count_is_an_argument_error() {
    let mut h = Harness::new();
    let words = module_words(&[("f", 0, 2)]);
    let guard = h.shared.acquire();
    let result = dispatch::run(
        &h.api,
        &guard,
        &mut h.cache,
        &mut h.alloc,
        &words,
        "f",
        &[],
        &[],
        (1, 1, 1),
    );
    assert_eq!(result.unwrap_err(), Status::InvalidArgument);
}

#[test]
fn released_regions_are_reused_not_reallocated() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let first = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(256)).unwrap();
    assert_eq!(h.api.live_blocks(), 1);
    dispatch::device_free(&mut h.alloc, first).unwrap();
    let second = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(128)).unwrap();
    // Compatible shape, enough room: same block comes back.
    assert_eq!(first, second);
    assert_eq!(h.api.live_blocks(), 1);
}

#[test]
fn collect_frees_released_blocks() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(256)).unwrap();
    dispatch::device_free(&mut h.alloc, region).unwrap();
    let freed = dispatch::release_unused_device_allocations(&h.api, &guard, &mut h.alloc);
    assert_eq!(freed, 256);
    assert_eq!(h.api.live_blocks(), 0);
}

#[test]
fn exhausted_device_surfaces_out_of_memory() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    h.api.fail_next_allocation();
    let result = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(64));
    assert_eq!(result.unwrap_err(), Status::OutOfMemory);
}

#[test]
fn host_visible_allocations_are_mappable() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let region = dispatch::device_and_host_malloc(&h.api, &guard, &mut h.alloc, 8).unwrap();
    dispatch::copy_to_device(&h.api, &guard, &mut h.alloc, region, &[1; 8]).unwrap();
    dispatch::device_and_host_free(&mut h.alloc, region).unwrap();
}

#[test]
fn host_copies_round_trip() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(8)).unwrap();
    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    dispatch::copy_to_device(&h.api, &guard, &mut h.alloc, region, &payload).unwrap();
    let mut back = [0u8; 8];
    dispatch::copy_to_host(&h.api, &guard, &mut h.alloc, region, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn buffer_copy_moves_device_bytes() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let src = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(4)).unwrap();
    let dst = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(4)).unwrap();
    dispatch::copy_to_device(&h.api, &guard, &mut h.alloc, src, &[9, 8, 7, 6]).unwrap();
    dispatch::buffer_copy(&h.api, &guard, &mut h.alloc, src, dst, 4).unwrap();
    let mut back = [0u8; 4];
    dispatch::copy_to_host(&h.api, &guard, &mut h.alloc, dst, &mut back).unwrap();
    assert_eq!(back, [9, 8, 7, 6]);
}

#[test]
fn crops_alias_their_owner() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(16)).unwrap();
    dispatch::copy_to_device(
        &h.api,
        &guard,
        &mut h.alloc,
        region,
        &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    )
    .unwrap();
    let crop = dispatch::device_crop(&mut h.alloc, region, 4, 8).unwrap();
    assert_eq!(h.alloc.owner_of(crop).unwrap(), region);
    assert_eq!(h.alloc.head_offset(crop).unwrap(), 4);

    let mut window = [0u8; 8];
    dispatch::copy_to_host(&h.api, &guard, &mut h.alloc, crop, &mut window).unwrap();
    assert_eq!(window, [4, 5, 6, 7, 8, 9, 10, 11]);

    dispatch::device_release_crop(&mut h.alloc, crop).unwrap();
    // Releasing the crop leaves the owner usable.
    assert!(h.alloc.native_handle(region).is_ok());
    // A crop is not a real allocation.
    assert_eq!(
        dispatch::device_release_crop(&mut h.alloc, region).unwrap_err(),
        Status::InvalidArgument
    );
}

#[test]
fn slices_are_element_granular_crops() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let region = dispatch::device_malloc(&h.api, &guard, &mut h.alloc, request(16)).unwrap();
    let slice = dispatch::device_slice(&mut h.alloc, region, 4, 1, 2).unwrap();
    assert_eq!(h.alloc.head_offset(slice).unwrap(), 4);
    assert_eq!(h.alloc.size_of(slice).unwrap(), 8);
}

#[test]
fn wrap_and_detach_do_not_own_the_native_handle() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    // A block the caller owns directly.
    let native = {
        use kirv_rt::DeviceApi;
        h.api.allocate_block(guard.context().device, 32).unwrap()
    };
    let region = dispatch::wrap(&mut h.alloc, native, 32, request(32));
    assert_eq!(dispatch::get_native(&h.alloc, region).unwrap(), native);
    let returned = dispatch::detach(&mut h.alloc, region).unwrap();
    assert_eq!(returned, native);
    // Detaching never freed the block.
    assert_eq!(h.api.live_blocks(), 1);
}

#[test]
fn finalize_kernels_drops_the_cache_entry() {
    let mut h = Harness::new();
    let words = module_words(&[("f", 0, 0)]);
    let guard = h.shared.acquire();
    dispatch::initialize_kernels(&h.api, &guard, &mut h.cache, &words).unwrap();
    assert_eq!(h.cache.len(), 1);
    dispatch::finalize_kernels(&h.api, &guard, &mut h.cache, &words).unwrap();
    assert!(h.cache.is_empty());
    assert_eq!(
        dispatch::finalize_kernels(&h.api, &guard, &mut h.cache, &words).unwrap_err(),
        Status::BadFingerprint
    );
}

#[test]
fn garbage_module_words_are_rejected() {
    let mut h = Harness::new();
    let guard = h.shared.acquire();
    let result = dispatch::initialize_kernels(&h.api, &guard, &mut h.cache, &[7, 7, 7]);
    assert!(result.is_err());
}
