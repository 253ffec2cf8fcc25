//! Integration tests for the frame pipeline, driven against the mock device.

use inflight_backend::{Backend, BackendError, SlotState};
use inflight_core::BackendConfig;
use inflight_rhi::gpu::{DescriptorHeapKind, QueueKind};
use inflight_rhi::indirect::{DispatchArguments, IndirectDispatchCommand};
use inflight_rhi::mock::{MockDevice, MockSwapchain, WaitBehavior};
use inflight_rhi::resource::{
    BufferResourceDesc, BufferUsage, TextureFormat, TextureResourceDesc, TextureState,
    TextureUsage,
};

fn backend(frames: u32) -> (MockDevice, Backend<MockDevice>) {
    inflight_core::init_test_logging();
    let device = MockDevice::new();
    let backend = Backend::new(device.clone(), BackendConfig::with_frames(frames))
        .expect("Failed to create backend");
    (device, backend)
}

fn vertex_desc(name: &str) -> BufferResourceDesc {
    BufferResourceDesc::new(name, BufferUsage::Vertex, 256)
}

fn run_frame(backend: &mut Backend<MockDevice>, frame: u64) {
    backend.begin_frame(frame).expect("begin_frame");
    backend.end_frame().expect("end_frame");
}

fn released(device: &MockDevice, name: &str) -> bool {
    device.released_names().iter().any(|n| n == name)
}

// =============================================================================
// Deferred destruction
// =============================================================================

#[test]
fn test_destroyed_buffer_released_only_after_slot_revisit() {
    for frames in 1..=8u32 {
        let (device, mut backend) = backend(frames);
        let victim = backend.create_buffer(&vertex_desc("victim")).unwrap();

        backend.begin_frame(1).unwrap();
        backend.destroy_buffer(victim);
        backend.end_frame().unwrap();

        for frame in 2..=u64::from(frames) {
            backend.begin_frame(frame).unwrap();
            assert!(
                !released(&device, "victim"),
                "released early with {} slot(s) at frame {}",
                frames,
                frame
            );
            backend.end_frame().unwrap();
        }

        backend.begin_frame(u64::from(frames) + 1).unwrap();
        assert!(
            released(&device, "victim"),
            "not released after a full ring of {} slot(s)",
            frames
        );
        assert!(backend.completed_frame_value().unwrap() >= 1);
        backend.end_frame().unwrap();
    }
}

#[test]
fn test_live_count_round_trip() {
    for frames in [2u32, 3, 4] {
        let (device, mut backend) = backend(frames);
        let baseline = backend.live_resource_count();

        backend.begin_frame(1).unwrap();
        let handle = backend.create_buffer(&vertex_desc("transient")).unwrap();
        backend.destroy_buffer(handle);
        assert_eq!(backend.live_resource_count(), baseline + 1);
        backend.end_frame().unwrap();

        // N - 1 further cycles: still alive.
        for frame in 2..=u64::from(frames) {
            run_frame(&mut backend, frame);
            assert_eq!(backend.live_resource_count(), baseline + 1);
        }

        backend.begin_frame(u64::from(frames) + 1).unwrap();
        assert_eq!(backend.live_resource_count(), baseline);
        assert_eq!(device.live_buffers(), 0);
        backend.end_frame().unwrap();
    }
}

#[test]
fn test_destroy_between_frames_waits_a_full_ring() {
    let (device, mut backend) = backend(2);
    let handle = backend.create_buffer(&vertex_desc("late")).unwrap();
    run_frame(&mut backend, 1);
    backend.destroy_buffer(handle);

    // Adopted by slot 1, released when slot 1 is next revisited.
    run_frame(&mut backend, 2);
    run_frame(&mut backend, 3);
    assert!(!released(&device, "late"));
    backend.begin_frame(4).unwrap();
    assert!(released(&device, "late"));
    backend.end_frame().unwrap();
}

#[test]
fn test_textures_are_deferred_too() {
    let (device, mut backend) = backend(2);
    let desc = TextureResourceDesc::new_2d(
        "shadow map",
        TextureUsage::DepthStencil,
        TextureFormat::Depth32Float,
        128,
        128,
    );
    let texture = backend.create_texture(&desc).unwrap();

    backend.begin_frame(1).unwrap();
    backend.destroy_texture(texture);
    backend.end_frame().unwrap();
    run_frame(&mut backend, 2);
    assert_eq!(device.live_textures(), 1);

    backend.begin_frame(3).unwrap();
    assert_eq!(device.live_textures(), 0);
    backend.end_frame().unwrap();
}

#[test]
fn test_new_textures_move_to_their_usage_state() {
    let (device, mut backend) = backend(2);
    let target = backend
        .create_texture(&TextureResourceDesc::new_2d(
            "gbuffer",
            TextureUsage::RenderTarget,
            TextureFormat::Rgba16Float,
            64,
            64,
        ))
        .unwrap();

    backend.begin_frame(1).unwrap();
    let sampled = backend
        .create_texture(&TextureResourceDesc::new_2d(
            "albedo",
            TextureUsage::Sampled,
            TextureFormat::Rgba8Unorm,
            32,
            32,
        ))
        .unwrap();
    backend.end_frame().unwrap();
    device.run_until_idle();

    assert_eq!(
        device.transitions(),
        vec![
            (
                "gbuffer".to_string(),
                TextureState::Undefined,
                TextureState::RenderTarget
            ),
            (
                "albedo".to_string(),
                TextureState::Undefined,
                TextureState::Common
            ),
        ]
    );
    assert_eq!(
        backend.texture(target).unwrap().state(),
        TextureState::RenderTarget
    );
    assert_eq!(backend.texture(sampled).unwrap().state(), TextureState::Common);
    assert_eq!(device.executed_lists().len(), 2);
}

// =============================================================================
// Frame synchronization
// =============================================================================

#[test]
fn test_two_frame_pipeline_blocks_on_third_frame() {
    let (device, mut backend) = backend(2);
    let doomed = backend.create_buffer(&vertex_desc("doomed")).unwrap();

    backend.begin_frame(1).unwrap();
    assert_eq!(backend.current_slot(), 0);
    assert_eq!(device.blocking_waits(), 0);
    let list_a = backend.acquire_named(QueueKind::Direct, "A").unwrap();
    backend.submit(list_a).unwrap();
    backend.destroy_buffer(doomed);
    backend.end_frame().unwrap();
    assert_eq!(backend.slot_state(0), SlotState::Retiring);

    backend.begin_frame(2).unwrap();
    assert_eq!(backend.current_slot(), 1);
    assert_eq!(device.blocking_waits(), 0);
    let list_b = backend.acquire_named(QueueKind::Direct, "B").unwrap();
    backend.submit(list_b).unwrap();
    backend.end_frame().unwrap();

    assert!(!released(&device, "doomed"));
    backend.begin_frame(3).unwrap();
    assert_eq!(backend.current_slot(), 0);
    assert_eq!(device.blocking_waits(), 1);
    assert!(backend.completed_frame_value().unwrap() >= 1);
    assert!(released(&device, "doomed"));

    let stats = backend.stats();
    assert_eq!(stats.free_allocators, 1, "A's allocator is reclaimed");
    assert_eq!(stats.in_flight_lists, 1, "B is still in flight");
    backend.end_frame().unwrap();
}

#[test]
fn test_timed_out_wait_is_fatal_and_reclaims_nothing() {
    let (device, mut backend) = backend(2);
    let doomed = backend.create_buffer(&vertex_desc("doomed")).unwrap();
    backend.begin_frame(1).unwrap();
    backend.destroy_buffer(doomed);
    backend.end_frame().unwrap();
    run_frame(&mut backend, 2);

    device.set_wait_behavior(WaitBehavior::TimeOut);
    let err = backend.begin_frame(3).unwrap_err();
    assert!(matches!(err, BackendError::WaitFailed { value: 1, .. }));
    assert!(err.is_fatal());
    assert!(!released(&device, "doomed"));
    assert_eq!(backend.stats().pending_destructions, 1);

    device.set_wait_behavior(WaitBehavior::AutoComplete);
    assert!(matches!(
        backend.begin_frame(3),
        Err(BackendError::Poisoned(_))
    ));
}

#[test]
fn test_poll_retired_is_non_blocking() {
    let (device, mut backend) = backend(3);
    run_frame(&mut backend, 1);
    run_frame(&mut backend, 2);

    assert_eq!(backend.poll_retired().unwrap(), 0);
    device.run_until_idle();
    assert_eq!(backend.poll_retired().unwrap(), 2);
    assert_eq!(backend.slot_state(0), SlotState::Free);
    assert_eq!(device.blocking_waits(), 0);
}

#[test]
fn test_wait_idle_reclaims_every_slot() {
    let (device, mut backend) = backend(3);
    for frame in 1..=3 {
        backend.begin_frame(frame).unwrap();
        let staging = backend.get_staging_buffer(64, 256).unwrap();
        backend.return_staging_buffer(staging);
        backend.end_frame().unwrap();
    }
    assert_eq!(backend.stats().staging_returned, 3);

    backend.wait_idle().unwrap();
    let stats = backend.stats();
    assert_eq!(stats.staging_returned, 0);
    assert_eq!(stats.staging_free, 3);
    assert_eq!(stats.in_flight_lists, 0);
    assert_eq!(device.queued_ops(QueueKind::Direct), 0);
}

// =============================================================================
// Staging and scratch pools
// =============================================================================

#[test]
fn test_staging_never_undersized_or_misaligned() {
    let (_device, mut backend) = backend(2);
    let requests = [(64u64, 256u64), (1024, 256), (64, 512), (4096, 512), (100, 256)];

    for frame in 1..=6u64 {
        backend.begin_frame(frame).unwrap();
        for &(size, alignment) in &requests {
            let size = size * frame;
            let buffer = backend.get_staging_buffer(size, alignment).unwrap();
            assert!(buffer.size() >= size);
            assert_eq!(buffer.alignment(), alignment);
            assert!(buffer.is_mapped());
            backend.return_staging_buffer(buffer);
        }
        backend.end_frame().unwrap();
    }
}

#[test]
fn test_staging_reused_only_after_retirement() {
    let (device, mut backend) = backend(2);

    backend.begin_frame(1).unwrap();
    let first = backend.get_staging_buffer(256, 256).unwrap();
    assert_eq!(first.name(), "Staging Buffer 0");
    backend.return_staging_buffer(first);
    let second = backend.get_staging_buffer(128, 256).unwrap();
    assert_eq!(second.name(), "Staging Buffer 1");
    backend.return_staging_buffer(second);
    backend.end_frame().unwrap();

    backend.begin_frame(2).unwrap();
    let third = backend.get_staging_buffer(128, 256).unwrap();
    assert_eq!(third.name(), "Staging Buffer 2");
    backend.return_staging_buffer(third);
    backend.end_frame().unwrap();

    backend.begin_frame(3).unwrap();
    assert_eq!(device.blocking_waits(), 1);
    let reused = backend.get_staging_buffer(128, 256).unwrap();
    assert_eq!(reused.name(), "Staging Buffer 0");
    backend.return_staging_buffer(reused);
    backend.end_frame().unwrap();
}

#[test]
fn test_scratch_best_fit_after_retirement() {
    let (_device, mut backend) = backend(1);

    backend.begin_frame(1).unwrap();
    let big = backend.get_scratch_buffer(1 << 20).unwrap();
    let small = backend.get_scratch_buffer(1 << 12).unwrap();
    backend.return_scratch_buffer(big);
    backend.return_scratch_buffer(small);
    let fresh = backend.get_scratch_buffer(1 << 10).unwrap();
    assert_eq!(fresh.name(), "Scratch Buffer 2");
    backend.return_scratch_buffer(fresh);
    backend.end_frame().unwrap();

    backend.begin_frame(2).unwrap();
    let reused = backend.get_scratch_buffer(2048).unwrap();
    assert_eq!(reused.size(), 1 << 12);
    assert_eq!(backend.stats().scratch_free, 2);
    backend.return_scratch_buffer(reused);
    backend.end_frame().unwrap();
}

#[test]
fn test_staging_for_texture_uses_padded_footprint() {
    let (_device, mut backend) = backend(2);
    let desc = TextureResourceDesc::new_2d(
        "albedo",
        TextureUsage::Sampled,
        TextureFormat::Rgba8Unorm,
        100,
        10,
    );
    let staging = backend.get_staging_buffer_for_texture(&desc).unwrap();
    // 400-byte rows padded to 512; the last row is not padded.
    assert_eq!(staging.size(), 512 * 9 + 400);
    assert_eq!(staging.alignment(), 512);
    backend.return_staging_buffer(staging);
}

#[test]
fn test_foreign_buffer_returned_to_staging_is_destroyed() {
    let (device, mut backend) = backend(1);
    backend.begin_frame(1).unwrap();
    let scratch = backend.get_scratch_buffer(64).unwrap();
    backend.return_staging_buffer(scratch);
    assert_eq!(backend.stats().pending_destructions, 1);
    backend.end_frame().unwrap();

    backend.begin_frame(2).unwrap();
    assert!(released(&device, "Scratch Buffer 0"));
    backend.end_frame().unwrap();
}

#[test]
fn test_upload_through_staging() {
    let (device, mut backend) = backend(2);
    let dst = backend
        .create_buffer(&BufferResourceDesc::new(
            "dispatch args",
            BufferUsage::IndirectCommands,
            256,
        ))
        .unwrap();
    let command = IndirectDispatchCommand {
        data_index: 3,
        model_matrix_index: 7,
        entity_id: 42,
        dispatch: DispatchArguments::covering([1000, 1, 1], [64, 1, 1]),
    };

    backend.begin_frame(1).unwrap();
    let mut list = backend.acquire_named(QueueKind::Copy, "upload").unwrap();
    backend
        .upload_to_buffer(&mut list, dst, bytemuck::bytes_of(&command), 0)
        .unwrap();
    let err = backend
        .upload_to_buffer(&mut list, dst, &[0u8; 16], 250)
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidRequest(_)));
    backend.submit(list).unwrap();
    backend.end_frame().unwrap();

    assert_eq!(device.copies_recorded(), 1);
    assert_eq!(backend.stats().staging_returned, 0);
    assert_eq!(backend.stats().staging_in_flight, 1);
}

#[test]
fn test_upload_staging_waits_for_the_slot_that_executes_it() {
    inflight_core::init_test_logging();
    let device = MockDevice::without_copy_queue();
    let mut backend = Backend::new(device.clone(), BackendConfig::with_frames(2)).unwrap();
    let dst = backend.create_buffer(&vertex_desc("vb")).unwrap();

    // Recorded in frame 1 (slot 0), submitted only in frame 2 (slot 1).
    backend.begin_frame(1).unwrap();
    let mut list = backend.acquire_named(QueueKind::Copy, "late upload").unwrap();
    let list_id = list.raw().id();
    backend
        .upload_to_buffer(&mut list, dst, &[7u8; 64], 0)
        .unwrap();
    assert_eq!(list.staging_buffers(), 1);
    backend.end_frame().unwrap();

    backend.begin_frame(2).unwrap();
    backend.submit(list).unwrap();
    backend.end_frame().unwrap();

    // Slot 0 retires; the copy reading the staging buffer has not run yet.
    backend.begin_frame(3).unwrap();
    assert!(!device.executed_lists().iter().any(|(_, id)| *id == list_id));
    let other = backend.get_staging_buffer(64, 256).unwrap();
    assert_eq!(other.name(), "Staging Buffer 1");
    assert_eq!(backend.stats().staging_in_flight, 1);
    backend.return_staging_buffer(other);
    backend.end_frame().unwrap();

    // Slot 1 retires with the copy executed; now the buffer is reusable.
    backend.begin_frame(4).unwrap();
    assert!(device.executed_lists().iter().any(|(_, id)| *id == list_id));
    assert_eq!(backend.stats().staging_in_flight, 0);
    let reused = backend.get_staging_buffer(64, 256).unwrap();
    assert_eq!(reused.name(), "Staging Buffer 0");
    backend.return_staging_buffer(reused);
    backend.end_frame().unwrap();
}

#[test]
fn test_upload_through_list_acquired_between_frames() {
    let (device, mut backend) = backend(2);
    let dst = backend.create_buffer(&vertex_desc("vb")).unwrap();
    let mut early = backend.acquire_command_list(QueueKind::Direct).unwrap();

    backend.begin_frame(1).unwrap();
    backend
        .upload_to_buffer(&mut early, dst, &[1, 2, 3, 4], 0)
        .unwrap();
    backend.submit(early).unwrap();
    backend.end_frame().unwrap();
    assert_eq!(device.copies_recorded(), 1);

    run_frame(&mut backend, 2);
    backend.begin_frame(3).unwrap();
    assert_eq!(backend.stats().staging_in_flight, 0);
    assert_eq!(backend.stats().staging_free, 1);
    backend.end_frame().unwrap();
}

// =============================================================================
// Descriptors
// =============================================================================

#[test]
fn test_descriptor_ranges_never_overlap_and_reuse_after_retirement() {
    let (_device, mut backend) = backend(2);
    let kind = DescriptorHeapKind::CbvSrvUav;

    backend.begin_frame(1).unwrap();
    let ranges: Vec<_> = [4u32, 1, 8, 2, 4]
        .iter()
        .map(|&k| backend.allocate_descriptors(kind, k).unwrap())
        .collect();
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }

    let released = ranges[2];
    backend.release_descriptors(released);
    let before_retire = backend.allocate_descriptors(kind, 8).unwrap();
    assert_ne!(before_retire, released);
    assert!(ranges.iter().all(|r| !r.overlaps(&before_retire)));
    backend.end_frame().unwrap();

    run_frame(&mut backend, 2);
    backend.begin_frame(3).unwrap();
    let reused = backend.allocate_descriptors(kind, 8).unwrap();
    assert_eq!(reused, released);
    backend.end_frame().unwrap();
}

#[test]
fn test_descriptor_exhaustion_returns_none() {
    inflight_core::init_test_logging();
    let mut config = BackendConfig::with_frames(2);
    config.descriptors.dsv = 2;
    let mut backend = Backend::new(MockDevice::new(), config).unwrap();

    assert!(backend.allocate_descriptors(DescriptorHeapKind::Dsv, 2).is_some());
    assert!(backend.allocate_descriptors(DescriptorHeapKind::Dsv, 1).is_none());
    assert!(backend.allocate_descriptors(DescriptorHeapKind::Rtv, 1).is_some());
}

// =============================================================================
// Command submission
// =============================================================================

#[test]
fn test_allocators_never_reset_while_in_flight() {
    let (device, mut backend) = backend(2);
    for frame in 1..=10 {
        backend.begin_frame(frame).unwrap();
        for _ in 0..3 {
            let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
            backend.submit(list).unwrap();
        }
        backend.end_frame().unwrap();
    }
    assert_eq!(device.reset_violations(), 0);
    assert!(device.live_allocators() <= 6);
}

#[test]
fn test_single_slot_blocks_before_reusing_allocator() {
    let (device, mut backend) = backend(1);
    backend.begin_frame(1).unwrap();
    let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
    backend.submit(list).unwrap();
    backend.end_frame().unwrap();

    backend.begin_frame(2).unwrap();
    assert_eq!(device.blocking_waits(), 1);
    let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
    backend.submit(list).unwrap();
    backend.end_frame().unwrap();

    assert_eq!(device.live_allocators(), 1);
    assert_eq!(device.reset_violations(), 0);
}

#[test]
fn test_copy_work_executes_before_direct_work() {
    let (device, mut backend) = backend(2);

    // Submitted between frames: carried into frame 1.
    let carried = backend.acquire_named(QueueKind::Copy, "carried").unwrap();
    let carried_id = carried.raw().id();
    backend.submit(carried).unwrap();

    backend.begin_frame(1).unwrap();
    let direct = backend.acquire_named(QueueKind::Direct, "draw").unwrap();
    let direct_id = direct.raw().id();
    let copy = backend.acquire_named(QueueKind::Copy, "upload").unwrap();
    let copy_id = copy.raw().id();
    backend.submit(direct).unwrap();
    backend.submit(copy).unwrap();
    backend.end_frame().unwrap();

    device.run_until_idle();
    let order: Vec<u64> = device.executed_lists().iter().map(|(_, id)| *id).collect();
    let pos = |id: u64| order.iter().position(|&x| x == id).unwrap();
    assert!(pos(carried_id) < pos(direct_id));
    assert!(pos(copy_id) < pos(direct_id));

    let names: Vec<String> = backend
        .command_history()
        .records()
        .map(|r| r.name.clone())
        .collect();
    assert_eq!(names, vec!["carried", "upload", "draw"]);
}

#[test]
fn test_lists_execute_as_one_batch_at_end_frame() {
    let (device, mut backend) = backend(2);
    backend.begin_frame(1).unwrap();
    for _ in 0..4 {
        let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
        backend.submit(list).unwrap();
    }
    assert_eq!(backend.stats().pending_lists, 4);
    backend.end_frame().unwrap();

    assert_eq!(backend.stats().pending_lists, 0);
    assert_eq!(backend.stats().in_flight_lists, 4);
    device.run_until_idle();
    assert_eq!(device.executed_lists().len(), 4);
}

#[test]
fn test_verification_mode_waits_per_submission() {
    inflight_core::init_test_logging();
    let device = MockDevice::new();
    let mut config = BackendConfig::with_frames(2);
    config.verify_every_submission = true;
    let mut backend = Backend::new(device.clone(), config).unwrap();

    backend.begin_frame(1).unwrap();
    for _ in 0..2 {
        let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
        backend.submit(list).unwrap();
    }
    backend.end_frame().unwrap();

    assert_eq!(device.blocking_waits(), 2);
    assert_eq!(device.executed_lists().len(), 2);
}

#[test]
fn test_close_failure_handling() {
    let (device, mut backend) = backend(2);
    backend.begin_frame(1).unwrap();
    let list = backend.acquire_command_list(QueueKind::Direct).unwrap();
    device.fail_next_close();
    let result = backend.submit(list);

    if cfg!(debug_assertions) {
        assert!(matches!(result, Err(BackendError::CommandList(_))));
        assert!(matches!(
            backend.end_frame(),
            Err(BackendError::Poisoned(_))
        ));
    } else {
        assert!(result.is_ok());
        backend.end_frame().unwrap();
    }
}

// =============================================================================
// Swapchain and device loss
// =============================================================================

#[test]
fn test_backbuffer_transitions_and_present() {
    let (device, mut backend) = backend(2);
    let swapchain = MockSwapchain::new(&device, 2, 64, 64).unwrap();
    backend.attach_swapchain(Box::new(swapchain));

    for frame in 1..=3 {
        backend.begin_frame(frame).unwrap();
        assert!(backend.backbuffer_index().is_some());
        backend.end_frame().unwrap();
    }

    assert_eq!(device.presents(), 3);
    let transitions = device.transitions();
    assert_eq!(transitions.len(), 6);
    assert_eq!(
        transitions[0],
        (
            "Backbuffer 0".to_string(),
            TextureState::Present,
            TextureState::RenderTarget
        )
    );
    assert_eq!(
        transitions[1],
        (
            "Backbuffer 0".to_string(),
            TextureState::RenderTarget,
            TextureState::Present
        )
    );
    assert_eq!(transitions[2].0, "Backbuffer 1");
}

#[test]
fn test_device_loss_poisons_backend() {
    let (device, mut backend) = backend(2);
    run_frame(&mut backend, 1);
    device.lose_device();

    let err = backend.begin_frame(2).unwrap_err();
    assert!(err.is_device_lost());
    assert!(backend.begin_frame(3).unwrap_err().is_device_lost());
    assert!(backend.create_buffer(&vertex_desc("after")).is_none());
    assert!(backend.acquire_command_list(QueueKind::Direct).is_err());
}

#[test]
fn test_device_loss_during_end_frame_is_fatal() {
    let (device, mut backend) = backend(2);
    let swapchain = MockSwapchain::new(&device, 2, 64, 64).unwrap();
    backend.attach_swapchain(Box::new(swapchain));

    backend.begin_frame(1).unwrap();
    device.lose_device();
    let err = backend.end_frame().unwrap_err();
    assert!(err.is_device_lost());
    assert!(err.is_fatal());
}
