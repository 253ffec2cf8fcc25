//! Headless frame pipeline driver.
//!
//! Opens a Vulkan device, then pushes a bounded number of frames through the
//! backend: per-frame uploads, scratch buffers, descriptor churn and
//! transient resources, all released through the frame slots.
//!
//! ```text
//! inflight [CONFIG.toml] [FRAMES]
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use inflight_backend::{Backend, BackendError, BufferHandle};
use inflight_core::BackendConfig;
use inflight_rhi::device::Device;
use inflight_rhi::gpu::{DescriptorHeapKind, QueueKind};
use inflight_rhi::indirect::{DrawIndexedArguments, IndirectDrawCommand};
use inflight_rhi::instance::Instance;
use inflight_rhi::physical_device::select_physical_device;
use inflight_rhi::resource::{BufferResourceDesc, BufferUsage};

const DEFAULT_FRAMES: u64 = 240;
const OBJECT_COUNT: u32 = 64;
const VERTEX_BYTES: u64 = 64 * 1024;
const SCRATCH_BYTES: u64 = 256 * 1024;

struct Scene {
    vertices: BufferHandle,
    draws: BufferHandle,
}

impl Scene {
    fn new(backend: &mut Backend<Device>) -> Result<Self> {
        let draw_bytes = (size_of::<IndirectDrawCommand>() as u64) * u64::from(OBJECT_COUNT);
        let vertices = backend
            .create_buffer(&BufferResourceDesc::new(
                "Scene Vertices",
                BufferUsage::Vertex,
                VERTEX_BYTES,
            ))
            .context("Failed to create the vertex buffer")?;
        let draws = backend
            .create_buffer(&BufferResourceDesc::new(
                "Indirect Draws",
                BufferUsage::IndirectCommands,
                draw_bytes,
            ))
            .context("Failed to create the indirect draw buffer")?;
        Ok(Self { vertices, draws })
    }
}

fn draw_commands(frame: u64) -> Vec<IndirectDrawCommand> {
    (0..OBJECT_COUNT)
        .map(|i| IndirectDrawCommand {
            data_index: i,
            model_matrix_index: i,
            entity_id: (frame as u32).wrapping_mul(OBJECT_COUNT).wrapping_add(i),
            draw: DrawIndexedArguments {
                index_count: 36,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: i,
            },
        })
        .collect()
}

fn run_frame(backend: &mut Backend<Device>, scene: &Scene, frame: u64) -> Result<(), BackendError> {
    backend.begin_frame(frame)?;

    let mut upload = backend.acquire_named(QueueKind::Copy, "Frame Upload")?;
    let commands = draw_commands(frame);
    backend.upload_to_buffer(&mut upload, scene.draws, bytemuck::cast_slice(&commands), 0)?;
    if frame == 1 {
        let vertices = vec![0u8; VERTEX_BYTES as usize];
        backend.upload_to_buffer(&mut upload, scene.vertices, &vertices, 0)?;
    }
    backend.submit(upload)?;

    let scratch = backend.get_scratch_buffer(SCRATCH_BYTES)?;
    let list = backend.acquire_named(QueueKind::Direct, "Frame Work")?;
    backend.submit(list)?;
    backend.return_scratch_buffer(scratch);

    if let Some(range) = backend.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 8) {
        backend.release_descriptors(range);
    }

    // Transient per-frame resource, released once this slot retires.
    let transient = backend.create_buffer(&BufferResourceDesc::new(
        format!("Transient {frame}"),
        BufferUsage::Constant,
        256,
    ));
    if let Some(handle) = transient {
        backend.destroy_buffer(handle);
    }

    backend.end_frame()
}

fn run(config: BackendConfig, frames: u64) -> Result<()> {
    let instance = Arc::new(Instance::new(config.enable_validation)?);
    let info = select_physical_device(&instance)?;
    info!("Using {} ({})", info.device_name(), info.device_type_name());

    let device = Device::new(instance, &info)?;
    let mut backend = Backend::new(device, config)?;
    let scene = Scene::new(&mut backend)?;

    for frame in 1..=frames {
        if let Err(e) = run_frame(&mut backend, &scene, frame) {
            if e.is_fatal() {
                return Err(e).with_context(|| format!("Frame {frame} failed"));
            }
            error!("Frame {} failed: {}", frame, e);
        }
        if frame % 60 == 0 {
            info!("Frame {}: {:?}", frame, backend.stats());
        }
    }

    backend.wait_idle()?;
    backend.destroy_buffer(scene.vertices);
    backend.destroy_buffer(scene.draws);
    info!("Finished {} frame(s): {:?}", frames, backend.stats());
    Ok(())
}

fn main() -> Result<()> {
    inflight_core::init_logging();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => BackendConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => BackendConfig::default(),
    };
    let frames = match args.next() {
        Some(n) => n.parse().with_context(|| format!("Invalid frame count '{n}'"))?,
        None => DEFAULT_FRAMES,
    };

    info!(
        "Starting with {} frame(s) in flight for {} frame(s)",
        config.max_in_flight_frames, frames
    );
    if let Err(e) = run(config, frames) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
