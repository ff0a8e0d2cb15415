//! GPU occlusion traversal.
//!
//! One compute invocation per node slot decides whether the node is the
//! visible level of detail this frame. Selected nodes append an indirect
//! draw; nodes that want finer detail or a mesh push a request word for the
//! engine. See [`crate::selection`] for the same rules on the CPU.

use bytemuck::{Pod, Zeroable};
use static_assertions::assert_eq_size;
use thiserror::Error;

use crate::hiz::HiZPyramid;
use crate::node::DrawCommand;
use crate::node_manager::NodeGpuBuffers;
use crate::pipeline::{ComputeKernel, compute_kernel, storage_entry, texture_entry, uniform_entry};
use crate::readback::{AsyncReadback, ReadbackError, read_buffer_blocking};
use crate::selection::{FrameParams, MAX_ITERATIONS};

/// Invocations per workgroup.
pub const LOCAL_SIZE: u32 = 128;
/// Capacity of the render queue.
pub const MAX_DRAWS: u32 = 1 << 20;
/// Capacity of the request queue.
pub const MAX_REQUESTS: u32 = 1 << 16;

const SHADER_BODY: &str = include_str!("shaders/traversal.wgsl");
const SCENE_FLAG_HIZ: u32 = 1;
const COUNTER_BYTES: u64 = 16;

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("failed to build {label}: {message}")]
    Pipeline { label: String, message: String },
    #[error("traversal is disabled")]
    Disabled,
    #[error("traversal is not initialized")]
    NotInitialized,
    #[error("{node_count} node slots exceed the GPU capacity of {capacity}")]
    NodeOverflow { node_count: u32, capacity: u32 },
    #[error(transparent)]
    Readback(#[from] ReadbackError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverserState {
    Uninitialized,
    Initialized,
    /// Recording the compute pass.
    Dispatching,
    /// A frame was recorded; the draw list is valid.
    Idle,
    /// Failed permanently for this session.
    Disabled,
}

/// Per-frame uniform, mirrored by `Scene` in `traversal.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SceneUniform {
    pub view_proj: [[f32; 4]; 4],
    pub planes: [[f32; 4]; 6],
    pub camera_section: [i32; 4],
    pub camera_offset: [f32; 4],
    /// Width, height, projection y scale, subdivision threshold.
    pub viewport: [f32; 4],
    pub frame: u32,
    pub node_count: u32,
    pub hiz_levels: u32,
    pub flags: u32,
    pub hiz_size: [u32; 2],
    pub max_draws: u32,
    pub max_requests: u32,
    pub _pad: [u32; 4],
}

assert_eq_size!(SceneUniform, [u8; 256]);

impl SceneUniform {
    pub fn new(
        params: &FrameParams,
        node_count: u32,
        hiz: Option<&HiZPyramid>,
        max_draws: u32,
        max_requests: u32,
    ) -> Self {
        let (hiz_levels, hiz_size, flags) = match hiz {
            Some(pyramid) => {
                let (w, h) = pyramid.size();
                (pyramid.level_count(), [w, h], SCENE_FLAG_HIZ)
            }
            None => (0, [1, 1], 0),
        };
        Self {
            view_proj: params.view_proj.to_cols_array_2d(),
            planes: (*params.frustum.planes()).map(|p| p.to_array()),
            camera_section: params.camera_section.extend(0).to_array(),
            camera_offset: params.camera_offset.extend(0.0).to_array(),
            viewport: [
                params.viewport.0 as f32,
                params.viewport.1 as f32,
                params.proj_scale_y,
                params.subdivision_size,
            ],
            frame: params.frame,
            node_count,
            hiz_levels,
            flags,
            hiz_size,
            max_draws,
            max_requests,
            _pad: [0; 4],
        }
    }
}

/// What the host needs for `multi_draw_indirect_count`: the count lives at
/// offset 0 of `count`.
pub struct DrawList<'a> {
    pub commands: &'a wgpu::Buffer,
    pub count: &'a wgpu::Buffer,
    pub max_commands: u32,
}

/// Counters and request words of one traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalFeedback {
    pub draw_count: u32,
    pub requests: Vec<u32>,
    pub dropped_requests: u32,
    pub selected: u32,
}

impl TraversalFeedback {
    fn decode(counters: &[u8], requests: &[u8], max_draws: u32, max_requests: u32) -> Self {
        let words: &[u32] = bytemuck::cast_slice(counters);
        let pushed = words[1];
        let kept = pushed.min(max_requests) as usize;
        let request_words: &[u32] = bytemuck::cast_slice(requests);
        Self {
            draw_count: words[0].min(max_draws),
            requests: request_words[..kept.min(request_words.len())].to_vec(),
            dropped_requests: words[2],
            selected: words[3],
        }
    }
}

struct GpuResources {
    kernel: ComputeKernel,
    uniform: wgpu::Buffer,
    draws: wgpu::Buffer,
    counters: wgpu::Buffer,
    requests: wgpu::Buffer,
    _fallback_hiz: wgpu::Texture,
    fallback_hiz_view: wgpu::TextureView,
    counters_readback: AsyncReadback,
    requests_readback: AsyncReadback,
    tracker_readback: Option<AsyncReadback>,
    counters_bytes: Option<Vec<u8>>,
    requests_bytes: Option<Vec<u8>>,
}

pub struct OcclusionTraverser {
    state: TraverserState,
    max_draws: u32,
    max_requests: u32,
    gpu: Option<GpuResources>,
}

fn buffer_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

/// The kernel source with the workgroup size and walk bound prepended.
pub fn shader_source() -> String {
    format!(
        "const LOCAL_SIZE: u32 = {LOCAL_SIZE}u;\nconst MAX_ITERATIONS: u32 = {MAX_ITERATIONS}u;\n{SHADER_BODY}"
    )
}

impl Default for OcclusionTraverser {
    fn default() -> Self {
        Self::new(MAX_DRAWS, MAX_REQUESTS)
    }
}

impl OcclusionTraverser {
    pub fn new(max_draws: u32, max_requests: u32) -> Self {
        Self {
            state: TraverserState::Uninitialized,
            max_draws: max_draws.max(1),
            max_requests: max_requests.max(1),
            gpu: None,
        }
    }

    pub fn state(&self) -> TraverserState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.state == TraverserState::Disabled
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Stop traversing for the rest of the session.
    pub fn disable(&mut self, reason: &str) {
        if self.state != TraverserState::Disabled {
            tracing::error!(reason, "LOD traversal disabled");
        }
        self.state = TraverserState::Disabled;
        self.gpu = None;
    }

    /// Build the kernel and queues. On failure the traverser is disabled.
    pub fn initialize(&mut self, device: &wgpu::Device) -> Result<(), TraversalError> {
        match self.state {
            TraverserState::Disabled => return Err(TraversalError::Disabled),
            TraverserState::Uninitialized => {}
            _ => return Ok(()),
        }
        match self.create_resources(device) {
            Ok(gpu) => {
                self.gpu = Some(gpu);
                self.state = TraverserState::Initialized;
                tracing::info!(
                    max_draws = self.max_draws,
                    max_requests = self.max_requests,
                    "LOD traversal initialized"
                );
                Ok(())
            }
            Err(err) => {
                self.disable(&err.to_string());
                Err(err)
            }
        }
    }

    fn create_resources(&self, device: &wgpu::Device) -> Result<GpuResources, TraversalError> {
        let kernel = compute_kernel(
            device,
            "lod_traversal",
            &shader_source(),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, false),
                storage_entry(5, false),
                storage_entry(6, false),
                texture_entry(7, wgpu::TextureSampleType::Float { filterable: false }),
            ],
        )?;

        let buffer = |label: &str, size: u64, usage: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let uniform = buffer(
            "lod_scene",
            size_of::<SceneUniform>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let draws = buffer(
            "lod_render_queue",
            u64::from(self.max_draws) * size_of::<DrawCommand>() as u64,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_SRC,
        );
        let counters = buffer(
            "lod_queue_counters",
            COUNTER_BYTES,
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        );
        let request_bytes = u64::from(self.max_requests) * 4;
        let requests = buffer(
            "lod_request_queue",
            request_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );

        let fallback_hiz = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("lod_hiz_fallback"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let fallback_hiz_view = fallback_hiz.create_view(&Default::default());

        Ok(GpuResources {
            kernel,
            uniform,
            draws,
            counters,
            requests,
            _fallback_hiz: fallback_hiz,
            fallback_hiz_view,
            counters_readback: AsyncReadback::new(device, "lod_counters_readback", COUNTER_BYTES),
            requests_readback: AsyncReadback::new(device, "lod_requests_readback", request_bytes),
            tracker_readback: None,
            counters_bytes: None,
            requests_bytes: None,
        })
    }

    /// Record the traversal for one frame into `encoder`.
    #[allow(clippy::too_many_arguments)]
    pub fn traverse(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        params: &FrameParams,
        nodes: &NodeGpuBuffers,
        node_count: u32,
        hiz: Option<&HiZPyramid>,
    ) -> Result<(), TraversalError> {
        match self.state {
            TraverserState::Disabled => return Err(TraversalError::Disabled),
            TraverserState::Uninitialized => return Err(TraversalError::NotInitialized),
            _ => {}
        }
        if node_count > nodes.capacity() {
            return Err(TraversalError::NodeOverflow {
                node_count,
                capacity: nodes.capacity(),
            });
        }
        let Some(gpu) = &self.gpu else {
            return Err(TraversalError::NotInitialized);
        };
        self.state = TraverserState::Dispatching;

        let scene = SceneUniform::new(params, node_count, hiz, self.max_draws, self.max_requests);
        queue.write_buffer(&gpu.uniform, 0, bytemuck::bytes_of(&scene));
        encoder.clear_buffer(&gpu.counters, 0, None);

        let hiz_view = hiz.map_or(&gpu.fallback_hiz_view, HiZPyramid::view);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lod_traversal"),
            layout: &gpu.kernel.layout,
            entries: &[
                buffer_entry(0, &gpu.uniform),
                buffer_entry(1, nodes.nodes()),
                buffer_entry(2, nodes.visibility()),
                buffer_entry(3, nodes.tracker()),
                buffer_entry(4, &gpu.draws),
                buffer_entry(5, &gpu.counters),
                buffer_entry(6, &gpu.requests),
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: wgpu::BindingResource::TextureView(hiz_view),
                },
            ],
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("lod_traversal"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&gpu.kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(node_count.div_ceil(LOCAL_SIZE), 1, 1);
        }
        // Ending the pass orders these writes before the indirect draw reads.

        self.state = TraverserState::Idle;
        Ok(())
    }

    /// Buffers for the host's indirect draw, valid once a frame was recorded.
    pub fn draw_list(&self) -> Option<DrawList<'_>> {
        if self.state != TraverserState::Idle {
            return None;
        }
        let gpu = self.gpu.as_ref()?;
        Some(DrawList {
            commands: &gpu.draws,
            count: &gpu.counters,
            max_commands: self.max_draws,
        })
    }

    /// Queue copies of the counters and request queue (and, with
    /// `with_tracker`, the render tracker) behind the traversal. Readbacks
    /// still in flight are skipped.
    pub fn record_feedback(
        &mut self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        nodes: &NodeGpuBuffers,
        with_tracker: bool,
    ) {
        let Some(gpu) = &mut self.gpu else {
            return;
        };
        if gpu.counters_readback.is_idle() && gpu.requests_readback.is_idle() {
            gpu.counters_readback.record_copy(encoder, &gpu.counters, 0);
            gpu.requests_readback.record_copy(encoder, &gpu.requests, 0);
        }
        if with_tracker {
            let size = u64::from(nodes.capacity()) * 4;
            let tracker = gpu
                .tracker_readback
                .get_or_insert_with(|| AsyncReadback::new(device, "lod_tracker_readback", size));
            tracker.record_copy(encoder, nodes.tracker(), 0);
        }
    }

    /// Start mapping the copies recorded by [`Self::record_feedback`]. Call
    /// after the encoder was submitted.
    pub fn after_submit(&mut self) {
        if let Some(gpu) = &mut self.gpu {
            gpu.counters_readback.request_map();
            gpu.requests_readback.request_map();
            if let Some(tracker) = &mut gpu.tracker_readback {
                tracker.request_map();
            }
        }
    }

    /// Collect finished feedback without blocking.
    pub fn poll_feedback(
        &mut self,
        device: &wgpu::Device,
    ) -> Result<Option<TraversalFeedback>, TraversalError> {
        let (max_draws, max_requests) = (self.max_draws, self.max_requests);
        let Some(gpu) = &mut self.gpu else {
            return Ok(None);
        };
        if let Some(bytes) = gpu.counters_readback.try_read(device)? {
            gpu.counters_bytes = Some(bytes);
        }
        if let Some(bytes) = gpu.requests_readback.try_read(device)? {
            gpu.requests_bytes = Some(bytes);
        }
        if gpu.counters_bytes.is_none() || gpu.requests_bytes.is_none() {
            return Ok(None);
        }
        let counters = gpu.counters_bytes.take().unwrap_or_default();
        let requests = gpu.requests_bytes.take().unwrap_or_default();
        Ok(Some(TraversalFeedback::decode(&counters, &requests, max_draws, max_requests)))
    }

    /// Collect a finished render-tracker readback without blocking.
    pub fn poll_tracker(&mut self, device: &wgpu::Device) -> Result<Option<Vec<u32>>, TraversalError> {
        let Some(tracker) = self.gpu.as_mut().and_then(|gpu| gpu.tracker_readback.as_mut()) else {
            return Ok(None);
        };
        Ok(tracker
            .try_read(device)?
            .map(|bytes| bytemuck::cast_slice::<u8, u32>(&bytes).to_vec()))
    }

    /// Blocking readback of the request queue and the render tracker.
    pub fn read_feedback(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        nodes: &NodeGpuBuffers,
    ) -> Result<(TraversalFeedback, Vec<u32>), TraversalError> {
        let Some(gpu) = &self.gpu else {
            return Err(TraversalError::NotInitialized);
        };
        let counters = read_buffer_blocking(device, queue, &gpu.counters, 0, COUNTER_BYTES)?;
        let requests =
            read_buffer_blocking(device, queue, &gpu.requests, 0, u64::from(self.max_requests) * 4)?;
        let tracker =
            read_buffer_blocking(device, queue, nodes.tracker(), 0, u64::from(nodes.capacity()) * 4)?;
        Ok((
            TraversalFeedback::decode(&counters, &requests, self.max_draws, self.max_requests),
            bytemuck::cast_slice::<u8, u32>(&tracker).to_vec(),
        ))
    }

    /// Blocking readback of the recorded draw commands.
    pub fn read_draws(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        count: u32,
    ) -> Result<Vec<DrawCommand>, TraversalError> {
        let Some(gpu) = &self.gpu else {
            return Err(TraversalError::NotInitialized);
        };
        let len = u64::from(count.min(self.max_draws)) * size_of::<DrawCommand>() as u64;
        let bytes = read_buffer_blocking(device, queue, &gpu.draws, 0, len)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use glam::{DVec3, Mat4};

    use super::*;
    use crate::geometry_arena::BlockAllocator;
    use crate::node::request;
    use crate::node_manager::{NodeLayout, NodeManager};
    use crate::selection::select_nodes;
    use crate::test_support::test_device;

    fn params(camera: DVec3, frame: u32) -> FrameParams {
        let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100_000.0);
        FrameParams::new(camera, Mat4::IDENTITY, projection, (720, 720), 64.0, frame)
    }

    fn scene() -> NodeManager {
        let arena = BlockAllocator::new(1 << 20, 16);
        let mut nodes = NodeManager::new(NodeLayout {
            max_nodes: 512,
            top_lod: 2,
            min_y: 0,
            max_y: 0,
        });
        nodes.begin_frame(1);
        for x in -3..=3 {
            for z in [-100, -1] {
                for key in nodes.add_top_level(x, z).unwrap() {
                    nodes.set_geometry(key, arena.allocate(3), None);
                }
            }
        }
        let near = nodes.slot_of(voxlod_voxel::SectionKey::new(2, 0, 0, -1)).unwrap();
        for key in nodes.request_children(near).unwrap() {
            nodes.set_geometry(key, arena.allocate(2), None);
        }
        nodes
    }

    #[test]
    fn test_scene_uniform_layout() {
        let p = params(DVec3::new(-20.0, 5.0, 40.0), 9);
        let uniform = SceneUniform::new(&p, 77, None, 10, 20);
        assert_eq!(uniform.camera_section, [-2, 0, 2, 0]);
        assert_eq!(uniform.camera_offset, [12.0, 5.0, 8.0, 0.0]);
        assert_eq!(uniform.node_count, 77);
        assert_eq!(uniform.flags & SCENE_FLAG_HIZ, 0);
        assert_eq!(uniform.viewport[3], 64.0);
    }

    #[test]
    fn test_shader_source_has_constants() {
        let source = shader_source();
        assert!(source.starts_with("const LOCAL_SIZE: u32 = 128u;"));
        assert!(source.contains("const MAX_ITERATIONS: u32 = 10u;"));
    }

    #[test]
    fn test_feedback_decode_clamps() {
        let counters: [u32; 4] = [5, 4, 1, 9];
        let requests: [u32; 3] = [10, 11, 12];
        let feedback = TraversalFeedback::decode(
            bytemuck::cast_slice(&counters),
            bytemuck::cast_slice(&requests),
            3,
            3,
        );
        assert_eq!(feedback.draw_count, 3);
        assert_eq!(feedback.requests, vec![10, 11, 12]);
        assert_eq!(feedback.dropped_requests, 1);
        assert_eq!(feedback.selected, 9);
    }

    #[test]
    fn test_traverse_before_initialize_fails() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let mut traverser = OcclusionTraverser::new(64, 64);
        let buffers = NodeGpuBuffers::new(&device, 16);
        let mut encoder = device.create_command_encoder(&Default::default());
        let err = traverser
            .traverse(&device, &queue, &mut encoder, &params(DVec3::ZERO, 1), &buffers, 0, None)
            .unwrap_err();
        assert!(matches!(err, TraversalError::NotInitialized));
        assert!(traverser.draw_list().is_none());
    }

    #[test]
    fn test_gpu_matches_cpu_selection() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let mut nodes = scene();
        let buffers = NodeGpuBuffers::new(&device, 512);
        buffers.sync(&queue, &mut nodes);

        let mut traverser = OcclusionTraverser::new(1024, 256);
        traverser.initialize(&device).unwrap();
        assert_eq!(traverser.state(), TraverserState::Initialized);

        let frame = params(DVec3::new(32.0, 32.0, 10.0), 5);
        let mut encoder = device.create_command_encoder(&Default::default());
        traverser
            .traverse(&device, &queue, &mut encoder, &frame, &buffers, nodes.slot_count(), None)
            .unwrap();
        queue.submit(std::iter::once(encoder.finish()));
        assert_eq!(traverser.state(), TraverserState::Idle);
        assert!(traverser.draw_list().is_some());

        let (feedback, tracker) = traverser.read_feedback(&device, &queue, &buffers).unwrap();
        let cpu = select_nodes(nodes.nodes(), &frame, None, 256);

        let mut gpu_draws = traverser.read_draws(&device, &queue, feedback.draw_count).unwrap();
        let mut cpu_draws = cpu.draws.clone();
        gpu_draws.sort_by_key(|d| d.first_instance);
        cpu_draws.sort_by_key(|d| d.first_instance);
        assert_eq!(gpu_draws, cpu_draws);

        let mut gpu_requests = feedback.requests.clone();
        let mut cpu_requests = cpu.requests.clone();
        gpu_requests.sort_unstable();
        cpu_requests.sort_unstable();
        assert_eq!(gpu_requests, cpu_requests);
        assert!(cpu_requests.iter().any(|w| request::decode(*w).1));

        for slot in cpu.selected.iter().chain(&cpu.handed_over) {
            assert_eq!(tracker[*slot as usize], 5);
        }
        assert_eq!(feedback.selected as usize, cpu.selected.len());
    }
}
