//! The frame-driven LOD engine.
//!
//! [`LodEngine`] ties the pieces together on the render thread: it drains
//! mesh results and dirty notifications, keeps columns loaded around the
//! camera, turns traversal requests into node and mesh work, runs the
//! cleaner and records the traversal. Everything that touches wgpu happens
//! inside [`LodEngine::frame`] and [`LodEngine::attach`].

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::{DVec3, Mat4};
use rustc_hash::FxHashSet;
use voxlod_config::{Config, RENDER_DISTANCE_RANGE};
use voxlod_mesh::{GeneratedMesh, RenderGenerationService};
use voxlod_render::{
    CleanupReport, DrawCommand, DrawList, FrameParams, GeometryArena, GpuCapabilities, HiZPyramid,
    NodeCleaner, NodeGpuBuffers, NodeLayout, NodeManager, OcclusionTraverser, StampFreshness,
    TraversalFeedback, TraverserState, flags, request, select_nodes,
};
use voxlod_storage::{LogStorage, MemoryStorage, StorageBackend};
use voxlod_voxel::{MAPPER_FILE_NAME, Mapper, SectionKey, VoxelizedSection};

use crate::distance::RenderDistanceTracker;
use crate::error::EngineError;
use crate::world::{DirtyEvent, DirtySender, SectionIngestor, SectionTracker, WorldStore};

/// A worker's answer for one queued section: the mesh, or the key of a
/// task that failed.
type MeshResult = Result<GeneratedMesh, SectionKey>;

/// Traversal requests turned into node or mesh work per frame.
pub const REQUESTS_PER_FRAME: usize = 512;

/// Depth of the previous frame, used to build the HiZ pyramid.
pub struct DepthInput<'a> {
    pub view: &'a wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

/// Camera state for one frame. `view` carries rotation only; the
/// translation is taken from `camera_position`.
pub struct FrameInput<'a> {
    pub camera_position: DVec3,
    pub view: Mat4,
    pub projection: Mat4,
    pub viewport: (u32, u32),
    pub depth: Option<DepthInput<'a>>,
}

/// What the host draws this frame.
pub enum FrameOutput<'a> {
    /// Buffers for `multi_draw_indirect_count`.
    Gpu(DrawList<'a>),
    /// Draws selected on the CPU.
    Cpu(&'a [DrawCommand]),
    Nothing,
}

/// Snapshot of engine state for overlays and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub frame: u32,
    pub arena_used_bytes: u64,
    pub arena_capacity_bytes: u64,
    pub arena_free_blocks: u32,
    pub arena_largest_free_run: u32,
    pub arena_full_events: u64,
    pub node_slots: u32,
    pub live_nodes: usize,
    pub columns: usize,
    pub pending_generation: usize,
    pub in_flight: usize,
    pub request_backlog: usize,
    pub draw_count: u32,
    pub dropped_requests: u32,
    pub last_cleanup: Option<CleanupReport>,
    pub traversal: TraverserState,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    node_buffers: NodeGpuBuffers,
    hiz: Option<HiZPyramid>,
}

pub struct LodEngine {
    config: Config,
    world: Arc<WorldStore>,
    mapper: Arc<Mapper>,
    nodes: NodeManager,
    arena: GeometryArena,
    cleaner: NodeCleaner,
    traverser: OcclusionTraverser,
    generation: RenderGenerationService,
    sections: Arc<SectionTracker>,
    distance: RenderDistanceTracker,
    dirty_tx: DirtySender,
    dirty_rx: Receiver<DirtyEvent>,
    mesh_tx: Sender<MeshResult>,
    mesh_rx: Receiver<MeshResult>,
    backlog: VecDeque<u32>,
    backlog_set: FxHashSet<u32>,
    gpu: Option<GpuContext>,
    cpu_draws: Vec<DrawCommand>,
    frame: u32,
    /// Set when an allocation failed; cleared by the next cleanup pass or
    /// when memory is returned.
    arena_full: bool,
    cleanup_requested: bool,
    stamps: StampFreshness,
    /// The previous frame's stamps come from the GPU tracker.
    stamps_from_gpu: bool,
    arena_full_events: u64,
    draw_count: u32,
    dropped_requests: u32,
    last_cleanup: Option<CleanupReport>,
}

impl LodEngine {
    /// Build a headless engine. Call [`Self::attach`] to render on a GPU.
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        mapper: Mapper,
    ) -> Result<Self, EngineError> {
        let config = config.validated();
        let generation = RenderGenerationService::start(config.engine.worker_threads)?;
        let layout = NodeLayout {
            max_nodes: config.nodes.max_nodes,
            top_lod: config.lod.top_lod,
            min_y: config.lod.min_section_y,
            max_y: config.lod.max_section_y,
        };
        let (dirty_tx, dirty_rx) = unbounded();
        let (mesh_tx, mesh_rx) = unbounded();

        tracing::info!(
            workers = generation.worker_count(),
            top_lod = config.lod.top_lod,
            render_distance = config.lod.section_render_distance,
            enabled = config.engine.enabled,
            "LOD engine created"
        );

        Ok(Self {
            world: Arc::new(WorldStore::new(storage, config.lod.top_lod)),
            mapper: Arc::new(mapper),
            nodes: NodeManager::new(layout),
            arena: GeometryArena::new(config.arena.capacity_bytes, config.arena.block_quads),
            cleaner: NodeCleaner::new(
                config.cleaner.interval_frames,
                config.cleaner.retention_frames,
            ),
            traverser: OcclusionTraverser::default(),
            generation,
            sections: Arc::new(SectionTracker::new()),
            distance: RenderDistanceTracker::new(
                config.lod.section_render_distance,
                config.lod.top_lod,
                config.lod.max_column_changes_per_frame,
            ),
            dirty_tx: DirtySender::new(dirty_tx),
            dirty_rx,
            mesh_tx,
            mesh_rx,
            backlog: VecDeque::new(),
            backlog_set: FxHashSet::default(),
            gpu: None,
            cpu_draws: Vec::new(),
            frame: 0,
            arena_full: false,
            cleanup_requested: false,
            stamps: StampFreshness::default(),
            stamps_from_gpu: false,
            arena_full_events: 0,
            draw_count: 0,
            dropped_requests: 0,
            last_cleanup: None,
            config,
        })
    }

    /// Open the world under `config.data_dir()`: the section log and the
    /// mapper when persistence is on, memory storage otherwise. A world that
    /// cannot be opened is logged and replaced by an in-memory one.
    pub fn open(config: Config) -> Result<Self, EngineError> {
        let config = config.validated();
        if !config.storage.persistence {
            return Self::new(config, Arc::new(MemoryStorage::new()), Mapper::new());
        }
        let dir = config.data_dir();
        let storage: Arc<dyn StorageBackend> =
            match LogStorage::open(&dir, config.storage.compact_on_open) {
                Ok(storage) => Arc::new(storage),
                Err(err) => {
                    tracing::error!(dir = %dir.display(), %err, "section log unavailable, using memory");
                    Arc::new(MemoryStorage::new())
                }
            };
        let mapper = Mapper::load(&dir.join(MAPPER_FILE_NAME)).unwrap_or_else(|err| {
            tracing::error!(dir = %dir.display(), %err, "mapper unreadable, starting a new one");
            Mapper::new()
        });
        Self::new(config, storage, mapper)
    }

    /// Move onto a GPU. The adapter is re-checked; on a missing capability
    /// the engine stays headless and reports which one.
    pub fn attach(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        adapter: &wgpu::Adapter,
    ) -> Result<(), EngineError> {
        if !self.config.engine.enabled {
            return Err(EngineError::Disabled);
        }
        let caps = GpuCapabilities::from_device(device, adapter);
        if !caps.meets_requirements() {
            let missing = caps.missing().join(", ");
            tracing::warn!(%missing, "adapter cannot run the LOD traversal");
            return Err(EngineError::UnsupportedAdapter { missing });
        }
        self.detach();

        self.drop_all_geometry();
        self.arena = GeometryArena::with_device(
            device,
            self.config.arena.capacity_bytes,
            self.config.arena.block_quads,
        );
        let mut traverser = OcclusionTraverser::default();
        let initialized = traverser.initialize(device);
        if let Err(err) = &initialized {
            traverser.disable(&err.to_string());
        }
        self.traverser = traverser;
        self.gpu = Some(GpuContext {
            device: device.clone(),
            queue: queue.clone(),
            node_buffers: NodeGpuBuffers::new(device, self.config.nodes.max_nodes),
            hiz: None,
        });
        self.nodes.mark_all_dirty();
        tracing::info!(
            arena_bytes = self.arena.allocator().capacity_bytes(),
            max_nodes = self.config.nodes.max_nodes,
            "LOD engine attached"
        );
        initialized?;
        Ok(())
    }

    /// Release every GPU resource. Geometry is dropped and rebuilt on demand.
    pub fn detach(&mut self) {
        if self.gpu.take().is_none() {
            return;
        }
        self.drop_all_geometry();
        self.arena = GeometryArena::new(self.config.arena.capacity_bytes, self.config.arena.block_quads);
        self.traverser = OcclusionTraverser::default();
        self.stamps = StampFreshness::default();
        self.stamps_from_gpu = false;
        tracing::info!("LOD engine detached");
    }

    fn drop_all_geometry(&mut self) {
        for allocation in self.nodes.invalidate_geometry() {
            self.arena.free(allocation);
        }
        self.backlog.clear();
        self.backlog_set.clear();
        self.arena_full = false;
    }

    /// Stop the workers, flush storage and persist the mapper.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.generation.shutdown();
        self.sections.clear_in_flight();
        self.detach();
        self.world.storage().flush()?;
        if self.config.storage.persistence {
            self.mapper.save(&self.config.data_dir().join(MAPPER_FILE_NAME))?;
        }
        tracing::info!(frames = self.frame, "LOD engine shut down");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn node_manager(&self) -> &NodeManager {
        &self.nodes
    }

    pub fn arena(&self) -> &GeometryArena {
        &self.arena
    }

    pub fn traverser_state(&self) -> TraverserState {
        self.traverser.state()
    }

    pub fn is_attached(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn frame_index(&self) -> u32 {
        self.frame
    }

    pub fn dirty_sender(&self) -> DirtySender {
        self.dirty_tx.clone()
    }

    /// A handle for ingesting sections from other threads.
    pub fn ingestor(&self) -> SectionIngestor {
        SectionIngestor::new(Arc::clone(&self.world), self.dirty_tx.clone())
    }

    /// Store an LOD-0 section and schedule the nodes covering it.
    pub fn ingest_section(&self, section: VoxelizedSection) -> Result<(), EngineError> {
        self.ingestor().ingest_section(section)
    }

    /// Change the load radius. Shrinking triggers a cleanup on the next frame.
    pub fn set_render_distance(&mut self, render_distance: u32) {
        let (lo, hi) = RENDER_DISTANCE_RANGE;
        let render_distance = render_distance.clamp(lo, hi);
        self.config.lod.section_render_distance = render_distance;
        if self.distance.set_render_distance(render_distance) {
            self.cleanup_requested = true;
        }
    }

    pub fn stats(&self) -> EngineStats {
        let allocator = self.arena.allocator();
        EngineStats {
            frame: self.frame,
            arena_used_bytes: allocator.used_bytes(),
            arena_capacity_bytes: allocator.capacity_bytes(),
            arena_free_blocks: allocator.free_blocks(),
            arena_largest_free_run: allocator.largest_free_run(),
            arena_full_events: self.arena_full_events,
            node_slots: self.nodes.slot_count(),
            live_nodes: self.nodes.live_count(),
            columns: self.nodes.column_count(),
            pending_generation: self.generation.pending_count(),
            in_flight: self.sections.in_flight_count(),
            request_backlog: self.backlog.len(),
            draw_count: self.draw_count,
            dropped_requests: self.dropped_requests,
            last_cleanup: self.last_cleanup,
            traversal: self.traverser.state(),
        }
    }

    /// Advance one frame.
    ///
    /// With a GPU attached and an `encoder`, the traversal is recorded into
    /// it and the result is [`FrameOutput::Gpu`]; call
    /// [`Self::after_submit`] once the encoder was submitted. Otherwise the
    /// CPU selection runs when `cpu_fallback` is set.
    pub fn frame<'a>(
        &'a mut self,
        input: &FrameInput<'_>,
        encoder: Option<&mut wgpu::CommandEncoder>,
    ) -> FrameOutput<'a> {
        if !self.config.engine.enabled {
            return FrameOutput::Nothing;
        }
        self.frame = self.frame.wrapping_add(1);
        self.nodes.begin_frame(self.frame);
        let params = FrameParams::new(
            input.camera_position,
            input.view,
            input.projection,
            input.viewport,
            self.config.lod.subdivision_size,
            self.frame,
        );

        self.poll_gpu_feedback();
        self.drain_dirty();
        self.drain_meshes();
        self.update_columns(&params);
        self.process_requests();
        self.run_cleaner();

        let gpu_ready = self.gpu.is_some() && !self.traverser.is_disabled();
        let recorded = match encoder {
            Some(encoder) if gpu_ready => {
                self.record_traversal(encoder, &params, input.depth.as_ref())
            }
            _ => false,
        };
        self.stamps_from_gpu = recorded;
        if recorded {
            return self
                .traverser
                .draw_list()
                .map_or(FrameOutput::Nothing, FrameOutput::Gpu);
        }

        if self.config.lod.cpu_fallback {
            self.select_on_cpu(&params);
            return FrameOutput::Cpu(&self.cpu_draws);
        }
        FrameOutput::Nothing
    }

    /// Start the feedback readbacks of the last recorded traversal.
    pub fn after_submit(&mut self) {
        self.traverser.after_submit();
    }

    fn poll_gpu_feedback(&mut self) {
        let Some(device) = self.gpu.as_ref().map(|gpu| gpu.device.clone()) else {
            return;
        };
        match self.traverser.poll_feedback(&device) {
            Ok(Some(feedback)) => self.apply_feedback(feedback),
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "traversal feedback lost"),
        }
        match self.traverser.poll_tracker(&device) {
            Ok(Some(stamps)) => {
                self.nodes.apply_render_feedback(&stamps);
                self.stamps.stamps_applied();
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%err, "render tracker readback lost");
                self.stamps.readback_lost();
            }
        }
    }

    fn apply_feedback(&mut self, feedback: TraversalFeedback) {
        self.draw_count = feedback.draw_count;
        self.dropped_requests = feedback.dropped_requests;
        if feedback.dropped_requests > 0 {
            tracing::debug!(dropped = feedback.dropped_requests, "request queue overflowed");
        }
        self.enqueue_requests(&feedback.requests);
    }

    fn enqueue_requests(&mut self, words: &[u32]) {
        for &word in words {
            if self.backlog_set.insert(word) {
                self.backlog.push_back(word);
            }
        }
    }

    fn drain_dirty(&mut self) {
        let mut rebuild = FxHashSet::default();
        for event in self.dirty_rx.try_iter() {
            if event.rebuild {
                rebuild.insert(event.key);
            } else {
                self.sections.mark_dirty(event.key);
            }
        }
        // The stored mip chain is rebuilt on a worker, which then reports
        // the key again without the rebuild flag.
        for key in rebuild {
            let world = Arc::clone(&self.world);
            let dirty = self.dirty_tx.clone();
            let queued = self.generation.queue_work(move || {
                if let Err(err) = world.rebuild_ancestors(key) {
                    tracing::warn!(%key, %err, "failed to rebuild coarser sections");
                }
                dirty.notify(key, false);
            });
            if !queued {
                self.sections.mark_dirty(key);
            }
        }
        for key in self.sections.take_dirty() {
            for stale in self.nodes.world_event(key) {
                self.queue_mesh(stale, true);
            }
        }
    }

    /// Hand `key` to the workers, which load it from storage and mesh it.
    fn queue_mesh(&self, key: SectionKey, changed: bool) {
        if !self.sections.begin_generation(key, changed) {
            return;
        }
        let world = Arc::clone(&self.world);
        let meshed = self.mesh_tx.clone();
        let failed = self.mesh_tx.clone();
        let queued = self.generation.queue_load_generation(
            key,
            move || world.load_for_meshing(key),
            move |mesh| {
                let _ = meshed.send(Ok(mesh));
            },
            move |key| {
                let _ = failed.send(Err(key));
            },
        );
        if !queued {
            self.sections.finish_generation(key);
        }
    }

    fn drain_meshes(&mut self) {
        while let Ok(result) = self.mesh_rx.try_recv() {
            let key = match &result {
                Ok(mesh) => mesh.key,
                Err(key) => *key,
            };
            let changed_again = self.sections.finish_generation(key);
            match result {
                Ok(mesh) => self.install_mesh(mesh),
                // The node stays unmeshed and is requested again by the
                // traversal.
                Err(key) => tracing::warn!(%key, "mesh generation failed"),
            }
            if changed_again {
                self.queue_mesh(key, false);
            }
        }
    }

    fn install_mesh(&mut self, mesh: GeneratedMesh) {
        if !self.nodes.contains(mesh.key) {
            tracing::trace!(key = %mesh.key, "mesh for unloaded node dropped");
            return;
        }
        let allocation = if mesh.quads.is_empty() {
            None
        } else {
            match self.arena.allocate(mesh.quads.len() as u32) {
                Some(allocation) => Some(allocation),
                None => {
                    self.arena_full_events += 1;
                    if !self.arena_full {
                        tracing::warn!(
                            key = %mesh.key,
                            quads = mesh.quads.len(),
                            used = self.arena.allocator().used_bytes(),
                            "geometry arena full"
                        );
                    }
                    self.arena_full = true;
                    self.cleanup_requested = true;
                    return;
                }
            }
        };
        if let (Some(gpu), Some(allocation)) = (&self.gpu, &allocation) {
            self.arena.upload(&gpu.queue, allocation, &mesh.quads);
        }
        if let Some(previous) = self.nodes.set_geometry(mesh.key, allocation, mesh.bounds) {
            self.arena.free(previous);
            self.arena_full = false;
        }
    }

    fn update_columns(&mut self, params: &FrameParams) {
        if !self.distance.needs_update(params.camera_section) {
            return;
        }
        let loaded: FxHashSet<(i32, i32)> = self.nodes.columns().collect();
        let changes = self.distance.update(params.camera_section, &loaded);
        for &(x, z) in &changes.remove {
            self.nodes.remove_top_level(x, z);
        }
        for &(x, z) in &changes.add {
            match self.nodes.add_top_level(x, z) {
                Ok(keys) => {
                    for key in keys {
                        self.queue_mesh(key, false);
                    }
                }
                Err(err) => {
                    tracing::warn!(x, z, %err, "cannot load column");
                    break;
                }
            }
        }
        if !changes.is_empty() {
            tracing::debug!(
                added = changes.add.len(),
                removed = changes.remove.len(),
                columns = self.nodes.column_count(),
                "columns updated"
            );
        }
    }

    fn process_requests(&mut self) {
        if self.arena_full {
            return;
        }
        for _ in 0..REQUESTS_PER_FRAME {
            let Some(word) = self.backlog.pop_front() else {
                break;
            };
            self.backlog_set.remove(&word);
            let (slot, wants_children) = request::decode(word);
            let Some(node) = self.nodes.node(slot).copied() else {
                continue;
            };
            if !node.has(flags::VALID) {
                continue;
            }
            if wants_children {
                match self.nodes.request_children(slot) {
                    Ok(keys) => {
                        for key in keys {
                            self.queue_mesh(key, false);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(key = %node.key(), %err, "cannot subdivide node");
                        break;
                    }
                }
            } else if !node.has(flags::MESHED) {
                self.queue_mesh(node.key(), false);
            }
        }
    }

    fn run_cleaner(&mut self) {
        let due = self.cleanup_requested || self.cleaner.is_due();
        // GPU stamps lag behind; a due pass waits for a tracker copy taken
        // after it became due.
        if due && self.stamps_from_gpu && !self.stamps.ready() {
            return;
        }
        let report = if std::mem::take(&mut self.cleanup_requested) {
            Some(self.cleaner.force_cleanup(self.frame, &mut self.nodes, &self.arena))
        } else {
            self.cleaner.tick(self.frame, &mut self.nodes, &self.arena)
        };
        let Some(report) = report else {
            return;
        };
        self.stamps.consumed();
        // Give allocation another chance after every pass.
        self.arena_full = false;
        self.last_cleanup = Some(report);
        let stats = self.stats();
        tracing::debug!(
            frame = stats.frame,
            arena_used = stats.arena_used_bytes,
            arena_capacity = stats.arena_capacity_bytes,
            largest_free_run = stats.arena_largest_free_run,
            live_nodes = stats.live_nodes,
            columns = stats.columns,
            pending = stats.pending_generation,
            backlog = stats.request_backlog,
            draws = stats.draw_count,
            "engine stats"
        );
    }

    /// Returns `false` if the traversal could not be recorded.
    fn record_traversal(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        params: &FrameParams,
        depth: Option<&DepthInput<'_>>,
    ) -> bool {
        let Some(gpu) = &mut self.gpu else {
            return false;
        };
        gpu.node_buffers.sync(&gpu.queue, &mut self.nodes);

        if let Some(depth) = depth {
            let size = (depth.width, depth.height);
            if let Some(pyramid) = &mut gpu.hiz {
                if pyramid.size() != size {
                    pyramid.resize(&gpu.device, depth.width, depth.height);
                }
            } else {
                match HiZPyramid::new(&gpu.device, depth.width, depth.height) {
                    Ok(pyramid) => gpu.hiz = Some(pyramid),
                    Err(err) => {
                        self.traverser.disable(&err.to_string());
                        return false;
                    }
                }
            }
            if let Some(pyramid) = &gpu.hiz {
                pyramid.build(&gpu.device, encoder, depth.view);
            }
        }
        // Without depth this frame the traversal skips the occlusion test.
        let hiz = depth.and(gpu.hiz.as_ref());

        let node_count = self.nodes.slot_count();
        if let Err(err) = self.traverser.traverse(
            &gpu.device,
            &gpu.queue,
            encoder,
            params,
            &gpu.node_buffers,
            node_count,
            hiz,
        ) {
            self.traverser.disable(&err.to_string());
            return false;
        }
        self.stamps.gpu_frame_recorded();
        let with_tracker = self.stamps.take_copy_request();
        self.traverser.record_feedback(&gpu.device, encoder, &gpu.node_buffers, with_tracker);
        true
    }

    fn select_on_cpu(&mut self, params: &FrameParams) {
        let selection = select_nodes(
            self.nodes.nodes(),
            params,
            None,
            self.traverser.max_requests() as usize,
        );
        for &slot in selection.selected.iter().chain(&selection.handed_over) {
            self.nodes.mark_rendered(slot, self.frame);
        }
        self.stamps.stamps_applied();
        self.enqueue_requests(&selection.requests);
        self.draw_count = selection.draws.len() as u32;
        self.dropped_requests = selection.dropped_requests;
        self.cpu_draws = selection.draws;
    }
}
