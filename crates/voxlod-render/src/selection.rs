//! CPU reference of the traversal kernel.
//!
//! Every predicate here has a twin in `shaders/traversal.wgsl`. Tests use
//! this module to pin down the selection rules, and the engine runs it when
//! the compute path is unavailable and the CPU fallback is enabled.

use glam::{DVec3, IVec3, Mat4, Vec2, Vec3};
use voxlod_voxel::SECTION_SIZE;

use crate::frustum::{Aabb, Frustum};
use crate::node::{DrawCommand, GpuNode, NO_NODE, flags, request};

/// Upper bound on the ancestor walk per node.
pub const MAX_ITERATIONS: u32 = 10;

/// Camera and viewport state shared by every node test in a frame.
#[derive(Clone, Debug)]
pub struct FrameParams {
    /// Projection times rotation-only view.
    pub view_proj: Mat4,
    pub frustum: Frustum,
    /// Camera's LOD-0 section coordinate.
    pub camera_section: IVec3,
    /// Camera position inside that section, in blocks.
    pub camera_offset: Vec3,
    pub viewport: (u32, u32),
    /// `projection.y_axis.y`, i.e. `1 / tan(fov_y / 2)`.
    pub proj_scale_y: f32,
    pub subdivision_size: f32,
    pub frame: u32,
}

impl FrameParams {
    pub fn new(
        camera_position: DVec3,
        view: Mat4,
        projection: Mat4,
        viewport: (u32, u32),
        subdivision_size: f32,
        frame: u32,
    ) -> Self {
        let (camera_section, camera_offset) = split_camera_position(camera_position);
        let view_proj = projection * view;
        Self {
            frustum: Frustum::from_view_projection(&view_proj),
            view_proj,
            camera_section,
            camera_offset,
            viewport,
            proj_scale_y: projection.y_axis.y,
            subdivision_size,
            frame,
        }
    }
}

/// Split a world position into its section coordinate and the f32 offset
/// inside that section. Keeps far-away coordinates out of f32.
pub fn split_camera_position(position: DVec3) -> (IVec3, Vec3) {
    let size = SECTION_SIZE as f64;
    let section = (position / size).floor();
    let offset = position - section * size;
    (section.as_ivec3(), offset.as_vec3())
}

/// Approximate on-screen height in pixels of a node's cube.
pub fn projected_size(aabb: &Aabb, node_extent: f32, params: &FrameParams) -> f32 {
    let distance = aabb.distance_to(Vec3::ZERO);
    if distance <= 0.0 {
        return f32::INFINITY;
    }
    node_extent * params.proj_scale_y * params.viewport.1 as f32 * 0.5 / distance
}

/// Whether a node of `lod` this large on screen should hand over to its
/// children.
pub fn wants_subdivision(lod: u8, size: f32, params: &FrameParams) -> bool {
    lod > 0 && size > params.subdivision_size
}

/// Max-depth pyramid built from a depth image, level 0 first.
#[derive(Clone, Debug)]
pub struct CpuHiZ {
    levels: Vec<(u32, u32, Vec<f32>)>,
}

impl CpuHiZ {
    /// Build from a `width * height` row-major depth image.
    pub fn build(width: u32, height: u32, depth: &[f32]) -> Self {
        let mut levels = vec![(width.max(1), height.max(1), depth.to_vec())];
        while let Some((w, h, texels)) = levels.last() {
            if *w == 1 && *h == 1 {
                break;
            }
            let (nw, nh) = (w.div_ceil(2), h.div_ceil(2));
            let mut next = vec![0.0f32; (nw * nh) as usize];
            for y in 0..nh {
                for x in 0..nw {
                    let mut max = 0.0f32;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let (sx, sy) = ((2 * x + dx).min(w - 1), (2 * y + dy).min(h - 1));
                        max = max.max(texels[(sy * w + sx) as usize]);
                    }
                    next[(y * nw + x) as usize] = max;
                }
            }
            levels.push((nw, nh, next));
        }
        Self { levels }
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn size(&self) -> (u32, u32) {
        (self.levels[0].0, self.levels[0].1)
    }

    fn load(&self, level: u32, x: u32, y: u32) -> f32 {
        let (w, h, texels) = &self.levels[level as usize];
        texels[(y.min(h - 1) * w + x.min(w - 1)) as usize]
    }
}

/// `true` when the box is certainly behind the depth in `hiz`. Boxes that
/// cross the near plane are never occluded.
pub fn hiz_occluded(aabb: &Aabb, view_proj: &Mat4, hiz: &CpuHiZ) -> bool {
    let mut uv_min = Vec2::splat(f32::MAX);
    let mut uv_max = Vec2::splat(f32::MIN);
    let mut nearest = f32::MAX;
    for corner in aabb.corners() {
        let clip = *view_proj * corner.extend(1.0);
        if clip.w <= 1e-5 {
            return false;
        }
        let ndc = clip.truncate() / clip.w;
        let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        uv_min = uv_min.min(uv);
        uv_max = uv_max.max(uv);
        nearest = nearest.min(ndc.z);
    }
    let uv_min = uv_min.clamp(Vec2::ZERO, Vec2::ONE);
    let uv_max = uv_max.clamp(Vec2::ZERO, Vec2::ONE);
    if uv_min.x >= uv_max.x || uv_min.y >= uv_max.y {
        return false;
    }

    let (width, height) = hiz.size();
    let extent_px = (uv_max - uv_min) * Vec2::new(width as f32, height as f32);
    let level = (extent_px.max_element().max(1.0).log2().ceil() as u32).min(hiz.level_count() - 1);
    let (lw, lh, _) = hiz.levels[level as usize];
    let texel = |uv: Vec2| {
        (
            ((uv.x * lw as f32) as u32).min(lw - 1),
            ((uv.y * lh as f32) as u32).min(lh - 1),
        )
    };
    let (x0, y0) = texel(uv_min);
    let (x1, y1) = texel(uv_max);
    let mut farthest = 0.0f32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            farthest = farthest.max(hiz.load(level, x, y));
        }
    }
    nearest > farthest
}

/// Output of one selection pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selection {
    pub draws: Vec<DrawCommand>,
    /// Request words, see [`request::encode`].
    pub requests: Vec<u32>,
    /// Slots chosen as the visible level of detail this frame.
    pub selected: Vec<u32>,
    /// Visible slots that handed over to their ready children. They count
    /// as rendered: their children depend on them staying resident.
    pub handed_over: Vec<u32>,
    /// Requests dropped because the queue was full.
    pub dropped_requests: u32,
}

impl Selection {
    fn push_request(&mut self, word: u32, max_requests: usize) {
        if self.requests.len() < max_requests {
            self.requests.push(word);
        } else {
            self.dropped_requests += 1;
        }
    }
}

fn node_subdivides(node: &GpuNode, params: &FrameParams) -> bool {
    let aabb = node.relative_aabb(params.camera_section, params.camera_offset);
    let extent = node.key().block_extent() as f32;
    wants_subdivision(node.key().lod(), projected_size(&aabb, extent, params), params)
}

/// Run the traversal over every slot of `nodes`.
///
/// A node is the selected level when it is visible, every ancestor (up to
/// [`MAX_ITERATIONS`]) wants subdivision and has its children ready, and it
/// does not itself hand over to ready children. Selected nodes with resident
/// geometry that pass the HiZ test are drawn.
pub fn select_nodes(
    nodes: &[GpuNode],
    params: &FrameParams,
    hiz: Option<&CpuHiZ>,
    max_requests: usize,
) -> Selection {
    let mut selection = Selection::default();
    for (slot, node) in nodes.iter().enumerate() {
        let slot = slot as u32;
        if !node.has(flags::VALID) {
            continue;
        }
        let aabb = node.relative_aabb(params.camera_section, params.camera_offset);
        if !params.frustum.intersects(&aabb) {
            continue;
        }

        let mut ancestor = node.parent_ptr;
        let mut steps = 0;
        let mut covered_by_ancestor = false;
        while ancestor != NO_NODE {
            if steps == MAX_ITERATIONS {
                covered_by_ancestor = true;
                break;
            }
            let Some(parent) = nodes.get(ancestor as usize) else {
                covered_by_ancestor = true;
                break;
            };
            if !parent.has(flags::CHILDREN_READY) || !node_subdivides(parent, params) {
                covered_by_ancestor = true;
                break;
            }
            ancestor = parent.parent_ptr;
            steps += 1;
        }
        if covered_by_ancestor {
            continue;
        }

        let extent = node.key().block_extent() as f32;
        let size = projected_size(&aabb, extent, params);
        if wants_subdivision(node.key().lod(), size, params) {
            if node.has(flags::CHILDREN_READY) {
                selection.handed_over.push(slot);
                continue;
            }
            selection.push_request(request::encode(slot, request::CHILDREN), max_requests);
        }

        selection.selected.push(slot);
        if !node.has(flags::MESHED) {
            selection.push_request(request::encode(slot, request::MESH), max_requests);
            continue;
        }
        if !node.has(flags::HAS_GEOMETRY) {
            continue;
        }
        if hiz.is_some_and(|hiz| hiz_occluded(&aabb, &params.view_proj, hiz)) {
            continue;
        }
        selection.draws.push(DrawCommand::for_node(slot, node));
    }
    selection
}
