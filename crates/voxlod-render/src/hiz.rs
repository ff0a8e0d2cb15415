//! Hierarchical max-depth pyramid built from the previous frame's depth.
//!
//! Mip 0 is a copy of the depth buffer; each following mip keeps the
//! farthest depth of a 2x2 footprint. The traversal compares a node's
//! nearest depth against the texels covering it at the level where its
//! screen rectangle spans at most two texels per axis.

use crate::pipeline::{ComputeKernel, compute_kernel, storage_texture_entry, texture_entry};
use crate::traversal::TraversalError;

const COPY_SHADER: &str = include_str!("shaders/hiz_copy.wgsl");
const REDUCE_SHADER: &str = include_str!("shaders/hiz_reduce.wgsl");
const WORKGROUP: u32 = 8;

pub struct HiZPyramid {
    texture: wgpu::Texture,
    full_view: wgpu::TextureView,
    reduce_groups: Vec<wgpu::BindGroup>,
    mip_views: Vec<wgpu::TextureView>,
    copy: ComputeKernel,
    reduce: ComputeKernel,
    width: u32,
    height: u32,
}

fn mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

fn mip_size(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

impl HiZPyramid {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Result<Self, TraversalError> {
        let copy = compute_kernel(
            device,
            "lod_hiz_copy",
            COPY_SHADER,
            &[
                texture_entry(0, wgpu::TextureSampleType::Depth),
                storage_texture_entry(1),
            ],
        )?;
        let reduce = compute_kernel(
            device,
            "lod_hiz_reduce",
            REDUCE_SHADER,
            &[
                texture_entry(0, wgpu::TextureSampleType::Float { filterable: false }),
                storage_texture_entry(1),
            ],
        )?;
        let (texture, full_view, mip_views, reduce_groups) =
            Self::create_targets(device, &reduce.layout, width, height);
        Ok(Self {
            texture,
            full_view,
            reduce_groups,
            mip_views,
            copy,
            reduce,
            width: width.max(1),
            height: height.max(1),
        })
    }

    fn create_targets(
        device: &wgpu::Device,
        reduce_layout: &wgpu::BindGroupLayout,
        width: u32,
        height: u32,
    ) -> (wgpu::Texture, wgpu::TextureView, Vec<wgpu::TextureView>, Vec<wgpu::BindGroup>) {
        let (width, height) = (width.max(1), height.max(1));
        let levels = mip_count(width, height);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("lod_hiz"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mip_views: Vec<_> = (0..levels)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("lod_hiz_mip"),
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        let reduce_groups = mip_views
            .windows(2)
            .map(|pair| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("lod_hiz_reduce"),
                    layout: reduce_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&pair[0]),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&pair[1]),
                        },
                    ],
                })
            })
            .collect();
        (texture, full_view, mip_views, reduce_groups)
    }

    /// Recreate the pyramid for a new depth size. A no-op if unchanged.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return;
        }
        let (texture, full_view, mip_views, reduce_groups) =
            Self::create_targets(device, &self.reduce.layout, width, height);
        self.texture = texture;
        self.full_view = full_view;
        self.mip_views = mip_views;
        self.reduce_groups = reduce_groups;
        self.width = width;
        self.height = height;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn level_count(&self) -> u32 {
        self.texture.mip_level_count()
    }

    /// View over every mip, bound by the traversal.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.full_view
    }

    /// Record the copy and reduction passes. `depth` must be a
    /// single-sampled depth view of the pyramid's size created with
    /// `TEXTURE_BINDING`.
    pub fn build(&self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, depth: &wgpu::TextureView) {
        let copy_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lod_hiz_copy"),
            layout: &self.copy.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&self.mip_views[0]),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("lod_hiz"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.copy.pipeline);
        pass.set_bind_group(0, &copy_group, &[]);
        pass.dispatch_workgroups(
            self.width.div_ceil(WORKGROUP),
            self.height.div_ceil(WORKGROUP),
            1,
        );

        pass.set_pipeline(&self.reduce.pipeline);
        for (i, group) in self.reduce_groups.iter().enumerate() {
            let (w, h) = mip_size(self.width, self.height, i as u32 + 1);
            pass.set_bind_group(0, group, &[]);
            pass.dispatch_workgroups(w.div_ceil(WORKGROUP), h.div_ceil(WORKGROUP), 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_device;

    #[test]
    fn test_mip_chain_dimensions() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(4, 4), 3);
        assert_eq!(mip_count(1920, 1080), 11);
        assert_eq!(mip_size(1920, 1080, 10), (1, 1));
        assert_eq!(mip_size(5, 3, 1), (2, 1));
    }

    #[test]
    fn test_pyramid_builds_from_depth() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let pyramid = match HiZPyramid::new(&device, 64, 32) {
            Ok(pyramid) => pyramid,
            Err(err) => panic!("hiz pipelines failed: {err}"),
        };
        assert_eq!(pyramid.level_count(), 7);

        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("test_depth"),
            size: wgpu::Extent3d {
                width: 64,
                height: 32,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth_view = depth.create_view(&Default::default());
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("test_depth_clear"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0.25),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
        }
        pyramid.build(&device, &mut encoder, &depth_view);
        queue.submit(std::iter::once(encoder.finish()));
        let _ = device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
    }
}
