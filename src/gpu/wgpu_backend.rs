//! Hardware backend: renders offscreen with wgpu and reads the result back
//! into the shared surface.

use super::device::GpuDevice;
use super::{BlendMode, DrawPass, LinkedProgram, ProgramSource, RenderBackend, SurfaceLoad};
use crate::error::EffectError;
use crate::frame::{PixelFormat, QuadVertex, Surface};
use std::borrow::Cow;
use tracing::debug;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct BoundTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

/// Everything `prepare` allocates for one program.
struct Resources {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    vertex_buffer: wgpu::Buffer,
    target: wgpu::Texture,
    readback_buffer: wgpu::Buffer,
    padded_bytes_per_row: u32,
    width: u32,
    height: u32,
    texture: Option<BoundTexture>,
}

/// GPU backend owning its own wgpu device.
pub struct WgpuBackend {
    gpu: GpuDevice,
    resources: Option<Resources>,
}

impl WgpuBackend {
    /// Acquires an offscreen device.
    pub fn new() -> Result<Self, EffectError> {
        let gpu = GpuDevice::new(None)?;
        debug!(adapter = ?gpu.adapter.get_info().name, "Acquired wgpu device");
        Ok(Self { gpu, resources: None })
    }

    /// Largest texture edge the device accepts.
    pub fn max_texture_size(&self) -> u32 {
        self.gpu.device.limits().max_texture_dimension_2d
    }

    fn check_extent(&self, what: &str, width: u32, height: u32) -> Result<(), String> {
        let max = self.max_texture_size();
        if width > max || height > max {
            return Err(format!("{} {}x{} exceeds the device limit of {}", what, width, height, max));
        }
        Ok(())
    }

    fn bind_texture(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        sampler: &wgpu::Sampler,
        width: u32,
        height: u32,
    ) -> BoundTexture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Effect Texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Effect Bind Group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(sampler) },
            ],
        });
        BoundTexture { texture, bind_group, width, height }
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn prepare(
        &mut self,
        source: &ProgramSource,
        program: &LinkedProgram,
        blend: BlendMode,
        width: u32,
        height: u32,
    ) -> Result<(), EffectError> {
        self.check_extent("surface", width, height)
            .map_err(EffectError::ContextAcquisition)?;
        // copy_texture_to_buffer needs 256-byte aligned rows
        let padded_bytes_per_row = (width * 4 + 255) & !255;
        let readback_size = padded_bytes_per_row as u64 * height as u64;
        let max_buffer = self.gpu.device.limits().max_buffer_size;
        if readback_size > max_buffer {
            return Err(EffectError::ContextAcquisition(format!(
                "readback of {} bytes exceeds the device limit of {}",
                readback_size, max_buffer
            )));
        }

        let device = &self.gpu.device;

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{} vertex", source.label)),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(program.vertex_wgsl.clone())),
        });
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{} fragment", source.label)),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(program.fragment_wgsl.clone())),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Effect Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Effect Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let blend_state = match blend {
            BlendMode::Replace => None,
            BlendMode::PremultipliedOver => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        };

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(source.label.as_str()),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some(program.vertex_entry.as_str()),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(program.fragment_entry.as_str()),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: blend_state,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let vertex_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Effect Vertex Buffer"),
            size: std::mem::size_of::<[QuadVertex; 4]>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Effect Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Effect Target"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Effect Readback Buffer"),
            size: readback_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        // Dropping the previous set releases its GPU objects.
        self.resources = Some(Resources {
            pipeline,
            bind_group_layout,
            sampler,
            vertex_buffer,
            target,
            readback_buffer,
            padded_bytes_per_row,
            width,
            height,
            texture: None,
        });
        Ok(())
    }

    fn draw(&mut self, pass: &DrawPass<'_>, surface: &mut Surface) -> Result<(), EffectError> {
        let image = pass.image;
        if image.format != PixelFormat::Rgba || image.width == 0 || image.height == 0 {
            return Err(EffectError::Render("texture must be a non-empty RGBA image".to_string()));
        }
        self.check_extent("texture", image.width, image.height)
            .map_err(EffectError::Render)?;

        let device = &self.gpu.device;
        let queue = &self.gpu.queue;
        let res = self
            .resources
            .as_mut()
            .ok_or_else(|| EffectError::Render("no program prepared".to_string()))?;

        // One texture object, reallocated only when the image size changes.
        let size_matches = res
            .texture
            .as_ref()
            .is_some_and(|t| t.width == image.width && t.height == image.height);
        if !size_matches {
            res.texture = Some(Self::bind_texture(
                device,
                &res.bind_group_layout,
                &res.sampler,
                image.width,
                image.height,
            ));
        }
        let Some(bound) = res.texture.as_ref() else {
            return Ok(());
        };

        let texels = if pass.flip_y {
            Cow::Owned(image.flipped_rows())
        } else {
            Cow::Borrowed(&image.data)
        };
        queue.write_texture(
            wgpu::TexelCopyTextureInfo { texture: &bound.texture, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
            &texels,
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(image.width * 4), rows_per_image: Some(image.height) },
            wgpu::Extent3d { width: image.width, height: image.height, depth_or_array_layers: 1 },
        );
        queue.write_buffer(&res.vertex_buffer, 0, bytemuck::cast_slice(&pass.vertices));

        let extent = wgpu::Extent3d { width: res.width, height: res.height, depth_or_array_layers: 1 };
        let load = match pass.load {
            SurfaceLoad::Clear => wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
            SurfaceLoad::Keep => {
                queue.write_texture(
                    wgpu::TexelCopyTextureInfo { texture: &res.target, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
                    &surface.data,
                    wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(res.width * 4), rows_per_image: Some(res.height) },
                    extent,
                );
                wgpu::LoadOp::Load
            }
        };

        let target_view = res.target.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Effect Encoder") });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Effect Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load, store: wgpu::StoreOp::Store },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&res.pipeline);
            render_pass.set_bind_group(0, &bound.bind_group, &[]);
            render_pass.set_vertex_buffer(0, res.vertex_buffer.slice(..));
            render_pass.draw(0..4, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo { texture: &res.target, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
            wgpu::TexelCopyBufferInfo {
                buffer: &res.readback_buffer,
                layout: wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(res.padded_bytes_per_row), rows_per_image: Some(res.height) },
            },
            extent,
        );
        queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = res.readback_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| EffectError::Render(format!("device poll failed: {:?}", e)))?;
        receiver
            .recv()
            .map_err(|e| EffectError::Render(e.to_string()))?
            .map_err(|e| EffectError::Render(format!("readback failed: {:?}", e)))?;

        {
            let mapped = buffer_slice.get_mapped_range();
            let row_bytes = res.width as usize * 4;
            for (dst, src) in surface
                .data
                .chunks_exact_mut(row_bytes)
                .zip(mapped.chunks(res.padded_bytes_per_row as usize))
            {
                dst.copy_from_slice(&src[..row_bytes]);
            }
        }
        res.readback_buffer.unmap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{builtin_catalog, DecorationRenderer, FilterRenderer, TextureCache};
    use crate::frame::VideoFrame;
    use crate::landmark::{Landmark, FACE_MESH_POINTS, FOREHEAD_TOP};
    use crate::utils::lock;
    use std::sync::Arc;

    /// Machines without any adapter (not even a software one) skip these tests.
    fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::new() {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("no wgpu adapter, skipping: {}", e);
                None
            }
        }
    }

    fn blue_surface(width: u32, height: u32) -> crate::frame::SharedSurface {
        let surface = Surface::shared(width, height);
        lock(&surface)
            .data
            .chunks_exact_mut(4)
            .for_each(|px| px.copy_from_slice(&[0, 0, 255, 255]));
        surface
    }

    fn forehead_face() -> Vec<Landmark> {
        let mut landmarks = vec![Landmark::default(); FACE_MESH_POINTS];
        landmarks[FOREHEAD_TOP] = Landmark::new(0.5, 0.5, 0.0);
        landmarks
    }

    #[test]
    fn identity_filter_is_upright_with_padded_rows() {
        let Some(backend) = backend() else { return };
        // 3 px rows are 12 bytes, padded to 256 for readback.
        let surface = Surface::shared(3, 2);
        let mut renderer = FilterRenderer::new(Box::new(backend), surface.clone()).unwrap();
        let mut frame = VideoFrame::solid(3, 2, [0, 0, 0, 255]);
        for (i, byte) in frame.data.iter_mut().enumerate() {
            if i % 4 != 3 {
                *byte = (i * 17 % 256) as u8;
            }
        }
        renderer.render(&frame);
        assert_eq!(lock(&surface).data, frame.data);
    }

    #[test]
    fn filter_switch_rebuilds_program() {
        let Some(backend) = backend() else { return };
        let surface = Surface::shared(4, 4);
        let mut renderer = FilterRenderer::new(Box::new(backend), surface.clone()).unwrap();

        renderer.set_filter("grayscale");
        renderer.render(&VideoFrame::solid(4, 4, [255, 0, 0, 255]));
        assert_eq!(lock(&surface).pixel(1, 2), Some([76, 76, 76, 255]));

        renderer.set_filter("warm");
        renderer.render(&VideoFrame::solid(4, 4, [100, 100, 100, 255]));
        assert_eq!(lock(&surface).pixel(1, 2), Some([110, 105, 95, 255]));
    }

    #[test]
    fn placeholder_blends_premultiplied_over_surface() {
        let Some(backend) = backend() else { return };
        let surface = blue_surface(64, 48);
        let mut renderer = DecorationRenderer::new(
            Box::new(backend),
            surface.clone(),
            builtin_catalog(),
            Arc::new(TextureCache::empty()),
        )
        .unwrap();
        renderer.set_decoration("hat");
        renderer.render(&forehead_face());

        let surface = lock(&surface);
        assert_eq!(surface.pixel(32, 14), Some([255, 0, 55, 255]));
        assert_eq!(surface.pixel(1, 14), Some([0, 0, 255, 255]));
    }

    #[test]
    fn oversized_surface_fails_construction() {
        let Some(backend) = backend() else { return };
        let max = backend.max_texture_size();
        let result = FilterRenderer::new(Box::new(backend), Surface::shared(max + 1, 1));
        assert!(matches!(result, Err(EffectError::ContextAcquisition(_))));
    }

    #[test]
    fn oversized_texture_skips_draw() {
        let Some(backend) = backend() else { return };
        let max = backend.max_texture_size();
        let surface = blue_surface(64, 48);
        let textures = Arc::new(TextureCache::empty());
        textures.insert("hat", VideoFrame::solid(max + 1, 1, [255, 255, 255, 255]));
        let mut renderer =
            DecorationRenderer::new(Box::new(backend), surface.clone(), builtin_catalog(), textures).unwrap();
        renderer.set_decoration("hat");
        renderer.render(&forehead_face());

        assert!(renderer.is_enabled());
        assert!(lock(&surface).data.chunks_exact(4).all(|px| px == [0, 0, 255, 255]));
    }
}
