//! CPU rasterizer with the same conventions as the wgpu backend.
//!
//! Clip space is y-up, surface rows are top-down, texture coordinate t = 0
//! addresses the first uploaded row. Texels are sampled nearest with
//! clamp-to-edge, outputs are clamped to [0, 1] and rounded to u8 like a
//! unorm color buffer. Only axis-aligned quads are supported.

use super::{BlendMode, DrawPass, LinkedProgram, ProgramSource, RenderBackend, ShadeFn, SurfaceLoad};
use crate::error::EffectError;
use crate::frame::{PixelFormat, QuadVertex, Surface, VideoFrame};

struct Prepared {
    shade: ShadeFn,
    blend: BlendMode,
}

/// Deterministic software implementation of [`RenderBackend`].
pub struct SoftwareBackend {
    program: Option<Prepared>,
    vertices: [QuadVertex; 4],
    texture: Option<VideoFrame>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            program: None,
            vertices: QuadVertex::FULLSCREEN,
            texture: None,
        }
    }

    fn upload(&mut self, image: &VideoFrame, flip_y: bool) {
        let data = if flip_y {
            image.flipped_rows()
        } else {
            image.data.clone()
        };
        self.texture = Some(VideoFrame::from_data(image.width, image.height, PixelFormat::Rgba, data));
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn prepare(
        &mut self,
        source: &ProgramSource,
        _program: &LinkedProgram,
        blend: BlendMode,
        _width: u32,
        _height: u32,
    ) -> Result<(), EffectError> {
        self.program = Some(Prepared {
            shade: source.shade,
            blend,
        });
        self.vertices = QuadVertex::FULLSCREEN;
        self.texture = None;
        Ok(())
    }

    fn draw(&mut self, pass: &DrawPass<'_>, surface: &mut Surface) -> Result<(), EffectError> {
        if self.program.is_none() {
            return Err(EffectError::Render("no program prepared".to_string()));
        }
        if pass.image.format != PixelFormat::Rgba || pass.image.width == 0 || pass.image.height == 0 {
            return Err(EffectError::Render("texture must be a non-empty RGBA image".to_string()));
        }

        self.upload(pass.image, pass.flip_y);
        self.vertices = pass.vertices;
        if pass.load == SurfaceLoad::Clear {
            surface.clear();
        }

        let (Some(program), Some(texture)) = (&self.program, &self.texture) else {
            return Ok(());
        };
        rasterize(&self.vertices, texture, program.shade, program.blend, surface);
        Ok(())
    }
}

fn rasterize(vertices: &[QuadVertex; 4], texture: &VideoFrame, shade: ShadeFn, blend: BlendMode, surface: &mut Surface) {
    let min_x = vertices.iter().map(|v| v.position[0]).fold(f32::INFINITY, f32::min);
    let max_x = vertices.iter().map(|v| v.position[0]).fold(f32::NEG_INFINITY, f32::max);
    let min_y = vertices.iter().map(|v| v.position[1]).fold(f32::INFINITY, f32::min);
    let max_y = vertices.iter().map(|v| v.position[1]).fold(f32::NEG_INFINITY, f32::max);
    if max_x <= min_x || max_y <= min_y {
        return;
    }

    let uv0 = tex_coords_at(vertices, min_x, min_y);
    let uv1 = tex_coords_at(vertices, max_x, max_y);
    let (width, height) = (surface.width as f32, surface.height as f32);

    for py in 0..surface.height {
        let ndc_y = 1.0 - (py as f32 + 0.5) / height * 2.0;
        if ndc_y < min_y || ndc_y >= max_y {
            continue;
        }
        let t = uv0[1] + (uv1[1] - uv0[1]) * ((ndc_y - min_y) / (max_y - min_y));

        for px in 0..surface.width {
            let ndc_x = (px as f32 + 0.5) / width * 2.0 - 1.0;
            if ndc_x < min_x || ndc_x >= max_x {
                continue;
            }
            let s = uv0[0] + (uv1[0] - uv0[0]) * ((ndc_x - min_x) / (max_x - min_x));

            let Some(color) = shade(sample_nearest(texture, s, t)) else {
                continue;
            };
            let i = (py as usize * surface.width as usize + px as usize) * 4;
            let dst = &mut surface.data[i..i + 4];
            let out = match blend {
                BlendMode::Replace => color,
                BlendMode::PremultipliedOver => {
                    let keep = 1.0 - color[3];
                    [
                        color[0] + to_unit(dst[0]) * keep,
                        color[1] + to_unit(dst[1]) * keep,
                        color[2] + to_unit(dst[2]) * keep,
                        color[3] + to_unit(dst[3]) * keep,
                    ]
                }
            };
            for (d, v) in dst.iter_mut().zip(out) {
                *d = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
    }
}

/// Texture coordinates of the vertex closest to `(x, y)`.
fn tex_coords_at(vertices: &[QuadVertex; 4], x: f32, y: f32) -> [f32; 2] {
    let distance = |v: &QuadVertex| (v.position[0] - x).powi(2) + (v.position[1] - y).powi(2);
    vertices
        .iter()
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
        .map(|v| v.tex_coords)
        .unwrap_or([0.0, 0.0])
}

fn sample_nearest(texture: &VideoFrame, s: f32, t: f32) -> [f32; 4] {
    let tx = ((s * texture.width as f32).floor() as i64).clamp(0, texture.width as i64 - 1) as u32;
    let ty = ((t * texture.height as f32).floor() as i64).clamp(0, texture.height as i64 - 1) as u32;
    let px = texture.pixel(tx, ty).unwrap_or([0, 0, 0, 0]);
    [to_unit(px[0]), to_unit(px[1]), to_unit(px[2]), to_unit(px[3])]
}

fn to_unit(v: u8) -> f32 {
    v as f32 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::shader::{compile_shader, link_program, ShaderStage, QUAD_VERTEX_SHADER};

    fn prepared(shade: ShadeFn, blend: BlendMode) -> SoftwareBackend {
        let source = ProgramSource {
            label: "test".to_string(),
            vertex: QUAD_VERTEX_SHADER,
            fragment: crate::effects::FilterKind::None.fragment_source(),
            shade,
        };
        let vs = compile_shader(ShaderStage::Vertex, source.vertex).unwrap();
        let fs = compile_shader(ShaderStage::Fragment, source.fragment).unwrap();
        let linked = link_program(&vs, &fs).unwrap();
        let mut backend = SoftwareBackend::new();
        backend.prepare(&source, &linked, blend, 4, 4).unwrap();
        backend
    }

    #[test]
    fn flipped_upload_keeps_frame_upright() {
        let mut backend = prepared(|c| Some(c), BlendMode::Replace);
        let mut image = VideoFrame::solid(2, 2, [0, 0, 0, 255]);
        // Top-left pixel white.
        image.data[0..4].copy_from_slice(&[255, 255, 255, 255]);

        let mut surface = Surface::new(4, 4);
        let pass = DrawPass {
            vertices: QuadVertex::FULLSCREEN,
            image: &image,
            flip_y: true,
            load: SurfaceLoad::Clear,
        };
        backend.draw(&pass, &mut surface).unwrap();

        assert_eq!(surface.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(surface.pixel(3, 3), Some([0, 0, 0, 255]));
    }

    #[test]
    fn premultiplied_over_composites() {
        let mut backend = prepared(|c| Some(c), BlendMode::PremultipliedOver);
        let mut surface = Surface::new(4, 4);
        surface.data.chunks_exact_mut(4).for_each(|px| px.copy_from_slice(&[0, 0, 255, 255]));

        let image = VideoFrame::solid(1, 1, [0, 0, 0, 0]);
        let pass = DrawPass {
            vertices: QuadVertex::FULLSCREEN,
            image: &image,
            flip_y: false,
            load: SurfaceLoad::Keep,
        };
        backend.draw(&pass, &mut surface).unwrap();
        // Fully transparent source leaves the destination untouched.
        assert_eq!(surface.pixel(1, 1), Some([0, 0, 255, 255]));
    }

    #[test]
    fn draw_without_program_fails() {
        let mut backend = SoftwareBackend::new();
        let image = VideoFrame::solid(1, 1, [0, 0, 0, 255]);
        let pass = DrawPass {
            vertices: QuadVertex::FULLSCREEN,
            image: &image,
            flip_y: false,
            load: SurfaceLoad::Clear,
        };
        assert!(backend.draw(&pass, &mut Surface::new(2, 2)).is_err());
    }
}
