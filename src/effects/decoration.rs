//! Landmark-anchored sprite overlays.

use super::texture::TextureCache;
use crate::error::EffectError;
use crate::frame::{QuadVertex, SharedSurface, VideoFrame};
use crate::gpu::shader::QUAD_VERTEX_SHADER;
use crate::gpu::{BlendMode, DrawPass, GpuContext, ProgramSource, RenderBackend, SurfaceLoad};
use crate::landmark::{self, Landmark, FOREHEAD_TOP, LEFT_EYE_INNER, LEFT_EYE_OUTER, RIGHT_EYE_INNER, RIGHT_EYE_OUTER};
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DECORATION_SHADER: &str = r#"#version 450
layout(location = 0) in vec2 v_tex_coord;
layout(location = 0) out vec4 frag_color;
layout(set = 0, binding = 0) uniform texture2D u_image;
layout(set = 0, binding = 1) uniform sampler u_sampler;

void main() {
    vec4 color = texture(sampler2D(u_image, u_sampler), v_tex_coord);
    if (color.a < 0.01) {
        discard;
    }
    frag_color = color;
}
"#;

const DISCARD_ALPHA: f32 = 0.01;

/// Width-to-height ratio assumed while the texture is still loading.
const FALLBACK_ASPECT: f32 = 0.3;

/// Single-anchor sprites span this fraction of the surface width at scale 0.5.
const SINGLE_ANCHOR_WIDTH: f32 = 0.3;
const SINGLE_ANCHOR_SCALE: f32 = 2.0;
const SINGLE_ANCHOR_HEIGHT_RATIO: f32 = 0.8;

const DEFAULT_PLACEHOLDER: [u8; 4] = [255, 0, 0, 200];

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: f32,
    pub y: f32,
}

/// Multipliers applied to two-anchor sprite width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoAnchorTuning {
    pub extra_scale: f32,
    pub width_adjust: f32,
}

impl Default for TwoAnchorTuning {
    fn default() -> Self {
        Self {
            extra_scale: 1.5,
            width_adjust: 1.8,
        }
    }
}

/// Alternate tuning used when both `anchors` are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefinedTuning {
    pub anchors: [usize; 2],
    pub tuning: TwoAnchorTuning,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecorationOption {
    pub name: String,
    /// Path or `file://` URL of the sprite image.
    pub texture: String,
    pub scale: f32,
    /// Fractions of the surface width and height.
    #[serde(default)]
    pub offset: Offset,
    pub anchor_points: Vec<usize>,
    /// Solid RGBA drawn until the texture has loaded.
    #[serde(default = "default_placeholder")]
    pub placeholder: [u8; 4],
    #[serde(default)]
    pub tuning: TwoAnchorTuning,
    #[serde(default)]
    pub refined: Option<RefinedTuning>,
}

fn default_placeholder() -> [u8; 4] {
    DEFAULT_PLACEHOLDER
}

impl DecorationOption {
    pub fn validate(&self) -> Result<(), EffectError> {
        let invalid = |reason: &str| EffectError::InvalidDecoration {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() || self.name == "none" {
            return Err(invalid("reserved or empty name"));
        }
        if !matches!(self.anchor_points.len(), 1 | 2) {
            return Err(invalid("expected one or two anchor points"));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(invalid("scale must be positive"));
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("decoration:{}", self.name)
    }
}

pub fn builtin_catalog() -> Vec<DecorationOption> {
    vec![
        DecorationOption {
            name: "sunglasses".to_string(),
            texture: "textures/sunglasses.png".to_string(),
            scale: 1.5,
            offset: Offset { x: 0.0, y: 0.02 },
            anchor_points: vec![LEFT_EYE_INNER, RIGHT_EYE_INNER],
            placeholder: [0, 0, 0, 200],
            tuning: TwoAnchorTuning::default(),
            refined: Some(RefinedTuning {
                anchors: [LEFT_EYE_OUTER, RIGHT_EYE_OUTER],
                tuning: TwoAnchorTuning {
                    extra_scale: 1.0,
                    width_adjust: 1.5,
                },
            }),
        },
        DecorationOption {
            name: "hat".to_string(),
            texture: "textures/hat.png".to_string(),
            scale: 1.5,
            offset: Offset { x: 0.0, y: -0.2 },
            anchor_points: vec![FOREHEAD_TOP],
            placeholder: [255, 0, 0, 200],
            tuning: TwoAnchorTuning::default(),
            refined: None,
        },
        DecorationOption {
            name: "cat-ears".to_string(),
            texture: "textures/cat-ears.png".to_string(),
            scale: 1.0,
            offset: Offset { x: 0.0, y: -0.15 },
            anchor_points: vec![FOREHEAD_TOP],
            placeholder: [255, 150, 200, 200],
            tuning: TwoAnchorTuning::default(),
            refined: None,
        },
    ]
}

/// Built-in entries followed by `extra`. An extra entry replaces the
/// built-in of the same name.
pub fn build_catalog(extra: &[DecorationOption]) -> Result<Vec<DecorationOption>, EffectError> {
    let mut catalog = builtin_catalog();
    for option in extra {
        option.validate()?;
        match catalog.iter_mut().find(|o| o.name == option.name) {
            Some(existing) => *existing = option.clone(),
            None => catalog.push(option.clone()),
        }
    }
    Ok(catalog)
}

/// Sprite bounds in clip space (y up).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpriteBox {
    pub left: f32,
    pub right: f32,
    pub bottom: f32,
    pub top: f32,
}

impl SpriteBox {
    /// Builds the box from a center and size in top-down surface pixels.
    fn from_pixels(center_x: f32, center_y: f32, width: f32, height: f32, surface: (u32, u32)) -> Self {
        let (sw, sh) = (surface.0 as f32, surface.1 as f32);
        let to_ndc = |v: f32, extent: f32| v / extent * 2.0 - 1.0;
        Self {
            left: to_ndc(center_x - width / 2.0, sw),
            right: to_ndc(center_x + width / 2.0, sw),
            top: -to_ndc(center_y - height / 2.0, sh),
            bottom: -to_ndc(center_y + height / 2.0, sh),
        }
    }

    /// Quad with sprite row 0 along the top edge.
    pub fn vertices(&self) -> [QuadVertex; 4] {
        [
            QuadVertex { position: [self.left, self.bottom], tex_coords: [0.0, 1.0] },
            QuadVertex { position: [self.right, self.bottom], tex_coords: [1.0, 1.0] },
            QuadVertex { position: [self.left, self.top], tex_coords: [0.0, 0.0] },
            QuadVertex { position: [self.right, self.top], tex_coords: [1.0, 0.0] },
        ]
    }
}

/// Computes where `option` goes on a `surface`-sized output. Returns `None`
/// when a required anchor is missing from `landmarks`.
pub fn place_sprite(
    option: &DecorationOption,
    landmarks: &[Landmark],
    surface: (u32, u32),
    texture_size: Option<(u32, u32)>,
) -> Option<SpriteBox> {
    let (sw, sh) = (surface.0 as f32, surface.1 as f32);
    match option.anchor_points[..] {
        [left_index, right_index] => {
            let left = landmark::get(landmarks, left_index)?;
            let right = landmark::get(landmarks, right_index)?;

            let tuning = match option.refined {
                Some(refined)
                    if refined
                        .anchors
                        .iter()
                        .all(|&i| landmark::get(landmarks, i).is_some()) =>
                {
                    refined.tuning
                }
                _ => option.tuning,
            };

            let width = (right.x - left.x).abs() * sw * option.scale * tuning.extra_scale * tuning.width_adjust;
            let aspect = match texture_size {
                Some((w, h)) if w > 0 && h > 0 => w as f32 / h as f32,
                _ => FALLBACK_ASPECT,
            };
            let height = width / aspect;

            let center_x = (left.x + right.x) / 2.0 * sw + option.offset.x * sw;
            let center_y = (left.y + right.y) / 2.0 * sh + option.offset.y * sh;
            Some(SpriteBox::from_pixels(center_x, center_y, width, height, surface))
        }
        [index] => {
            let anchor = landmark::get(landmarks, index)?;
            let width = sw * SINGLE_ANCHOR_WIDTH * (option.scale * SINGLE_ANCHOR_SCALE);
            let height = width * SINGLE_ANCHOR_HEIGHT_RATIO;
            let x = anchor.x * sw + option.offset.x * sw;
            let y = anchor.y * sh + option.offset.y * sh;
            Some(SpriteBox::from_pixels(x, y, width, height, surface))
        }
        _ => None,
    }
}

fn program_for(label: String) -> ProgramSource {
    ProgramSource {
        label,
        vertex: QUAD_VERTEX_SHADER,
        fragment: DECORATION_SHADER,
        shade: |c| (c[3] >= DISCARD_ALPHA).then_some(c),
    }
}

/// Composites the active decoration over the surface.
pub struct DecorationRenderer {
    context: Option<GpuContext>,
    surface: SharedSurface,
    catalog: Vec<DecorationOption>,
    textures: Arc<TextureCache>,
    current: Option<usize>,
    active: bool,
}

impl DecorationRenderer {
    pub fn new(
        backend: Box<dyn RenderBackend>,
        surface: SharedSurface,
        catalog: Vec<DecorationOption>,
        textures: Arc<TextureCache>,
    ) -> Result<Self, EffectError> {
        for option in &catalog {
            option.validate()?;
        }
        let context = {
            let target = lock(&surface);
            GpuContext::initialize(
                backend,
                &target,
                &program_for("decoration:none".to_string()),
                BlendMode::PremultipliedOver,
            )?
        };
        info!("Decoration renderer initialized with {} decorations", catalog.len());
        Ok(Self {
            context: Some(context),
            surface,
            catalog,
            textures,
            current: None,
            active: true,
        })
    }

    /// A renderer whose render calls are no-ops.
    pub fn disabled(surface: SharedSurface, catalog: Vec<DecorationOption>, textures: Arc<TextureCache>) -> Self {
        Self {
            context: None,
            surface,
            catalog,
            textures,
            current: None,
            active: false,
        }
    }

    /// `"none"` or an unknown name clears the active decoration. Returns
    /// whether a catalog entry is now active.
    pub fn set_decoration(&mut self, name: &str) -> bool {
        self.current = self.catalog.iter().position(|o| o.name == name);
        if self.current.is_none() && name != "none" {
            debug!(requested = name, "Unknown decoration, clearing");
        }
        self.current.is_some()
    }

    pub fn decoration(&self) -> Option<&DecorationOption> {
        self.current.and_then(|i| self.catalog.get(i))
    }

    pub fn catalog(&self) -> &[DecorationOption] {
        &self.catalog
    }

    pub fn is_enabled(&self) -> bool {
        self.active && self.context.is_some()
    }

    /// Draws the active decoration anchored to `landmarks`.
    pub fn render(&mut self, landmarks: &[Landmark]) {
        if !self.active || landmarks.is_empty() {
            return;
        }
        let Some(option) = self.current.and_then(|i| self.catalog.get(i)) else {
            return;
        };
        let Some(context) = self.context.as_mut() else {
            return;
        };

        let texture = self.textures.get(&option.name);
        let sprite = place_sprite(
            option,
            landmarks,
            context.surface_size(),
            texture.as_ref().map(|t| (t.width, t.height)),
        );
        let Some(sprite) = sprite else {
            debug!(decoration = %option.name, "Anchor missing, skipping frame");
            return;
        };

        let label = option.label();
        if context.program() != label {
            if let Err(e) = context.reinitialize(&program_for(label.clone())) {
                error!("Failed to rebuild decoration program '{}': {}", label, e);
                self.context = None;
                return;
            }
        }

        let placeholder;
        let image: &VideoFrame = match &texture {
            Some(texture) => texture.as_ref(),
            None => {
                placeholder = VideoFrame::solid(1, 1, option.placeholder);
                &placeholder
            }
        };
        let pass = DrawPass {
            vertices: sprite.vertices(),
            image,
            flip_y: false,
            load: SurfaceLoad::Keep,
        };
        let mut surface = lock(&self.surface);
        if let Err(e) = context.draw(&pass, &mut surface) {
            warn!("Decoration draw failed: {}", e);
        }
    }

    /// Halts rendering and clears the active decoration.
    pub fn stop(&mut self) {
        self.active = false;
        self.current = None;
    }

    /// Resumes rendering after `stop`. Returns false when the GPU context is gone.
    pub fn initialize(&mut self) -> bool {
        self.active = self.context.is_some();
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Surface;
    use crate::gpu::testing::{DrawLog, RecordingBackend};
    use crate::gpu::SoftwareBackend;

    const EPS: f32 = 1e-4;

    fn face(points: &[(usize, f32, f32)]) -> Vec<Landmark> {
        let mut landmarks = vec![Landmark::default(); landmark::FACE_MESH_POINTS];
        for &(i, x, y) in points {
            landmarks[i] = Landmark::new(x, y, 0.0);
        }
        landmarks
    }

    fn option(name: &str) -> DecorationOption {
        builtin_catalog().into_iter().find(|o| o.name == name).unwrap()
    }

    fn assert_box(actual: SpriteBox, expected: [f32; 4]) {
        let got = [actual.left, actual.right, actual.bottom, actual.top];
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < EPS, "got {:?}, expected {:?}", got, expected);
        }
    }

    fn recording(textures: TextureCache) -> (DecorationRenderer, DrawLog) {
        let (backend, log) = RecordingBackend::new("decoration");
        let renderer = DecorationRenderer::new(
            Box::new(backend),
            Surface::shared(640, 480),
            builtin_catalog(),
            Arc::new(textures),
        )
        .unwrap();
        (renderer, log)
    }

    #[test]
    fn two_anchor_placement_is_deterministic() {
        let landmarks = face(&[(LEFT_EYE_INNER, 0.4, 0.5), (RIGHT_EYE_INNER, 0.6, 0.5)]);
        let sunglasses = option("sunglasses");
        let first = place_sprite(&sunglasses, &landmarks, (640, 480), Some((300, 100))).unwrap();
        let second = place_sprite(&sunglasses, &landmarks, (640, 480), Some((300, 100))).unwrap();
        assert_eq!(first, second);
        // Eye corners are tracked, so width = 0.2 * 640 * 1.5 * 1.0 * 1.5 = 288.
        assert_box(first, [-0.45, 0.45, -0.24, 0.16]);
    }

    #[test]
    fn two_anchor_uses_fallback_aspect_before_texture_loads() {
        let landmarks = face(&[(LEFT_EYE_INNER, 0.4, 0.5), (RIGHT_EYE_INNER, 0.6, 0.5)]);
        let sprite = place_sprite(&option("sunglasses"), &landmarks, (640, 480), None).unwrap();
        // Height = 288 / 0.3 = 960.
        assert_box(sprite, [-0.45, 0.45, -2.04, 1.96]);
    }

    #[test]
    fn refined_tuning_requires_both_anchors() {
        let custom = DecorationOption {
            name: "mustache".to_string(),
            texture: "textures/mustache.png".to_string(),
            scale: 1.0,
            offset: Offset::default(),
            anchor_points: vec![1, 10],
            placeholder: DEFAULT_PLACEHOLDER,
            tuning: TwoAnchorTuning::default(),
            refined: Some(RefinedTuning {
                anchors: [33, 263],
                tuning: TwoAnchorTuning { extra_scale: 1.0, width_adjust: 1.5 },
            }),
        };
        let mut landmarks = vec![Landmark::default(); 11];
        landmarks[1] = Landmark::new(0.25, 0.5, 0.0);
        landmarks[10] = Landmark::new(0.75, 0.5, 0.0);

        // Default tuning: 0.5 * 100 * 1.0 * 1.5 * 1.8 = 135 px.
        let short = place_sprite(&custom, &landmarks, (100, 100), Some((1, 1))).unwrap();
        assert!(((short.right - short.left) - 2.7).abs() < EPS);

        // Refined tuning: 0.5 * 100 * 1.0 * 1.0 * 1.5 = 75 px.
        landmarks.resize(264, Landmark::default());
        let full = place_sprite(&custom, &landmarks, (100, 100), Some((1, 1))).unwrap();
        assert!(((full.right - full.left) - 1.5).abs() < EPS);
    }

    #[test]
    fn single_anchor_placement() {
        let landmarks = face(&[(FOREHEAD_TOP, 0.5, 0.3)]);
        let sprite = place_sprite(&option("hat"), &landmarks, (640, 480), None).unwrap();
        // 640 * 0.3 * 3.0 = 576 wide, 460.8 tall, centered at (320, 48).
        assert_box(sprite, [-0.9, 0.9, -0.16, 1.76]);
    }

    #[test]
    fn missing_anchor_skips_draw() {
        let (mut renderer, log) = recording(TextureCache::empty());
        renderer.set_decoration("sunglasses");
        renderer.render(&vec![Landmark::new(0.5, 0.5, 0.0); 200]);
        renderer.render(&[]);
        assert_eq!(log.draw_count(), 0);
        assert!(place_sprite(&option("hat"), &[Landmark::default(); 5], (640, 480), None).is_none());
    }

    #[test]
    fn placeholder_drawn_until_texture_loads() {
        let textures = Arc::new(TextureCache::empty());
        let (backend, log) = RecordingBackend::new("decoration");
        let mut renderer =
            DecorationRenderer::new(Box::new(backend), Surface::shared(640, 480), builtin_catalog(), textures.clone())
                .unwrap();
        let landmarks = face(&[(LEFT_EYE_INNER, 0.4, 0.5), (RIGHT_EYE_INNER, 0.6, 0.5), (FOREHEAD_TOP, 0.5, 0.3)]);

        renderer.set_decoration("sunglasses");
        renderer.render(&landmarks);
        let draws = log.draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].program, "decoration:sunglasses");
        assert_eq!(draws[0].texture_size, (1, 1));
        assert_eq!(draws[0].first_texel, [0, 0, 0, 200]);
        assert_eq!(draws[0].blend, BlendMode::PremultipliedOver);
        assert_eq!(draws[0].load, SurfaceLoad::Keep);

        renderer.set_decoration("cat-ears");
        renderer.render(&landmarks);
        assert_eq!(log.draws()[1].first_texel, [255, 150, 200, 200]);

        textures.insert("cat-ears", VideoFrame::solid(8, 4, [9, 9, 9, 255]));
        renderer.render(&landmarks);
        assert_eq!(log.draws()[2].texture_size, (8, 4));
    }

    #[test]
    fn switching_decoration_rebuilds_program() {
        let (mut renderer, log) = recording(TextureCache::empty());
        let landmarks = face(&[(FOREHEAD_TOP, 0.5, 0.3)]);
        renderer.set_decoration("hat");
        renderer.render(&landmarks);
        renderer.render(&landmarks);
        renderer.set_decoration("cat-ears");
        renderer.render(&landmarks);
        // Initial program, hat, cat-ears.
        assert_eq!(log.prepare_count(), 3);

        renderer.set_decoration("none");
        renderer.render(&landmarks);
        renderer.set_decoration("monocle");
        renderer.render(&landmarks);
        assert_eq!(log.draw_count(), 3);
    }

    #[test]
    fn stop_then_render_is_noop() {
        let (mut renderer, log) = recording(TextureCache::empty());
        let landmarks = face(&[(FOREHEAD_TOP, 0.5, 0.3)]);
        renderer.set_decoration("hat");
        renderer.stop();
        renderer.render(&landmarks);
        assert_eq!(log.draw_count(), 0);
        assert!(renderer.decoration().is_none());

        assert!(renderer.initialize());
        renderer.set_decoration("hat");
        renderer.render(&landmarks);
        assert_eq!(log.draw_count(), 1);
    }

    #[test]
    fn placeholder_composites_over_surface() {
        let surface = Surface::shared(64, 48);
        lock(&surface)
            .data
            .chunks_exact_mut(4)
            .for_each(|px| px.copy_from_slice(&[0, 0, 255, 255]));
        let mut renderer = DecorationRenderer::new(
            Box::new(SoftwareBackend::new()),
            surface.clone(),
            builtin_catalog(),
            Arc::new(TextureCache::empty()),
        )
        .unwrap();
        renderer.set_decoration("hat");
        renderer.render(&face(&[(FOREHEAD_TOP, 0.5, 0.5)]));

        let surface = lock(&surface);
        // Hat centered at (32, 14.4); box spans x in [3.2, 60.8].
        assert_eq!(surface.pixel(32, 14), Some([255, 0, 55, 255]));
        assert_eq!(surface.pixel(1, 14), Some([0, 0, 255, 255]));
    }

    #[test]
    fn catalog_validation() {
        let mut bad = option("hat");
        bad.name = "halo".to_string();
        bad.anchor_points = vec![1, 2, 3];
        assert!(matches!(build_catalog(&[bad]), Err(EffectError::InvalidDecoration { .. })));

        let mut replacement = option("hat");
        replacement.scale = 2.0;
        let catalog = build_catalog(&[replacement]).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.iter().find(|o| o.name == "hat").unwrap().scale, 2.0);
    }

    #[test]
    fn decoration_shader_compiles() {
        use crate::gpu::{compile_shader, link_program, ShaderStage};
        let vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        let fs = compile_shader(ShaderStage::Fragment, DECORATION_SHADER).unwrap();
        link_program(&vs, &fs).unwrap();
    }

    #[test]
    fn parses_config_entry() {
        let yaml = "name: monocle\ntexture: file:///opt/monocle.png\nscale: 0.5\nanchor_points: [33]\n";
        let option: DecorationOption = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(option.placeholder, DEFAULT_PLACEHOLDER);
        assert_eq!(option.offset, Offset::default());
        assert_eq!(option.tuning, TwoAnchorTuning::default());
        assert!(option.validate().is_ok());
    }
}
