//! Full-frame color filters.

use crate::error::EffectError;
use crate::frame::{QuadVertex, SharedSurface, VideoFrame};
use crate::gpu::shader::QUAD_VERTEX_SHADER;
use crate::gpu::{BlendMode, DrawPass, GpuContext, ProgramSource, RenderBackend, ShadeFn, SurfaceLoad};
use crate::utils::lock;
use tracing::{debug, error, info, warn};

/// Wraps a filter body in the shared fragment stage interface. The body sees
/// the sampled texel as `color` and writes `frag_color`.
macro_rules! filter_shader {
    ($body:literal) => {
        concat!(
            "#version 450\n",
            "layout(location = 0) in vec2 v_tex_coord;\n",
            "layout(location = 0) out vec4 frag_color;\n",
            "layout(set = 0, binding = 0) uniform texture2D u_image;\n",
            "layout(set = 0, binding = 1) uniform sampler u_sampler;\n",
            "\n",
            "void main() {\n",
            "    vec4 color = texture(sampler2D(u_image, u_sampler), v_tex_coord);\n",
            $body,
            "}\n"
        )
    };
}

const NONE_SHADER: &str = filter_shader!("    frag_color = color;\n");

const GRAYSCALE_SHADER: &str = filter_shader!(
    "    float luma = dot(color.rgb, vec3(0.299, 0.587, 0.114));\n    frag_color = vec4(luma, luma, luma, color.a);\n"
);

const WARM_SHADER: &str =
    filter_shader!("    frag_color = vec4(color.r * 1.1, color.g * 1.05, color.b * 0.95, color.a);\n");

const COOL_SHADER: &str =
    filter_shader!("    frag_color = vec4(color.r * 0.95, color.g * 1.05, color.b * 1.1, color.a);\n");

const VINTAGE_SHADER: &str = filter_shader!(
    "    frag_color = vec4(min(1.0, color.r * 1.1 + 0.04), min(1.0, color.g * 0.9 + 0.02), min(1.0, color.b * 0.8 + 0.02), color.a);\n"
);

/// The filter catalog. `None` is the identity transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    #[default]
    None,
    Grayscale,
    Warm,
    Cool,
    Vintage,
}

impl FilterKind {
    pub const ALL: [FilterKind; 5] = [
        FilterKind::None,
        FilterKind::Grayscale,
        FilterKind::Warm,
        FilterKind::Cool,
        FilterKind::Vintage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Grayscale => "grayscale",
            FilterKind::Warm => "warm",
            FilterKind::Cool => "cool",
            FilterKind::Vintage => "vintage",
        }
    }

    /// Unknown names fall back to the identity filter.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .unwrap_or(FilterKind::None)
    }

    /// Applies the color transform to one RGBA texel in [0, 1]. Mirrors the
    /// fragment program exactly; results are not clamped.
    pub fn apply(self, [r, g, b, a]: [f32; 4]) -> [f32; 4] {
        match self {
            FilterKind::None => [r, g, b, a],
            FilterKind::Grayscale => {
                let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                [luma, luma, luma, a]
            }
            FilterKind::Warm => [r * 1.1, g * 1.05, b * 0.95, a],
            FilterKind::Cool => [r * 0.95, g * 1.05, b * 1.1, a],
            FilterKind::Vintage => [
                (r * 1.1 + 0.04).min(1.0),
                (g * 0.9 + 0.02).min(1.0),
                (b * 0.8 + 0.02).min(1.0),
                a,
            ],
        }
    }

    pub fn fragment_source(self) -> &'static str {
        match self {
            FilterKind::None => NONE_SHADER,
            FilterKind::Grayscale => GRAYSCALE_SHADER,
            FilterKind::Warm => WARM_SHADER,
            FilterKind::Cool => COOL_SHADER,
            FilterKind::Vintage => VINTAGE_SHADER,
        }
    }

    fn label(self) -> String {
        format!("filter:{}", self.name())
    }

    pub fn program(self) -> ProgramSource {
        let shade: ShadeFn = match self {
            FilterKind::None => |c| Some(FilterKind::None.apply(c)),
            FilterKind::Grayscale => |c| Some(FilterKind::Grayscale.apply(c)),
            FilterKind::Warm => |c| Some(FilterKind::Warm.apply(c)),
            FilterKind::Cool => |c| Some(FilterKind::Cool.apply(c)),
            FilterKind::Vintage => |c| Some(FilterKind::Vintage.apply(c)),
        };
        ProgramSource {
            label: self.label(),
            vertex: QUAD_VERTEX_SHADER,
            fragment: self.fragment_source(),
            shade,
        }
    }
}

/// Draws the camera frame to the output surface through the active filter.
pub struct FilterRenderer {
    context: Option<GpuContext>,
    surface: SharedSurface,
    filter: FilterKind,
    active: bool,
}

impl FilterRenderer {
    /// Builds the GPU context with the identity program.
    pub fn new(backend: Box<dyn RenderBackend>, surface: SharedSurface) -> Result<Self, EffectError> {
        let context = {
            let target = lock(&surface);
            GpuContext::initialize(backend, &target, &FilterKind::None.program(), BlendMode::Replace)?
        };
        info!("Filter renderer initialized");
        Ok(Self {
            context: Some(context),
            surface,
            filter: FilterKind::None,
            active: true,
        })
    }

    /// A renderer whose render calls are no-ops.
    pub fn disabled(surface: SharedSurface) -> Self {
        Self {
            context: None,
            surface,
            filter: FilterKind::None,
            active: false,
        }
    }

    /// Takes effect on the next `render`.
    pub fn set_filter(&mut self, name: &str) {
        let filter = FilterKind::from_name(name);
        if filter.name() != name {
            debug!(requested = name, "Unknown filter, using identity");
        }
        self.filter = filter;
    }

    pub fn filter(&self) -> FilterKind {
        self.filter
    }

    pub fn is_enabled(&self) -> bool {
        self.active && self.context.is_some()
    }

    /// Clears the surface and draws `frame` through the active filter.
    pub fn render(&mut self, frame: &VideoFrame) {
        if !self.active {
            return;
        }
        let Some(context) = self.context.as_mut() else {
            return;
        };

        let label = self.filter.label();
        if context.program() != label {
            if let Err(e) = context.reinitialize(&self.filter.program()) {
                error!("Failed to rebuild filter program '{}': {}", label, e);
                self.context = None;
                return;
            }
        }

        let image = frame.as_rgba();
        let pass = DrawPass {
            vertices: QuadVertex::FULLSCREEN,
            image: &image,
            flip_y: true,
            load: SurfaceLoad::Clear,
        };
        let mut surface = lock(&self.surface);
        if let Err(e) = context.draw(&pass, &mut surface) {
            warn!("Filter draw failed: {}", e);
        }
    }

    /// Halts rendering and drops the active filter.
    pub fn stop(&mut self) {
        self.active = false;
        self.filter = FilterKind::None;
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
    use crate::gpu::testing::RecordingBackend;
    use crate::gpu::SoftwareBackend;

    fn software_renderer(width: u32, height: u32) -> (FilterRenderer, SharedSurface) {
        let surface = Surface::shared(width, height);
        let renderer = FilterRenderer::new(Box::new(SoftwareBackend::new()), surface.clone()).unwrap();
        (renderer, surface)
    }

    fn render_solid(filter: &str, rgba: [u8; 4]) -> [u8; 4] {
        let (mut renderer, surface) = software_renderer(4, 4);
        renderer.set_filter(filter);
        renderer.render(&VideoFrame::solid(4, 4, rgba));
        let pixel = lock(&surface).pixel(2, 1).unwrap();
        pixel
    }

    #[test]
    fn identity_filter_reproduces_frame() {
        let (mut renderer, surface) = software_renderer(3, 2);
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
    fn grayscale_of_pure_red() {
        assert_eq!(render_solid("grayscale", [255, 0, 0, 255]), [76, 76, 76, 255]);
    }

    #[test]
    fn color_filters_match_formulas() {
        assert_eq!(render_solid("warm", [100, 100, 100, 255]), [110, 105, 95, 255]);
        assert_eq!(render_solid("cool", [100, 100, 100, 255]), [95, 105, 110, 255]);
        assert_eq!(render_solid("vintage", [100, 100, 100, 255]), [120, 95, 85, 255]);
        // Warm overflows and is clamped by the color buffer.
        assert_eq!(render_solid("warm", [255, 0, 0, 255]), [255, 0, 0, 255]);
        assert_eq!(render_solid("vintage", [255, 255, 255, 255]), [255, 235, 209, 255]);
    }

    #[test]
    fn every_filter_shader_compiles() {
        use crate::gpu::{compile_shader, link_program, ShaderStage};
        let vs = compile_shader(ShaderStage::Vertex, QUAD_VERTEX_SHADER).unwrap();
        for kind in FilterKind::ALL {
            let fs = compile_shader(ShaderStage::Fragment, kind.fragment_source()).unwrap();
            link_program(&vs, &fs).unwrap();
        }
    }

    #[test]
    fn unknown_filter_is_identity() {
        assert_eq!(FilterKind::from_name("sepia"), FilterKind::None);
        assert_eq!(render_solid("sepia", [10, 20, 30, 255]), [10, 20, 30, 255]);
    }

    #[test]
    fn program_rebuilds_lazily() {
        let (backend, log) = RecordingBackend::new("filter");
        let mut renderer = FilterRenderer::new(Box::new(backend), Surface::shared(4, 4)).unwrap();
        let frame = VideoFrame::solid(2, 2, [1, 2, 3, 255]);
        assert_eq!(log.prepare_count(), 1);

        renderer.render(&frame);
        renderer.render(&frame);
        assert_eq!(log.prepare_count(), 1);

        renderer.set_filter("warm");
        renderer.render(&frame);
        renderer.render(&frame);
        assert_eq!(log.prepare_count(), 2);

        let draws = log.draws();
        assert_eq!(draws.len(), 4);
        assert_eq!(draws[3].program, "filter:warm");
        assert!(draws.iter().all(|d| d.flip_y && d.load == SurfaceLoad::Clear));
    }

    #[test]
    fn stop_then_render_is_noop() {
        let (backend, log) = RecordingBackend::new("filter");
        let mut renderer = FilterRenderer::new(Box::new(backend), Surface::shared(4, 4)).unwrap();
        renderer.stop();
        renderer.render(&VideoFrame::solid(2, 2, [0, 0, 0, 255]));
        assert_eq!(log.draw_count(), 0);

        assert!(renderer.initialize());
        renderer.render(&VideoFrame::solid(2, 2, [0, 0, 0, 255]));
        assert_eq!(log.draw_count(), 1);
    }

    #[test]
    fn construction_failure_surfaces_error() {
        let (backend, _log) = RecordingBackend::new("filter");
        let result = FilterRenderer::new(Box::new(backend.failing_after(0)), Surface::shared(4, 4));
        assert!(matches!(result, Err(EffectError::ContextAcquisition(_))));
        assert!(!FilterRenderer::disabled(Surface::shared(4, 4)).is_enabled());
    }

    #[test]
    fn failed_rebuild_disables_renderer() {
        let (backend, log) = RecordingBackend::new("filter");
        let mut renderer = FilterRenderer::new(Box::new(backend.failing_after(1)), Surface::shared(4, 4)).unwrap();
        let frame = VideoFrame::solid(2, 2, [0, 0, 0, 255]);
        renderer.render(&frame);
        assert_eq!(log.draw_count(), 1);

        renderer.set_filter("cool");
        renderer.render(&frame);
        renderer.render(&frame);
        assert!(!renderer.is_enabled());
        assert_eq!(log.draw_count(), 1);
        assert!(!renderer.initialize());
    }
}
