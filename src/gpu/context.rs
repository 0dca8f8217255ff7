//! Per-renderer GPU context: backend plus the currently linked program.

use super::shader::{compile_shader, link_program, ShaderStage};
use super::{BlendMode, DrawPass, ProgramSource, RenderBackend};
use crate::error::EffectError;
use crate::frame::Surface;
use tracing::{debug, info};

/// GPU resources owned by exactly one renderer and bound to one surface.
pub struct GpuContext {
    backend: Box<dyn RenderBackend>,
    width: u32,
    height: u32,
    blend: BlendMode,
    program: String,
}

impl GpuContext {
    /// Compiles `source` and allocates the program, vertex buffer and texture
    /// object for `surface`.
    pub fn initialize(
        backend: Box<dyn RenderBackend>,
        surface: &Surface,
        source: &ProgramSource,
        blend: BlendMode,
    ) -> Result<Self, EffectError> {
        if surface.width == 0 || surface.height == 0 {
            return Err(EffectError::InvalidSurface {
                width: surface.width,
                height: surface.height,
            });
        }

        let mut context = Self {
            backend,
            width: surface.width,
            height: surface.height,
            blend,
            program: String::new(),
        };
        context.reinitialize(source)?;
        Ok(context)
    }

    /// Rebuilds every GPU resource around a new program, dropping the old ones.
    ///
    /// Runs on every effect switch.
    // TODO: cache one linked program per effect name instead of recompiling.
    pub fn reinitialize(&mut self, source: &ProgramSource) -> Result<(), EffectError> {
        let vertex = compile_shader(ShaderStage::Vertex, source.vertex)?;
        let fragment = compile_shader(ShaderStage::Fragment, source.fragment)?;
        let linked = link_program(&vertex, &fragment)?;
        debug!(program = %source.label, "Linked program");

        self.backend
            .prepare(source, &linked, self.blend, self.width, self.height)?;
        self.program = source.label.clone();

        info!(
            program = %source.label,
            backend = self.backend.name(),
            "GPU resources initialized ({}x{})",
            self.width,
            self.height
        );
        Ok(())
    }

    /// Label of the program the resources were built for.
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn draw(&mut self, pass: &DrawPass<'_>, surface: &mut Surface) -> Result<(), EffectError> {
        if surface.width != self.width || surface.height != self.height {
            return Err(EffectError::Render(format!(
                "surface is {}x{}, context was built for {}x{}",
                surface.width, surface.height, self.width, self.height
            )));
        }
        self.backend.draw(pass, surface)
    }
}
