//! GPU render backend.
//!
//! Each renderer owns one [`GpuContext`]: one backend, one linked program,
//! one vertex buffer and one texture object, bound to one output surface.

mod context;
mod device;
pub mod shader;
mod software;
#[cfg(test)]
pub mod testing;
mod wgpu_backend;

pub use context::GpuContext;
pub use device::GpuDevice;
pub use shader::{compile_shader, link_program, CompiledShader, LinkedProgram, ShaderStage};
pub use software::SoftwareBackend;
pub use wgpu_backend::WgpuBackend;

use crate::error::EffectError;
use crate::frame::{QuadVertex, Surface, VideoFrame};
use serde::{Deserialize, Serialize};

/// CPU reference of a fragment program: maps a sampled texel (RGBA in 0..1)
/// to an output color, or `None` to discard the fragment.
pub type ShadeFn = fn([f32; 4]) -> Option<[f32; 4]>;

/// Source for one vertex/fragment program.
#[derive(Debug, Clone)]
pub struct ProgramSource {
    /// Identifies the program in logs and draw records.
    pub label: String,
    pub vertex: &'static str,
    pub fragment: &'static str,
    pub shade: ShadeFn,
}

/// How a draw combines with the surface contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Output overwrites the destination.
    Replace,
    /// `src * ONE + dst * ONE_MINUS_SRC_ALPHA`.
    PremultipliedOver,
}

/// What happens to the surface before a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceLoad {
    /// Clear to transparent black.
    Clear,
    /// Keep existing contents.
    Keep,
}

/// A single textured-quad draw.
pub struct DrawPass<'a> {
    pub vertices: [QuadVertex; 4],
    /// RGBA image bound to the program's sampler.
    pub image: &'a VideoFrame,
    /// Upload the image bottom row first.
    pub flip_y: bool,
    pub load: SurfaceLoad,
}

/// Device-level operations behind a [`GpuContext`].
///
/// `prepare` (re)creates every GPU resource for a program, replacing what a
/// previous call created. `draw` renders one pass into `surface`.
pub trait RenderBackend: Send {
    fn name(&self) -> &'static str;

    fn prepare(
        &mut self,
        source: &ProgramSource,
        program: &LinkedProgram,
        blend: BlendMode,
        width: u32,
        height: u32,
    ) -> Result<(), EffectError>;

    fn draw(&mut self, pass: &DrawPass<'_>, surface: &mut Surface) -> Result<(), EffectError>;
}

/// Selects the backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hardware rendering through wgpu.
    #[default]
    Wgpu,
    /// CPU rasterizer.
    Software,
}

/// Acquires a backend. Fails with `ContextAcquisition` when no device is available.
pub fn acquire_backend(kind: BackendKind) -> Result<Box<dyn RenderBackend>, EffectError> {
    match kind {
        BackendKind::Wgpu => Ok(Box::new(WgpuBackend::new()?)),
        BackendKind::Software => Ok(Box::new(SoftwareBackend::new())),
    }
}
