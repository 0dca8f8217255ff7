//! Error taxonomy for the effect pipeline.

use thiserror::Error;

/// Errors raised inside the render and tracking core.
///
/// None of these escape to the UI layer: renderers and the tracker log them
/// and fall back to a disabled or no-op state.
#[derive(Error, Debug)]
pub enum EffectError {
    /// No GPU context could be acquired for the output surface.
    #[error("GPU context unavailable: {0}")]
    ContextAcquisition(String),

    /// The output surface has a zero dimension.
    #[error("Invalid surface size {width}x{height}")]
    InvalidSurface { width: u32, height: u32 },

    /// A shader failed to parse or validate.
    #[error("{stage} shader compilation failed: {log}")]
    ShaderCompile { stage: &'static str, log: String },

    /// Vertex and fragment stages could not be linked into a program.
    #[error("Program link failed: {log}")]
    ProgramLink { log: String },

    /// A decoration texture could not be fetched or decoded.
    #[error("Failed to load texture '{source_uri}' for '{name}': {reason}")]
    TextureLoad {
        name: String,
        source_uri: String,
        reason: String,
    },

    /// A catalog entry is malformed.
    #[error("Invalid decoration '{name}': {reason}")]
    InvalidDecoration { name: String, reason: String },

    /// A draw call failed on the backend.
    #[error("Render failed: {0}")]
    Render(String),

    /// The capture loop cannot be (re)started.
    #[error("Face tracker unavailable: {0}")]
    TrackerUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = EffectError::ShaderCompile {
            stage: "fragment",
            log: "unexpected token".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "fragment shader compilation failed: unexpected token"
        );

        let err = EffectError::InvalidSurface { width: 0, height: 720 };
        assert!(err.to_string().contains("0x720"));
    }
}
