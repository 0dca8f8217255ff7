//! Camera effects: color filters, anchored decorations and the selection
//! state that drives them.

mod decoration;
mod filter;
mod selection;
mod texture;

pub use decoration::{
    build_catalog, builtin_catalog, place_sprite, DecorationOption, DecorationRenderer, Offset, RefinedTuning,
    SpriteBox, TwoAnchorTuning,
};
pub use filter::{FilterKind, FilterRenderer};
pub use selection::{EffectKind, EffectOption, EffectSelection, NONE};
pub use texture::{load_texture, resolve_source, TextureCache};

use crate::error::EffectError;
use crate::frame::{SharedSurface, VideoFrame};
use crate::gpu::{acquire_backend, BackendKind, RenderBackend};
use crate::landmark::Landmark;
use crate::tracking::ResultSink;
use crate::utils::lock;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Both renderers over one shared surface.
///
/// Each frame the filter draws first and the decoration composites on top.
pub struct EffectPipeline {
    filter: Arc<Mutex<FilterRenderer>>,
    decoration: Arc<Mutex<DecorationRenderer>>,
    selection: EffectSelection,
    surface: SharedSurface,
}

impl EffectPipeline {
    /// Acquires one backend of `kind` per renderer.
    pub fn new(
        kind: BackendKind,
        surface: SharedSurface,
        catalog: Vec<DecorationOption>,
        textures: Arc<TextureCache>,
    ) -> Self {
        Self::with_backends(acquire_backend(kind), acquire_backend(kind), surface, catalog, textures)
    }

    /// Builds the pipeline from already acquired backends. A renderer whose
    /// backend or program setup fails is left disabled.
    pub fn with_backends(
        filter_backend: Result<Box<dyn RenderBackend>, EffectError>,
        decoration_backend: Result<Box<dyn RenderBackend>, EffectError>,
        surface: SharedSurface,
        catalog: Vec<DecorationOption>,
        textures: Arc<TextureCache>,
    ) -> Self {
        let filter = filter_backend
            .and_then(|backend| FilterRenderer::new(backend, surface.clone()))
            .unwrap_or_else(|e| {
                warn!("Filter renderer disabled: {}", e);
                FilterRenderer::disabled(surface.clone())
            });

        let decoration = decoration_backend
            .and_then(|backend| DecorationRenderer::new(backend, surface.clone(), catalog.clone(), textures.clone()))
            .unwrap_or_else(|e| {
                warn!("Decoration renderer disabled: {}", e);
                DecorationRenderer::disabled(surface.clone(), catalog, textures)
            });

        let filter = Arc::new(Mutex::new(filter));
        let decoration = Arc::new(Mutex::new(decoration));
        let selection = EffectSelection::new(filter.clone(), decoration.clone());
        Self {
            filter,
            decoration,
            selection,
            surface,
        }
    }

    pub fn selection(&self) -> EffectSelection {
        self.selection.clone()
    }

    pub fn surface(&self) -> SharedSurface {
        self.surface.clone()
    }

    /// Names of every decoration in the catalog.
    pub fn decoration_names(&self) -> Vec<String> {
        lock(&self.decoration)
            .catalog()
            .iter()
            .map(|o| o.name.clone())
            .collect()
    }

    /// Filter, then decoration when a face was found.
    pub fn on_results(&self, landmarks: &[Landmark], frame: &VideoFrame) {
        lock(&self.filter).render(frame);
        if !landmarks.is_empty() {
            lock(&self.decoration).render(landmarks);
        }
    }

    /// Stops both renderers and clears the selection. In-flight frames become
    /// no-ops.
    pub fn stop(&self) {
        self.selection.reset_effects();
        lock(&self.filter).stop();
        lock(&self.decoration).stop();
        info!("Effect pipeline stopped");
    }

    /// Restarts renderers stopped by `stop`.
    pub fn initialize(&self) {
        let filter = lock(&self.filter).initialize();
        let decoration = lock(&self.decoration).initialize();
        info!(filter, decoration, "Effect pipeline started");
    }
}

impl ResultSink for EffectPipeline {
    fn on_results(&self, landmarks: &[Landmark], frame: &VideoFrame) {
        EffectPipeline::on_results(self, landmarks, frame);
    }
}
