//! The single place UI events change which effects are active.

use super::{DecorationRenderer, FilterRenderer};
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

pub const NONE: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Filter,
    Decoration,
}

/// A selection event from the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectOption {
    #[serde(rename = "type")]
    pub kind: EffectKind,
    pub name: String,
}

impl EffectOption {
    pub fn filter(name: &str) -> Self {
        Self {
            kind: EffectKind::Filter,
            name: name.to_string(),
        }
    }

    pub fn decoration(name: &str) -> Self {
        Self {
            kind: EffectKind::Decoration,
            name: name.to_string(),
        }
    }
}

#[derive(Debug)]
struct ActiveEffects {
    filter: String,
    decoration: String,
}

/// Active filter and decoration names, forwarded to the renderers on every
/// change. Clones share state.
#[derive(Clone)]
pub struct EffectSelection {
    active: Arc<Mutex<ActiveEffects>>,
    filter: Arc<Mutex<FilterRenderer>>,
    decoration: Arc<Mutex<DecorationRenderer>>,
}

impl EffectSelection {
    pub(super) fn new(filter: Arc<Mutex<FilterRenderer>>, decoration: Arc<Mutex<DecorationRenderer>>) -> Self {
        Self {
            active: Arc::new(Mutex::new(ActiveEffects {
                filter: NONE.to_string(),
                decoration: NONE.to_string(),
            })),
            filter,
            decoration,
        }
    }

    pub fn set_effect(&self, option: &EffectOption) {
        let mut active = lock(&self.active);
        match option.kind {
            EffectKind::Filter => {
                active.filter = option.name.clone();
                lock(&self.filter).set_filter(&option.name);
            }
            EffectKind::Decoration => {
                active.decoration = if lock(&self.decoration).set_decoration(&option.name) {
                    option.name.clone()
                } else {
                    NONE.to_string()
                };
            }
        }
        info!(kind = ?option.kind, name = %option.name, "Effect selected");
    }

    pub fn reset_effects(&self) {
        let mut active = lock(&self.active);
        active.filter = NONE.to_string();
        active.decoration = NONE.to_string();
        lock(&self.filter).set_filter(NONE);
        lock(&self.decoration).set_decoration(NONE);
        info!("Effects reset");
    }

    pub fn active_filter(&self) -> String {
        lock(&self.active).filter.clone()
    }

    pub fn active_decoration(&self) -> String {
        lock(&self.active).decoration.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{builtin_catalog, FilterKind, TextureCache};
    use crate::frame::Surface;
    use crate::gpu::testing::RecordingBackend;

    fn selection() -> EffectSelection {
        let surface = Surface::shared(8, 8);
        let filter = FilterRenderer::new(Box::new(RecordingBackend::new("f").0), surface.clone()).unwrap();
        let decoration = DecorationRenderer::new(
            Box::new(RecordingBackend::new("d").0),
            surface,
            builtin_catalog(),
            Arc::new(TextureCache::empty()),
        )
        .unwrap();
        EffectSelection::new(Arc::new(Mutex::new(filter)), Arc::new(Mutex::new(decoration)))
    }

    #[test]
    fn set_effect_forwards_to_renderer() {
        let selection = selection();
        selection.set_effect(&EffectOption::filter("vintage"));
        selection.set_effect(&EffectOption::decoration("hat"));

        assert_eq!(selection.active_filter(), "vintage");
        assert_eq!(selection.active_decoration(), "hat");
        assert_eq!(lock(&selection.filter).filter(), FilterKind::Vintage);
        assert_eq!(lock(&selection.decoration).decoration().map(|d| d.name.as_str()), Some("hat"));
    }

    #[test]
    fn reset_clears_both() {
        let selection = selection();
        selection.set_effect(&EffectOption::filter("cool"));
        selection.set_effect(&EffectOption::decoration("cat-ears"));
        selection.reset_effects();

        assert_eq!(selection.active_filter(), NONE);
        assert_eq!(selection.active_decoration(), NONE);
        assert_eq!(lock(&selection.filter).filter(), FilterKind::None);
        assert!(lock(&selection.decoration).decoration().is_none());
    }

    #[test]
    fn unknown_decoration_reports_none() {
        let selection = selection();
        selection.set_effect(&EffectOption::decoration("hat"));
        selection.set_effect(&EffectOption::decoration("monocle"));

        assert_eq!(selection.active_decoration(), NONE);
        assert!(lock(&selection.decoration).decoration().is_none());
    }

    #[test]
    fn clones_share_state() {
        let selection = selection();
        let ui = selection.clone();
        ui.set_effect(&EffectOption::filter("warm"));
        assert_eq!(selection.active_filter(), "warm");
    }

    #[test]
    fn parses_ui_event() {
        let option: EffectOption = serde_yaml::from_str("type: decoration\nname: sunglasses\n").unwrap();
        assert_eq!(option, EffectOption::decoration("sunglasses"));
    }
}
