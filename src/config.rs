//! YAML configuration and live reload.

use crate::capture::CaptureConfig;
use crate::effects::{DecorationOption, EffectOption, EffectSelection, NONE};
use crate::gpu::BackendKind;
use crate::tracking::DetectorConfig;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Effects active at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub filter: String,
    pub decoration: String,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            filter: NONE.to_string(),
            decoration: NONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    pub capture: CaptureConfig,
    pub surface: SurfaceConfig,
    /// Relative texture paths resolve against this directory.
    pub assets_root: PathBuf,
    pub detector: DetectorConfig,
    pub effects: EffectsConfig,
    /// Appended to the built-in decoration catalog.
    pub decorations: Vec<DecorationOption>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)?;
        if config.assets_root.as_os_str().is_empty() {
            config.assets_root = PathBuf::from("assets");
        }
        Ok(config)
    }

    /// Sends every effect that differs from `previous` through `selection`.
    pub fn apply_effects(&self, previous: Option<&Config>, selection: &EffectSelection) {
        let old = previous.map(|c| &c.effects);
        if old.map(|e| &e.filter) != Some(&self.effects.filter) {
            selection.set_effect(&EffectOption::filter(&self.effects.filter));
        }
        if old.map(|e| &e.decoration) != Some(&self.effects.decoration) {
            selection.set_effect(&EffectOption::decoration(&self.effects.decoration));
        }
    }
}

/// Manages configuration file watching and reloading.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    current_config: Option<Config>,
}

impl ConfigWatcher {
    /// Starts watching `path`. `current` is the config already applied.
    pub fn new(path: PathBuf, current: Option<Config>) -> Option<Self> {
        let (tx, rx) = channel();

        match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                    warn!("Failed to watch config file {:?}: {}", path, e);
                    return None;
                }
                info!("Watching config file {:?} for changes", path);
                Some(Self {
                    path,
                    _watcher: watcher,
                    rx,
                    current_config: current,
                })
            }
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                None
            }
        }
    }

    /// Check for changes and return (old_config, new_config) if changed.
    pub fn check_for_changes(&mut self) -> Option<(Option<Config>, Config)> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    needs_reload = true;
                }
            }
        }

        if !needs_reload {
            return None;
        }
        info!("Config file changed, checking for updates...");
        match Config::load(&self.path) {
            Ok(new_config) => {
                if self.current_config.as_ref() == Some(&new_config) {
                    return None;
                }
                let old = self.current_config.replace(new_config.clone());
                Some((old, new_config))
            }
            Err(e) => {
                error!("{:#}", e);
                None
            }
        }
    }

    /// Reloads and routes changed effects through `selection`.
    pub fn apply_changes(&mut self, selection: &EffectSelection) {
        if let Some((old, new)) = self.check_for_changes() {
            if old.as_ref().map(|c| (&c.backend, &c.surface, &c.decorations))
                != Some((&new.backend, &new.surface, &new.decorations))
            {
                warn!("Backend, surface and decoration catalog changes apply on restart");
            }
            new.apply_effects(old.as_ref(), selection);
        }
    }
}
