//! Decoration texture preloading.

use super::decoration::DecorationOption;
use crate::error::EffectError;
use crate::frame::{PixelFormat, VideoFrame};
use crate::utils::lock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

type TextureMap = Arc<RwLock<HashMap<String, Arc<VideoFrame>>>>;

/// Decoration name to decoded RGBA bitmap.
///
/// Populated by a background loader; renderers read it once per frame and
/// never wait for it.
#[derive(Default)]
pub struct TextureCache {
    textures: TextureMap,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl TextureCache {
    /// A cache with nothing loaded and nothing loading.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Starts loading every catalog texture on a background thread.
    pub fn preload(catalog: &[DecorationOption], assets_root: impl Into<PathBuf>) -> Self {
        let cache = Self::empty();
        let jobs: Vec<(String, String)> = catalog
            .iter()
            .map(|option| (option.name.clone(), option.texture.clone()))
            .collect();
        let assets_root = assets_root.into();
        let textures = cache.textures.clone();

        let spawned = thread::Builder::new()
            .name("texture-loader".to_string())
            .spawn(move || {
                for (name, source) in jobs {
                    match load_texture(&name, &source, &assets_root) {
                        Ok(frame) => {
                            debug!(decoration = %name, "Loaded texture {}x{}", frame.width, frame.height);
                            write_map(&textures).insert(name, Arc::new(frame));
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
            });
        match spawned {
            Ok(handle) => *lock(&cache.loader) = Some(handle),
            Err(e) => warn!("Failed to start texture loader: {}", e),
        }
        cache
    }

    pub fn get(&self, name: &str) -> Option<Arc<VideoFrame>> {
        self.textures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn insert(&self, name: &str, frame: VideoFrame) {
        write_map(&self.textures).insert(name.to_string(), Arc::new(frame));
    }

    /// Blocks until the background loader has finished.
    pub fn wait(&self) {
        let handle = lock(&self.loader).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Texture loader panicked");
            }
            info!("Texture preloading finished");
        }
    }
}

fn write_map(map: &TextureMap) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<VideoFrame>>> {
    map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves a texture URI to a file path. Accepts plain paths and `file://`
/// URLs; relative paths are taken from `assets_root`.
pub fn resolve_source(source: &str, assets_root: &Path) -> Result<PathBuf, String> {
    let path = match Url::parse(source) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| format!("not a local file URL: {}", source))?,
        // A one-letter scheme is a Windows drive letter.
        Ok(url) if url.scheme().len() > 1 => {
            return Err(format!("unsupported scheme '{}'", url.scheme()));
        }
        _ => PathBuf::from(source),
    };

    if path.is_relative() {
        Ok(assets_root.join(path))
    } else {
        Ok(path)
    }
}

/// Decodes one texture into an RGBA frame.
pub fn load_texture(name: &str, source: &str, assets_root: &Path) -> Result<VideoFrame, EffectError> {
    let texture_error = |reason: String| EffectError::TextureLoad {
        name: name.to_string(),
        source_uri: source.to_string(),
        reason,
    };
    let path = resolve_source(source, assets_root).map_err(texture_error)?;
    let image = image::open(&path).map_err(|e| texture_error(e.to_string()))?;
    let rgba = image.to_rgba8();
    Ok(VideoFrame::from_data(
        rgba.width(),
        rgba.height(),
        PixelFormat::Rgba,
        rgba.into_raw(),
    ))
}
