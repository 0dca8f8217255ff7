//! facefx: face-landmark camera effects CLI.

use anyhow::{Context, Result};
use clap::Parser;
use facefx::capture::{AsyncCapture, CaptureBackend, ImageSource, NokhwaCapture};
use facefx::config::{Config, ConfigWatcher};
use facefx::effects::{build_catalog, EffectOption, EffectPipeline, FilterKind, TextureCache, NONE};
use facefx::frame::Surface;
use facefx::gpu::BackendKind;
use facefx::output::{OutputBackend, PreviewWindow};
use facefx::tracking::{FaceTracker, FrameSource, LandmarkDetector, NoFaceDetector, OnnxLandmarkDetector, TrackingState};
use facefx::utils::{lock, FpsCounter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

/// Face-landmark camera effects.
#[derive(Parser, Debug)]
#[command(name = "facefx")]
#[command(about = "Apply color filters and face-anchored decorations to camera video")]
struct Args {
    /// YAML config file, watched for effect changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Still image to use instead of the camera
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Camera device index
    #[arg(long)]
    device: Option<u32>,

    /// Surface and capture width
    #[arg(long)]
    width: Option<u32>,

    /// Surface and capture height
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Initial filter (none, grayscale, warm, cool, vintage)
    #[arg(short, long)]
    filter: Option<String>,

    /// Initial decoration by catalog name
    #[arg(short, long)]
    decoration: Option<String>,

    /// Render backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Run without a preview window
    #[arg(long)]
    headless: bool,

    /// Stop after this many frames of a still image input
    #[arg(long)]
    frames: Option<u64>,

    /// Write the final surface to this PNG on exit (headless only)
    #[arg(long)]
    save: Option<PathBuf>,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    /// Folds command-line overrides into the loaded config.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(device) = self.device {
            config.capture.device_index = device;
        }
        if let Some(width) = self.width {
            config.capture.width = width;
            config.surface.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
            config.surface.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(filter) = &self.filter {
            config.effects.filter = filter.clone();
        }
        if let Some(decoration) = &self.decoration {
            config.effects.decoration = decoration.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
    }
}

/// Everything that runs between startup and shutdown.
struct Runtime {
    pipeline: Arc<EffectPipeline>,
    tracker: FaceTracker,
    watcher: Option<ConfigWatcher>,
    decorations: Vec<String>,
}

impl Runtime {
    fn start(args: &Args) -> Result<Self> {
        let file_config = match &args.config {
            Some(path) => Config::load(path)?,
            None => Config::parse("{}")?,
        };
        let mut config = file_config.clone();
        args.apply_overrides(&mut config);

        let catalog = build_catalog(&config.decorations)?;
        let textures = Arc::new(TextureCache::preload(&catalog, config.assets_root.clone()));

        let (width, height) = match &args.input {
            // A still image sets the surface size unless overridden.
            Some(path) if args.width.is_none() && args.height.is_none() => image::image_dimensions(path)
                .with_context(|| format!("Failed to read input image {:?}", path))?,
            _ => (config.surface.width, config.surface.height),
        };
        info!("Surface {}x{} on {:?} backend", width, height, config.backend);
        let surface = Surface::shared(width, height);
        let pipeline = Arc::new(EffectPipeline::new(config.backend, surface, catalog, textures));
        config.apply_effects(None, &pipeline.selection());

        let detector: Box<dyn LandmarkDetector> = match OnnxLandmarkDetector::new(config.detector.clone()) {
            Ok(Some(detector)) => Box::new(detector),
            Ok(None) => {
                warn!("Face model {:?} not found, decorations will not be drawn", config.detector.model);
                Box::new(NoFaceDetector)
            }
            Err(e) => {
                warn!("Failed to load face model: {:#}", e);
                Box::new(NoFaceDetector)
            }
        };

        let source: Box<dyn FrameSource> = match &args.input {
            Some(path) => Box::new(ImageSource::open(path, config.capture.fps, args.frames)?),
            None => {
                info!("Opening camera device {}...", config.capture.device_index);
                Box::new(AsyncCapture::new(config.capture.clone())?)
            }
        };

        let mut tracker = FaceTracker::new(source, detector, pipeline.clone());
        tracker.initialize()?;

        let watcher = args
            .config
            .clone()
            .and_then(|path| ConfigWatcher::new(path, Some(file_config)));
        let decorations = pipeline.decoration_names();

        Ok(Self {
            pipeline,
            tracker,
            watcher,
            decorations,
        })
    }

    fn poll_config(&mut self) {
        if let Some(watcher) = &mut self.watcher {
            watcher.apply_changes(&self.pipeline.selection());
        }
    }

    fn cycle_filter(&self) {
        let selection = self.pipeline.selection();
        let current = FilterKind::from_name(&selection.active_filter());
        let index = FilterKind::ALL.iter().position(|&k| k == current).unwrap_or(0);
        let next = FilterKind::ALL[(index + 1) % FilterKind::ALL.len()];
        info!("Filter: {}", next.name());
        selection.set_effect(&EffectOption::filter(next.name()));
    }

    fn cycle_decoration(&self) {
        let selection = self.pipeline.selection();
        let mut names = vec![NONE.to_string()];
        names.extend(self.decorations.iter().cloned());
        let current = selection.active_decoration();
        let index = names.iter().position(|n| *n == current).unwrap_or(0);
        let next = &names[(index + 1) % names.len()];
        info!("Decoration: {}", next);
        selection.set_effect(&EffectOption::decoration(next));
    }

    fn shutdown(&mut self) {
        self.tracker.stop();
        self.pipeline.stop();
    }
}

/// Application state for the event loop.
struct PreviewApp {
    runtime: Runtime,
    size: PhysicalSize<u32>,
    window: Option<Arc<Window>>,
    preview: Option<PreviewWindow>,
    fps: FpsCounter,
    frame_duration: Duration,
    last_frame_time: Instant,
}

impl PreviewApp {
    fn new(runtime: Runtime, fps: u32) -> Self {
        let size = {
            let surface = runtime.pipeline.surface();
            let surface = lock(&surface);
            PhysicalSize::new(surface.width, surface.height)
        };
        Self {
            runtime,
            size,
            window: None,
            preview: None,
            fps: FpsCounter::new(),
            frame_duration: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            last_frame_time: Instant::now(),
        }
    }

    fn present(&mut self) {
        let Some(preview) = &mut self.preview else {
            return;
        };
        self.runtime.poll_config();

        let surface = self.runtime.pipeline.surface();
        let frame = lock(&surface).snapshot();
        if let Err(e) = preview.write_frame(&frame) {
            error!("Preview error: {}", e);
        }
        if let Some(fps) = self.fps.update() {
            debug!("[Perf] Presenting at {:.2} FPS ({}x{})", fps, frame.width, frame.height);
        }
    }

    fn handle_key(&mut self, key: &Key, event_loop: &ActiveEventLoop) {
        match key {
            Key::Named(NamedKey::Escape) => event_loop.exit(),
            Key::Character(c) => match c.to_lowercase().as_str() {
                "f" => self.runtime.cycle_filter(),
                "d" => self.runtime.cycle_decoration(),
                "r" => {
                    info!("Effects reset");
                    self.runtime.pipeline.selection().reset_effects();
                }
                _ => {}
            },
            _ => {}
        }
    }
}

impl ApplicationHandler for PreviewApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attrs = WindowAttributes::default()
            .with_title("facefx (F: filter, D: decoration, R: reset)")
            .with_inner_size(self.size);

        let window = match event_loop.create_window(window_attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };
        self.window = Some(window.clone());

        match PreviewWindow::new(window) {
            Ok(preview) => {
                self.preview = Some(preview);
                info!("Window created successfully");
            }
            Err(e) => {
                error!("Failed to create preview: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(preview) = &mut self.preview {
                    preview.resize(size);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    self.handle_key(&event.logical_key, event_loop);
                }
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                if now.duration_since(self.last_frame_time) >= self.frame_duration {
                    self.present();
                    self.last_frame_time = now;
                }
                if let Some(preview) = &self.preview {
                    preview.window().request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.runtime.shutdown();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.list_devices {
        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => {
                eprintln!("Failed to list devices: {}", e);
            }
        }
        return Ok(());
    }

    if let Err(e) = OnnxLandmarkDetector::init() {
        warn!("Failed to initialize ONNX Runtime: {}. Face tracking will be unavailable.", e);
    }

    info!("Starting facefx...");
    let runtime = Runtime::start(&args)?;
    if args.headless {
        run_headless(runtime, args.save.as_deref())
    } else {
        run_window_mode(runtime, args.fps.unwrap_or(30))
    }
}

fn run_window_mode(runtime: Runtime, fps: u32) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = PreviewApp::new(runtime, fps);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Runs until interrupted or until the frame source ends.
fn run_headless(mut runtime: Runtime, save: Option<&std::path::Path>) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) && runtime.tracker.state() != TrackingState::Stopped {
        runtime.poll_config();
        thread::sleep(Duration::from_millis(100));
    }
    runtime.tracker.stop();

    if let Some(path) = save {
        let surface = runtime.pipeline.surface();
        let frame = lock(&surface).snapshot();
        image::save_buffer(path, &frame.data, frame.width, frame.height, image::ExtendedColorType::Rgba8)
            .with_context(|| format!("Failed to save surface to {:?}", path))?;
        info!("Saved surface to {:?}", path);
    }

    runtime.shutdown();
    Ok(())
}
