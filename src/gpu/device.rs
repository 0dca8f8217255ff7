//! wgpu device acquisition.

use crate::error::EffectError;
use std::sync::Arc;
use winit::window::Window;

/// A wgpu device and queue plus the instance/adapter they came from.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    /// Present only when created for a window.
    pub surface: Option<wgpu::Surface<'static>>,
}

impl GpuDevice {
    /// Acquires a device compatible with the given window, or an offscreen
    /// device when `window` is `None`.
    pub fn new(window: Option<&Arc<Window>>) -> Result<Self, EffectError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = match window {
            Some(window) => Some(
                instance
                    .create_surface(window.clone())
                    .map_err(|e| EffectError::ContextAcquisition(format!("surface creation failed: {}", e)))?,
            ),
            None => None,
        };

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref(),
            force_fallback_adapter: false,
        }))
        .map_err(|e| EffectError::ContextAcquisition(format!("no GPU adapter: {:?}", e)))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("facefx Device"),
            required_features: wgpu::Features::empty(),
            // Offscreen targets match the surface, so take the adapter's texture size.
            required_limits: if surface.is_some() {
                wgpu::Limits::default()
            } else {
                wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits())
            },
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| EffectError::ContextAcquisition(format!("device request failed: {}", e)))?;

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
            surface,
        })
    }
}
