//! Video frame types, the output surface and the quad vertex layout.

use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

/// Supported pixel formats for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// A video frame or bitmap. Rows are stored top-down.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Timestamp in microseconds (if available)
    pub timestamp_us: Option<u64>,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Creates a new zeroed frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let size = (width as usize) * (height as usize) * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data: vec![0; size],
        }
    }

    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data,
        }
    }

    /// Creates an RGBA frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::from_data(width, height, PixelFormat::Rgba, data)
    }

    /// Converts this frame to RGBA format.
    pub fn to_rgba(&self) -> VideoFrame {
        self.as_rgba().into_owned()
    }

    /// Borrows the frame if it is already RGBA, converts otherwise.
    pub fn as_rgba(&self) -> Cow<'_, VideoFrame> {
        if self.format == PixelFormat::Rgba {
            return Cow::Borrowed(self);
        }

        let pixel_count = self.width as usize * self.height as usize;
        let mut rgba_data = vec![0u8; pixel_count * 4];
        for (dst, src) in rgba_data.chunks_exact_mut(4).zip(self.data.chunks_exact(3)) {
            dst[..3].copy_from_slice(src);
            dst[3] = 255;
        }

        Cow::Owned(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba,
            timestamp_us: self.timestamp_us,
            data: rgba_data,
        })
    }

    /// Returns the pixel data with rows in reverse order.
    pub fn flipped_rows(&self) -> Vec<u8> {
        let stride = self.width as usize * self.format.bytes_per_pixel();
        if stride == 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(stride)
            .rev()
            .flatten()
            .copied()
            .collect()
    }

    /// Reads one RGBA pixel. Returns `None` outside the frame or for non-RGBA data.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.format != PixelFormat::Rgba || x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.data.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// The caller-supplied drawable both renderers write into.
///
/// Pixels are RGBA8, rows top-down.
#[derive(Debug, Clone)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Output surface shared between the filter and decoration renderers.
pub type SharedSurface = Arc<Mutex<Surface>>;

impl Surface {
    /// Creates a transparent black surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Wraps a new surface for sharing across renderers.
    pub fn shared(width: u32, height: u32) -> SharedSurface {
        Arc::new(Mutex::new(Self::new(width, height)))
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Copies the current contents into a frame.
    pub fn snapshot(&self) -> VideoFrame {
        VideoFrame::from_data(self.width, self.height, PixelFormat::Rgba, self.data.clone())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }
}

/// Vertex for rendering a textured quad as a 4-vertex triangle strip.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Full-viewport quad. Texture row 0 lands at the bottom edge, which is
    /// why camera frames are uploaded flipped.
    pub const FULLSCREEN: [QuadVertex; 4] = [
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 0.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 1.0] },
    ];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}
