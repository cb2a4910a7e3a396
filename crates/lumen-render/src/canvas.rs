//! CPU pixel buffers mirrored into GPU textures.
//!
//! Game code writes pixels at any point during the frame; the renderer uploads
//! every modified canvas once at the start of `end_frame`, before any pass samples
//! the texture.

use lumen_test_utils::{GpuTexture, RenderContext};

/// Handle returned by [`Renderer::create_pixel_canvas`](crate::Renderer::create_pixel_canvas).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelCanvasId(pub(crate) u32);

/// An RGBA8 image owned by the CPU and sampled by the GPU.
pub struct PixelCanvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    texture: GpuTexture,
    dirty: bool,
}

impl PixelCanvas {
    pub fn new(context: &dyn RenderContext, label: &str, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let texture = context.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        Self {
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
            texture,
            dirty: true,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn texture(&self) -> &GpuTexture {
        &self.texture
    }

    /// Write one pixel. Out-of-bounds coordinates are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let start = ((y * self.width + x) * 4) as usize;
        self.pixels[start..start + 4].copy_from_slice(&rgba);
        self.dirty = true;
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = ((y * self.width + x) * 4) as usize;
        let mut rgba = [0; 4];
        rgba.copy_from_slice(&self.pixels[start..start + 4]);
        Some(rgba)
    }

    pub fn fill(&mut self, rgba: [u8; 4]) {
        for pixel in self.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&rgba);
        }
        self.dirty = true;
    }

    /// Raw row-major RGBA8 bytes. Marks the canvas modified.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.pixels
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Upload the pixels if they changed since the last flush.
    pub fn flush(&mut self, context: &dyn RenderContext) -> bool {
        if !self.dirty {
            return false;
        }
        context.write_texture(&self.texture, &self.pixels, self.width * 4);
        self.dirty = false;
        true
    }
}

impl std::fmt::Debug for PixelCanvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelCanvas")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("texture", &self.texture.id())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_test_utils::{MockRenderContext, RenderCall};

    fn texture_writes(mock: &MockRenderContext) -> usize {
        mock.count_calls(|c| matches!(c, RenderCall::WriteTexture { .. }))
    }

    #[test]
    fn test_flush_uploads_only_changes() {
        let mock = MockRenderContext::new();
        let mut canvas = PixelCanvas::new(&mock, "canvas", 4, 2);

        assert!(canvas.flush(&mock));
        assert!(!canvas.flush(&mock));
        assert_eq!(texture_writes(&mock), 1);

        canvas.set_pixel(3, 1, [1, 2, 3, 4]);
        assert!(canvas.flush(&mock));
        assert_eq!(texture_writes(&mock), 2);
    }

    #[test]
    fn test_out_of_bounds_writes_are_ignored() {
        let mock = MockRenderContext::new();
        let mut canvas = PixelCanvas::new(&mock, "canvas", 2, 2);
        canvas.flush(&mock);

        canvas.set_pixel(2, 0, [9; 4]);
        assert!(!canvas.is_dirty());
        assert_eq!(canvas.pixel(2, 0), None);

        canvas.fill([7, 7, 7, 255]);
        canvas.set_pixel(1, 1, [1, 2, 3, 4]);
        assert_eq!(canvas.pixel(0, 0), Some([7, 7, 7, 255]));
        assert_eq!(canvas.pixel(1, 1), Some([1, 2, 3, 4]));
    }
}
