//! Presentable images.
//!
//! The renderer only needs "give me this frame's image" and "present it", so both a
//! window surface and a plain texture (for tests and headless capture) implement
//! [`Swapchain`].

use std::sync::Arc;

use lumen_test_utils::{GpuTexture, RenderContext};

use crate::context::GraphicsContext;
use crate::error::GraphicsError;

/// One acquired presentable image.
pub struct SwapchainFrame {
    texture: GpuTexture,
    surface_texture: Option<wgpu::SurfaceTexture>,
}

impl SwapchainFrame {
    /// A frame that is not backed by a window surface.
    pub fn from_texture(texture: GpuTexture) -> Self {
        Self {
            texture,
            surface_texture: None,
        }
    }

    pub fn texture(&self) -> &GpuTexture {
        &self.texture
    }

    /// Hand the image back to the compositor. A no-op for off-screen frames.
    pub fn present(self) {
        if let Some(surface_texture) = self.surface_texture {
            surface_texture.present();
        }
    }
}

/// Source of per-frame presentable images.
pub trait Swapchain {
    fn format(&self) -> wgpu::TextureFormat;

    fn size(&self) -> (u32, u32);

    /// The image for this frame, or `None` when nothing can be drawn right now
    /// (minimized window, timeout, lost surface that could not be recovered).
    fn acquire(&mut self) -> Option<SwapchainFrame>;
}

/// A window surface configured for FIFO presentation.
pub struct WindowSurface {
    context: Arc<GraphicsContext>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl WindowSurface {
    pub fn new(
        context: Arc<GraphicsContext>,
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        width: u32,
        height: u32,
    ) -> Result<Self, GraphicsError> {
        let surface = context
            .instance
            .create_surface(target)
            .map_err(|e| GraphicsError::Surface(e.to_string()))?;

        let caps = surface.get_capabilities(&context.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| GraphicsError::Surface("surface is not supported by the adapter".to_owned()))?;

        // Screenshots copy straight from the swapchain image when the platform allows it.
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if caps.usages.contains(wgpu::TextureUsages::COPY_SRC) {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }

        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&context.device, &config);
        tracing::info!("Configured {}x{} surface as {:?}", config.width, config.height, format);

        Ok(Self {
            context,
            surface,
            config,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.context.device, &self.config);
    }

    fn wrap(&self, surface_texture: wgpu::SurfaceTexture) -> SwapchainFrame {
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        SwapchainFrame {
            texture: GpuTexture::from_wgpu_with_view(surface_texture.texture.clone(), view),
            surface_texture: Some(surface_texture),
        }
    }
}

impl Swapchain for WindowSurface {
    fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn acquire(&mut self) -> Option<SwapchainFrame> {
        match self.surface.get_current_texture() {
            Ok(frame) => Some(self.wrap(frame)),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                tracing::debug!("Surface lost or outdated, reconfiguring");
                self.surface.configure(&self.context.device, &self.config);
                match self.surface.get_current_texture() {
                    Ok(frame) => Some(self.wrap(frame)),
                    Err(e) => {
                        tracing::warn!("Surface unavailable after reconfigure: {}", e);
                        None
                    }
                }
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                tracing::error!("Out of memory acquiring the surface texture");
                None
            }
            Err(e) => {
                tracing::debug!("No surface texture this frame: {}", e);
                None
            }
        }
    }
}

/// A texture standing in for a window.
///
/// Used by headless rendering and by tests, which can also simulate a minimized
/// window with [`set_available`](Self::set_available).
pub struct OffscreenSwapchain {
    texture: GpuTexture,
    available: bool,
}

impl OffscreenSwapchain {
    pub fn new(context: &dyn RenderContext, format: wgpu::TextureFormat, width: u32, height: u32) -> Self {
        let texture = context.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Swapchain"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        Self {
            texture,
            available: true,
        }
    }

    pub fn texture(&self) -> &GpuTexture {
        &self.texture
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }
}

impl Swapchain for OffscreenSwapchain {
    fn format(&self) -> wgpu::TextureFormat {
        self.texture.format()
    }

    fn size(&self) -> (u32, u32) {
        self.texture.size()
    }

    fn acquire(&mut self) -> Option<SwapchainFrame> {
        self.available
            .then(|| SwapchainFrame::from_texture(self.texture.clone()))
    }
}
