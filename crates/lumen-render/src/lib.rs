//! Lumen Render
//!
//! A batched 2D frame renderer. Sprites queued during a frame are packed into
//! half-float instances on a worker pool, grouped into maximal batches and drawn with
//! one instanced call per batch. Sprites carrying effects are rendered in isolation
//! and pushed through a ping-pong chain of full-screen passes before being
//! composited back in paint order.
//!
//! The entry point is [`Renderer`]. GPU access goes through
//! [`RenderContext`](lumen_test_utils::RenderContext), implemented for wgpu by
//! [`GraphicsContext`] and by `MockRenderContext` for tests.

pub mod batch;
pub mod blit;
pub mod camera;
pub mod canvas;
pub mod context;
mod context_impl;
pub mod effect;
pub mod error;
pub mod framebuffer;
pub mod fullscreen;
pub mod geometry;
pub mod half;
pub mod instance;
pub mod packer;
pub mod pass;
pub mod renderer;
pub mod sampler_cache;
pub mod screenshot;
pub mod shader;
pub mod surface;

pub use camera::{Camera2D, Camera3D, Cameras};
pub use canvas::{PixelCanvas, PixelCanvasId};
pub use context::{GraphicsContext, GraphicsContextDescriptor};
pub use effect::Effect;
pub use error::{GraphicsError, RenderError, ScreenshotError};
pub use framebuffer::FrameBuffer;
pub use geometry::{Geometry, GeometryCache};
pub use instance::{CompactInstance, DrawRequest, Renderable};
pub use pass::{Mesh, MeshVertex, ModelDrawRequest, PassKind, PassState, RenderPass, Viewport};
pub use renderer::{
    DEFAULT_SPRITE_PASS, FrameHook, FrameStats, PRIMARY_TARGET, PassConfig, RenderTargetConfig, Renderer,
    RendererConfig,
};
pub use sampler_cache::ScaleMode;
pub use shader::{CompiledShader, ShaderLibrary, ShaderReflection, StaticShaderLibrary, UniformBlock, UniformSlot};
pub use surface::{OffscreenSwapchain, Swapchain, SwapchainFrame, WindowSurface};

pub use lumen_test_utils::{GpuError, GpuSampler, GpuTexture, RenderContext};
