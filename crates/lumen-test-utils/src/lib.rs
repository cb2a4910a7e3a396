//! GPU abstraction and test utilities for the Lumen renderer.
//!
//! - [`RenderContext`]: object-safe trait for GPU resource creation and queue access
//! - [`CommandRecorder`]: object-safe trait for recording one command submission
//! - GPU wrapper types ([`GpuBuffer`], [`GpuTexture`], ...) that are real or mock
//! - `MockRenderContext` (feature `mock`): records calls and validates command streams
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # {
//! use lumen_test_utils::{MockRenderContext, RenderContext};
//!
//! let mock = MockRenderContext::new();
//! let texture = mock.create_texture(&wgpu::TextureDescriptor {
//!     label: Some("target"),
//!     size: wgpu::Extent3d { width: 4, height: 4, depth_or_array_layers: 1 },
//!     mip_level_count: 1,
//!     sample_count: 1,
//!     dimension: wgpu::TextureDimension::D2,
//!     format: wgpu::TextureFormat::Rgba8Unorm,
//!     usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
//!     view_formats: &[],
//! });
//! assert!(texture.is_mock());
//! assert_eq!(mock.count_texture_creates(), 1);
//! # }
//! ```

pub mod gpu_types;
#[cfg(feature = "mock")]
pub mod mock_render;
pub mod render_context;

pub use gpu_types::*;
#[cfg(feature = "mock")]
pub use mock_render::{CommandCall, MockCommandRecorder, MockRenderContext, RenderCall};
pub use render_context::*;
