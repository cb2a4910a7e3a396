//! Render passes: units of GPU work attached to a [`FrameBuffer`](crate::framebuffer::FrameBuffer).
//!
//! Every pass follows the same lifecycle:
//!
//! ```text
//! Uninitialized --init--> Initialized --render--> Initialized --release--> Released
//!                                                                  |
//!                               Released --init--> Initialized <---+
//! ```
//!
//! `init` allocates everything at the maximum resolution so a window resize only
//! changes the viewport. `render` runs once per frame and records into the frame's
//! recorder without keeping it. `release` drops the GPU objects and may be called any
//! number of times. `reset_render_queue` runs at the end of every frame, successful
//! or not.

pub mod model;
pub mod shader;
pub mod sprite;

use std::ops::AddAssign;

use ahash::HashMap;
use lumen_test_utils::{
    BindGroupDescriptor, ColorAttachment, CommandRecorder, DepthAttachment, GpuBindGroup, GpuBindGroupLayout,
    GpuSampler, GpuTexture, LoadOp, RenderContext, RenderPassDescriptor, ResourceId,
};

use crate::camera::Cameras;
use crate::error::RenderError;
use crate::framebuffer::TargetRegistry;
use crate::fullscreen::{FullscreenQuad, texture_slot_bindings};
use crate::instance::DrawRequest;
use crate::packer::InstancePacker;
use crate::sampler_cache::SamplerCache;
use crate::shader::{ShaderLibrary, UniformBlock};

pub use model::{Mesh, MeshVertex, Model3DPass, ModelDrawRequest, ModelInstance};
pub use shader::ShaderPass;
pub use sprite::SpritePass;

/// Depth buffer format shared by every framebuffer with depth.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Sprite,
    Model3D,
    Shader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Uninitialized,
    Initialized,
    Released,
}

/// Everything a pass needs to allocate its GPU objects.
pub struct PassInit<'a> {
    pub context: &'a dyn RenderContext,
    pub shaders: &'a dyn ShaderLibrary,
    /// Name of the framebuffer the pass belongs to.
    pub framebuffer: &'a str,
    pub color_format: wgpu::TextureFormat,
    pub sample_count: u32,
    pub depth_format: Option<wgpu::TextureFormat>,
    pub max_width: u32,
    pub max_height: u32,
    pub max_instances: usize,
}

/// Active region of the max-size targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Where a pass writes this frame.
#[derive(Debug, Clone, Copy)]
pub struct PassTarget<'a> {
    /// MSAA color texture when multisampling, otherwise the content texture.
    pub color: &'a GpuTexture,
    /// Content texture, set only for the last pass of a multisampled chain.
    pub resolve: Option<&'a GpuTexture>,
    pub depth: Option<&'a GpuTexture>,
    /// `Clear` for the first pass of the framebuffer, `Load` for the rest.
    pub load: LoadOp,
}

/// Per-frame state handed to [`RenderPass::render`].
pub struct PassFrame<'a> {
    pub context: &'a dyn RenderContext,
    pub shaders: &'a dyn ShaderLibrary,
    pub recorder: &'a mut dyn CommandRecorder,
    pub target: PassTarget<'a>,
    pub viewport: Viewport,
    pub cameras: &'a Cameras,
    /// Content textures of every framebuffer, by name.
    pub targets: &'a TargetRegistry,
    pub packer: &'a InstancePacker,
    pub quad: &'a FullscreenQuad,
    pub samplers: &'a SamplerCache,
    /// Whether the depth attachment still has last frame's contents.
    pub depth_needs_clear: bool,
}

impl PassFrame<'_> {
    /// Open a render pass on the frame target and set the viewport.
    ///
    /// `first` applies the frame's load op (later passes of the same render call
    /// load), `last` attaches the resolve target, `depth` attaches the depth buffer
    /// if the framebuffer has one.
    pub fn begin_target_pass(&mut self, label: &str, first: bool, last: bool, depth: bool) {
        let load = if first { self.target.load } else { LoadOp::Load };
        let depth = if depth {
            self.target.depth.map(|target| DepthAttachment {
                target,
                clear: self.depth_needs_clear.then_some(1.0),
            })
        } else {
            None
        };
        if depth.is_some() {
            self.depth_needs_clear = false;
        }

        self.recorder.begin_render_pass(&RenderPassDescriptor {
            label: Some(label),
            color: ColorAttachment {
                target: self.target.color,
                resolve_target: if last { self.target.resolve } else { None },
                load,
            },
            depth,
        });
        self.set_viewport();
    }

    /// Open a render pass on an off-screen texture, clearing it to transparent.
    pub fn begin_scratch_pass(&mut self, label: &str, texture: &GpuTexture) {
        self.recorder.begin_render_pass(&RenderPassDescriptor {
            label: Some(label),
            color: ColorAttachment {
                target: texture,
                resolve_target: None,
                load: LoadOp::Clear(wgpu::Color::TRANSPARENT),
            },
            depth: None,
        });
        self.set_viewport();
    }

    fn set_viewport(&mut self) {
        self.recorder
            .set_viewport(0.0, 0.0, self.viewport.width as f32, self.viewport.height as f32);
    }

    /// Whether the framebuffer has a depth attachment.
    pub fn has_depth(&self) -> bool {
        self.target.depth.is_some()
    }
}

/// What one pass recorded this frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub render_passes: usize,
    pub draw_calls: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    pub instances: usize,
    pub effect_chains: usize,
}

impl AddAssign for PassStats {
    fn add_assign(&mut self, rhs: Self) {
        self.render_passes += rhs.render_passes;
        self.draw_calls += rhs.draw_calls;
        self.batches += rhs.batches;
        self.skipped_batches += rhs.skipped_batches;
        self.instances += rhs.instances;
        self.effect_chains += rhs.effect_chains;
    }
}

/// A unit of GPU work with an explicit lifecycle.
pub trait RenderPass: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> PassKind;
    fn state(&self) -> PassState;

    /// Allocate GPU objects. Valid from `Uninitialized` and `Released`.
    fn init(&mut self, init: &PassInit<'_>) -> Result<(), RenderError>;

    /// Record this frame's work. Always opens at least one render pass on the target.
    fn render(&mut self, frame: &mut PassFrame<'_>) -> Result<PassStats, RenderError>;

    /// Drop every GPU object. Idempotent.
    fn release(&mut self);

    /// Forget this frame's draw requests.
    fn reset_render_queue(&mut self);

    /// Number of requests waiting for the next frame.
    fn queued(&self) -> usize;

    fn queue_sprite(&mut self, request: DrawRequest) -> Result<(), RenderError> {
        let _ = request;
        Err(RenderError::UnsupportedPass {
            pass: self.name().to_owned(),
            operation: "sprite draw requests",
        })
    }

    fn queue_model(&mut self, request: ModelDrawRequest) -> Result<(), RenderError> {
        let _ = request;
        Err(RenderError::UnsupportedPass {
            pass: self.name().to_owned(),
            operation: "model draw requests",
        })
    }

    fn uniforms_mut(&mut self) -> Result<&mut UniformBlock, RenderError> {
        Err(RenderError::UnsupportedPass {
            pass: self.name().to_owned(),
            operation: "uniform buffers",
        })
    }
}

/// Fails with [`RenderError::NotInitialized`] unless the pass is initialized.
pub(crate) fn ensure_initialized(name: &str, state: PassState) -> Result<(), RenderError> {
    match state {
        PassState::Initialized => Ok(()),
        PassState::Uninitialized | PassState::Released => Err(RenderError::NotInitialized(name.to_owned())),
    }
}

struct CachedGroup {
    bind_group: GpuBindGroup,
    last_used: u64,
}

/// Texture/sampler bind groups keyed by resource ids.
///
/// Groups not used during a frame are dropped by [`evict_unused`](Self::evict_unused),
/// so textures freed by the asset side do not stay alive through the cache.
pub(crate) struct TextureGroupCache {
    layout: GpuBindGroupLayout,
    label: &'static str,
    groups: HashMap<(ResourceId, ResourceId), CachedGroup>,
    frame: u64,
}

impl TextureGroupCache {
    pub(crate) fn new(layout: GpuBindGroupLayout, label: &'static str) -> Self {
        Self {
            layout,
            label,
            groups: HashMap::default(),
            frame: 0,
        }
    }

    pub(crate) fn begin_frame(&mut self) {
        self.frame += 1;
    }

    pub(crate) fn get(&mut self, context: &dyn RenderContext, texture: &GpuTexture, sampler: &GpuSampler) -> GpuBindGroup {
        let frame = self.frame;
        let layout = &self.layout;
        let label = self.label;
        let cached = self
            .groups
            .entry((texture.id(), sampler.id()))
            .or_insert_with(|| CachedGroup {
                bind_group: context.create_bind_group(&BindGroupDescriptor {
                    label: Some(label),
                    layout,
                    entries: &texture_slot_bindings(&[texture], sampler),
                }),
                last_used: frame,
            });
        cached.last_used = frame;
        cached.bind_group.clone()
    }

    pub(crate) fn evict_unused(&mut self) {
        let frame = self.frame;
        self.groups.retain(|_, cached| cached.last_used == frame);
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }
}

/// Per-frame uniform shared by the sprite and model shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniform {
    pub view_projection: [[f32; 4]; 4],
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scaffolding for driving passes against the mock context.

    use super::*;
    use crate::shader::StaticShaderLibrary;
    use lumen_test_utils::MockRenderContext;

    pub struct Harness {
        pub mock: MockRenderContext,
        pub shaders: StaticShaderLibrary,
        pub cameras: Cameras,
        pub targets: TargetRegistry,
        pub packer: InstancePacker,
        pub quad: FullscreenQuad,
        pub samplers: SamplerCache,
        pub color: GpuTexture,
        pub msaa: Option<GpuTexture>,
        pub depth: Option<GpuTexture>,
        pub format: wgpu::TextureFormat,
        pub sample_count: u32,
    }

    pub const SIZE: u32 = 64;

    pub fn texture(
        mock: &MockRenderContext,
        format: wgpu::TextureFormat,
        sample_count: u32,
        usage: wgpu::TextureUsages,
    ) -> GpuTexture {
        mock.create_texture(&wgpu::TextureDescriptor {
            label: Some("test target"),
            size: wgpu::Extent3d {
                width: SIZE,
                height: SIZE,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    impl Harness {
        pub fn new(sample_count: u32, with_depth: bool) -> Self {
            let mock = MockRenderContext::new();
            let format = wgpu::TextureFormat::Rgba8Unorm;
            let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
            let color = texture(&mock, format, 1, usage);
            let msaa = (sample_count > 1).then(|| texture(&mock, format, sample_count, usage));
            let depth = with_depth.then(|| texture(&mock, DEPTH_FORMAT, sample_count, usage));
            let mut quad = FullscreenQuad::new(&mock, SIZE, SIZE).unwrap();
            quad.set_region(&mock, SIZE, SIZE);
            Self {
                packer: InstancePacker::new(Some(2)).unwrap(),
                shaders: StaticShaderLibrary::new(),
                cameras: Cameras::default(),
                targets: TargetRegistry::default(),
                samplers: SamplerCache::new(),
                quad,
                color,
                msaa,
                depth,
                format,
                sample_count,
                mock,
            }
        }

        pub fn init(&self) -> PassInit<'_> {
            PassInit {
                context: &self.mock,
                shaders: &self.shaders,
                framebuffer: "main",
                color_format: self.format,
                sample_count: self.sample_count,
                depth_format: self.depth.as_ref().map(|_| DEPTH_FORMAT),
                max_width: SIZE,
                max_height: SIZE,
                max_instances: 1024,
            }
        }

        /// Render `pass` as the only pass of the framebuffer and submit.
        pub fn render(&self, pass: &mut dyn RenderPass, load: LoadOp) -> Result<PassStats, RenderError> {
            let mut recorder = self.mock.create_recorder("test frame");
            let (color, resolve) = match &self.msaa {
                Some(msaa) => (msaa, Some(&self.color)),
                None => (&self.color, None),
            };
            let result = {
                let mut frame = PassFrame {
                    context: &self.mock,
                    shaders: &self.shaders,
                    recorder: recorder.as_mut(),
                    target: PassTarget {
                        color,
                        resolve,
                        depth: self.depth.as_ref(),
                        load,
                    },
                    viewport: Viewport {
                        width: SIZE,
                        height: SIZE,
                    },
                    cameras: &self.cameras,
                    targets: &self.targets,
                    packer: &self.packer,
                    quad: &self.quad,
                    samplers: &self.samplers,
                    depth_needs_clear: true,
                };
                pass.render(&mut frame)
            };
            recorder.submit();
            result
        }
    }
}
