//! Framebuffers: render targets that own an ordered chain of render passes.
//!
//! Every texture is allocated at the maximum resolution. Rendering uses the top-left
//! viewport region, so a window resize never reallocates anything here.

use ahash::HashMap;
use indexmap::IndexMap;
use lumen_core::profiling::profile_scope;
use lumen_test_utils::{
    ColorAttachment, CommandRecorder, DepthAttachment, GpuTexture, LoadOp, RenderContext, RenderPassDescriptor,
};

use crate::camera::Cameras;
use crate::error::RenderError;
use crate::fullscreen::FullscreenQuad;
use crate::packer::InstancePacker;
use crate::pass::{DEPTH_FORMAT, PassFrame, PassInit, PassStats, PassTarget, RenderPass, Viewport};
use crate::sampler_cache::SamplerCache;
use crate::shader::ShaderLibrary;

/// Content textures of every framebuffer, by framebuffer name.
///
/// Effects and shader passes look their inputs up here.
#[derive(Debug, Default, Clone)]
pub struct TargetRegistry {
    textures: HashMap<String, GpuTexture>,
}

impl TargetRegistry {
    pub fn get(&self, name: &str) -> Option<&GpuTexture> {
        self.textures.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, texture: GpuTexture) {
        self.textures.insert(name.into(), texture);
    }

    pub fn remove(&mut self, name: &str) -> Option<GpuTexture> {
        self.textures.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.textures.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

/// Shared per-frame state handed to every framebuffer.
pub struct FrameResources<'a> {
    pub context: &'a dyn RenderContext,
    pub shaders: &'a dyn ShaderLibrary,
    pub cameras: &'a Cameras,
    pub targets: &'a TargetRegistry,
    pub packer: &'a InstancePacker,
    pub quad: &'a FullscreenQuad,
    pub samplers: &'a SamplerCache,
    pub viewport: Viewport,
}

/// Format, resolution and capacity every pass of a framebuffer is initialized with.
#[derive(Debug, Clone, Copy)]
pub struct TargetSpec {
    pub format: wgpu::TextureFormat,
    pub sample_count: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_instances: usize,
}

struct Attachments {
    content: GpuTexture,
    msaa: Option<GpuTexture>,
    depth: Option<GpuTexture>,
}

/// A render target plus its ordered chain of render passes.
pub struct FrameBuffer {
    name: String,
    attachments: Option<Attachments>,
    passes: IndexMap<String, Box<dyn RenderPass>>,
    render_to_screen: bool,
    clear_color: wgpu::Color,
    use_depth: bool,
    width: u32,
    height: u32,
    sample_count: u32,
}

impl FrameBuffer {
    pub fn new(name: impl Into<String>, render_to_screen: bool, clear_color: wgpu::Color, use_depth: bool) -> Self {
        Self {
            name: name.into(),
            attachments: None,
            passes: IndexMap::new(),
            render_to_screen,
            clear_color,
            use_depth,
            width: 0,
            height: 0,
            sample_count: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a pass to the end of the chain.
    pub fn add_pass(&mut self, pass: Box<dyn RenderPass>) -> Result<(), RenderError> {
        let name = pass.name().to_owned();
        if self.passes.contains_key(&name) {
            return Err(RenderError::PassExists(name));
        }
        self.passes.insert(name, pass);
        Ok(())
    }

    pub fn pass_mut(&mut self, name: &str) -> Option<&mut (dyn RenderPass + 'static)> {
        self.passes.get_mut(name).map(|pass| pass.as_mut())
    }

    pub fn pass(&self, name: &str) -> Option<&dyn RenderPass> {
        self.passes.get(name).map(|pass| pass.as_ref())
    }

    /// Pass names in render order.
    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.passes.keys().map(String::as_str)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Single-sample texture holding the finished image.
    pub fn content(&self) -> Option<&GpuTexture> {
        self.attachments.as_ref().map(|a| &a.content)
    }

    /// Multisampled color target, present when the sample count is above 1.
    pub fn msaa(&self) -> Option<&GpuTexture> {
        self.attachments.as_ref().and_then(|a| a.msaa.as_ref())
    }

    pub fn depth(&self) -> Option<&GpuTexture> {
        self.attachments.as_ref().and_then(|a| a.depth.as_ref())
    }

    pub fn render_to_screen(&self) -> bool {
        self.render_to_screen
    }

    pub fn clear_color(&self) -> wgpu::Color {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: wgpu::Color) {
        self.clear_color = color;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn has_depth(&self) -> bool {
        self.use_depth
    }

    /// (Re)create the content, MSAA and depth textures.
    pub fn allocate(&mut self, context: &dyn RenderContext, spec: &TargetSpec) {
        let texture = |label: String, format: wgpu::TextureFormat, samples: u32, usage: wgpu::TextureUsages| {
            context.create_texture(&wgpu::TextureDescriptor {
                label: Some(label.as_str()),
                size: wgpu::Extent3d {
                    width: spec.max_width,
                    height: spec.max_height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: samples,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        };

        let content = texture(
            format!("{} Content", self.name),
            spec.format,
            1,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        );
        let msaa = (spec.sample_count > 1).then(|| {
            texture(
                format!("{} MSAA", self.name),
                spec.format,
                spec.sample_count,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
        });
        let depth = self.use_depth.then(|| {
            texture(
                format!("{} Depth", self.name),
                DEPTH_FORMAT,
                spec.sample_count,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
        });

        self.attachments = Some(Attachments { content, msaa, depth });
        self.width = spec.max_width;
        self.height = spec.max_height;
        self.sample_count = spec.sample_count;
        tracing::debug!(
            "Allocated framebuffer '{}' at {}x{} ({}x MSAA, depth: {})",
            self.name,
            spec.max_width,
            spec.max_height,
            spec.sample_count,
            self.use_depth
        );
    }

    /// Initialize every pass for the current attachments.
    pub fn init_passes(
        &mut self,
        context: &dyn RenderContext,
        shaders: &dyn ShaderLibrary,
        spec: &TargetSpec,
    ) -> Result<(), RenderError> {
        let init = PassInit {
            context,
            shaders,
            framebuffer: &self.name,
            color_format: spec.format,
            sample_count: spec.sample_count,
            depth_format: self.use_depth.then_some(DEPTH_FORMAT),
            max_width: spec.max_width,
            max_height: spec.max_height,
            max_instances: spec.max_instances,
        };
        for pass in self.passes.values_mut() {
            pass.init(&init).inspect_err(|e| {
                tracing::error!("Failed to initialize pass '{}' of '{}': {}", pass.name(), self.name, e);
            })?;
        }
        Ok(())
    }

    /// Release every pass and drop the attachments.
    pub fn release(&mut self) {
        for pass in self.passes.values_mut() {
            pass.release();
        }
        self.attachments = None;
    }

    pub fn reset_queues(&mut self) {
        for pass in self.passes.values_mut() {
            pass.reset_render_queue();
        }
    }

    /// Total requests waiting across all passes.
    pub fn queued(&self) -> usize {
        self.passes.values().map(|pass| pass.queued()).sum()
    }

    /// Run the pass chain. The first pass clears, later ones load, and only the last
    /// resolves into the content texture.
    pub fn render(
        &mut self,
        resources: &FrameResources<'_>,
        recorder: &mut dyn CommandRecorder,
    ) -> Result<PassStats, RenderError> {
        profile_scope!("framebuffer");
        let Some(attachments) = self.attachments.as_ref() else {
            return Err(RenderError::UnknownTarget(self.name.clone()));
        };
        let color = attachments.msaa.as_ref().unwrap_or(&attachments.content);
        let mut stats = PassStats::default();

        if self.passes.is_empty() {
            recorder.begin_render_pass(&RenderPassDescriptor {
                label: Some(self.name.as_str()),
                color: ColorAttachment {
                    target: color,
                    resolve_target: attachments.msaa.as_ref().map(|_| &attachments.content),
                    load: LoadOp::Clear(self.clear_color),
                },
                depth: attachments.depth.as_ref().map(|target| DepthAttachment {
                    target,
                    clear: Some(1.0),
                }),
            });
            recorder.end_render_pass();
            stats.render_passes = 1;
            return Ok(stats);
        }

        let last = self.passes.len() - 1;
        // The first pass that attaches depth clears it.
        let mut depth_needs_clear = true;
        for (index, pass) in self.passes.values_mut().enumerate() {
            let mut frame = PassFrame {
                context: resources.context,
                shaders: resources.shaders,
                recorder: &mut *recorder,
                target: PassTarget {
                    color,
                    resolve: if index == last {
                        attachments.msaa.as_ref().map(|_| &attachments.content)
                    } else {
                        None
                    },
                    depth: attachments.depth.as_ref(),
                    load: if index == 0 {
                        LoadOp::Clear(self.clear_color)
                    } else {
                        LoadOp::Load
                    },
                },
                viewport: resources.viewport,
                cameras: resources.cameras,
                targets: resources.targets,
                packer: resources.packer,
                quad: resources.quad,
                samplers: resources.samplers,
                depth_needs_clear,
            };
            stats += pass.render(&mut frame)?;
            depth_needs_clear = frame.depth_needs_clear;
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("name", &self.name)
            .field("passes", &self.passes.keys().collect::<Vec<_>>())
            .field("size", &(self.width, self.height))
            .field("sample_count", &self.sample_count)
            .field("render_to_screen", &self.render_to_screen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::SpritePass;
    use crate::shader::StaticShaderLibrary;
    use lumen_test_utils::{CommandCall, MockRenderContext, RenderCall};

    const SIZE: u32 = 32;

    struct Fixture {
        mock: MockRenderContext,
        shaders: StaticShaderLibrary,
        cameras: Cameras,
        targets: TargetRegistry,
        packer: InstancePacker,
        quad: FullscreenQuad,
        samplers: SamplerCache,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = MockRenderContext::new();
            let quad = FullscreenQuad::new(&mock, SIZE, SIZE).unwrap();
            Self {
                shaders: StaticShaderLibrary::new(),
                cameras: Cameras::default(),
                targets: TargetRegistry::default(),
                packer: InstancePacker::new(Some(1)).unwrap(),
                samplers: SamplerCache::new(),
                quad,
                mock,
            }
        }

        fn spec(sample_count: u32) -> TargetSpec {
            TargetSpec {
                format: wgpu::TextureFormat::Rgba8Unorm,
                sample_count,
                max_width: SIZE,
                max_height: SIZE,
                max_instances: 16,
            }
        }

        fn framebuffer(&self, passes: &[&str], sample_count: u32, depth: bool) -> FrameBuffer {
            let mut framebuffer = FrameBuffer::new("main", true, wgpu::Color::RED, depth);
            for name in passes {
                framebuffer.add_pass(Box::new(SpritePass::new(*name))).unwrap();
            }
            framebuffer.allocate(&self.mock, &Self::spec(sample_count));
            framebuffer
                .init_passes(&self.mock, &self.shaders, &Self::spec(sample_count))
                .unwrap();
            framebuffer
        }

        fn render(&self, framebuffer: &mut FrameBuffer) -> Vec<CommandCall> {
            let resources = FrameResources {
                context: &self.mock,
                shaders: &self.shaders,
                cameras: &self.cameras,
                targets: &self.targets,
                packer: &self.packer,
                quad: &self.quad,
                samplers: &self.samplers,
                viewport: Viewport {
                    width: SIZE,
                    height: SIZE,
                },
            };
            let mut recorder = self.mock.create_recorder("frame");
            framebuffer.render(&resources, recorder.as_mut()).unwrap();
            recorder.submit();
            self.mock.last_submission().unwrap()
        }
    }

    fn begins(commands: &[CommandCall]) -> Vec<(LoadOp, bool, Option<lumen_test_utils::ResourceId>)> {
        commands
            .iter()
            .filter_map(|c| match c {
                CommandCall::BeginRenderPass {
                    load,
                    resolve_target,
                    depth,
                    ..
                } => Some((*load, resolve_target.is_some(), *depth)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_pass_clears_and_last_resolves() {
        let fixture = Fixture::new();
        let mut framebuffer = fixture.framebuffer(&["background", "world", "overlay"], 4, false);
        let commands = fixture.render(&mut framebuffer);
        let begins = begins(&commands);

        assert_eq!(begins.len(), 3);
        assert_eq!(begins[0], (LoadOp::Clear(wgpu::Color::RED), false, None));
        assert_eq!(begins[1], (LoadOp::Load, false, None));
        assert_eq!(begins[2], (LoadOp::Load, true, None));
    }

    #[test]
    fn test_single_sample_never_resolves() {
        let fixture = Fixture::new();
        let mut framebuffer = fixture.framebuffer(&["a", "b"], 1, false);
        let begins = begins(&fixture.render(&mut framebuffer));
        assert!(begins.iter().all(|(_, resolves, _)| !resolves));
        assert!(framebuffer.msaa().is_none());
    }

    #[test]
    fn test_empty_chain_still_clears() {
        let fixture = Fixture::new();
        let mut framebuffer = fixture.framebuffer(&[], 4, true);
        let begins = begins(&fixture.render(&mut framebuffer));
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].0, LoadOp::Clear(wgpu::Color::RED));
        assert!(begins[0].1);
    }

    #[test]
    fn test_depth_is_cleared_once_per_frame() {
        let fixture = Fixture::new();
        let mut framebuffer = fixture.framebuffer(&["a", "b"], 1, true);
        for _ in 0..2 {
            let commands = fixture.render(&mut framebuffer);
            let depth = framebuffer.depth().unwrap().id();
            let clears: Vec<Option<f32>> = commands
                .iter()
                .filter_map(|c| match c {
                    CommandCall::BeginRenderPass {
                        depth: Some(d),
                        depth_clear,
                        ..
                    } if *d == depth => Some(*depth_clear),
                    _ => None,
                })
                .collect();
            assert_eq!(clears, vec![Some(1.0), None]);
        }
    }

    #[test]
    fn test_allocation_sizes_attachments_to_max_resolution() {
        let fixture = Fixture::new();
        let framebuffer = fixture.framebuffer(&["a"], 4, true);
        let textures: Vec<(u32, u32, u32)> = fixture
            .mock
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RenderCall::CreateTexture {
                    label: Some(label),
                    width,
                    height,
                    sample_count,
                    ..
                } if label.starts_with("main") => Some((width, height, sample_count)),
                _ => None,
            })
            .collect();
        assert_eq!(textures, vec![(SIZE, SIZE, 1), (SIZE, SIZE, 4), (SIZE, SIZE, 4)]);
        assert_eq!(framebuffer.content().unwrap().sample_count(), 1);
        assert_eq!(framebuffer.sample_count(), 4);
    }

    #[test]
    fn test_duplicate_pass_names_are_refused() {
        let mut framebuffer = FrameBuffer::new("main", true, wgpu::Color::BLACK, false);
        framebuffer.add_pass(Box::new(SpritePass::new("sprite"))).unwrap();
        let result = framebuffer.add_pass(Box::new(SpritePass::new("sprite")));
        assert!(matches!(result, Err(RenderError::PassExists(name)) if name == "sprite"));
        assert_eq!(framebuffer.pass_names().collect::<Vec<_>>(), vec!["sprite"]);
    }

    #[test]
    fn test_unallocated_framebuffer_refuses_to_render() {
        let fixture = Fixture::new();
        let mut framebuffer = FrameBuffer::new("late", false, wgpu::Color::BLACK, false);
        let resources = FrameResources {
            context: &fixture.mock,
            shaders: &fixture.shaders,
            cameras: &fixture.cameras,
            targets: &fixture.targets,
            packer: &fixture.packer,
            quad: &fixture.quad,
            samplers: &fixture.samplers,
            viewport: Viewport { width: 1, height: 1 },
        };
        let mut recorder = fixture.mock.create_recorder("frame");
        assert!(framebuffer.render(&resources, recorder.as_mut()).is_err());
    }
}
