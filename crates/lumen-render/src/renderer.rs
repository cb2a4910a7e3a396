//! The frame orchestrator.
//!
//! [`Renderer`] owns every framebuffer and the resources their passes share. Game code
//! queues work between [`start_frame`](Renderer::start_frame) and
//! [`end_frame`](Renderer::end_frame); `end_frame` records the whole frame into one
//! command stream, composites onto the swapchain image and presents it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lumen_render::{
//!     DrawRequest, GraphicsContext, OffscreenSwapchain, Renderer, RendererConfig, ScaleMode, StaticShaderLibrary,
//! };
//!
//! let context = GraphicsContext::new_sync(Default::default()).unwrap();
//! let format = wgpu::TextureFormat::Rgba8Unorm;
//! let mut swapchain = OffscreenSwapchain::new(context.as_ref(), format, 640, 480);
//! let mut renderer = Renderer::new(
//!     context,
//!     Arc::new(StaticShaderLibrary::new()),
//!     format,
//!     RendererConfig::default().with_max_resolution(640, 480),
//! )
//! .unwrap();
//!
//! let texture = renderer.upload_texture_rgba8("white", 1, 1, &[255; 4]).unwrap();
//! let sampler = renderer.sampler(ScaleMode::Nearest);
//! let quad = renderer.geometry().quad();
//!
//! renderer.start_frame();
//! renderer
//!     .add_to_render_queue("sprite", DrawRequest::new(quad, texture, sampler).at(32.0, 32.0).with_size(16.0, 16.0))
//!     .unwrap();
//! renderer.end_frame(&mut swapchain).unwrap();
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use lumen_core::profiling::{self, profile_function, profile_scope};
use lumen_test_utils::{
    ColorAttachment, CommandRecorder, GpuSampler, GpuShaderModule, GpuTexture, LoadOp, RenderContext,
    RenderPassDescriptor,
};

use crate::blit::BlitPipeline;
use crate::camera::{Camera2D, Camera3D, Cameras};
use crate::canvas::{PixelCanvas, PixelCanvasId};
use crate::error::{RenderError, ScreenshotError};
use crate::framebuffer::{FrameBuffer, FrameResources, TargetRegistry, TargetSpec};
use crate::fullscreen::{FullscreenQuad, create_fullscreen_module};
use crate::geometry::GeometryCache;
use crate::instance::DrawRequest;
use crate::packer::InstancePacker;
use crate::pass::{Model3DPass, ModelDrawRequest, PassStats, RenderPass, ShaderPass, SpritePass, Viewport};
use crate::sampler_cache::{SamplerCache, ScaleMode};
use crate::screenshot::ScreenshotQueue;
use crate::shader::{ShaderLibrary, UniformBlock};
use crate::surface::Swapchain;

/// Name of the framebuffer created with the renderer.
pub const PRIMARY_TARGET: &str = "main";

/// Name of the sprite pass of the primary framebuffer.
pub const DEFAULT_SPRITE_PASS: &str = "sprite";

/// Distance between two consecutive queued sprites in depth.
///
/// Depth testing is `LessEqual`, so sprites that collapse to the same half-float `z`
/// still paint in queue order.
const DEPTH_STEP: f32 = 1.0 / 1_048_576.0;

/// Renderer-wide settings.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Every render target is allocated at this size; resizing only moves the viewport.
    pub max_width: u32,
    pub max_height: u32,
    pub sample_count: u32,
    /// Capacity of each pass queue and instance buffer.
    pub max_instances: usize,
    /// Clear color of the primary framebuffer.
    pub clear_color: wgpu::Color,
    /// Give the primary framebuffer a depth buffer.
    pub depth: bool,
    /// Instance packing threads. `None` uses one per CPU.
    pub packer_threads: Option<usize>,
    pub screenshot_dir: PathBuf,
    pub max_pending_screenshots: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_width: 3840,
            max_height: 2160,
            sample_count: 1,
            max_instances: 65_536,
            clear_color: wgpu::Color::BLACK,
            depth: false,
            packer_threads: None,
            screenshot_dir: PathBuf::from("."),
            max_pending_screenshots: 4,
        }
    }
}

impl RendererConfig {
    pub fn with_max_resolution(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_clear_color(mut self, color: wgpu::Color) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_packer_threads(mut self, threads: usize) -> Self {
        self.packer_threads = Some(threads);
        self
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    pub fn with_max_pending_screenshots(mut self, max: usize) -> Self {
        self.max_pending_screenshots = max;
        self
    }
}

/// One pass of a render target, in the order it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PassConfig {
    Sprite { name: String },
    Model3D { name: String },
    /// Full-screen fragment shader sampling other targets by name.
    Shader {
        name: String,
        fragment: String,
        inputs: Vec<String>,
    },
}

impl PassConfig {
    pub fn sprite(name: impl Into<String>) -> Self {
        Self::Sprite { name: name.into() }
    }

    pub fn model(name: impl Into<String>) -> Self {
        Self::Model3D { name: name.into() }
    }

    pub fn shader(name: impl Into<String>, fragment: impl Into<String>, inputs: &[&str]) -> Self {
        Self::Shader {
            name: name.into(),
            fragment: fragment.into(),
            inputs: inputs.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Sprite { name } | Self::Model3D { name } | Self::Shader { name, .. } => name,
        }
    }

    fn build(&self) -> Box<dyn RenderPass> {
        match self {
            Self::Sprite { name } => Box::new(SpritePass::new(name.as_str())),
            Self::Model3D { name } => Box::new(Model3DPass::new(name.as_str())),
            Self::Shader { name, fragment, inputs } => {
                Box::new(ShaderPass::new(name.as_str(), fragment.as_str(), inputs.clone()))
            }
        }
    }
}

/// Describes a named off-screen framebuffer.
#[derive(Debug, Clone)]
pub struct RenderTargetConfig {
    pub passes: Vec<PassConfig>,
    /// Composite the result onto the swapchain after the primary target.
    pub render_to_screen: bool,
    pub clear_color: wgpu::Color,
    pub depth: bool,
}

impl Default for RenderTargetConfig {
    fn default() -> Self {
        Self {
            passes: Vec::new(),
            render_to_screen: false,
            clear_color: wgpu::Color::TRANSPARENT,
            depth: false,
        }
    }
}

impl RenderTargetConfig {
    pub fn with_pass(mut self, pass: PassConfig) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn on_screen(mut self) -> Self {
        self.render_to_screen = true;
        self
    }

    pub fn with_clear_color(mut self, color: wgpu::Color) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_depth(mut self) -> Self {
        self.depth = true;
        self
    }
}

/// What `end_frame` recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Render passes (the `RenderPass` kind) that ran.
    pub passes: usize,
    /// GPU render passes opened, including blits.
    pub render_passes: usize,
    pub draw_calls: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    pub instances: usize,
    pub effect_chains: usize,
    /// Whether a swapchain image was acquired and presented.
    pub presented: bool,
    /// Whether a screenshot copy was recorded this frame.
    pub screenshot_started: bool,
}

impl FrameStats {
    fn add_pass_stats(&mut self, stats: PassStats) {
        self.render_passes += stats.render_passes;
        self.draw_calls += stats.draw_calls;
        self.batches += stats.batches;
        self.skipped_batches += stats.skipped_batches;
        self.instances += stats.instances;
        self.effect_chains += stats.effect_chains;
    }
}

/// Callbacks around each frame, for overlays such as a debug UI.
pub trait FrameHook: Send {
    fn start_frame(&mut self) {}

    /// Called once per `end_frame`, including failed frames and frames with no
    /// swapchain image.
    fn end_frame(&mut self, presented: bool) {
        let _ = presented;
    }
}

/// Batched 2D renderer with off-screen targets, effects and screenshots.
pub struct Renderer {
    context: Arc<dyn RenderContext>,
    shaders: Arc<dyn ShaderLibrary>,
    config: RendererConfig,
    format: wgpu::TextureFormat,
    framebuffers: IndexMap<String, FrameBuffer>,
    targets: TargetRegistry,
    geometry: GeometryCache,
    packer: InstancePacker,
    quad: FullscreenQuad,
    samplers: SamplerCache,
    fullscreen_module: GpuShaderModule,
    blit: BlitPipeline,
    cameras: Cameras,
    viewport: Viewport,
    depth_counter: u32,
    canvases: Vec<PixelCanvas>,
    screenshots: ScreenshotQueue,
    hooks: Vec<Box<dyn FrameHook>>,
    frame_index: u64,
}

impl Renderer {
    /// Build the renderer and its primary framebuffer.
    ///
    /// Any GPU object that fails to build here is fatal and returned as an error.
    pub fn new(
        context: Arc<dyn RenderContext>,
        shaders: Arc<dyn ShaderLibrary>,
        surface_format: wgpu::TextureFormat,
        config: RendererConfig,
    ) -> Result<Self, RenderError> {
        profile_function!();
        if !matches!(config.sample_count, 1 | 2 | 4 | 8) {
            return Err(RenderError::InvalidSampleCount(config.sample_count));
        }
        let config = RendererConfig {
            max_width: config.max_width.max(1),
            max_height: config.max_height.max(1),
            max_instances: config.max_instances.max(1),
            ..config
        };

        let packer = InstancePacker::new(config.packer_threads)?;
        let mut quad = FullscreenQuad::new(context.as_ref(), config.max_width, config.max_height)?;
        quad.set_region(context.as_ref(), config.max_width, config.max_height);
        let fullscreen_module = create_fullscreen_module(context.as_ref())?;
        let blit = BlitPipeline::new(context.as_ref(), &fullscreen_module, surface_format)?;

        let mut primary = FrameBuffer::new(PRIMARY_TARGET, true, config.clear_color, config.depth);
        primary.add_pass(Box::new(SpritePass::new(DEFAULT_SPRITE_PASS)))?;

        let mut renderer = Self {
            geometry: GeometryCache::new(context.clone()),
            screenshots: ScreenshotQueue::new(config.screenshot_dir.clone(), config.max_pending_screenshots),
            viewport: Viewport {
                width: config.max_width,
                height: config.max_height,
            },
            context,
            shaders,
            format: surface_format,
            framebuffers: IndexMap::new(),
            targets: TargetRegistry::default(),
            packer,
            quad,
            samplers: SamplerCache::new(),
            fullscreen_module,
            blit,
            cameras: Cameras::default(),
            depth_counter: 0,
            canvases: Vec::new(),
            hooks: Vec::new(),
            frame_index: 0,
            config,
        };
        renderer.setup_framebuffer(&mut primary)?;
        renderer.framebuffers.insert(PRIMARY_TARGET.to_owned(), primary);

        tracing::info!(
            "Renderer ready: {}x{} max, {}x MSAA, {} instances per pass, {} packing threads",
            renderer.config.max_width,
            renderer.config.max_height,
            renderer.config.sample_count,
            renderer.config.max_instances,
            renderer.packer.thread_count()
        );
        Ok(renderer)
    }

    fn target_spec(&self) -> TargetSpec {
        TargetSpec {
            format: self.format,
            sample_count: self.config.sample_count,
            max_width: self.config.max_width,
            max_height: self.config.max_height,
            max_instances: self.config.max_instances,
        }
    }

    /// Allocate a framebuffer's attachments, initialize its passes and publish its
    /// content texture.
    fn setup_framebuffer(&mut self, framebuffer: &mut FrameBuffer) -> Result<(), RenderError> {
        let spec = self.target_spec();
        framebuffer.allocate(self.context.as_ref(), &spec);
        framebuffer.init_passes(self.context.as_ref(), self.shaders.as_ref(), &spec)?;
        if let Some(content) = framebuffer.content() {
            self.targets.insert(framebuffer.name(), content.clone());
        }
        Ok(())
    }

    pub fn context(&self) -> &Arc<dyn RenderContext> {
        &self.context
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn sample_count(&self) -> u32 {
        self.config.sample_count
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn framebuffer(&self, name: &str) -> Option<&FrameBuffer> {
        self.framebuffers.get(name)
    }

    pub fn framebuffer_names(&self) -> impl Iterator<Item = &str> {
        self.framebuffers.keys().map(String::as_str)
    }

    pub fn geometry(&mut self) -> &mut GeometryCache {
        &mut self.geometry
    }

    pub fn cameras(&self) -> &Cameras {
        &self.cameras
    }

    pub fn set_camera_2d(&mut self, camera: Camera2D) {
        self.cameras.camera_2d = camera;
    }

    pub fn set_camera_3d(&mut self, camera: Camera3D) {
        self.cameras.camera_3d = camera;
    }

    pub fn add_frame_hook(&mut self, hook: Box<dyn FrameHook>) {
        self.hooks.push(hook);
    }

    pub fn sampler(&self, mode: ScaleMode) -> GpuSampler {
        self.samplers.get(self.context.as_ref(), mode)
    }

    pub fn start_frame(&mut self) {
        profiling::new_frame();
        self.depth_counter = 0;
        for hook in &mut self.hooks {
            hook.start_frame();
        }
    }

    fn find_pass(&mut self, pass: &str) -> Result<&mut (dyn RenderPass + 'static), RenderError> {
        self.framebuffers
            .values_mut()
            .find_map(|framebuffer| framebuffer.pass_mut(pass))
            .ok_or_else(|| RenderError::UnknownPass(pass.to_owned()))
    }

    /// Queue a sprite on `pass`. Later requests paint over earlier ones.
    pub fn add_to_render_queue(&mut self, pass: &str, mut request: DrawRequest) -> Result<(), RenderError> {
        request.position.z = (1.0 - (self.depth_counter + 1) as f32 * DEPTH_STEP).max(0.0);
        self.find_pass(pass)?.queue_sprite(request)?;
        self.depth_counter = self.depth_counter.saturating_add(1);
        Ok(())
    }

    pub fn add_model(&mut self, pass: &str, request: ModelDrawRequest) -> Result<(), RenderError> {
        self.find_pass(pass)?.queue_model(request)
    }

    /// Requests waiting on `pass` for the next `end_frame`.
    pub fn queued(&self, pass: &str) -> Option<usize> {
        self.framebuffers
            .values()
            .find_map(|framebuffer| framebuffer.pass(pass))
            .map(|pass| pass.queued())
    }

    /// Uniforms of a full-screen shader pass.
    pub fn uniform_buffer(&mut self, pass: &str) -> Result<&mut UniformBlock, RenderError> {
        self.find_pass(pass)?.uniforms_mut()
    }

    /// Add a named off-screen framebuffer. Its content texture can be sampled by name
    /// from effects and shader passes.
    pub fn create_effect_render_target(&mut self, name: &str, config: RenderTargetConfig) -> Result<(), RenderError> {
        profile_function!();
        if self.framebuffers.contains_key(name) {
            return Err(RenderError::TargetExists(name.to_owned()));
        }

        let mut framebuffer = FrameBuffer::new(name, config.render_to_screen, config.clear_color, config.depth);
        for pass in &config.passes {
            let taken = self
                .framebuffers
                .values()
                .any(|existing| existing.pass(pass.name()).is_some());
            if taken {
                return Err(RenderError::PassExists(pass.name().to_owned()));
            }
            framebuffer.add_pass(pass.build())?;
        }

        if let Err(e) = self.setup_framebuffer(&mut framebuffer) {
            framebuffer.release();
            self.targets.remove(name);
            return Err(e);
        }
        tracing::debug!("Created render target '{}' with {} passes", name, framebuffer.pass_count());
        self.framebuffers.insert(name.to_owned(), framebuffer);
        Ok(())
    }

    pub fn remove_render_target(&mut self, name: &str) -> Result<(), RenderError> {
        if name == PRIMARY_TARGET {
            return Err(RenderError::ProtectedTarget(name.to_owned()));
        }
        let mut framebuffer = self
            .framebuffers
            .shift_remove(name)
            .ok_or_else(|| RenderError::UnknownTarget(name.to_owned()))?;
        framebuffer.release();
        self.targets.remove(name);
        tracing::debug!("Removed render target '{}'", name);
        Ok(())
    }

    /// Change MSAA. Accepts 1, 2, 4 or 8 and rebuilds every target.
    pub fn set_sample_count(&mut self, sample_count: u32) -> Result<(), RenderError> {
        if !matches!(sample_count, 1 | 2 | 4 | 8) {
            return Err(RenderError::InvalidSampleCount(sample_count));
        }
        if sample_count == self.config.sample_count {
            return Ok(());
        }
        tracing::info!("Sample count {} -> {}", self.config.sample_count, sample_count);
        self.config.sample_count = sample_count;
        self.reset()
    }

    /// Follow a window resize. The viewport is clamped to the maximum resolution.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        let viewport = self.clamped_viewport(width, height);
        if viewport != (Viewport { width, height }) {
            tracing::debug!(
                "Resize to {}x{} clamped to {}x{}",
                width,
                height,
                viewport.width,
                viewport.height
            );
        }
        self.viewport = viewport;
        self.quad.set_region(self.context.as_ref(), viewport.width, viewport.height);
        self.reset()
    }

    fn clamped_viewport(&self, width: u32, height: u32) -> Viewport {
        Viewport {
            width: width.clamp(1, self.config.max_width),
            height: height.clamp(1, self.config.max_height),
        }
    }

    /// Wait for the GPU, then release and rebuild every framebuffer. Queued requests
    /// survive.
    fn reset(&mut self) -> Result<(), RenderError> {
        profile_function!();
        self.context.wait_idle();
        let mut framebuffers = std::mem::take(&mut self.framebuffers);
        let mut result = Ok(());
        for framebuffer in framebuffers.values_mut() {
            framebuffer.release();
            if result.is_ok() {
                result = self.setup_framebuffer(framebuffer);
            }
        }
        self.framebuffers = framebuffers;
        result
    }

    /// Ask for a PNG of the next presented frame. Returns the path it will be written to.
    pub fn request_screenshot(&mut self, path: Option<PathBuf>) -> PathBuf {
        self.screenshots.request(path)
    }

    /// Wait for every screenshot still being encoded.
    pub fn flush_screenshots(&mut self) -> Vec<Result<PathBuf, ScreenshotError>> {
        self.screenshots.flush()
    }

    pub fn create_pixel_canvas(&mut self, width: u32, height: u32) -> PixelCanvasId {
        let id = PixelCanvasId(self.canvases.len() as u32);
        let label = format!("Pixel Canvas {}", id.0);
        self.canvases
            .push(PixelCanvas::new(self.context.as_ref(), &label, width, height));
        id
    }

    pub fn canvas_mut(&mut self, id: PixelCanvasId) -> Option<&mut PixelCanvas> {
        self.canvases.get_mut(id.0 as usize)
    }

    pub fn canvas_texture(&self, id: PixelCanvasId) -> Option<GpuTexture> {
        self.canvases.get(id.0 as usize).map(|canvas| canvas.texture().clone())
    }

    /// Create a sampled texture from tightly packed RGBA8 rows.
    pub fn upload_texture_rgba8(
        &self,
        label: &str,
        width: u32,
        height: u32,
        bytes: &[u8],
    ) -> Result<GpuTexture, RenderError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || bytes.len() != expected {
            return Err(RenderError::InvalidTextureData {
                expected,
                actual: bytes.len(),
            });
        }
        let texture = self.context.create_texture(&wgpu::TextureDescriptor {
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
        self.context.write_texture(&texture, bytes, width * 4);
        Ok(texture)
    }

    /// Record, submit and present the frame. Every pass queue is empty afterwards,
    /// and every hook has seen `end_frame`, whether or not the frame succeeded.
    ///
    /// A swapchain image acquired by a failed frame is dropped without being presented.
    pub fn end_frame(&mut self, swapchain: &mut dyn Swapchain) -> Result<FrameStats, RenderError> {
        profile_function!();
        let result = self.record_frame(swapchain);
        for framebuffer in self.framebuffers.values_mut() {
            framebuffer.reset_queues();
        }
        self.depth_counter = 0;
        self.frame_index += 1;
        if let Err(e) = &result {
            tracing::error!("Frame {} failed: {}", self.frame_index, e);
            self.end_hooks(false);
        }
        result
    }

    fn record_frame(&mut self, swapchain: &mut dyn Swapchain) -> Result<FrameStats, RenderError> {
        let mut stats = FrameStats::default();

        for canvas in &mut self.canvases {
            canvas.flush(self.context.as_ref());
        }

        if let Err(e) = self.screenshots.process_pending(self.context.as_ref()) {
            tracing::error!("Dropping screenshot: {}", e);
        }

        // Windows larger than the maximum resolution keep the clamped viewport.
        let (width, height) = swapchain.size();
        if width > 0 && height > 0 && self.clamped_viewport(width, height) != self.viewport {
            self.resize(width, height)?;
        }

        let Some(frame) = swapchain.acquire() else {
            tracing::debug!("No swapchain image, skipping frame {}", self.frame_index);
            self.end_hooks(false);
            return Ok(stats);
        };

        if frame.texture().format() != self.blit.format() {
            tracing::debug!("Swapchain format changed to {:?}", frame.texture().format());
            self.blit = BlitPipeline::new(self.context.as_ref(), &self.fullscreen_module, frame.texture().format())?;
        }

        let mut recorder = self.context.create_recorder("Frame");
        self.render_framebuffers(recorder.as_mut(), &mut stats)?;
        self.composite(recorder.as_mut(), frame.texture(), &mut stats);

        if self.screenshots.is_requested() {
            let source = if frame.texture().usage().contains(wgpu::TextureUsages::COPY_SRC) {
                Some(frame.texture())
            } else {
                tracing::warn!("Swapchain image cannot be copied; capturing the primary target instead");
                self.framebuffers.get(PRIMARY_TARGET).and_then(FrameBuffer::content)
            };
            if let Some(source) = source {
                stats.screenshot_started = self.screenshots.capture(
                    self.context.as_ref(),
                    recorder.as_mut(),
                    source,
                    self.viewport.width,
                    self.viewport.height,
                );
            }
        }

        {
            profile_scope!("submit");
            recorder.submit();
        }
        frame.present();
        stats.presented = true;
        self.end_hooks(true);
        Ok(stats)
    }

    fn end_hooks(&mut self, presented: bool) {
        for hook in &mut self.hooks {
            hook.end_frame(presented);
        }
    }

    /// Off-screen targets first, in creation order, then the primary.
    fn render_framebuffers(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        stats: &mut FrameStats,
    ) -> Result<(), RenderError> {
        let resources = FrameResources {
            context: self.context.as_ref(),
            shaders: self.shaders.as_ref(),
            cameras: &self.cameras,
            targets: &self.targets,
            packer: &self.packer,
            quad: &self.quad,
            samplers: &self.samplers,
            viewport: self.viewport,
        };

        let primary = self.framebuffers.get_index_of(PRIMARY_TARGET);
        let order = (0..self.framebuffers.len())
            .filter(|&index| Some(index) != primary)
            .chain(primary);
        for index in order {
            let Some((_, framebuffer)) = self.framebuffers.get_index_mut(index) else {
                continue;
            };
            let pass_stats = framebuffer.render(&resources, recorder)?;
            stats.passes += framebuffer.pass_count();
            stats.add_pass_stats(pass_stats);
        }
        Ok(())
    }

    /// Blit every on-screen target onto the swapchain image, primary at the bottom.
    fn composite(&self, recorder: &mut dyn CommandRecorder, screen: &GpuTexture, stats: &mut FrameStats) {
        profile_scope!("composite");
        let sampler = self.samplers.linear(self.context.as_ref());
        let mut first = true;
        let primary = self.framebuffers.get(PRIMARY_TARGET).into_iter();
        let others = self
            .framebuffers
            .iter()
            .filter(|(name, _)| name.as_str() != PRIMARY_TARGET)
            .map(|(_, framebuffer)| framebuffer);
        for framebuffer in primary.chain(others) {
            if !framebuffer.render_to_screen() {
                continue;
            }
            let Some(content) = framebuffer.content() else {
                continue;
            };
            self.blit
                .blit(self.context.as_ref(), recorder, &self.quad, content, &sampler, screen, first);
            first = false;
            stats.render_passes += 1;
            stats.draw_calls += 1;
        }

        if first {
            // Nothing targets the screen; still hand the compositor a defined image.
            recorder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Clear Screen"),
                color: ColorAttachment {
                    target: screen,
                    resolve_target: None,
                    load: LoadOp::Clear(wgpu::Color::BLACK),
                },
                depth: None,
            });
            recorder.end_render_pass();
            stats.render_passes += 1;
        }
    }

    /// Wait for the GPU and outstanding screenshots, then release every pass.
    pub fn shutdown(&mut self) {
        profile_function!();
        self.context.wait_idle();
        if let Err(e) = self.screenshots.process_pending(self.context.as_ref()) {
            tracing::error!("Dropping screenshot: {}", e);
        }
        self.screenshots.flush();
        for framebuffer in self.framebuffers.values_mut() {
            framebuffer.reset_queues();
            framebuffer.release();
        }
        tracing::info!("Renderer shut down after {} frames", self.frame_index);
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("format", &self.format)
            .field("viewport", &self.viewport)
            .field("sample_count", &self.config.sample_count)
            .field("framebuffers", &self.framebuffers.keys().collect::<Vec<_>>())
            .field("frame_index", &self.frame_index)
            .finish_non_exhaustive()
    }
}
