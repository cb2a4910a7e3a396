//! Object-safe abstraction over GPU resource creation and command recording.
//!
//! Resource creation goes through [`RenderContext`]; per-frame command streams go
//! through a boxed [`CommandRecorder`] obtained from the context. Descriptors that
//! reference other resources ([`BindGroupDescriptor`], [`RenderPipelineDescriptor`],
//! [`RenderPassDescriptor`]) are expressed in terms of the wrapper types so the mock
//! implementation can accept them without touching wgpu.

use std::num::NonZeroU64;
use std::ops::Range;

use crate::gpu_types::*;

/// Failure reported by the GPU backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The backend rejected a descriptor or shader.
    Validation(String),
    /// The backend ran out of memory while creating a resource.
    OutOfMemory(String),
    /// Mapping a buffer for CPU access failed.
    Map(String),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Validation(msg) => write!(f, "GPU validation error: {}", msg),
            GpuError::OutOfMemory(msg) => write!(f, "GPU out of memory: {}", msg),
            GpuError::Map(msg) => write!(f, "Buffer mapping failed: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {}

/// Resource bound at one binding slot.
#[derive(Debug, Clone, Copy)]
pub enum BindingResource<'a> {
    /// The whole buffer.
    Buffer(&'a GpuBuffer),
    /// A sub-range of a buffer.
    BufferSlice {
        buffer: &'a GpuBuffer,
        offset: u64,
        size: Option<NonZeroU64>,
    },
    /// The texture's default view.
    Texture(&'a GpuTexture),
    Sampler(&'a GpuSampler),
}

#[derive(Debug, Clone, Copy)]
pub struct BindGroupEntry<'a> {
    pub binding: u32,
    pub resource: BindingResource<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct BindGroupDescriptor<'a> {
    pub label: Option<&'a str>,
    pub layout: &'a GpuBindGroupLayout,
    pub entries: &'a [BindGroupEntry<'a>],
}

/// One programmable stage of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStage<'a> {
    pub module: &'a GpuShaderModule,
    pub entry_point: &'a str,
}

/// Depth test configuration for a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub format: wgpu::TextureFormat,
    pub write_enabled: bool,
    pub compare: wgpu::CompareFunction,
}

/// A single-color-target render pipeline.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor<'a> {
    pub label: Option<&'a str>,
    pub bind_group_layouts: &'a [&'a GpuBindGroupLayout],
    pub vertex: ShaderStage<'a>,
    pub vertex_buffers: &'a [wgpu::VertexBufferLayout<'a>],
    pub fragment: ShaderStage<'a>,
    pub color_format: wgpu::TextureFormat,
    pub blend: Option<wgpu::BlendState>,
    pub depth: Option<DepthState>,
    pub sample_count: u32,
    pub cull_mode: Option<wgpu::Face>,
}

/// What happens to a color attachment when a render pass begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear(wgpu::Color),
    Load,
}

#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment<'a> {
    pub target: &'a GpuTexture,
    /// Single-sample texture that receives the MSAA resolve at the end of the pass.
    pub resolve_target: Option<&'a GpuTexture>,
    pub load: LoadOp,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthAttachment<'a> {
    pub target: &'a GpuTexture,
    /// `Some(depth)` clears to that value, `None` loads.
    pub clear: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderPassDescriptor<'a> {
    pub label: Option<&'a str>,
    pub color: ColorAttachment<'a>,
    pub depth: Option<DepthAttachment<'a>>,
}

/// Records GPU commands for one submission.
///
/// Render-pass commands (`set_*`, `draw*`) are valid only between
/// [`begin_render_pass`](Self::begin_render_pass) and
/// [`end_render_pass`](Self::end_render_pass); copies are valid only outside a pass.
/// Nothing reaches the GPU until [`submit`](Self::submit).
pub trait CommandRecorder: Send {
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_>);
    fn end_render_pass(&mut self);

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32);
    fn set_pipeline(&mut self, pipeline: &GpuRenderPipeline);
    fn set_bind_group(&mut self, index: u32, bind_group: &GpuBindGroup, offsets: &[u32]);
    fn set_vertex_buffer(&mut self, slot: u32, buffer: &GpuBuffer);
    fn set_index_buffer(&mut self, buffer: &GpuBuffer, format: wgpu::IndexFormat);
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    fn copy_buffer_to_buffer(
        &mut self,
        source: &GpuBuffer,
        source_offset: u64,
        destination: &GpuBuffer,
        destination_offset: u64,
        size: u64,
    );

    /// Copy a whole single-sample texture into `destination`, rows padded to
    /// `bytes_per_row`.
    fn copy_texture_to_buffer(&mut self, source: &GpuTexture, destination: &GpuBuffer, bytes_per_row: u32);

    /// Finish recording and hand the commands to the GPU queue.
    fn submit(self: Box<Self>);
}

/// Trait abstracting GPU resource creation and queue operations.
///
/// Methods take `&self` and return owned wrappers, so one context can be shared
/// behind an `Arc<dyn RenderContext>` by every renderer component.
///
/// ```rust,no_run
/// use lumen_test_utils::RenderContext;
/// use wgpu::{BufferDescriptor, BufferUsages};
///
/// fn upload(ctx: &dyn RenderContext, data: &[u8]) {
///     let buffer = ctx.create_buffer(&BufferDescriptor {
///         label: Some("upload"),
///         size: data.len() as u64,
///         usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
///         mapped_at_creation: false,
///     });
///     ctx.write_buffer(&buffer, 0, data);
/// }
/// ```
pub trait RenderContext: Send + Sync {
    fn create_buffer(&self, desc: &wgpu::BufferDescriptor) -> GpuBuffer;

    /// Schedule a write of `data` into `buffer`, applied before the next submission.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]);

    /// Schedule a write of `size` bytes produced in place by `fill`.
    ///
    /// The slice handed to `fill` is at least 4-byte aligned.
    fn write_buffer_with(&self, buffer: &GpuBuffer, offset: u64, size: u64, fill: &mut dyn FnMut(&mut [u8]));

    fn create_texture(&self, desc: &wgpu::TextureDescriptor) -> GpuTexture;

    /// Replace the full contents of a texture. `bytes_per_row` is unpadded.
    fn write_texture(&self, texture: &GpuTexture, data: &[u8], bytes_per_row: u32);

    fn create_sampler(&self, desc: &wgpu::SamplerDescriptor) -> GpuSampler;

    fn create_shader_module(&self, desc: &wgpu::ShaderModuleDescriptor) -> Result<GpuShaderModule, GpuError>;

    fn create_bind_group_layout(&self, desc: &wgpu::BindGroupLayoutDescriptor) -> GpuBindGroupLayout;

    fn create_bind_group(&self, desc: &BindGroupDescriptor) -> GpuBindGroup;

    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> Result<GpuRenderPipeline, GpuError>;

    /// Start recording a new command stream.
    fn create_recorder(&self, label: &str) -> Box<dyn CommandRecorder>;

    /// Map a `MAP_READ` buffer, copy its contents out and unmap it. Blocks until the
    /// GPU has finished writing it.
    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>, GpuError>;

    /// Block until all submitted work has completed.
    fn wait_idle(&self);
}
