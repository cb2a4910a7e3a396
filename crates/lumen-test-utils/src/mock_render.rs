//! Mock implementation of [`RenderContext`] for testing.
//!
//! The mock records every resource creation as a [`RenderCall`] and every submitted
//! command stream as a list of [`CommandCall`]s. Its recorder also enforces the
//! recording contract a real backend validates (pass nesting, copies outside passes,
//! pipeline/target compatibility, MSAA resolve shape) and panics on violations, so
//! renderer tests fail loudly where a real GPU would raise a validation error.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu_types::*;
use crate::render_context::*;

/// A resource-level operation recorded by [`MockRenderContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    CreateBuffer {
        id: ResourceId,
        label: Option<String>,
        size: u64,
        usage: wgpu::BufferUsages,
    },
    WriteBuffer {
        id: ResourceId,
        offset: u64,
        size: u64,
    },
    CreateTexture {
        id: ResourceId,
        label: Option<String>,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        sample_count: u32,
    },
    WriteTexture {
        id: ResourceId,
        size: usize,
    },
    CreateSampler {
        id: ResourceId,
        label: Option<String>,
    },
    CreateShaderModule {
        id: ResourceId,
        label: Option<String>,
    },
    CreateBindGroupLayout {
        id: ResourceId,
        label: Option<String>,
    },
    CreateBindGroup {
        id: ResourceId,
        label: Option<String>,
        resources: Vec<ResourceId>,
    },
    CreateRenderPipeline {
        id: ResourceId,
        label: Option<String>,
        format: wgpu::TextureFormat,
        sample_count: u32,
        blend: Option<wgpu::BlendState>,
        depth: bool,
    },
    ReadBuffer {
        id: ResourceId,
    },
    WaitIdle,
}

/// A command recorded inside a submitted command stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandCall {
    BeginRenderPass {
        label: Option<String>,
        target: ResourceId,
        resolve_target: Option<ResourceId>,
        load: LoadOp,
        depth: Option<ResourceId>,
        /// Depth clear value, `None` when the depth attachment is loaded.
        depth_clear: Option<f32>,
    },
    EndRenderPass,
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    SetPipeline(ResourceId),
    SetBindGroup {
        index: u32,
        bind_group: ResourceId,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: ResourceId,
    },
    SetIndexBuffer(ResourceId),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    CopyBufferToBuffer {
        source: ResourceId,
        destination: ResourceId,
        size: u64,
    },
    CopyTextureToBuffer {
        source: ResourceId,
        destination: ResourceId,
    },
}

impl CommandCall {
    pub fn is_draw(&self) -> bool {
        matches!(self, CommandCall::Draw { .. } | CommandCall::DrawIndexed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct PipelineInfo {
    format: wgpu::TextureFormat,
    sample_count: u32,
    depth: bool,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<RenderCall>>,
    submissions: Mutex<Vec<Vec<CommandCall>>>,
    buffer_data: Mutex<HashMap<ResourceId, Vec<u8>>>,
    pipelines: Mutex<HashMap<ResourceId, PipelineInfo>>,
    failing_labels: Mutex<HashSet<String>>,
}

impl MockState {
    fn record(&self, call: RenderCall) {
        self.calls.lock().push(call);
    }

    fn store_bytes(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        let mut storage = self.buffer_data.lock();
        let contents = storage
            .entry(buffer.id())
            .or_insert_with(|| vec![0; buffer.size() as usize]);
        let start = offset as usize;
        let end = start + data.len();
        assert!(
            end <= contents.len(),
            "write of {} bytes at offset {} overflows buffer {} of {} bytes",
            data.len(),
            offset,
            buffer.id(),
            contents.len()
        );
        contents[start..end].copy_from_slice(data);
    }

    fn should_fail(&self, label: Option<&str>) -> bool {
        label.is_some_and(|label| self.failing_labels.lock().contains(label))
    }
}

/// Mock GPU context.
///
/// ```rust
/// use lumen_test_utils::{MockRenderContext, RenderContext};
///
/// let mock = MockRenderContext::new();
/// let buffer = mock.create_buffer(&wgpu::BufferDescriptor {
///     label: None,
///     size: 1024,
///     usage: wgpu::BufferUsages::VERTEX,
///     mapped_at_creation: false,
/// });
///
/// assert!(buffer.is_mock());
/// assert_eq!(mock.count_buffer_creates(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MockRenderContext {
    state: Arc<MockState>,
}

impl MockRenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make shader module and pipeline creation fail for resources with `label`.
    pub fn fail_label(&self, label: &str) {
        self.state.failing_labels.lock().insert(label.to_owned());
    }

    /// All resource-level calls recorded so far.
    pub fn calls(&self) -> Vec<RenderCall> {
        self.state.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().clear();
        self.state.submissions.lock().clear();
    }

    /// Every submitted command stream, oldest first.
    pub fn submissions(&self) -> Vec<Vec<CommandCall>> {
        self.state.submissions.lock().clone()
    }

    pub fn last_submission(&self) -> Option<Vec<CommandCall>> {
        self.state.submissions.lock().last().cloned()
    }

    /// Current bytes of a buffer as seen through writes and injected contents.
    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Option<Vec<u8>> {
        self.state.buffer_data.lock().get(&buffer.id()).cloned()
    }

    /// Overwrite the bytes `read_buffer` will return for `buffer`.
    pub fn set_buffer_contents(&self, buffer: &GpuBuffer, data: &[u8]) {
        self.state.store_bytes(buffer, 0, data);
    }

    pub fn count_calls(&self, predicate: impl Fn(&RenderCall) -> bool) -> usize {
        self.state.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn count_buffer_creates(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::CreateBuffer { .. }))
    }

    pub fn count_buffer_writes(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::WriteBuffer { .. }))
    }

    pub fn count_texture_creates(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::CreateTexture { .. }))
    }

    pub fn count_pipeline_creates(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::CreateRenderPipeline { .. }))
    }

    pub fn count_bind_group_creates(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::CreateBindGroup { .. }))
    }

    pub fn count_wait_idle(&self) -> usize {
        self.count_calls(|c| matches!(c, RenderCall::WaitIdle))
    }
}

impl RenderContext for MockRenderContext {
    fn create_buffer(&self, desc: &wgpu::BufferDescriptor) -> GpuBuffer {
        let buffer = GpuBuffer::mock(desc.size, desc.usage);
        self.state.record(RenderCall::CreateBuffer {
            id: buffer.id(),
            label: desc.label.map(str::to_owned),
            size: desc.size,
            usage: desc.usage,
        });
        buffer
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        self.state.store_bytes(buffer, offset, data);
        self.state.record(RenderCall::WriteBuffer {
            id: buffer.id(),
            offset,
            size: data.len() as u64,
        });
    }

    fn write_buffer_with(&self, buffer: &GpuBuffer, offset: u64, size: u64, fill: &mut dyn FnMut(&mut [u8])) {
        // Back the staging bytes with u32 storage so callers can cast to Pod structs.
        let mut words = vec![0u32; (size as usize).div_ceil(4)];
        let bytes: &mut [u8] = &mut bytemuck::cast_slice_mut(&mut words)[..size as usize];
        fill(bytes);
        let bytes = bytes.to_vec();
        self.state.store_bytes(buffer, offset, &bytes);
        self.state.record(RenderCall::WriteBuffer {
            id: buffer.id(),
            offset,
            size,
        });
    }

    fn create_texture(&self, desc: &wgpu::TextureDescriptor) -> GpuTexture {
        let texture = GpuTexture::mock(desc);
        self.state.record(RenderCall::CreateTexture {
            id: texture.id(),
            label: desc.label.map(str::to_owned),
            width: desc.size.width,
            height: desc.size.height,
            format: desc.format,
            sample_count: desc.sample_count,
        });
        texture
    }

    fn write_texture(&self, texture: &GpuTexture, data: &[u8], bytes_per_row: u32) {
        assert_eq!(
            data.len(),
            (bytes_per_row * texture.height()) as usize,
            "texture write size does not match texture {}",
            texture.id()
        );
        self.state.record(RenderCall::WriteTexture {
            id: texture.id(),
            size: data.len(),
        });
    }

    fn create_sampler(&self, desc: &wgpu::SamplerDescriptor) -> GpuSampler {
        let sampler = GpuSampler::mock(desc.label);
        self.state.record(RenderCall::CreateSampler {
            id: sampler.id(),
            label: desc.label.map(str::to_owned),
        });
        sampler
    }

    fn create_shader_module(&self, desc: &wgpu::ShaderModuleDescriptor) -> Result<GpuShaderModule, GpuError> {
        if self.state.should_fail(desc.label) {
            return Err(GpuError::Validation(format!(
                "shader module {:?} rejected",
                desc.label
            )));
        }
        let module = GpuShaderModule::mock(desc.label);
        self.state.record(RenderCall::CreateShaderModule {
            id: module.id(),
            label: desc.label.map(str::to_owned),
        });
        Ok(module)
    }

    fn create_bind_group_layout(&self, desc: &wgpu::BindGroupLayoutDescriptor) -> GpuBindGroupLayout {
        let layout = GpuBindGroupLayout::mock(desc.label);
        self.state.record(RenderCall::CreateBindGroupLayout {
            id: layout.id(),
            label: desc.label.map(str::to_owned),
        });
        layout
    }

    fn create_bind_group(&self, desc: &BindGroupDescriptor) -> GpuBindGroup {
        let group = GpuBindGroup::mock(desc.label);
        let resources = desc
            .entries
            .iter()
            .map(|entry| match entry.resource {
                BindingResource::Buffer(buffer) => buffer.id(),
                BindingResource::BufferSlice { buffer, .. } => buffer.id(),
                BindingResource::Texture(texture) => texture.id(),
                BindingResource::Sampler(sampler) => sampler.id(),
            })
            .collect();
        self.state.record(RenderCall::CreateBindGroup {
            id: group.id(),
            label: desc.label.map(str::to_owned),
            resources,
        });
        group
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> Result<GpuRenderPipeline, GpuError> {
        if self.state.should_fail(desc.label) {
            return Err(GpuError::Validation(format!(
                "render pipeline {:?} rejected",
                desc.label
            )));
        }
        let pipeline = GpuRenderPipeline::mock(desc.label);
        self.state.pipelines.lock().insert(
            pipeline.id(),
            PipelineInfo {
                format: desc.color_format,
                sample_count: desc.sample_count,
                depth: desc.depth.is_some(),
            },
        );
        self.state.record(RenderCall::CreateRenderPipeline {
            id: pipeline.id(),
            label: desc.label.map(str::to_owned),
            format: desc.color_format,
            sample_count: desc.sample_count,
            blend: desc.blend,
            depth: desc.depth.is_some(),
        });
        Ok(pipeline)
    }

    fn create_recorder(&self, _label: &str) -> Box<dyn CommandRecorder> {
        Box::new(MockCommandRecorder {
            state: self.state.clone(),
            commands: Vec::new(),
            open_pass: None,
        })
    }

    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>, GpuError> {
        if !buffer.usage().contains(wgpu::BufferUsages::MAP_READ) {
            return Err(GpuError::Map(format!("buffer {} is not MAP_READ", buffer.id())));
        }
        self.state.record(RenderCall::ReadBuffer { id: buffer.id() });
        Ok(self
            .buffer_contents(buffer)
            .unwrap_or_else(|| vec![0; buffer.size() as usize]))
    }

    fn wait_idle(&self) {
        self.state.record(RenderCall::WaitIdle);
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenPass {
    format: wgpu::TextureFormat,
    sample_count: u32,
    depth: bool,
    pipeline_set: bool,
}

/// Recorder returned by [`MockRenderContext::create_recorder`].
pub struct MockCommandRecorder {
    state: Arc<MockState>,
    commands: Vec<CommandCall>,
    open_pass: Option<OpenPass>,
}

impl MockCommandRecorder {
    fn pass(&mut self, what: &str) -> &mut OpenPass {
        match self.open_pass.as_mut() {
            Some(pass) => pass,
            None => panic!("{what} recorded outside of a render pass"),
        }
    }
}

impl CommandRecorder for MockCommandRecorder {
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_>) {
        assert!(
            self.open_pass.is_none(),
            "render pass {:?} begun while another pass is open",
            desc.label
        );
        let target = desc.color.target;
        if let Some(resolve) = desc.color.resolve_target {
            assert!(
                target.sample_count() > 1,
                "resolve target set on single-sample attachment {}",
                target.id()
            );
            assert_eq!(resolve.sample_count(), 1, "resolve target must be single-sample");
            assert_eq!(resolve.format(), target.format(), "resolve target format mismatch");
        }
        if let Some(depth) = &desc.depth {
            assert_eq!(
                depth.target.sample_count(),
                target.sample_count(),
                "depth attachment sample count differs from color attachment"
            );
        }

        self.open_pass = Some(OpenPass {
            format: target.format(),
            sample_count: target.sample_count(),
            depth: desc.depth.is_some(),
            pipeline_set: false,
        });
        self.commands.push(CommandCall::BeginRenderPass {
            label: desc.label.map(str::to_owned),
            target: target.id(),
            resolve_target: desc.color.resolve_target.map(GpuTexture::id),
            load: desc.color.load,
            depth: desc.depth.as_ref().map(|d| d.target.id()),
            depth_clear: desc.depth.as_ref().and_then(|d| d.clear),
        });
    }

    fn end_render_pass(&mut self) {
        self.pass("end_render_pass");
        self.open_pass = None;
        self.commands.push(CommandCall::EndRenderPass);
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.pass("set_viewport");
        self.commands.push(CommandCall::SetViewport { x, y, width, height });
    }

    fn set_pipeline(&mut self, pipeline: &GpuRenderPipeline) {
        let info = self.state.pipelines.lock().get(&pipeline.id()).copied();
        let pass = self.pass("set_pipeline");
        if let Some(info) = info {
            assert_eq!(info.format, pass.format, "pipeline {:?} format mismatch", pipeline.label());
            assert_eq!(
                info.sample_count, pass.sample_count,
                "pipeline {:?} sample count mismatch",
                pipeline.label()
            );
            assert_eq!(info.depth, pass.depth, "pipeline {:?} depth state mismatch", pipeline.label());
        }
        pass.pipeline_set = true;
        self.commands.push(CommandCall::SetPipeline(pipeline.id()));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: &GpuBindGroup, _offsets: &[u32]) {
        self.pass("set_bind_group");
        self.commands.push(CommandCall::SetBindGroup {
            index,
            bind_group: bind_group.id(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &GpuBuffer) {
        self.pass("set_vertex_buffer");
        self.commands.push(CommandCall::SetVertexBuffer {
            slot,
            buffer: buffer.id(),
        });
    }

    fn set_index_buffer(&mut self, buffer: &GpuBuffer, _format: wgpu::IndexFormat) {
        self.pass("set_index_buffer");
        self.commands.push(CommandCall::SetIndexBuffer(buffer.id()));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        assert!(self.pass("draw").pipeline_set, "draw without a pipeline");
        self.commands.push(CommandCall::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        assert!(self.pass("draw_indexed").pipeline_set, "draw_indexed without a pipeline");
        self.commands.push(CommandCall::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn copy_buffer_to_buffer(
        &mut self,
        source: &GpuBuffer,
        source_offset: u64,
        destination: &GpuBuffer,
        destination_offset: u64,
        size: u64,
    ) {
        assert!(self.open_pass.is_none(), "buffer copy recorded inside a render pass");
        assert!(source_offset + size <= source.size(), "copy reads past the source buffer");
        assert!(
            destination_offset + size <= destination.size(),
            "copy writes past the destination buffer"
        );
        let moved = self
            .state
            .buffer_data
            .lock()
            .get(&source.id())
            .map(|data| data[source_offset as usize..(source_offset + size) as usize].to_vec());
        if let Some(bytes) = moved {
            self.state.store_bytes(destination, destination_offset, &bytes);
        }
        self.commands.push(CommandCall::CopyBufferToBuffer {
            source: source.id(),
            destination: destination.id(),
            size,
        });
    }

    fn copy_texture_to_buffer(&mut self, source: &GpuTexture, destination: &GpuBuffer, bytes_per_row: u32) {
        assert!(self.open_pass.is_none(), "texture copy recorded inside a render pass");
        assert_eq!(source.sample_count(), 1, "cannot copy a multisampled texture");
        assert_eq!(bytes_per_row % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0, "unaligned bytes_per_row");
        assert!(
            u64::from(bytes_per_row) * u64::from(source.height()) <= destination.size(),
            "texture copy overflows buffer {}",
            destination.id()
        );
        self.commands.push(CommandCall::CopyTextureToBuffer {
            source: source.id(),
            destination: destination.id(),
        });
    }

    fn submit(self: Box<Self>) {
        assert!(self.open_pass.is_none(), "submitted with an open render pass");
        self.state.submissions.lock().push(self.commands);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(mock: &MockRenderContext, samples: u32) -> GpuTexture {
        mock.create_texture(&wgpu::TextureDescriptor {
            label: Some("target"),
            size: wgpu::Extent3d {
                width: 8,
                height: 8,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
    }

    #[test]
    fn test_write_buffer_with_is_stored() {
        let mock = MockRenderContext::new();
        let buffer = mock.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: 8,
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        mock.write_buffer_with(&buffer, 0, 8, &mut |bytes| bytes.fill(7));
        assert_eq!(mock.buffer_contents(&buffer), Some(vec![7; 8]));
        assert_eq!(mock.count_buffer_writes(), 1);
    }

    #[test]
    fn test_submission_records_pass_commands() {
        let mock = MockRenderContext::new();
        let target = texture(&mock, 1);
        let mut recorder = mock.create_recorder("frame");
        recorder.begin_render_pass(&RenderPassDescriptor {
            label: Some("clear"),
            color: ColorAttachment {
                target: &target,
                resolve_target: None,
                load: LoadOp::Clear(wgpu::Color::BLACK),
            },
            depth: None,
        });
        recorder.end_render_pass();
        recorder.submit();

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].len(), 2);
        assert!(matches!(
            submissions[0][0],
            CommandCall::BeginRenderPass { load: LoadOp::Clear(_), .. }
        ));
    }

    #[test]
    #[should_panic(expected = "outside of a render pass")]
    fn test_draw_outside_pass_panics() {
        let mock = MockRenderContext::new();
        let mut recorder = mock.create_recorder("frame");
        recorder.draw(0..6, 0..1);
    }

    #[test]
    #[should_panic(expected = "resolve target set on single-sample")]
    fn test_resolve_requires_multisampled_source() {
        let mock = MockRenderContext::new();
        let target = texture(&mock, 1);
        let resolve = texture(&mock, 1);
        let mut recorder = mock.create_recorder("frame");
        recorder.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color: ColorAttachment {
                target: &target,
                resolve_target: Some(&resolve),
                load: LoadOp::Load,
            },
            depth: None,
        });
    }

    #[test]
    fn test_failing_label_rejects_shader() {
        let mock = MockRenderContext::new();
        mock.fail_label("broken");
        let result = mock.create_shader_module(&wgpu::ShaderModuleDescriptor {
            label: Some("broken"),
            source: wgpu::ShaderSource::Wgsl("".into()),
        });
        assert!(matches!(result, Err(GpuError::Validation(_))));
    }

    #[test]
    fn test_read_buffer_requires_map_read() {
        let mock = MockRenderContext::new();
        let buffer = mock.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: 4,
            usage: wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        assert!(mock.read_buffer(&buffer).is_err());
    }
}
