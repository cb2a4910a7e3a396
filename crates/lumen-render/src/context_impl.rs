//! [`RenderContext`] backed by a real wgpu device.

use std::num::NonZeroU64;
use std::ops::Range;

use lumen_test_utils::{
    BindGroupDescriptor, BindingResource, CommandRecorder, GpuBindGroup, GpuBindGroupLayout, GpuBuffer, GpuError,
    GpuRenderPipeline, GpuSampler, GpuShaderModule, GpuTexture, LoadOp, RenderContext, RenderPassDescriptor,
    RenderPipelineDescriptor,
};

use crate::context::GraphicsContext;

/// Run `f` inside a validation and an out-of-memory error scope.
fn scoped<T>(device: &wgpu::Device, label: Option<&str>, f: impl FnOnce() -> T) -> Result<T, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let out = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());

    let label = label.unwrap_or("<unnamed>");
    if let Some(err) = validation {
        tracing::error!("Validation error while creating '{}': {}", label, err);
        return Err(GpuError::Validation(format!("{}: {}", label, err)));
    }
    if let Some(err) = oom {
        tracing::error!("Out of memory while creating '{}': {}", label, err);
        return Err(GpuError::OutOfMemory(format!("{}: {}", label, err)));
    }
    Ok(out)
}

fn wgpu_load(load: LoadOp) -> wgpu::LoadOp<wgpu::Color> {
    match load {
        LoadOp::Clear(color) => wgpu::LoadOp::Clear(color),
        LoadOp::Load => wgpu::LoadOp::Load,
    }
}

impl RenderContext for GraphicsContext {
    fn create_buffer(&self, desc: &wgpu::BufferDescriptor) -> GpuBuffer {
        GpuBuffer::from_wgpu(self.device.create_buffer(desc))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        self.queue.write_buffer(buffer.as_wgpu(), offset, data);
    }

    fn write_buffer_with(&self, buffer: &GpuBuffer, offset: u64, size: u64, fill: &mut dyn FnMut(&mut [u8])) {
        let Some(size) = NonZeroU64::new(size) else {
            return;
        };
        match self.queue.write_buffer_with(buffer.as_wgpu(), offset, size) {
            Some(mut view) => fill(&mut view),
            None => {
                // Staging allocation failed; fall back to an aligned heap copy.
                let mut words = vec![0u32; size.get().div_ceil(4) as usize];
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
                let bytes = &mut bytes[..size.get() as usize];
                fill(bytes);
                self.queue.write_buffer(buffer.as_wgpu(), offset, bytes);
            }
        }
    }

    fn create_texture(&self, desc: &wgpu::TextureDescriptor) -> GpuTexture {
        GpuTexture::from_wgpu(self.device.create_texture(desc))
    }

    fn write_texture(&self, texture: &GpuTexture, data: &[u8], bytes_per_row: u32) {
        let (width, height) = texture.size();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: texture.as_wgpu(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_sampler(&self, desc: &wgpu::SamplerDescriptor) -> GpuSampler {
        GpuSampler::from_wgpu(self.device.create_sampler(desc), desc.label)
    }

    fn create_shader_module(&self, desc: &wgpu::ShaderModuleDescriptor) -> Result<GpuShaderModule, GpuError> {
        let module = scoped(&self.device, desc.label, || self.device.create_shader_module(desc.clone()))?;
        Ok(GpuShaderModule::from_wgpu(module, desc.label))
    }

    fn create_bind_group_layout(&self, desc: &wgpu::BindGroupLayoutDescriptor) -> GpuBindGroupLayout {
        GpuBindGroupLayout::from_wgpu(self.device.create_bind_group_layout(desc), desc.label)
    }

    fn create_bind_group(&self, desc: &BindGroupDescriptor) -> GpuBindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = desc
            .entries
            .iter()
            .map(|entry| wgpu::BindGroupEntry {
                binding: entry.binding,
                resource: match entry.resource {
                    BindingResource::Buffer(buffer) => buffer.as_wgpu().as_entire_binding(),
                    BindingResource::BufferSlice { buffer, offset, size } => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: buffer.as_wgpu(),
                            offset,
                            size,
                        })
                    }
                    BindingResource::Texture(texture) => wgpu::BindingResource::TextureView(texture.view()),
                    BindingResource::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler.as_wgpu()),
                },
            })
            .collect();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: desc.label,
            layout: desc.layout.as_wgpu(),
            entries: &entries,
        });
        GpuBindGroup::from_wgpu(bind_group, desc.label)
    }

    fn create_render_pipeline(&self, desc: &RenderPipelineDescriptor) -> Result<GpuRenderPipeline, GpuError> {
        let bind_group_layouts: Vec<&wgpu::BindGroupLayout> =
            desc.bind_group_layouts.iter().map(|layout| layout.as_wgpu()).collect();

        let pipeline = scoped(&self.device, desc.label, || {
            let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label,
                bind_group_layouts: &bind_group_layouts,
                push_constant_ranges: &[],
            });

            self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label,
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: desc.vertex.module.as_wgpu(),
                    entry_point: Some(desc.vertex.entry_point),
                    compilation_options: Default::default(),
                    buffers: desc.vertex_buffers,
                },
                fragment: Some(wgpu::FragmentState {
                    module: desc.fragment.module.as_wgpu(),
                    entry_point: Some(desc.fragment.entry_point),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: desc.color_format,
                        blend: desc.blend,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: desc.cull_mode,
                    ..Default::default()
                },
                depth_stencil: desc.depth.map(|depth| wgpu::DepthStencilState {
                    format: depth.format,
                    depth_write_enabled: depth.write_enabled,
                    depth_compare: depth.compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
                cache: None,
            })
        })?;

        Ok(GpuRenderPipeline::from_wgpu(pipeline, desc.label))
    }

    fn create_recorder(&self, label: &str) -> Box<dyn CommandRecorder> {
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        Box::new(WgpuRecorder {
            queue: self.queue.clone(),
            encoder,
            pass: None,
        })
    }

    fn read_buffer(&self, buffer: &GpuBuffer) -> Result<Vec<u8>, GpuError> {
        let slice = buffer.as_wgpu().slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| GpuError::Map(e.to_string()))?;

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GpuError::Map(e.to_string())),
            Err(_) => return Err(GpuError::Map("map callback dropped".to_owned())),
        }

        let data = slice.get_mapped_range().to_vec();
        buffer.as_wgpu().unmap();
        Ok(data)
    }

    fn wait_idle(&self) {
        if let Err(e) = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        }) {
            tracing::warn!("Waiting for the GPU failed: {}", e);
        }
    }
}

/// Records into a wgpu command encoder, one render pass at a time.
struct WgpuRecorder {
    queue: wgpu::Queue,
    encoder: wgpu::CommandEncoder,
    pass: Option<wgpu::RenderPass<'static>>,
}

impl WgpuRecorder {
    fn pass(&mut self, command: &str) -> Option<&mut wgpu::RenderPass<'static>> {
        if self.pass.is_none() {
            tracing::error!("{} recorded outside a render pass", command);
        }
        self.pass.as_mut()
    }
}

impl CommandRecorder for WgpuRecorder {
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_>) {
        if self.pass.take().is_some() {
            tracing::warn!("Render pass opened while another was still open");
        }

        let pass = self
            .encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: desc.label,
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: desc.color.target.view(),
                    depth_slice: None,
                    resolve_target: desc.color.resolve_target.map(|t| t.view()),
                    ops: wgpu::Operations {
                        load: wgpu_load(desc.color.load),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: desc.depth.map(|depth| wgpu::RenderPassDepthStencilAttachment {
                    view: depth.target.view(),
                    depth_ops: Some(wgpu::Operations {
                        load: depth.clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            })
            .forget_lifetime();
        self.pass = Some(pass);
    }

    fn end_render_pass(&mut self) {
        self.pass = None;
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        if let Some(pass) = self.pass("set_viewport") {
            pass.set_viewport(x, y, width, height, 0.0, 1.0);
        }
    }

    fn set_pipeline(&mut self, pipeline: &GpuRenderPipeline) {
        if let Some(pass) = self.pass("set_pipeline") {
            pass.set_pipeline(pipeline.as_wgpu());
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group: &GpuBindGroup, offsets: &[u32]) {
        if let Some(pass) = self.pass("set_bind_group") {
            pass.set_bind_group(index, bind_group.as_wgpu(), offsets);
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &GpuBuffer) {
        if let Some(pass) = self.pass("set_vertex_buffer") {
            pass.set_vertex_buffer(slot, buffer.as_wgpu().slice(..));
        }
    }

    fn set_index_buffer(&mut self, buffer: &GpuBuffer, format: wgpu::IndexFormat) {
        if let Some(pass) = self.pass("set_index_buffer") {
            pass.set_index_buffer(buffer.as_wgpu().slice(..), format);
        }
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if let Some(pass) = self.pass("draw") {
            pass.draw(vertices, instances);
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if let Some(pass) = self.pass("draw_indexed") {
            pass.draw_indexed(indices, base_vertex, instances);
        }
    }

    fn copy_buffer_to_buffer(
        &mut self,
        source: &GpuBuffer,
        source_offset: u64,
        destination: &GpuBuffer,
        destination_offset: u64,
        size: u64,
    ) {
        self.encoder.copy_buffer_to_buffer(
            source.as_wgpu(),
            source_offset,
            destination.as_wgpu(),
            destination_offset,
            size,
        );
    }

    fn copy_texture_to_buffer(&mut self, source: &GpuTexture, destination: &GpuBuffer, bytes_per_row: u32) {
        let (width, height) = source.size();
        self.encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: source.as_wgpu(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: destination.as_wgpu(),
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn submit(self: Box<Self>) {
        let WgpuRecorder { queue, encoder, pass } = *self;
        if pass.is_some() {
            tracing::warn!("Submitting with an open render pass");
        }
        drop(pass);
        queue.submit(Some(encoder.finish()));
    }
}

