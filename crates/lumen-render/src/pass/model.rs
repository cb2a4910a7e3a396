//! Instanced 3D meshes.
//!
//! Consecutive requests that share a mesh, texture and sampler are drawn with one
//! instanced call, the same run splitting the sprite pass uses. Per-instance data
//! goes through a transfer buffer and a copy, like sprite instances.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use lumen_core::profiling::{profile_function, profile_scope};
use lumen_test_utils::{
    BindGroupDescriptor, BindGroupEntry, BindingResource, DepthState, GpuBindGroup, GpuBuffer, GpuRenderPipeline,
    GpuSampler, GpuTexture, RenderContext, RenderPipelineDescriptor, ResourceId, ShaderStage,
};

use super::{
    CameraUniform, PassFrame, PassInit, PassKind, PassState, PassStats, RenderPass, TextureGroupCache,
    ensure_initialized,
};
use crate::batch::split_runs;
use crate::error::RenderError;
use crate::fullscreen::texture_slot_entries;
use crate::shader::CompiledShader;

const SOURCE: &str = include_str!("../shaders/model.wgsl");

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 3] =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2];
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

/// Per-instance vertex data.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ModelInstance {
    pub model: [[f32; 4]; 4],
    pub tint: [f32; 4],
}

impl ModelInstance {
    pub const SIZE: u64 = std::mem::size_of::<ModelInstance>() as u64;

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
            3 => Float32x4, 4 => Float32x4, 5 => Float32x4, 6 => Float32x4, 7 => Float32x4
        ];
        wgpu::VertexBufferLayout {
            array_stride: Self::SIZE,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &ATTRIBUTES,
        }
    }
}

impl Default for ModelInstance {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY.to_cols_array_2d(),
            tint: [1.0; 4],
        }
    }
}

/// An uploaded triangle mesh with `u32` indices.
#[derive(Debug)]
pub struct Mesh {
    name: String,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
}

impl Mesh {
    pub fn upload(context: &dyn RenderContext, name: &str, vertices: &[MeshVertex], indices: &[u32]) -> Self {
        let vertex_buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: std::mem::size_of_val(vertices).max(4) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.write_buffer(&vertex_buffer, 0, bytemuck::cast_slice(vertices));
        let index_buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: std::mem::size_of_val(indices).max(4) as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.write_buffer(&index_buffer, 0, bytemuck::cast_slice(indices));

        tracing::debug!("Uploaded mesh '{}' ({} vertices)", name, vertices.len());
        Self {
            name: name.to_owned(),
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        }
    }

    /// Unit cube centred on the origin with per-face normals.
    pub fn cube(context: &dyn RenderContext) -> Self {
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let position = normal * 0.5 + right * (u - 0.5) + up * (v - 0.5);
                vertices.push(MeshVertex {
                    position: position.to_array(),
                    normal: normal.to_array(),
                    uv: [u, 1.0 - v],
                });
            }
            indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::upload(context, "cube", &vertices, &indices)
    }

    pub fn id(&self) -> ResourceId {
        self.vertex_buffer.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// One mesh instance to draw this frame.
#[derive(Debug, Clone)]
pub struct ModelDrawRequest {
    pub mesh: Arc<Mesh>,
    pub texture: GpuTexture,
    pub sampler: GpuSampler,
    pub transform: Mat4,
    pub tint: [f32; 4],
}

impl ModelDrawRequest {
    pub fn new(mesh: Arc<Mesh>, texture: GpuTexture, sampler: GpuSampler) -> Self {
        Self {
            mesh,
            texture,
            sampler,
            transform: Mat4::IDENTITY,
            tint: [1.0; 4],
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_tint(mut self, tint: [f32; 4]) -> Self {
        self.tint = tint;
        self
    }

    fn instance(&self) -> ModelInstance {
        ModelInstance {
            model: self.transform.to_cols_array_2d(),
            tint: self.tint,
        }
    }
}

fn same_model_run(previous: &ModelDrawRequest, current: &ModelDrawRequest) -> bool {
    previous.mesh.id() == current.mesh.id()
        && previous.texture.id() == current.texture.id()
        && previous.sampler.id() == current.sampler.id()
}

struct ModelGpu {
    transfer: GpuBuffer,
    instances: GpuBuffer,
    camera: GpuBuffer,
    camera_group: GpuBindGroup,
    pipeline: GpuRenderPipeline,
    texture_groups: TextureGroupCache,
    uses_depth: bool,
}

impl ModelGpu {
    fn new(init: &PassInit<'_>, name: &str, capacity: usize) -> Result<Self, RenderError> {
        let context = init.context;
        let module = CompiledShader::wgsl(SOURCE, "vs_main").create_module(context, "Model Shader")?;
        let instance_bytes = capacity.max(1) as u64 * ModelInstance::SIZE;

        let transfer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Model Transfer Buffer"),
            size: instance_bytes,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let instances = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Model Instance Buffer"),
            size: instance_bytes,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let camera = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Model Camera"),
            size: std::mem::size_of::<CameraUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let camera_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Model Camera Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Model Texture Layout"),
            entries: &texture_slot_entries(1),
        });
        let camera_group = context.create_bind_group(&BindGroupDescriptor {
            label: Some("Model Camera Bind Group"),
            layout: &camera_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(&camera),
            }],
        });

        let pipeline = context
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("Model Pipeline"),
                bind_group_layouts: &[&camera_layout, &texture_layout],
                vertex: ShaderStage {
                    module: &module,
                    entry_point: "vs_main",
                },
                vertex_buffers: &[MeshVertex::layout(), ModelInstance::layout()],
                fragment: ShaderStage {
                    module: &module,
                    entry_point: "fs_main",
                },
                color_format: init.color_format,
                blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                depth: init.depth_format.map(|format| DepthState {
                    format,
                    write_enabled: true,
                    compare: wgpu::CompareFunction::Less,
                }),
                sample_count: init.sample_count,
                cull_mode: Some(wgpu::Face::Back),
            })
            .map_err(|e| {
                tracing::error!("Failed to create model pipeline for pass '{}': {}", name, e);
                RenderError::from(e)
            })?;

        Ok(Self {
            transfer,
            instances,
            camera,
            camera_group,
            pipeline,
            texture_groups: TextureGroupCache::new(texture_layout, "Model Texture Bind Group"),
            uses_depth: init.depth_format.is_some(),
        })
    }
}

pub struct Model3DPass {
    name: String,
    state: PassState,
    capacity: usize,
    queue: Vec<ModelDrawRequest>,
    gpu: Option<ModelGpu>,
}

impl Model3DPass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: PassState::Uninitialized,
            capacity: 0,
            queue: Vec::new(),
            gpu: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&self, frame: &mut PassFrame<'_>, gpu: &mut ModelGpu) -> PassStats {
        gpu.texture_groups.begin_frame();
        let view_projection = frame
            .cameras
            .camera_3d
            .view_projection(frame.viewport.width, frame.viewport.height);
        frame.context.write_buffer(
            &gpu.camera,
            0,
            bytemuck::bytes_of(&CameraUniform {
                view_projection: view_projection.to_cols_array_2d(),
            }),
        );

        let count = self.queue.len();
        if count > 0 {
            profile_scope!("upload_model_instances");
            let size = count as u64 * ModelInstance::SIZE;
            let queue = &self.queue;
            frame.context.write_buffer_with(&gpu.transfer, 0, size, &mut |bytes: &mut [u8]| {
                for (chunk, request) in bytes.chunks_exact_mut(ModelInstance::SIZE as usize).zip(queue) {
                    chunk.copy_from_slice(bytemuck::bytes_of(&request.instance()));
                }
            });
            frame.recorder.copy_buffer_to_buffer(&gpu.transfer, 0, &gpu.instances, 0, size);
        }

        let mut stats = PassStats {
            instances: count,
            render_passes: 1,
            ..Default::default()
        };
        let depth = gpu.uses_depth && frame.has_depth();
        frame.begin_target_pass(&self.name, true, true, depth);
        frame.recorder.set_pipeline(&gpu.pipeline);
        frame.recorder.set_bind_group(0, &gpu.camera_group, &[]);
        frame.recorder.set_vertex_buffer(1, &gpu.instances);
        split_runs(&self.queue, same_model_run, |run| {
            let first = &self.queue[run.start];
            let group = gpu.texture_groups.get(frame.context, &first.texture, &first.sampler);
            frame.recorder.set_bind_group(1, &group, &[]);
            frame.recorder.set_vertex_buffer(0, &first.mesh.vertex_buffer);
            frame
                .recorder
                .set_index_buffer(&first.mesh.index_buffer, wgpu::IndexFormat::Uint32);
            frame
                .recorder
                .draw_indexed(0..first.mesh.index_count, 0, run.start as u32..run.end as u32);
            stats.batches += 1;
            stats.draw_calls += 1;
        });
        frame.recorder.end_render_pass();

        gpu.texture_groups.evict_unused();
        stats
    }
}

impl RenderPass for Model3DPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PassKind {
        PassKind::Model3D
    }

    fn state(&self) -> PassState {
        self.state
    }

    fn init(&mut self, init: &PassInit<'_>) -> Result<(), RenderError> {
        profile_function!();
        if self.state == PassState::Initialized {
            self.release();
        }
        self.capacity = init.max_instances;
        self.gpu = Some(ModelGpu::new(init, &self.name, self.capacity)?);
        self.state = PassState::Initialized;
        tracing::debug!("Initialized model pass '{}' ({} instances)", self.name, self.capacity);
        Ok(())
    }

    fn render(&mut self, frame: &mut PassFrame<'_>) -> Result<PassStats, RenderError> {
        profile_function!();
        ensure_initialized(&self.name, self.state)?;
        let Some(mut gpu) = self.gpu.take() else {
            return Err(RenderError::NotInitialized(self.name.clone()));
        };
        let stats = self.record(frame, &mut gpu);
        self.gpu = Some(gpu);
        Ok(stats)
    }

    fn release(&mut self) {
        if self.gpu.take().is_some() {
            tracing::debug!("Released model pass '{}'", self.name);
        }
        if self.state == PassState::Initialized {
            self.state = PassState::Released;
        }
    }

    fn reset_render_queue(&mut self) {
        self.queue.clear();
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn queue_model(&mut self, request: ModelDrawRequest) -> Result<(), RenderError> {
        if self.queue.len() >= self.capacity {
            tracing::warn!("Model pass '{}' is full ({} requests)", self.name, self.capacity);
            return Err(RenderError::QueueFull {
                pass: self.name.clone(),
                capacity: self.capacity,
            });
        }
        self.queue.push(request);
        Ok(())
    }
}
