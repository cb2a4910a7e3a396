//! Full-screen quad and the texture binding convention shared by every
//! full-screen draw (swapchain blits, effect steps, shader passes).
//!
//! Render targets are allocated at the maximum resolution while only the top-left
//! `width x height` region is in use, so the quad's UVs are rescaled to cover
//! exactly that region.

use bytemuck::{Pod, Zeroable};
use lumen_test_utils::{
    BindGroupEntry, BindingResource, CommandRecorder, GpuBuffer, GpuSampler, GpuShaderModule, GpuTexture,
    RenderContext,
};

use crate::error::RenderError;
use crate::shader::CompiledShader;

/// Name of the built-in full-screen vertex stage. Effects use it unless they
/// bring their own vertex shader.
pub const FULLSCREEN_VERTEX: &str = "lumen:fullscreen";

const SOURCE: &str = include_str!("shaders/fullscreen.wgsl");

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FullscreenVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

impl FullscreenVertex {
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<FullscreenVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

/// Six vertices covering clip space, UVs spanning `[0, u_max] x [0, v_max]`.
pub fn quad_vertices(u_max: f32, v_max: f32) -> [FullscreenVertex; 6] {
    let v = |x: f32, y: f32, u: f32, v: f32| FullscreenVertex {
        position: [x, y],
        uv: [u, v],
    };
    [
        v(-1.0, -1.0, 0.0, v_max),
        v(1.0, -1.0, u_max, v_max),
        v(1.0, 1.0, u_max, 0.0),
        v(-1.0, -1.0, 0.0, v_max),
        v(1.0, 1.0, u_max, 0.0),
        v(-1.0, 1.0, 0.0, 0.0),
    ]
}

/// Compile the module holding `vs_main` and `fs_blit`.
pub fn create_fullscreen_module(context: &dyn RenderContext) -> Result<GpuShaderModule, RenderError> {
    CompiledShader::wgsl(SOURCE, "vs_main").create_module(context, "Fullscreen Shader")
}

pub struct FullscreenQuad {
    vertex_buffer: GpuBuffer,
    module: GpuShaderModule,
    max_size: (u32, u32),
    region: Option<(u32, u32)>,
}

impl FullscreenQuad {
    pub fn new(context: &dyn RenderContext, max_width: u32, max_height: u32) -> Result<Self, RenderError> {
        let module = create_fullscreen_module(context)?;
        let vertex_buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fullscreen Quad"),
            size: std::mem::size_of::<[FullscreenVertex; 6]>() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            vertex_buffer,
            module,
            max_size: (max_width.max(1), max_height.max(1)),
            region: None,
        })
    }

    /// Point the UVs at the `width x height` region of a max-size texture.
    pub fn set_region(&mut self, context: &dyn RenderContext, width: u32, height: u32) {
        if self.region == Some((width, height)) {
            return;
        }
        let u_max = (width as f32 / self.max_size.0 as f32).min(1.0);
        let v_max = (height as f32 / self.max_size.1 as f32).min(1.0);
        context.write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(&quad_vertices(u_max, v_max)));
        self.region = Some((width, height));
    }

    /// Module holding `vs_main` and `fs_blit`.
    pub fn module(&self) -> &GpuShaderModule {
        &self.module
    }

    pub fn draw(&self, recorder: &mut dyn CommandRecorder) {
        recorder.set_vertex_buffer(0, &self.vertex_buffer);
        recorder.draw(0..6, 0..1);
    }
}

/// Layout entries for `slots` texture/sampler pairs: texture at binding `2i`,
/// its sampler at `2i + 1`.
pub fn texture_slot_entries(slots: u32) -> Vec<wgpu::BindGroupLayoutEntry> {
    (0..slots)
        .flat_map(|i| {
            [
                wgpu::BindGroupLayoutEntry {
                    binding: 2 * i,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2 * i + 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ]
        })
        .collect()
}

/// Bind group entries matching [`texture_slot_entries`].
pub fn texture_slot_bindings<'a>(textures: &[&'a GpuTexture], sampler: &'a GpuSampler) -> Vec<BindGroupEntry<'a>> {
    textures
        .iter()
        .copied()
        .enumerate()
        .flat_map(|(i, texture)| {
            [
                BindGroupEntry {
                    binding: 2 * i as u32,
                    resource: BindingResource::Texture(texture),
                },
                BindGroupEntry {
                    binding: 2 * i as u32 + 1,
                    resource: BindingResource::Sampler(sampler),
                },
            ]
        })
        .collect()
}

/// Layout with one uniform buffer at binding 0 visible to the fragment stage.
pub fn uniform_entry() -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
