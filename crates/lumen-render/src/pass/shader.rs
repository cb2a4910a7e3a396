//! Full-screen custom shader pass.
//!
//! Draws one full-screen quad with a fragment shader from the shader library,
//! sampling the content textures of other framebuffers and reading a uniform block
//! the application fills through [`RenderPass::uniforms_mut`].

use lumen_core::profiling::profile_function;
use lumen_test_utils::{
    BindGroupDescriptor, BindGroupEntry, BindingResource, GpuBindGroupLayout, GpuBuffer, GpuRenderPipeline,
    GpuTexture, RenderContext, RenderPipelineDescriptor, ShaderStage,
};

use super::{PassFrame, PassInit, PassKind, PassState, PassStats, RenderPass, ensure_initialized};
use crate::error::RenderError;
use crate::fullscreen::{
    FullscreenVertex, create_fullscreen_module, texture_slot_bindings, texture_slot_entries, uniform_entry,
};
use crate::shader::UniformBlock;

struct ShaderGpu {
    pipeline: GpuRenderPipeline,
    texture_layout: GpuBindGroupLayout,
    uniform_layout: Option<GpuBindGroupLayout>,
    uniform_buffer: Option<GpuBuffer>,
    /// Bound to slots without a named input.
    fallback: GpuTexture,
    slots: u32,
    /// Whether the uniform buffer holds the current block contents.
    uniforms_synced: bool,
}

pub struct ShaderPass {
    name: String,
    fragment: String,
    inputs: Vec<String>,
    state: PassState,
    uniforms: Option<UniformBlock>,
    gpu: Option<ShaderGpu>,
}

impl ShaderPass {
    /// `inputs` are framebuffer names bound to texture slots 0, 1, ... in order.
    pub fn new(name: impl Into<String>, fragment: impl Into<String>, inputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fragment: fragment.into(),
            inputs,
            state: PassState::Uninitialized,
            uniforms: None,
            gpu: None,
        }
    }

    pub fn fragment_shader(&self) -> &str {
        &self.fragment
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn fallback_texture(context: &dyn RenderContext) -> GpuTexture {
        let texture = context.create_texture(&wgpu::TextureDescriptor {
            label: Some("Shader Pass Fallback"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        context.write_texture(&texture, &[0; 4], 4);
        texture
    }
}

impl RenderPass for ShaderPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PassKind {
        PassKind::Shader
    }

    fn state(&self) -> PassState {
        self.state
    }

    fn init(&mut self, init: &PassInit<'_>) -> Result<(), RenderError> {
        if let Some(target) = self.inputs.iter().find(|input| input.as_str() == init.framebuffer) {
            tracing::error!("Pass '{}' lists its own framebuffer '{}' as an input", self.name, target);
            return Err(RenderError::SelfSample {
                pass: self.name.clone(),
                target: target.clone(),
            });
        }

        let context = init.context;
        let shader = init.shaders.require(&self.fragment)?;
        let reflection = &shader.reflection;
        let fragment = shader.create_module(context, &self.fragment)?;
        let vertex = create_fullscreen_module(context)?;

        let slots = reflection.sampler_count.max(1);
        if (self.inputs.len() as u32) > slots {
            tracing::warn!(
                "Pass '{}' has {} inputs but '{}' samples only {} textures",
                self.name,
                self.inputs.len(),
                self.fragment,
                slots
            );
        }
        let texture_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shader Pass Textures"),
            entries: &texture_slot_entries(slots),
        });

        let uses_uniform = reflection.uniform_buffer_count > 0;
        if uses_uniform && self.uniforms.is_none() {
            self.uniforms = Some(UniformBlock::new(self.name.clone(), reflection));
        }
        let uniform_layout = uses_uniform.then(|| {
            context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Shader Pass Uniforms"),
                entries: &[uniform_entry()],
            })
        });
        let uniform_buffer = self.uniforms.as_ref().filter(|_| uses_uniform).map(|block| {
            context.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Shader Pass Uniform Buffer"),
                size: block.bytes().len() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        let mut layouts = vec![&texture_layout];
        layouts.extend(uniform_layout.as_ref());
        let label = format!("Shader Pass {}", self.name);
        let pipeline = context
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some(label.as_str()),
                bind_group_layouts: &layouts,
                vertex: ShaderStage {
                    module: &vertex,
                    entry_point: "vs_main",
                },
                vertex_buffers: &[FullscreenVertex::layout()],
                fragment: ShaderStage {
                    module: &fragment,
                    entry_point: &shader.entry_point,
                },
                color_format: init.color_format,
                blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                depth: None,
                sample_count: init.sample_count,
                cull_mode: None,
            })
            .map_err(|e| {
                tracing::error!("Failed to create pipeline for pass '{}': {}", self.name, e);
                RenderError::Gpu(e)
            })?;

        self.gpu = Some(ShaderGpu {
            pipeline,
            texture_layout,
            uniform_layout,
            uniform_buffer,
            fallback: Self::fallback_texture(context),
            slots,
            uniforms_synced: false,
        });
        self.state = PassState::Initialized;
        tracing::debug!("Initialized shader pass '{}' ({} texture slots)", self.name, slots);
        Ok(())
    }

    fn render(&mut self, frame: &mut PassFrame<'_>) -> Result<PassStats, RenderError> {
        profile_function!();
        ensure_initialized(&self.name, self.state)?;
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(RenderError::NotInitialized(self.name.clone()));
        };

        if let (Some(block), Some(buffer)) = (self.uniforms.as_mut(), gpu.uniform_buffer.as_ref()) {
            let dirty = block.take_dirty();
            if dirty || !gpu.uniforms_synced {
                frame.context.write_buffer(buffer, 0, block.bytes());
                gpu.uniforms_synced = true;
            }
        }

        let mut textures: Vec<&GpuTexture> = Vec::with_capacity(gpu.slots as usize);
        for name in &self.inputs {
            match frame.targets.get(name) {
                Some(texture) => textures.push(texture),
                None => {
                    tracing::warn!("Pass '{}' samples unknown render target '{}'", self.name, name);
                    textures.push(&gpu.fallback);
                }
            }
        }
        textures.resize(gpu.slots as usize, &gpu.fallback);

        let sampler = frame.samplers.linear(frame.context);
        let entries = texture_slot_bindings(&textures, &sampler);
        let textures_group = frame.context.create_bind_group(&BindGroupDescriptor {
            label: Some("Shader Pass Textures"),
            layout: &gpu.texture_layout,
            entries: &entries,
        });
        let uniform_group = match (&gpu.uniform_layout, &gpu.uniform_buffer) {
            (Some(layout), Some(buffer)) => Some(frame.context.create_bind_group(&BindGroupDescriptor {
                label: Some("Shader Pass Uniforms"),
                layout,
                entries: &[BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(buffer),
                }],
            })),
            _ => None,
        };

        frame.begin_target_pass(&self.name, true, true, false);
        frame.recorder.set_pipeline(&gpu.pipeline);
        frame.recorder.set_bind_group(0, &textures_group, &[]);
        if let Some(group) = &uniform_group {
            frame.recorder.set_bind_group(1, group, &[]);
        }
        frame.quad.draw(frame.recorder);
        frame.recorder.end_render_pass();

        Ok(PassStats {
            render_passes: 1,
            draw_calls: 1,
            ..Default::default()
        })
    }

    fn release(&mut self) {
        if self.gpu.take().is_some() {
            tracing::debug!("Released shader pass '{}'", self.name);
        }
        if self.state == PassState::Initialized {
            self.state = PassState::Released;
        }
    }

    fn reset_render_queue(&mut self) {}

    fn queued(&self) -> usize {
        0
    }

    fn uniforms_mut(&mut self) -> Result<&mut UniformBlock, RenderError> {
        match self.uniforms.as_mut() {
            Some(block) => Ok(block),
            None if self.state == PassState::Uninitialized => Err(RenderError::NotInitialized(self.name.clone())),
            None => Err(RenderError::UnsupportedPass {
                pass: self.name.clone(),
                operation: "uniform buffers",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::test_support::{Harness, texture};
    use crate::shader::{CompiledShader, ShaderReflection, UniformSlot};
    use ahash::HashMap;
    use lumen_test_utils::{CommandCall, LoadOp, RenderCall};

    const VIGNETTE: &str = "vignette.wgsl";

    fn reflection(samplers: u32, with_uniform: bool) -> ShaderReflection {
        let mut uniforms = HashMap::default();
        if with_uniform {
            uniforms.insert("strength".to_owned(), UniformSlot { offset: 0, size: 4 });
        }
        ShaderReflection {
            sampler_count: samplers,
            uniform_buffer_count: u32::from(with_uniform),
            uniforms,
            ..Default::default()
        }
    }

    fn harness(samplers: u32, with_uniform: bool) -> Harness {
        let mut harness = Harness::new(1, false);
        harness.shaders.insert(
            VIGNETTE,
            CompiledShader::wgsl("@fragment fn fs_main() {}", "fs_main").with_reflection(reflection(samplers, with_uniform)),
        );
        harness
    }

    fn content(harness: &Harness) -> GpuTexture {
        texture(
            &harness.mock,
            harness.format,
            1,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        )
    }

    #[test]
    fn test_draws_one_quad_into_the_target() {
        let harness = harness(1, false);
        let mut pass = ShaderPass::new("post", VIGNETTE, vec![]);
        pass.init(&harness.init()).unwrap();

        let stats = harness.render(&mut pass, LoadOp::Load).unwrap();
        assert_eq!(stats.render_passes, 1);
        assert_eq!(stats.draw_calls, 1);

        let commands = harness.mock.last_submission().unwrap();
        assert!(matches!(
            &commands[0],
            CommandCall::BeginRenderPass { target, load: LoadOp::Load, .. } if *target == harness.color.id()
        ));
        assert!(commands.iter().any(|c| matches!(c, CommandCall::Draw { vertices, .. } if *vertices == (0..6))));
    }

    #[test]
    fn test_binds_named_inputs_and_fills_remaining_slots() {
        let mut harness = harness(3, false);
        let scene = content(&harness);
        harness.targets.insert("scene", scene.clone());

        let mut pass = ShaderPass::new("post", VIGNETTE, vec!["scene".to_owned(), "missing".to_owned()]);
        pass.init(&harness.init()).unwrap();
        harness.render(&mut pass, LoadOp::Load).unwrap();

        let resources = harness
            .mock
            .calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                RenderCall::CreateBindGroup { label, resources, .. } if label.as_deref() == Some("Shader Pass Textures") => {
                    Some(resources)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(resources.len(), 6);
        assert_eq!(resources[0], scene.id());
        assert_ne!(resources[2], scene.id());
        assert_eq!(resources[2], resources[4]);
    }

    #[test]
    fn test_own_framebuffer_input_is_rejected() {
        let harness = harness(1, false);
        let mut pass = ShaderPass::new("post", VIGNETTE, vec!["main".to_owned()]);
        let result = pass.init(&harness.init());
        assert!(matches!(result, Err(RenderError::SelfSample { target, .. }) if target == "main"));
        assert_eq!(pass.state(), PassState::Uninitialized);
    }

    #[test]
    fn test_missing_fragment_shader_fails_init() {
        let harness = Harness::new(1, false);
        let mut pass = ShaderPass::new("post", "nope.wgsl", vec![]);
        assert!(matches!(pass.init(&harness.init()), Err(RenderError::ShaderNotFound(_))));
    }

    #[test]
    fn test_uniforms_upload_only_when_changed() {
        let harness = harness(1, true);
        let mut pass = ShaderPass::new("post", VIGNETTE, vec![]);
        pass.init(&harness.init()).unwrap();
        let uniform_writes = |mock: &lumen_test_utils::MockRenderContext| {
            mock.count_calls(|c| matches!(c, RenderCall::WriteBuffer { size: 16, .. }))
        };

        pass.uniforms_mut().unwrap().set_f32("strength", 0.5).unwrap();
        harness.render(&mut pass, LoadOp::Load).unwrap();
        assert_eq!(uniform_writes(&harness.mock), 1);

        harness.render(&mut pass, LoadOp::Load).unwrap();
        assert_eq!(uniform_writes(&harness.mock), 1);

        pass.uniforms_mut().unwrap().set_f32("strength", 0.75).unwrap();
        harness.render(&mut pass, LoadOp::Load).unwrap();
        assert_eq!(uniform_writes(&harness.mock), 2);
    }

    #[test]
    fn test_uniforms_survive_reinit() {
        let harness = harness(1, true);
        let mut pass = ShaderPass::new("post", VIGNETTE, vec![]);
        pass.init(&harness.init()).unwrap();
        pass.uniforms_mut().unwrap().set_f32("strength", 2.0).unwrap();

        pass.release();
        pass.release();
        assert_eq!(pass.state(), PassState::Released);
        assert!(harness.render(&mut pass, LoadOp::Load).is_err());

        pass.init(&harness.init()).unwrap();
        assert_eq!(&pass.uniforms_mut().unwrap().bytes()[..4], &2.0f32.to_le_bytes());
        harness.render(&mut pass, LoadOp::Load).unwrap();
        assert_eq!(harness.mock.count_calls(|c| matches!(c, RenderCall::WriteBuffer { size: 16, .. })), 1);
    }

    #[test]
    fn test_shader_without_uniforms_refuses_uniform_access() {
        let harness = harness(1, false);
        let mut pass = ShaderPass::new("post", VIGNETTE, vec![]);
        assert!(matches!(pass.uniforms_mut(), Err(RenderError::NotInitialized(_))));
        pass.init(&harness.init()).unwrap();
        assert!(matches!(pass.uniforms_mut(), Err(RenderError::UnsupportedPass { .. })));
        assert!(pass.queue_sprite(Default::default()).is_err());
    }

    #[test]
    fn test_multisampled_framebuffer_resolves() {
        let mut harness = Harness::new(4, false);
        harness.shaders.insert(
            VIGNETTE,
            CompiledShader::wgsl("@fragment fn fs_main() {}", "fs_main").with_reflection(reflection(1, false)),
        );
        let mut pass = ShaderPass::new("post", VIGNETTE, vec![]);
        pass.init(&harness.init()).unwrap();
        harness.render(&mut pass, LoadOp::Clear(wgpu::Color::BLACK)).unwrap();

        let commands = harness.mock.last_submission().unwrap();
        assert!(matches!(
            &commands[0],
            CommandCall::BeginRenderPass { resolve_target: Some(resolve), .. } if *resolve == harness.color.id()
        ));
    }
}
