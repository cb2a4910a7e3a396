//! Batched 2D sprite pass.
//!
//! Per frame the queue is packed into a transfer buffer, copied to the storage
//! buffer the shader reads, and split into batches. Plain batches share one open
//! render pass and cost one indexed draw each. Effect-bearing batches are drawn on
//! their own and handed to the [`EffectCompositor`].

use lumen_core::profiling::{profile_function, profile_scope};
use lumen_test_utils::{
    BindGroupDescriptor, BindGroupEntry, BindingResource, CommandRecorder, DepthState, GpuBindGroup, GpuBuffer,
    GpuRenderPipeline, GpuTexture, RenderContext, RenderPipelineDescriptor, ShaderStage,
};

use super::{
    CameraUniform, PassFrame, PassInit, PassKind, PassState, PassStats, RenderPass, TextureGroupCache,
    ensure_initialized,
};
use crate::batch::{Batch, build_batches};
use crate::effect::{EffectCompositor, Segment, plan_segments};
use crate::error::RenderError;
use crate::fullscreen::texture_slot_entries;
use crate::geometry::Vertex2D;
use crate::instance::{CompactInstance, DrawRequest};
use crate::shader::CompiledShader;

const SOURCE: &str = include_str!("../shaders/sprite.wgsl");

struct SpriteGpu {
    transfer: GpuBuffer,
    storage: GpuBuffer,
    camera: GpuBuffer,
    frame_group: GpuBindGroup,
    pipeline: GpuRenderPipeline,
    /// Draws one effect batch into scratch A without blending or depth.
    isolated: GpuRenderPipeline,
    scratch: [GpuTexture; 2],
    compositor: EffectCompositor,
    texture_groups: TextureGroupCache,
    uses_depth: bool,
}

impl SpriteGpu {
    fn new(init: &PassInit<'_>, name: &str, capacity: usize) -> Result<Self, RenderError> {
        let context = init.context;
        let module = CompiledShader::wgsl(SOURCE, "vs_main").create_module(context, "Sprite Shader")?;
        let instance_bytes = (capacity.max(1) as u64) * CompactInstance::SIZE;

        let transfer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Transfer Buffer"),
            size: instance_bytes,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let storage = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Instance Buffer"),
            size: instance_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let camera = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sprite Camera"),
            size: std::mem::size_of::<CameraUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let frame_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Frame Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let texture_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Texture Layout"),
            entries: &texture_slot_entries(1),
        });
        let frame_group = context.create_bind_group(&BindGroupDescriptor {
            label: Some("Sprite Frame Bind Group"),
            layout: &frame_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(&camera),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Buffer(&storage),
                },
            ],
        });

        let layouts = [&frame_layout, &texture_layout];
        let vertex_buffers = [Vertex2D::layout()];
        let descriptor = |label: &'static str, blend: wgpu::BlendState, depth: Option<DepthState>, sample_count: u32| {
            RenderPipelineDescriptor {
                label: Some(label),
                bind_group_layouts: &layouts,
                vertex: ShaderStage {
                    module: &module,
                    entry_point: "vs_main",
                },
                vertex_buffers: &vertex_buffers,
                fragment: ShaderStage {
                    module: &module,
                    entry_point: "fs_main",
                },
                color_format: init.color_format,
                blend: Some(blend),
                depth,
                sample_count,
                cull_mode: None,
            }
        };

        let depth = init.depth_format.map(|format| DepthState {
            format,
            write_enabled: true,
            compare: wgpu::CompareFunction::LessEqual,
        });
        let pipeline = context
            .create_render_pipeline(&descriptor(
                "Sprite Pipeline",
                wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
                depth,
                init.sample_count,
            ))
            .map_err(|e| {
                tracing::error!("Failed to create sprite pipeline for pass '{}': {}", name, e);
                RenderError::from(e)
            })?;
        let isolated = context
            .create_render_pipeline(&descriptor("Sprite Isolated Pipeline", wgpu::BlendState::REPLACE, None, 1))
            .map_err(|e| {
                tracing::error!("Failed to create isolated sprite pipeline for pass '{}': {}", name, e);
                RenderError::from(e)
            })?;

        let scratch = |label: &'static str| {
            context.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: init.max_width,
                    height: init.max_height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: init.color_format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
        };

        Ok(Self {
            transfer,
            storage,
            camera,
            frame_group,
            pipeline,
            isolated,
            scratch: [scratch("Effect Scratch A"), scratch("Effect Scratch B")],
            compositor: EffectCompositor::new(context, init.color_format),
            texture_groups: TextureGroupCache::new(texture_layout, "Sprite Texture Bind Group"),
            uses_depth: init.depth_format.is_some(),
        })
    }

    /// Bind a batch's texture and geometry and draw it. Returns false if skipped.
    fn draw_batch(&mut self, context: &dyn RenderContext, recorder: &mut dyn CommandRecorder, batch: &Batch) -> bool {
        let (Some(geometry), Some(texture), Some(sampler)) = (&batch.geometry, &batch.texture, &batch.sampler) else {
            tracing::trace!("Skipping batch at {} with missing resources", batch.offset);
            return false;
        };
        let group = self.texture_groups.get(context, texture, sampler);
        recorder.set_bind_group(1, &group, &[]);
        recorder.set_vertex_buffer(0, geometry.vertex_buffer());
        recorder.set_index_buffer(geometry.index_buffer(), wgpu::IndexFormat::Uint16);
        let range = batch.range();
        recorder.draw_indexed(0..geometry.index_count(), 0, range.start as u32..range.end as u32);
        true
    }
}

/// The batched sprite pass.
pub struct SpritePass {
    name: String,
    /// Framebuffer the pass draws into, known after init.
    framebuffer: String,
    state: PassState,
    capacity: usize,
    queue: Vec<DrawRequest>,
    batches: Vec<Batch>,
    gpu: Option<SpriteGpu>,
}

impl SpritePass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            framebuffer: String::new(),
            state: PassState::Uninitialized,
            capacity: 0,
            queue: Vec::new(),
            batches: Vec::new(),
            gpu: None,
        }
    }

    /// Maximum number of requests per frame, fixed at init.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue(&self) -> &[DrawRequest] {
        &self.queue
    }

    /// Batches built by the last render.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Pack the queue into the transfer buffer and record the copy to storage.
    fn upload_instances(&self, frame: &mut PassFrame<'_>, gpu: &SpriteGpu) -> Result<(), RenderError> {
        profile_scope!("upload_instances");
        let count = self.queue.len();
        if count == 0 {
            return Ok(());
        }
        let size = count as u64 * CompactInstance::SIZE;
        let packer = frame.packer;
        let queue = &self.queue;
        let mut result = Ok(());
        frame.context.write_buffer_with(&gpu.transfer, 0, size, &mut |bytes: &mut [u8]| {
            result = match bytemuck::try_cast_slice_mut::<u8, CompactInstance>(bytes) {
                Ok(instances) => packer.pack(queue, instances),
                Err(_) => {
                    let mut instances = vec![CompactInstance::default(); count];
                    let packed = packer.pack(queue, &mut instances);
                    bytes.copy_from_slice(bytemuck::cast_slice(&instances));
                    packed
                }
            };
        });
        result?;
        frame.recorder.copy_buffer_to_buffer(&gpu.transfer, 0, &gpu.storage, 0, size);
        Ok(())
    }
}

impl RenderPass for SpritePass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PassKind {
        PassKind::Sprite
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
        self.framebuffer = init.framebuffer.to_owned();
        self.gpu = Some(SpriteGpu::new(init, &self.name, self.capacity)?);
        self.state = PassState::Initialized;
        tracing::debug!(
            "Initialized sprite pass '{}' ({} instances, {}x{}, {}x MSAA)",
            self.name,
            self.capacity,
            init.max_width,
            init.max_height,
            init.sample_count
        );
        Ok(())
    }

    fn render(&mut self, frame: &mut PassFrame<'_>) -> Result<PassStats, RenderError> {
        profile_function!();
        ensure_initialized(&self.name, self.state)?;
        let Some(mut gpu) = self.gpu.take() else {
            return Err(RenderError::NotInitialized(self.name.clone()));
        };
        let result = self.record(frame, &mut gpu);
        self.gpu = Some(gpu);
        result
    }

    fn release(&mut self) {
        if self.gpu.take().is_some() {
            tracing::debug!("Released sprite pass '{}'", self.name);
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

    fn queue_sprite(&mut self, request: DrawRequest) -> Result<(), RenderError> {
        if self.queue.len() >= self.capacity {
            tracing::warn!(
                "Sprite pass '{}' is full ({} requests); dropping request",
                self.name,
                self.capacity
            );
            return Err(RenderError::QueueFull {
                pass: self.name.clone(),
                capacity: self.capacity,
            });
        }
        // An effect may not read the framebuffer it is composited onto.
        let own = request
            .effects
            .iter()
            .find(|effect| effect.inputs().iter().any(|input| *input == self.framebuffer));
        if let Some(effect) = own {
            tracing::error!(
                "Effect '{}' in pass '{}' samples its own framebuffer '{}'; dropping request",
                effect.label(),
                self.name,
                self.framebuffer
            );
            return Err(RenderError::SelfSample {
                pass: self.name.clone(),
                target: self.framebuffer.clone(),
            });
        }
        self.queue.push(request);
        Ok(())
    }
}

impl SpritePass {
    fn record(&mut self, frame: &mut PassFrame<'_>, gpu: &mut SpriteGpu) -> Result<PassStats, RenderError> {
        gpu.texture_groups.begin_frame();
        let view_projection = frame
            .cameras
            .camera_2d
            .view_projection(frame.viewport.width, frame.viewport.height);
        frame.context.write_buffer(
            &gpu.camera,
            0,
            bytemuck::bytes_of(&CameraUniform {
                view_projection: view_projection.to_cols_array_2d(),
            }),
        );

        self.upload_instances(frame, gpu)?;
        {
            profile_scope!("build_batches");
            build_batches(&self.queue, &mut self.batches);
        }
        let segments = plan_segments(&self.batches);

        let mut stats = PassStats {
            batches: self.batches.len(),
            instances: self.queue.len(),
            ..Default::default()
        };
        let depth = gpu.uses_depth && frame.has_depth();
        let last_segment = segments.len().saturating_sub(1);
        let mut first = true;
        let mut resolved = false;

        for (i, segment) in segments.iter().enumerate() {
            let last = i == last_segment;
            match segment {
                Segment::Plain(range) => {
                    frame.begin_target_pass(&self.name, first, last, depth);
                    frame.recorder.set_pipeline(&gpu.pipeline);
                    frame.recorder.set_bind_group(0, &gpu.frame_group, &[]);
                    for batch in &self.batches[range.clone()] {
                        if gpu.draw_batch(frame.context, frame.recorder, batch) {
                            stats.draw_calls += 1;
                        } else {
                            stats.skipped_batches += 1;
                        }
                    }
                    frame.recorder.end_render_pass();
                    stats.render_passes += 1;
                    first = false;
                    resolved |= last;
                }
                Segment::Effect(index) => {
                    let batch = &self.batches[*index];
                    if !batch.is_drawable() {
                        tracing::trace!("Skipping effect batch at {} with missing resources", batch.offset);
                        stats.skipped_batches += 1;
                        continue;
                    }
                    profile_scope!("effect_batch");
                    frame.begin_scratch_pass("Sprite Effect Source", &gpu.scratch[0]);
                    frame.recorder.set_pipeline(&gpu.isolated);
                    frame.recorder.set_bind_group(0, &gpu.frame_group, &[]);
                    gpu.draw_batch(frame.context, frame.recorder, batch);
                    frame.recorder.end_render_pass();
                    stats.render_passes += 1;
                    stats.draw_calls += 1;

                    let effects = &self.queue[batch.offset].effects;
                    let scratch = [&gpu.scratch[0], &gpu.scratch[1]];
                    match gpu.compositor.composite(frame, effects, scratch, first, last) {
                        Ok(passes) => {
                            stats.render_passes += passes;
                            stats.draw_calls += passes;
                            stats.effect_chains += 1;
                            first = false;
                            resolved |= last;
                        }
                        Err(e) => {
                            tracing::error!(
                                "Skipping effect batch at {} in pass '{}': {}",
                                batch.offset,
                                self.name,
                                e
                            );
                            stats.skipped_batches += 1;
                        }
                    }
                }
            }
        }

        // Clear and resolve still have to happen when nothing (or nothing last) drew.
        if first || (!resolved && frame.target.resolve.is_some()) {
            frame.begin_target_pass(&self.name, first, true, depth);
            frame.recorder.end_render_pass();
            stats.render_passes += 1;
        }

        gpu.texture_groups.evict_unused();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::geometry::GeometryCache;
    use crate::pass::test_support::{Harness, texture};
    use crate::shader::{ShaderReflection, StaticShaderLibrary};
    use lumen_test_utils::{CommandCall, GpuSampler, LoadOp, RenderCall, ResourceId};
    use std::sync::Arc;

    const CLEAR: LoadOp = LoadOp::Clear(wgpu::Color::BLACK);

    struct Scene {
        harness: Harness,
        pass: SpritePass,
        geometry: GeometryCache,
        texture: GpuTexture,
        sampler: GpuSampler,
    }

    fn scene(sample_count: u32, depth: bool) -> Scene {
        scene_with(Harness::new(sample_count, depth))
    }

    fn scene_with(harness: Harness) -> Scene {
        let mut pass = SpritePass::new("sprite");
        pass.init(&harness.init()).unwrap();
        let texture = texture(
            &harness.mock,
            wgpu::TextureFormat::Rgba8Unorm,
            1,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let sampler = harness.samplers.linear(&harness.mock);
        let geometry = GeometryCache::new(Arc::new(harness.mock.clone()));
        Scene {
            harness,
            pass,
            geometry,
            texture,
            sampler,
        }
    }

    impl Scene {
        fn sprite(&mut self) -> DrawRequest {
            DrawRequest::new(self.geometry.quad(), self.texture.clone(), self.sampler.clone())
        }

        fn render(&mut self) -> (PassStats, Vec<CommandCall>) {
            let stats = self.harness.render(&mut self.pass, CLEAR).unwrap();
            (stats, self.harness.mock.last_submission().unwrap())
        }
    }

    fn passes(commands: &[CommandCall]) -> Vec<(ResourceId, Option<ResourceId>, LoadOp)> {
        commands
            .iter()
            .filter_map(|c| match c {
                CommandCall::BeginRenderPass {
                    target,
                    resolve_target,
                    load,
                    ..
                } => Some((*target, *resolve_target, *load)),
                _ => None,
            })
            .collect()
    }

    fn effect_library() -> StaticShaderLibrary {
        let reflection = ShaderReflection {
            sampler_count: 1,
            uniform_buffer_count: 1,
            ..Default::default()
        };
        StaticShaderLibrary::new()
            .with("blur.wgsl", CompiledShader::wgsl("// blur", "fs_main").with_reflection(reflection.clone()))
            .with("glow.wgsl", CompiledShader::wgsl("// glow", "fs_main").with_reflection(reflection))
    }

    #[test]
    fn test_empty_queue_still_clears_and_resolves() {
        let mut scene = scene(4, false);
        let (stats, commands) = scene.render();
        let msaa = scene.harness.msaa.as_ref().unwrap().id();
        assert_eq!(passes(&commands), vec![(msaa, Some(scene.harness.color.id()), CLEAR)]);
        assert_eq!(stats.render_passes, 1);
        assert_eq!(stats.draw_calls, 0);
        assert!(!commands.iter().any(CommandCall::is_draw));
    }

    #[test]
    fn test_batches_draw_with_first_instance_offsets() {
        let mut scene = scene(1, false);
        let quad = scene.sprite();
        let circle = DrawRequest::new(scene.geometry.circle(16), scene.texture.clone(), scene.sampler.clone());
        scene.pass.queue_sprite(quad.clone()).unwrap();
        scene.pass.queue_sprite(quad).unwrap();
        scene.pass.queue_sprite(circle).unwrap();

        let (stats, commands) = scene.render();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.instances, 3);

        let draws: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                CommandCall::DrawIndexed { indices, instances, .. } => Some((indices.end, instances.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(draws, vec![(6, 0..2), (16 * 3, 2..3)]);

        // The upload copy precedes the only render pass.
        let copy = commands
            .iter()
            .position(|c| matches!(c, CommandCall::CopyBufferToBuffer { size: 96, .. }))
            .unwrap();
        let begin = commands
            .iter()
            .position(|c| matches!(c, CommandCall::BeginRenderPass { .. }))
            .unwrap();
        assert!(copy < begin);
        assert_eq!(passes(&commands).len(), 1);
    }

    #[test]
    fn test_packed_instances_reach_the_storage_buffer() {
        let mut scene = scene(1, false);
        let request = scene.sprite().at(10.0, 20.0).with_size(32.0, 16.0).with_tint([1.0, 0.5, 0.25, 1.0]);
        scene.pass.queue_sprite(request.clone()).unwrap();
        scene.render();

        let storage = scene.pass.gpu.as_ref().unwrap().storage.clone();
        let bytes = scene.harness.mock.buffer_contents(&storage).unwrap();
        let words: Vec<u32> = bytes[..32]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, CompactInstance::pack(&request).words.to_vec());
    }

    #[test]
    fn test_queue_is_capped() {
        let mut scene = scene(1, false);
        let capacity = scene.pass.capacity();
        let request = scene.sprite();
        for _ in 0..capacity {
            scene.pass.queue_sprite(request.clone()).unwrap();
        }
        let err = scene.pass.queue_sprite(request).unwrap_err();
        assert!(matches!(err, RenderError::QueueFull { capacity: c, .. } if c == capacity));
        assert_eq!(scene.pass.queued(), capacity);

        scene.pass.reset_render_queue();
        assert_eq!(scene.pass.queued(), 0);
    }

    #[test]
    fn test_incomplete_batches_are_skipped() {
        let mut scene = scene(1, false);
        let mut orphan = scene.sprite();
        orphan.sampler = None;
        let good = scene.sprite().with_tint([0.5; 4]);
        scene.pass.queue_sprite(orphan).unwrap();
        scene.pass.queue_sprite(good).unwrap();

        let (stats, commands) = scene.render();
        assert_eq!(stats.skipped_batches, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(commands.iter().filter(|c| c.is_draw()).count(), 1);
    }

    #[test]
    fn test_plain_effect_plain_renders_three_segments_in_order() {
        let mut harness = Harness::new(4, false);
        harness.shaders = effect_library();
        let mut scene = scene_with(harness);
        let blur = Arc::new(Effect::new("blur.wgsl").with_params(vec![0; 8]));
        let glow = Arc::new(Effect::new("glow.wgsl"));

        let plain = scene.sprite();
        let fancy = scene.sprite().with_effect(blur).with_effect(glow);
        scene.pass.queue_sprite(plain.clone()).unwrap();
        scene.pass.queue_sprite(fancy).unwrap();
        scene.pass.queue_sprite(plain).unwrap();

        let (stats, commands) = scene.render();
        let msaa = scene.harness.msaa.as_ref().unwrap().id();
        let content = scene.harness.color.id();
        let gpu = scene.pass.gpu.as_ref().unwrap();
        let (a, b) = (gpu.scratch[0].id(), gpu.scratch[1].id());
        let transparent = LoadOp::Clear(wgpu::Color::TRANSPARENT);

        assert_eq!(
            passes(&commands),
            vec![
                (msaa, None, CLEAR),
                (a, None, transparent),
                (b, None, transparent),
                (msaa, None, LoadOp::Load),
                (msaa, Some(content), LoadOp::Load),
            ]
        );
        assert_eq!(stats.effect_chains, 1);
        assert_eq!(stats.render_passes, 5);

        let instance_ranges: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                CommandCall::DrawIndexed { instances, .. } => Some(instances.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(instance_ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_effect_pipelines_are_cached_across_frames() {
        let mut harness = Harness::new(1, false);
        harness.shaders = effect_library();
        let mut scene = scene_with(harness);
        let blur = Arc::new(Effect::new("blur.wgsl"));

        for _ in 0..3 {
            let request = scene.sprite().with_effect(blur.clone());
            scene.pass.queue_sprite(request).unwrap();
            scene.render();
            scene.pass.reset_render_queue();
        }
        assert_eq!(scene.pass.gpu.as_ref().unwrap().compositor.pipeline_count(), 1);
        let effect_pipelines = scene
            .harness
            .mock
            .count_calls(|c| matches!(c, RenderCall::CreateRenderPipeline { label: Some(l), .. } if l.starts_with("Effect")));
        assert_eq!(effect_pipelines, 1);
    }

    #[test]
    fn test_missing_effect_shader_skips_only_that_batch() {
        let mut scene = scene(4, false);
        let missing = Arc::new(Effect::new("missing.wgsl"));
        let plain = scene.sprite();
        scene.pass.queue_sprite(plain).unwrap();
        let broken = scene.sprite().with_effect(missing);
        scene.pass.queue_sprite(broken).unwrap();

        let (stats, commands) = scene.render();
        assert_eq!(stats.skipped_batches, 1);
        assert_eq!(stats.effect_chains, 0);
        // The trailing pass still resolves the frame.
        let begins = passes(&commands);
        assert_eq!(begins.last().unwrap().1, Some(scene.harness.color.id()));
    }

    #[test]
    fn test_effect_reading_its_own_framebuffer_is_refused() {
        let mut scene = scene(1, false);
        let feedback = Arc::new(Effect::new("blur.wgsl").with_input("main"));
        let request = scene.sprite().with_effect(feedback);
        let err = scene.pass.queue_sprite(request).unwrap_err();
        assert!(matches!(
            err,
            RenderError::SelfSample { ref pass, ref target } if pass == "sprite" && target == "main"
        ));
        assert_eq!(scene.pass.queued(), 0);

        let other = Arc::new(Effect::new("blur.wgsl").with_input("minimap"));
        let request = scene.sprite().with_effect(other);
        scene.pass.queue_sprite(request).unwrap();
        assert_eq!(scene.pass.queued(), 1);
    }

    #[test]
    fn test_depth_is_cleared_once_and_tested() {
        let mut scene = scene(1, true);
        let pipeline_depth = scene
            .harness
            .mock
            .calls()
            .into_iter()
            .find_map(|c| match c {
                RenderCall::CreateRenderPipeline { label: Some(l), depth, .. } if l == "Sprite Pipeline" => Some(depth),
                _ => None,
            });
        assert_eq!(pipeline_depth, Some(true));

        let request = scene.sprite();
        scene.pass.queue_sprite(request).unwrap();
        let (_, commands) = scene.render();
        let depth = scene.harness.depth.as_ref().unwrap().id();
        assert!(commands.iter().any(|c| matches!(c, CommandCall::BeginRenderPass { depth: Some(d), .. } if *d == depth)));
    }

    #[test]
    fn test_texture_bind_groups_are_reused_then_evicted() {
        let mut scene = scene(1, false);
        let request = scene.sprite();
        let before = scene.harness.mock.count_bind_group_creates();
        for _ in 0..3 {
            scene.pass.queue_sprite(request.clone()).unwrap();
            scene.render();
            scene.pass.reset_render_queue();
        }
        assert_eq!(scene.harness.mock.count_bind_group_creates() - before, 1);

        scene.render();
        assert_eq!(scene.pass.gpu.as_ref().unwrap().texture_groups.len(), 0);
    }

    #[test]
    fn test_release_is_idempotent_and_reinit_works() {
        let mut scene = scene(1, false);
        scene.pass.release();
        scene.pass.release();
        assert_eq!(scene.pass.state(), PassState::Released);
        assert!(matches!(
            scene.harness.render(&mut scene.pass, CLEAR),
            Err(RenderError::NotInitialized(_))
        ));

        scene.pass.init(&scene.harness.init()).unwrap();
        assert_eq!(scene.pass.state(), PassState::Initialized);
        scene.render();
    }

    #[test]
    fn test_other_request_kinds_are_refused() {
        let mut pass = SpritePass::new("sprite");
        assert!(matches!(pass.uniforms_mut(), Err(RenderError::UnsupportedPass { .. })));
    }
}
