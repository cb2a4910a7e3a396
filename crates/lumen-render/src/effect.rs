//! Per-sprite post-processing.
//!
//! A batch whose requests carry effects is drawn on its own into scratch texture A.
//! Each effect in the chain is then a full-screen pass that samples the previous
//! result and writes the other scratch texture. The last effect writes the real
//! destination with premultiplied-alpha blending. Plain batches around it are drawn
//! in ordinary passes before and after, so paint order is kept.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::HashMap;
use lumen_core::profiling::profile_function;
use lumen_test_utils::{
    BindGroupDescriptor, BindGroupEntry, BindingResource, GpuBindGroup, GpuBindGroupLayout, GpuBuffer,
    GpuRenderPipeline, GpuShaderModule, GpuTexture, RenderContext, RenderPipelineDescriptor, ShaderStage,
};

use crate::batch::Batch;
use crate::error::RenderError;
use crate::fullscreen::{
    FULLSCREEN_VERTEX, FullscreenQuad, FullscreenVertex, texture_slot_bindings, texture_slot_entries, uniform_entry,
};
use crate::pass::PassFrame;
use crate::shader::{CompiledShader, ShaderLibrary};

/// Size of the zero uniform bound for effects without parameters.
pub const ZERO_UNIFORM_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(u64);

impl EffectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A full-screen shader applied to a sprite after it is drawn.
///
/// Effects are immutable once built and shared between requests through `Arc`.
/// Requests share a batch only when their chains hold the same effects in the same
/// order.
///
/// ```
/// use lumen_render::Effect;
///
/// let glow = Effect::new("glow.wgsl")
///     .with_params(bytemuck::cast_slice(&[1.0f32, 0.5, 0.0, 4.0]).to_vec())
///     .with_input("lights");
/// assert_eq!(glow.inputs(), ["lights".to_owned()]);
/// ```
#[derive(Debug, Clone)]
pub struct Effect {
    id: EffectId,
    vertex_shader: String,
    fragment_shader: String,
    params: Vec<u8>,
    inputs: Vec<String>,
    label: Option<String>,
}

impl Effect {
    pub fn new(fragment_shader: impl Into<String>) -> Self {
        Self {
            id: EffectId::next(),
            vertex_shader: FULLSCREEN_VERTEX.to_owned(),
            fragment_shader: fragment_shader.into(),
            params: Vec::new(),
            inputs: Vec::new(),
            label: None,
        }
    }

    pub fn with_vertex_shader(mut self, vertex_shader: impl Into<String>) -> Self {
        self.vertex_shader = vertex_shader.into();
        self
    }

    /// Raw bytes for the fragment shader's uniform buffer.
    pub fn with_params(mut self, params: Vec<u8>) -> Self {
        self.params = params;
        self
    }

    /// Sample the content texture of the framebuffer `name` in the next free slot.
    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn vertex_shader(&self) -> &str {
        &self.vertex_shader
    }

    pub fn fragment_shader(&self) -> &str {
        &self.fragment_shader
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.fragment_shader)
    }
}

/// One step of the sprite pass's render sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Consecutive plain batches drawn in one open pass.
    Plain(Range<usize>),
    /// A single effect-bearing batch composited on its own.
    Effect(usize),
}

/// Split `batches` into plain runs and effect batches, in order.
pub fn plan_segments(batches: &[Batch]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut plain_start = None;
    for (i, batch) in batches.iter().enumerate() {
        if batch.has_effects {
            if let Some(start) = plain_start.take() {
                segments.push(Segment::Plain(start..i));
            }
            segments.push(Segment::Effect(i));
        } else if plain_start.is_none() {
            plain_start = Some(i);
        }
    }
    if let Some(start) = plain_start {
        segments.push(Segment::Plain(start..batches.len()));
    }
    segments
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scratch {
    A,
    B,
}

impl Scratch {
    pub fn other(self) -> Self {
        match self {
            Scratch::A => Scratch::B,
            Scratch::B => Scratch::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Scratch::A => 0,
            Scratch::B => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepTarget {
    Scratch(Scratch),
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeBlend {
    /// `src * 1 + dst * 0`.
    Opaque,
    /// `src * 1 + dst * (1 - src.a)`.
    PremultipliedAlpha,
}

impl CompositeBlend {
    pub fn state(self) -> wgpu::BlendState {
        match self {
            CompositeBlend::Opaque => wgpu::BlendState::REPLACE,
            CompositeBlend::PremultipliedAlpha => wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING,
        }
    }

    /// Blend one RGBA value the way the GPU would.
    pub fn apply(self, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
        match self {
            CompositeBlend::Opaque => src,
            CompositeBlend::PremultipliedAlpha => {
                let keep = 1.0 - src[3];
                std::array::from_fn(|i| src[i] + dst[i] * keep)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectStep {
    pub read: Scratch,
    pub write: StepTarget,
    pub blend: CompositeBlend,
}

/// Read/write plan for a chain of `len` effects. The isolated sprite starts in A.
pub fn plan_chain(len: usize) -> Vec<EffectStep> {
    let mut read = Scratch::A;
    (0..len)
        .map(|i| {
            if i + 1 == len {
                EffectStep {
                    read,
                    write: StepTarget::Destination,
                    blend: CompositeBlend::PremultipliedAlpha,
                }
            } else {
                let step = EffectStep {
                    read,
                    write: StepTarget::Scratch(read.other()),
                    blend: CompositeBlend::Opaque,
                };
                read = read.other();
                step
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    vertex: String,
    fragment: String,
    blend: CompositeBlend,
    format: wgpu::TextureFormat,
    sample_count: u32,
}

#[derive(Clone)]
struct EffectPipeline {
    pipeline: GpuRenderPipeline,
    texture_layout: GpuBindGroupLayout,
    slots: u32,
    uses_uniform: bool,
}

struct ParamBinding {
    _buffer: GpuBuffer,
    bind_group: GpuBindGroup,
}

/// A chain step with every GPU object it needs.
struct PreparedStep {
    step: EffectStep,
    pipeline: EffectPipeline,
    effect: Arc<Effect>,
}

/// Runs effect chains. Pipelines and parameter buffers are built on first use and
/// kept until [`release`](Self::release).
pub struct EffectCompositor {
    color_format: wgpu::TextureFormat,
    modules: HashMap<String, (GpuShaderModule, String)>,
    texture_layouts: HashMap<u32, GpuBindGroupLayout>,
    uniform_layout: GpuBindGroupLayout,
    pipelines: HashMap<PipelineKey, EffectPipeline>,
    params: HashMap<EffectId, ParamBinding>,
    zero_uniform: ParamBinding,
}

impl EffectCompositor {
    pub fn new(context: &dyn RenderContext, color_format: wgpu::TextureFormat) -> Self {
        let uniform_layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Effect Uniform Layout"),
            entries: &[uniform_entry()],
        });
        let zero_uniform = Self::uniform_binding(context, &uniform_layout, &[0; ZERO_UNIFORM_SIZE as usize], "Effect Zero Uniform");

        Self {
            color_format,
            modules: HashMap::default(),
            texture_layouts: HashMap::default(),
            uniform_layout,
            pipelines: HashMap::default(),
            params: HashMap::default(),
            zero_uniform,
        }
    }

    fn uniform_binding(context: &dyn RenderContext, layout: &GpuBindGroupLayout, data: &[u8], label: &str) -> ParamBinding {
        let mut bytes = data.to_vec();
        bytes.resize(bytes.len().next_multiple_of(16).max(ZERO_UNIFORM_SIZE as usize), 0);
        let buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes.len() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.write_buffer(&buffer, 0, &bytes);
        let bind_group = context.create_bind_group(&BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(&buffer),
            }],
        });
        ParamBinding {
            _buffer: buffer,
            bind_group,
        }
    }

    fn module(
        &mut self,
        context: &dyn RenderContext,
        shaders: &dyn ShaderLibrary,
        quad: &FullscreenQuad,
        name: &str,
    ) -> Result<(GpuShaderModule, String, Option<Arc<CompiledShader>>), RenderError> {
        if name == FULLSCREEN_VERTEX {
            return Ok((quad.module().clone(), "vs_main".to_owned(), None));
        }
        let shader = shaders.require(name)?;
        if let Some((module, entry)) = self.modules.get(name) {
            return Ok((module.clone(), entry.clone(), Some(shader)));
        }
        let module = shader.create_module(context, name)?;
        self.modules
            .insert(name.to_owned(), (module.clone(), shader.entry_point.clone()));
        Ok((module, shader.entry_point.clone(), Some(shader)))
    }

    fn pipeline(
        &mut self,
        context: &dyn RenderContext,
        shaders: &dyn ShaderLibrary,
        quad: &FullscreenQuad,
        effect: &Effect,
        blend: CompositeBlend,
        sample_count: u32,
    ) -> Result<EffectPipeline, RenderError> {
        let key = PipelineKey {
            vertex: effect.vertex_shader().to_owned(),
            fragment: effect.fragment_shader().to_owned(),
            blend,
            format: self.color_format,
            sample_count,
        };
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        let (vertex_module, vertex_entry, _) = self.module(context, shaders, quad, effect.vertex_shader())?;
        let (fragment_module, fragment_entry, fragment) =
            self.module(context, shaders, quad, effect.fragment_shader())?;
        let reflection = fragment.map(|shader| shader.reflection.clone()).unwrap_or_default();

        let slots = reflection.sampler_count.max(1);
        let texture_layout = self
            .texture_layouts
            .entry(slots)
            .or_insert_with(|| {
                context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("Effect Texture Layout"),
                    entries: &texture_slot_entries(slots),
                })
            })
            .clone();
        let uses_uniform = reflection.uniform_buffer_count > 0;
        let mut layouts = vec![&texture_layout];
        if uses_uniform {
            layouts.push(&self.uniform_layout);
        }

        let label = format!("Effect {}", effect.label());
        let pipeline = context
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some(&label),
                bind_group_layouts: &layouts,
                vertex: ShaderStage {
                    module: &vertex_module,
                    entry_point: &vertex_entry,
                },
                vertex_buffers: &[FullscreenVertex::layout()],
                fragment: ShaderStage {
                    module: &fragment_module,
                    entry_point: &fragment_entry,
                },
                color_format: self.color_format,
                blend: Some(blend.state()),
                depth: None,
                sample_count,
                cull_mode: None,
            })
            .map_err(|e| {
                tracing::error!("Failed to create pipeline for effect '{}': {}", effect.label(), e);
                RenderError::from(e)
            })?;

        tracing::debug!(
            "Created effect pipeline '{}' ({} texture slots, uniform: {})",
            label,
            slots,
            uses_uniform
        );
        let pipeline = EffectPipeline {
            pipeline,
            texture_layout,
            slots,
            uses_uniform,
        };
        self.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Resolve every pipeline of the chain before anything is recorded, so a missing
    /// shader never leaves a half-composited sprite behind.
    fn prepare(
        &mut self,
        frame: &PassFrame<'_>,
        effects: &[Arc<Effect>],
        destination_samples: u32,
    ) -> Result<Vec<PreparedStep>, RenderError> {
        plan_chain(effects.len())
            .into_iter()
            .zip(effects)
            .map(|(step, effect)| {
                let sample_count = match step.write {
                    StepTarget::Destination => destination_samples,
                    StepTarget::Scratch(_) => 1,
                };
                let pipeline = self.pipeline(frame.context, frame.shaders, frame.quad, effect, step.blend, sample_count)?;
                Ok(PreparedStep {
                    step,
                    pipeline,
                    effect: effect.clone(),
                })
            })
            .collect()
    }

    fn param_group(&mut self, context: &dyn RenderContext, effect: &Effect) -> GpuBindGroup {
        if effect.params().is_empty() {
            return self.zero_uniform.bind_group.clone();
        }
        let layout = &self.uniform_layout;
        self.params
            .entry(effect.id())
            .or_insert_with(|| Self::uniform_binding(context, layout, effect.params(), effect.label()))
            .bind_group
            .clone()
    }

    /// Run `effects` over the sprite already drawn into `scratch[0]` and composite
    /// the result onto the frame target.
    ///
    /// `first` and `last` say whether the final composite is the first or last pass
    /// this render call opens on the target. Returns the number of render passes
    /// recorded. On error nothing has been recorded.
    pub fn composite(
        &mut self,
        frame: &mut PassFrame<'_>,
        effects: &[Arc<Effect>],
        scratch: [&GpuTexture; 2],
        first: bool,
        last: bool,
    ) -> Result<usize, RenderError> {
        profile_function!();
        let steps = self.prepare(frame, effects, frame.target.color.sample_count())?;
        let sampler = frame.samplers.linear(frame.context);

        for prepared in &steps {
            let read = scratch[prepared.step.read.index()];
            let mut textures = vec![read];
            for name in prepared.effect.inputs() {
                match frame.targets.get(name) {
                    Some(texture) => textures.push(texture),
                    None => {
                        tracing::warn!(
                            "Effect '{}' samples unknown render target '{}'",
                            prepared.effect.label(),
                            name
                        );
                        textures.push(read);
                    }
                }
            }
            textures.resize(prepared.pipeline.slots as usize, read);

            let entries = texture_slot_bindings(&textures, &sampler);
            let textures_group = frame.context.create_bind_group(&BindGroupDescriptor {
                label: Some("Effect Textures"),
                layout: &prepared.pipeline.texture_layout,
                entries: &entries,
            });
            let uniform_group = prepared
                .pipeline
                .uses_uniform
                .then(|| self.param_group(frame.context, &prepared.effect));

            match prepared.step.write {
                StepTarget::Scratch(target) => frame.begin_scratch_pass("Effect Step", scratch[target.index()]),
                StepTarget::Destination => frame.begin_target_pass("Effect Composite", first, last, false),
            }
            frame.recorder.set_pipeline(&prepared.pipeline.pipeline);
            frame.recorder.set_bind_group(0, &textures_group, &[]);
            if let Some(group) = &uniform_group {
                frame.recorder.set_bind_group(1, group, &[]);
            }
            frame.quad.draw(frame.recorder);
            frame.recorder.end_render_pass();
        }
        Ok(steps.len())
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Drop cached pipelines, modules and parameter buffers.
    pub fn release(&mut self) {
        self.pipelines.clear();
        self.modules.clear();
        self.texture_layouts.clear();
        self.params.clear();
    }
}
