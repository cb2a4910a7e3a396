//! Compositing framebuffer content onto the swapchain image.

use lumen_core::profiling::profile_function;
use lumen_test_utils::{
    BindGroupDescriptor, ColorAttachment, CommandRecorder, GpuBindGroupLayout, GpuRenderPipeline, GpuSampler,
    GpuShaderModule, GpuTexture, LoadOp, RenderContext, RenderPassDescriptor, RenderPipelineDescriptor, ShaderStage,
};

use crate::error::RenderError;
use crate::fullscreen::{FullscreenQuad, FullscreenVertex, texture_slot_bindings, texture_slot_entries};

/// Draws single-sample framebuffer content onto a presentable texture.
///
/// The first blit of a frame clears the target to opaque black; every blit blends
/// its premultiplied content over what is already there, so several framebuffers
/// flagged for the screen stack in order.
pub struct BlitPipeline {
    pipeline: GpuRenderPipeline,
    layout: GpuBindGroupLayout,
    format: wgpu::TextureFormat,
}

impl BlitPipeline {
    pub fn new(
        context: &dyn RenderContext,
        module: &GpuShaderModule,
        format: wgpu::TextureFormat,
    ) -> Result<Self, RenderError> {
        profile_function!();
        let layout = context.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Blit Layout"),
            entries: &texture_slot_entries(1),
        });
        let pipeline = context
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("Blit Pipeline"),
                bind_group_layouts: &[&layout],
                vertex: ShaderStage {
                    module,
                    entry_point: "vs_main",
                },
                vertex_buffers: &[FullscreenVertex::layout()],
                fragment: ShaderStage {
                    module,
                    entry_point: "fs_blit",
                },
                color_format: format,
                blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                depth: None,
                sample_count: 1,
                cull_mode: None,
            })
            .map_err(|e| {
                tracing::error!("Failed to create blit pipeline for {:?}: {}", format, e);
                RenderError::Gpu(e)
            })?;

        Ok(Self {
            pipeline,
            layout,
            format,
        })
    }

    /// Format of the targets this pipeline can draw into.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    #[allow(clippy::too_many_arguments)]
    pub fn blit(
        &self,
        context: &dyn RenderContext,
        recorder: &mut dyn CommandRecorder,
        quad: &FullscreenQuad,
        source: &GpuTexture,
        sampler: &GpuSampler,
        target: &GpuTexture,
        first: bool,
    ) {
        let group = context.create_bind_group(&BindGroupDescriptor {
            label: Some("Blit Bind Group"),
            layout: &self.layout,
            entries: &texture_slot_bindings(&[source], sampler),
        });

        recorder.begin_render_pass(&RenderPassDescriptor {
            label: Some("Blit"),
            color: ColorAttachment {
                target,
                resolve_target: None,
                load: if first {
                    LoadOp::Clear(wgpu::Color::BLACK)
                } else {
                    LoadOp::Load
                },
            },
            depth: None,
        });
        recorder.set_viewport(0.0, 0.0, target.width() as f32, target.height() as f32);
        recorder.set_pipeline(&self.pipeline);
        recorder.set_bind_group(0, &group, &[]);
        quad.draw(recorder);
        recorder.end_render_pass();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fullscreen::create_fullscreen_module;
    use lumen_test_utils::{CommandCall, MockRenderContext};

    fn texture(mock: &MockRenderContext, format: wgpu::TextureFormat) -> GpuTexture {
        mock.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: 16,
                height: 8,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
    }

    #[test]
    fn test_first_blit_clears_and_later_blits_load() {
        let mock = MockRenderContext::new();
        let module = create_fullscreen_module(&mock).unwrap();
        let blit = BlitPipeline::new(&mock, &module, wgpu::TextureFormat::Bgra8Unorm).unwrap();
        let quad = FullscreenQuad::new(&mock, 16, 8).unwrap();
        let sampler = mock.create_sampler(&wgpu::SamplerDescriptor::default());
        let screen = texture(&mock, wgpu::TextureFormat::Bgra8Unorm);
        let a = texture(&mock, wgpu::TextureFormat::Bgra8Unorm);
        let b = texture(&mock, wgpu::TextureFormat::Bgra8Unorm);

        let mut recorder = mock.create_recorder("blit");
        blit.blit(&mock, recorder.as_mut(), &quad, &a, &sampler, &screen, true);
        blit.blit(&mock, recorder.as_mut(), &quad, &b, &sampler, &screen, false);
        recorder.submit();

        let loads: Vec<LoadOp> = mock
            .last_submission()
            .unwrap()
            .into_iter()
            .filter_map(|c| match c {
                CommandCall::BeginRenderPass { load, target, .. } if target == screen.id() => Some(load),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec![LoadOp::Clear(wgpu::Color::BLACK), LoadOp::Load]);
    }
}
