//! Tests against a real wgpu device.

use std::sync::Arc;

use lumen_render::{
    DrawRequest, GpuError, GraphicsContext, GraphicsContextDescriptor, GraphicsError, OffscreenSwapchain,
    RenderContext, Renderer, RendererConfig, ScaleMode, StaticShaderLibrary,
};

fn context() -> Option<Arc<GraphicsContext>> {
    match GraphicsContext::new_sync(GraphicsContextDescriptor::default()) {
        Ok(ctx) => Some(ctx),
        Err(GraphicsError::NoAdapter) => {
            println!("GPU not available");
            None
        }
        Err(e) => panic!("device creation failed: {}", e),
    }
}

#[test]
#[ignore] // Requires GPU - run with: cargo test --test context_tests -- --ignored
fn test_invalid_wgsl_is_an_error() {
    let Some(ctx) = context() else { return };
    let result = ctx.create_shader_module(&wgpu::ShaderModuleDescriptor {
        label: Some("broken"),
        source: wgpu::ShaderSource::Wgsl("fn main( {".into()),
    });
    assert!(matches!(result, Err(GpuError::Validation(_))));
}

#[test]
#[ignore] // Requires GPU
fn test_buffer_round_trip() {
    let Some(ctx) = context() else { return };
    let src = ctx.create_buffer(&wgpu::BufferDescriptor {
        label: Some("src"),
        size: 16,
        usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let dst = ctx.create_buffer(&wgpu::BufferDescriptor {
        label: Some("dst"),
        size: 16,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    ctx.write_buffer_with(&src, 0, 16, &mut |bytes| {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
    });
    let mut recorder = ctx.create_recorder("copy");
    recorder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16);
    recorder.submit();

    assert_eq!(ctx.read_buffer(&dst).unwrap(), (0..16).collect::<Vec<u8>>());
}

#[test]
#[ignore] // Requires GPU
fn test_renderer_draws_a_sprite() {
    let Some(ctx) = context() else { return };
    let format = wgpu::TextureFormat::Rgba8Unorm;
    let mut swapchain = OffscreenSwapchain::new(ctx.as_ref(), format, 64, 64);
    let mut renderer = Renderer::new(
        ctx.clone(),
        Arc::new(StaticShaderLibrary::new()),
        format,
        RendererConfig::default().with_max_resolution(64, 64).with_max_instances(64),
    )
    .unwrap();

    let white = renderer.upload_texture_rgba8("white", 1, 1, &[255; 4]).unwrap();
    let sampler = renderer.sampler(ScaleMode::Nearest);
    let quad = renderer.geometry().quad();

    renderer.start_frame();
    renderer
        .add_to_render_queue(
            "sprite",
            DrawRequest::new(quad, white, sampler)
                .at(32.0, 32.0)
                .with_size(16.0, 16.0),
        )
        .unwrap();
    let stats = renderer.end_frame(&mut swapchain).unwrap();

    assert!(stats.presented);
    assert_eq!(stats.draw_calls, 2); // sprite + blit
    renderer.shutdown();
}
