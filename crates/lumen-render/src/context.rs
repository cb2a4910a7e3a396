use std::sync::Arc;

use crate::error::GraphicsError;

/// Options for [`GraphicsContext::new`].
#[derive(Debug, Clone)]
pub struct GraphicsContextDescriptor {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    /// Pick the software adapter. Useful on CI machines without a GPU.
    pub force_fallback_adapter: bool,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    pub label: Option<&'static str>,
}

impl Default for GraphicsContextDescriptor {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            features: wgpu::Features::empty(),
            limits: wgpu::Limits::default(),
            label: Some("Lumen Device"),
        }
    }
}

/// The device and queue every renderer component shares.
///
/// ```rust,no_run
/// use lumen_render::GraphicsContext;
///
/// let ctx = GraphicsContext::new_sync(Default::default()).expect("no GPU");
/// let ctx2 = ctx.clone(); // Arc clone
/// ```
pub struct GraphicsContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GraphicsContext {
    pub async fn new(descriptor: GraphicsContextDescriptor) -> Result<Arc<Self>, GraphicsError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: descriptor.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: descriptor.power_preference,
                compatible_surface: None,
                force_fallback_adapter: descriptor.force_fallback_adapter,
            })
            .await
            .map_err(|e| {
                tracing::warn!("No GPU adapter available: {}", e);
                GraphicsError::NoAdapter
            })?;

        let info = adapter.get_info();
        tracing::info!(
            "Using adapter '{}' ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        let missing = descriptor.features - adapter.features();
        if !missing.is_empty() {
            return Err(GraphicsError::DeviceRequest(format!(
                "adapter lacks required features {:?}",
                missing
            )));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                required_features: descriptor.features,
                required_limits: descriptor.limits.clone(),
                label: descriptor.label,
                ..Default::default()
            })
            .await
            .map_err(|e| GraphicsError::DeviceRequest(e.to_string()))?;

        Ok(Arc::new(Self {
            instance,
            adapter,
            device,
            queue,
        }))
    }

    /// Blocks the current thread until the device is ready.
    pub fn new_sync(descriptor: GraphicsContextDescriptor) -> Result<Arc<Self>, GraphicsError> {
        pollster::block_on(Self::new(descriptor))
    }

    /// Get device info
    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Get device limits
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Whether `format` can be rendered to and sampled with `sample_count` samples.
    pub fn supports_sample_count(&self, format: wgpu::TextureFormat, sample_count: u32) -> bool {
        self.adapter
            .get_texture_format_features(format)
            .flags
            .sample_count_supported(sample_count)
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("adapter", &self.adapter.get_info().name)
            .finish_non_exhaustive()
    }
}
