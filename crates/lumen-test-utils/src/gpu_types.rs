//! GPU resource wrappers that can be real or mock.
//!
//! Every wrapper carries a process-unique [`ResourceId`] assigned at creation.
//! Renderer code compares resources by id (batch boundaries, bind group caches),
//! which works identically for real and mock resources.
//!
//! Wrappers are cheap to clone: real variants hold wgpu handles, which are
//! reference counted internally. A resource is freed when its last clone drops.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a GPU resource wrapper.
///
/// Ids increase monotonically, so a larger id was created later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wrapper around a GPU buffer.
#[derive(Clone, Debug)]
pub struct GpuBuffer {
    id: ResourceId,
    size: u64,
    usage: wgpu::BufferUsages,
    inner: BufferInner,
}

#[derive(Clone, Debug)]
enum BufferInner {
    Real(wgpu::Buffer),
    #[cfg(feature = "mock")]
    Mock,
}

impl GpuBuffer {
    pub fn from_wgpu(buffer: wgpu::Buffer) -> Self {
        Self {
            id: ResourceId::next(),
            size: buffer.size(),
            usage: buffer.usage(),
            inner: BufferInner::Real(buffer),
        }
    }

    #[cfg(feature = "mock")]
    pub fn mock(size: u64, usage: wgpu::BufferUsages) -> Self {
        Self {
            id: ResourceId::next(),
            size,
            usage,
            inner: BufferInner::Mock,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    /// The underlying wgpu buffer.
    ///
    /// # Panics
    /// Panics for mock buffers.
    pub fn as_wgpu(&self) -> &wgpu::Buffer {
        match &self.inner {
            BufferInner::Real(buffer) => buffer,
            #[cfg(feature = "mock")]
            BufferInner::Mock => panic!("mock buffer {} has no wgpu::Buffer", self.id),
        }
    }

    pub fn is_mock(&self) -> bool {
        !matches!(self.inner, BufferInner::Real(_))
    }
}

impl PartialEq for GpuBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GpuBuffer {}

/// Wrapper around a GPU texture and its default full view.
#[derive(Clone, Debug)]
pub struct GpuTexture {
    id: ResourceId,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    sample_count: u32,
    usage: wgpu::TextureUsages,
    inner: TextureInner,
}

#[derive(Clone, Debug)]
enum TextureInner {
    Real {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
    #[cfg(feature = "mock")]
    Mock,
}

impl GpuTexture {
    /// Wrap a texture, creating its default view.
    pub fn from_wgpu(texture: wgpu::Texture) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self::from_wgpu_with_view(texture, view)
    }

    /// Wrap a texture with an existing view. Used for swapchain images.
    pub fn from_wgpu_with_view(texture: wgpu::Texture, view: wgpu::TextureView) -> Self {
        Self {
            id: ResourceId::next(),
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
            sample_count: texture.sample_count(),
            usage: texture.usage(),
            inner: TextureInner::Real { texture, view },
        }
    }

    #[cfg(feature = "mock")]
    pub fn mock(desc: &wgpu::TextureDescriptor) -> Self {
        Self {
            id: ResourceId::next(),
            width: desc.size.width,
            height: desc.size.height,
            format: desc.format,
            sample_count: desc.sample_count,
            usage: desc.usage,
            inner: TextureInner::Mock,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)` in texels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn usage(&self) -> wgpu::TextureUsages {
        self.usage
    }

    /// # Panics
    /// Panics for mock textures.
    pub fn as_wgpu(&self) -> &wgpu::Texture {
        match &self.inner {
            TextureInner::Real { texture, .. } => texture,
            #[cfg(feature = "mock")]
            TextureInner::Mock => panic!("mock texture {} has no wgpu::Texture", self.id),
        }
    }

    /// The default full-texture view.
    ///
    /// # Panics
    /// Panics for mock textures.
    pub fn view(&self) -> &wgpu::TextureView {
        match &self.inner {
            TextureInner::Real { view, .. } => view,
            #[cfg(feature = "mock")]
            TextureInner::Mock => panic!("mock texture {} has no wgpu::TextureView", self.id),
        }
    }

    pub fn is_mock(&self) -> bool {
        !matches!(self.inner, TextureInner::Real { .. })
    }
}

impl PartialEq for GpuTexture {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GpuTexture {}

/// Declares an id-carrying wrapper around a wgpu handle with no extra metadata.
macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident, $inner:ident, $wgpu:ty) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name {
            id: ResourceId,
            label: Option<String>,
            inner: $inner,
        }

        #[derive(Clone, Debug)]
        enum $inner {
            Real($wgpu),
            #[cfg(feature = "mock")]
            Mock,
        }

        impl $name {
            pub fn from_wgpu(handle: $wgpu, label: Option<&str>) -> Self {
                Self {
                    id: ResourceId::next(),
                    label: label.map(str::to_owned),
                    inner: $inner::Real(handle),
                }
            }

            #[cfg(feature = "mock")]
            pub fn mock(label: Option<&str>) -> Self {
                Self {
                    id: ResourceId::next(),
                    label: label.map(str::to_owned),
                    inner: $inner::Mock,
                }
            }

            pub fn id(&self) -> ResourceId {
                self.id
            }

            pub fn label(&self) -> Option<&str> {
                self.label.as_deref()
            }

            /// # Panics
            /// Panics for mock handles.
            pub fn as_wgpu(&self) -> &$wgpu {
                match &self.inner {
                    $inner::Real(handle) => handle,
                    #[cfg(feature = "mock")]
                    $inner::Mock => panic!(
                        "mock {} {} has no wgpu handle",
                        stringify!($name),
                        self.id
                    ),
                }
            }

            pub fn is_mock(&self) -> bool {
                !matches!(self.inner, $inner::Real(_))
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl Eq for $name {}
    };
}

gpu_handle!(
    /// Wrapper around a GPU sampler.
    GpuSampler,
    SamplerInner,
    wgpu::Sampler
);
gpu_handle!(
    /// Wrapper around a compiled shader module.
    GpuShaderModule,
    ShaderModuleInner,
    wgpu::ShaderModule
);
gpu_handle!(
    /// Wrapper around a bind group layout.
    GpuBindGroupLayout,
    BindGroupLayoutInner,
    wgpu::BindGroupLayout
);
gpu_handle!(
    /// Wrapper around a bind group.
    GpuBindGroup,
    BindGroupInner,
    wgpu::BindGroup
);
gpu_handle!(
    /// Wrapper around a render pipeline.
    GpuRenderPipeline,
    RenderPipelineInner,
    wgpu::RenderPipeline
);
