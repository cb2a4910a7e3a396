use lumen_test_utils::GpuError;

/// Failure to bring up the GPU device.
#[derive(Debug, Clone)]
pub enum GraphicsError {
    /// No adapter matched the requested options.
    NoAdapter,
    /// The adapter refused to create a device.
    DeviceRequest(String),
    /// Surface creation or configuration failed.
    Surface(String),
}

impl std::fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphicsError::NoAdapter => write!(f, "No suitable GPU adapter found"),
            GraphicsError::DeviceRequest(msg) => write!(f, "Failed to create GPU device: {}", msg),
            GraphicsError::Surface(msg) => write!(f, "Surface error: {}", msg),
        }
    }
}

impl std::error::Error for GraphicsError {}

/// Errors raised by the renderer.
#[derive(Debug, Clone)]
pub enum RenderError {
    /// A GPU object could not be created. Fatal during initialization.
    Gpu(GpuError),
    /// The shader library has no shader with this name.
    ShaderNotFound(String),
    UnknownPass(String),
    /// A framebuffer already has a pass with this name.
    PassExists(String),
    UnknownTarget(String),
    TargetExists(String),
    /// The primary target is owned by the renderer and cannot be removed.
    ProtectedTarget(String),
    /// Texture data does not match the requested dimensions.
    InvalidTextureData { expected: usize, actual: usize },
    /// A pass queue is at its fixed capacity and refused another request.
    QueueFull { pass: String, capacity: usize },
    /// A destination buffer is too small for the requests being packed.
    CapacityExceeded { requested: usize, capacity: usize },
    InvalidSampleCount(u32),
    /// The pass does not support the requested operation.
    UnsupportedPass { pass: String, operation: &'static str },
    /// The pass is not initialized.
    NotInitialized(String),
    UniformNotFound { pass: String, name: String },
    /// A full-screen pass or sprite effect listed its own framebuffer as an input.
    SelfSample { pass: String, target: String },
    UniformSize { name: String, expected: u32, actual: usize },
    /// The instance packing worker pool could not be created.
    WorkerPool(String),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Gpu(e) => write!(f, "{}", e),
            RenderError::ShaderNotFound(name) => write!(f, "Shader '{}' not found", name),
            RenderError::UnknownPass(name) => write!(f, "No render pass named '{}'", name),
            RenderError::PassExists(name) => write!(f, "Render pass '{}' already exists", name),
            RenderError::UnknownTarget(name) => write!(f, "No render target named '{}'", name),
            RenderError::TargetExists(name) => write!(f, "Render target '{}' already exists", name),
            RenderError::ProtectedTarget(name) => write!(f, "Render target '{}' cannot be removed", name),
            RenderError::InvalidTextureData { expected, actual } => {
                write!(f, "Expected {} bytes of texture data, got {}", expected, actual)
            }
            RenderError::QueueFull { pass, capacity } => {
                write!(f, "Render queue of pass '{}' is full ({} requests)", pass, capacity)
            }
            RenderError::CapacityExceeded { requested, capacity } => write!(
                f,
                "{} instances requested but only {} fit in the instance buffer",
                requested, capacity
            ),
            RenderError::InvalidSampleCount(n) => {
                write!(f, "Unsupported sample count {} (expected 1, 2, 4 or 8)", n)
            }
            RenderError::UnsupportedPass { pass, operation } => {
                write!(f, "Pass '{}' does not support {}", pass, operation)
            }
            RenderError::NotInitialized(pass) => write!(f, "Pass '{}' is not initialized", pass),
            RenderError::UniformNotFound { pass, name } => {
                write!(f, "Pass '{}' has no uniform named '{}'", pass, name)
            }
            RenderError::SelfSample { pass, target } => write!(
                f,
                "Pass '{}' cannot sample render target '{}' while rendering into it",
                pass, target
            ),
            RenderError::UniformSize {
                name,
                expected,
                actual,
            } => write!(
                f,
                "Uniform '{}' is {} bytes but {} bytes were given",
                name, expected, actual
            ),
            RenderError::WorkerPool(msg) => write!(f, "Failed to build worker pool: {}", msg),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Gpu(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for RenderError {
    fn from(e: GpuError) -> Self {
        RenderError::Gpu(e)
    }
}

/// Failure while capturing or writing a screenshot.
#[derive(Debug)]
pub enum ScreenshotError {
    Gpu(GpuError),
    /// The captured pixels could not be turned into an image.
    Encode(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ScreenshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScreenshotError::Gpu(e) => write!(f, "Screenshot readback failed: {}", e),
            ScreenshotError::Encode(msg) => write!(f, "Screenshot encoding failed: {}", msg),
            ScreenshotError::Io(e) => write!(f, "Screenshot write failed: {}", e),
        }
    }
}

impl std::error::Error for ScreenshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScreenshotError::Gpu(e) => Some(e),
            ScreenshotError::Io(e) => Some(e),
            ScreenshotError::Encode(_) => None,
        }
    }
}

impl From<GpuError> for ScreenshotError {
    fn from(e: GpuError) -> Self {
        ScreenshotError::Gpu(e)
    }
}

impl From<std::io::Error> for ScreenshotError {
    fn from(e: std::io::Error) -> Self {
        ScreenshotError::Io(e)
    }
}
