//! Compiled shaders and their reflected uniform layouts.
//!
//! Shader compilation and the on-disk shader cache live outside the renderer. The
//! renderer consumes compiled shaders through a [`ShaderLibrary`] and uses the
//! attached [`ShaderReflection`] to build bind group layouts with the exact
//! resource counts each shader declares.

use std::borrow::Cow;
use std::sync::Arc;

use ahash::HashMap;
use lumen_test_utils::{GpuShaderModule, RenderContext};

use crate::error::RenderError;

/// Byte range of one named uniform inside a shader's uniform buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformSlot {
    pub offset: u32,
    pub size: u32,
}

/// Resource counts and uniform layout reported by the shader compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub sampler_count: u32,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
    pub storage_texture_count: u32,
    pub uniforms: HashMap<String, UniformSlot>,
}

impl ShaderReflection {
    /// Bytes needed to hold every reflected uniform, rounded up to 16.
    pub fn uniform_block_size(&self) -> u32 {
        let end = self
            .uniforms
            .values()
            .map(|slot| slot.offset + slot.size)
            .max()
            .unwrap_or(0);
        end.div_ceil(16).max(1) * 16
    }
}

/// A shader as handed over by the asset pipeline.
///
/// `source` is validated WGSL; wgpu lowers it to the backend's native bytecode.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub source: String,
    pub entry_point: String,
    pub reflection: ShaderReflection,
}

impl CompiledShader {
    pub fn wgsl(source: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            reflection: ShaderReflection::default(),
        }
    }

    pub fn with_reflection(mut self, reflection: ShaderReflection) -> Self {
        self.reflection = reflection;
        self
    }

    /// Create the GPU module. `label` doubles as the module's debug name.
    pub fn create_module(&self, context: &dyn RenderContext, label: &str) -> Result<GpuShaderModule, RenderError> {
        context
            .create_shader_module(&wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&self.source)),
            })
            .map_err(|e| {
                tracing::error!("Shader '{}' failed to compile: {}", label, e);
                RenderError::Gpu(e)
            })
    }
}

/// Source of compiled shaders, looked up by file name.
pub trait ShaderLibrary: Send + Sync {
    fn get_shader(&self, name: &str) -> Option<Arc<CompiledShader>>;

    /// Like [`get_shader`](Self::get_shader) but reports a missing shader as an error.
    fn require(&self, name: &str) -> Result<Arc<CompiledShader>, RenderError> {
        self.get_shader(name).ok_or_else(|| {
            tracing::error!("Shader '{}' is not available", name);
            RenderError::ShaderNotFound(name.to_owned())
        })
    }
}

/// In-memory [`ShaderLibrary`].
#[derive(Debug, Default, Clone)]
pub struct StaticShaderLibrary {
    shaders: HashMap<String, Arc<CompiledShader>>,
}

impl StaticShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shader: CompiledShader) {
        self.shaders.insert(name.into(), Arc::new(shader));
    }

    pub fn with(mut self, name: impl Into<String>, shader: CompiledShader) -> Self {
        self.insert(name, shader);
        self
    }
}

impl ShaderLibrary for StaticShaderLibrary {
    fn get_shader(&self, name: &str) -> Option<Arc<CompiledShader>> {
        self.shaders.get(name).cloned()
    }
}

/// CPU image of a uniform buffer laid out by reflection.
#[derive(Debug, Clone)]
pub struct UniformBlock {
    owner: String,
    data: Vec<u8>,
    layout: HashMap<String, UniformSlot>,
    dirty: bool,
}

impl UniformBlock {
    /// `owner` names the pass the block belongs to, for error reporting.
    pub fn new(owner: impl Into<String>, reflection: &ShaderReflection) -> Self {
        Self {
            owner: owner.into(),
            data: vec![0; reflection.uniform_block_size() as usize],
            layout: reflection.uniforms.clone(),
            dirty: true,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn has(&self, name: &str) -> bool {
        self.layout.contains_key(name)
    }

    /// Write raw bytes into the uniform `name`. The length must match exactly.
    pub fn set_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), RenderError> {
        let slot = *self.layout.get(name).ok_or_else(|| RenderError::UniformNotFound {
            pass: self.owner.clone(),
            name: name.to_owned(),
        })?;
        if slot.size as usize != bytes.len() {
            return Err(RenderError::UniformSize {
                name: name.to_owned(),
                expected: slot.size,
                actual: bytes.len(),
            });
        }
        let start = slot.offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    pub fn set_f32(&mut self, name: &str, value: f32) -> Result<(), RenderError> {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_vec2(&mut self, name: &str, value: glam::Vec2) -> Result<(), RenderError> {
        self.set_bytes(name, bytemuck::bytes_of(&value.to_array()))
    }

    pub fn set_vec4(&mut self, name: &str, value: glam::Vec4) -> Result<(), RenderError> {
        self.set_bytes(name, bytemuck::bytes_of(&value.to_array()))
    }

    pub fn set_mat4(&mut self, name: &str, value: glam::Mat4) -> Result<(), RenderError> {
        self.set_bytes(name, bytemuck::bytes_of(&value.to_cols_array()))
    }

    /// Returns whether the block changed since the last call, clearing the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reflection() -> ShaderReflection {
        let mut uniforms = HashMap::default();
        uniforms.insert("strength".to_owned(), UniformSlot { offset: 0, size: 4 });
        uniforms.insert("color".to_owned(), UniformSlot { offset: 16, size: 16 });
        ShaderReflection {
            sampler_count: 1,
            uniform_buffer_count: 1,
            uniforms,
            ..Default::default()
        }
    }

    #[test]
    fn test_block_size_covers_all_uniforms() {
        assert_eq!(reflection().uniform_block_size(), 32);
        assert_eq!(ShaderReflection::default().uniform_block_size(), 16);
    }

    #[test]
    fn test_set_by_name_writes_at_offset() {
        let mut block = UniformBlock::new("post", &reflection());
        assert!(block.take_dirty());
        block.set_f32("strength", 2.0).unwrap();
        block.set_vec4("color", glam::Vec4::new(1.0, 0.5, 0.25, 1.0)).unwrap();
        assert!(block.take_dirty());
        assert!(!block.take_dirty());

        let floats: Vec<f32> = block
            .bytes()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats[0], 2.0);
        assert_eq!(&floats[4..8], &[1.0, 0.5, 0.25, 1.0]);
    }

    #[test]
    fn test_wrong_name_or_size_is_rejected() {
        let mut block = UniformBlock::new("post", &reflection());
        assert!(matches!(
            block.set_f32("missing", 1.0),
            Err(RenderError::UniformNotFound { .. })
        ));
        assert!(matches!(
            block.set_f32("color", 1.0),
            Err(RenderError::UniformSize { expected: 16, actual: 4, .. })
        ));
    }

    #[test]
    fn test_library_lookup() {
        let library = StaticShaderLibrary::new().with("glow.wgsl", CompiledShader::wgsl("", "fs_main"));
        assert!(library.get_shader("glow.wgsl").is_some());
        assert!(matches!(library.require("nope.wgsl"), Err(RenderError::ShaderNotFound(_))));
    }
}
