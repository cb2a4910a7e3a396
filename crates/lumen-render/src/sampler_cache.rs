//! Sampler reuse keyed by filtering and addressing.
//!
//! Callers ask for a [`ScaleMode`] and get back the same [`GpuSampler`] every
//! time, so sprites that share a mode also share a batch.

use std::hash::{Hash, Hasher};

use ahash::HashMap;
use lumen_core::profiling::profile_function;
use lumen_test_utils::{GpuSampler, RenderContext};
use parking_lot::RwLock;

/// A hashable image of the sampler fields the renderer varies.
///
/// `wgpu::SamplerDescriptor` is not `Hash`, and its LOD clamps are floats, so they are
/// stored as bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerKey {
    pub address_mode: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::FilterMode,
    pub lod_min_clamp: u32,
    pub lod_max_clamp: u32,
}

impl Hash for SamplerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address_mode.hash(state);
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_filter.hash(state);
        self.lod_min_clamp.hash(state);
        self.lod_max_clamp.hash(state);
    }
}

impl SamplerKey {
    fn new(address_mode: wgpu::AddressMode, filter: wgpu::FilterMode) -> Self {
        Self {
            address_mode,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: filter,
            lod_min_clamp: 0.0f32.to_bits(),
            lod_max_clamp: f32::MAX.to_bits(),
        }
    }

    pub fn to_descriptor<'a>(&self, label: Option<&'a str>) -> wgpu::SamplerDescriptor<'a> {
        wgpu::SamplerDescriptor {
            label,
            address_mode_u: self.address_mode,
            address_mode_v: self.address_mode,
            address_mode_w: self.address_mode,
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter,
            lod_min_clamp: f32::from_bits(self.lod_min_clamp),
            lod_max_clamp: f32::from_bits(self.lod_max_clamp),
            ..Default::default()
        }
    }
}

/// How a texture is filtered when scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScaleMode {
    /// Bilinear filtering, clamped to the edge.
    #[default]
    Linear,
    /// Nearest-neighbour filtering for pixel art, clamped to the edge.
    Nearest,
    LinearRepeat,
    NearestRepeat,
}

impl ScaleMode {
    pub fn to_sampler_key(self) -> SamplerKey {
        use wgpu::{AddressMode, FilterMode};
        match self {
            Self::Linear => SamplerKey::new(AddressMode::ClampToEdge, FilterMode::Linear),
            Self::Nearest => SamplerKey::new(AddressMode::ClampToEdge, FilterMode::Nearest),
            Self::LinearRepeat => SamplerKey::new(AddressMode::Repeat, FilterMode::Linear),
            Self::NearestRepeat => SamplerKey::new(AddressMode::Repeat, FilterMode::Nearest),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Linear => "Linear Sampler",
            Self::Nearest => "Nearest Sampler",
            Self::LinearRepeat => "Linear Repeat Sampler",
            Self::NearestRepeat => "Nearest Repeat Sampler",
        }
    }
}

/// Thread-safe cache of samplers. Samplers live until the cache is dropped.
#[derive(Default)]
pub struct SamplerCache {
    cache: RwLock<HashMap<SamplerKey, GpuSampler>>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, context: &dyn RenderContext, mode: ScaleMode) -> GpuSampler {
        self.get_or_create(context, mode.to_sampler_key(), Some(mode.label()))
    }

    pub fn linear(&self, context: &dyn RenderContext) -> GpuSampler {
        self.get(context, ScaleMode::Linear)
    }

    pub fn nearest(&self, context: &dyn RenderContext) -> GpuSampler {
        self.get(context, ScaleMode::Nearest)
    }

    pub fn get_or_create(&self, context: &dyn RenderContext, key: SamplerKey, label: Option<&str>) -> GpuSampler {
        profile_function!();
        if let Some(sampler) = self.cache.read().get(&key) {
            return sampler.clone();
        }

        let mut cache = self.cache.write();
        // Another thread may have inserted while we waited for the write lock.
        if let Some(sampler) = cache.get(&key) {
            return sampler.clone();
        }
        let sampler = context.create_sampler(&key.to_descriptor(label));
        cache.insert(key, sampler.clone());
        sampler
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_test_utils::MockRenderContext;

    #[test]
    fn test_same_mode_returns_same_sampler() {
        let mock = MockRenderContext::new();
        let cache = SamplerCache::new();
        let a = cache.linear(&mock);
        let b = cache.get(&mock, ScaleMode::Linear);
        let c = cache.nearest(&mock);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
        assert_eq!(mock.count_calls(|c| matches!(c, lumen_test_utils::RenderCall::CreateSampler { .. })), 2);
    }

    #[test]
    fn test_repeat_modes_wrap() {
        let desc = ScaleMode::NearestRepeat.to_sampler_key().to_descriptor(None);
        assert_eq!(desc.address_mode_u, wgpu::AddressMode::Repeat);
        assert_eq!(desc.mag_filter, wgpu::FilterMode::Nearest);
        assert_ne!(ScaleMode::Linear.to_sampler_key(), ScaleMode::LinearRepeat.to_sampler_key());
    }
}
