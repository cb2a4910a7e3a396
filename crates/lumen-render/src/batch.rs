//! Grouping of the ordered draw queue into maximal runs.
//!
//! A new batch starts at index 0 and wherever the geometry, texture, sampler or
//! effect chain differs from the previous request. Concatenating the batches
//! reproduces the queue order exactly, which is the paint order.

use std::ops::Range;
use std::sync::Arc;

use lumen_core::profiling::profile_function;
use lumen_test_utils::{GpuSampler, GpuTexture, ResourceId};

use crate::effect::Effect;
use crate::geometry::Geometry;
use crate::instance::DrawRequest;

/// A contiguous run of requests drawn with one call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub offset: usize,
    pub count: usize,
    pub geometry: Option<Arc<Geometry>>,
    pub texture: Option<GpuTexture>,
    pub sampler: Option<GpuSampler>,
    pub has_effects: bool,
}

impl Batch {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.count
    }

    /// Batches missing a texture, sampler or geometry are skipped when drawing.
    pub fn is_drawable(&self) -> bool {
        self.geometry.is_some() && self.texture.is_some() && self.sampler.is_some()
    }
}

/// Split `items` into maximal runs where `same_run(previous, current)` holds.
pub fn split_runs<T>(items: &[T], same_run: impl Fn(&T, &T) -> bool, mut emit: impl FnMut(Range<usize>)) {
    if items.is_empty() {
        return;
    }
    let mut start = 0;
    for i in 1..items.len() {
        if !same_run(&items[i - 1], &items[i]) {
            emit(start..i);
            start = i;
        }
    }
    emit(start..items.len());
}

fn geometry_id(request: &DrawRequest) -> Option<ResourceId> {
    request.geometry.as_ref().map(|g| g.id())
}

/// Whether two effect chains apply the same effects in the same order.
pub fn same_effects(a: &[Arc<Effect>], b: &[Arc<Effect>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id() == y.id())
}

/// Whether `current` can join the batch that `previous` belongs to.
pub fn same_batch(previous: &DrawRequest, current: &DrawRequest) -> bool {
    geometry_id(previous) == geometry_id(current)
        && previous.texture.as_ref().map(GpuTexture::id) == current.texture.as_ref().map(GpuTexture::id)
        && previous.sampler.as_ref().map(GpuSampler::id) == current.sampler.as_ref().map(GpuSampler::id)
        && same_effects(&previous.effects, &current.effects)
}

/// Rebuild `batches` from `requests` in one linear pass.
pub fn build_batches(requests: &[DrawRequest], batches: &mut Vec<Batch>) {
    profile_function!();
    batches.clear();
    split_runs(requests, same_batch, |run| {
        let first = &requests[run.start];
        batches.push(Batch {
            offset: run.start,
            count: run.len(),
            geometry: first.geometry.clone(),
            texture: first.texture.clone(),
            sampler: first.sampler.clone(),
            has_effects: first.has_effects(),
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryCache;
    use lumen_test_utils::{MockRenderContext, RenderContext};

    struct Fixture {
        geometry: GeometryCache,
        t1: GpuTexture,
        t2: GpuTexture,
        linear: GpuSampler,
        nearest: GpuSampler,
    }

    fn fixture() -> Fixture {
        let mock = MockRenderContext::new();
        let texture = |mock: &MockRenderContext| {
            mock.create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: wgpu::Extent3d {
                    width: 4,
                    height: 4,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
        };
        Fixture {
            t1: texture(&mock),
            t2: texture(&mock),
            linear: mock.create_sampler(&wgpu::SamplerDescriptor::default()),
            nearest: mock.create_sampler(&wgpu::SamplerDescriptor::default()),
            geometry: GeometryCache::new(Arc::new(mock)),
        }
    }

    fn spans(batches: &[Batch]) -> Vec<(usize, usize)> {
        batches.iter().map(|b| (b.offset, b.count)).collect()
    }

    #[test]
    fn test_quad_quad_circle_makes_two_batches() {
        let mut f = fixture();
        let quad = f.geometry.quad();
        let circle = f.geometry.circle(32);
        let requests = vec![
            DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone()),
            DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone()),
            DrawRequest::new(circle.clone(), f.t1.clone(), f.linear.clone()),
        ];

        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);

        assert_eq!(spans(&batches), vec![(0, 2), (2, 1)]);
        assert!(Arc::ptr_eq(batches[0].geometry.as_ref().unwrap(), &quad));
        assert!(Arc::ptr_eq(batches[1].geometry.as_ref().unwrap(), &circle));
        assert_eq!(batches[0].texture.as_ref(), Some(&f.t1));
        assert_eq!(batches[1].texture.as_ref(), Some(&f.t1));
        assert!(!batches[0].has_effects && !batches[1].has_effects);
    }

    #[test]
    fn test_texture_change_splits() {
        let mut f = fixture();
        let quad = f.geometry.quad();
        let requests = vec![
            DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone()),
            DrawRequest::new(quad.clone(), f.t2.clone(), f.linear.clone()),
            DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone()),
        ];
        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);
        assert_eq!(spans(&batches), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn test_sampler_change_splits() {
        let mut f = fixture();
        let quad = f.geometry.quad();
        let requests = vec![
            DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone()),
            DrawRequest::new(quad.clone(), f.t1.clone(), f.nearest.clone()),
        ];
        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);
        assert_eq!(spans(&batches), vec![(0, 1), (1, 1)]);
        assert_eq!(batches[1].sampler.as_ref(), Some(&f.nearest));
    }

    #[test]
    fn test_effect_chains_split_and_merge() {
        let mut f = fixture();
        let quad = f.geometry.quad();
        let glow = Arc::new(Effect::new("glow.wgsl"));
        let blur = Arc::new(Effect::new("blur.wgsl"));
        let base = DrawRequest::new(quad, f.t1.clone(), f.linear.clone());
        let requests = vec![
            base.clone(),
            base.clone().with_effect(glow.clone()),
            base.clone().with_effect(glow.clone()),
            base.clone().with_effect(blur.clone()),
            base.clone(),
        ];
        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);
        assert_eq!(spans(&batches), vec![(0, 1), (1, 2), (3, 1), (4, 1)]);
        let flags: Vec<bool> = batches.iter().map(|b| b.has_effects).collect();
        assert_eq!(flags, vec![false, true, true, false]);
    }

    #[test]
    fn test_missing_resources_are_batched_but_not_drawable() {
        let mut f = fixture();
        let quad = f.geometry.quad();
        let mut orphan = DrawRequest::new(quad.clone(), f.t1.clone(), f.linear.clone());
        orphan.texture = None;
        let requests = vec![
            orphan.clone(),
            orphan,
            DrawRequest::new(quad, f.t1.clone(), f.linear.clone()),
        ];
        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);
        assert_eq!(spans(&batches), vec![(0, 2), (2, 1)]);
        assert!(!batches[0].is_drawable());
        assert!(batches[1].is_drawable());
    }

    #[test]
    fn test_order_preserved_and_batches_maximal() {
        let mut f = fixture();
        let shapes = [f.geometry.quad(), f.geometry.circle(12), f.geometry.rounded_rect(0.2, 3)];
        let textures = [f.t1.clone(), f.t2.clone()];
        let samplers = [f.linear.clone(), f.nearest.clone()];
        let glow = Arc::new(Effect::new("glow.wgsl"));

        // Deterministic pseudo-random stream with long and short runs.
        let mut state = 0x2545_f491_u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        let mut requests = Vec::new();
        for _ in 0..2_000 {
            let r = next();
            let mut request = DrawRequest::new(
                shapes[(r % 3) as usize].clone(),
                textures[((r >> 4) % 2) as usize].clone(),
                samplers[((r >> 8) % 2) as usize].clone(),
            );
            if (r >> 12) % 7 == 0 {
                request = request.with_effect(glow.clone());
            }
            let repeat = 1 + (r >> 16) % 4;
            for _ in 0..repeat {
                requests.push(request.clone());
            }
        }

        let mut batches = Vec::new();
        build_batches(&requests, &mut batches);

        let indices: Vec<usize> = batches.iter().flat_map(|b| b.range()).collect();
        assert_eq!(indices, (0..requests.len()).collect::<Vec<_>>());

        for pair in batches.windows(2) {
            let last_of_first = &requests[pair[0].offset + pair[0].count - 1];
            let first_of_second = &requests[pair[1].offset];
            assert!(!same_batch(last_of_first, first_of_second));
        }
        for batch in &batches {
            for i in batch.range().skip(1) {
                assert!(same_batch(&requests[i - 1], &requests[i]));
            }
        }
    }

    #[test]
    fn test_empty_queue_has_no_batches() {
        let mut batches = vec![];
        build_batches(&[], &mut batches);
        assert!(batches.is_empty());
    }
}
