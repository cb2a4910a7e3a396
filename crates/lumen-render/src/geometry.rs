//! Shared vertex/index buffers for the shapes sprites are drawn with.
//!
//! Shapes live in unit space `[0, 1]^2` with matching UVs; the sprite shader
//! scales them by the instance size around the pivot. Each shape is uploaded once
//! and then shared through `Arc<Geometry>` for the rest of the process.

use std::f32::consts::{FRAC_PI_2, TAU};
use std::sync::Arc;

use ahash::HashMap;
use bytemuck::{Pod, Zeroable};
use lumen_core::profiling::profile_function;
use lumen_test_utils::{GpuBuffer, RenderContext, ResourceId};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex2D {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

impl Vertex2D {
    pub const fn new(x: f32, y: f32) -> Self {
        Self {
            position: [x, y],
            uv: [x, y],
        }
    }

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        const ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex2D>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &ATTRIBUTES,
        }
    }
}

/// Largest circle segment count whose fan still fits 16-bit indices.
pub const MAX_CIRCLE_SEGMENTS: u32 = u16::MAX as u32;
/// Largest per-corner segment count for a rounded rectangle with 16-bit indices.
pub const MAX_CORNER_SEGMENTS: u32 = u16::MAX as u32 / 4 - 1;

fn circle_segments(segments: u32) -> u32 {
    let clamped = segments.clamp(3, MAX_CIRCLE_SEGMENTS);
    if clamped < segments {
        tracing::warn!("Circle with {} segments clamped to {}", segments, clamped);
    }
    clamped
}

fn corner_segments(segments: u32) -> u32 {
    let clamped = segments.clamp(1, MAX_CORNER_SEGMENTS);
    if clamped < segments {
        tracing::warn!("Rounded rect with {} corner segments clamped to {}", segments, clamped);
    }
    clamped
}

/// CPU-side triangle list before upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeData {
    pub vertices: Vec<Vertex2D>,
    pub indices: Vec<u16>,
}

impl ShapeData {
    pub fn quad() -> Self {
        Self {
            vertices: vec![
                Vertex2D::new(0.0, 0.0),
                Vertex2D::new(1.0, 0.0),
                Vertex2D::new(1.0, 1.0),
                Vertex2D::new(0.0, 1.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// Triangle fan around the center, `segments` clamped to
    /// `[3, MAX_CIRCLE_SEGMENTS]`.
    pub fn circle(segments: u32) -> Self {
        let segments = circle_segments(segments);
        let mut vertices = Vec::with_capacity(segments as usize + 1);
        vertices.push(Vertex2D::new(0.5, 0.5));
        for i in 0..segments {
            let angle = TAU * i as f32 / segments as f32;
            vertices.push(Vertex2D::new(0.5 + 0.5 * angle.cos(), 0.5 + 0.5 * angle.sin()));
        }
        Self {
            indices: fan_indices(segments),
            vertices,
        }
    }

    /// Rectangle with quarter-circle corners of `radius` (unit space, clamped to
    /// `[0, 0.5]`) and `segments` steps per corner (`[1, MAX_CORNER_SEGMENTS]`).
    pub fn rounded_rect(radius: f32, segments: u32) -> Self {
        let radius = if radius.is_finite() { radius.clamp(0.0, 0.5) } else { 0.0 };
        let segments = corner_segments(segments);
        let corners = [
            (1.0 - radius, radius, -FRAC_PI_2),
            (1.0 - radius, 1.0 - radius, 0.0),
            (radius, 1.0 - radius, FRAC_PI_2),
            (radius, radius, 2.0 * FRAC_PI_2),
        ];

        let outline = 4 * (segments + 1);
        let mut vertices = Vec::with_capacity(outline as usize + 1);
        vertices.push(Vertex2D::new(0.5, 0.5));
        for (cx, cy, start) in corners {
            for step in 0..=segments {
                let angle = start + FRAC_PI_2 * step as f32 / segments as f32;
                vertices.push(Vertex2D::new(cx + radius * angle.cos(), cy + radius * angle.sin()));
            }
        }
        Self {
            indices: fan_indices(outline),
            vertices,
        }
    }
}

/// Indices for a fan from vertex 0 around a closed outline of `ring` vertices.
fn fan_indices(ring: u32) -> Vec<u16> {
    (0..ring)
        .flat_map(|i| [0, (1 + i) as u16, (1 + (i + 1) % ring) as u16])
        .collect()
}

/// An uploaded shape.
#[derive(Debug)]
pub struct Geometry {
    name: String,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    vertex_count: u32,
    index_count: u32,
}

impl Geometry {
    pub fn upload(context: &dyn RenderContext, name: &str, shape: &ShapeData) -> Self {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&shape.vertices);
        let mut index_bytes = bytemuck::cast_slice::<u16, u8>(&shape.indices).to_vec();
        // Buffer writes must be a multiple of 4 bytes; the padding index is never drawn.
        index_bytes.resize(index_bytes.len().next_multiple_of(4), 0);

        let vertex_buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: vertex_bytes.len() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.write_buffer(&vertex_buffer, 0, vertex_bytes);

        let index_buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: index_bytes.len() as u64,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.write_buffer(&index_buffer, 0, &index_bytes);

        tracing::debug!(
            "Uploaded geometry '{}' ({} vertices, {} indices)",
            name,
            shape.vertices.len(),
            shape.indices.len()
        );

        Self {
            name: name.to_owned(),
            vertex_buffer,
            index_buffer,
            vertex_count: shape.vertices.len() as u32,
            index_count: shape.indices.len() as u32,
        }
    }

    /// Identity used for batching.
    pub fn id(&self) -> ResourceId {
        self.vertex_buffer.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.index_buffer
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Process-lifetime cache of uploaded shapes keyed by their parameters.
pub struct GeometryCache {
    context: Arc<dyn RenderContext>,
    entries: HashMap<String, Arc<Geometry>>,
}

impl GeometryCache {
    pub fn new(context: Arc<dyn RenderContext>) -> Self {
        Self {
            context,
            entries: HashMap::default(),
        }
    }

    pub fn quad(&mut self) -> Arc<Geometry> {
        self.get_or_upload("quad".to_owned(), ShapeData::quad)
    }

    pub fn circle(&mut self, segments: u32) -> Arc<Geometry> {
        let segments = circle_segments(segments);
        self.get_or_upload(format!("circle:{segments}"), || ShapeData::circle(segments))
    }

    pub fn rounded_rect(&mut self, radius: f32, segments: u32) -> Arc<Geometry> {
        let radius = if radius.is_finite() { radius.clamp(0.0, 0.5) } else { 0.0 };
        let segments = corner_segments(segments);
        self.get_or_upload(format!("rounded_rect:{radius}:{segments}"), || {
            ShapeData::rounded_rect(radius, segments)
        })
    }

    /// Look up `key`, uploading `build()` on first use.
    pub fn get_or_upload(&mut self, key: String, build: impl FnOnce() -> ShapeData) -> Arc<Geometry> {
        profile_function!();
        if let Some(geometry) = self.entries.get(&key) {
            return geometry.clone();
        }
        let geometry = Arc::new(Geometry::upload(self.context.as_ref(), &key, &build()));
        self.entries.insert(key, geometry.clone());
        geometry
    }

    pub fn get(&self, key: &str) -> Option<Arc<Geometry>> {
        self.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_test_utils::MockRenderContext;

    fn cache() -> (MockRenderContext, GeometryCache) {
        let mock = MockRenderContext::new();
        let cache = GeometryCache::new(Arc::new(mock.clone()));
        (mock, cache)
    }

    #[test]
    fn test_shapes_are_uploaded_once() {
        let (mock, mut cache) = cache();
        let a = cache.circle(32);
        let b = cache.circle(32);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mock.count_buffer_creates(), 2);

        let c = cache.circle(16);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
        assert_eq!(mock.count_buffer_creates(), 4);
    }

    #[test]
    fn test_circle_segments_are_clamped() {
        let (_, mut cache) = cache();
        let tiny = cache.circle(1);
        assert!(Arc::ptr_eq(&tiny, &cache.circle(3)));
        assert_eq!(tiny.index_count(), 9);
        assert_eq!(tiny.vertex_count(), 4);
    }

    #[test]
    fn test_huge_segment_counts_fit_u16_indices() {
        let (_, mut cache) = cache();
        let circle = cache.circle(70_000);
        assert!(Arc::ptr_eq(&circle, &cache.circle(MAX_CIRCLE_SEGMENTS)));
        assert!(cache.get(&format!("circle:{MAX_CIRCLE_SEGMENTS}")).is_some());
        assert!(cache.get("circle:70000").is_none());
        assert_eq!(circle.vertex_count(), u16::MAX as u32 + 1);

        let shape = ShapeData::circle(70_000);
        assert_eq!(shape.indices.iter().copied().max(), Some(u16::MAX));
        // The fan closes back onto the first outline vertex.
        assert_eq!(&shape.indices[shape.indices.len() - 3..], &[0, u16::MAX, 1]);

        let rect = ShapeData::rounded_rect(0.25, 20_000);
        assert_eq!(rect.vertices.len(), 4 * (MAX_CORNER_SEGMENTS as usize + 1) + 1);
        assert!(rect.vertices.len() <= u16::MAX as usize + 1);
        assert!(rect.indices.iter().all(|&i| (i as usize) < rect.vertices.len()));
        let rect = cache.rounded_rect(0.25, 20_000);
        assert!(Arc::ptr_eq(&rect, &cache.rounded_rect(0.25, MAX_CORNER_SEGMENTS)));
    }

    #[test]
    fn test_rounded_rect_key_includes_radius() {
        let (_, mut cache) = cache();
        let a = cache.rounded_rect(0.25, 4);
        let b = cache.rounded_rect(0.125, 4);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(cache.get("rounded_rect:0.25:4").is_some());
        assert!(Arc::ptr_eq(&cache.rounded_rect(0.9, 4), &cache.rounded_rect(0.5, 4)));
    }

    #[test]
    fn test_odd_index_data_is_padded() {
        let (mock, mut cache) = cache();
        let circle = cache.circle(3);
        let bytes = mock.buffer_contents(circle.index_buffer()).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(circle.index_count(), 9);
    }

    #[test]
    fn test_shapes_stay_in_unit_square() {
        for shape in [ShapeData::quad(), ShapeData::circle(24), ShapeData::rounded_rect(0.3, 6)] {
            for v in &shape.vertices {
                assert!(v.position.iter().all(|c| (-1e-5..=1.0 + 1e-5).contains(c)));
            }
            assert_eq!(shape.indices.len() % 3, 0);
            assert!(shape.indices.iter().all(|&i| (i as usize) < shape.vertices.len()));
        }
    }

    #[test]
    fn test_rounded_rect_touches_all_edges() {
        let shape = ShapeData::rounded_rect(0.25, 4);
        let xs: Vec<f32> = shape.vertices.iter().map(|v| v.position[0]).collect();
        let ys: Vec<f32> = shape.vertices.iter().map(|v| v.position[1]).collect();
        let min = |v: &[f32]| v.iter().cloned().fold(f32::MAX, f32::min);
        let max = |v: &[f32]| v.iter().cloned().fold(f32::MIN, f32::max);
        assert!(min(&xs).abs() < 1e-5 && (max(&xs) - 1.0).abs() < 1e-5);
        assert!(min(&ys).abs() < 1e-5 && (max(&ys) - 1.0).abs() < 1e-5);
    }
}
