//! Draw requests and their packed GPU form.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use lumen_test_utils::{GpuSampler, GpuTexture};
use static_assertions::const_assert_eq;

use crate::effect::Effect;
use crate::geometry::Geometry;
use crate::half::{HALF_MAX, pack2x16, unpack2x16};

/// Smallest width/height an instance is packed with.
pub const MIN_SIZE: f32 = 1.0e-3;

/// Bit of the pivot word that marks signed-distance-field rendering. It is the
/// sign bit of the packed pivot.y, which is free because pivots are clamped to
/// `[0, 1]`.
pub const SDF_FLAG: u32 = 0x8000_0000;

/// One sprite or glyph to paint this frame.
///
/// Requests are pushed to a pass queue, packed into [`CompactInstance`]s at the end
/// of the frame and dropped when the queue resets.
#[derive(Debug, Clone)]
pub struct DrawRequest {
    pub texture: Option<GpuTexture>,
    pub sampler: Option<GpuSampler>,
    pub geometry: Option<Arc<Geometry>>,
    /// Pixel position of the pivot. `z` is assigned by the renderer when queued.
    pub position: Vec3,
    /// Radians around the pivot.
    pub rotation: f32,
    /// `[u, v, w, h]` in normalized texture coordinates.
    pub tex_rect: [f32; 4],
    pub tint: [f32; 4],
    /// Size in pixels.
    pub size: Vec2,
    /// Normalized point of the sprite placed at `position`.
    pub pivot: Vec2,
    pub is_sdf: bool,
    /// Applied in order after the sprite is drawn in isolation.
    pub effects: Vec<Arc<Effect>>,
}

/// Alternative name used by game code.
pub type Renderable = DrawRequest;

impl Default for DrawRequest {
    fn default() -> Self {
        Self {
            texture: None,
            sampler: None,
            geometry: None,
            position: Vec3::ZERO,
            rotation: 0.0,
            tex_rect: [0.0, 0.0, 1.0, 1.0],
            tint: [1.0; 4],
            size: Vec2::ONE,
            pivot: Vec2::splat(0.5),
            is_sdf: false,
            effects: Vec::new(),
        }
    }
}

impl DrawRequest {
    pub fn new(geometry: Arc<Geometry>, texture: GpuTexture, sampler: GpuSampler) -> Self {
        Self {
            geometry: Some(geometry),
            texture: Some(texture),
            sampler: Some(sampler),
            ..Default::default()
        }
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.position.x = x;
        self.position.y = y;
        self
    }

    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.size = Vec2::new(width, height);
        self
    }

    pub fn with_rotation(mut self, radians: f32) -> Self {
        self.rotation = radians;
        self
    }

    pub fn with_tint(mut self, tint: [f32; 4]) -> Self {
        self.tint = tint;
        self
    }

    pub fn with_tex_rect(mut self, tex_rect: [f32; 4]) -> Self {
        self.tex_rect = tex_rect;
        self
    }

    pub fn with_pivot(mut self, x: f32, y: f32) -> Self {
        self.pivot = Vec2::new(x, y);
        self
    }

    pub fn sdf(mut self) -> Self {
        self.is_sdf = true;
        self
    }

    pub fn with_effect(mut self, effect: Arc<Effect>) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn has_effects(&self) -> bool {
        !self.effects.is_empty()
    }
}

/// GPU-visible form of a [`DrawRequest`]: sixteen half-floats in eight words.
///
/// | word | low half | high half |
/// |---|---|---|
/// | 0 | position.x | position.y |
/// | 1 | position.z | rotation |
/// | 2 | u | v |
/// | 3 | w | h |
/// | 4 | tint.r | tint.g |
/// | 5 | tint.b | tint.a |
/// | 6 | size.x | size.y |
/// | 7 | pivot.x | pivot.y, bit 31 = [`SDF_FLAG`] |
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CompactInstance {
    pub words: [u32; 8],
}

const_assert_eq!(std::mem::size_of::<CompactInstance>(), 32);

fn finite(value: f32) -> f32 {
    if value.is_finite() { value } else { 0.0 }
}

fn unit(value: f32) -> f32 {
    finite(value).clamp(0.0, 1.0)
}

fn ranged(value: f32) -> f32 {
    finite(value).clamp(-HALF_MAX, HALF_MAX)
}

fn extent(value: f32) -> f32 {
    finite(value).clamp(MIN_SIZE, HALF_MAX)
}

impl CompactInstance {
    /// Size in bytes of one packed instance.
    pub const SIZE: u64 = std::mem::size_of::<CompactInstance>() as u64;

    /// Clamp the request's fields into their valid ranges and pack them.
    ///
    /// Tint, texture rect and pivot clamp to `[0, 1]`, size floors to [`MIN_SIZE`],
    /// non-finite values become zero.
    pub fn pack(request: &DrawRequest) -> Self {
        let [u, v, w, h] = request.tex_rect.map(unit);
        let [r, g, b, a] = request.tint.map(unit);
        let mut pivot = pack2x16(unit(request.pivot.x), unit(request.pivot.y));
        if request.is_sdf {
            pivot |= SDF_FLAG;
        }

        Self {
            words: [
                pack2x16(ranged(request.position.x), ranged(request.position.y)),
                pack2x16(ranged(request.position.z), ranged(request.rotation)),
                pack2x16(u, v),
                pack2x16(w, h),
                pack2x16(r, g),
                pack2x16(b, a),
                pack2x16(extent(request.size.x), extent(request.size.y)),
                pivot,
            ],
        }
    }

    pub fn is_sdf(&self) -> bool {
        self.words[7] & SDF_FLAG != 0
    }

    pub fn unpack(&self) -> UnpackedInstance {
        let [w0, w1, w2, w3, w4, w5, w6, w7] = self.words;
        let (x, y) = unpack2x16(w0);
        let (z, rotation) = unpack2x16(w1);
        let (u, v) = unpack2x16(w2);
        let (w, h) = unpack2x16(w3);
        let (r, g) = unpack2x16(w4);
        let (b, a) = unpack2x16(w5);
        let (sx, sy) = unpack2x16(w6);
        let (px, py) = unpack2x16(w7 & !SDF_FLAG);

        UnpackedInstance {
            position: Vec3::new(x, y, z),
            rotation,
            tex_rect: [u, v, w, h],
            tint: [r, g, b, a],
            size: Vec2::new(sx, sy),
            pivot: Vec2::new(px, py),
            is_sdf: w7 & SDF_FLAG != 0,
        }
    }
}

/// Decoded [`CompactInstance`], at half-float precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnpackedInstance {
    pub position: Vec3,
    pub rotation: f32,
    pub tex_rect: [f32; 4],
    pub tint: [f32; 4],
    pub size: Vec2,
    pub pivot: Vec2,
    pub is_sdf: bool,
}
