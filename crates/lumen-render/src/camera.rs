use glam::{Mat4, Vec2, Vec3};

/// Orthographic camera in pixel space: origin top-left, y down.
///
/// Depth passes through unchanged, so a sprite's `z` in `[0, 1]` is its
/// normalized device depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera2D {
    /// World position shown at the viewport's top-left corner.
    pub position: Vec2,
    pub zoom: f32,
    /// Radians, counter-clockwise on screen.
    pub rotation: f32,
}

impl Default for Camera2D {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            zoom: 1.0,
            rotation: 0.0,
        }
    }
}

impl Camera2D {
    pub fn view(&self) -> Mat4 {
        Mat4::from_scale(Vec3::new(self.zoom, self.zoom, 1.0))
            * Mat4::from_rotation_z(-self.rotation)
            * Mat4::from_translation(-self.position.extend(0.0))
    }

    pub fn projection(width: u32, height: u32) -> Mat4 {
        Mat4::orthographic_lh(0.0, width.max(1) as f32, height.max(1) as f32, 0.0, 0.0, 1.0)
    }

    pub fn view_projection(&self, width: u32, height: u32) -> Mat4 {
        Self::projection(width, height) * self.view()
    }
}

/// Perspective camera for model passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera3D {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera3D {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera3D {
    pub fn view_projection(&self, width: u32, height: u32) -> Mat4 {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far) * Mat4::look_at_rh(self.eye, self.target, self.up)
    }
}

/// Cameras available to passes during a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cameras {
    pub camera_2d: Camera2D,
    pub camera_3d: Camera3D,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_pixel_corners_map_to_ndc() {
        let vp = Camera2D::default().view_projection(800, 600);
        let top_left = vp * Vec4::new(0.0, 0.0, 0.5, 1.0);
        let bottom_right = vp * Vec4::new(800.0, 600.0, 0.5, 1.0);
        assert!((top_left.x + 1.0).abs() < 1e-5 && (top_left.y - 1.0).abs() < 1e-5);
        assert!((bottom_right.x - 1.0).abs() < 1e-5 && (bottom_right.y + 1.0).abs() < 1e-5);
        assert!((top_left.z - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_camera_position_scrolls_world() {
        let camera = Camera2D {
            position: Vec2::new(100.0, 50.0),
            ..Default::default()
        };
        let p = camera.view_projection(200, 100) * Vec4::new(100.0, 50.0, 0.0, 1.0);
        assert!((p.x + 1.0).abs() < 1e-5 && (p.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_perspective_keeps_target_centered() {
        let p = Camera3D::default().view_projection(16, 9) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((p.x / p.w).abs() < 1e-5 && (p.y / p.w).abs() < 1e-5);
        assert!((0.0..=1.0).contains(&(p.z / p.w)));
    }
}
