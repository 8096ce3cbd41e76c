use serde::{Deserialize, Serialize};
use ultraviolet::{projection, Mat4, Vec3};

/// A fixed camera looking from `eye` at `target`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_degrees: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl CameraSettings {
    pub fn raster_default() -> Self {
        Self {
            eye: Vec3::new(2.0, 2.0, 2.0),
            target: Vec3::zero(),
            up: Vec3::unit_z(),
            fov_degrees: 45.0,
            z_near: 0.1,
            z_far: 10.0,
        }
    }

    pub fn ray_traced_default() -> Self {
        Self {
            fov_degrees: 90.0,
            z_far: 100.0,
            ..Self::raster_default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub settings: CameraSettings,
    pub aspect_ratio: f32,
}

impl Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            aspect_ratio: 1.0,
        }
    }

    pub fn set_extent(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect_ratio = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.settings.eye, self.settings.target, self.settings.up)
    }

    /// Vulkan clip space: y points down, depth goes from 0 to 1.
    pub fn projection_matrix(&self) -> Mat4 {
        projection::rh_yup::perspective_vk(
            self.settings.fov_degrees.to_radians(),
            self.aspect_ratio,
            self.settings.z_near,
            self.settings.z_far,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultraviolet::Vec4;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn view_matrix_moves_the_eye_to_the_origin() {
        let camera = Camera::new(CameraSettings::raster_default());
        let eye = camera.settings.eye;
        let in_view = camera.view_matrix() * Vec4::new(eye.x, eye.y, eye.z, 1.0);
        assert!(close(in_view.x, 0.0) && close(in_view.y, 0.0) && close(in_view.z, 0.0));
    }

    #[test]
    fn target_is_in_front_of_the_camera() {
        let camera = Camera::new(CameraSettings::raster_default());
        let target = camera.view_matrix() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(target.z < 0.0);
        assert!(close(target.z, -(12.0f32).sqrt()));
    }

    #[test]
    fn projection_maps_the_near_and_far_planes_to_vulkan_depth() {
        let mut camera = Camera::new(CameraSettings::raster_default());
        camera.set_extent(1280, 720);
        let projection = camera.projection_matrix();

        let near = projection * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = projection * Vec4::new(0.0, 0.0, -10.0, 1.0);
        assert!(close(near.z / near.w, 0.0));
        assert!(close(far.z / far.w, 1.0));
    }

    #[test]
    fn zero_height_keeps_the_previous_aspect_ratio() {
        let mut camera = Camera::new(CameraSettings::ray_traced_default());
        camera.set_extent(800, 400);
        camera.set_extent(800, 0);
        assert!(close(camera.aspect_ratio, 2.0));
    }

    #[test]
    fn ray_traced_camera_sees_further() {
        let raster = CameraSettings::raster_default();
        let ray_traced = CameraSettings::ray_traced_default();
        assert_eq!(raster.eye, ray_traced.eye);
        assert!(ray_traced.z_far > raster.z_far);
        assert!(ray_traced.fov_degrees > raster.fov_degrees);
    }
}
