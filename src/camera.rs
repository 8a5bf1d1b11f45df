// Orbit camera
//
// Thin consumer of the engine's translate/rotate/zoom calls: pure state,
// no GPU side effects. Holds an eye position plus a right/up/look basis;
// producing the view matrix re-orthonormalizes the basis so drift from
// incremental rotations never accumulates.

use glam::{Mat4, Quat, Vec3};

pub struct Camera {
    view_width: f32,
    view_height: f32,
    vertical_fov: f32,
    near: f32,
    far: f32,
    eye: Vec3,
    right: Vec3,
    up: Vec3,
    look: Vec3,
}

impl Camera {
    /// View size in pixels, vertical field of view in degrees.
    pub fn new(view_width: u32, view_height: u32, vertical_fov: f32) -> Self {
        Self {
            view_width: view_width.max(1) as f32,
            view_height: view_height.max(1) as f32,
            vertical_fov,
            near: 0.1,
            far: 100.0,
            eye: Vec3::new(0.0, 0.0, -4.0),
            right: Vec3::X,
            up: Vec3::Y,
            look: Vec3::Z,
        }
    }

    pub fn set_view_size(&mut self, width: u32, height: u32) {
        self.view_width = width.max(1) as f32;
        self.view_height = height.max(1) as f32;
    }

    pub fn set_frustum_depth(&mut self, near: f32, far: f32) {
        self.near = near;
        self.far = far;
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn translate(&mut self, dx: f32, dy: f32, dz: f32) {
        self.eye += Vec3::new(dx, dy, dz);
    }

    /// Pitch about the current right axis, then yaw about the current up
    /// axis, applied to the whole basis.
    pub fn rotate(&mut self, pitch: f32, yaw: f32) {
        let rotation =
            Quat::from_axis_angle(self.up, yaw) * Quat::from_axis_angle(self.right, pitch);
        self.right = rotation * self.right;
        self.up = rotation * self.up;
        self.look = rotation * self.look;
    }

    /// Dolly along the look direction.
    pub fn zoom(&mut self, delta: f32) {
        self.eye += delta * self.look;
    }

    /// Left-handed view matrix. The right axis is projected onto the
    /// horizontal plane first, which keeps the camera level and removes
    /// accumulated roll before the basis is rebuilt.
    pub fn view_matrix(&mut self) -> Mat4 {
        self.right.y = 0.0;
        self.right = self.right.normalize();
        self.look = self.right.cross(self.up).normalize();
        self.up = self.look.cross(self.right);

        Mat4::look_at_lh(self.eye, self.eye + self.look, self.up)
    }

    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::perspective_lh(
            self.vertical_fov.to_radians(),
            self.view_width / self.view_height,
            self.near,
            self.far,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn translate_offsets_the_eye() {
        let mut camera = Camera::new(800, 600, 45.0);
        let start = camera.eye();
        camera.translate(1.0, -2.0, 3.0);
        assert_eq!(camera.eye() - start, Vec3::new(1.0, -2.0, 3.0));
    }

    #[test]
    fn zoom_moves_along_the_look_direction() {
        let mut camera = Camera::new(800, 600, 45.0);
        let start = camera.eye();
        camera.zoom(2.5);
        let moved = camera.eye() - start;
        assert!((moved.length() - 2.5).abs() < EPSILON);
        assert!(moved.z > 0.0);
    }

    #[test]
    fn view_matrix_recenters_the_eye() {
        let mut camera = Camera::new(800, 600, 45.0);
        camera.translate(0.5, 1.0, -1.5);
        let view = camera.view_matrix();
        let eye_in_view = view.transform_point3(camera.eye());
        assert!(eye_in_view.length() < EPSILON);
    }

    #[test]
    fn basis_stays_orthonormal_across_rotations() {
        let mut camera = Camera::new(800, 600, 45.0);
        for _ in 0..100 {
            camera.rotate(0.03, -0.07);
        }
        let _ = camera.view_matrix();

        assert!((camera.right.length() - 1.0).abs() < EPSILON);
        assert!((camera.up.length() - 1.0).abs() < EPSILON);
        assert!((camera.look.length() - 1.0).abs() < EPSILON);
        assert!(camera.right.dot(camera.up).abs() < EPSILON);
        assert!(camera.right.dot(camera.look).abs() < EPSILON);
        assert!(camera.up.dot(camera.look).abs() < EPSILON);
    }

    #[test]
    fn projection_tracks_the_view_aspect() {
        let mut camera = Camera::new(800, 400, 45.0);
        let wide = camera.proj_matrix();

        camera.set_view_size(400, 400);
        let square = camera.proj_matrix();

        // Narrower aspect means a larger x scale.
        assert!(square.col(0).x > wide.col(0).x);
        assert!((wide.col(1).y - square.col(1).y).abs() < EPSILON);
    }
}
