use std::time::Duration;

use glam::{Mat4, Quat, Vec3, Vec4};
use winit::event::{ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// First person camera. Keys are matched by physical position (W A S D on a US layout),
/// looking around requires the right mouse button.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Movement direction in camera space, each axis in -1..=1.
    pub velocity: Vec3,
    /// Vertical rotation in radians.
    pub pitch: f32,
    /// Horizontal rotation in radians.
    pub yaw: f32,
    /// World units per second.
    pub speed: f32,
    pub fov_y: f32,
    pub z_near: f32,
    is_looking: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            velocity: Vec3::ZERO,
            pitch: 0.0,
            yaw: 0.0,
            speed: 30.0,
            fov_y: 70f32.to_radians(),
            z_near: 0.1,
            is_looking: false,
        }
    }
}

impl Camera {
    const MOUSE_SENSITIVITY: f32 = 1.0 / 200.0;

    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn rotation_matrix(&self) -> Mat4 {
        let yaw = Quat::from_axis_angle(Vec3::NEG_Y, self.yaw);
        let pitch = Quat::from_axis_angle(Vec3::X, self.pitch);
        Mat4::from_quat(yaw) * Mat4::from_quat(pitch)
    }

    /// Inverse of the camera's own placement in the world.
    pub fn view_matrix(&self) -> Mat4 {
        (Mat4::from_translation(self.position) * self.rotation_matrix()).inverse()
    }

    /// Reversed depth (near plane at 1) with y pointing down in clip space.
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        let mut proj = Mat4::perspective_infinite_reverse_rh(self.fov_y, aspect_ratio, self.z_near);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Moves along `velocity` rotated into world space.
    pub fn update(&mut self, delta: Duration) {
        let step = self.velocity * self.speed * delta.as_secs_f32();
        self.position += (self.rotation_matrix() * Vec4::from((step, 0.0))).truncate();
    }

    pub fn handle_window_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat: false,
                        ..
                    },
                ..
            } => self.handle_key(*code, *state),
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Right,
                ..
            } => {
                self.is_looking = *state == ElementState::Pressed;
            }
            WindowEvent::Focused(false) => {
                self.velocity = Vec3::ZERO;
                self.is_looking = false;
            }
            _ => (),
        }
    }

    /// Raw mouse movement in pixels, ignored unless the right button is held.
    pub fn handle_mouse_motion(&mut self, (x, y): (f64, f64)) {
        if !self.is_looking {
            return;
        }
        self.yaw += x as f32 * Self::MOUSE_SENSITIVITY;
        self.pitch -= y as f32 * Self::MOUSE_SENSITIVITY;
    }

    fn handle_key(&mut self, code: KeyCode, state: ElementState) {
        let pressed = state == ElementState::Pressed;
        let axis = |positive: bool| match (pressed, positive) {
            (true, true) => 1.0,
            (true, false) => -1.0,
            (false, _) => 0.0,
        };

        match code {
            KeyCode::KeyW => self.velocity.z = axis(false),
            KeyCode::KeyS => self.velocity.z = axis(true),
            KeyCode::KeyA => self.velocity.x = axis(false),
            KeyCode::KeyD => self.velocity.x = axis(true),
            _ => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn view_moves_the_world_opposite_to_the_camera() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0));
        let view = camera.view_matrix();

        assert!(close(view.transform_point3(Vec3::new(0.0, 0.0, 5.0)), Vec3::ZERO));
        assert!(close(view.transform_point3(Vec3::ZERO), Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn update_moves_along_the_facing_direction() {
        let mut camera = Camera::new(Vec3::ZERO);
        camera.speed = 2.0;
        camera.velocity = Vec3::new(0.0, 0.0, -1.0);

        camera.update(Duration::from_millis(500));
        assert!(close(camera.position, Vec3::new(0.0, 0.0, -1.0)));

        // quarter turn, forward now points along -x
        camera.position = Vec3::ZERO;
        camera.yaw = -std::f32::consts::FRAC_PI_2;
        camera.update(Duration::from_millis(500));
        assert!(close(camera.position, Vec3::new(-1.0, 0.0, 0.0)));
    }

    #[test]
    fn resting_camera_keeps_its_view() {
        let mut camera = Camera::default();
        let before = camera.view_matrix();

        camera.update(Duration::from_millis(16));

        assert_eq!(camera.view_matrix(), before);
    }

    #[test]
    fn mouse_only_rotates_while_looking() {
        let mut camera = Camera::default();
        camera.handle_mouse_motion((200.0, 100.0));
        assert_eq!((camera.yaw, camera.pitch), (0.0, 0.0));

        camera.is_looking = true;
        camera.handle_mouse_motion((200.0, 100.0));
        assert!((camera.yaw - 1.0).abs() < 1e-6);
        assert!((camera.pitch + 0.5).abs() < 1e-6);
    }

    #[test]
    fn keys_set_and_clear_the_velocity() {
        let mut camera = Camera::default();

        camera.handle_key(KeyCode::KeyW, ElementState::Pressed);
        camera.handle_key(KeyCode::KeyD, ElementState::Pressed);
        assert_eq!(camera.velocity, Vec3::new(1.0, 0.0, -1.0));

        camera.handle_key(KeyCode::KeyW, ElementState::Released);
        assert_eq!(camera.velocity, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn projection_keeps_the_near_plane_at_depth_one() {
        let camera = Camera::default();
        let clip = camera.projection_matrix(1.0) * Vec4::new(0.0, 1.0, -camera.z_near, 1.0);

        assert!((clip.z / clip.w - 1.0).abs() < 1e-5);
        assert!(clip.y < 0.0);
    }
}
