// orbit-renderer - windowed demo around the Vulkan engine core
//
// Owns the winit window and input handling, injects the raw surface
// handles plus geometry into the engine once at startup, and forwards
// resize events. The scene is a colored cube with staged vertex
// residency, orbited by the camera.

mod backend;
mod camera;
mod config;

use anyhow::Result;
use backend::{Engine, SurfaceGeometry, SurfaceSource, Vertex};
use config::Config;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::collections::HashSet;
use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load();
    log::info!(
        "starting {} ({}x{})",
        config.window.title,
        config.window.width,
        config.window.height
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Eight cube corners, each with a distinct color.
fn cube_vertices() -> Vec<Vertex> {
    vec![
        Vertex { position: [-0.5, -0.5, -0.5], color: [1.0, 1.0, 1.0] },
        Vertex { position: [-0.5, 0.5, -0.5], color: [0.0, 0.0, 0.0] },
        Vertex { position: [0.5, 0.5, -0.5], color: [1.0, 0.0, 0.0] },
        Vertex { position: [0.5, -0.5, -0.5], color: [0.0, 1.0, 0.0] },
        Vertex { position: [-0.5, -0.5, 0.5], color: [0.0, 0.0, 1.0] },
        Vertex { position: [-0.5, 0.5, 0.5], color: [1.0, 1.0, 0.0] },
        Vertex { position: [0.5, 0.5, 0.5], color: [0.0, 1.0, 1.0] },
        Vertex { position: [0.5, -0.5, 0.5], color: [1.0, 0.0, 1.0] },
    ]
}

/// Twelve triangles wound for a clockwise-front-face pipeline.
fn cube_indices() -> Vec<u32> {
    vec![
        // front face
        0, 1, 2, 0, 2, 3,
        // back face
        4, 6, 5, 4, 7, 6,
        // left face
        4, 5, 1, 4, 1, 0,
        // right face
        3, 2, 6, 3, 6, 7,
        // top face
        1, 5, 6, 1, 6, 2,
        // bottom face
        4, 0, 3, 4, 3, 7,
    ]
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    engine: Option<Engine>,
    held_keys: HashSet<KeyCode>,
    rotating: bool,
    last_cursor: Option<(f64, f64)>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            engine: None,
            held_keys: HashSet::new(),
            rotating: false,
            last_cursor: None,
        }
    }

    fn init_engine(&mut self, window: &Arc<Window>) -> Result<()> {
        let display = window.raw_display_handle();
        let raw_window = window.raw_window_handle();

        let dpr = window.scale_factor();
        let size = window.inner_size().to_logical::<f64>(dpr);
        let geometry = SurfaceGeometry::new(
            size.width.round() as u32,
            size.height.round() as u32,
            dpr,
        );

        let mut engine = Engine::new(
            SurfaceSource {
                display,
                window: raw_window,
            },
            geometry,
            self.config.engine_options(),
        )?;

        engine.declare_vertices("cube", true, cube_vertices());
        engine.bind_vertex_buffer("cube");
        engine.declare_indices("cube", cube_indices());
        engine.bind_index_buffer("cube");

        engine.complete_bring_up()?;

        self.engine = Some(engine);
        Ok(())
    }

    /// WASD strafes, QE moves vertically, W/S along the view axis.
    fn apply_held_keys(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        let axis = |neg: KeyCode, pos: KeyCode, keys: &HashSet<KeyCode>| {
            (keys.contains(&pos) as i32 - keys.contains(&neg) as i32) as f32
        };

        let horizontal = axis(KeyCode::KeyA, KeyCode::KeyD, &self.held_keys);
        let vertical = axis(KeyCode::KeyQ, KeyCode::KeyE, &self.held_keys);
        let front_back = axis(KeyCode::KeyS, KeyCode::KeyW, &self.held_keys);

        if horizontal != 0.0 || vertical != 0.0 || front_back != 0.0 {
            let speed = self.config.camera.move_speed;
            engine.translate_camera(horizontal * speed, vertical * speed, front_back * speed);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(LogicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_engine(&window) {
            log::error!("engine bring-up failed: {e:#}");
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("close requested");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                let (Some(engine), Some(window)) = (self.engine.as_mut(), self.window.as_ref())
                else {
                    return;
                };
                let logical = size.to_logical::<f64>(window.scale_factor());
                if let Err(e) = engine.resize(
                    logical.width.round() as u32,
                    logical.height.round() as u32,
                ) {
                    log::error!("swapchain rebuild failed: {e}");
                    event_loop.exit();
                }
            }

            WindowEvent::RedrawRequested => {
                self.apply_held_keys();
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.render_frame() {
                        log::error!("render error: {e}");
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    match event.state {
                        ElementState::Pressed => {
                            if key == KeyCode::Escape {
                                event_loop.exit();
                                return;
                            }
                            self.held_keys.insert(key);
                        }
                        ElementState::Released => {
                            self.held_keys.remove(&key);
                        }
                    }
                }
            }

            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Right {
                    self.rotating = state == ElementState::Pressed;
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                if self.rotating {
                    if let (Some(engine), Some((last_x, last_y))) =
                        (self.engine.as_mut(), self.last_cursor)
                    {
                        let speed = self.config.camera.rotate_speed;
                        let dx = (position.x - last_x) as f32 * speed;
                        let dy = (position.y - last_y) as f32 * speed;
                        engine.rotate_camera(-dx, -dy);
                    }
                }
                self.last_cursor = Some((position.x, position.y));
            }

            WindowEvent::MouseWheel { delta, .. } => {
                if let Some(engine) = self.engine.as_mut() {
                    let lines = match delta {
                        MouseScrollDelta::LineDelta(_, y) => y * 40.0,
                        MouseScrollDelta::PixelDelta(pos) => pos.y as f32,
                    };
                    engine.zoom_camera(lines * self.config.camera.zoom_speed);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferManager;

    #[test]
    fn cube_has_eight_corners_and_twelve_triangles() {
        let vertices = cube_vertices();
        let indices = cube_indices();

        assert_eq!(vertices.len(), 8);
        assert_eq!(indices.len(), 36);
        assert_eq!(indices.len() % 3, 0);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn every_corner_is_referenced() {
        let indices = cube_indices();
        for corner in 0..8u32 {
            assert!(indices.contains(&corner), "corner {corner} is unused");
        }
    }

    #[test]
    fn declared_cube_scene_draws_thirty_six_indices() {
        let mut buffers = BufferManager::default();
        buffers.declare_vertices("cube", true, cube_vertices());
        buffers.bind_vertex_label("cube");
        buffers.declare_indices("cube", cube_indices());
        buffers.bind_index_label("cube");

        assert_eq!(buffers.bound_vertex_label(), Some("cube"));
        assert_eq!(buffers.bound_index_label(), Some("cube"));
        assert_eq!(buffers.bound_index_count(), Some(36));
        assert_eq!(buffers.is_staged("cube"), Some(true));
    }
}
