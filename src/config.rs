// Configuration loaded from config.toml
//
// Every section falls back to sensible defaults when the file or a key is
// missing, so a bare checkout runs without any configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::{EngineOptions, ShaderSource, ShaderStage};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
    pub camera: CameraConfig,
}

/// Window settings; width/height are screen coordinates, the pixel size is
/// derived from the monitor's scale factor at startup.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Orbit Renderer".to_string(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub max_frames_in_flight: usize,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

/// Paths to the pre-compiled SPIR-V blobs produced by the offline shader
/// compiler (see build.rs).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: String,
    pub fragment: String,
    pub entry_point: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: "shaders/cube.vert.spv".to_string(),
            fragment: "shaders/cube.frag.spv".to_string(),
            entry_point: "main".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub vertical_fov: f32,
    pub move_speed: f32,
    pub rotate_speed: f32,
    pub zoom_speed: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            vertical_fov: 45.0,
            move_speed: 0.05,
            rotate_speed: 0.005,
            zoom_speed: 0.01,
        }
    }
}

impl Config {
    /// Load configuration from config.toml, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("failed to load config.toml: {e}, using defaults");
            Config::default()
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("no config file at {path:?}, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path:?}"))?;

        log::info!("loaded configuration from {path:?}");
        Ok(config)
    }

    /// Engine-facing view of the configuration, including the shader
    /// manifest the pipeline re-registers on every build.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            app_name: self.window.title.clone(),
            enable_validation: cfg!(debug_assertions) && self.debug.validation_layers,
            frames_in_flight: self.graphics.max_frames_in_flight.max(1),
            clear_color: self.graphics.clear_color,
            shaders: vec![
                ShaderSource {
                    label: "vert".to_string(),
                    path: self.shaders.vertex.clone().into(),
                    entry_point: self.shaders.entry_point.clone(),
                    stage: ShaderStage::Vertex,
                },
                ShaderSource {
                    label: "frag".to_string(),
                    path: self.shaders.fragment.clone().into(),
                    entry_point: self.shaders.entry_point.clone(),
                    stage: ShaderStage::Fragment,
                },
            ],
            vertical_fov: self.camera.vertical_fov,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.shaders.entry_point, "main");
        assert!(config.camera.vertical_fov > 0.0);
    }

    #[test]
    fn partial_files_keep_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 1280
            height = 720

            [graphics]
            max_frames_in_flight = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.title, "Orbit Renderer");
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.shaders.vertex, "shaders/cube.vert.spv");
    }

    #[test]
    fn engine_options_carry_both_shader_stages() {
        let options = Config::default().engine_options();
        assert_eq!(options.shaders.len(), 2);
        assert_eq!(options.shaders[0].stage, ShaderStage::Vertex);
        assert_eq!(options.shaders[1].stage, ShaderStage::Fragment);
    }

    #[test]
    fn frame_depth_is_clamped_to_at_least_one() {
        let config: Config = toml::from_str(
            r#"
            [graphics]
            max_frames_in_flight = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.engine_options().frames_in_flight, 1);
    }
}
