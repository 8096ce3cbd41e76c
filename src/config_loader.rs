use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::CameraSettings;
use crate::vulkan::window_settings::{PresentMode, WindowSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub model_path: PathBuf,
    pub shader_directory: PathBuf,
    pub present_mode: PresentMode,
    pub raster_window: WindowSettings,
    pub ray_traced_window: WindowSettings,
    pub raster_camera: CameraSettings,
    pub ray_traced_camera: CameraSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: "assets/models/model.glb".into(),
            shader_directory: env!("MIRAGE_SHADER_DIR").into(),
            present_mode: PresentMode::Fifo,
            raster_window: WindowSettings {
                title: "Mirage - Rasterized".to_string(),
                width: 1280,
                height: 720,
                resizable: true,
            },
            ray_traced_window: WindowSettings {
                title: "Mirage - Ray Traced".to_string(),
                width: 800,
                height: 800,
                resizable: false,
            },
            raster_camera: CameraSettings::raster_default(),
            ray_traced_camera: CameraSettings::ray_traced_default(),
        }
    }
}

impl Config {
    pub fn from_str(value: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(value)?)
    }
}

pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<Config>,
}

impl ConfigFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
        }
    }

    /// Reads the config file. A missing file is replaced by the defaults.
    pub fn load_config(&mut self) -> Result<&mut Config, ConfigError> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => Config::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "No config file at {}, writing the defaults",
                    self.path.display()
                );
                let config = Config::default();
                self.config = Some(config.clone());
                self.save_config()?;
                config
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(self.config.insert(config))
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content).map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mirage-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn defaults_describe_both_windows() {
        let config = Config::default();
        assert_eq!(config.model_path, PathBuf::from("assets/models/model.glb"));
        assert_eq!(config.present_mode, PresentMode::Fifo);
        assert_eq!((config.raster_window.width, config.raster_window.height), (1280, 720));
        assert!(config.raster_window.resizable);
        assert_eq!(
            (config.ray_traced_window.width, config.ray_traced_window.height),
            (800, 800)
        );
        assert!(!config.ray_traced_window.resizable);
        assert_eq!(config.raster_camera.fov_degrees, 45.0);
        assert_eq!(config.ray_traced_camera.fov_degrees, 90.0);
    }

    #[test]
    fn json_round_trip() {
        let mut config = Config::default();
        config.present_mode = PresentMode::Mailbox;
        config.ray_traced_window.width = 512;

        let json = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(Config::from_str(&json).unwrap(), config);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(matches!(
            Config::from_str("{ \"model_path\": 5 }"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn missing_file_is_replaced_by_defaults() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);

        let mut loader = ConfigFileLoader::new(&path);
        let config = loader.load_config().unwrap().clone();
        assert_eq!(config, Config::default());

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(Config::from_str(&written).unwrap(), config);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn existing_files_are_read_and_saved_back() {
        let path = temp_path("existing");
        let mut config = Config::default();
        config.raster_window.title = "existing".to_string();
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let mut loader = ConfigFileLoader::new(&path);
        let loaded = loader.load_config().unwrap();
        assert_eq!(loaded.raster_window.title, "existing");
        loaded.present_mode = PresentMode::Immediate;
        loader.save_config().unwrap();

        let written = Config::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.raster_window.title, "existing");
        assert_eq!(written.present_mode, PresentMode::Immediate);
        std::fs::remove_file(&path).unwrap();
    }
}
