use anyhow::{Context, Result};
use directories::ProjectDirs;
use fprint_vision::GuideWindow;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static DIRS: Lazy<Option<ProjectDirs>> = Lazy::new(|| ProjectDirs::from("", "", "fprint"));

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| match option_env!("FPRINT_CONFIG_PATH") {
    Some(p) => PathBuf::from(p),
    None => DIRS
        .as_ref()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("fprint.toml")),
});

pub static DATA_DIR: Lazy<PathBuf> = Lazy::new(|| match option_env!("FPRINT_DATA_DIR") {
    Some(p) => PathBuf::from(p),
    None => DIRS
        .as_ref()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".")),
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest Euclidean distance (exclusive) still accepted as a match.
    pub threshold: f32,
    pub camera: String,
    pub model_path: PathBuf,
    pub store_path: Option<PathBuf>,
    pub inference_timeout_ms: Option<u64>,
    pub warmup_frames: u32,
    pub guide: Option<GuideWindow>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            camera: "/dev/video0".to_string(),
            model_path: DATA_DIR.join("siamese_model.onnx"),
            store_path: None,
            inference_timeout_ms: Some(10_000),
            warmup_frames: 5,
            guide: None,
        }
    }
}

impl Config {
    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| DATA_DIR.join("fingerprint_embeddings.bin"))
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_ms.map(Duration::from_millis)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.threshold, 0.5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "threshold = 0.35\n\n[guide]\nwidth = 300\nheight = 420\n",
        )
        .unwrap();

        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.threshold, 0.35);
        assert_eq!(
            cfg.guide,
            Some(GuideWindow {
                width: 300,
                height: 420
            })
        );
        assert_eq!(cfg.camera, "/dev/video0");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            store_path: Some(dir.path().join("prints.bin")),
            inference_timeout_ms: Some(2_500),
            ..Config::default()
        };
        save_config(&cfg, Some(&path)).unwrap();
        assert_eq!(load_config(Some(&path)).unwrap(), cfg);
    }

    #[test]
    fn bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threshold = [").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
