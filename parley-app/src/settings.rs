//! Persistent application settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::{AnalyserConfig, EngineConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub analyser_fft_size: usize,
    pub analyser_smoothing: f32,
    pub analyser_min_db: f32,
    pub analyser_max_db: f32,
    /// Render ticks per second.
    pub render_fps: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            inbound_queue_capacity: engine.inbound_queue_capacity,
            outbound_queue_capacity: engine.outbound_queue_capacity,
            analyser_fft_size: engine.analyser.fft_size,
            analyser_smoothing: engine.analyser.smoothing,
            analyser_min_db: engine.analyser.min_db,
            analyser_max_db: engine.analyser.max_db,
            render_fps: 60,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
        self.inbound_queue_capacity = self.inbound_queue_capacity.clamp(8, 8192);
        self.outbound_queue_capacity = self.outbound_queue_capacity.clamp(1, 1024);
        self.render_fps = self.render_fps.clamp(1, 240);

        let analyser = self.analyser_config().normalized();
        self.analyser_fft_size = analyser.fft_size;
        self.analyser_smoothing = analyser.smoothing;
        self.analyser_min_db = analyser.min_db;
        self.analyser_max_db = analyser.max_db;
    }

    fn analyser_config(&self) -> AnalyserConfig {
        AnalyserConfig {
            fft_size: self.analyser_fft_size,
            smoothing: self.analyser_smoothing,
            min_db: self.analyser_min_db,
            max_db: self.analyser_max_db,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            inbound_queue_capacity: self.inbound_queue_capacity,
            outbound_queue_capacity: self.outbound_queue_capacity,
            analyser: self.analyser_config(),
        }
    }
}

fn normalize_device_name(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults. A file that exists but
/// does not parse is reported before falling back.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => parse_settings(path, &raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            warn!(path = %path.display(), "cannot read settings, using defaults: {e}");
            AppSettings::default()
        }
    };
    settings.normalize();
    settings
}

fn parse_settings(path: &Path, raw: &str) -> AppSettings {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(path = %path.display(), "invalid settings file, using defaults: {e}");
        AppSettings::default()
    })
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
