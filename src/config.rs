//! Client configuration.
//!
//! Layered lowest to highest: built-in defaults, the INI file, environment,
//! then command-line flags (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use configparser::ini::Ini;
use tracing::{debug, info};

use crate::capture::CaptureConfig;
use crate::error::ChannelError;
use crate::streaming::SessionConfig;
use crate::video::Quality;

/// Base address used when nothing is configured
pub const DEFAULT_API_BASE: &str = "http://localhost:8001";
pub const DEFAULT_STREAM_PATH: &str = "/ws/stream";

/// Environment variables for the API base address, highest priority first
pub const API_BASE_ENV: [&str; 2] = ["SHIP_API_BASE_URL", "NEXT_PUBLIC_API_BASE_URL"];

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Detector HTTP base address
    pub api_base: String,
    /// Path of the live stream endpoint under the base address
    pub stream_path: String,
    /// Camera device path or `synthetic://...`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub poll_interval_ms: u64,
    pub jpeg_quality: u8,
    pub metadata_timeout_ms: u64,
    /// Where the annotated preview JPEG is written, if anywhere
    pub preview_path: Option<PathBuf>,
    /// TrueType font for labels; the built-in bitmap font otherwise
    pub font_path: Option<PathBuf>,
    pub font_size: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        let device = if cfg!(feature = "v4l2") {
            "/dev/video0"
        } else {
            "synthetic://camera"
        };

        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            device: device.to_string(),
            width: 640,
            height: 480,
            poll_interval_ms: 100,
            jpeg_quality: 70,
            metadata_timeout_ms: 5000,
            preview_path: None,
            font_path: None,
            font_size: 16.0,
        }
    }
}

impl AppConfig {
    /// `<config dir>/ship-stream/config.ini`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ship-stream").join("config.ini"))
    }

    /// Defaults, then the config file, then the process environment.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        match path {
            Some(path) => config.apply_file(path)?,
            None => {
                if let Some(path) = Self::default_path().filter(|p| p.exists()) {
                    config.apply_file(&path)?;
                }
            }
        }

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        self.apply_ini(&ini)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(())
    }

    /// Apply INI text (sections `[api]` and `[stream]`).
    pub fn apply_ini_str(&mut self, text: &str) -> Result<()> {
        let mut ini = Ini::new();
        ini.read(text.to_string()).map_err(|e| anyhow!(e))?;
        self.apply_ini(&ini)
    }

    fn apply_ini(&mut self, ini: &Ini) -> Result<()> {
        if let Some(base) = ini.get("api", "base_url") {
            self.api_base = base;
        }
        if let Some(path) = ini.get("api", "stream_path") {
            self.stream_path = path;
        }

        if let Some(device) = ini.get("stream", "device") {
            self.device = device;
        }
        if let Some(width) = get_dimension(ini, "width")? {
            self.width = width;
        }
        if let Some(height) = get_dimension(ini, "height")? {
            self.height = height;
        }
        if let Some(interval) = get_number(ini, "poll_interval_ms")? {
            self.poll_interval_ms = interval;
        }
        if let Some(quality) = get_number(ini, "jpeg_quality")? {
            self.jpeg_quality = quality.clamp(1, 100) as u8;
        }
        if let Some(timeout) = get_number(ini, "metadata_timeout_ms")? {
            self.metadata_timeout_ms = timeout;
        }
        if let Some(preview) = ini.get("stream", "preview_path") {
            self.preview_path = Some(PathBuf::from(preview));
        }
        if let Some(font) = ini.get("stream", "font_path") {
            self.font_path = Some(PathBuf::from(font));
        }
        if let Some(size) = ini.get("stream", "font_size") {
            self.font_size = size
                .trim()
                .parse()
                .with_context(|| format!("font_size is not a number: {}", size))?;
        }
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let base = API_BASE_ENV
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()).map(|v| (*name, v)));

        if let Some((name, base)) = base {
            debug!("API base from {}", name);
            self.api_base = base;
        }
    }

    /// Detector channel address: the base address with `http` swapped for
    /// `ws` and the stream path appended.
    pub fn stream_url(&self) -> Result<String, ChannelError> {
        let base = self.api_base.trim().trim_end_matches('/');

        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(ChannelError::InvalidAddress(self.api_base.clone()));
        };

        Ok(format!("{}/{}", ws_base, self.stream_path.trim_start_matches('/')))
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            ..CaptureConfig::default()
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig, ChannelError> {
        Ok(SessionConfig {
            stream_url: self.stream_url()?,
            capture: self.capture_config(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            quality: Quality::Custom(self.jpeg_quality),
            metadata_timeout: Duration::from_millis(self.metadata_timeout_ms),
        })
    }
}

fn get_number(ini: &Ini, key: &str) -> Result<Option<u64>> {
    ini.getuint("stream", key)
        .map_err(|e| anyhow!("{}: {}", key, e))
}

fn get_dimension(ini: &Ini, key: &str) -> Result<Option<u32>> {
    get_number(ini, key)?
        .map(|value| {
            u32::try_from(value).with_context(|| format!("{} is out of range: {}", key, value))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api_base, "http://localhost:8001");
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.stream_url().unwrap(), "ws://localhost:8001/ws/stream");
    }

    #[test]
    fn test_stream_url_scheme_swap() {
        let mut config = AppConfig::default();

        config.api_base = "https://detector.example.com/".into();
        assert_eq!(config.stream_url().unwrap(), "wss://detector.example.com/ws/stream");

        config.api_base = "ws://10.0.0.5:9000".into();
        assert_eq!(config.stream_url().unwrap(), "ws://10.0.0.5:9000/ws/stream");

        config.api_base = "ftp://nope".into();
        assert!(matches!(config.stream_url(), Err(ChannelError::InvalidAddress(_))));
    }

    #[test]
    fn test_ini_overrides_defaults() {
        let mut config = AppConfig::default();
        config
            .apply_ini_str(
                "[api]\nbase_url = http://gpu-box:8001\n\n[stream]\ndevice = /dev/video2\nwidth = 1280\nheight = 720\njpeg_quality = 85\npreview_path = /tmp/preview.jpg\n",
            )
            .unwrap();

        assert_eq!(config.api_base, "http://gpu-box:8001");
        assert_eq!(config.device, "/dev/video2");
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.preview_path, Some(PathBuf::from("/tmp/preview.jpg")));
        // Untouched keys keep their defaults
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_ini_rejects_bad_numbers() {
        let mut config = AppConfig::default();
        assert!(config.apply_ini_str("[stream]\nwidth = wide\n").is_err());
    }

    #[test]
    fn test_ini_rejects_oversized_dimensions() {
        let mut config = AppConfig::default();
        let err = config
            .apply_ini_str("[stream]\nwidth = 4294967936\n")
            .unwrap_err();
        assert!(err.to_string().contains("width"));
        assert_eq!(config.width, 640);

        assert!(config.apply_ini_str("[stream]\nheight = 99999999999\n").is_err());
        assert_eq!(config.height, 480);
    }

    #[test]
    fn test_env_precedence() {
        let env: HashMap<&str, &str> = [
            ("SHIP_API_BASE_URL", "http://primary:8001"),
            ("NEXT_PUBLIC_API_BASE_URL", "http://legacy:8001"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.api_base, "http://primary:8001");

        let mut config = AppConfig::default();
        config.apply_env(|name| {
            (name == "NEXT_PUBLIC_API_BASE_URL").then(|| "http://legacy:8001".to_string())
        });
        assert_eq!(config.api_base, "http://legacy:8001");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[stream]\npoll_interval_ms = 250\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.poll_interval_ms, 250);

        assert!(AppConfig::load(Some(&dir.path().join("missing.ini"))).is_err());
    }

    #[test]
    fn test_session_config() {
        let config = AppConfig {
            device: "synthetic://cam".into(),
            jpeg_quality: 60,
            ..AppConfig::default()
        };
        let session = config.session_config().unwrap();
        assert_eq!(session.capture.device, "synthetic://cam");
        assert_eq!(session.quality.jpeg_quality(), 60);
        assert_eq!(session.poll_interval, Duration::from_millis(100));
    }
}
