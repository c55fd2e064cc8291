pub mod discovery;
pub mod display;
pub mod error;
pub mod ipc;
pub mod media;
pub mod session;
pub mod shm;
pub mod surface;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::discovery::{Discovery, DiscoveryConfig, Naming};
use crate::ipc::IpcConfig;
use crate::shm::ShmConfig;

pub use error::{Result, TransportError};

/// Config file read when no explicit path is given. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "vst.toml";

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub naming: Naming,
    pub discovery: DiscoveryConfig,
    pub shm: ShmConfig,
    pub ipc: IpcConfig,
    pub video: VideoConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Pacing rate when neither the source nor the shared header carries one
    pub default_fps: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { default_fps: 30.0 }
    }
}

impl VideoConfig {
    /// Delay between frames for `fps`, falling back to `default_fps` for
    /// missing or nonsensical rates.
    pub fn frame_delay(&self, fps: Option<f64>) -> Duration {
        fps.and_then(delay_for)
            .or_else(|| delay_for(self.default_fps))
            .unwrap_or(Duration::from_millis(33))
    }
}

/// Longest pause accepted between two frames
const MAX_FRAME_DELAY: Duration = Duration::from_secs(10);

/// `None` for rates whose period is not a usable delay.
fn delay_for(fps: f64) -> Option<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(fps.recip())
        .ok()
        .filter(|delay| *delay <= MAX_FRAME_DELAY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub title: String,
    /// Log a progress line every this many frames
    pub progress_every: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title: "vst-consumer".into(),
            progress_every: 100,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` (or `vst.toml` if present), then
    /// `VST__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> color_eyre::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("VST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn discovery(&self) -> Discovery {
        Discovery::new(self.naming.clone(), self.discovery.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vst.toml");
        std::fs::write(
            &path,
            "[shm]\npoll_interval_ms = 10\n\n[discovery]\nsocket_dir = \"/run/vst\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.shm.poll_interval_ms, 10);
        assert_eq!(config.shm.max_poll_attempts, 100);
        assert_eq!(config.discovery.socket_dir, Path::new("/run/vst"));
        assert_eq!(config.naming, Naming::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/vst.toml"))).is_err());
    }

    #[test]
    fn frame_delay_falls_back_to_default() {
        let video = VideoConfig::default();
        assert_eq!(video.frame_delay(Some(50.0)), Duration::from_millis(20));
        assert_eq!(video.frame_delay(Some(0.0)), video.frame_delay(None));
    }

    #[test]
    fn absurd_rates_do_not_panic() {
        let video = VideoConfig::default();
        let fallback = video.frame_delay(None);
        assert_eq!(video.frame_delay(Some(1e-30)), fallback);
        assert_eq!(video.frame_delay(Some(f64::MIN_POSITIVE)), fallback);
        assert_eq!(video.frame_delay(Some(0.001)), fallback);
        assert_eq!(video.frame_delay(Some(f64::NAN)), fallback);
        assert_eq!(video.frame_delay(Some(f64::INFINITY)), fallback);
        assert_eq!(video.frame_delay(Some(0.5)), Duration::from_secs(2));

        let broken = VideoConfig { default_fps: 1e-30 };
        assert_eq!(broken.frame_delay(None), Duration::from_millis(33));
    }
}
