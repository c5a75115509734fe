//! Configuration system for the Strata composer service
//!
//! Loads configuration from TOML file at `~/.config/strata/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{NSECS_PER_MSEC, Nsecs};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub composition: CompositionConfig,
    pub vsync: VsyncConfig,
    pub transactions: TransactionConfig,
    pub security: SecurityConfig,
    pub debug: DebugConfig,
    pub display: DisplayConfig,
    pub ipc: IpcConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("strata");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Composition pipeline limits and modes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    /// Surface creation fails past this count
    pub max_surfaces: usize,
    /// Virtual displays larger than this get no hardware composer id (0 = unlimited)
    pub max_virtual_display_dimension: u32,
    /// On a missed vsync, latch buffers but skip hardware submission
    pub drop_missed_frames: bool,
    /// Expected-present times closer than this to the previous one count as repeated
    pub missed_frame_slack_ns: Nsecs,
    /// Log frame statistics every N page flips (0 = never)
    pub log_frame_stats_period: u64,
    /// Maximum number of simultaneous client connections
    pub max_clients: usize,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            max_surfaces: 4096,
            max_virtual_display_dimension: 4096,
            drop_missed_frames: false,
            missed_frame_slack_ns: 0,
            log_frame_stats_period: 60 * 60,
            max_clients: 256,
        }
    }
}

/// Vsync model and phase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VsyncConfig {
    /// Phase offset for client frame production
    pub app_phase_offset_ns: Nsecs,
    /// Phase offset at which composition starts
    pub composer_phase_offset_ns: Nsecs,
    /// Added to every present fence timestamp
    pub present_time_offset_ns: Nsecs,
    /// Keep hardware vsync on instead of tracking present fences
    pub ignore_present_fences: bool,
    pub min_resync_samples: usize,
    pub max_resync_samples: usize,
    pub max_resync_samples_without_present: usize,
    pub num_present_samples: usize,
    /// Mean squared phase error (ns^2) above which the model resyncs
    pub error_threshold: i64,
    /// Synthetic vsync interval while the screen is off
    pub screen_off_vsync_interval_ms: u64,
}

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            app_phase_offset_ns: NSECS_PER_MSEC,
            composer_phase_offset_ns: 4 * NSECS_PER_MSEC,
            present_time_offset_ns: 0,
            ignore_present_fences: false,
            min_resync_samples: 3,
            max_resync_samples: 32,
            max_resync_samples_without_present: 4,
            num_present_samples: 8,
            error_threshold: 160_000_000_000,
            screen_off_vsync_interval_ms: 16,
        }
    }
}

impl VsyncConfig {
    pub fn screen_off_interval(&self) -> Duration {
        Duration::from_millis(self.screen_off_vsync_interval_ms.max(1))
    }
}

/// Bounded waits in the transaction protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub sync_timeout_ms: u64,
    pub animation_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 5000,
            animation_timeout_ms: 5000,
        }
    }
}

impl TransactionConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn animation_timeout(&self) -> Duration {
        Duration::from_millis(self.animation_timeout_ms)
    }
}

/// Caller uids allowed per capability; the service's own uid is always allowed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub trusted_uids: Vec<u32>,
    pub capture_uids: Vec<u32>,
    pub debug_uids: Vec<u32>,
}

/// Diagnostic switches, also reachable through debug commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// 0 = off, 1 = flash once, >1 = flash and hold for N ms
    pub show_updates: u32,
    pub disable_hwc: bool,
    pub force_full_damage: bool,
    pub disable_transform_hint: bool,
}

/// Headless display backend parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: f32,
    pub xdpi: f32,
    pub ydpi: f32,
    /// 0 derives density from xdpi
    pub density: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_rate: 60.0,
            xdpi: 160.0,
            ydpi: 160.0,
            density: 0,
        }
    }
}

/// Request socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_name: String,
    pub max_message_bytes: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_name: "strata.sock".into(),
            max_message_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            "[composition]\ndrop_missed_frames = true\n\n[transactions]\nsync_timeout_ms = 250\n",
        )
        .unwrap();
        assert!(config.composition.drop_missed_frames);
        assert_eq!(config.composition.max_surfaces, 4096);
        assert_eq!(config.transactions.sync_timeout(), Duration::from_millis(250));
        assert_eq!(config.vsync.min_resync_samples, 3);
    }

    #[test]
    fn test_default_config_serializes() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.ipc.socket_name, "strata.sock");
        assert!(back.vsync.composer_phase_offset_ns > back.vsync.app_phase_offset_ns);
    }
}
