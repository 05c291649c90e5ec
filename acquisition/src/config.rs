/*!
Configuration management for the acquisition application.
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared::devices::check_exposure_time;
use shared::exposure::ImageType;
use shared::protocol::{TIMER_CARD_MAX_EXPOSURE_SECONDS, TIMING_UNIT_MAX_EXPOSURE_SECONDS};
use shared::simulator::SimulatorSettings;
use shared::timing_unit::TimingUnitTimeouts;
use std::path::Path;

use crate::frame_sync::SyncTuning;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub timing: SyncTuning,
    #[serde(default)]
    pub timing_unit: TimingUnitTimeouts,
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Check settings that would otherwise fail only once hardware is open
    pub fn validate(&self) -> Result<()> {
        let acquisition = &self.acquisition;
        check_exposure_time(
            acquisition.exposure_time_seconds,
            acquisition.hardware_path.max_exposure_seconds(),
        )
        .with_context(|| format!("Exposure time not supported by the {:?} path", acquisition.hardware_path))?;

        if acquisition.channel_buffer_size == 0 {
            bail!("channel_buffer_size must be at least 1");
        }
        if acquisition.exposure_count == Some(0) {
            bail!("exposure_count must be at least 1 when set");
        }
        if let Err(e) = self.timing.validate() {
            bail!("Invalid timing settings: {}", e);
        }
        if acquisition.simulate_hardware {
            self.simulator
                .validate()
                .with_context(|| "Invalid simulator settings")?;
        } else if self.devices.gps_baud_rate == 0 || self.devices.timing_unit_baud_rate == 0 {
            bail!("Serial baud rates must be non-zero");
        }
        Ok(())
    }
}

/// Which timing hardware generates the sync pulses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwarePath {
    /// Parallel-port timer card
    LegacyTimerCard,
    /// GPS-disciplined USB timing unit
    UsbTimingUnit,
}

impl HardwarePath {
    pub fn max_exposure_seconds(self) -> u32 {
        match self {
            HardwarePath::LegacyTimerCard => TIMER_CARD_MAX_EXPOSURE_SECONDS,
            HardwarePath::UsbTimingUnit => TIMING_UNIT_MAX_EXPOSURE_SECONDS,
        }
    }
}

/// Acquisition run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Exposure length; 0 stops the sync pulses
    pub exposure_time_seconds: u32,

    pub image_type: ImageType,

    /// Use the in-process simulator instead of serial devices
    pub simulate_hardware: bool,

    pub hardware_path: HardwarePath,

    /// Stop after this many exposures; run until interrupted when unset
    pub exposure_count: Option<u64>,

    /// Query the timing unit for its last pulse times after every exposure
    pub report_timing_status: bool,

    /// Completed exposures buffered for the consumer thread
    pub channel_buffer_size: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exposure_time_seconds: 5,
            image_type: ImageType::Target,
            simulate_hardware: true,
            hardware_path: HardwarePath::UsbTimingUnit,
            exposure_count: None,
            report_timing_status: true,
            channel_buffer_size: 16,
        }
    }
}

/// Serial device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// GPS receiver serial port
    pub gps_port: String,
    pub gps_baud_rate: u32,

    /// Virtual COM port of the USB timing unit
    pub timing_unit_port: String,
    pub timing_unit_baud_rate: u32,

    /// Serial port whose CTS/DCD lines carry the sync and 1PPS pulses
    pub pulse_port: String,

    /// Command run to resync the system clock; empty disables resyncing
    pub resync_command: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gps_port: "/dev/ttyS0".to_string(),
            gps_baud_rate: 9600,
            timing_unit_port: "/dev/ttyUSB0".to_string(),
            timing_unit_baud_rate: 115_200,
            pulse_port: "/dev/ttyS1".to_string(),
            resync_command: vec!["ntpdate".to_string(), "-u".to_string(), "pool.ntp.org".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let original_config = AppConfig::new();

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        // Compare (using debug format since we don't have PartialEq)
        assert_eq!(format!("{:?}", original_config), format!("{:?}", loaded_config));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.acquisition.exposure_time_seconds, 5);
        assert_eq!(config.acquisition.hardware_path, HardwarePath::UsbTimingUnit);
        assert!(config.acquisition.simulate_hardware);
        assert_eq!(config.acquisition.exposure_count, None);

        assert_eq!(config.timing.measurement_tolerance_ms, 50);
        assert_eq!(config.timing.gps_valid_tolerance_ms, 500);
        assert_eq!(config.timing.initial_sync_timeout_ms, 31_000);
        assert_eq!(config.timing_unit.exposure_ms, 1100);
        assert_eq!(config.devices.gps_baud_rate, 9600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [acquisition]
            exposure_time_seconds = 12
            hardware_path = "legacy_timer_card"
            image_type = "dark"
            "#,
        )
        .unwrap();

        assert_eq!(config.acquisition.exposure_time_seconds, 12);
        assert_eq!(config.acquisition.image_type, ImageType::Dark);
        assert_eq!(config.timing.sleep_slice_ms, 10);
        assert_eq!(config.simulator.system_offset_ms, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exposure_bounds_follow_hardware_path() {
        let mut config = AppConfig::new();
        config.acquisition.exposure_time_seconds = 45;
        assert!(config.validate().is_ok());

        config.acquisition.hardware_path = HardwarePath::LegacyTimerCard;
        assert!(config.validate().is_err());

        config.acquisition.exposure_time_seconds = 30;
        assert!(config.validate().is_ok());

        config.acquisition.hardware_path = HardwarePath::UsbTimingUnit;
        config.acquisition.exposure_time_seconds = 10_000;
        assert!(config.validate().is_err());
    }
}
