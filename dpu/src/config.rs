/*!
Configuration management for the DPU readout controller.

Everything that is camera or installation specific is injected through this
configuration: the processor never consults global state. The timing section
mirrors the readout cycle of the front-end; tests shrink these values to run
the loop at full speed.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpuConfig {
    pub processor: ProcessorConfig,
    pub camera: CameraConfig,
    pub timing: TimingConfig,
    /// Camera specific FPGA default register values, written to the
    /// front-end on request
    #[serde(default)]
    pub fpga_defaults: Vec<FpgaDefault>,
}

impl DpuConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            camera: CameraConfig::default(),
            timing: TimingConfig::default(),
            fpga_defaults: Vec::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: DpuConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for DpuConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Processor specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Registration name used for stored data
    pub origin: String,

    /// Base directory for stored readout data
    pub storage_directory: String,

    /// Enable file storage (disable for live monitoring only)
    pub enable_storage: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            origin: "SPW".to_string(),
            storage_directory: "./data".to_string(),
            enable_storage: true,
        }
    }
}

/// Camera specific setup values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Default CCD readout order, as CCD numbers (1 to 4)
    pub default_ccd_readout_order: [u8; 4],

    /// 2-bit register code for each CCD number (index = CCD number - 1)
    pub ccd_id_to_bin: [u8; 4],
}

impl CameraConfig {
    /// Pack a readout order given as CCD numbers into the 8-bit register
    /// value, 2 bits per readout slot
    pub fn encode_readout_order(&self, order: &[u8; 4]) -> u8 {
        let mut encoded = 0u8;
        for (idx, ccd) in order.iter().enumerate() {
            let code = self.ccd_id_to_bin[(*ccd as usize - 1).min(3)] & 0b11;
            encoded |= code << (idx * 2);
        }
        encoded
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            default_ccd_readout_order: [1, 2, 3, 4],
            ccd_id_to_bin: [0, 1, 2, 3],
        }
    }
}

/// Readout cycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long to wait for the next timecode before giving up on this cycle
    pub timecode_timeout_ms: u64,

    /// Wait for a single non-timecode packet (housekeeping, data)
    pub packet_timeout_ms: u64,

    /// Guard interval after the first timecode during initialisation, after
    /// which the commanding window is guaranteed to be open
    pub init_guard_ms: u64,

    /// Deadline for the data phase, measured from timecode reception. After
    /// this the front-end discards commanding.
    pub data_deadline_ms: u64,

    /// Settle time before reading the updated housekeeping memory area
    pub hk_settle_ms: u64,

    /// Nominal duration of one readout cycle, used by the supervisor when
    /// waiting for the processor to finish
    pub cycle_period_ms: u64,
}

impl TimingConfig {
    pub fn timecode_timeout(&self) -> Duration {
        Duration::from_millis(self.timecode_timeout_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn init_guard(&self) -> Duration {
        Duration::from_millis(self.init_guard_ms)
    }

    pub fn data_deadline(&self) -> Duration {
        Duration::from_millis(self.data_deadline_ms)
    }

    pub fn hk_settle(&self) -> Duration {
        Duration::from_millis(self.hk_settle_ms)
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timecode_timeout_ms: 100,
            packet_timeout_ms: 1000,
            init_guard_ms: 4200,
            data_deadline_ms: 5250,
            hk_settle_ms: 12,
            cycle_period_ms: 6500,
        }
    }
}

/// One FPGA default register value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpgaDefault {
    /// Register name, e.g. `reg_0_config`
    pub register: String,

    /// The full 32-bit register word
    pub value: u32,
}
