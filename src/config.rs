//! Configuration management.
//!
//! Settings are loaded from built-in defaults plus an optional TOML file,
//! then validated before the observation starts. Nothing is re-read at
//! runtime; the drain loop and control listener see a frozen snapshot.

use crate::error::{AppResult, TriggerError};
use config::Config;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Size of one sequence unit in bytes. Sequence positions advance by
/// `block_size / UNIT_BYTES` per block.
pub const UNIT_BYTES: u64 = 8192;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub control: ControlSettings,
    pub capture: CaptureSettings,
    pub transport: TransportSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub log_level: String,
    /// CPU core to pin the process to. `None` leaves scheduling to the OS.
    pub core: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    pub listen_address: IpAddr,
    pub listen_port: u16,
    /// Sequence units per command count. Defaults to `units_per_block`.
    pub scale: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureSettings {
    /// Transfer block size in bytes. Must be a positive multiple of
    /// [`UNIT_BYTES`].
    pub block_size: u64,
    /// Input ring occupancy required before a block is consumed.
    pub fill_threshold: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub input_blocks: u32,
    pub output_blocks: u32,
}

impl Settings {
    /// Load settings from defaults plus an optional TOML file.
    pub fn load(config_file: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder()
            .set_default("application.log_level", "info")?
            .set_default("control.listen_address", "0.0.0.0")?
            .set_default("control.listen_port", 11223_i64)?
            .set_default("capture.block_size", 2_415_919_104_i64)?
            .set_default("capture.fill_threshold", 0.7_f64)?
            .set_default("transport.input_path", "/dev/shm/trigger_dump_in.ring")?
            .set_default("transport.output_path", "/dev/shm/trigger_dump_out.ring")?
            .set_default("transport.input_blocks", 8_i64)?
            .set_default("transport.output_blocks", 8_i64)?;

        if let Some(name) = config_file {
            builder = builder.add_source(config::File::with_name(name));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        if self.capture.block_size == 0 || self.capture.block_size % UNIT_BYTES != 0 {
            return Err(TriggerError::Configuration(format!(
                "block_size must be a positive multiple of {} bytes, got {}",
                UNIT_BYTES, self.capture.block_size
            )));
        }
        if !(0.0..1.0).contains(&self.capture.fill_threshold) {
            return Err(TriggerError::Configuration(format!(
                "fill_threshold must lie in [0, 1), got {}",
                self.capture.fill_threshold
            )));
        }
        if self.transport.input_blocks < 2 || self.transport.output_blocks < 2 {
            return Err(TriggerError::Configuration(
                "transport rings need at least 2 blocks".into(),
            ));
        }
        if self.control.scale == Some(0) {
            return Err(TriggerError::Configuration(
                "control.scale must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Sequence units covered by one block.
    pub fn units_per_block(&self) -> u64 {
        self.capture.block_size / UNIT_BYTES
    }

    /// Sequence units per control-command count.
    pub fn command_scale(&self) -> u64 {
        self.control.scale.unwrap_or_else(|| self.units_per_block())
    }

    /// Socket address the control listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.control.listen_address, self.control.listen_port)
    }
}
