//! Configuration management.
use crate::error::AcqResult;
use config::Config;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub acquisition: AcquisitionSettings,
}

/// Tunables for the acquisition pipeline.
///
/// `settle_delay_ms` is the pause before a capture is automatically
/// restarted after the reader finishes (e.g. following a mid-run channel
/// reconfiguration). The device needs to reach a stable state before the
/// next acquisition; the exact duration is empirically tuned, not a hard
/// requirement.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub settle_delay_ms: u64,
    pub command_queue_capacity: usize,
    pub control_channel_capacity: usize,
    pub event_channel_capacity: usize,
    /// Buffer capacity in samples when the effective sampling frequency is
    /// at least this many samples per second.
    pub max_buffer_samples: usize,
    /// Buffer capacity in samples for low-rate captures.
    pub min_buffer_samples: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            command_queue_capacity: 32,
            control_channel_capacity: 16,
            event_channel_capacity: 64,
            max_buffer_samples: 64,
            min_buffer_samples: 8,
        }
    }
}

impl Settings {
    /// Loads settings from `config/<name>` (TOML, optional) overlaid with
    /// `IIO_ACQ__`-prefixed environment variables. A `name` containing a
    /// path separator is used as-is instead of resolving under `config/`.
    pub fn new(config_name: Option<&str>) -> AcqResult<Self> {
        let name = config_name.unwrap_or("default");
        let config_path = if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            name.to_string()
        } else {
            format!("config/{name}")
        };
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("IIO_ACQ").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }
}
