//! Instrumentation config file: a YAML list of instrument definitions.
//!
//! ```yaml
//! - type: shell-command
//!   command: "tcpdump -i {{ .VmInterface }} -w {{ .LogDir }}/capture.pcap"
//!   requires: [VmInterface, LogDir]
//! - type: network-sensor
//!   binary: /usr/bin/suricata
//!   config-template: |
//!     af-packet:
//!       - interface: {{ .VmInterface }}
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::sensor::NetworkSensorInstrument;
use super::shell::ShellCommandInstrument;
use super::{Instrument, InstrumentError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InstrumentConfig {
    ShellCommand {
        command: String,
        #[serde(default)]
        requires: Vec<String>,
        #[serde(default = "default_true", rename = "redirect-output")]
        redirect_output: bool,
    },
    NetworkSensor {
        binary: PathBuf,
        #[serde(rename = "config-template")]
        config_template: String,
        #[serde(default)]
        requires: Vec<String>,
    },
}

impl InstrumentConfig {
    pub fn build(self) -> Box<dyn Instrument> {
        match self {
            InstrumentConfig::ShellCommand {
                command,
                requires,
                redirect_output,
            } => Box::new(ShellCommandInstrument::new(command, requires, redirect_output)),
            InstrumentConfig::NetworkSensor {
                binary,
                config_template,
                requires,
            } => Box::new(NetworkSensorInstrument::new(binary, config_template, requires)),
        }
    }
}

/// Load the instrument set from a YAML config file.
pub fn load_instruments(path: &Path) -> Result<Vec<Box<dyn Instrument>>, InstrumentError> {
    let raw = std::fs::read_to_string(path).map_err(|source| InstrumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let configs: Vec<InstrumentConfig> =
        serde_yaml::from_str(&raw).map_err(|e| InstrumentError::BadConfig {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    Ok(configs.into_iter().map(InstrumentConfig::build).collect())
}
