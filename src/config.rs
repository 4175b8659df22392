//! Process configuration, loaded from environment variables (with
//! `.env` support). Per-analysis options can override most of these on
//! the wire; the config provides the defaults.

use std::path::PathBuf;

use crate::daemon::DEFAULT_SOCKET_PATH;

pub struct Config {
    pub socket_path: PathBuf,
    pub image_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_root: PathBuf,
    pub connection_uri: String,
    /// The lab network the arbiters operate on.
    pub network: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("BOTTLE_SOCKET").ok().as_deref(),
            std::env::var("BOTTLE_IMAGE_DIR").ok().as_deref(),
            std::env::var("BOTTLE_ARTIFACT_DIR").ok().as_deref(),
            std::env::var("BOTTLE_RUN_DIR").ok().as_deref(),
            std::env::var("BOTTLE_LOG_DIR").ok().as_deref(),
            std::env::var("BOTTLE_CONNECTION_URI").ok().as_deref(),
            std::env::var("BOTTLE_NETWORK").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from
    /// env vars). Used directly in tests to avoid mutating the
    /// process-global environment.
    pub fn from_raw_values(
        socket: Option<&str>,
        image_dir: Option<&str>,
        artifact_dir: Option<&str>,
        run_dir: Option<&str>,
        log_root: Option<&str>,
        connection_uri: Option<&str>,
        network: Option<&str>,
    ) -> Self {
        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(String::from);

        // Data directories default under the operator's home so bottle
        // works without system-wide directories; the daemon socket keeps
        // its well-known path.
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(".bottle");

        Config {
            socket_path: non_empty(socket)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            image_dir: non_empty(image_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("images")),
            artifact_dir: non_empty(artifact_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("artifacts")),
            run_dir: non_empty(run_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("run")),
            log_root: non_empty(log_root)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join("logs")),
            connection_uri: non_empty(connection_uri)
                .unwrap_or_else(|| "qemu:///system".to_string()),
            network: non_empty(network).unwrap_or_else(|| "lab".to_string()),
        }
    }
}
