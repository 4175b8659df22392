//! Lease: the handle for one acquired VM, its host-side files, and its
//! network reservation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::Specification;
use crate::image::Image;

/// Runtime-config keys. Owned by the driver; consumed on release.
pub mod runtime_keys {
    pub const DOMAIN_NAME: &str = "domain_name";
    pub const DOMAIN_XML: &str = "domain_xml";
    pub const OVERLAY_PATH: &str = "overlay_path";
    pub const BASE_IMAGE: &str = "base_image";
    pub const CONNECTION_URI: &str = "connection_uri";
    pub const NETWORK_NAME: &str = "network_name";
    pub const DHCP_MAC: &str = "dhcp_mac";
    pub const DHCP_IP: &str = "dhcp_ip";
    /// JSON array of staged setup-script names, in execution order.
    pub const SETUP_SCRIPTS: &str = "setup_scripts";
}

/// Metadata keys. Part of the contract consumed by instrumentation and
/// the firewall arbiter.
pub mod meta_keys {
    pub const DRIVER: &str = "driver";
    pub const DOMAIN_NAME: &str = "domain_name";
    pub const IMAGE_ID: &str = "image_id";
    pub const VM_IP: &str = "vm_ip";
    pub const VM_MAC: &str = "vm_mac";
    pub const VM_INTERFACE: &str = "vm_interface";
    pub const SETUP_MOUNT: &str = "setup_mount";
    pub const SAMPLE_MOUNT: &str = "sample_mount";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Pending,
    Running,
    Paused,
    Stale,
    Stopped,
}

/// Caller-supplied description of the sandbox to acquire.
#[derive(Debug, Clone)]
pub struct LeaseSpec {
    /// Desired domain name; empty lets the driver pick one.
    pub domain_name: Option<String>,
    /// Rejected by the driver; images freeze their specification.
    pub override_specification: Option<Specification>,
    pub image: Image,
    /// Host directory mounted into the guest as the sample volume.
    pub sample_dir: Option<PathBuf>,
}

impl LeaseSpec {
    pub fn new(image: Image) -> Self {
        Self {
            domain_name: None,
            override_specification: None,
            image,
            sample_dir: None,
        }
    }
}

/// A command to execute inside the sandbox. `timeout` of zero means
/// "no deadline".
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub path: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Lease {
    /// Unique within a daemon lifetime; equals the domain name.
    pub id: String,
    pub state: SandboxState,
    pub start_time: Option<DateTime<Utc>>,
    pub run_dir: PathBuf,
    /// Opaque to everything but the driver.
    pub runtime: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl Lease {
    pub fn runtime_value(&self, key: &str) -> Option<&str> {
        self.runtime.get(key).map(String::as_str)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Immutable view handed to observers (the start notifier). Keeps
    /// the worker the single writer of the lease itself.
    pub fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            id: self.id.clone(),
            state: self.state,
            start_time: self.start_time,
            run_dir: self.run_dir.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseSnapshot {
    pub id: String,
    pub state: SandboxState,
    pub start_time: Option<DateTime<Utc>>,
    pub run_dir: PathBuf,
    pub metadata: BTreeMap<String, String>,
}

impl LeaseSnapshot {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Deterministic, locally-administered unicast MAC for a lease id:
/// the KVM OUI `52:54:00` followed by the first three bytes of the
/// id's SHA-256.
pub fn derive_mac(lease_id: &str) -> String {
    let digest = Sha256::digest(lease_id.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}
