//! Embedded OS specification catalog.
//!
//! A specification is the build-time description of a sandbox OS: the
//! domain profile the hypervisor needs, the run profile the driver needs,
//! and the setup scripts shipped to the guest on the setup volume. The
//! catalog is compiled in and read-only; images snapshot the specification
//! they were built from.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::arch::Arch;

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("specification not found: {0}")]
    NotFound(String),

    #[error("malformed embedded specification {name}: {source}")]
    Malformed {
        name: &'static str,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootMethod {
    Bios,
    KernelDirect,
}

/// What the hypervisor needs to shape the virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainProfile {
    pub arch: Arch,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub cpu_model: Option<String>,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_bus: String,
    pub disk_target: String,
    pub cd_bus: String,
    /// Device name prefix for CD-attached volumes, e.g. "sd".
    pub cd_prefix: String,
    pub setup_device_letter: char,
    pub sample_device_letter: char,
    pub network_model: String,
}

/// What the driver needs to run an instance of the image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProfile {
    #[serde(default)]
    pub ram_mb: Option<u64>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    pub boot: BootMethod,
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    #[serde(default)]
    pub kernel_cmdline: Option<String>,
    pub network_name: String,
    pub domain_prefix: String,
}

/// A setup script shipped on the setup volume and executed during Start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specification {
    pub id: String,
    pub version: String,
    pub os_release: String,
    pub domain: DomainProfile,
    pub run: RunProfile,
    #[serde(default)]
    pub setup_files: Vec<SetupFile>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Specification {
    /// Effective RAM for a run: run profile first, domain profile fallback.
    pub fn effective_ram_mb(&self) -> u64 {
        self.run.ram_mb.unwrap_or(self.domain.ram_mb)
    }

    pub fn effective_vcpus(&self) -> u32 {
        self.run.vcpus.unwrap_or(self.domain.vcpus)
    }

    /// Guest device name for the setup volume, e.g. "sda".
    pub fn setup_device(&self) -> String {
        format!("{}{}", self.domain.cd_prefix, self.domain.setup_device_letter)
    }

    pub fn sample_device(&self) -> String {
        format!("{}{}", self.domain.cd_prefix, self.domain.sample_device_letter)
    }
}

const EMBEDDED: &[(&str, &str)] = &[
    (
        "debian-bookworm-x86_64.yaml",
        include_str!("../../assets/specs/debian-bookworm-x86_64.yaml"),
    ),
    (
        "debian-bookworm-aarch64.yaml",
        include_str!("../../assets/specs/debian-bookworm-aarch64.yaml"),
    ),
    (
        "openwrt-armv7l.yaml",
        include_str!("../../assets/specs/openwrt-armv7l.yaml"),
    ),
];

/// Read-only view over the embedded catalog.
pub struct SpecificationRepository {
    specs: Vec<Specification>,
}

impl SpecificationRepository {
    pub fn embedded() -> Result<Self, CatalogError> {
        let mut specs = Vec::with_capacity(EMBEDDED.len());
        for &(name, raw) in EMBEDDED {
            let spec: Specification =
                serde_yaml::from_str(raw).map_err(|source| CatalogError::Malformed {
                    name,
                    source,
                })?;
            specs.push(spec);
        }
        Ok(Self { specs })
    }

    pub fn list(&self) -> &[Specification] {
        &self.specs
    }

    pub fn get(&self, id: &str) -> Result<&Specification, CatalogError> {
        self.specs
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn find_by_arch(&self, arch: Arch) -> Vec<&Specification> {
        self.specs.iter().filter(|s| s.domain.arch == arch).collect()
    }
}
