//! Architecture tags.
//!
//! A closed set of canonical values, a normalizer for the aliases that
//! show up in image metadata and operator input, and a rule-based
//! classifier that derives a tag from `file(1)`'s human-readable
//! description of a sample.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ArchError {
    #[error("unknown architecture: {0}")]
    Unknown(String),

    #[error("could not determine architecture from: {0}")]
    Inconclusive(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "i686")]
    I686,
    Aarch64,
    Armv7l,
    Ppc64le,
    S390x,
    Mips,
    Mipsel,
    Mips64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i686",
            Arch::Aarch64 => "aarch64",
            Arch::Armv7l => "armv7l",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
            Arch::Mips => "mips",
            Arch::Mipsel => "mipsel",
            Arch::Mips64 => "mips64",
        }
    }

    /// The canonical tag for the machine bottle itself runs on.
    pub fn host() -> Result<Arch, ArchError> {
        normalize(std::env::consts::ARCH)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

/// Map an architecture name, canonical or alias, to its canonical tag.
/// Idempotent: canonical tags map to themselves.
pub fn normalize(name: &str) -> Result<Arch, ArchError> {
    match name.trim().to_lowercase().as_str() {
        "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Arch::X86_64),
        "i686" | "i586" | "i486" | "i386" | "x86" => Ok(Arch::I686),
        "aarch64" | "arm64" => Ok(Arch::Aarch64),
        "armv7l" | "armv7" | "armhf" | "arm" => Ok(Arch::Armv7l),
        "ppc64le" | "ppc64el" => Ok(Arch::Ppc64le),
        "s390x" => Ok(Arch::S390x),
        "mips64" | "mips64el" => Ok(Arch::Mips64),
        "mipsel" | "mipsle" => Ok(Arch::Mipsel),
        "mips" => Ok(Arch::Mips),
        other => Err(ArchError::Unknown(other.to_string())),
    }
}

/// Derive a canonical tag from a `file(1)` description of the sample.
///
/// Scripts have no architecture of their own and run on whatever the
/// image provides, so "shell script" maps to the host architecture.
/// Order matters: the 64-bit MIPS and ARM spellings contain their 32-bit
/// counterparts as substrings.
pub fn detect(description: &str) -> Result<Arch, ArchError> {
    let d = description.to_lowercase();

    if d.contains("shell script") || d.contains("perl script") || d.contains("python script") {
        return Arch::host();
    }
    if d.contains("x86-64") || d.contains("x86_64") {
        return Ok(Arch::X86_64);
    }
    if d.contains("intel 80386") || d.contains("intel i386") {
        return Ok(Arch::I686);
    }
    if d.contains("aarch64") || d.contains("arm64") {
        return Ok(Arch::Aarch64);
    }
    if d.contains("arm,") || d.contains("arm eabi") || d.contains("arm aarch32") {
        return Ok(Arch::Armv7l);
    }
    if d.contains("ibm s/390") {
        return Ok(Arch::S390x);
    }
    if d.contains("mips64") {
        return Ok(Arch::Mips64);
    }
    if d.contains("mips") {
        if d.contains("lsb") {
            return Ok(Arch::Mipsel);
        }
        if d.contains("msb") {
            return Ok(Arch::Mips);
        }
    }
    if d.contains("powerpc") && d.contains("64") && d.contains("lsb") {
        return Ok(Arch::Ppc64le);
    }

    Err(ArchError::Inconclusive(description.to_string()))
}
