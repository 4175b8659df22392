//! Artifact store: opaque files (disk images, kernels, companions)
//! copied under one directory with a JSON sidecar describing them.
//! Artifacts are referenced everywhere else by `file://` URI.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed artifact uri: {0}")]
    BadUri(String),

    #[error("malformed sidecar {path}: {source}")]
    BadSidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub uri: String,
    pub checksum: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Resolve the artifact's `file://` URI to a host path.
    pub fn path(&self) -> Result<PathBuf, ArtifactError> {
        uri_to_path(&self.uri)
    }

    /// File extension of the stored artifact, if any.
    pub fn extension(&self) -> Option<String> {
        self.path()
            .ok()?
            .extension()
            .map(|e| e.to_string_lossy().to_string())
    }
}

pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

pub fn uri_to_path(uri: &str) -> Result<PathBuf, ArtifactError> {
    uri.strip_prefix("file://")
        .filter(|rest| rest.starts_with('/'))
        .map(PathBuf::from)
        .ok_or_else(|| ArtifactError::BadUri(uri.to_string()))
}

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Copy `src` into the store under a fresh id, preserving the
    /// extension, and write the sidecar next to it.
    pub fn store(&self, src: &Path, content_type: &str) -> Result<Artifact, ArtifactError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let id = uuid::Uuid::new_v4().to_string();
        let file_name = match src.extension() {
            Some(ext) => format!("{id}.{}", ext.to_string_lossy()),
            None => id,
        };
        let dest = self.dir.join(&file_name);

        std::fs::copy(src, &dest).map_err(io_err(src))?;
        let checksum = sha256_file(&dest)?;

        let artifact = Artifact {
            uri: file_uri(&dest),
            checksum,
            content_type: content_type.to_string(),
            created_at: Utc::now(),
        };

        let sidecar = self.dir.join(format!("{file_name}.json"));
        let doc = serde_json::to_vec_pretty(&artifact).expect("artifact serializes");
        std::fs::write(&sidecar, doc).map_err(io_err(&sidecar))?;

        tracing::debug!(uri = %artifact.uri, "stored artifact");
        Ok(artifact)
    }

    /// Delete the stored file and its sidecar. Missing files are fine.
    pub fn remove(&self, artifact: &Artifact) -> Result<(), ArtifactError> {
        let path = artifact.path()?;
        let sidecar = PathBuf::from(format!("{}.json", path.display()));
        for p in [path, sidecar] {
            match std::fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&p)(e)),
            }
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_copies_and_writes_sidecar() {
        let src_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("disk.qcow2");
        std::fs::write(&src, b"not really a disk").unwrap();

        let store = ArtifactStore::new(store_dir.path());
        let artifact = store.store(&src, "application/x-qemu-disk").unwrap();

        let stored = artifact.path().unwrap();
        assert!(stored.exists());
        assert_eq!(stored.extension().unwrap(), "qcow2");
        assert!(PathBuf::from(format!("{}.json", stored.display())).exists());
        assert_eq!(artifact.checksum.len(), 64);
    }

    #[test]
    fn remove_is_idempotent() {
        let src_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("k.img");
        std::fs::write(&src, b"kernel").unwrap();

        let store = ArtifactStore::new(store_dir.path());
        let artifact = store.store(&src, "application/octet-stream").unwrap();
        store.remove(&artifact).unwrap();
        store.remove(&artifact).unwrap();
        assert!(!artifact.path().unwrap().exists());
    }

    #[test]
    fn uri_round_trip() {
        let p = Path::new("/var/lib/bottle/artifacts/x.qcow2");
        assert_eq!(uri_to_path(&file_uri(p)).unwrap(), p);
    }

    #[test]
    fn relative_or_foreign_uris_are_rejected() {
        assert!(uri_to_path("file://relative/path").is_err());
        assert!(uri_to_path("https://example.com/x").is_err());
    }

    #[test]
    fn checksum_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a");
        std::fs::write(&f, b"abc").unwrap();
        assert_eq!(
            sha256_file(&f).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
