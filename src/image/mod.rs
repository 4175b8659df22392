//! Image metadata repository.
//!
//! An image is the bootable result of the (external) build pipeline: a
//! disk artifact plus the specification snapshot it was built from,
//! frozen at build time. Metadata documents live as one JSON file per
//! image under the image directory; the artifacts they reference live in
//! the artifact store.

pub mod artifact;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arch::Arch;
use crate::catalog::Specification;

pub use artifact::{Artifact, ArtifactError, ArtifactStore};

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("no image available for architecture {0}")]
    NoImage(Arch),

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed image document {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ImageError + '_ {
    move |source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Specification snapshot frozen at build time.
    pub specification: Specification,
    /// The bootable disk.
    pub artifact: Artifact,
    #[serde(default)]
    pub companions: Vec<Artifact>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Image {
    pub fn arch(&self) -> Arch {
        self.specification.domain.arch
    }
}

/// One JSON document per image under `dir`.
pub struct ImageRepository {
    dir: PathBuf,
}

impl ImageRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn document_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// All images, newest first.
    pub fn list(&self) -> Result<Vec<Image>, ImageError> {
        let mut images = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(images),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(&path).map_err(io_err(&path))?;
            match serde_json::from_slice::<Image>(&raw) {
                Ok(image) => images.push(image),
                Err(source) => {
                    tracing::warn!(path = %path.display(), error = %source, "skipping malformed image document");
                }
            }
        }
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(images)
    }

    /// Images for one architecture, newest first.
    pub fn find_by_arch(&self, arch: Arch) -> Result<Vec<Image>, ImageError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.arch() == arch)
            .collect())
    }

    /// The image an analysis for `arch` should use: first match, newest
    /// first.
    pub fn select_for_arch(&self, arch: Arch) -> Result<Image, ImageError> {
        self.find_by_arch(arch)?
            .into_iter()
            .next()
            .ok_or(ImageError::NoImage(arch))
    }

    pub fn get(&self, id: &str) -> Result<Image, ImageError> {
        let path = self.document_path(id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound(id.to_string()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&raw).map_err(|source| ImageError::Malformed { path, source })
    }

    pub fn save(&self, image: &Image) -> Result<(), ImageError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.document_path(&image.id);
        let doc = serde_json::to_vec_pretty(image).expect("image serializes");
        std::fs::write(&path, doc).map_err(io_err(&path))?;
        tracing::info!(image = %image.id, arch = %image.arch(), "saved image document");
        Ok(())
    }

    /// Remove the metadata document. The caller decides whether the
    /// referenced artifacts go with it.
    pub fn remove(&self, id: &str) -> Result<Image, ImageError> {
        let image = self.get(id)?;
        let path = self.document_path(id);
        std::fs::remove_file(&path).map_err(io_err(&path))?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SpecificationRepository;

    fn image(id: &str, arch_spec: &str, created_secs: i64) -> Image {
        let catalog = SpecificationRepository::embedded().unwrap();
        let spec = catalog.get(arch_spec).unwrap().clone();
        Image {
            id: id.to_string(),
            created_at: DateTime::from_timestamp(created_secs, 0).unwrap(),
            specification: spec,
            artifact: Artifact {
                uri: format!("file:///var/lib/bottle/artifacts/{id}.qcow2"),
                checksum: "0".repeat(64),
                content_type: "application/x-qemu-disk".into(),
                created_at: Utc::now(),
            },
            companions: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn save_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path());
        let img = image("img-1", "debian-bookworm-x86_64", 1000);
        repo.save(&img).unwrap();
        let back = repo.get("img-1").unwrap();
        assert_eq!(back.id, "img-1");
        assert_eq!(back.arch(), Arch::X86_64);
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path());
        repo.save(&image("old", "debian-bookworm-x86_64", 1000)).unwrap();
        repo.save(&image("new", "debian-bookworm-x86_64", 2000)).unwrap();
        let ids: Vec<String> = repo.list().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn select_for_arch_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path());
        repo.save(&image("x86-old", "debian-bookworm-x86_64", 1000)).unwrap();
        repo.save(&image("x86-new", "debian-bookworm-x86_64", 2000)).unwrap();
        repo.save(&image("arm", "debian-bookworm-aarch64", 3000)).unwrap();
        assert_eq!(repo.select_for_arch(Arch::X86_64).unwrap().id, "x86-new");
        assert!(matches!(
            repo.select_for_arch(Arch::Mips),
            Err(ImageError::NoImage(Arch::Mips))
        ));
    }

    #[test]
    fn missing_image_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path());
        assert!(matches!(repo.get("ghost"), Err(ImageError::NotFound(_))));
    }

    #[test]
    fn remove_deletes_document() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path());
        repo.save(&image("img-1", "debian-bookworm-x86_64", 1000)).unwrap();
        repo.remove("img-1").unwrap();
        assert!(matches!(repo.get("img-1"), Err(ImageError::NotFound(_))));
    }

    #[test]
    fn empty_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ImageRepository::new(dir.path().join("missing"));
        assert!(repo.list().unwrap().is_empty());
    }
}
