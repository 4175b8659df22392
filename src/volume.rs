//! Disk staging: read-only volumes handed to the guest.
//!
//! Sample and setup directories are mirrored into a staging area, setup
//! volumes get a `setup` marker file at the root so the in-guest mount
//! script can tell the two apart, and the staged tree is encoded into an
//! ISO9660 volume. The name-mangling the encoder applies is modeled here
//! (`iso9660_relative_path`) because the analysis worker has to
//! reconstruct the in-guest path of the sample after encoding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::host::{CommandError, CommandRunner};

/// Marker file dropped at the root of setup volumes.
pub const SETUP_MARKER: &str = "setup";

#[derive(thiserror::Error, Debug)]
pub enum VolumeError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("refusing to stage symlink: {0}")]
    Symlink(PathBuf),

    #[error("refusing to stage irregular file: {0}")]
    Irregular(PathBuf),

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Encoder(#[from] CommandError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> VolumeError + '_ {
    move |source| VolumeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Mirror `src` into `dst`, rejecting symlinks and non-regular files.
/// `dst` is created; existing files in it are overwritten.
pub fn mirror_directory(src: &Path, dst: &Path) -> Result<(), VolumeError> {
    if !src.is_dir() {
        return Err(VolumeError::NotADirectory(src.to_path_buf()));
    }
    std::fs::create_dir_all(dst).map_err(io_err(dst))?;

    for entry in std::fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err(&path))?;
        let target = dst.join(entry.file_name());

        if file_type.is_symlink() {
            return Err(VolumeError::Symlink(path));
        } else if file_type.is_dir() {
            mirror_directory(&path, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(&path, &target).map_err(io_err(&path))?;
        } else {
            return Err(VolumeError::Irregular(path));
        }
    }
    Ok(())
}

/// Drop the zero-byte `setup` marker at the volume root.
pub fn write_setup_marker(dir: &Path) -> Result<(), VolumeError> {
    let marker = dir.join(SETUP_MARKER);
    std::fs::write(&marker, b"").map_err(io_err(&marker))
}

/// Uppercase, restrict to `[A-Z0-9_]`, truncate to 32. Idempotent.
pub fn sanitize_volume_label(label: &str) -> String {
    let mut out: String = label
        .to_uppercase()
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    if out.is_empty() {
        out.push_str("DATA");
    }
    out
}

// Characters the volume encoder keeps in identifiers. Everything else
// (spaces above all) becomes '_'.
fn allowed_char(c: char) -> bool {
    c.is_ascii_lowercase()
        || c.is_ascii_digit()
        || matches!(
            c,
            '_' | '!' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '-' | '@' | '^' | '`' | '{' | '}' | '~'
        )
}

fn mangle_identifier(component: &str) -> String {
    component
        .to_lowercase()
        .chars()
        .map(|c| if allowed_char(c) || c == '.' { c } else { '_' })
        .collect()
}

const DIR_IDENTIFIER_MAX: usize = 31;
const FILE_IDENTIFIER_MAX: usize = 30;

/// Model of the encoder's filename rules for one path component.
///
/// Directories: lowercase, filtered, dots mangled, truncated to 31.
/// Files: the version suffix `;1` is stripped, every dot except the last
/// is mangled, and the name is truncated to 30 characters with the
/// extension preserved.
fn mangle_dir(component: &str) -> String {
    let mangled: String = mangle_identifier(component)
        .chars()
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    mangled.chars().take(DIR_IDENTIFIER_MAX).collect()
}

fn mangle_file(component: &str) -> String {
    let stripped = component.strip_suffix(";1").unwrap_or(component);
    let mangled = mangle_identifier(stripped);

    let (base, ext) = match mangled.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base.to_string(), Some(ext.to_string())),
        _ => (mangled.clone(), None),
    };
    let base: String = base.chars().map(|c| if c == '.' { '_' } else { c }).collect();

    match ext {
        Some(ext) => {
            let budget = FILE_IDENTIFIER_MAX.saturating_sub(ext.len() + 1).max(1);
            let base: String = base.chars().take(budget).collect();
            format!("{base}.{ext}")
        }
        None => base.chars().take(FILE_IDENTIFIER_MAX).collect(),
    }
}

/// Map a host-relative path to the name the volume encoder will give it
/// inside the encoded volume. The final component is treated as a file,
/// every other component as a directory.
pub fn iso9660_relative_path(relative: &str) -> String {
    let components: Vec<&str> = relative
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let mut out = Vec::with_capacity(components.len());
    for (i, component) in components.iter().enumerate() {
        if i + 1 == components.len() {
            out.push(mangle_file(component));
        } else {
            out.push(mangle_dir(component));
        }
    }
    out.join("/")
}

/// Produce a read-only volume from a staged directory.
#[async_trait]
pub trait VolumeEncoder: Send + Sync {
    async fn encode(&self, src_dir: &Path, output: &Path, label: &str) -> Result<(), VolumeError>;
}

/// genisoimage-backed encoder.
pub struct GenisoimageEncoder {
    runner: Arc<dyn CommandRunner>,
}

impl GenisoimageEncoder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl VolumeEncoder for GenisoimageEncoder {
    async fn encode(&self, src_dir: &Path, output: &Path, label: &str) -> Result<(), VolumeError> {
        let label = sanitize_volume_label(label);
        let out = self
            .runner
            .run(
                "genisoimage",
                &[
                    "-quiet",
                    "-iso-level",
                    "2",
                    "-o",
                    &output.to_string_lossy(),
                    "-V",
                    &label,
                    &src_dir.to_string_lossy(),
                ],
            )
            .await?;
        out.check()?;
        tracing::debug!(iso = %output.display(), %label, "encoded volume");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_uppercased_and_filtered() {
        assert_eq!(sanitize_volume_label("bottle setup-1"), "BOTTLE_SETUP_1");
        assert_eq!(sanitize_volume_label(""), "DATA");
        let long = "x".repeat(64);
        assert_eq!(sanitize_volume_label(&long).len(), 32);
    }

    #[test]
    fn label_sanitizing_is_idempotent() {
        for label in ["bottle setup-1", "ALREADY_OK", "weird!@#chars", ""] {
            let once = sanitize_volume_label(label);
            assert_eq!(sanitize_volume_label(&once), once);
            assert!(once.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));
            assert!(!once.is_empty() && once.len() <= 32);
        }
    }

    #[test]
    fn mangles_multi_dot_file_names() {
        assert_eq!(iso9660_relative_path("archive.tar.gz"), "archive_tar.gz");
    }

    #[test]
    fn mangles_spaces_and_keeps_allowed_punctuation() {
        assert_eq!(
            iso9660_relative_path("dir with spaces/sample file!.bin"),
            "dir_with_spaces/sample_file!.bin"
        );
    }

    #[test]
    fn truncates_directory_components() {
        assert_eq!(
            iso9660_relative_path("superlongdirectorynamewithlotsofcharacters/sample.bin"),
            "superlongdirectorynamewithlotso/sample.bin"
        );
    }

    #[test]
    fn strips_version_suffix() {
        assert_eq!(iso9660_relative_path("readme.txt;1"), "readme.txt");
    }

    #[test]
    fn truncates_long_file_names_preserving_extension() {
        let long = format!("{}.bin", "a".repeat(40));
        let got = iso9660_relative_path(&long);
        assert!(got.len() <= 30);
        assert!(got.ends_with(".bin"));
    }

    #[test]
    fn mirror_copies_nested_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.bin"), b"aa").unwrap();
        std::fs::write(src.path().join("sub/b.bin"), b"bb").unwrap();

        let out = dst.path().join("mirror");
        mirror_directory(src.path(), &out).unwrap();
        assert_eq!(std::fs::read(out.join("a.bin")).unwrap(), b"aa");
        assert_eq!(std::fs::read(out.join("sub/b.bin")).unwrap(), b"bb");
    }

    #[cfg(unix)]
    #[test]
    fn mirror_rejects_symlinks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(src.path().join("real"), src.path().join("link")).unwrap();

        let err = mirror_directory(src.path(), &dst.path().join("m")).unwrap_err();
        assert!(matches!(err, VolumeError::Symlink(_)));
    }

    #[test]
    fn mirror_rejects_non_directory_source() {
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let err = mirror_directory(&file, &src.path().join("out")).unwrap_err();
        assert!(matches!(err, VolumeError::NotADirectory(_)));
    }

    #[test]
    fn setup_marker_is_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write_setup_marker(dir.path()).unwrap();
        let meta = std::fs::metadata(dir.path().join(SETUP_MARKER)).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[tokio::test]
    async fn encoder_passes_sanitized_label() {
        use crate::host::fake::FakeRunner;
        let runner = Arc::new(FakeRunner::new());
        let enc = GenisoimageEncoder::new(runner.clone());
        enc.encode(Path::new("/tmp/stage"), Path::new("/tmp/out.iso"), "my label")
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].1.contains(&"MY_LABEL".to_string()));
    }
}
