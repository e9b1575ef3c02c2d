//! Downloaded artifact handling: digests, verification and relocation.
//!
//! Builders download into a temporary directory and rely on the helpers here,
//! run as function jobs, to check the result and move it to the output
//! directory. A file that fails verification never reaches the output
//! directory, and a multi-file result is assembled in a [`StagedDir`] so the
//! output directory only ever sees it complete.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::JobError;

const BUF_SIZE: usize = 64 * 1024;

/// Errors raised while verifying or relocating artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file content does not match the published digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Verified file.
        path: PathBuf,
        /// Published digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },
}

impl ArtifactError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<ArtifactError> for JobError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::Io { path, source } => JobError::io(path, source),
            ArtifactError::ChecksumMismatch {
                path,
                expected,
                actual,
            } => JobError::checksum_mismatch(path, expected, actual),
        }
    }
}

/// A published digest for a downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedDigest {
    Md5(String),
    Sha256(String),
}

impl ExpectedDigest {
    /// Returns the hex digest, lowercased.
    #[must_use]
    pub fn hex(&self) -> String {
        match self {
            Self::Md5(value) | Self::Sha256(value) => value.trim().to_ascii_lowercase(),
        }
    }
}

fn digest_path<D: Digest>(path: &Path) -> Result<String, ArtifactError> {
    let mut file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| ArtifactError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the SHA-256 of a file as lowercase hex, reading in 64 KiB chunks.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] if the file cannot be read.
pub fn sha256_path(path: &Path) -> Result<String, ArtifactError> {
    digest_path::<Sha256>(path)
}

/// Computes the MD5 of a file as lowercase hex, reading in 64 KiB chunks.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] if the file cannot be read.
pub fn md5_path(path: &Path) -> Result<String, ArtifactError> {
    digest_path::<Md5>(path)
}

/// Checks `path` against `expected`.
///
/// # Errors
///
/// Returns [`ArtifactError::ChecksumMismatch`] on a differing digest and
/// [`ArtifactError::Io`] if the file cannot be read.
pub fn verify_digest(path: &Path, expected: &ExpectedDigest) -> Result<(), ArtifactError> {
    let actual = match expected {
        ExpectedDigest::Md5(_) => md5_path(path)?,
        ExpectedDigest::Sha256(_) => sha256_path(path)?,
    };
    let expected = expected.hex();
    if actual == expected {
        debug!(path = %path.display(), digest = %actual, "digest verified");
        Ok(())
    } else {
        Err(ArtifactError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        })
    }
}

/// A temporary file or directory removed when dropped.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    armed: bool,
}

impl TempArtifact {
    /// Takes ownership of `path` for removal.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    /// Returns the guarded path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the path on disk and returns it.
    #[must_use]
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Removes the path now. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] if removal fails for a reason other than
    /// the path being absent.
    pub fn cleanup(&mut self) -> Result<(), ArtifactError> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        remove_path(&self.path)
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(error) = self.cleanup() {
            warn!(error = %error, "temporary artifact not removed");
        }
    }
}

fn remove_path(path: &Path) -> Result<(), ArtifactError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => Err(error),
    };
    match result {
        Err(error) if error.kind() != io::ErrorKind::NotFound => {
            Err(ArtifactError::io(path, error))
        }
        _ => Ok(()),
    }
}

/// A directory assembled beside its destination and published with one rename.
///
/// The stage is a hidden sibling of the destination, so publishing never
/// crosses filesystems. An unpublished stage is removed on drop.
#[derive(Debug)]
pub struct StagedDir {
    stage: TempArtifact,
    dest: PathBuf,
}

impl StagedDir {
    /// Creates an empty stage for `dest`, discarding any stale one.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] if the stage cannot be created.
    pub fn new(dest: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dest = dest.into();
        let stage = staging_path(&dest);
        remove_path(&stage)?;
        fs::create_dir_all(&stage).map_err(|e| ArtifactError::io(&stage, e))?;
        Ok(Self {
            stage: TempArtifact::new(stage),
            dest,
        })
    }

    /// Directory to fill before publishing.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.stage.path()
    }

    /// Final location.
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Renames the stage onto the destination.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] if the rename fails; the stage is then
    /// removed.
    pub fn publish(self) -> Result<PathBuf, ArtifactError> {
        let Self { mut stage, dest } = self;
        fs::rename(stage.path(), &dest).map_err(|e| ArtifactError::io(&dest, e))?;
        stage.disarm();
        debug!(dest = %dest.display(), "staged directory published");
        Ok(dest)
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map_or_else(|| "artifact".into(), |name| name.to_string_lossy());
    dest.with_file_name(format!(".{name}.partial"))
}

/// Removes a directory tree, returning whether it existed.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] if the directory exists but cannot be removed.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, ArtifactError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(ArtifactError::io(path, error)),
    }
}

/// Moves a file or directory, copying when a rename crosses filesystems.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] if the destination parent cannot be created
/// or the move fails.
pub fn move_path(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| ArtifactError::io(parent, e))?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::CrossesDevices => {
            debug!(from = %from.display(), to = %to.display(), "rename crosses devices, copying");
            let mut staged = TempArtifact::new(staging_path(to));
            remove_path(staged.path())?;
            copy_recursive(from, staged.path())?;
            fs::rename(staged.path(), to).map_err(|e| ArtifactError::io(to, e))?;
            staged.disarm();
            remove_path(from)
        }
        Err(error) => Err(ArtifactError::io(from, error)),
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    let meta = fs::metadata(from).map_err(|e| ArtifactError::io(from, e))?;
    if !meta.is_dir() {
        fs::copy(from, to).map_err(|e| ArtifactError::io(to, e))?;
        return Ok(());
    }
    fs::create_dir_all(to).map_err(|e| ArtifactError::io(to, e))?;
    for entry in fs::read_dir(from).map_err(|e| ArtifactError::io(from, e))? {
        let entry = entry.map_err(|e| ArtifactError::io(from, e))?;
        copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Verifies a downloaded file and moves it to `dest`.
///
/// On a digest mismatch the temporary file is removed.
///
/// # Errors
///
/// Returns [`ArtifactError::ChecksumMismatch`] or [`ArtifactError::Io`].
pub fn verify_and_move(
    tmp: &Path,
    dest: &Path,
    expected: Option<&ExpectedDigest>,
) -> Result<(), ArtifactError> {
    let mut guard = TempArtifact::new(tmp);
    if let Some(expected) = expected {
        verify_digest(tmp, expected)?;
    }
    move_path(tmp, dest)?;
    guard.disarm();
    Ok(())
}

/// Moves every regular file under `dir`, at any depth, whose name ends with
/// `suffix` into `out` (flattened), returning the new paths in name order.
///
/// # Errors
///
/// Returns [`ArtifactError::Io`] if a directory cannot be listed or a move
/// fails.
pub fn move_matching(dir: &Path, out: &Path, suffix: &str) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut found = Vec::new();
    collect_matching(dir, suffix, &mut found)?;
    found.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    fs::create_dir_all(out).map_err(|e| ArtifactError::io(out, e))?;
    let mut moved = Vec::with_capacity(found.len());
    for path in found {
        let Some(name) = path.file_name() else {
            continue;
        };
        let dest = out.join(name);
        move_path(&path, &dest)?;
        moved.push(dest);
    }
    Ok(moved)
}

fn collect_matching(dir: &Path, suffix: &str, found: &mut Vec<PathBuf>) -> Result<(), ArtifactError> {
    for entry in fs::read_dir(dir).map_err(|e| ArtifactError::io(dir, e))? {
        let entry = entry.map_err(|e| ArtifactError::io(dir, e))?;
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        if kind.is_dir() {
            collect_matching(&entry.path(), suffix, found)?;
        } else if kind.is_file() && entry.file_name().to_string_lossy().ends_with(suffix) {
            found.push(entry.path());
        }
    }
    Ok(())
}
