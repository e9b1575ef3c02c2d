//! External programs run by the command jobs.
//!
//! A tool is looked up on `PATH` first, then in a local bin directory. The
//! NCBI `datasets` CLI and the SRA toolkit can be installed into that
//! directory on Linux.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{BuildContext, JobBuilder, SourceError, SourceKind, path_arg};
use crate::artifact::TempArtifact;

/// Default local bin directory.
pub const DEFAULT_BIN_DIR: &str = "bin";

/// SRA toolkit release installed when `prefetch` is missing.
pub const SRA_TOOLKIT_VERSION: &str = "3.1.1";

/// Tool archives are large; the metadata client's timeout is too short.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Where tools are looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolbox {
    bin_dir: Option<PathBuf>,
}

impl Toolbox {
    /// Looks tools up on `PATH` only.
    #[must_use]
    pub fn path_only() -> Self {
        Self::default()
    }

    /// Also looks tools up in `bin_dir`, and installs into it.
    #[must_use]
    pub fn with_bin_dir(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: Some(bin_dir.into()),
        }
    }

    /// Local bin directory, if any.
    #[must_use]
    pub fn bin_dir(&self) -> Option<&Path> {
        self.bin_dir.as_deref()
    }

    /// Returns the executable for `name`, on `PATH` or in the bin directory.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        find_executable(name).or_else(|| self.local(name))
    }

    /// Returns the program to launch for `name`.
    ///
    /// Tools on `PATH` keep their bare name and tools found only in the bin
    /// directory get an absolute path. A tool found nowhere keeps its bare
    /// name, so the launch error names it.
    #[must_use]
    pub fn program(&self, name: &str) -> String {
        if find_executable(name).is_some() {
            return name.to_string();
        }
        self.local(name)
            .map_or_else(|| name.to_string(), |path| path_arg(&path))
    }

    /// Returns the tools of `builder` found neither on `PATH` nor in the bin
    /// directory.
    #[must_use]
    pub fn missing(&self, builder: &dyn JobBuilder) -> Vec<&'static str> {
        builder
            .required_tools()
            .iter()
            .copied()
            .filter(|tool| self.resolve(tool).is_none())
            .collect()
    }

    fn local(&self, name: &str) -> Option<PathBuf> {
        let candidate = self.bin_dir.as_ref()?.join(name);
        if !is_executable(&candidate) {
            return None;
        }
        Some(std::path::absolute(&candidate).unwrap_or(candidate))
    }
}

/// Looks `name` up in the directories of `PATH`.
#[must_use]
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Returns the `datasets` download URL for a platform, if one is published.
#[must_use]
pub fn datasets_url(base: &str, os: &str, arch: &str) -> Option<String> {
    if os != "linux" {
        return None;
    }
    let platform = match arch {
        "x86_64" | "x86" => "linux-amd64",
        "aarch64" | "arm" => "linux-arm64",
        _ => return None,
    };
    Some(format!("{base}/{platform}/datasets"))
}

/// Returns the SRA toolkit archive URL for a platform, if one is published.
#[must_use]
pub fn sra_toolkit_url(base: &str, os: &str, version: &str) -> Option<String> {
    (os == "linux").then(|| format!("{base}/{version}/{}.tar.gz", sra_toolkit_dirname(version)))
}

fn sra_toolkit_dirname(version: &str) -> String {
    format!("sratoolkit.{version}-ubuntu64")
}

/// Installs the tools of `kind` into the bin directory of `ctx.tools`.
///
/// Only NCBI (`datasets`) and SRA (`prefetch`, `fasterq-dump`) have
/// installers, and only on Linux.
///
/// # Errors
///
/// Returns [`SourceError::Install`] when no installer applies or a step
/// fails, and [`SourceError::Http`] or [`SourceError::HttpStatus`] when the
/// download fails.
#[instrument(skip(ctx))]
pub async fn install_tools(kind: SourceKind, ctx: &BuildContext) -> Result<(), SourceError> {
    let Some(bin_dir) = ctx.tools.bin_dir() else {
        return Err(SourceError::install(kind, "no bin directory configured"));
    };
    match kind {
        SourceKind::Ncbi => install_datasets(ctx, bin_dir).await,
        SourceKind::Sra => install_sra_toolkit(ctx, bin_dir).await,
        other => Err(SourceError::install(other, "no installer for this source")),
    }
}

fn unsupported_platform(kind: SourceKind) -> SourceError {
    SourceError::install(
        kind,
        format!(
            "no prebuilt binaries for {}/{}, install them manually",
            env::consts::OS,
            env::consts::ARCH
        ),
    )
}

async fn install_datasets(ctx: &BuildContext, bin_dir: &Path) -> Result<(), SourceError> {
    let url = datasets_url(&ctx.endpoints.ncbi_datasets, env::consts::OS, env::consts::ARCH)
        .ok_or_else(|| unsupported_platform(SourceKind::Ncbi))?;
    fs::create_dir_all(bin_dir).map_err(|e| SourceError::io(bin_dir, e))?;
    info!(url = %url, "installing NCBI datasets CLI");

    let target = TempArtifact::new(bin_dir.join("datasets"));
    download_to(ctx, SourceKind::Ncbi, &url, target.path()).await?;
    make_executable(target.path())?;
    let installed = target.persist();
    info!(path = %installed.display(), "NCBI datasets CLI installed");
    Ok(())
}

async fn install_sra_toolkit(ctx: &BuildContext, bin_dir: &Path) -> Result<(), SourceError> {
    let url = sra_toolkit_url(&ctx.endpoints.sra_toolkit, env::consts::OS, SRA_TOOLKIT_VERSION)
        .ok_or_else(|| unsupported_platform(SourceKind::Sra))?;
    fs::create_dir_all(bin_dir).map_err(|e| SourceError::io(bin_dir, e))?;
    info!(url = %url, version = SRA_TOOLKIT_VERSION, "installing SRA toolkit");

    let dirname = sra_toolkit_dirname(SRA_TOOLKIT_VERSION);
    let archive = TempArtifact::new(bin_dir.join(format!("{dirname}.tar.gz")));
    download_to(ctx, SourceKind::Sra, &url, archive.path()).await?;
    let status = Command::new("tar")
        .arg("-xzf")
        .arg(archive.path())
        .arg("-C")
        .arg(bin_dir)
        .status()
        .await
        .map_err(|e| SourceError::install(SourceKind::Sra, format!("could not run tar: {e}")))?;
    if !status.success() {
        return Err(SourceError::install(
            SourceKind::Sra,
            format!("tar could not expand the toolkit archive ({status})"),
        ));
    }
    drop(archive);

    let toolkit_bin = bin_dir.join(&dirname).join("bin");
    for tool in ["prefetch", "fasterq-dump"] {
        let target = toolkit_bin.join(tool);
        if !is_executable(&target) {
            return Err(SourceError::install(
                SourceKind::Sra,
                format!("{tool} missing from the toolkit archive"),
            ));
        }
        link_tool(&target, &bin_dir.join(tool))?;
    }
    info!(dir = %toolkit_bin.display(), "SRA toolkit installed");
    Ok(())
}

async fn download_to(
    ctx: &BuildContext,
    kind: SourceKind,
    url: &str,
    dest: &Path,
) -> Result<(), SourceError> {
    ctx.limiter.acquire(kind).await;
    let response = ctx
        .client
        .get(url)
        .timeout(INSTALL_TIMEOUT)
        .send()
        .await
        .map_err(|e| SourceError::http(kind, url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::HttpStatus {
            kind,
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| SourceError::io(dest, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SourceError::http(kind, url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| SourceError::io(dest, e))?;
        written += chunk.len() as u64;
    }
    writer.flush().await.map_err(|e| SourceError::io(dest, e))?;
    debug!(url, bytes = written, "tool download complete");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SourceError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| SourceError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SourceError> {
    Ok(())
}

#[cfg(unix)]
fn link_tool(target: &Path, link: &Path) -> Result<(), SourceError> {
    match fs::remove_file(link) {
        Ok(()) => debug!(link = %link.display(), "replacing tool link"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(SourceError::io(link, error)),
    }
    let target = std::path::absolute(target).map_err(|e| SourceError::io(target, e))?;
    std::os::unix::fs::symlink(&target, link).map_err(|e| SourceError::io(link, e))
}

#[cfg(not(unix))]
fn link_tool(_target: &Path, link: &Path) -> Result<(), SourceError> {
    Err(SourceError::io(
        link,
        io::Error::new(io::ErrorKind::Unsupported, "tool links need a unix system"),
    ))
}
