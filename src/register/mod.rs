//! Persistent lists of accessions to download, grouped by source.
//!
//! A register is a directory (`.register` by default) holding one
//! `<source>.txt` file per non-empty source with one accession per line.
//! Accessions keep the order they were added in, so URL indices stay stable
//! between runs.
//!
//! Registers can be shared as a single flat file:
//!
//! ```text
//! version 0.0
//! ncbi	2
//! GCF_000001405.40
//! GCA_000001635.9
//! url	1
//! https://example.org/genome.fa.gz
//! ```

mod error;

pub use error::RegisterError;

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::source::{SourceKind, builder_for};

/// Default register directory, relative to the working directory.
pub const DEFAULT_REGISTER_DIR: &str = ".register";

/// Version written at the top of exported registers.
pub const REGISTER_VERSION: (u32, u32) = (0, 0);

const LOCK_FILE: &str = ".lock";

/// Result of [`Register::add`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// Accessions newly stored.
    pub added: Vec<String>,
    /// Accessions already present.
    pub duplicates: Vec<String>,
    /// Accessions rejected by the source's format check.
    pub invalid: Vec<String>,
}

/// Result of [`Register::remove`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// Accessions removed.
    pub removed: Vec<String>,
    /// Accessions that were not in the register.
    pub missing: Vec<String>,
}

/// An on-disk register loaded in memory.
///
/// Mutations only touch memory; call [`Register::save`] to persist them.
#[derive(Debug, Clone)]
pub struct Register {
    dir: PathBuf,
    entries: BTreeMap<SourceKind, Vec<String>>,
}

impl Register {
    /// Creates an empty register at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::AlreadyExists`] if `dir` exists and `force`
    /// is false. With `force`, the existing directory is replaced.
    pub fn init(dir: impl AsRef<Path>, force: bool) -> Result<Self, RegisterError> {
        let dir = dir.as_ref();
        if dir.exists() {
            if !force {
                return Err(RegisterError::AlreadyExists {
                    path: dir.to_path_buf(),
                });
            }
            warn!(dir = %dir.display(), "replacing existing register");
            fs::remove_dir_all(dir).map_err(|e| RegisterError::io(dir, e))?;
        }
        fs::create_dir_all(dir).map_err(|e| RegisterError::io(dir, e))?;
        info!(dir = %dir.display(), "register created");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries: BTreeMap::new(),
        })
    }

    /// Loads the register stored at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::NotFound`] if `dir` is not a directory, or
    /// [`RegisterError::Io`] if a source file cannot be read.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RegisterError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(RegisterError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        let mut entries = BTreeMap::new();
        for kind in SourceKind::ALL {
            let path = source_file(dir, kind);
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|e| RegisterError::io(&path, e))?;
            let mut seen = HashSet::new();
            let accessions: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && seen.insert(*line))
                .map(str::to_string)
                .collect();
            if !accessions.is_empty() {
                entries.insert(kind, accessions);
            }
        }
        debug!(dir = %dir.display(), sources = entries.len(), "register loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    /// Writes every source file, removing the files of empty sources.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Io`] if the lock or a file cannot be written.
    pub fn save(&self) -> Result<(), RegisterError> {
        let _lock = self.lock()?;
        for kind in SourceKind::ALL {
            let path = source_file(&self.dir, kind);
            match self.entries.get(&kind).filter(|list| !list.is_empty()) {
                Some(accessions) => write_lines(&path, accessions)?,
                None if path.exists() => {
                    fs::remove_file(&path).map_err(|e| RegisterError::io(&path, e))?;
                }
                None => {}
            }
        }
        debug!(dir = %self.dir.display(), "register saved");
        Ok(())
    }

    /// Returns the register directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Adds `accessions` to `source` after checking their format.
    pub fn add<I, S>(&mut self, source: SourceKind, accessions: I) -> AddOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let candidates: Vec<String> = accessions
            .into_iter()
            .map(|acc| acc.as_ref().trim().to_string())
            .filter(|acc| !acc.is_empty())
            .collect();
        let (valid, invalid) = builder_for(source).partition_valid(&candidates);
        for accession in &invalid {
            warn!(source = %source, accession = %accession, "invalid accession format, skipped");
        }

        let list = self.entries.entry(source).or_default();
        let mut outcome = AddOutcome {
            invalid,
            ..AddOutcome::default()
        };
        for accession in valid {
            if list.contains(&accession) {
                outcome.duplicates.push(accession);
            } else {
                list.push(accession.clone());
                outcome.added.push(accession);
            }
        }
        info!(source = %source, added = outcome.added.len(), "accessions added");
        outcome
    }

    /// Removes `accessions` from `source`.
    pub fn remove<I, S>(&mut self, source: SourceKind, accessions: I) -> RemoveOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = RemoveOutcome::default();
        let list = self.entries.entry(source).or_default();
        for accession in accessions {
            let accession = accession.as_ref().trim();
            if let Some(pos) = list.iter().position(|existing| existing == accession) {
                list.remove(pos);
                outcome.removed.push(accession.to_string());
            } else {
                warn!(source = %source, accession = %accession, "accession not in register");
                outcome.missing.push(accession.to_string());
            }
        }
        if list.is_empty() {
            self.entries.remove(&source);
        }
        outcome
    }

    /// Returns the accessions of `source`, in insertion order.
    #[must_use]
    pub fn list(&self, source: SourceKind) -> &[String] {
        self.entries.get(&source).map_or(&[], Vec::as_slice)
    }

    /// Iterates over the non-empty sources in processing order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceKind, &[String])> {
        self.entries
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(kind, list)| (*kind, list.as_slice()))
    }

    /// Returns the total number of accessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Returns true if no source holds an accession.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the accessions of `source` matching at least one pattern.
    ///
    /// Patterns are anchored at the start of the accession, so `SRR` keeps
    /// `SRR000001` but not `ERR000001`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::InvalidPattern`] for a pattern that does not
    /// compile.
    pub fn filter<S: AsRef<str>>(
        &self,
        source: SourceKind,
        patterns: &[S],
    ) -> Result<Vec<&str>, RegisterError> {
        let regexes = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|source| RegisterError::InvalidPattern {
                    pattern: pattern.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .list(source)
            .iter()
            .map(String::as_str)
            .filter(|acc| {
                regexes
                    .iter()
                    .any(|re| re.find(acc).is_some_and(|m| m.start() == 0))
            })
            .collect())
    }

    /// Writes the whole register to a single file.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Io`] if the file cannot be written.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), RegisterError> {
        let path = path.as_ref();
        let (major, minor) = REGISTER_VERSION;
        let mut lines = vec![format!("version {major}.{minor}")];
        for (kind, accessions) in self.iter() {
            lines.push(format!("{kind}\t{}", accessions.len()));
            lines.extend(accessions.iter().cloned());
        }
        write_lines(path, &lines)?;
        info!(path = %path.display(), accessions = self.len(), "register exported");
        Ok(())
    }

    /// Merges an exported register into this one.
    ///
    /// Imported accessions are checked like [`Register::add`]; invalid ones
    /// are dropped with a warning. Returns the number of new accessions.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::IncompatibleVersion`] for a file from another
    /// major version or a newer minor version, and
    /// [`RegisterError::Malformed`] for any layout problem.
    pub fn import(&mut self, path: impl AsRef<Path>) -> Result<usize, RegisterError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| RegisterError::io(path, e))?;
        let sections = parse_export(path, &content)?;
        let mut added = 0;
        for (kind, accessions) in sections {
            added += self.add(kind, accessions).added.len();
        }
        info!(path = %path.display(), added, "register imported");
        Ok(added)
    }

    fn lock(&self) -> Result<File, RegisterError> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| RegisterError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| RegisterError::io(&path, e))?;
        Ok(file)
    }
}

fn source_file(dir: &Path, kind: SourceKind) -> PathBuf {
    dir.join(format!("{kind}.txt"))
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), RegisterError> {
    let mut file = File::create(path).map_err(|e| RegisterError::io(path, e))?;
    for line in lines {
        writeln!(file, "{line}").map_err(|e| RegisterError::io(path, e))?;
    }
    file.sync_all().map_err(|e| RegisterError::io(path, e))
}

fn parse_version(path: &Path, line: &str) -> Result<(), RegisterError> {
    let found = line
        .strip_prefix("version")
        .map(str::trim)
        .ok_or_else(|| RegisterError::malformed(path, 1, "missing version header"))?;
    let (major, minor) = found
        .split_once('.')
        .and_then(|(major, minor)| Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?)))
        .ok_or_else(|| RegisterError::malformed(path, 1, format!("invalid version '{found}'")))?;
    let (supported_major, supported_minor) = REGISTER_VERSION;
    if major != supported_major || minor > supported_minor {
        return Err(RegisterError::IncompatibleVersion {
            found: found.to_string(),
            supported: format!("{supported_major}.{supported_minor}"),
        });
    }
    Ok(())
}

fn parse_export(path: &Path, content: &str) -> Result<Vec<(SourceKind, Vec<String>)>, RegisterError> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| RegisterError::malformed(path, 1, "empty file"))?;
    parse_version(path, header)?;

    let mut sections = Vec::new();
    while let Some((line_no, line)) = lines.next() {
        let (key, count) = line.split_once('\t').ok_or_else(|| {
            RegisterError::malformed(path, line_no, "expected '<source>\\t<count>'")
        })?;
        let kind: SourceKind = key
            .parse()
            .map_err(|e| RegisterError::malformed(path, line_no, format!("{e}")))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| RegisterError::malformed(path, line_no, format!("invalid count '{count}'")))?;
        let accessions: Vec<String> = lines
            .by_ref()
            .take(count)
            .map(|(_, acc)| acc.to_string())
            .collect();
        if accessions.len() != count {
            return Err(RegisterError::malformed(
                path,
                line_no,
                format!("{kind} announces {count} accessions, found {}", accessions.len()),
            ));
        }
        sections.push((kind, accessions));
    }
    Ok(sections)
}
