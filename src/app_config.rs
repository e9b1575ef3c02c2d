//! Configuration file holding CLI defaults.
//!
//! The file is a flat list of `key = value` lines. Strings are double
//! quoted, `#` starts a comment, and unknown keys are rejected so typos do
//! not pass silently.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Range accepted for `max_processes`.
pub const MAX_PROCESSES_RANGE: std::ops::RangeInclusive<usize> = 1..=64;

/// Defaults read from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Maximum number of simultaneously running jobs.
    pub max_processes: Option<usize>,
    /// Temporary workspace.
    pub tmp_dir: Option<PathBuf>,
    /// Per-job log directory.
    pub log_dir: Option<PathBuf>,
    /// Directory receiving downloads.
    pub output_dir: Option<PathBuf>,
    /// Register directory.
    pub register_location: Option<PathBuf>,
    /// Local directory for installed tools.
    pub bin_dir: Option<PathBuf>,
    /// Default verbosity mode.
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates values against the ranges the CLI accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_processes) = self.max_processes
            && !MAX_PROCESSES_RANGE.contains(&max_processes)
        {
            bail!(
                "Invalid config value for `max_processes`: {max_processes}. Expected range: {}..={}",
                MAX_PROCESSES_RANGE.start(),
                MAX_PROCESSES_RANGE.end()
            );
        }
        for (key, value) in [
            ("tmp_dir", &self.tmp_dir),
            ("log_dir", &self.log_dir),
            ("output_dir", &self.output_dir),
            ("register_location", &self.register_location),
            ("bin_dir", &self.bin_dir),
        ] {
            if value.as_ref().is_some_and(|path| path.as_os_str().is_empty()) {
                bail!("Invalid config value for `{key}`: path must not be empty");
            }
        }
        Ok(())
    }
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Returns the stable string label for display output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verbose => "verbose",
            Self::Quiet => "quiet",
            Self::Debug => "debug",
        }
    }

    /// Returns the tracing level used when neither `RUST_LOG` nor a CLI flag is set.
    #[must_use]
    pub fn default_level(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

impl LoadedConfig {
    /// Returns the parsed config, or an empty one when no file was loaded.
    #[must_use]
    pub fn file(&self) -> FileConfig {
        self.config.clone().unwrap_or_default()
    }
}

/// Resolves the config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/seqdd/config.toml`
/// 2. `$HOME/.config/seqdd/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("seqdd").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("seqdd")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match key {
            "max_processes" => {
                let parsed = parse_process_count(value)
                    .with_context(|| format!("Invalid `max_processes` value on line {line_no}"))?;
                cfg.max_processes = Some(parsed);
            }
            "tmp_dir" | "log_dir" | "output_dir" | "register_location" | "bin_dir" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `{key}` value on line {line_no}"))?;
                let slot = match key {
                    "tmp_dir" => &mut cfg.tmp_dir,
                    "log_dir" => &mut cfg.log_dir,
                    "output_dir" => &mut cfg.output_dir,
                    "bin_dir" => &mut cfg.bin_dir,
                    _ => &mut cfg.register_location,
                };
                *slot = Some(PathBuf::from(parsed));
            }
            "verbosity" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `verbosity` value on line {line_no}"))?;
                cfg.verbosity = Some(parsed.parse::<VerbositySetting>().with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    raw_value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .context("Expected double-quoted string")
}

fn parse_process_count(raw_value: &str) -> Result<usize> {
    raw_value
        .parse::<usize>()
        .with_context(|| format!("Expected a positive integer, found '{raw_value}'"))
}

impl std::str::FromStr for VerbositySetting {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        [Self::Default, Self::Verbose, Self::Quiet, Self::Debug]
            .into_iter()
            .find(|setting| setting.as_str() == value)
            .context("Expected one of: default, verbose, quiet, debug")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
max_processes = 4
verbosity = "verbose"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.max_processes, Some(4));
        assert_eq!(cfg.verbosity, Some(VerbositySetting::Verbose));
        assert!(cfg.output_dir.is_none());
    }

    #[test]
    fn test_parse_config_directories() {
        let cfg = parse_config_str(
            r#"
tmp_dir = "/scratch/seqdd"
log_dir = "logs"
output_dir = "data" # downloads
register_location = "project/.register"
bin_dir = "/opt/seqdd/bin"
"#,
        )
        .expect("directories should parse");
        assert_eq!(cfg.tmp_dir, Some(PathBuf::from("/scratch/seqdd")));
        assert_eq!(cfg.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(cfg.output_dir, Some(PathBuf::from("data")));
        assert_eq!(cfg.register_location, Some(PathBuf::from("project/.register")));
        assert_eq!(cfg.bin_dir, Some(PathBuf::from("/opt/seqdd/bin")));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_processes() {
        for raw in ["max_processes = 0", "max_processes = 65"] {
            let err = parse_config_str(raw).expect_err("out of range value expected");
            assert!(err.to_string().contains("max_processes"), "{raw}");
        }
    }

    #[test]
    fn test_parse_config_rejects_trailing_tokens() {
        let err = parse_config_str("max_processes = 4 trailing").expect_err("trailing token error");
        assert!(format!("{err:#}").contains("max_processes"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_path() {
        let err = parse_config_str("tmp_dir = /tmp").expect_err("unquoted path error");
        assert!(err.to_string().contains("tmp_dir"));
    }

    #[test]
    fn test_parse_config_rejects_empty_path() {
        let err = parse_config_str(r#"output_dir = """#).expect_err("empty path error");
        assert!(err.to_string().contains("output_dir"));
    }

    #[test]
    fn test_parse_config_hash_inside_string_is_kept() {
        let cfg = parse_config_str(r#"output_dir = "data#1" # comment"#).expect("should parse");
        assert_eq!(cfg.output_dir, Some(PathBuf::from("data#1")));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("ncbi_delay = 3").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("ncbi_delay"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("max_processes 4").expect_err("syntax error expected");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(VerbositySetting::Default.default_level(), "info");
        assert_eq!(VerbositySetting::Quiet.default_level(), "error");
        assert_eq!(VerbositySetting::Debug.as_str(), "debug");
    }
}
