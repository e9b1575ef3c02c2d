//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use seqdd_core::source::SourceKind;

/// Reproducible downloads of sequence datasets.
///
/// Accessions are recorded in a register that can be shared with
/// collaborators, then downloaded in parallel while each remote service is
/// queried at a polite pace.
#[derive(Parser, Debug)]
#[command(name = "seqdd")]
#[command(author, version, about)]
pub struct Args {
    /// Register directory [default: .register]
    #[arg(long, global = true, value_name = "DIR")]
    pub register_location: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Register and download commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty register
    Init {
        /// Replace an existing register
        #[arg(short, long)]
        force: bool,
    },

    /// Add accessions to the register
    Add(AddArgs),

    /// Remove accessions from the register
    Remove {
        /// Source the accessions belong to
        #[arg(short, long, value_parser = parse_source)]
        source: SourceKind,

        /// Accessions to remove
        #[arg(short, long, num_args = 1.., required = true)]
        accessions: Vec<String>,
    },

    /// List registered accessions
    List {
        /// Only list this source
        #[arg(short, long, value_parser = parse_source)]
        source: Option<SourceKind>,

        /// Keep accessions starting with one of these patterns (regex)
        #[arg(short = 'r', long = "filter", value_name = "REGEX", requires = "source")]
        filters: Vec<String>,
    },

    /// Write the register to a single shareable file
    Export {
        /// Destination file
        file: PathBuf,
    },

    /// Merge an exported register into this one
    Import {
        /// File written by `seqdd export`
        file: PathBuf,
    },

    /// Download every registered accession
    Download(DownloadArgs),
}

/// Arguments of `seqdd add`.
#[derive(ClapArgs, Debug)]
pub struct AddArgs {
    /// Source the accessions belong to
    #[arg(short, long, value_parser = parse_source)]
    pub source: SourceKind,

    /// Accessions to register
    #[arg(short, long, num_args = 1..)]
    pub accessions: Vec<String>,

    /// File with one accession per line
    #[arg(short = 'f', long = "file-of-accessions", value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Only check the accession format, skip the online lookup
    #[arg(long)]
    pub offline: bool,
}

/// Arguments of `seqdd download`.
#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// Directory receiving the downloads [default: data]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Maximum simultaneously running jobs (1-64) [default: 8]
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub max_processes: Option<u8>,

    /// Temporary workspace [default: tmp]
    #[arg(long, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Directory for per-job logs, emptied before each run [default: logs]
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub json_report: Option<PathBuf>,

    /// Directory searched for tools after PATH, and where missing NCBI and SRA tools are installed [default: bin]
    #[arg(long, value_name = "DIR")]
    pub bin_dir: Option<PathBuf>,

    /// Never install missing tools
    #[arg(long)]
    pub no_install: bool,
}

fn parse_source(value: &str) -> Result<SourceKind, String> {
    value.parse().map_err(|_| {
        let known: Vec<&str> = SourceKind::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("unknown source '{value}' (expected one of: {})", known.join(", "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["seqdd", "list", "-vv", "--register-location", "reg"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.register_location, Some(PathBuf::from("reg")));
        assert!(matches!(args.command, Command::List { source: None, .. }));
    }

    #[test]
    fn test_cli_init_force() {
        let args = Args::try_parse_from(["seqdd", "init", "-f"]).unwrap();
        assert!(matches!(args.command, Command::Init { force: true }));
    }

    #[test]
    fn test_cli_add_accessions_and_file() {
        let args = Args::try_parse_from([
            "seqdd", "add", "-s", "ncbi", "-a", "GCF_000001405.40", "GCA_000001635.9", "-f", "accs.txt",
        ])
        .unwrap();
        let Command::Add(add) = args.command else {
            panic!("expected add command");
        };
        assert_eq!(add.source, SourceKind::Ncbi);
        assert_eq!(add.accessions.len(), 2);
        assert_eq!(add.file, Some(PathBuf::from("accs.txt")));
        assert!(!add.offline);
    }

    #[test]
    fn test_cli_add_offline() {
        let args = Args::try_parse_from(["seqdd", "add", "-s", "ena", "-a", "ERR000001", "--offline"]).unwrap();
        let Command::Add(add) = args.command else {
            panic!("expected add command");
        };
        assert!(add.offline);
    }

    #[test]
    fn test_cli_unknown_source_rejected() {
        let err = Args::try_parse_from(["seqdd", "add", "-s", "genbank", "-a", "X"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        assert!(err.to_string().contains("expected one of"));
    }

    #[test]
    fn test_cli_remove_requires_accessions() {
        let err = Args::try_parse_from(["seqdd", "remove", "-s", "sra"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_filter_requires_source() {
        let err = Args::try_parse_from(["seqdd", "list", "--filter", "SRR"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_download_options() {
        let args = Args::try_parse_from([
            "seqdd", "download", "-o", "out", "-p", "3", "--tmp-dir", "/scratch", "--json-report", "r.json",
        ])
        .unwrap();
        let Command::Download(download) = args.command else {
            panic!("expected download command");
        };
        assert_eq!(download.output, Some(PathBuf::from("out")));
        assert_eq!(download.max_processes, Some(3));
        assert_eq!(download.tmp_dir, Some(PathBuf::from("/scratch")));
        assert!(download.log_dir.is_none());
        assert_eq!(download.json_report, Some(PathBuf::from("r.json")));
        assert!(download.bin_dir.is_none());
        assert!(!download.no_install);
    }

    #[test]
    fn test_cli_download_tool_options() {
        let args = Args::try_parse_from(["seqdd", "download", "--bin-dir", "tools", "--no-install"]).unwrap();
        let Command::Download(download) = args.command else {
            panic!("expected download command");
        };
        assert_eq!(download.bin_dir, Some(PathBuf::from("tools")));
        assert!(download.no_install);
    }

    #[test]
    fn test_cli_download_zero_processes_rejected() {
        let err = Args::try_parse_from(["seqdd", "download", "-p", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        let result = Args::try_parse_from(["seqdd"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["seqdd", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
