//! Command-line interface definitions and run configuration.

use crate::error::{Error, Result};
use crate::types::{HiveKind, HiveRequest};
use clap::Parser;
use log::LevelFilter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for the default worker count
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// regtriage - snapshot and normalize Windows registry hives
#[derive(Parser, Debug)]
#[command(name = "regtriage", version)]
#[command(about = "Save registry hives or use provided files, and write one normalized CSV per hive.")]
#[command(long_about = "Snapshots the live SAM, SYSTEM, SOFTWARE, SECURITY and DEFAULT hives (requires Administrator rights) \
or decodes hive files you already have, then writes one CSV per hive with columns Timestamp, Path and one column \
per value name, newest keys first.")]
pub struct Args {
    /// Save the SAM, SYSTEM, SOFTWARE, SECURITY and DEFAULT hives from the live registry
    #[arg(short = 'v', long)]
    pub save_hives: bool,

    /// Path to the SAM file
    #[arg(short = 'm', long)]
    pub sam_file: Option<PathBuf>,

    /// Path to the SYSTEM file
    #[arg(short = 'y', long)]
    pub system_file: Option<PathBuf>,

    /// Path to the SOFTWARE file
    #[arg(short = 'w', long)]
    pub software_file: Option<PathBuf>,

    /// Path to the SECURITY file
    #[arg(short = 'c', long)]
    pub security_file: Option<PathBuf>,

    /// Path to the DEFAULT file
    #[arg(short = 'd', long)]
    pub default_file: Option<PathBuf>,

    /// Directory where the CSV files will be saved (default: next to the executable)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum number of hives processed at once (default: hive count, at most 5)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Kill a hive snapshot that takes longer than this many seconds
    #[arg(long, value_name = "SECS")]
    pub snapshot_timeout: Option<u64>,

    /// Snapshot program invoked as `<program> save <key> <file>`
    #[arg(long, default_value = "reg")]
    pub reg_command: String,

    /// Also write the per-hive outcomes as JSON to this file
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,

    /// Set on the elevated child process
    #[arg(long, hide = true)]
    pub relaunched: bool,
}

impl Args {
    fn given_file(&self, kind: HiveKind) -> Option<&PathBuf> {
        match kind {
            HiveKind::Sam => self.sam_file.as_ref(),
            HiveKind::System => self.system_file.as_ref(),
            HiveKind::Software => self.software_file.as_ref(),
            HiveKind::Security => self.security_file.as_ref(),
            HiveKind::Default => self.default_file.as_ref(),
        }
    }

    /// Requests in hive order: supplied files win, the rest are snapshotted
    /// only in save mode
    fn requests(&self) -> Vec<HiveRequest> {
        HiveKind::ALL
            .iter()
            .filter_map(|&kind| match self.given_file(kind) {
                Some(path) => Some(HiveRequest::from_file(kind, path.clone())),
                None if self.save_hives => Some(HiveRequest::snapshot(kind)),
                None => None,
            })
            .collect()
    }
}

/// Validated configuration for one pipeline run
#[derive(Debug, Clone)]
pub struct Config {
    pub requests: Vec<HiveRequest>,
    pub output_dir: PathBuf,
    /// Elevation status, sampled once at process start
    pub elevated: bool,
    /// This process is the elevated relaunch of an earlier invocation
    pub relaunched: bool,
    pub max_workers: usize,
    pub snapshot_program: String,
    pub snapshot_timeout: Option<Duration>,
    pub summary_path: Option<PathBuf>,
    pub log_level: LevelFilter,
}

impl Config {
    /// Configuration with defaults for everything but the requests
    pub fn new(requests: Vec<HiveRequest>, output_dir: impl Into<PathBuf>) -> Self {
        let max_workers = default_workers(requests.len());
        Self {
            requests,
            output_dir: output_dir.into(),
            elevated: false,
            relaunched: false,
            max_workers,
            snapshot_program: "reg".to_string(),
            snapshot_timeout: None,
            summary_path: None,
            log_level: LevelFilter::Info,
        }
    }

    /// Parse and validate CLI arguments into a configuration
    pub fn from_args(args: Args) -> Result<Self> {
        let output_dir = match &args.output_dir {
            Some(dir) => dir.clone(),
            None => executable_dir()?,
        };
        Self::from_args_in(args, output_dir, crate::privilege::is_elevated())
    }

    /// `from_args` with the ambient inputs supplied by the caller
    pub fn from_args_in(args: Args, default_output_dir: PathBuf, elevated: bool) -> Result<Self> {
        let requests = args.requests();
        let mut config = Config::new(requests, args.output_dir.clone().unwrap_or(default_output_dir));

        if let Some(workers) = args.workers {
            if workers == 0 {
                return Err(Error::InvalidInput("--workers must be at least 1".to_string()));
            }
            config.max_workers = workers;
        }

        config.elevated = elevated;
        config.relaunched = args.relaunched;
        config.snapshot_program = args.reg_command;
        config.snapshot_timeout = args.snapshot_timeout.map(Duration::from_secs);
        config.summary_path = args.summary;
        config.log_level = args.log_level;

        config.validate()?;
        Ok(config)
    }

    /// Check the request set before any hive work starts
    pub fn validate(&self) -> Result<()> {
        if self.requests.is_empty() {
            return Err(Error::InvalidInput(
                "No hive files provided to parse (use --save-hives or pass hive file paths)".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidInput("worker count must be at least 1".to_string()));
        }

        // Two hives writing the same CSV would clobber each other
        let mut stems: HashMap<String, HiveKind> = HashMap::new();
        for request in &self.requests {
            let stem = request.output_stem().to_lowercase();
            if let Some(other) = stems.insert(stem.clone(), request.kind()) {
                return Err(Error::InvalidInput(format!(
                    "{} and {} would both be written to {}.csv",
                    other,
                    request.kind(),
                    stem
                )));
            }
        }
        Ok(())
    }

    pub fn needs_snapshots(&self) -> bool {
        self.requests.iter().any(HiveRequest::needs_snapshot)
    }
}

/// Default pool size: one worker per hive, capped
pub fn default_workers(hives: usize) -> usize {
    hives.clamp(1, DEFAULT_MAX_WORKERS)
}

fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidInput(format!("cannot determine directory of {}", exe.display())))
}
