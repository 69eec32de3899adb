//! Core data types shared by the snapshot, decode, normalize and driver stages.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One of the five well-known system hives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HiveKind {
    Sam,
    System,
    Software,
    Security,
    Default,
}

impl HiveKind {
    /// All hives in the order they are requested by the CLI
    pub const ALL: [HiveKind; 5] = [
        HiveKind::Sam,
        HiveKind::System,
        HiveKind::Software,
        HiveKind::Security,
        HiveKind::Default,
    ];

    /// Live registry key handed to the snapshot command
    pub fn live_key(&self) -> &'static str {
        match self {
            HiveKind::Sam => r"HKLM\SAM",
            HiveKind::System => r"HKLM\SYSTEM",
            HiveKind::Software => r"HKLM\SOFTWARE",
            HiveKind::Security => r"HKLM\SECURITY",
            HiveKind::Default => r"HKEY_USERS\.DEFAULT",
        }
    }

    /// File name used for the snapshot inside the run's temporary directory
    pub fn snapshot_file_name(&self) -> &'static str {
        match self {
            HiveKind::Sam => "sam",
            HiveKind::System => "system",
            HiveKind::Software => "software",
            HiveKind::Security => "security",
            HiveKind::Default => "default",
        }
    }

    /// Display name (SAM, SYSTEM, ...)
    pub fn name(&self) -> &'static str {
        match self {
            HiveKind::Sam => "SAM",
            HiveKind::System => "SYSTEM",
            HiveKind::Software => "SOFTWARE",
            HiveKind::Security => "SECURITY",
            HiveKind::Default => "DEFAULT",
        }
    }
}

impl fmt::Display for HiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a hive's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveSource {
    /// Save the live hive with the snapshot command
    Snapshot,
    /// Use a hive file the caller already has
    File(PathBuf),
}

/// A request to process one hive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiveRequest {
    kind: HiveKind,
    source: HiveSource,
}

impl HiveRequest {
    /// Request a fresh snapshot of the live hive
    pub fn snapshot(kind: HiveKind) -> Self {
        Self {
            kind,
            source: HiveSource::Snapshot,
        }
    }

    /// Request processing of an existing hive file
    pub fn from_file(kind: HiveKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            source: HiveSource::File(path.into()),
        }
    }

    pub fn kind(&self) -> HiveKind {
        self.kind
    }

    pub fn source(&self) -> &HiveSource {
        &self.source
    }

    pub fn needs_snapshot(&self) -> bool {
        matches!(self.source, HiveSource::Snapshot)
    }

    /// Base name of the CSV written for this request (`<basename>.csv`)
    ///
    /// Snapshots are named after the hive; supplied files keep their own name.
    pub fn output_stem(&self) -> String {
        match &self.source {
            HiveSource::Snapshot => self.kind.snapshot_file_name().to_string(),
            HiveSource::File(path) => file_name_of(path),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// One decoded registry key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Backslash separated key path starting at the hive root
    pub path: String,
    /// Key last-write time as ISO-8601 (`2023-08-14T09:15:42.123456+00:00`)
    pub timestamp: String,
    /// Value name and rendered data, in hive order
    pub values: Vec<(String, String)>,
}

impl KeyRecord {
    pub fn new(path: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timestamp: timestamp.into(),
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, data: impl Into<String>) -> Self {
        self.values.push((name.into(), data.into()));
        self
    }
}

/// Result of processing one hive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HiveOutcome {
    Success { output: PathBuf, rows: usize },
    Failure { hive: HiveKind, reason: String },
}

impl HiveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HiveOutcome::Success { .. })
    }
}

/// Per-hive outcomes of one pipeline run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: BTreeMap<HiveKind, HiveOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Human readable per-hive status lines
    pub fn summary_lines(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .map(|(kind, outcome)| match outcome {
                HiveOutcome::Success { output, rows } => {
                    format!("{:<8} ok      {} ({} rows)", kind, output.display(), rows)
                }
                HiveOutcome::Failure { reason, .. } => format!("{:<8} FAILED  {}", kind, reason),
            })
            .collect()
    }
}
