use chrono::Datelike;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Remote folder holding one period's license files, formatted `YYYY.MM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderKey(String);

impl FolderKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_date<D: Datelike>(date: &D) -> Self {
        Self(format!("{}.{:02}", date.year(), date.month()))
    }

    /// Recomputed on every call; never cache the result across runs.
    pub fn current() -> Self {
        Self::for_date(&chrono::Local::now().date_naive())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub name: String,
    pub download_url: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => f.write_str("manual"),
            Trigger::Scheduled => f.write_str("scheduled"),
        }
    }
}

/// Silent installs only log; interactive installs also raise notices for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Silent,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdateInterval {
    Hourly,
    SixHourly,
    Daily,
    Weekly,
}

impl UpdateInterval {
    const ALL: [UpdateInterval; 4] = [
        UpdateInterval::Hourly,
        UpdateInterval::SixHourly,
        UpdateInterval::Daily,
        UpdateInterval::Weekly,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn duration(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            UpdateInterval::Hourly => Duration::from_secs(HOUR),
            UpdateInterval::SixHourly => Duration::from_secs(6 * HOUR),
            UpdateInterval::Daily => Duration::from_secs(24 * HOUR),
            UpdateInterval::Weekly => Duration::from_secs(7 * 24 * HOUR),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_name: String,
    pub status: DownloadStatus,
    pub bytes_written: u64,
    /// Candidate URL that served the file.
    pub source_url: Option<String>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == DownloadStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub source_file: PathBuf,
    pub dest_file: PathBuf,
    pub backup_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub license_dir: PathBuf,
    pub records: Vec<InstallRecord>,
    pub failures: Vec<(PathBuf, String)>,
}

impl InstallReport {
    pub fn installed(&self) -> usize {
        self.records.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct CheckSummary {
    pub trigger: Trigger,
    pub folder_key: FolderKey,
    pub found: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// The listing request itself failed, so `found == 0` says nothing about the remote folder.
    pub listing_failed: bool,
    pub total_bytes: u64,
    pub total_duration: Duration,
    pub outcomes: Vec<DownloadOutcome>,
    pub install: Option<InstallReport>,
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut len = bytes as f64;
    let mut order = 0;
    while len >= 1024.0 && order < UNITS.len() - 1 {
        order += 1;
        len /= 1024.0;
    }
    let text = format!("{:.2}", len);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", text, UNITS[order])
}
