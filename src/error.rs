use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {status} for URL: {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("All {attempts} download relays failed for {file}")]
    AllRelaysFailed { file: String, attempts: usize },

    #[error("Invalid download URL: {0:?}")]
    InvalidUrl(String),

    #[error("Refusing to write remote file with unsafe name {0:?}")]
    UnsafeFileName(String),

    #[error("Download directory is not configured")]
    MissingDownloadPath,

    #[error("Halcon install directory is not configured")]
    MissingInstallPath,

    #[error("Halcon install directory does not exist: {}", .0.display())]
    InstallPathNotFound(PathBuf),

    #[error("Another update run is already in progress")]
    Busy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl UpdaterError {
    /// Precondition failures that end a single invocation and need user correction.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            UpdaterError::MissingDownloadPath
                | UpdaterError::MissingInstallPath
                | UpdaterError::InstallPathNotFound(_)
                | UpdaterError::Config(_)
        )
    }
}
