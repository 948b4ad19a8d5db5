use crate::config::{ConfigStore, Settings, SharedSettings};
use crate::downloader::Downloader;
use crate::error::UpdaterError;
use crate::events::{EventSink, PipelineEvent};
use crate::install::Installer;
use crate::listing::ListingClient;
use crate::scheduler::{FlightGuard, ScheduledJob, TickOutcome};
use crate::types::{
    format_size, CheckSummary, FolderKey, InstallMode, InstallReport, Trigger,
};
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const USER_AGENT: &str = "HalconLicenseUpdater";
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The shared client used for listing and downloads.
pub fn http_client() -> Result<reqwest::Client, UpdaterError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?)
}

pub struct Orchestrator {
    settings: SharedSettings,
    config: Option<Mutex<ConfigStore>>,
    listing: ListingClient,
    downloader: Downloader,
    installer: Installer,
    sink: Arc<dyn EventSink>,
    guard: FlightGuard,
    cancel: CancellationToken,
    today: fn() -> NaiveDate,
}

impl Orchestrator {
    pub fn new(
        settings: SharedSettings,
        sink: Arc<dyn EventSink>,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            config: None,
            listing: ListingClient::new(client.clone()),
            downloader: Downloader::new(client, Arc::clone(&sink), cancel.clone()),
            installer: Installer::new(Arc::clone(&sink)),
            sink,
            guard: FlightGuard::new(),
            cancel,
            today: || Local::now().date_naive(),
        }
    }

    /// Re-reads `store` into the shared settings at the start of every run,
    /// so edits to the file reach a long-running service.
    pub fn with_config(mut self, store: ConfigStore) -> Self {
        self.config = Some(Mutex::new(store));
        self
    }

    /// Date source for the folder key.
    pub fn with_today(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn with_relay_backoff(mut self, backoff: Duration) -> Self {
        self.downloader = self.downloader.with_backoff(backoff);
        self
    }

    pub fn with_install_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.installer = self.installer.with_clock(clock);
        self
    }

    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }

    /// Aborts in-flight HTTP work. Runs started afterwards fail fast.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// One full check. Rejected with [`UpdaterError::Busy`] while another
    /// run or install holds the guard.
    pub async fn run_check(&self, trigger: Trigger) -> Result<CheckSummary, UpdaterError> {
        let Some(_permit) = self.guard.try_acquire() else {
            self.sink
                .emit(PipelineEvent::Notice("An update check is already running".to_string()));
            return Err(UpdaterError::Busy);
        };

        let result = self.check(trigger).await;
        if let Err(e) = &result {
            self.sink.error(format!("Update check failed: {}", e));
            self.sink.status("Update check failed");
        }
        result
    }

    async fn current_settings(&self) -> Settings {
        let reloaded = self.config.as_ref().and_then(|config| {
            let mut store = config.lock().ok()?;
            match store.reload() {
                Ok(()) => Some(store.settings().clone()),
                Err(e) => {
                    self.sink
                        .warn(format!("Keeping previous settings, reload failed: {}", e));
                    None
                }
            }
        });
        if let Some(fresh) = reloaded {
            *self.settings.write().await = fresh;
        }
        self.settings.read().await.clone()
    }

    async fn check(&self, trigger: Trigger) -> Result<CheckSummary, UpdaterError> {
        let start_time = Instant::now();
        // Read once; edits made during the run apply to the next one.
        let settings = self.current_settings().await;
        let download_root = settings
            .download_root()
            .ok_or(UpdaterError::MissingDownloadPath)?;

        let folder = FolderKey::for_date(&(self.today)());
        self.sink.status("Checking for the latest license...");
        self.sink
            .info(format!("Checking for license updates ({})", trigger));
        self.sink.info(format!("Current folder: {}", folder));

        let (entries, listing_failed) = match self
            .listing
            .list_license_files(&settings.halcon_download_url, &folder)
            .await
        {
            Ok(entries) => (entries, false),
            Err(e) => {
                self.sink
                    .error(format!("Failed to fetch license listing: {}", e));
                (Vec::new(), true)
            }
        };

        let mut summary = CheckSummary {
            trigger,
            folder_key: folder.clone(),
            found: entries.len(),
            downloaded: 0,
            failed: 0,
            listing_failed,
            total_bytes: 0,
            total_duration: Duration::ZERO,
            outcomes: Vec::new(),
            install: None,
        };

        if listing_failed {
            self.sink.status("License listing unavailable");
            if trigger == Trigger::Manual {
                self.sink.emit(PipelineEvent::Notice(format!(
                    "Could not fetch the license listing for {}. Check the network and try again.",
                    folder
                )));
            }
            summary.total_duration = start_time.elapsed();
            return Ok(summary);
        }

        if entries.is_empty() {
            self.sink
                .warn(format!("No license files found for {}", folder));
            self.sink.status("No new license found");
            if trigger == Trigger::Manual {
                self.sink.emit(PipelineEvent::Notice(format!(
                    "No license files found for {}. Try again later.",
                    folder
                )));
            }
            summary.total_duration = start_time.elapsed();
            return Ok(summary);
        }

        self.sink
            .info(format!("Found {} license file(s):", entries.len()));
        for entry in &entries {
            self.sink.info(format!(
                "  - {} ({})",
                entry.name,
                format_size(entry.size_bytes)
            ));
        }

        let month_dir = download_root.join(folder.as_str());
        if !tokio::fs::try_exists(&month_dir).await? {
            tokio::fs::create_dir_all(&month_dir).await?;
            self.sink
                .info(format!("Created directory {}", month_dir.display()));
        }

        let outcomes = self
            .downloader
            .download_all(&entries, settings.use_proxy, &settings.relays, &month_dir)
            .await;
        if let Err(e) = self.downloader.write_report_csv(&outcomes, &month_dir).await {
            self.sink
                .warn(format!("Failed to write download report: {}", e));
        }

        summary.downloaded = outcomes.iter().filter(|o| o.succeeded()).count();
        summary.failed = outcomes.len() - summary.downloaded;
        summary.total_bytes = outcomes.iter().map(|o| o.bytes_written).sum();
        summary.outcomes = outcomes;
        self.sink.info(format!(
            "Download finished: {} succeeded, {} failed",
            summary.downloaded, summary.failed
        ));
        self.sink.status("Download finished");

        if self.cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }

        if trigger == Trigger::Scheduled {
            if let Some(install_root) = settings.install_root() {
                match self
                    .installer
                    .install_all(&month_dir, &install_root, InstallMode::Silent)
                    .await
                {
                    Ok(report) => summary.install = Some(report),
                    Err(e) => self.sink.error(format!("Install failed: {}", e)),
                }
            }
        }

        summary.total_duration = start_time.elapsed();
        Ok(summary)
    }

    /// Installs the current period's downloads into the configured SDK directory.
    pub async fn install_now(&self, mode: InstallMode) -> Result<InstallReport, UpdaterError> {
        let Some(_permit) = self.guard.try_acquire() else {
            return Err(UpdaterError::Busy);
        };

        let settings = self.current_settings().await;
        let result = async {
            let install_root = settings
                .install_root()
                .ok_or(UpdaterError::MissingInstallPath)?;
            let download_root = settings
                .download_root()
                .ok_or(UpdaterError::MissingDownloadPath)?;
            let folder = FolderKey::for_date(&(self.today)());
            self.installer
                .install_all(&download_root.join(folder.as_str()), &install_root, mode)
                .await
        }
        .await;

        if let Err(e) = &result {
            self.sink.error(format!("Install failed: {}", e));
            if mode == InstallMode::Interactive && e.is_structural() {
                self.sink.emit(PipelineEvent::Notice(e.to_string()));
            }
        }
        result
    }
}

impl ScheduledJob for Orchestrator {
    async fn run_scheduled(&self) -> TickOutcome {
        match self.run_check(Trigger::Scheduled).await {
            Err(UpdaterError::Busy) => TickOutcome::Skipped,
            _ => TickOutcome::Completed,
        }
    }

    fn is_running(&self) -> bool {
        self.guard.is_busy()
    }
}
