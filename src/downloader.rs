use crate::error::UpdaterError;
use crate::events::{EventSink, PipelineEvent};
use crate::listing::is_plain_file_name;
use crate::relay::{relay_label, resolve_candidates};
use crate::types::{format_size, DownloadOutcome, DownloadStatus, RemoteFileEntry};
use futures::TryStreamExt;
use log::{debug, error};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: usize = 8 * 1024;
pub const RELAY_BACKOFF: Duration = Duration::from_secs(1);
pub const REPORT_FILE: &str = "download_report.csv";

const PROGRESS_STEP: u64 = 20;

pub struct Downloader {
    client: reqwest::Client,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    backoff: Duration,
}

impl Downloader {
    pub fn new(client: reqwest::Client, sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self {
            client,
            sink,
            cancel,
            backoff: RELAY_BACKOFF,
        }
    }

    /// Pause between two relay attempts for the same file.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Downloads every entry into `output_dir`, one file at a time.
    ///
    /// Per-file failures are recorded in the returned outcomes and never
    /// stop the batch; only cancellation cuts it short.
    pub async fn download_all(
        &self,
        entries: &[RemoteFileEntry],
        use_relay: bool,
        relays: &[String],
        output_dir: &Path,
    ) -> Vec<DownloadOutcome> {
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            let start_time = Instant::now();

            let result = if !is_plain_file_name(&entry.name) {
                Err(UpdaterError::UnsafeFileName(entry.name.clone()))
            } else {
                match resolve_candidates(use_relay, relays, &entry.download_url) {
                    Ok(candidates) => {
                        let dest = output_dir.join(&entry.name);
                        self.download_to_file(entry, &candidates, &dest).await
                    }
                    Err(e) => Err(e),
                }
            };

            let cancelled = matches!(result, Err(UpdaterError::Cancelled));
            let outcome = match result {
                Ok((bytes_written, source_url)) => DownloadOutcome {
                    file_name: entry.name.clone(),
                    status: DownloadStatus::Success,
                    bytes_written,
                    source_url: Some(source_url),
                    duration: start_time.elapsed(),
                    error: None,
                },
                Err(e) => {
                    self.sink
                        .error(format!("Download of {} failed: {}", entry.name, e));
                    DownloadOutcome {
                        file_name: entry.name.clone(),
                        status: DownloadStatus::Failed,
                        bytes_written: 0,
                        source_url: None,
                        duration: start_time.elapsed(),
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);

            if cancelled {
                break;
            }
        }

        outcomes
    }

    /// Tries each candidate URL in order and stops at the first success.
    ///
    /// Returns the number of bytes written and the URL that served them.
    /// Nothing is left at `dest` unless a candidate delivered the whole body.
    pub async fn download_to_file(
        &self,
        entry: &RemoteFileEntry,
        candidates: &[String],
        dest: &Path,
    ) -> Result<(u64, String), UpdaterError> {
        for (index, url) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(UpdaterError::Cancelled);
            }

            let label = url
                .strip_suffix(entry.download_url.as_str())
                .map(relay_label)
                .unwrap_or_else(|| url.clone());
            self.sink
                .info(format!("Downloading {} via {}", entry.name, label));

            match self.fetch_with_progress(url, &entry.name).await {
                Ok(body) => {
                    write_atomically(dest, &body).await?;
                    self.sink.info(format!(
                        "Downloaded {} ({})",
                        entry.name,
                        format_size(body.len() as u64)
                    ));
                    return Ok((body.len() as u64, url.clone()));
                }
                Err(UpdaterError::Cancelled) => return Err(UpdaterError::Cancelled),
                Err(e) => {
                    self.sink
                        .warn(format!("  relay failed: {} - {}", label, e));
                    if index + 1 < candidates.len() {
                        self.sink.info("  switching to next relay...".to_string());
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(UpdaterError::Cancelled),
                            _ = sleep(self.backoff) => {}
                        }
                    }
                }
            }
        }

        Err(UpdaterError::AllRelaysFailed {
            file: entry.name.clone(),
            attempts: candidates.len(),
        })
    }

    /// Streams one URL into memory in fixed-size reads, reporting progress
    /// every 20 percent when the length is known.
    pub async fn fetch_with_progress(&self, url: &str, file_name: &str) -> Result<Vec<u8>, UpdaterError> {
        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(UpdaterError::Cancelled),
            resp = self.client.get(url).send() => resp?,
        };

        if !resp.status().is_success() {
            return Err(UpdaterError::HttpStatus {
                status: resp.status(),
                url: url.to_string(),
            });
        }

        let total_size = resp.content_length().unwrap_or(0);
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(Box::pin(stream));

        let mut body = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut last_percent = 0;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Err(UpdaterError::Cancelled),
                read = reader.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            body.extend_from_slice(&buf[..read]);

            if total_size > 0 {
                let received = body.len() as u64;
                let percent = received * 100 / total_size;
                if percent >= last_percent + PROGRESS_STEP {
                    self.sink.emit(PipelineEvent::Progress {
                        file: file_name.to_string(),
                        percent,
                        received,
                        total: total_size,
                    });
                    last_percent = percent;
                }
            }
        }

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Writes a per-file report of one batch into `output_dir`.
    pub async fn write_report_csv(
        &self,
        outcomes: &[DownloadOutcome],
        output_dir: &Path,
    ) -> Result<PathBuf, UpdaterError> {
        tokio::fs::create_dir_all(output_dir).await?;

        let report_path = output_dir.join(REPORT_FILE);
        let mut wtr = csv::WriterBuilder::new().from_path(&report_path)?;

        wtr.write_record([
            "Filename",
            "Status",
            "Size (bytes)",
            "Duration (s)",
            "Source URL",
            "Error",
        ])?;

        for outcome in outcomes {
            wtr.write_record(&[
                outcome.file_name.clone(),
                format!("{:?}", outcome.status),
                outcome.bytes_written.to_string(),
                format!("{:.2}", outcome.duration.as_secs_f64()),
                outcome.source_url.clone().unwrap_or_default(),
                outcome.error.clone().unwrap_or_default(),
            ])?;
        }

        wtr.flush()?;
        Ok(report_path)
    }
}

/// Writes to `<dest>.part` first and renames over `dest`, so a failed write
/// never leaves a truncated license file behind.
async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), UpdaterError> {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    let result = async {
        let mut file = File::create(&part).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await
    }
    .await;

    if let Err(e) = result {
        error!("Failed to write {}: {}", dest.display(), e);
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use log::Level;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(name: &str, url: &str) -> RemoteFileEntry {
        RemoteFileEntry {
            name: name.to_string(),
            download_url: url.to_string(),
            size_bytes: 0,
        }
    }

    fn downloader(sink: &RecordingSink) -> Downloader {
        Downloader::new(
            reqwest::Client::new(),
            Arc::new(sink.clone()),
            CancellationToken::new(),
        )
        .with_backoff(Duration::from_millis(5))
    }

    async fn mount(server: &MockServer, at: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn falls_through_bad_relays_to_the_good_one() {
        let server = MockServer::start().await;
        mount(&server, "/bad1/lic.dat", ResponseTemplate::new(500)).await;
        mount(&server, "/bad2/lic.dat", ResponseTemplate::new(404)).await;
        mount(
            &server,
            "/good/lic.dat",
            ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("lic.dat");
        let sink = RecordingSink::new();
        let candidates: Vec<String> = ["bad1", "bad2", "good"]
            .iter()
            .map(|r| format!("{}/{}/lic.dat", server.uri(), r))
            .collect();

        let (written, used) = downloader(&sink)
            .download_to_file(&entry("lic.dat", "lic.dat"), &candidates, &dest)
            .await
            .unwrap();

        assert_eq!(written, 4096);
        assert_eq!(used, candidates[2]);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);
        assert_eq!(sink.messages_at(Level::Warn).len(), 2);
    }

    #[tokio::test]
    async fn all_relays_failing_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("lic.dat");
        let sink = RecordingSink::new();
        let candidates = vec![
            format!("{}/r1/lic.dat", server.uri()),
            format!("{}/r2/lic.dat", server.uri()),
        ];

        let err = downloader(&sink)
            .download_to_file(&entry("lic.dat", "lic.dat"), &candidates, &dest)
            .await
            .unwrap_err();

        match err {
            UpdaterError::AllRelaysFailed { file, attempts } => {
                assert_eq!(file, "lic.dat");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reports_progress_in_coarse_steps() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/big.dat",
            ResponseTemplate::new(200).set_body_bytes(vec![1u8; 200 * 1024]),
        )
        .await;

        let sink = RecordingSink::new();
        let body = downloader(&sink)
            .fetch_with_progress(&format!("{}/big.dat", server.uri()), "big.dat")
            .await
            .unwrap();
        assert_eq!(body.len(), 200 * 1024);

        let percents: Vec<u64> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.len() <= 5);
        assert!(percents.windows(2).all(|w| w[1] >= w[0] + PROGRESS_STEP));
    }

    #[tokio::test]
    async fn batch_continues_past_failed_file() {
        let server = MockServer::start().await;
        mount(&server, "/a.dat", ResponseTemplate::new(500)).await;
        mount(
            &server,
            "/b.dat",
            ResponseTemplate::new(200).set_body_string("license-b"),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let entries = vec![
            entry("a.dat", &format!("{}/a.dat", server.uri())),
            entry("b.dat", &format!("{}/b.dat", server.uri())),
        ];

        let outcomes = downloader(&sink)
            .download_all(&entries, false, &[], dir.path())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].succeeded());
        assert!(outcomes[1].succeeded());
        assert_eq!(outcomes[1].bytes_written, 9);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.dat")).unwrap(),
            "license-b"
        );
    }

    #[tokio::test]
    async fn entry_escaping_output_dir_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .expect(0)
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let output_dir = root.path().join("dl/2024.03");
        std::fs::create_dir_all(&output_dir).unwrap();
        let sink = RecordingSink::new();
        let entries = vec![entry(
            "../../escaped.dat",
            &format!("{}/escaped.dat", server.uri()),
        )];

        let outcomes = downloader(&sink)
            .download_all(&entries, false, &[], &output_dir)
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].succeeded());
        assert!(outcomes[0].error.as_deref().unwrap().contains("unsafe name"));
        assert!(!root.path().join("escaped.dat").exists());
    }

    #[tokio::test]
    async fn failed_write_cleans_up_part_file() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/lic.dat",
            ResponseTemplate::new(200).set_body_string("license"),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        // A directory in the way makes the final rename fail.
        let dest = dir.path().join("lic.dat");
        std::fs::create_dir(&dest).unwrap();
        let sink = RecordingSink::new();

        let err = downloader(&sink)
            .download_to_file(
                &entry("lic.dat", "lic.dat"),
                &[format!("{}/lic.dat", server.uri())],
                &dest,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::IoError(_)));
        assert!(!dir.path().join("lic.dat.part").exists());
        assert!(!dest.is_file());
    }

    #[tokio::test]
    async fn cancelled_downloader_does_not_fetch() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let downloader = Downloader::new(reqwest::Client::new(), Arc::new(sink), cancel);

        let dir = tempfile::tempdir().unwrap();
        let err = downloader
            .download_to_file(
                &entry("a.dat", "http://127.0.0.1:9/a.dat"),
                &["http://127.0.0.1:9/a.dat".to_string()],
                &dir.path().join("a.dat"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Cancelled));
    }

    #[tokio::test]
    async fn report_lists_every_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let outcomes = vec![
            DownloadOutcome {
                file_name: "a.dat".into(),
                status: DownloadStatus::Success,
                bytes_written: 12,
                source_url: Some("https://relay/a.dat".into()),
                duration: Duration::from_millis(250),
                error: None,
            },
            DownloadOutcome {
                file_name: "b.dat".into(),
                status: DownloadStatus::Failed,
                bytes_written: 0,
                source_url: None,
                duration: Duration::from_millis(10),
                error: Some("All 1 download relays failed for b.dat".into()),
            },
        ];

        let path = downloader(&sink)
            .write_report_csv(&outcomes, dir.path())
            .await
            .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("a.dat,Success,12,"));
        assert!(lines[2].contains("Failed"));
    }
}
