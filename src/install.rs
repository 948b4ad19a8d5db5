use crate::error::UpdaterError;
use crate::events::{EventSink, PipelineEvent};
use crate::listing::is_license_file;
use crate::types::{InstallMode, InstallRecord, InstallReport};
use chrono::{Local, NaiveDateTime};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LICENSE_DIR: &str = "license";

const BACKUP_TIMESTAMP: &str = "%Y%m%d%H%M%S";

pub struct Installer {
    sink: Arc<dyn EventSink>,
    clock: fn() -> NaiveDateTime,
}

impl Installer {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            clock: || Local::now().naive_local(),
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Installs every license file found in `source_dir` under `<install_root>/license`.
    pub async fn install_all(
        &self,
        source_dir: &Path,
        install_root: &Path,
        mode: InstallMode,
    ) -> Result<InstallReport, UpdaterError> {
        if !tokio::fs::try_exists(install_root).await? {
            return Err(UpdaterError::InstallPathNotFound(install_root.to_path_buf()));
        }

        let license_dir = install_root.join(LICENSE_DIR);
        if !tokio::fs::try_exists(&license_dir).await? {
            tokio::fs::create_dir_all(&license_dir).await?;
            self.sink
                .info(format!("Created license directory {}", license_dir.display()));
        }

        let mut report = InstallReport {
            license_dir: license_dir.clone(),
            ..Default::default()
        };

        let sources = if tokio::fs::try_exists(source_dir).await? {
            license_files_in(source_dir).await?
        } else {
            Vec::new()
        };
        if sources.is_empty() {
            self.nothing_to_install(source_dir, mode);
            return Ok(report);
        }

        self.sink
            .info(format!("Installing {} license file(s)...", sources.len()));

        for source in sources {
            match self.install_one(&source, &license_dir).await {
                Ok(record) => report.records.push(record),
                Err(e) => {
                    self.sink
                        .error(format!("Failed to install {}: {}", source.display(), e));
                    report.failures.push((source, e.to_string()));
                }
            }
        }

        self.sink.info(format!(
            "Installed {}/{} file(s) into {}",
            report.installed(),
            report.installed() + report.failed(),
            license_dir.display()
        ));
        self.sink
            .info("Restart Halcon for the new license to take effect".to_string());
        if mode == InstallMode::Interactive {
            self.sink.emit(PipelineEvent::Notice(format!(
                "Installed {} license file(s) into {}. Restart Halcon to apply.",
                report.installed(),
                license_dir.display()
            )));
        }
        self.sink.status("Install finished");

        Ok(report)
    }

    async fn install_one(&self, source: &Path, license_dir: &Path) -> Result<InstallRecord, UpdaterError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| UpdaterError::Config(format!("not a file: {}", source.display())))?;
        let dest = license_dir.join(file_name);

        let backup_file = if tokio::fs::try_exists(&dest).await? {
            let backup = backup_path_for(&dest, (self.clock)());
            tokio::fs::copy(&dest, &backup).await?;
            self.sink.info(format!(
                "  backup: {} -> {}",
                file_name.to_string_lossy(),
                backup.file_name().unwrap_or_default().to_string_lossy()
            ));
            Some(backup)
        } else {
            None
        };

        tokio::fs::copy(source, &dest).await?;
        self.sink
            .info(format!("Installed {}", file_name.to_string_lossy()));

        Ok(InstallRecord {
            source_file: source.to_path_buf(),
            dest_file: dest,
            backup_file,
        })
    }

    fn nothing_to_install(&self, source_dir: &Path, mode: InstallMode) {
        self.sink.warn(format!(
            "Nothing to install: no license files in {}",
            source_dir.display()
        ));
        if mode == InstallMode::Interactive {
            self.sink.emit(PipelineEvent::Notice(
                "Download this month's license files before installing".to_string(),
            ));
        }
    }
}

/// First free backup name for `dest` at or after `now`.
///
/// Taken names push the timestamp forward one second at a time, so two
/// installs within the same second still get distinct backups.
pub fn backup_path_for(dest: &Path, now: NaiveDateTime) -> PathBuf {
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = dest
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));

    let mut stamp = now;
    loop {
        let candidate = dir.join(format!(
            "{}_backup_{}{}",
            stem,
            stamp.format(BACKUP_TIMESTAMP),
            extension
        ));
        if !candidate.exists() {
            return candidate;
        }
        stamp += chrono::Duration::seconds(1);
    }
}

async fn license_files_in(dir: &Path) -> Result<Vec<PathBuf>, UpdaterError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_match = path
            .file_name()
            .map(|n| is_license_file(&n.to_string_lossy()))
            .unwrap_or(false);
        if is_match && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use chrono::NaiveDate;
    use std::fs;

    fn fixed_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn is_backup_name(name: &str, stem: &str) -> bool {
        let prefix = format!("{}_backup_", stem);
        name.strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".dat"))
            .map(|stamp| stamp.len() == 14 && stamp.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    }

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_backup_name(&p.file_name().unwrap().to_string_lossy(), "foo"))
            .collect();
        found.sort();
        found
    }

    #[test]
    fn backup_name_uses_second_resolution_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("foo.dat");
        let backup = backup_path_for(&dest, fixed_now());
        assert_eq!(backup, dir.path().join("foo_backup_20240315093000.dat"));
    }

    #[test]
    fn taken_backup_name_advances_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("foo.dat");
        fs::write(dir.path().join("foo_backup_20240315093000.dat"), "old").unwrap();
        let backup = backup_path_for(&dest, fixed_now());
        assert_eq!(backup, dir.path().join("foo_backup_20240315093001.dat"));
    }

    #[tokio::test]
    async fn existing_file_is_backed_up_before_overwrite() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let license_dir = root.path().join(LICENSE_DIR);
        fs::create_dir_all(&license_dir).unwrap();
        fs::write(license_dir.join("foo.dat"), "old license").unwrap();
        fs::write(source.path().join("foo.dat"), "new license").unwrap();
        fs::write(source.path().join("notes.txt"), "ignored").unwrap();

        let installer = Installer::new(Arc::new(RecordingSink::new()));
        let report = installer
            .install_all(source.path(), root.path(), InstallMode::Silent)
            .await
            .unwrap();

        assert_eq!(report.installed(), 1);
        assert_eq!(report.failed(), 0);
        let backup = report.records[0].backup_file.clone().unwrap();
        assert!(is_backup_name(
            &backup.file_name().unwrap().to_string_lossy(),
            "foo"
        ));
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old license");
        assert_eq!(
            fs::read_to_string(license_dir.join("foo.dat")).unwrap(),
            "new license"
        );
        assert!(!license_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn repeated_installs_keep_distinct_backups() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let license_dir = root.path().join(LICENSE_DIR);
        fs::create_dir_all(&license_dir).unwrap();
        fs::write(license_dir.join("foo.dat"), "old").unwrap();
        fs::write(source.path().join("foo.dat"), "fresh").unwrap();

        let installer = Installer::new(Arc::new(RecordingSink::new())).with_clock(fixed_now);
        for _ in 0..2 {
            installer
                .install_all(source.path(), root.path(), InstallMode::Silent)
                .await
                .unwrap();
        }

        let backups = backups_in(&license_dir);
        assert_eq!(backups.len(), 2);
        assert_ne!(backups[0], backups[1]);
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "old");
        assert_eq!(fs::read_to_string(&backups[1]).unwrap(), "fresh");
        assert_eq!(
            fs::read_to_string(license_dir.join("foo.dat")).unwrap(),
            "fresh"
        );
    }

    #[tokio::test]
    async fn one_blocked_file_does_not_stop_the_rest() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let license_dir = root.path().join(LICENSE_DIR);
        fs::create_dir_all(license_dir.join("a.dat")).unwrap();
        fs::write(source.path().join("a.dat"), "a").unwrap();
        fs::write(source.path().join("b.dat"), "b").unwrap();

        let sink = RecordingSink::new();
        let installer = Installer::new(Arc::new(sink.clone()));
        let report = installer
            .install_all(source.path(), root.path(), InstallMode::Silent)
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, source.path().join("a.dat"));
        assert_eq!(report.installed(), 1);
        assert_eq!(fs::read_to_string(license_dir.join("b.dat")).unwrap(), "b");
        assert!(license_dir.join("a.dat").is_dir());
        assert_eq!(sink.messages_at(log::Level::Error).len(), 1);
    }

    #[tokio::test]
    async fn fresh_install_creates_license_dir_without_backup() {
        let source = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        fs::write(source.path().join("A.DAT"), "a").unwrap();

        let installer = Installer::new(Arc::new(RecordingSink::new()));
        let report = installer
            .install_all(source.path(), root.path(), InstallMode::Silent)
            .await
            .unwrap();

        assert_eq!(report.installed(), 1);
        assert_eq!(report.records[0].backup_file, None);
        assert!(root.path().join(LICENSE_DIR).join("A.DAT").exists());
    }

    #[tokio::test]
    async fn missing_source_dir_is_nothing_to_install() {
        let root = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let installer = Installer::new(Arc::new(sink.clone()));

        let report = installer
            .install_all(
                &root.path().join("downloads/2024.03"),
                root.path(),
                InstallMode::Interactive,
            )
            .await
            .unwrap();

        assert!(report.is_empty());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Notice(_))));
    }

    #[tokio::test]
    async fn silent_mode_raises_no_notice() {
        let root = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let installer = Installer::new(Arc::new(sink.clone()));

        installer
            .install_all(&root.path().join("missing"), root.path(), InstallMode::Silent)
            .await
            .unwrap();

        assert!(!sink
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Notice(_))));
    }

    #[tokio::test]
    async fn missing_install_root_is_structural() {
        let source = tempfile::tempdir().unwrap();
        let installer = Installer::new(Arc::new(RecordingSink::new()));
        let err = installer
            .install_all(
                source.path(),
                &source.path().join("no-such-halcon"),
                InstallMode::Silent,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::InstallPathNotFound(_)));
        assert!(err.is_structural());
    }
}
