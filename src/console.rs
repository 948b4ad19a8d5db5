use colored::*;
use halcon_license_updater::events::{EventSink, PipelineEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

/// Terminal front end: log lines go through `log`, downloads get a progress bar.
pub struct ConsoleSink {
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Clears bars whose downloads ended between two progress steps.
    pub fn finish_all(&self) {
        if let Ok(mut bars) = self.bars.lock() {
            for (_, pb) in bars.drain() {
                pb.finish_and_clear();
            }
        }
    }

    fn progress_bar(total: u64, file: &str) -> ProgressBar {
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(file.to_string());
        pb
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Log { level, message } => log::log!(level, "{}", message),
            PipelineEvent::Status(status) => println!("{}", status.dimmed()),
            PipelineEvent::Progress {
                file,
                percent,
                received,
                total,
            } => {
                let Ok(mut bars) = self.bars.lock() else {
                    return;
                };
                let pb = bars
                    .entry(file.clone())
                    .or_insert_with(|| Self::progress_bar(total, &file));
                pb.set_position(received);
                if percent >= 100 {
                    pb.finish();
                    bars.remove(&file);
                }
            }
            PipelineEvent::Notice(notice) => println!("{}", notice.yellow().bold()),
        }
    }
}
