use log::Level;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Log { level: Level, message: String },
    /// One-line status for a status bar.
    Status(String),
    Progress {
        file: String,
        percent: u64,
        received: u64,
        total: u64,
    },
    /// Something an attended user should be told about explicitly.
    Notice(String),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);

    fn info(&self, message: String) {
        self.emit(PipelineEvent::Log {
            level: Level::Info,
            message,
        });
    }

    fn warn(&self, message: String) {
        self.emit(PipelineEvent::Log {
            level: Level::Warn,
            message,
        });
    }

    fn error(&self, message: String) {
        self.emit(PipelineEvent::Log {
            level: Level::Error,
            message,
        });
    }

    fn status(&self, status: &str) {
        self.emit(PipelineEvent::Status(status.to_string()));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Log { level, message } => log::log!(level, "{}", message),
            PipelineEvent::Status(status) => log::debug!("status: {}", status),
            PipelineEvent::Progress {
                file,
                percent,
                received,
                total,
            } => log::info!(
                "{}: {}% ({}/{})",
                file,
                percent,
                crate::types::format_size(received),
                crate::types::format_size(total)
            ),
            PipelineEvent::Notice(notice) => log::warn!("{}", notice),
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn messages_at(&self, wanted: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::Log { level, message } if level == wanted => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order_and_filters_by_level() {
        let sink = RecordingSink::new();
        sink.info("first".into());
        sink.warn("second".into());
        sink.status("busy");
        sink.info("third".into());

        assert_eq!(sink.events().len(), 4);
        assert_eq!(sink.messages_at(Level::Info), vec!["first", "third"]);
        assert_eq!(sink.messages_at(Level::Warn), vec!["second"]);
    }
}
