pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod install;
pub mod listing;
pub mod orchestrator;
pub mod relay;
pub mod scheduler;
pub mod types;

pub use config::{ConfigStore, Settings, SharedSettings};
pub use error::UpdaterError;
pub use events::{EventSink, LogSink, PipelineEvent};
pub use orchestrator::{http_client, Orchestrator};
pub use scheduler::{SchedulerState, UpdateScheduler};
pub use types::{CheckSummary, InstallMode, Trigger, UpdateInterval};
