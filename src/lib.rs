//! Whisper Hub - orchestration for long-running media transcription jobs
//!
//! This crate drives an external speech-to-text engine (the `whisper` CLI by
//! default) on behalf of connected WebSocket clients. It features:
//!
//! - Admission checks and live process tracking per client
//! - Round-robin device assignment across two GPUs
//! - Progress parsing of the engine's stderr and fan-out to every client
//! - A sequential post-processing pipeline (relocation, script
//!   normalization, translation, manifest)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use whisper_hub::{
//!     config::HubConfig,
//!     orchestrator::Orchestrator,
//!     protocol::{Job, JobRequest},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Arc::new(Orchestrator::from_config(&HubConfig::default())?);
//!
//!     let request = JobRequest {
//!         client_id: "client-1".to_string(),
//!         uploaded_file_path: "uploads/3f2a9c".into(),
//!         original_file_name: "interview.mp3".to_string(),
//!         language: "auto-detect".to_string(),
//!         model: Some("small".to_string()),
//!         translate: false,
//!         upload_duration_secs: 312.0,
//!     };
//!
//!     orchestrator.registry().admit(&request.client_id).await;
//!     let report = orchestrator.run(Job::from_request(request)).await?;
//!     println!("{:?}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod hub;
pub mod languages;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod worker;

// Re-export commonly used types for convenience
pub use hub::ClientHub;
pub use orchestrator::{JobOutcome, JobReport, Orchestrator};
pub use progress::{ProgressParser, ProgressStream};
pub use protocol::{ClientId, Job, JobManifest, JobRequest, ProgressSample, ServerMessage};
pub use registry::JobRegistry;
pub use scheduler::{Device, DeviceScheduler};

use thiserror::Error;

/// Errors that can occur while orchestrating a transcription job
#[derive(Error, Debug)]
pub enum HubError {
    /// The engine exited with a non-zero status (or was killed)
    #[error("Engine failed with exit code {exit_code:?}")]
    Engine { exit_code: Option<i32> },

    /// The engine process could not be started
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    /// A post-processing step failed
    #[error("Pipeline step '{step}' failed: {source}")]
    PipelineIo {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The translation backend failed
    #[error("Translation error: {0}")]
    Translation(String),

    /// The job queue no longer accepts work
    #[error("Job queue is closed")]
    QueueClosed,

    /// A process for this job is already registered
    #[error("Job {0} already has a live process")]
    AlreadyRegistered(uuid::Uuid),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Wrap an I/O error with the pipeline step it came from
    pub fn pipeline(step: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| HubError::PipelineIo { step, source }
    }
}

/// Result type alias for whisper-hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default directory paths
pub const DEFAULT_TRANSCRIPTIONS_DIR: &str = "./transcriptions";
pub const DEFAULT_UPLOADS_DIR: &str = "./uploads";

/// Utility functions for common operations
pub mod utils {
    /// Render a number of seconds as readable text, e.g. `1 hour 2 minutes 5 seconds`
    pub fn for_humans(seconds: f64) -> String {
        let total = if seconds.is_finite() && seconds > 0.0 {
            seconds.round() as u64
        } else {
            0
        };

        let units = [
            ("year", 31_536_000),
            ("day", 86_400),
            ("hour", 3_600),
            ("minute", 60),
            ("second", 1),
        ];

        let mut remaining = total;
        let mut parts = Vec::new();
        for (name, size) in units {
            let amount = remaining / size;
            remaining %= size;
            if amount > 0 {
                let plural = if amount == 1 { "" } else { "s" };
                parts.push(format!("{} {}{}", amount, name, plural));
            }
        }

        if parts.is_empty() {
            "less than a second".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// Turn an arbitrary file name into something safe for directory and file names
    pub fn file_safe_name(name: &str) -> String {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let trimmed = safe.trim_matches('_');
        if trimmed.is_empty() {
            "untitled".to_string()
        } else {
            trimmed.to_string()
        }
    }
}
