use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::utils::{file_safe_name, for_humans};

/// Connection key of a real-time client; also the owner key of its jobs
pub type ClientId = String;

/// Language sentinel asking the engine to detect the spoken language
pub const AUTO_DETECT: &str = "auto-detect";

/// Returns true when the language value means "let the engine decide"
pub fn is_auto_detect(language: &str) -> bool {
    language.trim().is_empty() || language.eq_ignore_ascii_case(AUTO_DETECT)
}

/// Job submission as received from the upload layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Key of the submitting client connection
    pub client_id: ClientId,
    /// Where the upload layer stored the file
    pub uploaded_file_path: PathBuf,
    /// File name as the user uploaded it, with extension
    pub original_file_name: String,
    /// Desired language, or `auto-detect`
    #[serde(default = "default_language")]
    pub language: String,
    /// Model selector passed through to the engine
    #[serde(default)]
    pub model: Option<String>,
    /// Whether to translate after transcription
    #[serde(default)]
    pub translate: bool,
    /// Duration of the uploaded media, as probed by the upload layer
    #[serde(default)]
    pub upload_duration_secs: f64,
}

fn default_language() -> String {
    AUTO_DETECT.to_string()
}

/// One transcription request tracked end-to-end
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique identifier for this job
    pub id: Uuid,
    /// Owner connection key
    pub client_id: ClientId,
    /// Uploaded media, under its generated name
    pub uploaded_file: PathBuf,
    /// Original name including extension, e.g. `My Talk.mp4`
    pub original_file_name: String,
    /// Directory/file safe name without extension, e.g. `My_Talk`
    pub display_name: String,
    /// Extension of the original file including the dot, may be empty
    pub extension: String,
    /// Final directory name: safe name plus submission timestamp
    pub dated_name: String,
    /// Generated identifier scoping the engine output directory
    pub output_id: String,
    /// Requested language (may be the auto-detect sentinel)
    pub language: String,
    /// Model selector
    pub model: Option<String>,
    /// Translation requested
    pub translate: bool,
    /// Declared upload duration in seconds
    pub upload_duration_secs: f64,
    /// When the job was created
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Build a job from a submission, deriving all generated names
    pub fn from_request(request: JobRequest) -> Self {
        let submitted_at = Utc::now();
        let original = Path::new(&request.original_file_name);
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| request.original_file_name.clone());
        let extension = original
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let display_name = file_safe_name(&stem);
        let dated_name = format!(
            "{}_{}",
            display_name,
            submitted_at.format("%d-%B-%Y_%H_%M_%S")
        );

        // The upload layer names its files with a random identifier; reuse it
        let output_id = request
            .uploaded_file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            id: Uuid::new_v4(),
            client_id: request.client_id,
            uploaded_file: request.uploaded_file_path,
            original_file_name: request.original_file_name,
            display_name,
            extension,
            dated_name,
            output_id,
            language: request.language,
            model: request.model.filter(|m| !m.trim().is_empty()),
            translate: request.translate,
            upload_duration_secs: request.upload_duration_secs,
            submitted_at,
        }
    }

    /// File name of the upload as the engine sees it
    pub fn upload_file_name(&self) -> String {
        self.uploaded_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Display name with the original extension
    pub fn display_file_name(&self) -> String {
        format!("{}{}", self.display_name, self.extension)
    }

    /// Whether the engine should detect the language itself
    pub fn wants_auto_detect(&self) -> bool {
        is_auto_detect(&self.language)
    }
}

/// Ownership marker attached per recipient of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    /// The recipient submitted the job
    You,
    /// Somebody else's job
    Others,
}

impl Ownership {
    pub fn for_recipient(recipient: &str, owner: &str) -> Self {
        if recipient == owner {
            Ownership::You
        } else {
            Ownership::Others
        }
    }
}

/// Estimated remaining time of a running engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRemaining {
    pub hours_remaining: u64,
    pub minutes_remaining: u64,
    pub seconds_remaining: u64,
    pub total_seconds: u64,
    /// Compact display form, e.g. `1h 02m 05s`
    pub string: String,
}

impl TimeRemaining {
    pub fn from_seconds(total_seconds: u64) -> Self {
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        let string = if hours > 0 {
            format!("{}h {:02}m {:02}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {:02}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        };

        Self {
            hours_remaining: hours,
            minutes_remaining: minutes,
            seconds_remaining: seconds,
            total_seconds,
            string,
        }
    }
}

/// Structured progress parsed from one chunk of engine output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    /// Percent complete, 0-100
    pub percent_done_as_number: Option<u32>,
    /// Percent complete as displayed, e.g. `45%`
    pub percent_done: Option<String>,
    /// Frames per second
    pub speed: Option<f64>,
    pub time_remaining: Option<TimeRemaining>,
}

impl ProgressSample {
    /// True when nothing could be parsed
    pub fn is_empty(&self) -> bool {
        self.percent_done_as_number.is_none()
            && self.percent_done.is_none()
            && self.speed.is_none()
            && self.time_remaining.is_none()
    }

    /// One line summary: `[45%] 30s Remaining, Speed 538.12f/s`
    pub fn processing_string(&self) -> String {
        match (&self.time_remaining, &self.percent_done) {
            (Some(remaining), Some(percent)) => {
                let speed = self
                    .speed
                    .map(|s| format!("{:.2}", s))
                    .unwrap_or_else(|| "?".to_string());
                format!("[{}] {} Remaining, Speed {}f/s", percent, remaining.string, speed)
            }
            _ => String::new(),
        }
    }
}

/// Payload of a `websocketData` frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub processing_data: String,
    pub ownership_person: Ownership,
    pub server_number: u8,
    pub formatted_progress: ProgressSample,
    pub percent_done: Option<u32>,
    pub time_remaining: Option<TimeRemaining>,
    pub speed: Option<f64>,
}

impl ProgressUpdate {
    /// Build an update for the owner; the hub re-tags it per recipient
    pub fn new(sample: ProgressSample, server_number: u8) -> Self {
        Self {
            processing_data: sample.processing_string(),
            ownership_person: Ownership::You,
            server_number,
            percent_done: sample.percent_done_as_number,
            time_remaining: sample.time_remaining.clone(),
            speed: sample.speed,
            formatted_progress: sample,
        }
    }
}

/// Frames tagged by a `message` field
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message", rename_all = "camelCase")]
pub enum JobEvent {
    Starting {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    FileDetails {
        file_details: String,
    },
    #[serde(rename = "websocketData")]
    Progress(ProgressUpdate),
    #[serde(rename_all = "camelCase")]
    LanguageUpdate {
        language_update: String,
    },
    Error {
        text: String,
    },
}

/// Final frame sent to the owner of a finished job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub status: String,
    pub url_srt: String,
    pub url_vtt: String,
    pub url_txt: String,
    pub filename: String,
    pub details_string: String,
}

impl CompletionNotice {
    pub fn new(
        url_srt: String,
        url_vtt: String,
        url_txt: String,
        filename: String,
        details_string: String,
    ) -> Self {
        Self {
            status: "Completed".to_string(),
            url_srt,
            url_vtt,
            url_txt,
            filename,
            details_string,
        }
    }
}

/// Everything the server pushes to real-time clients
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(JobEvent),
    Completed(CompletionNotice),
    /// Raw engine stdout, forwarded as a bare string frame
    Stdout(String),
}

impl ServerMessage {
    pub fn starting(text: impl Into<String>) -> Self {
        ServerMessage::Event(JobEvent::Starting { text: text.into() })
    }

    pub fn file_details(details: &FileDetails) -> Self {
        ServerMessage::Event(JobEvent::FileDetails {
            file_details: details.to_block(),
        })
    }

    pub fn progress(update: ProgressUpdate) -> Self {
        ServerMessage::Event(JobEvent::Progress(update))
    }

    pub fn language_update(text: impl Into<String>) -> Self {
        ServerMessage::Event(JobEvent::LanguageUpdate {
            language_update: text.into(),
        })
    }

    pub fn error(text: impl Into<String>) -> Self {
        ServerMessage::Event(JobEvent::Error { text: text.into() })
    }

    pub fn stdout(line: &str) -> Self {
        ServerMessage::Stdout(format!("stdout: {}", line))
    }

    /// Re-tag a progress frame for a given recipient; other frames pass through
    pub fn with_ownership(self, ownership: Ownership) -> Self {
        match self {
            ServerMessage::Event(JobEvent::Progress(mut update)) => {
                update.ownership_person = ownership;
                ServerMessage::Event(JobEvent::Progress(update))
            }
            other => other,
        }
    }

    /// Serialize to the JSON text frame sent over the wire
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The plain formatted block shown to the owner while a job runs
#[derive(Debug, Clone, PartialEq)]
pub struct FileDetails {
    pub filename: String,
    pub display_language: String,
    pub model: String,
    pub upload_duration_secs: f64,
}

impl FileDetails {
    /// Details for a job, with the language displayed as requested
    pub fn for_job(job: &Job) -> Self {
        let display_language = if job.wants_auto_detect() {
            "Auto-Detect".to_string()
        } else {
            job.language.clone()
        };

        Self {
            filename: job.display_file_name(),
            display_language,
            model: job.model.clone().unwrap_or_default(),
            upload_duration_secs: job.upload_duration_secs,
        }
    }

    /// Same details after the engine detected the language
    pub fn with_detected_language(mut self, language: &str) -> Self {
        self.display_language = format!("{} (Auto-Detected)", language);
        self
    }

    pub fn to_block(&self) -> String {
        format!(
            "\nfilename: {}\nlanguage: {}\nmodel: {}\nuploadDurationInSeconds: {}\nuploadDurationInSecondsHumanReadable: {}\n",
            self.filename,
            self.display_language,
            self.model,
            self.upload_duration_secs,
            for_humans(self.upload_duration_secs),
        )
    }
}

/// How the optional translation step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TranslationOutcome {
    NotRequested,
    Completed,
    Failed,
}

/// Persisted completion record of a job, appended to `processing_data.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub filename: String,
    pub processing_seconds: u64,
    pub processing_seconds_human_readable: String,
    pub language: String,
    pub language_code: Option<String>,
    pub model: Option<String>,
    pub upload: String,
    pub upload_duration_in_seconds: f64,
    pub upload_duration_in_seconds_human_readable: String,
    pub processing_ratio: String,
    pub started_at: String,
    #[serde(rename = "finishedAT")]
    pub finished_at: String,
    pub status: String,
    pub translation: TranslationOutcome,
    pub translated_languages: Vec<String>,
    pub file_extension: String,
    pub directory_file_name: String,
    pub stripped_text: String,
    pub timestamps_array: Vec<String>,
}

impl JobManifest {
    /// Human readable block sent as `detailsString` on completion
    pub fn details_string(&self) -> String {
        format!(
            "\nfilename: {}\nprocessingSeconds: {}\nprocessingSecondsHumanReadable: {}\nlanguage: {}\nmodel: {}\nupload: {}\nuploadDurationInSeconds: {}\nuploadDurationInSecondsHumanReadable: {}\nprocessingRatio: {}\nstartedAt: {}\nfinishedAT: {}\n",
            self.filename,
            self.processing_seconds,
            self.processing_seconds_human_readable,
            self.language,
            self.model.as_deref().unwrap_or_default(),
            self.upload,
            self.upload_duration_in_seconds,
            self.upload_duration_in_seconds_human_readable,
            self.processing_ratio,
            self.started_at,
            self.finished_at,
        )
    }
}
