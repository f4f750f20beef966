use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::hub::ClientHub;
use crate::progress::ProgressStream;
use crate::protocol::{FileDetails, Job, ProgressUpdate, ServerMessage};
use crate::queue::QueueStats;
use crate::registry::{JobRegistry, ProcessHandle};
use crate::scheduler::DeviceAssignment;
use crate::{HubError, Result, DEFAULT_TRANSCRIPTIONS_DIR};

static DETECTED_LANGUAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Detected language:\s*(?P<language>[^\r\n]+)").expect("language pattern is valid")
});

/// How long to wait for the output pumps to drain after the engine exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const STDERR_READ_SIZE: usize = 4096;

/// Configuration for the external transcription engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable (defaults to "whisper")
    pub command: String,
    /// Arguments placed before the generated ones
    pub leading_args: Vec<String>,
    /// Root under which each job gets its output directory
    pub transcriptions_dir: PathBuf,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Environment variables
    pub env_vars: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "whisper".to_string(),
            leading_args: Vec::new(),
            transcriptions_dir: PathBuf::from(DEFAULT_TRANSCRIPTIONS_DIR),
            working_dir: None,
            env_vars: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Directory the engine writes the job's artifacts into
    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.transcriptions_dir.join(&job.output_id)
    }

    /// Full argument list for one engine run
    pub fn build_args(&self, job: &Job, assignment: &DeviceAssignment) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push(job.uploaded_file.to_string_lossy().to_string());

        if !job.wants_auto_detect() {
            args.push("--language".to_string());
            args.push(job.language.clone());
        }

        if let Some(model) = &job.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(device) = assignment.device_flag() {
            args.push("--device".to_string());
            args.push(device.as_arg().to_string());
        }

        args.push("--verbose".to_string());
        args.push("False".to_string());
        args.push("-o".to_string());
        args.push(self.output_dir(job).to_string_lossy().to_string());
        args
    }
}

/// How an engine run ended
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code; `None` when the process died from a signal
    pub exit_code: Option<i32>,
    /// Whether the run was cut short through the registry
    pub killed: bool,
    /// Language announced on stdout, if any
    pub detected_language: Option<String>,
    pub server_number: u8,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }
}

/// Spawns the engine for a job and supervises it until exit
pub struct WorkerProcessManager {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    hub: Arc<ClientHub>,
    queue_stats: Arc<QueueStats>,
}

impl WorkerProcessManager {
    pub fn new(
        config: EngineConfig,
        registry: Arc<JobRegistry>,
        hub: Arc<ClientHub>,
        queue_stats: Arc<QueueStats>,
    ) -> Self {
        Self {
            config,
            registry,
            hub,
            queue_stats,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the engine for `job` on the assigned device and wait for it to exit
    ///
    /// Output is streamed to clients while the process runs. A non-zero exit
    /// is reported through [`ProcessOutcome::success`], not as an error;
    /// errors are reserved for failing to start the process at all.
    pub async fn start(&self, job: &Job, assignment: DeviceAssignment) -> Result<ProcessOutcome> {
        let output_dir = self.config.output_dir(job);
        tokio::fs::create_dir_all(&output_dir).await?;

        let args = self.config.build_args(job, &assignment);
        info!(
            "Starting engine for job {} (client {}, server {}): {} {}",
            job.id,
            job.client_id,
            assignment.server_number(),
            self.config.command,
            args.join(" ")
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(HubError::Spawn)?;
        let started_at = Utc::now();
        let server_number = assignment.server_number();
        debug!("Engine spawned with PID: {:?}", child.id());

        let (handle, mut kill_rx) =
            ProcessHandle::new(job.client_id.clone(), job.id, server_number, child.id());
        if let Err(e) = self.registry.register(handle).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill().await;
                self.registry.unregister(&job.client_id, job.id).await;
                return Err(HubError::Spawn(std::io::Error::other(
                    "engine output streams were not captured",
                )));
            }
        };

        let mut stdout_task = tokio::spawn(pump_stdout(stdout, Arc::clone(&self.hub), job.clone()));
        let mut stderr_task = tokio::spawn(pump_stderr(
            stderr,
            Arc::clone(&self.hub),
            Arc::clone(&self.queue_stats),
            job.clone(),
            server_number,
        ));

        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            Ok(()) = &mut kill_rx => {
                warn!("Killing engine of job {} for client {}", job.id, job.client_id);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill engine of job {}: {}", job.id, e);
                }
                (child.wait().await, true)
            }
        };

        self.registry.unregister(&job.client_id, job.id).await;

        let detected_language = if killed {
            stdout_task.abort();
            stderr_task.abort();
            None
        } else {
            drain(&mut stderr_task).await;
            drain(&mut stdout_task).await.flatten()
        };

        let exit_code = match status {
            Ok(status) => {
                info!("Engine for job {} exited with status: {}", job.id, status);
                status.code()
            }
            Err(e) => {
                error!("Failed to wait for engine of job {}: {}", job.id, e);
                None
            }
        };

        Ok(ProcessOutcome {
            exit_code,
            killed,
            detected_language,
            server_number,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Wait for a pump to finish, giving up after [`DRAIN_TIMEOUT`]
async fn drain<T>(task: &mut JoinHandle<T>) -> Option<T> {
    match timeout(DRAIN_TIMEOUT, &mut *task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Output pump failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Output pump did not drain in {:?}", DRAIN_TIMEOUT);
            task.abort();
            None
        }
    }
}

/// Parse the language out of a `Detected language: X` line
pub fn detect_language(line: &str) -> Option<String> {
    DETECTED_LANGUAGE
        .captures(line)
        .map(|caps| caps["language"].trim().to_string())
        .filter(|language| !language.is_empty())
}

/// Echo stdout lines to the owner and pick up the detected language
async fn pump_stdout<R>(stdout: R, hub: Arc<ClientHub>, job: Job) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut raw = Vec::new();
    let mut detected = None;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read engine stdout for job {}: {}", job.id, e);
                break;
            }
        }

        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim_end_matches(['\r', '\n']);
        debug!("Engine stdout: {}", line);
        hub.send_to(&job.client_id, &ServerMessage::stdout(line)).await;

        if detected.is_some() {
            continue;
        }

        if let Some(language) = detect_language(line) {
            info!("Engine detected language {} for job {}", language, job.id);
            if job.wants_auto_detect() {
                let details = FileDetails::for_job(&job).with_detected_language(&language);
                hub.send_to(&job.client_id, &ServerMessage::file_details(&details)).await;
            }
            detected = Some(language);
        }
    }

    detected
}

/// Turn raw stderr reads into progress broadcasts
async fn pump_stderr<R>(
    mut stderr: R,
    hub: Arc<ClientHub>,
    queue_stats: Arc<QueueStats>,
    job: Job,
    server_number: u8,
) where
    R: AsyncRead + Unpin,
{
    let mut stream = ProgressStream::new();
    let mut buf = vec![0u8; STDERR_READ_SIZE];

    loop {
        let read = match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                warn!("Failed to read engine stderr for job {}: {}", job.id, e);
                break;
            }
        };

        let chunk = String::from_utf8_lossy(&buf[..read]);
        let Some(sample) = stream.feed(&chunk) else {
            trace!("Engine stderr: {}", chunk.trim_end());
            continue;
        };

        debug!(
            "{} [{}] duration: {}s, model: {}, language: {}, queue: {}, translate: {}",
            sample.processing_string(),
            job.display_file_name(),
            job.upload_duration_secs,
            job.model.as_deref().unwrap_or("default"),
            job.language,
            queue_stats.outstanding(),
            job.translate,
        );

        let update = ProgressUpdate::new(sample, server_number);
        hub.broadcast(&job.client_id, &ServerMessage::progress(update)).await;
    }
}
