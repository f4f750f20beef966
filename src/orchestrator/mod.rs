//! Per-job flow: admission, device assignment, engine run, post-processing.

use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::hub::ClientHub;
use crate::pipeline::{BuiltinConverter, LibreTranslate, PipelineOutput, PostProcessingPipeline};
use crate::protocol::{ClientId, FileDetails, Job, ServerMessage};
use crate::queue::QueueStats;
use crate::registry::JobRegistry;
use crate::scheduler::{DeviceAssignment, DeviceScheduler};
use crate::worker::WorkerProcessManager;
use crate::{HubError, Result};

/// First frame a client sees for a job
pub const STARTING_TEXT: &str = "Whisper initializing, updates to come...";

/// Shown to the owner when the engine or the pipeline fails
pub const FAILURE_TEXT: &str = "The transcription failed, please try again or try again later";

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    PostProcessing,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Skipped)
    }

    fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, PostProcessing)
                | (Running, Failed)
                | (PostProcessing, Completed)
                | (PostProcessing, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::PostProcessing => "post-processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one job and logs each transition
#[derive(Debug)]
struct JobFlow {
    job_id: Uuid,
    client_id: ClientId,
    state: JobState,
}

impl JobFlow {
    fn new(job: &Job) -> Self {
        Self {
            job_id: job.id,
            client_id: job.client_id.clone(),
            state: JobState::Pending,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        info!(
            "Job {} (client {}): {} -> {}",
            self.job_id, self.client_id, self.state, next
        );
        self.state = next;
    }
}

/// How a job ended when it did not fail
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The client was gone before the job could start
    Skipped,
    /// Engine succeeded and every pipeline step ran
    Completed(Box<PipelineOutput>),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub client_id: ClientId,
    /// Server the job ran on; `None` when skipped
    pub server_number: Option<u8>,
    pub outcome: JobOutcome,
}

/// Owns the shared state and runs job flows against it
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    hub: Arc<ClientHub>,
    scheduler: Arc<DeviceScheduler>,
    queue_stats: Arc<QueueStats>,
    worker: WorkerProcessManager,
    pipeline: PostProcessingPipeline,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        hub: Arc<ClientHub>,
        scheduler: Arc<DeviceScheduler>,
        worker: WorkerProcessManager,
        pipeline: PostProcessingPipeline,
        queue_stats: Arc<QueueStats>,
    ) -> Self {
        Self {
            registry,
            hub,
            scheduler,
            queue_stats,
            worker,
            pipeline,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(config: &HubConfig) -> Result<Self> {
        std::fs::create_dir_all(config.transcriptions_dir())?;

        let registry = Arc::new(JobRegistry::new());
        let hub = Arc::new(ClientHub::with_buffer(config.client_buffer));
        let scheduler = Arc::new(DeviceScheduler::new(config.multi_device()));
        let queue_stats = Arc::new(QueueStats::default());

        let worker = WorkerProcessManager::new(
            config.engine.clone(),
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&queue_stats),
        );

        let mut converter = BuiltinConverter::new();
        if let Some(ref opencc) = config.opencc_cmd {
            converter = converter.with_opencc(opencc);
        }

        let mut pipeline =
            PostProcessingPipeline::new(config.transcriptions_dir(), Arc::clone(&hub))
                .with_converter(Arc::new(converter))
                .with_targets(config.translate_to.clone());

        if let Some(ref url) = config.libretranslate {
            let mut translator = LibreTranslate::new(url.as_str());
            if let Some(ref key) = config.libretranslate_api_key {
                translator = translator.with_api_key(key.as_str());
            }
            info!("Translation backend: {}", translator.base_url());
            pipeline = pipeline.with_translator(Arc::new(translator));
        }

        Ok(Self::new(registry, hub, scheduler, worker, pipeline, queue_stats))
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    pub fn scheduler(&self) -> &Arc<DeviceScheduler> {
        &self.scheduler
    }

    pub fn queue_stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.queue_stats)
    }

    /// Run a job to completion
    pub async fn run(&self, job: Job) -> Result<JobReport> {
        self.run_with_signal(job, None).await
    }

    /// Run a job, firing `finished` once its artifacts are final
    ///
    /// On every other path (skip, failure) the sender is dropped, which the
    /// receiver observes as a closed channel.
    pub async fn run_with_signal(
        &self,
        job: Job,
        finished: Option<oneshot::Sender<()>>,
    ) -> Result<JobReport> {
        let mut flow = JobFlow::new(&job);

        if !self.registry.is_admitted(&job.client_id).await {
            info!("Client {} is no longer waiting, skipping job {}", job.client_id, job.id);
            flow.advance(JobState::Skipped);
            return Ok(JobReport {
                job_id: job.id,
                client_id: job.client_id,
                server_number: None,
                outcome: JobOutcome::Skipped,
            });
        }

        self.hub
            .send_to(&job.client_id, &ServerMessage::starting(STARTING_TEXT))
            .await;
        self.hub
            .send_to(&job.client_id, &ServerMessage::file_details(&FileDetails::for_job(&job)))
            .await;

        let assignment = self.scheduler.assign();
        flow.advance(JobState::Running);

        match self.execute(&job, assignment, &mut flow, finished).await {
            Ok(output) => {
                flow.advance(JobState::Completed);
                Ok(JobReport {
                    job_id: job.id,
                    client_id: job.client_id,
                    server_number: Some(assignment.server_number()),
                    outcome: JobOutcome::Completed(Box::new(output)),
                })
            }
            Err(e) => {
                error!("Job {} for client {} failed: {}", job.id, job.client_id, e);
                flow.advance(JobState::Failed);
                self.hub
                    .send_to(&job.client_id, &ServerMessage::error(FAILURE_TEXT))
                    .await;
                self.hub.terminate(&job.client_id).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        assignment: DeviceAssignment,
        flow: &mut JobFlow,
        finished: Option<oneshot::Sender<()>>,
    ) -> Result<PipelineOutput> {
        let outcome = self.worker.start(job, assignment).await?;
        if !outcome.success() {
            return Err(HubError::Engine {
                exit_code: outcome.exit_code,
            });
        }

        flow.advance(JobState::PostProcessing);
        debug!(
            "Engine for job {} took {}s",
            job.id,
            (outcome.finished_at - outcome.started_at).num_seconds()
        );
        self.pipeline.run(job, &outcome, finished).await
    }
}
