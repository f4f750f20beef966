//! Post-processing of a successful engine run.
//!
//! The steps run strictly in order: relocate the upload and the engine's
//! artifacts under their display names, normalize the script for Serbian
//! and Chinese, release the caller, translate if asked to, notify the owner,
//! persist the manifest and finally give the job directory its dated name.
//! Translation is the only step whose failure does not abort the job.

pub mod convert;
pub mod translate;
pub mod vtt;

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::hub::ClientHub;
use crate::languages::{canonical_name, code_for, default_targets_for};
use crate::protocol::{CompletionNotice, Job, JobManifest, ServerMessage, TranslationOutcome};
use crate::utils::for_humans;
use crate::worker::ProcessOutcome;
use crate::{HubError, Result};

pub use convert::{BuiltinConverter, ScriptConversion, ScriptConverter};
pub use translate::{LibreTranslate, Translator};
pub use vtt::VttTranscript;

/// Name of the append-only manifest inside each job directory
pub const MANIFEST_FILE: &str = "processing_data.json";

/// Notice pushed to every client when translation starts
pub const TRANSLATION_NOTICE: &str = "Doing translations with LibreTranslate";

/// Artifact extensions the engine produces
pub const ARTIFACT_EXTENSIONS: [&str; 3] = ["srt", "vtt", "txt"];

const LANGUAGE_UNKNOWN: &str = "Unknown";

/// Final locations of the three artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub srt: PathBuf,
    pub vtt: PathBuf,
    pub txt: PathBuf,
}

impl ArtifactPaths {
    fn under(dir: &Path, name: &str) -> Self {
        Self {
            srt: dir.join(format!("{}.srt", name)),
            vtt: dir.join(format!("{}.vtt", name)),
            txt: dir.join(format!("{}.txt", name)),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.srt, &self.vtt, &self.txt]
    }
}

/// What a finished pipeline leaves behind
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub language: String,
    pub manifest: JobManifest,
    /// Job directory after the final rename
    pub directory: PathBuf,
    /// Artifact paths inside `directory`
    pub artifacts: ArtifactPaths,
}

/// Language the job ends up with
///
/// An explicit request always wins; the engine's detection only fills in
/// for auto-detect jobs.
pub fn resolve_language(job: &Job, detected: Option<&str>) -> String {
    let raw = match (job.wants_auto_detect(), detected) {
        (false, _) => job.language.as_str(),
        (true, Some(language)) => language,
        (true, None) => return LANGUAGE_UNKNOWN.to_string(),
    };
    canonical_name(raw).map(str::to_string).unwrap_or_else(|| raw.trim().to_string())
}

/// `toUTCString`-style rendering used in the manifest
fn utc_string(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Move a file, falling back to copy and delete across file systems
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
    }
}

pub struct PostProcessingPipeline {
    transcriptions_dir: PathBuf,
    hub: Arc<ClientHub>,
    converter: Arc<dyn ScriptConverter>,
    translator: Option<Arc<dyn Translator>>,
    /// Translation targets; empty means the default table
    translate_to: Vec<String>,
}

impl PostProcessingPipeline {
    pub fn new(transcriptions_dir: impl Into<PathBuf>, hub: Arc<ClientHub>) -> Self {
        Self {
            transcriptions_dir: transcriptions_dir.into(),
            hub,
            converter: Arc::new(BuiltinConverter::new()),
            translator: None,
            translate_to: Vec::new(),
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn ScriptConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.translate_to = targets;
        self
    }

    pub fn job_dir(&self, job: &Job) -> PathBuf {
        self.transcriptions_dir.join(&job.output_id)
    }

    pub fn final_dir(&self, job: &Job) -> PathBuf {
        self.transcriptions_dir.join(&job.dated_name)
    }

    /// Run every step for a job whose engine exited successfully
    ///
    /// `finished` fires once the artifacts are final, before translation.
    pub async fn run(
        &self,
        job: &Job,
        outcome: &ProcessOutcome,
        finished: Option<oneshot::Sender<()>>,
    ) -> Result<PipelineOutput> {
        let job_dir = self.job_dir(job);
        let language = resolve_language(job, outcome.detected_language.as_deref());
        debug!("Post-processing job {} in {} as {}", job.id, job_dir.display(), language);

        move_file(&job.uploaded_file, &job_dir.join(job.display_file_name()))
            .await
            .map_err(HubError::pipeline("relocate-upload"))?;

        let artifacts = self.relocate_artifacts(job, &job_dir).await?;

        if let Some(conversion) = ScriptConversion::for_language(&language) {
            self.normalize(conversion, &artifacts).await?;
        }

        if let Some(finished) = finished {
            let _ = finished.send(());
        }

        let language_vtt = job_dir.join(format!("{}_{}.vtt", job.display_name, language));
        fs::copy(&artifacts.vtt, &language_vtt)
            .await
            .map_err(HubError::pipeline("copy-vtt"))?;
        let vtt = fs::read_to_string(&artifacts.vtt)
            .await
            .map_err(HubError::pipeline("read-vtt"))?;
        let transcript = VttTranscript::parse(&vtt);

        let (translation, translated_languages) = if job.translate {
            self.translate_step(job, &job_dir, &language, &transcript).await
        } else {
            (TranslationOutcome::NotRequested, Vec::new())
        };

        let finished_at = Utc::now();
        let processing_seconds = (finished_at - outcome.started_at).num_seconds().max(0) as u64;
        let processing_ratio = format!(
            "{:.2}",
            job.upload_duration_secs / processing_seconds.max(1) as f64
        );

        let manifest = JobManifest {
            filename: job.original_file_name.clone(),
            processing_seconds,
            processing_seconds_human_readable: for_humans(processing_seconds as f64),
            language_code: code_for(&language).map(str::to_string),
            language: language.clone(),
            model: job.model.clone(),
            upload: job.upload_file_name(),
            upload_duration_in_seconds: job.upload_duration_secs,
            upload_duration_in_seconds_human_readable: for_humans(job.upload_duration_secs),
            processing_ratio,
            started_at: utc_string(outcome.started_at),
            finished_at: utc_string(finished_at),
            status: "completed".to_string(),
            translation,
            translated_languages,
            file_extension: job.extension.clone(),
            directory_file_name: job.display_name.clone(),
            stripped_text: transcript.stripped_text(),
            timestamps_array: transcript.timestamps(),
        };

        let final_dir = self.final_dir(job);
        let final_artifacts = ArtifactPaths::under(&final_dir, &job.display_name);
        let notice = CompletionNotice::new(
            final_artifacts.srt.to_string_lossy().to_string(),
            final_artifacts.vtt.to_string_lossy().to_string(),
            final_artifacts.txt.to_string_lossy().to_string(),
            job.dated_name.clone(),
            manifest.details_string(),
        );
        self.hub
            .send_to(&job.client_id, &ServerMessage::Completed(notice))
            .await;

        append_manifest(&job_dir, &manifest).await?;

        fs::rename(&job_dir, &final_dir)
            .await
            .map_err(HubError::pipeline("rename-directory"))?;
        info!("Job {} finished in {}", job.id, final_dir.display());

        Ok(PipelineOutput {
            language,
            manifest,
            directory: final_dir,
            artifacts: final_artifacts,
        })
    }

    /// Move `<upload>.<ext>` to `<display name>.<ext>` for every artifact
    async fn relocate_artifacts(&self, job: &Job, job_dir: &Path) -> Result<ArtifactPaths> {
        let upload_name = job.upload_file_name();
        let upload_stem = Path::new(&upload_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| upload_name.clone());
        let artifacts = ArtifactPaths::under(job_dir, &job.display_name);

        for (ext, destination) in ARTIFACT_EXTENSIONS.iter().zip(artifacts.all()) {
            let by_name = job_dir.join(format!("{}.{}", upload_name, ext));
            let by_stem = job_dir.join(format!("{}.{}", upload_stem, ext));
            let source = if fs::try_exists(&by_name).await.unwrap_or(false) {
                by_name
            } else {
                by_stem
            };

            move_file(&source, destination)
                .await
                .map_err(HubError::pipeline("relocate-artifacts"))?;
        }

        Ok(artifacts)
    }

    async fn normalize(
        &self,
        conversion: ScriptConversion,
        artifacts: &ArtifactPaths,
    ) -> Result<()> {
        info!("Applying {:?} to artifacts", conversion);
        for path in artifacts.all() {
            let text = fs::read_to_string(path)
                .await
                .map_err(HubError::pipeline("normalize-script"))?;
            let converted = self.converter.convert(conversion, &text).await?;
            fs::write(path, converted)
                .await
                .map_err(HubError::pipeline("normalize-script"))?;
        }
        Ok(())
    }

    /// Translate when a backend exists; failures are downgraded, never raised
    async fn translate_step(
        &self,
        job: &Job,
        job_dir: &Path,
        language: &str,
        transcript: &VttTranscript,
    ) -> (TranslationOutcome, Vec<String>) {
        let Some(translator) = self.translator.as_deref() else {
            warn!("Translation requested for job {} but no backend is configured", job.id);
            return (TranslationOutcome::Failed, Vec::new());
        };

        self.hub
            .notify_all(&ServerMessage::language_update(TRANSLATION_NOTICE))
            .await;

        match self
            .translate_all(translator, job, job_dir, language, transcript)
            .await
        {
            Ok(languages) => (TranslationOutcome::Completed, languages),
            Err(e) => {
                warn!("Translation of job {} failed: {}", job.id, e);
                (TranslationOutcome::Failed, Vec::new())
            }
        }
    }

    async fn translate_all(
        &self,
        translator: &dyn Translator,
        job: &Job,
        job_dir: &Path,
        language: &str,
        transcript: &VttTranscript,
    ) -> Result<Vec<String>> {
        let source = code_for(language)
            .ok_or_else(|| HubError::Translation(format!("no language code for {}", language)))?;

        let targets = if self.translate_to.is_empty() {
            default_targets_for(language)
        } else {
            self.translate_to
                .iter()
                .filter(|target| code_for(target) != Some(source))
                .cloned()
                .collect()
        };

        if transcript.cues.is_empty() {
            return Ok(Vec::new());
        }

        let text = transcript.stripped_text();
        let mut translated_languages = Vec::new();
        for target in targets {
            let Some(target_code) = code_for(&target) else {
                warn!("Skipping translation target without a code: {}", target);
                continue;
            };
            let target_name = canonical_name(&target).unwrap_or(target.as_str());

            let translated = translator.translate(&text, source, target_code).await?;
            let translated = transcript.with_text(&translated).ok_or_else(|| {
                HubError::Translation(format!("{} translation lost the cue alignment", target_name))
            })?;

            let stem = format!("{}_{}", job.display_name, target_name);
            let paths = ArtifactPaths::under(job_dir, &stem);
            for (path, contents) in paths
                .all()
                .into_iter()
                .zip([translated.to_srt(), translated.to_vtt(), translated.to_txt()])
            {
                fs::write(path, contents)
                    .await
                    .map_err(HubError::pipeline("write-translation"))?;
            }

            debug!("Wrote {} translation for job {}", target_name, job.id);
            translated_languages.push(target_name.to_string());
        }

        Ok(translated_languages)
    }
}

/// Append one JSON line to the job's manifest file
async fn append_manifest(job_dir: &Path, manifest: &JobManifest) -> Result<()> {
    let mut line = serde_json::to_string(manifest)?;
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(job_dir.join(MANIFEST_FILE))
        .await
        .map_err(HubError::pipeline("write-manifest"))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(HubError::pipeline("write-manifest"))?;
    file.flush().await.map_err(HubError::pipeline("write-manifest"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobRequest, AUTO_DETECT};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const VTT: &str =
        "WEBVTT\n\n00:00.000 --> 00:02.000\nДобар дан.\n\n00:02.000 --> 00:04.000\nКако сте?\n";

    struct Fixture {
        _root: TempDir,
        transcriptions: PathBuf,
        hub: Arc<ClientHub>,
        job: Job,
    }

    /// Lay out an upload and the engine's three default-named artifacts
    async fn fixture(language: &str, translate: bool) -> Fixture {
        let root = TempDir::new().unwrap();
        let uploads = root.path().join("uploads");
        let transcriptions = root.path().join("transcriptions");
        fs::create_dir_all(&uploads).await.unwrap();

        let upload = uploads.join("f3a9c1");
        fs::write(&upload, b"media").await.unwrap();

        let job = Job::from_request(JobRequest {
            client_id: "owner".to_string(),
            uploaded_file_path: upload,
            original_file_name: "Talk Show.mp4".to_string(),
            language: language.to_string(),
            model: Some("small".to_string()),
            translate,
            upload_duration_secs: 120.0,
        });

        let job_dir = transcriptions.join(&job.output_id);
        fs::create_dir_all(&job_dir).await.unwrap();
        fs::write(job_dir.join("f3a9c1.srt"), "1\n00:00:00,000 --> 00:00:02,000\nДобар дан.\n")
            .await
            .unwrap();
        fs::write(job_dir.join("f3a9c1.vtt"), VTT).await.unwrap();
        fs::write(job_dir.join("f3a9c1.txt"), "Добар дан.\nКако сте?\n").await.unwrap();

        Fixture {
            _root: root,
            transcriptions,
            hub: Arc::new(ClientHub::new()),
            job,
        }
    }

    fn outcome(detected: Option<&str>) -> ProcessOutcome {
        ProcessOutcome {
            exit_code: Some(0),
            killed: false,
            detected_language: detected.map(str::to_string),
            server_number: 1,
            started_at: Utc::now() - chrono::Duration::seconds(60),
            finished_at: Utc::now(),
        }
    }

    struct CountingConverter(AtomicUsize);

    #[async_trait]
    impl ScriptConverter for CountingConverter {
        async fn convert(&self, _conversion: ScriptConversion, text: &str) -> Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(text.to_string())
        }
    }

    struct UpperTranslator;

    #[async_trait]
    impl Translator for UpperTranslator {
        async fn translate(&self, text: &str, _source: &str, target: &str) -> Result<String> {
            if target == "ja" {
                return Err(HubError::Translation("ja unavailable".to_string()));
            }
            Ok(text.to_uppercase())
        }
    }

    struct EchoTranslator;

    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate(&self, text: &str, _source: &str, target: &str) -> Result<String> {
            Ok(text
                .lines()
                .map(|line| format!("[{}] {}", target, line))
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    #[test]
    fn test_resolve_language() {
        let mut job = Job::from_request(JobRequest {
            client_id: "c".into(),
            uploaded_file_path: "uploads/x".into(),
            original_file_name: "x.mp3".into(),
            language: AUTO_DETECT.into(),
            model: None,
            translate: false,
            upload_duration_secs: 0.0,
        });
        assert_eq!(resolve_language(&job, Some("french")), "French");
        assert_eq!(resolve_language(&job, None), "Unknown");

        job.language = "German".into();
        assert_eq!(resolve_language(&job, None), "German");
        assert_eq!(resolve_language(&job, Some("Dutch")), "German");
    }

    #[tokio::test]
    async fn test_relocates_and_persists() {
        let fx = fixture("English", false).await;
        let mut owner = fx.hub.register("owner").await;
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub));
        let (finished_tx, finished_rx) = oneshot::channel();

        let output = pipeline.run(&fx.job, &outcome(None), Some(finished_tx)).await.unwrap();
        assert!(finished_rx.await.is_ok());

        let dir = &output.directory;
        assert_eq!(dir, &fx.transcriptions.join(&fx.job.dated_name));
        assert!(!fx.transcriptions.join(&fx.job.output_id).exists());
        assert!(!fx.job.uploaded_file.exists());
        assert!(dir.join("Talk_Show.mp4").exists());
        for ext in ARTIFACT_EXTENSIONS {
            assert!(dir.join(format!("Talk_Show.{}", ext)).exists());
            assert!(!dir.join(format!("f3a9c1.{}", ext)).exists());
        }
        assert!(dir.join("Talk_Show_English.vtt").exists());

        let manifest = fs::read_to_string(dir.join(MANIFEST_FILE)).await.unwrap();
        let manifest: JobManifest = serde_json::from_str(manifest.trim()).unwrap();
        assert_eq!(manifest.language, "English");
        assert_eq!(manifest.language_code.as_deref(), Some("en"));
        assert_eq!(manifest.translation, TranslationOutcome::NotRequested);
        assert_eq!(manifest.file_extension, ".mp4");
        assert_eq!(manifest.directory_file_name, "Talk_Show");
        assert_eq!(manifest.timestamps_array.len(), 2);
        assert_eq!(manifest.processing_ratio, "2.00");

        let completed = match owner.try_recv().unwrap() {
            crate::hub::Outbound::Text(text) => {
                serde_json::from_str::<serde_json::Value>(&text).unwrap()
            }
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(completed["status"], "Completed");
        assert_eq!(completed["filename"], fx.job.dated_name.as_str());
        assert!(completed["urlSrt"].as_str().unwrap().ends_with("Talk_Show.srt"));
    }

    #[tokio::test]
    async fn test_serbian_is_transliterated() {
        let fx = fixture(AUTO_DETECT, false).await;
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub));

        let output = pipeline.run(&fx.job, &outcome(Some("Serbian")), None).await.unwrap();

        for path in output.artifacts.all() {
            let text = fs::read_to_string(path).await.unwrap();
            assert!(text.contains("Dobar dan."), "{} not converted", path.display());
        }
        assert_eq!(output.manifest.stripped_text, "Dobar dan.\nKako ste?");
    }

    #[tokio::test]
    async fn test_conversion_not_invoked_for_other_languages() {
        let fx = fixture("Russian", false).await;
        let converter = Arc::new(CountingConverter(AtomicUsize::new(0)));
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub))
            .with_converter(converter.clone());

        pipeline.run(&fx.job, &outcome(None), None).await.unwrap();
        assert_eq!(converter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chinese_converts_all_three_artifacts() {
        let fx = fixture("Chinese", false).await;
        let converter = Arc::new(CountingConverter(AtomicUsize::new(0)));
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub))
            .with_converter(converter.clone());

        pipeline.run(&fx.job, &outcome(None), None).await.unwrap();
        assert_eq!(converter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_translation_writes_target_files() {
        let fx = fixture("Serbian", true).await;
        let mut other = fx.hub.register("other").await;
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub))
            .with_translator(Arc::new(EchoTranslator))
            .with_targets(vec!["English".to_string(), "Serbian".to_string(), "fr".to_string()]);

        let output = pipeline.run(&fx.job, &outcome(None), None).await.unwrap();

        assert_eq!(output.manifest.translation, TranslationOutcome::Completed);
        assert_eq!(output.manifest.translated_languages, vec!["English", "French"]);
        let english = fs::read_to_string(output.directory.join("Talk_Show_English.srt"))
            .await
            .unwrap();
        assert!(english.contains("00:00:00,000 --> 00:00:02,000\n[en] Dobar dan."));
        assert!(output.directory.join("Talk_Show_French.vtt").exists());
        assert!(!output.directory.join("Talk_Show_Serbian.srt").exists());

        match other.try_recv().unwrap() {
            crate::hub::Outbound::Text(text) => assert!(text.contains("languageUpdate")),
            frame => panic!("unexpected frame {:?}", frame),
        }
    }

    #[tokio::test]
    async fn test_translation_failure_still_persists_manifest() {
        let fx = fixture("English", true).await;
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub))
            .with_translator(Arc::new(UpperTranslator))
            .with_targets(vec!["French".to_string(), "Japanese".to_string()]);

        let output = pipeline.run(&fx.job, &outcome(None), None).await.unwrap();

        assert_eq!(output.manifest.translation, TranslationOutcome::Failed);
        assert!(output.manifest.translated_languages.is_empty());
        assert!(output.directory.join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_aborts() {
        let fx = fixture("English", false).await;
        fs::remove_file(fx.transcriptions.join(&fx.job.output_id).join("f3a9c1.vtt"))
            .await
            .unwrap();
        let pipeline = PostProcessingPipeline::new(&fx.transcriptions, Arc::clone(&fx.hub));
        let (finished_tx, finished_rx) = oneshot::channel();

        let result = pipeline.run(&fx.job, &outcome(None), Some(finished_tx)).await;
        assert!(matches!(
            result,
            Err(HubError::PipelineIo { step: "relocate-artifacts", .. })
        ));
        assert!(finished_rx.await.is_err());
        assert!(!fx.transcriptions.join(MANIFEST_FILE).exists());
    }
}
