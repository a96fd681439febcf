//! Matching trigger: runs the external face-matching engine over a request's
//! staged frames and an event gallery, and moves the request along
//! `pending -> matching -> {no_face | matched}` (or `pending -> no_frames`).

use crate::config::{MatchingConfig, OutputBinding};
use crate::error::{PipelineError, Result};
use crate::frame_staging::FrameStager;
use crate::request_store::{RequestPatch, RequestStatus, RequestStore};
use async_trait::async_trait;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// External face-matching capability.
///
/// Given probe and gallery directories, writes matched images into
/// `output_dir` and returns how many matches it found.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchingEngine: Send + Sync {
    async fn run(&self, probe_dir: &Path, gallery_dir: &Path, output_dir: &Path) -> Result<usize>;
}

/// Matching engine run as an external program
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    matched_prefix: String,
}

impl CommandEngine {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            program: config.engine_program.clone(),
            args: config.engine_args.clone(),
            matched_prefix: config.matched_prefix.clone(),
        }
    }

    fn render_args(&self, probe_dir: &Path, gallery_dir: &Path, output_dir: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{probe_dir}", &probe_dir.to_string_lossy())
                    .replace("{gallery_dir}", &gallery_dir.to_string_lossy())
                    .replace("{output_dir}", &output_dir.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl MatchingEngine for CommandEngine {
    async fn run(&self, probe_dir: &Path, gallery_dir: &Path, output_dir: &Path) -> Result<usize> {
        let args = self.render_args(probe_dir, gallery_dir, output_dir);

        debug!(program = %self.program, ?args, "Starting matching engine");

        // Dropping the future (timeout, cancellation) kills the child
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PipelineError::EngineFailure(format!("failed to start {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::EngineFailure(format!(
                "engine exited with {}: {}",
                output.status,
                last_line(&stderr).unwrap_or("no output")
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match last_line(&stdout).and_then(|line| line.parse::<usize>().ok()) {
            Some(count) => Ok(count),
            None => Ok(collect_matched_files(output_dir, &self.matched_prefix)
                .await?
                .len()),
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty()).last()
}

/// Sorted names of the matched images in `dir` (files starting with `prefix`)
pub async fn collect_matched_files(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(prefix) {
                files.push(name.to_string());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Check that an event name is a plain directory name
pub fn validate_event_name(event_name: &str) -> Result<()> {
    let trimmed = event_name.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidInput("event_name is required".to_string()));
    }
    if trimmed.starts_with('.') || trimmed.contains(['/', '\\']) {
        return Err(PipelineError::InvalidInput(format!(
            "invalid event name '{event_name}'"
        )));
    }
    Ok(())
}

/// Read-only view of the event galleries
#[derive(Debug, Clone)]
pub struct Gallery {
    root: PathBuf,
}

impl Gallery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Gallery directory of an event
    pub fn event_dir(&self, event_name: &str) -> Result<PathBuf> {
        validate_event_name(event_name)?;
        Ok(self.root.join(event_name.trim()))
    }

    /// Names of the available events
    pub async fn list_events(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    events.push(name.to_string());
                }
            }
        }

        events.sort();
        Ok(events)
    }
}

/// Result of a matching run
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// No staged frames; the engine was not invoked
    NoFrames,
    /// The engine ran and found nothing
    NoFace,
    /// The engine found matches; output awaits packaging
    Matched { output_dir: PathBuf, match_count: usize },
    /// The request was no longer pending when matching started
    Superseded { status: RequestStatus },
}

/// Runs the matching engine for one request at a time
pub struct MatchingTrigger {
    store: Arc<dyn RequestStore>,
    engine: Arc<dyn MatchingEngine>,
    stager: Arc<FrameStager>,
    gallery: Gallery,
    matched_root: PathBuf,
    binding: OutputBinding,
    engine_timeout: Option<Duration>,
}

impl MatchingTrigger {
    pub fn new(
        store: Arc<dyn RequestStore>,
        engine: Arc<dyn MatchingEngine>,
        stager: Arc<FrameStager>,
        gallery: Gallery,
        config: &MatchingConfig,
    ) -> Self {
        Self {
            store,
            engine,
            stager,
            gallery,
            matched_root: config.matched_root.clone(),
            binding: config.output_binding,
            engine_timeout: config.engine_timeout(),
        }
    }

    /// Directory the engine writes a request's matches into
    pub fn output_dir(&self, request_id: &str) -> PathBuf {
        match self.binding {
            OutputBinding::RequestScoped => self.matched_root.join(request_id),
            OutputBinding::SharedLatestPending => self.matched_root.clone(),
        }
    }

    /// Match a request's staged frames against its event gallery.
    ///
    /// Staged frames are deleted once the engine has run, whatever the result.
    #[instrument(skip(self, cancel))]
    pub async fn run_matching(
        &self,
        request_id: &str,
        event_name: &str,
        cancel: &CancellationToken,
    ) -> Result<MatchOutcome> {
        if !self.stager.has_frames(request_id).await? {
            warn!(request_id = %request_id, "No frames staged for request");
            self.store
                .update_fields(request_id, &RequestPatch::transition(RequestStatus::NoFrames))
                .await?;
            return Ok(MatchOutcome::NoFrames);
        }

        let result = self.match_staged(request_id, event_name, cancel).await;

        if let Err(e) = self.stager.discard(request_id).await {
            warn!(request_id = %request_id, error = %e, "Failed to remove staged frames");
        }

        result
    }

    async fn match_staged(
        &self,
        request_id: &str,
        event_name: &str,
        cancel: &CancellationToken,
    ) -> Result<MatchOutcome> {
        let started = self
            .store
            .update_fields(request_id, &RequestPatch::transition(RequestStatus::Matching))
            .await?;

        if !started {
            let status = self
                .store
                .get_by_id(request_id)
                .await?
                .map(|request| request.status)
                .ok_or_else(|| PipelineError::NotFound(request_id.to_string()))?;
            info!(request_id = %request_id, %status, "Request no longer pending, skipping match");
            return Ok(MatchOutcome::Superseded { status });
        }

        let gallery_dir = self.gallery.event_dir(event_name)?;
        if !fs::try_exists(&gallery_dir).await? {
            return Err(PipelineError::EngineFailure(format!(
                "gallery for event '{event_name}' does not exist"
            )));
        }

        let output_dir = self.prepare_output_dir(request_id).await?;
        let probe_dir = self.stager.request_dir(request_id);

        let timer = Instant::now();
        let run = self.engine.run(&probe_dir, &gallery_dir, &output_dir);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled(request_id.to_string())),
            result = with_timeout(self.engine_timeout, run) => result,
        };
        metrics::histogram!("delivery.engine.duration_seconds").record(timer.elapsed().as_secs_f64());

        let match_count = match result {
            Ok(count) => count,
            Err(e) => {
                self.release_output_dir(request_id).await;
                return Err(e);
            }
        };

        info!(request_id = %request_id, event_name = %event_name, match_count, "Matching finished");

        if match_count == 0 {
            self.store
                .update_fields(request_id, &RequestPatch::transition(RequestStatus::NoFace))
                .await?;
            self.release_output_dir(request_id).await;
            return Ok(MatchOutcome::NoFace);
        }

        Ok(MatchOutcome::Matched {
            output_dir,
            match_count,
        })
    }

    /// Create an empty output directory for the run
    async fn prepare_output_dir(&self, request_id: &str) -> Result<PathBuf> {
        let dir = self.output_dir(request_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Drop a request-scoped output directory once it is no longer needed
    pub async fn release_output_dir(&self, request_id: &str) {
        if self.binding != OutputBinding::RequestScoped {
            return;
        }
        match fs::remove_dir_all(self.output_dir(request_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(request_id = %request_id, error = %e, "Failed to remove output directory"),
        }
    }
}

async fn with_timeout<F>(limit: Option<Duration>, run: F) -> Result<usize>
where
    F: Future<Output = Result<usize>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| PipelineError::EngineTimeout(limit))?,
        None => run.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_store::NewUserRequest;
    use crate::testing::{test_matching_config, FakeEngine, MemoryRequestStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryRequestStore>,
        stager: Arc<FrameStager>,
        config: MatchingConfig,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = test_matching_config(dir.path());
        std::fs::create_dir_all(config.gallery_root.join("evt1")).unwrap();

        let store = Arc::new(MemoryRequestStore::new());
        store
            .create(&NewUserRequest {
                id: "r1".to_string(),
                email: "a@b.com".to_string(),
                event_name: "evt1".to_string(),
            })
            .await
            .unwrap();

        Fixture {
            stager: Arc::new(FrameStager::new(&config.staging_root)),
            _dir: dir,
            store,
            config,
        }
    }

    fn trigger(fx: &Fixture, engine: Arc<dyn MatchingEngine>) -> MatchingTrigger {
        MatchingTrigger::new(
            fx.store.clone(),
            engine,
            fx.stager.clone(),
            Gallery::new(&fx.config.gallery_root),
            &fx.config,
        )
    }

    #[test]
    fn test_validate_event_name() {
        assert!(validate_event_name("wedding-2024").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name(".hidden").is_err());
        assert!(validate_event_name("../secrets").is_err());
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("loading\n3\n\n"), Some("3"));
        assert_eq!(last_line("   \n"), None);
    }

    #[tokio::test]
    async fn test_missing_frames_skip_engine() {
        let fx = fixture().await;
        let mut engine = MockMatchingEngine::new();
        engine.expect_run().never();

        let outcome = trigger(&fx, Arc::new(engine))
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, MatchOutcome::NoFrames);
        assert_eq!(fx.store.status_of("r1"), Some(RequestStatus::NoFrames));
    }

    #[tokio::test]
    async fn test_matches_leave_request_matching() {
        let fx = fixture().await;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();
        let engine = Arc::new(FakeEngine::matching(2));

        let outcome = trigger(&fx, engine.clone())
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await
            .unwrap();

        let expected_dir = fx.config.matched_root.join("r1");
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                output_dir: expected_dir.clone(),
                match_count: 2
            }
        );
        assert_eq!(fx.store.status_of("r1"), Some(RequestStatus::Matching));
        assert_eq!(collect_matched_files(&expected_dir, "clean_").await.unwrap().len(), 2);
        assert!(!fx.stager.request_dir("r1").exists());
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_matches_is_no_face() {
        let fx = fixture().await;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();

        let outcome = trigger(&fx, Arc::new(FakeEngine::matching(0)))
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, MatchOutcome::NoFace);
        assert_eq!(fx.store.status_of("r1"), Some(RequestStatus::NoFace));
        assert!(!fx.config.matched_root.join("r1").exists());
    }

    #[tokio::test]
    async fn test_engine_failure_still_discards_frames() {
        let fx = fixture().await;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();
        let mut engine = MockMatchingEngine::new();
        engine
            .expect_run()
            .times(1)
            .returning(|_, _, _| Err(PipelineError::EngineFailure("segfault".to_string())));

        let result = trigger(&fx, Arc::new(engine))
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::EngineFailure(_))));
        assert!(!fx.stager.request_dir("r1").exists());
        assert!(!fx.config.matched_root.join("r1").exists());
    }

    #[tokio::test]
    async fn test_engine_timeout() {
        let mut fx = fixture().await;
        fx.config.engine_timeout_secs = 1;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();
        let engine = FakeEngine::matching(1).with_delay(Duration::from_secs(5));

        let result = trigger(&fx, Arc::new(engine))
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::EngineTimeout(limit)) if limit == Duration::from_secs(1)));
        assert!(!fx.stager.request_dir("r1").exists());
    }

    #[tokio::test]
    async fn test_unknown_gallery_is_engine_failure() {
        let fx = fixture().await;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();
        let mut engine = MockMatchingEngine::new();
        engine.expect_run().never();

        let result = trigger(&fx, Arc::new(engine))
            .run_matching("r1", "no-such-event", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::EngineFailure(ref msg)) if msg.contains("no-such-event")));
    }

    #[tokio::test]
    async fn test_request_not_pending_is_superseded() {
        let fx = fixture().await;
        fx.stager.stage_frames("r1", &[b"f".to_vec()]).await.unwrap();
        fx.store
            .update_fields("r1", &RequestPatch::failed("interrupted"))
            .await
            .unwrap();
        let mut engine = MockMatchingEngine::new();
        engine.expect_run().never();

        let outcome = trigger(&fx, Arc::new(engine))
            .run_matching("r1", "evt1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MatchOutcome::Superseded {
                status: RequestStatus::Error
            }
        );
        assert!(!fx.stager.request_dir("r1").exists());
    }

    #[tokio::test]
    async fn test_list_events_skips_hidden_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("evt1")).unwrap();
        std::fs::create_dir_all(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join("stray.jpg"), b"x").unwrap();

        let events = Gallery::new(dir.path()).list_events().await.unwrap();

        assert_eq!(events, vec!["evt1".to_string()]);
    }
}
