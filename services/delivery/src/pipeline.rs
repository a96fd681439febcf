//! Bounded worker pool running one matching-and-delivery chain per request.
//!
//! Each submitted request gets a task on a [`TaskTracker`]; at most
//! `max_concurrent_jobs` chains run at once. Every job holds a child of the
//! pipeline's root [`CancellationToken`], so one request or all of them can be
//! cancelled. Workers talk to each other only through the request store.

use crate::config::{OutputBinding, WorkerConfig};
use crate::error::{PipelineError, Result};
use crate::frame_staging::{decode_frame, validate_request_id, FrameStager};
use crate::matching::{validate_event_name, MatchOutcome, MatchingTrigger};
use crate::packager::ResultPackager;
use crate::request_store::{
    NewUserRequest, RequestPatch, RequestQuery, RequestStatus, RequestStore, UserRequest,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, instrument, warn, Instrument};

const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// The strictly sequential work done for one request:
/// matching, then packaging and notification, then the final status update.
pub struct RequestChain {
    store: Arc<dyn RequestStore>,
    stager: Arc<FrameStager>,
    trigger: MatchingTrigger,
    packager: ResultPackager,
    /// Single-writer lock over the shared output directory (legacy binding only)
    shared_output: Option<tokio::sync::Mutex<()>>,
}

impl RequestChain {
    pub fn new(
        store: Arc<dyn RequestStore>,
        stager: Arc<FrameStager>,
        trigger: MatchingTrigger,
        packager: ResultPackager,
        binding: OutputBinding,
    ) -> Self {
        let shared_output = match binding {
            OutputBinding::RequestScoped => None,
            OutputBinding::SharedLatestPending => Some(tokio::sync::Mutex::new(())),
        };

        Self {
            store,
            stager,
            trigger,
            packager,
            shared_output,
        }
    }

    /// Run the chain; failures end up on the request row
    pub async fn run(&self, request_id: &str, event_name: &str, cancel: &CancellationToken) {
        let _output_guard = match &self.shared_output {
            Some(lock) => tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon(request_id, PipelineError::Cancelled(request_id.to_string())).await;
                    return;
                }
                guard = lock.lock() => Some(guard),
            },
            None => None,
        };

        if let Err(e) = self.execute(request_id, event_name, cancel).await {
            warn!(request_id = %request_id, error = %e, "Request failed");
            self.record_failure(request_id, &e).await;
        }

        match self.store.get_by_id(request_id).await {
            Ok(Some(request)) => {
                info!(request_id = %request_id, status = %request.status, "Request finished");
                metrics::counter!("delivery.requests.completed", "status" => request.status.as_str())
                    .increment(1);
            }
            Ok(None) => warn!(request_id = %request_id, "Request disappeared while processing"),
            Err(e) => warn!(request_id = %request_id, error = %e, "Failed to read final status"),
        }
    }

    async fn execute(
        &self,
        request_id: &str,
        event_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let output_dir = match self.trigger.run_matching(request_id, event_name, cancel).await? {
            MatchOutcome::Matched { output_dir, .. } => output_dir,
            MatchOutcome::NoFrames | MatchOutcome::NoFace | MatchOutcome::Superseded { .. } => {
                return Ok(())
            }
        };

        // Packaging is not interrupted once started; mail may already be out
        let result = if cancel.is_cancelled() {
            Err(PipelineError::Cancelled(request_id.to_string()))
        } else {
            self.packager
                .package_and_deliver(request_id, &output_dir)
                .await
                .map(|_| ())
        };

        self.trigger.release_output_dir(request_id).await;
        result
    }

    /// Give up on a request that never started
    async fn abandon(&self, request_id: &str, reason: PipelineError) {
        if let Err(e) = self.stager.discard(request_id).await {
            warn!(request_id = %request_id, error = %e, "Failed to remove staged frames");
        }
        self.record_failure(request_id, &reason).await;
    }

    /// Guarded move to `error`; a request that already reached a final status is left alone
    async fn record_failure(&self, request_id: &str, failure: &PipelineError) {
        let patch = RequestPatch::failed(failure.to_string());
        match self.store.update_fields(request_id, &patch).await {
            Ok(true) => info!(request_id = %request_id, error = %failure, "Recorded request failure"),
            Ok(false) => {}
            Err(e) => error!(request_id = %request_id, error = %e, "Failed to record request failure"),
        }
    }
}

/// Accepts submissions and schedules their chains
pub struct RequestPipeline {
    store: Arc<dyn RequestStore>,
    stager: Arc<FrameStager>,
    chain: Arc<RequestChain>,
    permits: Arc<Semaphore>,
    root: CancellationToken,
    jobs: Arc<Mutex<HashMap<String, CancellationToken>>>,
    tracker: TaskTracker,
}

impl RequestPipeline {
    pub fn new(
        store: Arc<dyn RequestStore>,
        stager: Arc<FrameStager>,
        chain: RequestChain,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            stager,
            chain: Arc::new(chain),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            root: CancellationToken::new(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Decode and stage base64 frames for a request
    pub async fn stage_frames(&self, request_id: &str, frames: &[String]) -> Result<usize> {
        validate_request_id(request_id)?;
        let images = frames
            .iter()
            .map(|frame| decode_frame(frame))
            .collect::<Result<Vec<_>>>()?;

        self.stager.stage_frames(request_id, &images).await
    }

    /// Create a `pending` request and schedule its chain.
    ///
    /// Returns as soon as the row exists; the outcome is observed by polling.
    #[instrument(skip(self))]
    pub async fn submit(&self, request_id: &str, email: &str, event_name: &str) -> Result<UserRequest> {
        validate_request_id(request_id)?;
        if email.trim().is_empty() {
            return Err(PipelineError::InvalidInput("email is required".to_string()));
        }
        validate_event_name(event_name)?;

        let request = self
            .store
            .create(&NewUserRequest {
                id: request_id.to_string(),
                email: email.trim().to_string(),
                event_name: event_name.trim().to_string(),
            })
            .await?;

        metrics::counter!("delivery.requests.submitted").increment(1);
        self.spawn_chain(&request);

        Ok(request)
    }

    fn spawn_chain(&self, request: &UserRequest) {
        let token = self.root.child_token();
        self.jobs.lock().insert(request.id.clone(), token.clone());

        let chain = self.chain.clone();
        let permits = self.permits.clone();
        let jobs = self.jobs.clone();
        let request_id = request.id.clone();
        let event_name = request.event_name.clone();
        let span = info_span!("request", request_id = %request.id);

        self.tracker.spawn(
            async move {
                let permit = tokio::select! {
                    _ = token.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };

                match permit {
                    Some(_permit) => chain.run(&request_id, &event_name, &token).await,
                    None => {
                        chain
                            .abandon(&request_id, PipelineError::Cancelled(request_id.clone()))
                            .await
                    }
                }

                jobs.lock().remove(&request_id);
            }
            .instrument(span),
        );
    }

    /// Cancel one request's chain; returns false when it is not running
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.jobs.lock().get(request_id) {
            Some(token) => {
                info!(request_id = %request_id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of chains queued or running
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Wait for every scheduled chain to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel all chains and wait for them to stop
    pub async fn shutdown(&self) {
        info!(active_jobs = self.active_jobs(), "Shutting down request pipeline");
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Fail requests a previous process left `pending` or `matching`.
    ///
    /// Must run before the first submission.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let query = RequestQuery {
            statuses: RequestStatus::ALL
                .into_iter()
                .filter(|status| !status.is_terminal())
                .collect(),
            ..Default::default()
        };

        let mut recovered = 0;
        for request in self.store.list_where(&query).await? {
            if self
                .store
                .update_fields(&request.id, &RequestPatch::failed(INTERRUPTED_MESSAGE))
                .await?
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(recovered, "Marked interrupted requests as failed");
        }
        Ok(recovered)
    }
}
