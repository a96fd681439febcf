//! Periodic maintenance: expiring delivered archives and reaping stale local files.

use crate::config::{MatchingConfig, OutputBinding, RetentionConfig};
use crate::error::Result;
use crate::object_store::{archive_key, ObjectStore};
use crate::request_store::{RequestPatch, RequestQuery, RequestStatus, RequestStore};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub delete_failures: usize,
    pub update_failures: usize,
}

/// Expires delivered archives once their retention window has passed
pub struct ExpirationSweeper {
    store: Arc<dyn RequestStore>,
    object_store: Arc<dyn ObjectStore>,
    retention: Duration,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(
        store: Arc<dyn RequestStore>,
        object_store: Arc<dyn ObjectStore>,
        config: &RetentionConfig,
    ) -> Self {
        Self {
            store,
            object_store,
            retention: config.archive_retention(),
            interval: config.sweep_interval(),
        }
    }

    /// Expire every delivered archive uploaded strictly before `now - retention`.
    ///
    /// A failed object deletion is logged and the request is expired anyway.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let query = RequestQuery {
            has_zip_url: Some(true),
            ..Default::default()
        };
        let delivered = self.store.list_where(&query).await?;
        let retention = chrono::Duration::seconds(self.retention.as_secs() as i64);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport {
            examined: delivered.len(),
            ..Default::default()
        };

        for request in delivered {
            let Some(uploaded_at) = request.zip_uploaded_at else {
                debug!(request_id = %request.id, "Delivered request has no upload time, skipping");
                continue;
            };
            if uploaded_at >= cutoff {
                continue;
            }

            let key = archive_key(&request.email, &request.id);
            if let Err(e) = self.object_store.delete(&key).await {
                warn!(request_id = %request.id, key = %key, error = %e, "Failed to delete expired archive");
                metrics::counter!("delivery.sweeper.delete_failures").increment(1);
                report.delete_failures += 1;
            }

            let patch = RequestPatch::transition(RequestStatus::Expired).zip_url(None);
            match self.store.update_fields(&request.id, &patch).await {
                Ok(true) => {
                    info!(request_id = %request.id, key = %key, "Archive expired");
                    metrics::counter!("delivery.archives.expired").increment(1);
                    report.expired += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    // Retried on the next pass
                    warn!(request_id = %request.id, error = %e, "Failed to mark request expired");
                    metrics::counter!("delivery.sweeper.update_failures").increment(1);
                    report.update_failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweep immediately, then once per interval until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Expiration sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.expired > 0 || report.update_failures > 0 => {
                            info!(
                                expired = report.expired,
                                delete_failures = report.delete_failures,
                                update_failures = report.update_failures,
                                "Sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }

        info!("Expiration sweeper stopped");
    }
}

/// Outcome of one reaper pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    pub staging_dirs: usize,
    pub output_dirs: usize,
    pub gallery_files: usize,
}

/// Removes local files left behind by crashed or abandoned work
pub struct LocalReaper {
    staging_root: PathBuf,
    matched_root: PathBuf,
    gallery_root: PathBuf,
    binding: OutputBinding,
    staging_max_age: Duration,
    output_max_age: Duration,
    gallery_max_age: Duration,
    interval: Duration,
}

impl LocalReaper {
    pub fn new(matching: &MatchingConfig, retention: &RetentionConfig) -> Self {
        Self {
            staging_root: matching.staging_root.clone(),
            matched_root: matching.matched_root.clone(),
            gallery_root: matching.gallery_root.clone(),
            binding: matching.output_binding,
            staging_max_age: Duration::from_secs(retention.staging_max_age_secs),
            output_max_age: Duration::from_secs(retention.output_max_age_secs),
            gallery_max_age: Duration::from_secs(retention.gallery_max_age_secs),
            interval: retention.reaper_interval(),
        }
    }

    pub async fn reap_once(&self, now: SystemTime) -> Result<ReapReport> {
        let mut report = ReapReport {
            staging_dirs: remove_stale_dirs(&self.staging_root, now, self.staging_max_age).await?,
            ..Default::default()
        };

        // A shared output directory is cleared by the next run instead
        if self.binding == OutputBinding::RequestScoped {
            report.output_dirs = remove_stale_dirs(&self.matched_root, now, self.output_max_age).await?;
        }

        let events = match fs::read_dir(&self.gallery_root).await {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(mut entries) = events {
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    report.gallery_files +=
                        remove_stale_files(&entry.path(), now, self.gallery_max_age).await?;
                }
            }
        }

        let removed = report.staging_dirs + report.output_dirs + report.gallery_files;
        if removed > 0 {
            info!(
                staging_dirs = report.staging_dirs,
                output_dirs = report.output_dirs,
                gallery_files = report.gallery_files,
                "Removed stale local files"
            );
            metrics::counter!("delivery.reaper.removed").increment(removed as u64);
        }

        Ok(report)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once(SystemTime::now()).await {
                        error!(error = %e, "Local reaper pass failed");
                    }
                }
            }
        }

        debug!("Local reaper stopped");
    }
}

fn is_stale(modified: std::io::Result<SystemTime>, now: SystemTime, max_age: Duration) -> bool {
    modified
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map_or(false, |age| age > max_age)
}

async fn remove_stale_dirs(root: &Path, now: SystemTime, max_age: Duration) -> Result<usize> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_dir() && is_stale(metadata.modified(), now, max_age) {
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale directory"),
            }
        }
    }
    Ok(removed)
}

async fn remove_stale_files(dir: &Path, now: SystemTime, max_age: Duration) -> Result<usize> {
    let mut entries = fs::read_dir(dir).await?;

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && is_stale(metadata.modified(), now, max_age) {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale file"),
            }
        }
    }
    Ok(removed)
}
