//! Result packager: archives a request's matched images, uploads the archive,
//! mails the download link and marks the request `done`.

use crate::config::{MatchingConfig, OutputBinding};
use crate::error::{PipelineError, Result};
use crate::matching::collect_matched_files;
use crate::notifier::DeliveryNotifier;
use crate::object_store::{archive_key, ObjectStore};
use crate::request_store::{RequestPatch, RequestQuery, RequestStatus, RequestStore, UserRequest};
use chrono::Utc;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// A completed delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Request the archive was delivered to
    pub request_id: String,
    pub key: String,
    pub zip_url: String,
    pub matched_files: Vec<String>,
}

pub struct ResultPackager {
    store: Arc<dyn RequestStore>,
    object_store: Arc<dyn ObjectStore>,
    notifier: Arc<DeliveryNotifier>,
    binding: OutputBinding,
    matched_prefix: String,
    packaging_delay: Duration,
    scratch_dir: Option<PathBuf>,
}

impl ResultPackager {
    pub fn new(
        store: Arc<dyn RequestStore>,
        object_store: Arc<dyn ObjectStore>,
        notifier: Arc<DeliveryNotifier>,
        config: &MatchingConfig,
    ) -> Self {
        Self {
            store,
            object_store,
            notifier,
            binding: config.output_binding,
            matched_prefix: config.matched_prefix.clone(),
            packaging_delay: config.packaging_delay(),
            scratch_dir: config.archive_scratch_dir.clone(),
        }
    }

    /// Package the matches in `output_dir` and deliver them.
    ///
    /// Failures are recorded on the selected request before being returned.
    /// `zip_url` is only ever written together with `status = done`.
    #[instrument(skip(self))]
    pub async fn package_and_deliver(&self, origin_id: &str, output_dir: &Path) -> Result<Delivery> {
        let target = self.select_target(origin_id).await?;

        match self.deliver(&target, output_dir).await {
            Ok(delivery) => {
                if delivery.request_id != origin_id {
                    warn!(
                        origin_id = %origin_id,
                        delivered_to = %delivery.request_id,
                        "Matched output delivered to a different request"
                    );
                    let detail = format!(
                        "matched output was delivered to request {}",
                        delivery.request_id
                    );
                    self.store
                        .update_fields(origin_id, &RequestPatch::failed(detail))
                        .await?;
                }
                Ok(delivery)
            }
            Err(e) => {
                warn!(request_id = %target.id, error = %e, "Packaging failed");
                if let Err(store_err) = self
                    .store
                    .update_fields(&target.id, &RequestPatch::failed(e.to_string()))
                    .await
                {
                    warn!(request_id = %target.id, error = %store_err, "Failed to record packaging failure");
                }
                Err(e)
            }
        }
    }

    /// Request the archive belongs to.
    ///
    /// With a shared output directory the output carries no request tag, so
    /// after a short delay the newest pending-or-matching request is chosen.
    async fn select_target(&self, origin_id: &str) -> Result<UserRequest> {
        match self.binding {
            OutputBinding::RequestScoped => self
                .store
                .get_by_id(origin_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(origin_id.to_string())),
            OutputBinding::SharedLatestPending => {
                tokio::time::sleep(self.packaging_delay).await;
                let query = RequestQuery {
                    statuses: vec![RequestStatus::Pending, RequestStatus::Matching],
                    newest_first: true,
                    limit: Some(1),
                    ..Default::default()
                };
                self.store
                    .list_where(&query)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        PipelineError::PackagingFailure("no pending request to deliver to".to_string())
                    })
            }
        }
    }

    fn done_guard(&self) -> &'static [RequestStatus] {
        match self.binding {
            OutputBinding::RequestScoped => &[RequestStatus::Matching],
            OutputBinding::SharedLatestPending => &[RequestStatus::Pending, RequestStatus::Matching],
        }
    }

    async fn deliver(&self, target: &UserRequest, output_dir: &Path) -> Result<Delivery> {
        let matched_files = collect_matched_files(output_dir, &self.matched_prefix).await?;
        if matched_files.is_empty() {
            return Err(PipelineError::PackagingFailure(
                "no matched files found".to_string(),
            ));
        }

        // Removed from disk when dropped, on every path out of this function
        let archive = build_archive(output_dir, &matched_files, self.scratch_dir.as_deref()).await?;
        let body = tokio::fs::read(archive.path()).await?;

        let key = archive_key(&target.email, &target.id);
        self.object_store
            .upload(&key, body, ARCHIVE_CONTENT_TYPE)
            .await
            .map_err(|e| PipelineError::PackagingFailure(format!("{e:#}")))?;
        metrics::counter!("delivery.archives.uploaded").increment(1);

        let zip_url = match self.publish(target, &key, &matched_files).await {
            Ok(zip_url) => zip_url,
            Err(e) => {
                // No zip_url was recorded, so the sweeper would never find it
                if let Err(delete_err) = self.object_store.delete(&key).await {
                    metrics::counter!("delivery.archives.orphaned").increment(1);
                    warn!(
                        request_id = %target.id,
                        key = %key,
                        error = %delete_err,
                        "Failed to remove undelivered archive"
                    );
                }
                return Err(e);
            }
        };

        info!(
            request_id = %target.id,
            key = %key,
            file_count = matched_files.len(),
            "Request delivered"
        );

        Ok(Delivery {
            request_id: target.id.clone(),
            key,
            zip_url,
            matched_files,
        })
    }

    /// Mails the link for an uploaded archive and records the delivery.
    async fn publish(
        &self,
        target: &UserRequest,
        key: &str,
        matched_files: &[String],
    ) -> Result<String> {
        let zip_url = self
            .object_store
            .public_url(key)
            .await
            .map_err(|e| PipelineError::PackagingFailure(format!("{e:#}")))?;

        self.notifier.notify(&target.email, &zip_url).await?;

        let patch = RequestPatch::transition(RequestStatus::Done)
            .only_if(self.done_guard())
            .zip_url(Some(zip_url.clone()))
            .matched_files(matched_files.to_vec())
            .zip_uploaded_at(Some(Utc::now()))
            .error_message(None);

        if !self.store.update_fields(&target.id, &patch).await? {
            return Err(PipelineError::PackagingFailure(format!(
                "request {} left matching before delivery completed",
                target.id
            )));
        }

        Ok(zip_url)
    }
}

/// Archive entry name: `matched_{n}.{ext}`
pub fn entry_name(index: usize, file_name: &str) -> String {
    match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("matched_{index}.{ext}"),
        None => format!("matched_{index}"),
    }
}

/// Zip `files` from `source_dir` into a temporary file
pub async fn build_archive(
    source_dir: &Path,
    files: &[String],
    scratch_dir: Option<&Path>,
) -> Result<NamedTempFile> {
    let source_dir = source_dir.to_path_buf();
    let files = files.to_vec();
    let scratch_dir = scratch_dir.map(Path::to_path_buf);

    tokio::task::spawn_blocking(move || write_archive(&source_dir, &files, scratch_dir.as_deref()))
        .await
        .map_err(|e| PipelineError::PackagingFailure(format!("archive task failed: {e}")))?
}

fn write_archive(source_dir: &Path, files: &[String], scratch_dir: Option<&Path>) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("matched_").suffix(".zip");
    let mut archive = match scratch_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            builder.tempfile_in(dir)?
        }
        None => builder.tempfile()?,
    };

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(archive.as_file_mut());

    for (index, name) in files.iter().enumerate() {
        zip.start_file(entry_name(index + 1, name), options)
            .map_err(zip_error)?;
        let mut source = File::open(source_dir.join(name))?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish().map_err(zip_error)?;
    drop(zip);

    Ok(archive)
}

fn zip_error(e: zip::result::ZipError) -> PipelineError {
    PipelineError::PackagingFailure(format!("failed to write archive: {e}"))
}
