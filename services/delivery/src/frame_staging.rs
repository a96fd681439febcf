//! Per-request staging of captured probe frames.
//!
//! Frames live under `{staging_root}/{request_id}/frame_NNN.jpg` until the
//! matching trigger consumes them. Each directory belongs to exactly one request.

use crate::error::{PipelineError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, instrument};

const MAX_REQUEST_ID_LEN: usize = 128;

/// Check that a request id is usable as a directory and object-key component
pub fn validate_request_id(request_id: &str) -> Result<()> {
    if request_id.is_empty() {
        return Err(PipelineError::InvalidInput("request_id is required".to_string()));
    }
    if request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(PipelineError::InvalidInput(format!(
            "request_id longer than {MAX_REQUEST_ID_LEN} characters"
        )));
    }
    if !request_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PipelineError::InvalidInput(
            "request_id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// Decode a base64 frame, accepting `data:image/...;base64,` URLs
pub fn decode_frame(payload: &str) -> Result<Vec<u8>> {
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| PipelineError::InvalidInput("malformed data URL".to_string()))?,
        None => payload,
    };

    STANDARD
        .decode(encoded.trim())
        .map_err(|e| PipelineError::InvalidInput(format!("frame is not valid base64: {e}")))
}

/// Name of the n-th staged frame (1-based)
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:03}.jpg")
}

/// Local staging area for probe frames
#[derive(Debug, Clone)]
pub struct FrameStager {
    root: PathBuf,
}

impl FrameStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Staging directory of a request
    pub fn request_dir(&self, request_id: &str) -> PathBuf {
        self.root.join(request_id)
    }

    /// Write frames as numbered files. Re-staging overwrites same-indexed files.
    #[instrument(skip(self, images), fields(frame_count = images.len()))]
    pub async fn stage_frames(&self, request_id: &str, images: &[Vec<u8>]) -> Result<usize> {
        validate_request_id(request_id)?;
        if images.is_empty() {
            return Err(PipelineError::NoFrames(request_id.to_string()));
        }

        let dir = self.request_dir(request_id);
        fs::create_dir_all(&dir).await?;

        for (index, image) in images.iter().enumerate() {
            fs::write(dir.join(frame_file_name(index + 1)), image).await?;
        }

        info!(request_id = %request_id, frame_count = images.len(), "Frames staged");
        metrics::counter!("delivery.frames.staged").increment(images.len() as u64);

        Ok(images.len())
    }

    /// Whether the request has at least one staged frame
    pub async fn has_frames(&self, request_id: &str) -> Result<bool> {
        let mut entries = match fs::read_dir(self.request_dir(request_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove a request's staged frames; missing directories are not an error
    pub async fn discard(&self, request_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.request_dir(request_id)).await {
            Ok(()) => {
                debug!(request_id = %request_id, "Staged frames removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every staging directory. Used on startup, when no worker owns them.
    pub async fn purge_all(&self) -> Result<usize> {
        fs::create_dir_all(&self.root).await?;

        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Purged leftover staging directories");
        }
        Ok(removed)
    }
}
