//! In-memory collaborators for unit tests

use crate::config::{MatchingConfig, OutputBinding};
use crate::error::Result;
use crate::matching::MatchingEngine;
use crate::notifier::Mailer;
use crate::object_store::ObjectStore;
use crate::request_store::{
    NewUserRequest, RequestPatch, RequestQuery, RequestStatus, RequestStore, StoreError,
    UserRequest,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn test_matching_config(root: &Path) -> MatchingConfig {
    MatchingConfig {
        engine_program: "/bin/true".to_string(),
        engine_args: vec![
            "{probe_dir}".to_string(),
            "{gallery_dir}".to_string(),
            "{output_dir}".to_string(),
        ],
        gallery_root: root.join("gallery"),
        matched_root: root.join("matched"),
        staging_root: root.join("staging"),
        matched_prefix: "clean_".to_string(),
        engine_timeout_secs: 600,
        output_binding: OutputBinding::RequestScoped,
        packaging_delay_ms: 0,
        archive_scratch_dir: Some(root.join("scratch")),
    }
}

/// Request store backed by a map. Each created row is one millisecond newer
/// than the previous, so recency ordering is deterministic.
#[derive(Default)]
pub struct MemoryRequestStore {
    rows: Mutex<HashMap<String, UserRequest>>,
    created: AtomicUsize,
    failing_updates: Mutex<HashSet<String>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: UserRequest) {
        self.rows.lock().insert(request.id.clone(), request);
    }

    pub fn get(&self, id: &str) -> Option<UserRequest> {
        self.rows.lock().get(id).cloned()
    }

    pub fn status_of(&self, id: &str) -> Option<RequestStatus> {
        self.get(id).map(|request| request.status)
    }

    /// Make every later update of `id` fail as if the database were down
    pub fn fail_updates_for(&self, id: &str) {
        self.failing_updates.lock().insert(id.to_string());
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: &NewUserRequest) -> std::result::Result<UserRequest, StoreError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&request.id) {
            return Err(StoreError::Duplicate(request.id.clone()));
        }

        let offset = self.created.fetch_add(1, Ordering::SeqCst) as i64;
        let row = UserRequest {
            id: request.id.clone(),
            email: request.email.clone(),
            event_name: request.event_name.clone(),
            status: RequestStatus::Pending,
            matched_files: Vec::new(),
            zip_url: None,
            zip_uploaded_at: None,
            error_message: None,
            created_at: Utc::now() + ChronoDuration::milliseconds(offset),
        };
        rows.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, id: &str) -> std::result::Result<Option<UserRequest>, StoreError> {
        Ok(self.get(id))
    }

    async fn update_fields(
        &self,
        id: &str,
        patch: &RequestPatch,
    ) -> std::result::Result<bool, StoreError> {
        if self.failing_updates.lock().contains(id) {
            return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        let mut rows = self.rows.lock();
        match rows.get_mut(id) {
            Some(row) if patch.admits(row.status) => {
                patch.apply(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_where(
        &self,
        query: &RequestQuery,
    ) -> std::result::Result<Vec<UserRequest>, StoreError> {
        let mut matched: Vec<UserRequest> = self
            .rows
            .lock()
            .values()
            .filter(|request| query.matches(request))
            .cloned()
            .collect();

        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if query.newest_first {
            matched.reverse();
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }
}

/// Engine that writes `match_count` prefixed images into the output directory
pub struct FakeEngine {
    match_count: usize,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEngine {
    pub fn matching(match_count: usize) -> Self {
        Self {
            match_count,
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of runs that were ever in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn write_matches(&self, output_dir: &Path) -> Result<usize> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        tokio::fs::create_dir_all(output_dir).await?;
        for index in 1..=self.match_count {
            let name = format!("clean_{index}.jpg");
            tokio::fs::write(output_dir.join(name), format!("match {index}")).await?;
        }
        tokio::fs::write(output_dir.join("engine.log"), b"done").await?;

        Ok(self.match_count)
    }
}

#[async_trait]
impl MatchingEngine for FakeEngine {
    async fn run(&self, _probe_dir: &Path, _gallery_dir: &Path, output_dir: &Path) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = self.write_matches(output_dir).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Object store that keeps uploads in memory and records deletions
#[derive(Default)]
pub struct RecordingObjectStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub deletes: Mutex<Vec<String>>,
    fail_uploads: bool,
    fail_deletes: bool,
}

impl RecordingObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads() -> Self {
        Self {
            fail_uploads: true,
            ..Self::default()
        }
    }

    pub fn failing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::default()
        }
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
    async fn upload(&self, key: &str, body: Vec<u8>, _content_type: &str) -> anyhow::Result<()> {
        if self.fail_uploads {
            anyhow::bail!("bucket unreachable");
        }
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }

    async fn public_url(&self, key: &str) -> anyhow::Result<String> {
        Ok(format!("https://cdn.test/{key}"))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.deletes.lock().push(key.to_string());
        if self.fail_deletes {
            anyhow::bail!("access denied");
        }
        self.objects.lock().remove(key);
        Ok(())
    }
}

/// Mailer that records every message
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(to, _)| to.clone()).collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, _subject: &str, body: &str) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("smtp connection refused");
        }
        self.sent.lock().push((to.to_string(), body.to_string()));
        Ok(())
    }
}
