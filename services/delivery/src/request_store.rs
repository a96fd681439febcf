//! Persistent request rows and the guarded state machine over them.

use crate::config::DatabaseConfig;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

const REQUEST_COLUMNS: &str = "id, email, event_name, status, matched_files, zip_url, \
                               zip_uploaded_at, error_message, created_at";

/// Errors raised by the request store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("request {0} already exists")]
    Duplicate(String),

    #[error("corrupt request row {id}: {message}")]
    CorruptRow { id: String, message: String },
}

/// Lifecycle status of a user request.
///
/// `pending` is initial. `no_frames`, `no_face`, `error` and `expired` are final;
/// `done` only ever moves on to `expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Matching,
    NoFrames,
    NoFace,
    Done,
    Error,
    Expired,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 7] = [
        RequestStatus::Pending,
        RequestStatus::Matching,
        RequestStatus::NoFrames,
        RequestStatus::NoFace,
        RequestStatus::Done,
        RequestStatus::Error,
        RequestStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Matching => "matching",
            RequestStatus::NoFrames => "no_frames",
            RequestStatus::NoFace => "no_face",
            RequestStatus::Done => "done",
            RequestStatus::Error => "error",
            RequestStatus::Expired => "expired",
        }
    }

    /// Whether no further processing will happen for this request
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::Matching)
    }

    /// Legal edges of the request state machine
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Matching)
                | (Pending, NoFrames)
                | (Pending, Error)
                | (Matching, NoFace)
                | (Matching, Done)
                | (Matching, Error)
                | (Done, Expired)
        )
    }

    /// Statuses from which `next` may be entered
    pub fn predecessors(next: RequestStatus) -> Vec<RequestStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown request status '{s}'"))
    }
}

/// One face-match submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRequest {
    /// Client-supplied correlation id
    pub id: String,
    /// Delivery address
    pub email: String,
    /// Gallery event matched against
    pub event_name: String,
    pub status: RequestStatus,
    /// Matched output filenames, in archive order
    pub matched_files: Vec<String>,
    /// Download URL of the delivered archive
    pub zip_url: Option<String>,
    /// When the archive was uploaded
    pub zip_uploaded_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied on submission
#[derive(Debug, Clone, PartialEq)]
pub struct NewUserRequest {
    pub id: String,
    pub email: String,
    pub event_name: String,
}

#[derive(Debug, FromRow)]
struct UserRequestRow {
    id: String,
    email: String,
    event_name: String,
    status: String,
    matched_files: Vec<String>,
    zip_url: Option<String>,
    zip_uploaded_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRequestRow> for UserRequest {
    type Error = StoreError;

    fn try_from(row: UserRequestRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(|message| StoreError::CorruptRow {
            id: row.id.clone(),
            message,
        })?;

        Ok(Self {
            id: row.id,
            email: row.email,
            event_name: row.event_name,
            status,
            matched_files: row.matched_files,
            zip_url: row.zip_url,
            zip_uploaded_at: row.zip_uploaded_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

/// Partial update of a request row.
///
/// Nullable columns use `Option<Option<_>>`: the outer `None` leaves the column
/// untouched, `Some(None)` clears it. A non-empty `only_if_status` turns the
/// update into a compare-and-set on the current status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    pub status: Option<RequestStatus>,
    pub matched_files: Option<Vec<String>>,
    pub zip_url: Option<Option<String>>,
    pub zip_uploaded_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub only_if_status: Vec<RequestStatus>,
}

impl RequestPatch {
    /// Move to `next`, guarded by the legal predecessors of `next`
    pub fn transition(next: RequestStatus) -> Self {
        Self {
            status: Some(next),
            only_if_status: RequestStatus::predecessors(next),
            ..Default::default()
        }
    }

    /// Move to `error` with a failure detail
    pub fn failed(message: impl Into<String>) -> Self {
        Self::transition(RequestStatus::Error).error_message(Some(message.into()))
    }

    pub fn matched_files(mut self, files: Vec<String>) -> Self {
        self.matched_files = Some(files);
        self
    }

    pub fn zip_url(mut self, url: Option<String>) -> Self {
        self.zip_url = Some(url);
        self
    }

    pub fn zip_uploaded_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.zip_uploaded_at = Some(at);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    /// Replace the status guard
    pub fn only_if(mut self, statuses: &[RequestStatus]) -> Self {
        self.only_if_status = statuses.to_vec();
        self
    }

    /// True when no column would change
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.matched_files.is_none()
            && self.zip_url.is_none()
            && self.zip_uploaded_at.is_none()
            && self.error_message.is_none()
    }

    /// Whether the guard admits a row currently in `current`
    pub fn admits(&self, current: RequestStatus) -> bool {
        self.only_if_status.is_empty() || self.only_if_status.contains(&current)
    }

    /// Apply the patch to an in-memory copy of a row
    pub fn apply(&self, request: &mut UserRequest) {
        if let Some(status) = self.status {
            request.status = status;
        }
        if let Some(ref files) = self.matched_files {
            request.matched_files = files.clone();
        }
        if let Some(ref url) = self.zip_url {
            request.zip_url = url.clone();
        }
        if let Some(at) = self.zip_uploaded_at {
            request.zip_uploaded_at = at;
        }
        if let Some(ref message) = self.error_message {
            request.error_message = message.clone();
        }
    }
}

/// Predicate, order and limit for listing requests
#[derive(Debug, Clone, Default)]
pub struct RequestQuery {
    /// Match any of these statuses (empty = all)
    pub statuses: Vec<RequestStatus>,
    /// Filter on presence of a download URL
    pub has_zip_url: Option<bool>,
    /// Order by creation time (true = newest first)
    pub newest_first: bool,
    /// Maximum number of results
    pub limit: Option<i64>,
}

impl RequestQuery {
    /// Evaluate the predicate against a row
    pub fn matches(&self, request: &UserRequest) -> bool {
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&request.status);
        let url_ok = self
            .has_zip_url
            .map_or(true, |wanted| request.zip_url.is_some() == wanted);
        status_ok && url_ok
    }
}

/// Key-based access to the request ledger.
///
/// All operations are single-row; there are no multi-row transactions.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new `pending` request
    async fn create(&self, request: &NewUserRequest) -> Result<UserRequest, StoreError>;

    /// Fetch a request by id
    async fn get_by_id(&self, id: &str) -> Result<Option<UserRequest>, StoreError>;

    /// Apply a partial update; returns whether a row was changed
    async fn update_fields(&self, id: &str, patch: &RequestPatch) -> Result<bool, StoreError>;

    /// List requests matching a query
    async fn list_where(&self, query: &RequestQuery) -> Result<Vec<UserRequest>, StoreError>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// PostgreSQL-backed request store
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    /// Create a new request store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn create(&self, request: &NewUserRequest) -> Result<UserRequest, StoreError> {
        let sql = format!(
            "INSERT INTO user_requests (id, email, event_name, status, matched_files) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {REQUEST_COLUMNS}"
        );

        let row = sqlx::query_as::<_, UserRequestRow>(&sql)
            .bind(&request.id)
            .bind(&request.email)
            .bind(&request.event_name)
            .bind(RequestStatus::Pending.as_str())
            .bind(Vec::<String>::new())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Duplicate(request.id.clone())
                }
                other => StoreError::Unavailable(other),
            })?;

        debug!(request_id = %request.id, "Request row created");

        row.try_into()
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<UserRequest>, StoreError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM user_requests WHERE id = $1");

        let row = sqlx::query_as::<_, UserRequestRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(UserRequest::try_from).transpose()
    }

    #[instrument(skip(self, patch), fields(status = ?patch.status))]
    async fn update_fields(&self, id: &str, patch: &RequestPatch) -> Result<bool, StoreError> {
        if patch.is_empty() {
            return Ok(false);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE user_requests SET ");
        {
            let mut assignments = builder.separated(", ");
            if let Some(status) = patch.status {
                assignments.push("status = ");
                assignments.push_bind_unseparated(status.as_str());
            }
            if let Some(ref files) = patch.matched_files {
                assignments.push("matched_files = ");
                assignments.push_bind_unseparated(files.clone());
            }
            if let Some(ref url) = patch.zip_url {
                assignments.push("zip_url = ");
                assignments.push_bind_unseparated(url.clone());
            }
            if let Some(at) = patch.zip_uploaded_at {
                assignments.push("zip_uploaded_at = ");
                assignments.push_bind_unseparated(at);
            }
            if let Some(ref message) = patch.error_message {
                assignments.push("error_message = ");
                assignments.push_bind_unseparated(message.clone());
            }
        }

        builder.push(" WHERE id = ").push_bind(id.to_string());

        if !patch.only_if_status.is_empty() {
            let guard: Vec<String> = patch
                .only_if_status
                .iter()
                .map(|status| status.as_str().to_string())
                .collect();
            builder.push(" AND status = ANY(").push_bind(guard).push(")");
        }

        let result = builder.build().execute(&self.pool).await?;
        let changed = result.rows_affected() > 0;

        if !changed {
            debug!(request_id = %id, "Update matched no row (missing or guarded)");
        }

        Ok(changed)
    }

    #[instrument(skip(self))]
    async fn list_where(&self, query: &RequestQuery) -> Result<Vec<UserRequest>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {REQUEST_COLUMNS} FROM user_requests WHERE 1=1"));

        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query
                .statuses
                .iter()
                .map(|status| status.as_str().to_string())
                .collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }

        match query.has_zip_url {
            Some(true) => {
                builder.push(" AND zip_url IS NOT NULL");
            }
            Some(false) => {
                builder.push(" AND zip_url IS NULL");
            }
            None => {}
        }

        if query.newest_first {
            builder.push(" ORDER BY created_at DESC, id DESC");
        } else {
            builder.push(" ORDER BY created_at ASC, id ASC");
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder
            .build_query_as::<UserRequestRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(UserRequest::try_from).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(status: RequestStatus) -> UserRequest {
        UserRequest {
            id: "r1".to_string(),
            email: "a@b.com".to_string(),
            event_name: "evt1".to_string(),
            status,
            matched_files: vec![],
            zip_url: None,
            zip_uploaded_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>(), Ok(status));
        }
        assert!("matched".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RequestStatus::NoFace).unwrap(),
            "\"no_face\""
        );
    }

    #[test]
    fn test_done_requires_matching() {
        assert_eq!(
            RequestStatus::predecessors(RequestStatus::Done),
            vec![RequestStatus::Matching]
        );
        assert!(!RequestStatus::Pending.can_transition_to(RequestStatus::Done));
        assert_eq!(
            RequestStatus::predecessors(RequestStatus::Expired),
            vec![RequestStatus::Done]
        );
    }

    #[test]
    fn test_terminal_statuses_have_no_exit_except_done() {
        for status in RequestStatus::ALL {
            let exits: Vec<_> = RequestStatus::ALL
                .into_iter()
                .filter(|next| status.can_transition_to(*next))
                .collect();
            match status {
                RequestStatus::Done => assert_eq!(exits, vec![RequestStatus::Expired]),
                s if s.is_terminal() => assert!(exits.is_empty(), "{s} should be final"),
                _ => assert!(exits.contains(&RequestStatus::Error)),
            }
        }
    }

    #[test]
    fn test_failed_patch_is_guarded() {
        let patch = RequestPatch::failed("upload failed");
        assert!(patch.admits(RequestStatus::Pending));
        assert!(patch.admits(RequestStatus::Matching));
        assert!(!patch.admits(RequestStatus::Done));
        assert!(!patch.admits(RequestStatus::Error));
    }

    #[test]
    fn test_patch_apply_clears_nullable_fields() {
        let mut request = sample_request(RequestStatus::Done);
        request.zip_url = Some("https://cdn/x.zip".to_string());

        RequestPatch::transition(RequestStatus::Expired)
            .zip_url(None)
            .apply(&mut request);

        assert_eq!(request.status, RequestStatus::Expired);
        assert_eq!(request.zip_url, None);
    }

    #[test]
    fn test_empty_patch() {
        assert!(RequestPatch::default().is_empty());
        assert!(!RequestPatch::default().zip_url(None).is_empty());
    }

    #[test]
    fn test_query_predicate() {
        let mut request = sample_request(RequestStatus::Done);
        let delivered = RequestQuery {
            has_zip_url: Some(true),
            ..Default::default()
        };
        assert!(!delivered.matches(&request));

        request.zip_url = Some("https://cdn/x.zip".to_string());
        assert!(delivered.matches(&request));

        let in_flight = RequestQuery {
            statuses: vec![RequestStatus::Pending, RequestStatus::Matching],
            ..Default::default()
        };
        assert!(!in_flight.matches(&request));
    }
}
