//! FaceFind Delivery Service
//!
//! Asynchronous face-match request pipeline. Clients stage probe frames,
//! submit an email address and an event name, and poll for the outcome. In the
//! background each request is matched against the event's gallery by an
//! external engine; matches are zipped, uploaded to object storage and the
//! download link is mailed to the requester. Delivered archives expire after
//! a retention window.
//!
//! ## Request lifecycle
//!
//! ```text
//!            frames missing
//! pending ─────────────────────────────▶ no_frames
//!    │
//!    ▼           0 matches
//! matching ────────────────────────────▶ no_face
//!    │
//!    │ matches packaged, uploaded, mailed
//!    ▼                     retention elapsed
//!  done ───────────────────────────────▶ expired
//!
//! pending | matching ── any failure ───▶ error
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  HTTP ingress            Worker pool                  PostgreSQL
//! ┌──────────────┐       ┌──────────────┐            ┌──────────────┐
//! │ upload_frames│──────▶│ Frame        │            │ user_requests│
//! │ store_email  │       │ Staging      │            └──────────────┘
//! │ status       │       └──────────────┘                   ▲
//! └──────────────┘              │                           │
//!        │                      ▼                           │
//!        │               ┌──────────────┐   engine          │
//!        │               │ Matching     │──────────▶ output dir
//!        │               │ Trigger      │                   │
//!        │               └──────────────┘                   │
//!        │                      │                           │
//!        │                      ▼                           │
//!        │               ┌──────────────┐    S3      ┌──────────────┐
//!        │               │ Result       │───────────▶│ matched_*.zip│
//!        │               │ Packager     │    SMTP    └──────────────┘
//!        │               └──────────────┘──────────▶ requester
//!        │                                                  ▲
//!        ▼                                                  │
//! ┌──────────────┐       ┌──────────────┐                   │
//! │ Status Query │       │ Expiration   │───────────────────┘
//! └──────────────┘       │ Sweeper      │
//!                        └──────────────┘
//! ```
//!
//! Components share nothing but the request store; each one receives its
//! collaborators at construction.

pub mod api;
pub mod config;
pub mod error;
pub mod frame_staging;
pub mod matching;
pub mod notifier;
pub mod object_store;
pub mod packager;
pub mod pipeline;
pub mod request_store;
pub mod status;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use api::{create_router, start_api_server, AppState};
pub use config::{Config, OutputBinding};
pub use error::{PipelineError, Result};
pub use frame_staging::FrameStager;
pub use matching::{CommandEngine, Gallery, MatchOutcome, MatchingEngine, MatchingTrigger};
pub use notifier::{DeliveryNotifier, Mailer, SmtpMailer};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use packager::{Delivery, ResultPackager};
pub use pipeline::{RequestChain, RequestPipeline};
pub use request_store::{
    PgRequestStore, RequestPatch, RequestQuery, RequestStatus, RequestStore, StoreError,
    UserRequest,
};
pub use status::{StatusQuery, StatusView};
pub use sweeper::{ExpirationSweeper, LocalReaper};
