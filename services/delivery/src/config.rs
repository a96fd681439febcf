use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`Config::validate`]
#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the delivery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Request store configuration
    pub database: DatabaseConfig,
    /// Object storage configuration for delivered archives
    #[serde(default)]
    pub storage: StorageConfig,
    /// Outgoing mail configuration
    pub mail: MailConfig,
    /// Matching engine and local directory layout
    pub matching: MatchingConfig,
    /// Background worker pool
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Archive retention and local cleanup schedules
    #[serde(default)]
    pub retention: RetentionConfig,
    /// HTTP ingress
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// S3-compatible object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding delivered archives
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL of the bucket. When unset, presigned URLs are issued instead.
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// SMTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// SMTP relay host
    pub smtp_host: String,
    /// SMTP relay port
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Upgrade the connection with STARTTLS
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// SMTP username
    pub username: Option<String>,
    /// SMTP password
    pub password: Option<String>,
    /// Sender address
    pub from_address: String,
    /// Subject line of result mails
    #[serde(default = "default_mail_subject")]
    pub subject: String,
}

/// How matched output produced by the engine is bound to a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputBinding {
    /// Each request gets its own output directory under the matched root
    #[default]
    RequestScoped,
    /// One shared output directory; the newest pending-or-matching request is packaged
    SharedLatestPending,
}

/// Matching engine and filesystem layout
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    /// External matching program
    pub engine_program: String,
    /// Arguments; `{probe_dir}`, `{gallery_dir}` and `{output_dir}` are substituted
    #[serde(default = "default_engine_args")]
    pub engine_args: Vec<String>,
    /// Root holding one directory of reference images per event
    #[serde(default = "default_gallery_root")]
    pub gallery_root: PathBuf,
    /// Root receiving matched output images
    #[serde(default = "default_matched_root")]
    pub matched_root: PathBuf,
    /// Root holding per-request staged frames
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    /// Filename prefix marking matched output images
    #[serde(default = "default_matched_prefix")]
    pub matched_prefix: String,
    /// Engine timeout in seconds (0 disables the timeout)
    #[serde(default = "default_engine_timeout_secs")]
    pub engine_timeout_secs: u64,
    /// Output binding policy
    #[serde(default)]
    pub output_binding: OutputBinding,
    /// Delay before the shared-output packager selects its request, in milliseconds
    #[serde(default = "default_packaging_delay_ms")]
    pub packaging_delay_ms: u64,
    /// Directory for temporary archives (system temp dir when unset)
    pub archive_scratch_dir: Option<PathBuf>,
}

/// Background worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of requests matched/packaged at the same time
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Fail requests left pending/matching by a previous process on startup
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,
}

/// Retention windows and cleanup schedules
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// How long a delivered archive stays downloadable
    #[serde(default = "default_archive_retention_secs")]
    pub archive_retention_secs: u64,
    /// Interval between expiration sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Interval between local stale-file passes
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Age after which abandoned staging directories are removed
    #[serde(default = "default_staging_max_age_secs")]
    pub staging_max_age_secs: u64,
    /// Age after which leftover request output directories are removed
    #[serde(default = "default_output_max_age_secs")]
    pub output_max_age_secs: u64,
    /// Age after which gallery images are removed
    #[serde(default = "default_gallery_max_age_secs")]
    pub gallery_max_age_secs: u64,
}

/// API configuration for the ingress endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size (frame uploads are base64 JSON)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "delivery-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    "matched-results".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_smtp_port() -> u16 {
    587
}

fn default_mail_subject() -> String {
    "Face Match Results".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec![
        "{probe_dir}".to_string(),
        "{gallery_dir}".to_string(),
        "{output_dir}".to_string(),
    ]
}

fn default_gallery_root() -> PathBuf {
    PathBuf::from("static/gallery")
}

fn default_matched_root() -> PathBuf {
    PathBuf::from("static/matched")
}

fn default_staging_root() -> PathBuf {
    PathBuf::from("tmp_frames")
}

fn default_matched_prefix() -> String {
    "clean_".to_string()
}

fn default_engine_timeout_secs() -> u64 {
    600
}

fn default_packaging_delay_ms() -> u64 {
    2000
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_archive_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_reaper_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_staging_max_age_secs() -> u64 {
    3600
}

fn default_output_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_gallery_max_age_secs() -> u64 {
    30 * 24 * 60 * 60 // 30 days
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5002
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/delivery").required(false))
            .add_source(config::File::with_name("/etc/facefind/delivery").required(false))
            // Override with environment variables
            // DELIVERY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("DELIVERY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("matching.engine_args")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.mail.smtp_host.is_empty() {
            return Err(ConfigValidationError::MissingField("mail.smtp_host".to_string()));
        }

        if !self.mail.from_address.contains('@') {
            return Err(ConfigValidationError::InvalidValue {
                field: "mail.from_address".to_string(),
                message: "must be an email address".to_string(),
            });
        }

        if self.matching.engine_program.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "matching.engine_program".to_string(),
            ));
        }

        if self.matching.matched_prefix.is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "matching.matched_prefix".to_string(),
                message: "prefix must not be empty".to_string(),
            });
        }

        if self.workers.max_concurrent_jobs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "workers.max_concurrent_jobs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        let intervals = [
            ("retention.archive_retention_secs", self.retention.archive_retention_secs),
            ("retention.sweep_interval_secs", self.retention.sweep_interval_secs),
            ("retention.reaper_interval_secs", self.retention.reaper_interval_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl MatchingConfig {
    /// Engine timeout, `None` when disabled
    pub fn engine_timeout(&self) -> Option<Duration> {
        (self.engine_timeout_secs > 0).then(|| Duration::from_secs(self.engine_timeout_secs))
    }

    pub fn packaging_delay(&self) -> Duration {
        Duration::from_millis(self.packaging_delay_ms)
    }
}

impl RetentionConfig {
    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            recover_on_startup: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archive_retention_secs: default_archive_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            staging_max_age_secs: default_staging_max_age_secs(),
            output_max_age_secs: default_output_max_age_secs(),
            gallery_max_age_secs: default_gallery_max_age_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        let raw = serde_json::json!({
            "database": { "url": "postgres://localhost/facefind" },
            "mail": { "smtp_host": "smtp.example.com", "from_address": "noreply@example.com" },
            "matching": { "engine_program": "/usr/local/bin/match-faces" }
        });
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = create_test_config();
        assert_eq!(config.retention.archive_retention_secs, 3600);
        assert_eq!(config.retention.sweep_interval_secs, 3600);
        assert_eq!(config.matching.matched_prefix, "clean_");
        assert_eq!(config.matching.output_binding, OutputBinding::RequestScoped);
        assert_eq!(config.storage.bucket, "matched-results");
        assert_eq!(config.api.port, 5002);
        assert_eq!(config.matching.engine_args.len(), 3);
    }

    #[test]
    fn test_database_timeouts() {
        let config = create_test_config();
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_missing_engine_program() {
        let mut config = create_test_config();
        config.matching.engine_program.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::MissingField(
                "matching.engine_program".to_string()
            ))
        );
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = create_test_config();
        config.retention.sweep_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "retention.sweep_interval_secs"
        ));
    }

    #[test]
    fn test_engine_timeout_disabled_at_zero() {
        let mut config = create_test_config();
        assert_eq!(config.matching.engine_timeout(), Some(Duration::from_secs(600)));
        config.matching.engine_timeout_secs = 0;
        assert_eq!(config.matching.engine_timeout(), None);
    }

    #[test]
    fn test_output_binding_parsing() {
        let binding: OutputBinding = serde_json::from_str("\"shared_latest_pending\"").unwrap();
        assert_eq!(binding, OutputBinding::SharedLatestPending);
    }
}
