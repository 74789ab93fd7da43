use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum assembled file size in bytes (default: 50 MB)
    pub max_file_size: usize,

    /// Maximum size of a single upload chunk in bytes (default: 10 MB)
    pub max_chunk_size: usize,

    /// Lifetime of a chunked upload session (default: 1 hour)
    pub chunk_session_ttl_secs: u64,

    /// How many leading bytes the dangerous-content scan inspects (default: 1 MB)
    pub content_scan_limit: usize,

    /// Deepest allowed formula nesting (default: 10)
    pub max_formula_depth: usize,

    /// Enable malware scanning (default: true)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "clamav")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// Malware scan timeout (default: 30 s)
    pub scan_timeout_secs: u64,

    /// Encryption/decryption timeout (default: 30 s)
    pub encryption_timeout_secs: u64,

    /// Maximum concurrently active parse jobs (default: 3)
    pub worker_concurrency: usize,

    /// Attempts per job including the first one (default: 3)
    pub job_max_attempts: u32,

    /// Base delay of the exponential retry backoff (default: 1000 ms)
    pub job_retry_base_delay_ms: u64,

    /// Seconds without progress before an active job is reported stalled (default: 120)
    pub job_stall_threshold_secs: u64,

    /// Row budget across all parsed sheets (default: 100000)
    pub parse_max_rows: usize,

    /// Maximum number of sheets parsed (default: 50)
    pub parse_max_sheets: usize,

    /// Extract embedded images (default: true)
    pub parse_extract_images: bool,

    /// Keep number formats on date cells (default: true)
    pub parse_preserve_formatting: bool,

    /// Lifetime of a cached parsed workbook (default: 1 hour)
    pub cache_ttl_secs: u64,

    /// Upper bound for requested page sizes (default: 1000)
    pub max_page_size: usize,

    /// Active master key id used for new files (default: "mk-1")
    pub master_key_id: String,

    /// Retired master key ids still accepted for decryption
    pub retired_key_ids: Vec<String>,

    /// Seconds between background maintenance runs (default: 300)
    pub maintenance_interval_secs: u64,

    /// How long soft-deleted files keep their ciphertext (default: 7 days)
    pub deleted_file_retention_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024, // 50 MB
            max_chunk_size: 10 * 1024 * 1024, // 10 MB
            chunk_session_ttl_secs: 3600,
            content_scan_limit: 1024 * 1024, // 1 MB
            max_formula_depth: 10,
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            scan_timeout_secs: 30,
            encryption_timeout_secs: 30,
            worker_concurrency: 3,
            job_max_attempts: 3,
            job_retry_base_delay_ms: 1000,
            job_stall_threshold_secs: 120,
            parse_max_rows: 100_000,
            parse_max_sheets: 50,
            parse_extract_images: true,
            parse_preserve_formatting: true,
            cache_ttl_secs: 3600,
            max_page_size: 1000,
            master_key_id: "mk-1".to_string(),
            retired_key_ids: Vec::new(),
            maintenance_interval_secs: 300,
            deleted_file_retention_secs: 7 * 24 * 3600,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env_or("MAX_FILE_SIZE", default.max_file_size),
            max_chunk_size: env_or("MAX_CHUNK_SIZE", default.max_chunk_size),
            chunk_session_ttl_secs: env_or(
                "CHUNK_SESSION_TTL_SECS",
                default.chunk_session_ttl_secs,
            ),
            content_scan_limit: env_or("CONTENT_SCAN_LIMIT", default.content_scan_limit),
            max_formula_depth: env_or("MAX_FORMULA_DEPTH", default.max_formula_depth),
            enable_virus_scan: env_flag("ENABLE_VIRUS_SCAN", default.enable_virus_scan),
            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),
            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),
            clamav_port: env_or("CLAMAV_PORT", default.clamav_port),
            scan_timeout_secs: env_or("SCAN_TIMEOUT_SECS", default.scan_timeout_secs),
            encryption_timeout_secs: env_or(
                "ENCRYPTION_TIMEOUT_SECS",
                default.encryption_timeout_secs,
            ),
            worker_concurrency: env_or("WORKER_CONCURRENCY", default.worker_concurrency).max(1),
            job_max_attempts: env_or("JOB_MAX_ATTEMPTS", default.job_max_attempts).max(1),
            job_retry_base_delay_ms: env_or(
                "JOB_RETRY_BASE_DELAY_MS",
                default.job_retry_base_delay_ms,
            ),
            job_stall_threshold_secs: env_or(
                "JOB_STALL_THRESHOLD_SECS",
                default.job_stall_threshold_secs,
            ),
            parse_max_rows: env_or("PARSE_MAX_ROWS", default.parse_max_rows),
            parse_max_sheets: env_or("PARSE_MAX_SHEETS", default.parse_max_sheets),
            parse_extract_images: env_flag("PARSE_EXTRACT_IMAGES", default.parse_extract_images),
            parse_preserve_formatting: env_flag(
                "PARSE_PRESERVE_FORMATTING",
                default.parse_preserve_formatting,
            ),
            cache_ttl_secs: env_or("CACHE_TTL_SECS", default.cache_ttl_secs),
            max_page_size: env_or("MAX_PAGE_SIZE", default.max_page_size).max(1),
            master_key_id: env::var("MASTER_KEY_ID").unwrap_or(default.master_key_id),
            retired_key_ids: env::var("MASTER_KEY_RETIRED_IDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(default.retired_key_ids),
            maintenance_interval_secs: env_or(
                "MAINTENANCE_INTERVAL_SECS",
                default.maintenance_interval_secs,
            )
            .max(1),
            deleted_file_retention_secs: env_or(
                "DELETED_FILE_RETENTION_SECS",
                default.deleted_file_retention_secs,
            ),
        }
    }

    /// Create config for development (no virus scanning)
    pub fn development() -> Self {
        Self {
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            ..Self::default()
        }
    }

    /// Create config for production (strict security)
    pub fn production() -> Self {
        Self {
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: env::var("CLAMAV_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            clamav_port: env_or("CLAMAV_PORT", 3310),
            ..Self::default()
        }
    }

    pub fn chunk_session_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_session_ttl_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn encryption_timeout(&self) -> Duration {
        Duration::from_secs(self.encryption_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.job_retry_base_delay_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.job_stall_threshold_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn deleted_file_retention(&self) -> Duration {
        Duration::from_secs(self.deleted_file_retention_secs)
    }
}
