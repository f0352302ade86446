use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

use crate::audit::row::HashAlgorithm;
use crate::error::ProtectedLogError;

/// Runtime configuration for the protected log subsystem.
///
/// All values are runtime-reloadable through `LogAppender::reset`, not CLI
/// flags. Defaults match the shipped configuration of the log device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedLogConfig {
    pub database_url: String,
    pub node_ip: String,
    pub hash_algorithm: HashAlgorithm,
    /// Minimum milliseconds between individually signed rows. 0 = sign every row.
    pub protection_intensity_ms: i64,
    /// Minimum milliseconds between scans for other nodes' newest rows.
    pub link_in_intensity_ms: i64,
    /// Minimum milliseconds between re-reads of this node's own tail.
    pub verify_own_intensity_ms: i64,
    /// How far back cross-node scans and the chain cache reach.
    pub search_window_ms: i64,
    /// A node whose newest row is older than this is considered frozen.
    pub freeze_threshold_ms: i64,
    /// Upper bound on rows examined by a full verification pass. 0 = unbounded.
    pub max_verification_steps: u64,
    pub export_older_than_ms: i64,
    pub delete_after_export: bool,
    /// Directory export batches are written to.
    pub export_directory: String,
    /// Optional command executed on detected anomalies, in addition to logging.
    pub anomaly_script: Option<String>,
    pub allow_configurable_events: bool,
    /// Seconds between scheduled verification runs in the service binary.
    pub verification_interval_secs: u64,
    /// Seconds between scheduled export runs in the service binary.
    pub export_interval_secs: u64,
}

impl ProtectedLogConfig {
    pub fn load() -> Result<Self, ProtectedLogError> {
        let database_url = env::var("PROTECTEDLOG_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://protectedlog.db".to_string());

        let node_ip =
            env::var("PROTECTEDLOG_NODE_IP").unwrap_or_else(|_| "127.0.0.1".to_string());

        let hash_algorithm = env::var("PROTECTEDLOG_HASH_ALGORITHM")
            .unwrap_or_else(|_| "SHA-256".to_string())
            .parse()?;

        let protection_intensity_ms = parse_env_i64("PROTECTEDLOG_PROTECTION_INTENSITY_MS", 0)?;
        let link_in_intensity_ms = parse_env_i64("PROTECTEDLOG_LINKIN_INTENSITY_MS", 1_000)?;
        let verify_own_intensity_ms = parse_env_i64("PROTECTEDLOG_VERIFYOWN_INTENSITY_MS", 1_000)?;
        let search_window_ms = parse_env_i64("PROTECTEDLOG_SEARCH_WINDOW_MS", 300_000)?;
        let freeze_threshold_ms = parse_env_i64("PROTECTEDLOG_FREEZE_THRESHOLD_MS", 3_600_000)?;
        let max_verification_steps =
            parse_env_i64("PROTECTEDLOG_MAX_VERIFICATION_STEPS", 0)? as u64;
        let export_older_than_ms = parse_env_i64("PROTECTEDLOG_EXPORT_OLDER_THAN_MS", 0)?;

        let delete_after_export = parse_env_bool("PROTECTEDLOG_DELETE_AFTER_EXPORT", false);
        let export_directory = env::var("PROTECTEDLOG_EXPORT_DIR")
            .unwrap_or_else(|_| "protectedlog-export".to_string());
        let anomaly_script = env::var("PROTECTEDLOG_ANOMALY_SCRIPT").ok();
        let allow_configurable_events =
            parse_env_bool("PROTECTEDLOG_ALLOW_CONFIGURABLE_EVENTS", false);

        let verification_interval_secs =
            parse_env_i64("PROTECTEDLOG_VERIFICATION_INTERVAL_SECS", 3_600)? as u64;
        let export_interval_secs =
            parse_env_i64("PROTECTEDLOG_EXPORT_INTERVAL_SECS", 3_600)? as u64;

        let config = ProtectedLogConfig {
            database_url,
            node_ip,
            hash_algorithm,
            protection_intensity_ms,
            link_in_intensity_ms,
            verify_own_intensity_ms,
            search_window_ms,
            freeze_threshold_ms,
            max_verification_steps,
            export_older_than_ms,
            delete_after_export,
            export_directory,
            anomaly_script,
            allow_configurable_events,
            verification_interval_secs,
            export_interval_secs,
        };
        config.warn_on_unsafe_combinations();
        Ok(config)
    }

    /// Deleting exported rows while not every row is signed leaves unsigned
    /// rows whose nearest signed ancestor may have been pruned.
    pub fn warn_on_unsafe_combinations(&self) {
        if self.protection_intensity_ms != 0 && self.delete_after_export {
            warn!(
                "delete_after_export is enabled together with a non-zero \
                 protection intensity ({} ms); exported-and-deleted rows may \
                 leave later unsigned rows without a verifiable signed ancestor",
                self.protection_intensity_ms
            );
        }
    }
}

impl Default for ProtectedLogConfig {
    fn default() -> Self {
        ProtectedLogConfig {
            database_url: "sqlite://protectedlog.db".to_string(),
            node_ip: "127.0.0.1".to_string(),
            hash_algorithm: HashAlgorithm::Sha256,
            protection_intensity_ms: 0,
            link_in_intensity_ms: 1_000,
            verify_own_intensity_ms: 1_000,
            search_window_ms: 300_000,
            freeze_threshold_ms: 3_600_000,
            max_verification_steps: 0,
            export_older_than_ms: 0,
            delete_after_export: false,
            export_directory: "protectedlog-export".to_string(),
            anomaly_script: None,
            allow_configurable_events: false,
            verification_interval_secs: 3_600,
            export_interval_secs: 3_600,
        }
    }
}

fn parse_env_i64(key: &str, default: i64) -> Result<i64, ProtectedLogError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| ProtectedLogError::ConfigError(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
