//! Defaults, SSH algorithm tables and job-file configuration.
//!
//! The algorithm lists come in two flavours. The `SECURE_*` lists only carry
//! modern primitives. The `LEGACY_*` lists add the SHA-1 and CBC variants still
//! spoken by older switch firmware, which is the usual target of a batch run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::device::PromptProfile;
use crate::error::ConfigError;
use crate::model::{Device, ExecutionOptions};

/// SSH port used when a device address carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Upper bound for TCP connect plus SSH handshake, and for authentication.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-command response timeout used by job files that omit one.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Concurrent sessions used by job files that omit a limit.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Root directory for run log directories.
pub const DEFAULT_LOG_ROOT: &str = "logs";

/// Capacity of the run event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Capacity of the live log-line broadcast.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Timeout for best-effort housekeeping commands sent while finalizing.
pub const FINALIZE_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// SSH inactivity timeout applied to every connection.
pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Modern key exchange algorithms.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

/// Key exchange algorithms including SHA-1 groups for old IOS images.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_GEX_SHA1,
    kex::DH_G1_SHA1,
];

pub static SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub static LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// Settings shared by every run a coordinator starts.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory under which `<date>/<run-id>` log directories are created.
    pub log_root: PathBuf,
    /// Bound for connect and authentication.
    pub dial_timeout: Duration,
    /// Run event broadcast capacity.
    pub event_capacity: usize,
    /// Live log-line broadcast capacity.
    pub log_capacity: usize,
    /// Prompt patterns and housekeeping commands of the device family.
    pub profile: PromptProfile,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from(DEFAULT_LOG_ROOT),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            profile: PromptProfile::cisco_ios(),
        }
    }
}

impl CoordinatorConfig {
    /// Default settings with a custom log root.
    pub fn with_log_root(log_root: impl Into<PathBuf>) -> Self {
        Self {
            log_root: log_root.into(),
            ..Self::default()
        }
    }
}

/// Options section of a job file.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JobOptions {
    pub username: String,
    pub password: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub enable_privilege: bool,
    #[serde(default)]
    pub enable_password: String,
    #[serde(default = "default_true")]
    pub suppress_paging: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl From<JobOptions> for ExecutionOptions {
    fn from(job: JobOptions) -> Self {
        ExecutionOptions {
            username: job.username,
            password: job.password,
            command_timeout: Duration::from_secs(job.command_timeout_secs),
            enable_privilege: job.enable_privilege,
            enable_password: job.enable_password,
            suppress_paging: job.suppress_paging,
            concurrency_limit: job.concurrency_limit,
        }
    }
}

/// A complete batch description loaded from JSON.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BatchJob {
    pub devices: Vec<Device>,
    pub commands: Vec<String>,
    pub options: JobOptions,
}

impl BatchJob {
    /// Parses a job from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidJob(e.to_string()))
    }

    /// Reads and parses a job file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::InvalidJob(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// JSON schema of the job file format, pretty printed.
    pub fn schema_json() -> Result<String, ConfigError> {
        let schema = schemars::schema_for!(BatchJob);
        serde_json::to_string_pretty(&schema)
            .map_err(|e| ConfigError::InvalidJob(format!("encode schema: {e}")))
    }

    /// Splits the job into coordinator inputs.
    pub fn into_parts(self) -> (Vec<Device>, Vec<String>, ExecutionOptions) {
        (self.devices, self.commands, self.options.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"{
        "devices": [
            {"address": "10.0.0.1", "display_name": "core-1"},
            {"address": "10.0.0.2:2222", "display_name": ""}
        ],
        "commands": ["show version", "show ip int brief"],
        "options": {"username": "admin", "password": "pw", "enable_privilege": true}
    }"#;

    #[test]
    fn job_file_applies_defaults() {
        let job = BatchJob::from_json_str(JOB).expect("parse job");
        let (devices, commands, options) = job.into_parts();

        assert_eq!(devices.len(), 2);
        assert_eq!(commands.len(), 2);
        assert_eq!(options.command_timeout, Duration::from_secs(60));
        assert_eq!(options.concurrency_limit, DEFAULT_CONCURRENCY);
        assert!(options.suppress_paging);
        assert!(options.enable_privilege);
        assert!(options.enable_password.is_empty());
    }

    #[test]
    fn malformed_job_is_a_config_error() {
        let err = BatchJob::from_json_str("{\"devices\": []}").expect_err("missing fields");
        assert!(matches!(err, ConfigError::InvalidJob(_)));
    }

    #[test]
    fn job_schema_is_valid_json() {
        let schema = BatchJob::schema_json().expect("schema");
        let value: serde_json::Value = serde_json::from_str(&schema).expect("json");
        assert!(value.get("properties").is_some());
    }

    #[test]
    fn secure_tables_exclude_sha1() {
        assert!(!SECURE_KEX_ORDER.contains(&kex::DH_G1_SHA1));
        assert!(!SECURE_MAC_ALGORITHMS.contains(&mac::HMAC_SHA1));
        assert!(LEGACY_KEX_ORDER.contains(&kex::DH_G1_SHA1));
        assert!(LEGACY_CIPHERS.contains(&cipher::AES_128_CBC));
    }
}
