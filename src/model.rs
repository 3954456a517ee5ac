//! Shared data model of a batch run.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_SSH_PORT;
use crate::error::{ConfigError, ErrorKind, SessionError};

/// Identifier of one execution run.
pub type RunId = Uuid;

/// Per-device login override.
#[derive(Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub enable_password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("enable_password", &"<redacted>")
            .finish()
    }
}

/// A network element targeted by a run.
///
/// `address` is the identity key and may carry a port (`host:port`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing)]
    pub credentials: Option<Credentials>,
}

impl Device {
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        let address = address.into().trim().to_string();
        let mut display_name = display_name.into().trim().to_string();
        if display_name.is_empty() {
            display_name = address.clone();
        }
        Self {
            address,
            display_name,
            credentials: None,
        }
    }

    /// Attaches credentials used instead of the run-wide ones.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Name used for display and log file naming.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.address
        } else {
            &self.display_name
        }
    }

    /// Splits `address` into host and port.
    ///
    /// Bracketed IPv6 (`[::1]:22`) and bare IPv6 without a port are both
    /// accepted.
    pub fn host_port(&self) -> (String, u16) {
        let addr = self.address.as_str();
        if let Some(rest) = addr.strip_prefix('[')
            && let Some((host, tail)) = rest.split_once(']')
        {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SSH_PORT);
            return (host.to_string(), port);
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (addr.to_string(), DEFAULT_SSH_PORT),
            },
            _ => (addr.to_string(), DEFAULT_SSH_PORT),
        }
    }
}

/// Normalizes a raw command list: trims entries and drops blank ones.
pub fn normalize_commands<I, S>(commands: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    commands
        .into_iter()
        .map(|c| c.as_ref().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Read-only command sequence shared by all sessions of a run.
pub type CommandScript = Arc<[String]>;

/// Options fixed for the lifetime of a run.
#[derive(Clone)]
pub struct ExecutionOptions {
    pub username: String,
    pub password: String,
    /// Bound on each command's response wait.
    pub command_timeout: Duration,
    pub enable_privilege: bool,
    pub enable_password: String,
    pub suppress_paging: bool,
    pub concurrency_limit: usize,
}

impl ExecutionOptions {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            command_timeout: Duration::from_secs(crate::config::DEFAULT_COMMAND_TIMEOUT_SECS),
            enable_privilege: false,
            enable_password: String::new(),
            suppress_paging: true,
            concurrency_limit: crate::config::DEFAULT_CONCURRENCY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Effective credentials for `device`, honouring per-device overrides.
    pub fn credentials_for(&self, device: &Device) -> Credentials {
        match &device.credentials {
            Some(c) if !c.username.is_empty() && !c.password.is_empty() => c.clone(),
            _ => Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
                enable_password: self.enable_password.clone(),
            },
        }
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("command_timeout", &self.command_timeout)
            .field("enable_privilege", &self.enable_privilege)
            .field("enable_password", &"<redacted>")
            .field("suppress_paging", &self.suppress_paging)
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

/// Validates a device list: non-empty, every address set and unique.
pub fn validate_devices(devices: &[Device]) -> Result<(), ConfigError> {
    if devices.is_empty() {
        return Err(ConfigError::NoDevices);
    }
    let mut seen = HashSet::with_capacity(devices.len());
    for device in devices {
        if device.address.is_empty() {
            return Err(ConfigError::EmptyAddress(device.display_name.clone()));
        }
        if !seen.insert(device.address.as_str()) {
            return Err(ConfigError::DuplicateAddress(device.address.clone()));
        }
    }
    Ok(())
}

/// Lifecycle of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Cancelling,
    Completed,
}

impl RunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Cancelling)
    }
}

/// Terminal outcome of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Cancelled,
}

/// Final record of one device within a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceResult {
    pub device: Device,
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    /// Absent only when the device was never dispatched.
    pub log_path: Option<PathBuf>,
    pub duration_ms: u64,
}

impl DeviceResult {
    pub fn success(device: Device, log_path: PathBuf, duration: Duration) -> Self {
        Self {
            device,
            outcome: Outcome::Success,
            error_kind: None,
            error_detail: None,
            log_path: Some(log_path),
            duration_ms: duration_ms(duration),
        }
    }

    pub fn from_error(
        device: Device,
        err: &SessionError,
        log_path: Option<PathBuf>,
        duration: Duration,
    ) -> Self {
        let kind = err.kind();
        let outcome = if kind == ErrorKind::Cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Failed
        };
        Self {
            device,
            outcome,
            error_kind: Some(kind),
            error_detail: Some(err.to_string()),
            log_path,
            duration_ms: duration_ms(duration),
        }
    }

    /// Result for a device that was never dispatched.
    pub fn not_dispatched(device: Device) -> Self {
        Self::from_error(device, &SessionError::Cancelled, None, Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One line of device output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct LogLine {
    /// Address of the producing device.
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Aggregate counts of a completed run.
///
/// `fail_count` includes cancelled devices; `cancelled_count` reports them
/// separately.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub success_count: usize,
    pub fail_count: usize,
    pub cancelled_count: usize,
    pub total: usize,
    pub log_dir: PathBuf,
}

impl RunSummary {
    pub fn from_results(run_id: RunId, results: &[DeviceResult], log_dir: PathBuf) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let cancelled_count = results
            .iter()
            .filter(|r| r.outcome == Outcome::Cancelled)
            .count();
        Self {
            run_id,
            success_count,
            fail_count: results.len() - success_count,
            cancelled_count,
            total: results.len(),
            log_dir,
        }
    }
}

/// Point-in-time copy of a run.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct RunSnapshot {
    pub id: RunId,
    pub devices: Vec<Device>,
    pub commands: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<DeviceResult>,
    pub completed_count: usize,
    pub log_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parses_common_forms() {
        assert_eq!(
            Device::new("10.0.0.1", "").host_port(),
            ("10.0.0.1".to_string(), 22)
        );
        assert_eq!(
            Device::new("sw1.lab:2222", "").host_port(),
            ("sw1.lab".to_string(), 2222)
        );
        assert_eq!(
            Device::new("[fe80::1]:830", "").host_port(),
            ("fe80::1".to_string(), 830)
        );
        assert_eq!(
            Device::new("fe80::1", "").host_port(),
            ("fe80::1".to_string(), 22)
        );
    }

    #[test]
    fn empty_display_name_falls_back_to_address() {
        let device = Device::new(" 10.0.0.9 ", "  ");
        assert_eq!(device.address, "10.0.0.9");
        assert_eq!(device.name(), "10.0.0.9");
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let devices = vec![Device::new("10.0.0.1", "a"), Device::new("10.0.0.1", "b")];
        assert_eq!(
            validate_devices(&devices),
            Err(ConfigError::DuplicateAddress("10.0.0.1".to_string()))
        );
        assert_eq!(validate_devices(&[]), Err(ConfigError::NoDevices));
    }

    #[test]
    fn options_validation_rejects_missing_fields() {
        let mut options = ExecutionOptions::new("admin", "");
        assert_eq!(options.validate(), Err(ConfigError::MissingCredentials));

        options.password = "pw".to_string();
        options.concurrency_limit = 0;
        assert_eq!(options.validate(), Err(ConfigError::InvalidConcurrency));

        options.concurrency_limit = 2;
        options.command_timeout = Duration::ZERO;
        assert_eq!(options.validate(), Err(ConfigError::InvalidTimeout));
    }

    #[test]
    fn per_device_credentials_override_run_credentials() {
        let options = ExecutionOptions::new("admin", "pw");
        let plain = Device::new("10.0.0.1", "a");
        let custom = Device::new("10.0.0.2", "b").with_credentials(Credentials {
            username: "ops".to_string(),
            password: "other".to_string(),
            enable_password: "en".to_string(),
        });

        assert_eq!(options.credentials_for(&plain).username, "admin");
        assert_eq!(options.credentials_for(&custom).username, "ops");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let options = ExecutionOptions::new("admin", "hunter2");
        assert!(!format!("{options:?}").contains("hunter2"));
    }

    #[test]
    fn summary_folds_cancelled_into_fail_count() {
        let results = vec![
            DeviceResult::success(
                Device::new("10.0.0.1", "a"),
                PathBuf::from("a.log"),
                Duration::from_millis(5),
            ),
            DeviceResult::not_dispatched(Device::new("10.0.0.2", "b")),
        ];
        let summary = RunSummary::from_results(Uuid::nil(), &results, PathBuf::from("logs"));
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.fail_count, 1);
        assert_eq!(summary.cancelled_count, 1);
        assert_eq!(summary.success_count + summary.fail_count, summary.total);
    }

    #[test]
    fn normalize_commands_drops_blank_lines() {
        assert_eq!(
            normalize_commands(["  show version ", "", "   ", "show clock"]),
            vec!["show version".to_string(), "show clock".to_string()]
        );
    }
}
