//! JSON results report written next to the device logs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::model::{DeviceResult, RunId, RunSummary};

/// File name of the report inside the run log directory.
pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    /// In completion order.
    pub results: Vec<DeviceResult>,
}

impl RunReport {
    /// Writes the report as pretty JSON to `<dir>/results.json`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, RunError> {
        let path = dir.join(RESULTS_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn read_from(path: impl AsRef<Path>) -> Result<Self, RunError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// JSON schema of the report format, pretty printed.
    pub fn schema_json() -> Result<String, RunError> {
        let schema = schemars::schema_for!(RunReport);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::model::Device;

    #[tokio::test]
    async fn report_survives_a_write_and_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let results = vec![DeviceResult::success(
            Device::new("10.0.0.1", "r1"),
            dir.path().join("r1.log"),
            Duration::from_millis(12),
        )];
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            summary: RunSummary::from_results(Uuid::nil(), &results, dir.path().to_path_buf()),
            results,
        };

        let path = report.write_to(dir.path()).await.expect("write");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(RESULTS_FILE));

        let loaded = RunReport::read_from(&path).await.expect("read");
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.results[0].duration_ms, 12);
        assert_eq!(loaded.summary.success_count, 1);
    }

    #[test]
    fn schema_lists_results() {
        let schema = RunReport::schema_json().expect("schema");
        assert!(schema.contains("results"));
    }
}
