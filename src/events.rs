//! Run notifications consumed by UI or CLI collaborators.
//!
//! Events are fanned out over a bounded `tokio::sync::broadcast` channel.
//! Publishing never blocks; a subscriber that falls behind skips the oldest
//! events it missed.

use std::path::PathBuf;

use futures::StreamExt;
use futures::stream::BoxStream;
use log::trace;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ErrorKind;
use crate::model::{DeviceResult, Outcome, RunSummary};
use crate::session::SessionState;

/// Coarse status reported to external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Connecting,
    Success,
    Failed,
}

impl From<SessionState> for ProgressStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Success => ProgressStatus::Success,
            SessionState::Failed => ProgressStatus::Failed,
            _ => ProgressStatus::Connecting,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub device: String,
    pub display_name: String,
    pub status: ProgressStatus,
    pub phase: SessionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogEvent {
    pub device: String,
    pub display_name: String,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResultEvent {
    pub device: String,
    pub display_name: String,
    pub success: bool,
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub log_path: Option<PathBuf>,
    pub duration_ms: u64,
}

impl From<&DeviceResult> for ResultEvent {
    fn from(result: &DeviceResult) -> Self {
        Self {
            device: result.device.address.clone(),
            display_name: result.device.name().to_string(),
            success: result.is_success(),
            outcome: result.outcome,
            error_kind: result.error_kind,
            error: result.error_detail.clone(),
            log_path: result.log_path.clone(),
            duration_ms: result.duration_ms,
        }
    }
}

/// Notification emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress(ProgressEvent),
    Log(LogEvent),
    Result(ResultEvent),
    Completed(RunSummary),
    /// Run-level configuration failure. Per-device failures travel as `Result`.
    Error { message: String },
}

/// Broadcast publisher for [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<RunEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to current subscribers. Events without subscribers are dropped.
    pub fn publish(&self, event: RunEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.sender.send(event);
    }

    /// Raw receiver; surfaces `Lagged` on overflow.
    pub fn receiver(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Stream of events from now on, skipping whatever was lost to overflow.
    pub fn subscribe(&self) -> BoxStream<'static, RunEvent> {
        BroadcastStream::new(self.receiver())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RunEvent::Log(LogEvent {
            device: "10.0.0.1".to_string(),
            display_name: "r1".to_string(),
            line: "R1#show version".to_string(),
        });
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json["type"], "log");
        assert_eq!(json["line"], "R1#show version");
    }

    #[test]
    fn intermediate_phases_report_connecting() {
        assert_eq!(
            ProgressStatus::from(SessionState::Escalating),
            ProgressStatus::Connecting
        );
        assert_eq!(
            ProgressStatus::from(SessionState::Success),
            ProgressStatus::Success
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_oldest_events() {
        let publisher = EventPublisher::new(2);
        let mut stream = publisher.subscribe();
        for i in 0..5 {
            publisher.publish(RunEvent::Error {
                message: format!("e{i}"),
            });
        }
        drop(publisher);

        let mut seen = Vec::new();
        while let Some(RunEvent::Error { message }) = stream.next().await {
            seen.push(message);
        }
        assert_eq!(seen, vec!["e3".to_string(), "e4".to_string()]);
    }
}
