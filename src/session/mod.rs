//! Device sessions: the per-device state machine and the transports it drives.
//!
//! A session walks one device through a fixed sequence of phases:
//!
//! ```text
//! Pending -> Connecting -> Authenticating -> [Escalating] -> [SuppressingPaging]
//!         -> Executing(1..=N) -> Finalizing -> Success | Failed
//! ```
//!
//! # Main Components
//!
//! - [`DeviceSession`] - Runs the phases for one device and yields its result
//! - [`Connector`] / [`Transport`] - Seam between the state machine and the wire
//! - [`SshConnector`] - russh-backed transport used in production
//! - [`ReplayConnector`] - Scripted in-memory device shells
//! - [`CancelToken`] - Run-wide cancellation signal observed at every wait

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

mod machine;
mod replay;
mod security;
mod shell;
mod ssh;
mod transport;

pub use machine::{DeviceSession, SessionPlan};
pub use replay::{ReplayConnector, ReplayDevice, ReplayResponse};
pub use security::{ConnectionSecurityOptions, HostKeyPolicy, SecurityLevel};
pub use ssh::SshConnector;
pub use transport::{Connector, Transport};

/// Phase of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Connecting,
    Authenticating,
    Escalating,
    SuppressingPaging,
    /// Running the script; `command` is 1-based.
    Executing { command: usize },
    Finalizing,
    Success,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Success | SessionState::Failed)
    }
}

/// Cancellation signal shared by every session of a run.
///
/// Cancelling is sticky: once set it stays set, and every clone observes it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone: nothing can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
