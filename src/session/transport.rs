use async_trait::async_trait;

use crate::error::SessionError;
use crate::model::Device;

/// Opens transports to devices.
///
/// The session state machine bounds `connect` with the dial timeout and races
/// it against cancellation, so implementations only need to be cancel safe.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Transport>, SessionError>;
}

/// An established connection to one device's interactive shell.
#[async_trait]
pub trait Transport: Send {
    /// Password authentication.
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError>;

    /// Opens the interactive shell (PTY plus shell request).
    async fn open_shell(&mut self) -> Result<(), SessionError>;

    /// Writes raw text to the shell.
    async fn send(&mut self, data: &str) -> Result<(), SessionError>;

    /// Next chunk of shell output. `None` once the remote side has closed.
    ///
    /// Must be cancel safe: dropping the future must not lose output.
    async fn recv(&mut self) -> Option<String>;

    /// Tears the connection down. Idempotent.
    async fn close(&mut self);
}
