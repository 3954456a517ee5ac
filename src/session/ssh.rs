use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace, warn};
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpStream;

use super::security::{ConnectionSecurityOptions, HostKeyPolicy};
use super::transport::{Connector, Transport};
use crate::config;
use crate::error::SessionError;
use crate::model::Device;

/// Connector that opens SSH shells with russh.
pub struct SshConnector {
    security: ConnectionSecurityOptions,
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        let config = client::Config {
            preferred: security.preferred(),
            inactivity_timeout: Some(config::SSH_INACTIVITY_TIMEOUT),
            ..Default::default()
        };
        Self {
            security,
            config: Arc::new(config),
        }
    }

    pub fn security(&self) -> &ConnectionSecurityOptions {
        &self.security
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(ConnectionSecurityOptions::default())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Transport>, SessionError> {
        let (host, port) = device.host_port();
        let addr = format!("{host}:{port}");

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SessionError::Connect(format!("{addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        debug!("{} TCP connection successful", addr);

        let handler = HostKeyCheck {
            host,
            port,
            policy: self.security.host_key,
        };
        let handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| SessionError::Connect(format!("{addr}: ssh handshake failed: {e}")))?;
        debug!("{} SSH handshake successful", addr);

        Ok(Box::new(SshTransport {
            addr,
            handle,
            channel: None,
            pending: Vec::new(),
        }))
    }
}

struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(known) => {
                        if !known {
                            warn!("{}:{} host key not in known_hosts", self.host, self.port);
                        }
                        Ok(known)
                    }
                    Err(e) => {
                        warn!("{}:{} host key check failed: {}", self.host, self.port, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

struct SshTransport {
    addr: String,
    handle: Handle<HostKeyCheck>,
    channel: Option<Channel<client::Msg>>,
    /// Bytes of a UTF-8 sequence split across two data messages.
    pending: Vec<u8>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        let result = self
            .handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SessionError::Auth(e.to_string()))?;
        if result.success() {
            debug!("{} authenticated as {}", self.addr, username);
            Ok(())
        } else {
            Err(SessionError::Auth(format!(
                "credentials for '{username}' rejected"
            )))
        }
    }

    async fn open_shell(&mut self) -> Result<(), SessionError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Auth(format!("session channel refused: {e}")))?;
        channel
            .request_pty(false, "vt100", 200, 24, 0, 0, &[])
            .await
            .map_err(|e| SessionError::Auth(format!("pty request refused: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SessionError::Auth(format!("shell request refused: {e}")))?;
        debug!("{} Shell request successful", self.addr);
        self.channel = Some(channel);
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        let channel = self.channel.as_ref().ok_or(SessionError::ChannelClosed)?;
        channel.data(data.as_bytes()).await.map_err(|e| {
            debug!("{} Failed to send data to shell: {:?}", self.addr, e);
            SessionError::ChannelClosed
        })
    }

    async fn recv(&mut self) -> Option<String> {
        let channel = self.channel.as_mut()?;
        loop {
            match channel.wait().await? {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    self.pending.extend_from_slice(data);
                    let text = take_utf8(&mut self.pending);
                    if !text.is_empty() {
                        trace!("{} {:?}", self.addr, text);
                        return Some(text);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!("{} Shell exited with status code: {}", self.addr, exit_status);
                    return None;
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    debug!("{} Shell sent EOF.", self.addr);
                    return None;
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.eof().await;
            let _ = channel.close().await;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            trace!("{} disconnect: {}", self.addr, e);
        }
        debug!("{} SSH connection closed", self.addr);
    }
}

/// Decodes the valid UTF-8 prefix of `pending`, keeping an incomplete trailing
/// sequence for the next chunk. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn dropped_handshake_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let device = Device::new(addr.to_string(), "dead");
        let err = SshConnector::default()
            .connect(&device)
            .await
            .err()
            .expect("handshake should fail");
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert!(err.to_string().contains("ssh handshake failed"), "{err}");
    }

    #[test]
    fn split_multibyte_sequence_waits_for_next_chunk() {
        let bytes = "Température".as_bytes();
        let split = bytes.iter().position(|b| *b >= 0x80).expect("multibyte") + 1;

        let mut pending = bytes[..split].to_vec();
        assert_eq!(take_utf8(&mut pending), "Temp");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[split..]);
        assert_eq!(take_utf8(&mut pending), "érature");
        assert!(pending.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut pending = vec![b'o', b'k', 0xff, b'!'];
        assert_eq!(take_utf8(&mut pending), "ok\u{fffd}!");
        assert!(pending.is_empty());
    }
}
