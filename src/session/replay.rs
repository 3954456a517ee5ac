//! Scripted in-memory device shells.
//!
//! [`ReplayConnector`] stands in for SSH when no lab is at hand: each
//! [`ReplayDevice`] emulates an IOS-like CLI with login, `enable`, paging and
//! canned command responses. The connector also records what every device
//! was sent and how many shells were open at once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::mpsc;

use super::transport::{Connector, Transport};
use crate::error::SessionError;
use crate::model::Device;

const INVALID_INPUT: &str = "% Invalid input detected at '^' marker.";
const PAGER: &str = " --More-- ";
const PAGER_ERASE: &str = "\r          \r";

/// Canned reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResponse {
    /// Output lines followed by the prompt.
    Output(Vec<String>),
    /// Output lines and then silence; the prompt never comes back.
    Hang(Vec<String>),
}

impl ReplayResponse {
    pub fn output<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplayResponse::Output(lines.into_iter().map(Into::into).collect())
    }

    pub fn hang<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplayResponse::Hang(lines.into_iter().map(Into::into).collect())
    }
}

/// Behaviour of one emulated device.
#[derive(Debug, Clone)]
pub struct ReplayDevice {
    pub hostname: String,
    /// When false, connecting fails immediately.
    pub reachable: bool,
    /// Time taken by `connect`.
    pub connect_delay: Duration,
    /// Login password; `None` accepts any.
    pub password: Option<String>,
    pub start_privileged: bool,
    /// `None` means `enable` succeeds without a password prompt.
    pub enable_password: Option<String>,
    /// Whether `terminal length 0` is understood.
    pub paging_supported: bool,
    /// Lines per page while paging is on; `None` never pages.
    pub page_size: Option<usize>,
    /// Delay before each output chunk.
    pub response_delay: Duration,
    /// Time each write takes to be accepted, as with a full SSH window.
    pub send_delay: Duration,
    pub responses: HashMap<String, ReplayResponse>,
}

impl ReplayDevice {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            reachable: true,
            connect_delay: Duration::ZERO,
            password: None,
            start_privileged: false,
            enable_password: None,
            paging_supported: true,
            page_size: None,
            response_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
            responses: HashMap::new(),
        }
    }

    pub fn respond(mut self, command: impl Into<String>, response: ReplayResponse) -> Self {
        self.responses.insert(command.into(), response);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_enable_password(mut self, password: impl Into<String>) -> Self {
        self.enable_password = Some(password.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.start_privileged = true;
        self
    }

    pub fn without_paging_command(mut self) -> Self {
        self.paging_supported = false;
        self
    }

    pub fn with_page_size(mut self, lines: usize) -> Self {
        self.page_size = Some(lines.max(1));
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Stats {
    active: usize,
    max_active: usize,
    connects: HashMap<String, usize>,
    sent: HashMap<String, Vec<String>>,
}

/// Connector serving [`ReplayDevice`]s keyed by address.
#[derive(Debug, Clone, Default)]
pub struct ReplayConnector {
    devices: Arc<HashMap<String, ReplayDevice>>,
    stats: Arc<Mutex<Stats>>,
}

impl ReplayConnector {
    pub fn new<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = (String, ReplayDevice)>,
    {
        Self {
            devices: Arc::new(devices.into_iter().collect()),
            stats: Arc::default(),
        }
    }

    /// Highest number of shells open at the same time.
    pub fn max_active(&self) -> usize {
        self.stats().max_active
    }

    /// Number of connection attempts made to `address`.
    pub fn connect_attempts(&self, address: &str) -> usize {
        self.stats().connects.get(address).copied().unwrap_or(0)
    }

    /// Lines received by `address`, in order. Secrets are masked.
    pub fn sent(&self, address: &str) -> Vec<String> {
        self.stats().sent.get(address).cloned().unwrap_or_default()
    }

    fn stats(&self) -> MutexGuard<'_, Stats> {
        lock(&self.stats)
    }
}

fn lock(stats: &Mutex<Stats>) -> MutexGuard<'_, Stats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for ReplayConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Transport>, SessionError> {
        *lock(&self.stats)
            .connects
            .entry(device.address.clone())
            .or_default() += 1;

        let script = self
            .devices
            .get(&device.address)
            .cloned()
            .ok_or_else(|| SessionError::Connect(format!("{}: no route to host", device.address)))?;
        if !script.connect_delay.is_zero() {
            tokio::time::sleep(script.connect_delay).await;
        }
        if !script.reachable {
            return Err(SessionError::Connect(format!(
                "{}: connection refused",
                device.address
            )));
        }

        {
            let mut stats = lock(&self.stats);
            stats.active += 1;
            stats.max_active = stats.max_active.max(stats.active);
        }
        debug!("replay {} connected", device.address);

        let (output, rx) = mpsc::unbounded_channel();
        let mode = if script.start_privileged {
            Mode::Privileged
        } else {
            Mode::User
        };
        Ok(Box::new(ReplayTransport {
            address: device.address.clone(),
            script,
            output: Some(output),
            rx,
            mode,
            paging: true,
            pages: VecDeque::new(),
            stats: self.stats.clone(),
            open: true,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    User,
    Privileged,
    AwaitingEnablePassword,
}

struct ReplayTransport {
    address: String,
    script: ReplayDevice,
    /// Dropped on `exit`, which ends `recv`.
    output: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
    mode: Mode,
    paging: bool,
    /// Remaining pages of a paged response.
    pages: VecDeque<Vec<String>>,
    stats: Arc<Mutex<Stats>>,
    open: bool,
}

impl ReplayTransport {
    fn prompt(&self) -> String {
        match self.mode {
            Mode::Privileged => format!("{}#", self.script.hostname),
            _ => format!("{}>", self.script.hostname),
        }
    }

    fn push(&self, text: String) {
        if let Some(output) = &self.output {
            let _ = output.send(text);
        }
    }

    fn record(&self, line: &str) {
        lock(&self.stats)
            .sent
            .entry(self.address.clone())
            .or_default()
            .push(line.to_string());
    }

    /// Output lines, paged when paging is on, then the prompt.
    fn reply(&mut self, lines: Vec<String>) {
        match self.script.page_size {
            Some(size) if self.paging && lines.len() > size => {
                let mut pages: VecDeque<Vec<String>> =
                    lines.chunks(size).map(<[String]>::to_vec).collect();
                if let Some(first) = pages.pop_front() {
                    self.push(format!("{}\r\n{PAGER}", first.join("\r\n")));
                }
                self.pages = pages;
            }
            _ => {
                let mut text = String::new();
                for line in &lines {
                    text.push_str(line);
                    text.push_str("\r\n");
                }
                text.push_str(&self.prompt());
                self.push(text);
            }
        }
    }

    fn next_page(&mut self) {
        let Some(page) = self.pages.pop_front() else {
            return;
        };
        let mut text = format!("{PAGER_ERASE}{}\r\n", page.join("\r\n"));
        if self.pages.is_empty() {
            text.push_str(&self.prompt());
        } else {
            text.push_str(PAGER);
        }
        self.push(text);
    }

    fn handle_line(&mut self, line: &str) {
        if self.mode == Mode::AwaitingEnablePassword {
            self.record("<secret>");
            let expected = self.script.enable_password.as_deref().unwrap_or_default();
            if line == expected {
                self.mode = Mode::Privileged;
                self.push(format!("\r\n{}", self.prompt()));
            } else {
                self.mode = Mode::User;
                self.push(format!("\r\n% Access denied\r\n\r\n{}", self.prompt()));
            }
            return;
        }

        self.pages.clear();
        self.record(line);
        self.push(format!("{line}\r\n"));
        match line {
            "" => self.reply(Vec::new()),
            "enable" => match (&self.script.enable_password, self.mode) {
                (_, Mode::Privileged) | (None, _) => {
                    self.mode = Mode::Privileged;
                    self.reply(Vec::new());
                }
                (Some(_), _) => {
                    self.mode = Mode::AwaitingEnablePassword;
                    self.push("Password: ".to_string());
                }
            },
            "terminal length 0" if self.script.paging_supported => {
                self.paging = false;
                self.reply(Vec::new());
            }
            "terminal length 24" if self.script.paging_supported => {
                self.paging = true;
                self.reply(Vec::new());
            }
            "exit" => {
                debug!("replay {} exit", self.address);
                self.output = None;
            }
            _ => match self.script.responses.get(line).cloned() {
                Some(ReplayResponse::Output(lines)) => self.reply(lines),
                Some(ReplayResponse::Hang(lines)) => {
                    let text: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
                    self.push(text);
                }
                None => self.reply(vec![
                    "                 ^".to_string(),
                    INVALID_INPUT.to_string(),
                    String::new(),
                ]),
            },
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn authenticate(&mut self, _username: &str, password: &str) -> Result<(), SessionError> {
        match &self.script.password {
            Some(expected) if expected != password => {
                Err(SessionError::Auth("password rejected".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn open_shell(&mut self) -> Result<(), SessionError> {
        self.push(format!("\r\n{}", self.prompt()));
        Ok(())
    }

    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        if self.output.is_none() {
            return Err(SessionError::ChannelClosed);
        }
        if !self.script.send_delay.is_zero() {
            tokio::time::sleep(self.script.send_delay).await;
        }
        if data == " " {
            self.next_page();
            return Ok(());
        }
        trace!("replay {} <- {:?}", self.address, data);
        for line in data.split_terminator('\n') {
            self.handle_line(line.trim_end_matches('\r'));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        if !self.script.response_delay.is_zero() {
            tokio::time::sleep(self.script.response_delay).await;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.output = None;
        self.release();
    }
}

impl ReplayTransport {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            let mut stats = lock(&self.stats);
            stats.active = stats.active.saturating_sub(1);
        }
    }
}

impl Drop for ReplayTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(device: ReplayDevice) -> ReplayConnector {
        ReplayConnector::new([("10.0.0.1".to_string(), device)])
    }

    async fn read_all(transport: &mut Box<dyn Transport>) -> String {
        let mut out = String::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(20), transport.recv()).await
        {
            out.push_str(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let connector = ReplayConnector::default();
        let err = connector
            .connect(&Device::new("10.9.9.9", ""))
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(connector.connect_attempts("10.9.9.9"), 1);
    }

    #[tokio::test]
    async fn enable_prompts_for_password_and_masks_it() {
        let connector = connector(ReplayDevice::new("R1").with_enable_password("s3cret"));
        let mut transport = connector
            .connect(&Device::new("10.0.0.1", ""))
            .await
            .expect("connect");
        transport.open_shell().await.expect("shell");
        assert_eq!(read_all(&mut transport).await, "\r\nR1>");

        transport.send("enable\n").await.expect("send");
        assert_eq!(read_all(&mut transport).await, "enable\r\nPassword: ");
        transport.send("s3cret\n").await.expect("send");
        assert_eq!(read_all(&mut transport).await, "\r\nR1#");

        assert_eq!(connector.sent("10.0.0.1"), vec!["enable", "<secret>"]);
    }

    #[tokio::test]
    async fn long_output_is_paged_until_paging_is_disabled() {
        let lines: Vec<String> = (1..=5).map(|i| format!("line {i}")).collect();
        let connector = connector(
            ReplayDevice::new("R1")
                .privileged()
                .with_page_size(2)
                .respond("show log", ReplayResponse::Output(lines)),
        );
        let mut transport = connector
            .connect(&Device::new("10.0.0.1", ""))
            .await
            .expect("connect");
        transport.open_shell().await.expect("shell");
        read_all(&mut transport).await;

        transport.send("show log\n").await.expect("send");
        assert!(read_all(&mut transport).await.ends_with(PAGER));

        transport.send("terminal length 0\n").await.expect("send");
        read_all(&mut transport).await;
        transport.send("show log\n").await.expect("send");
        let out = read_all(&mut transport).await;
        assert!(!out.contains("More"));
        assert!(out.ends_with("line 5\r\nR1#"));
    }

    #[tokio::test]
    async fn concurrent_shells_are_tracked() {
        let connector = ReplayConnector::new([
            ("a".to_string(), ReplayDevice::new("A")),
            ("b".to_string(), ReplayDevice::new("B")),
        ]);
        let first = connector.connect(&Device::new("a", "")).await.expect("a");
        let mut second = connector.connect(&Device::new("b", "")).await.expect("b");
        second.close().await;
        drop(first);

        assert_eq!(connector.max_active(), 2);
        assert_eq!(lock(&connector.stats).active, 0);
    }
}
