use log::trace;

use super::transport::Transport;
use crate::device::{LineClass, PromptLevel, PromptMatcher, clean_line};
use crate::error::SessionError;
use crate::events::{EventPublisher, LogEvent, RunEvent};
use crate::model::Device;
use crate::sink::DeviceLog;

/// Where a read stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    Prompt(PromptLevel),
    Password,
}

/// Outcome of one read up to a prompt.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub stop: Stop,
    /// Last device error line seen before the prompt.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Drained {
    lines: usize,
    /// Last device error line.
    error: Option<String>,
}

/// Line-oriented view of a device shell.
///
/// Output is split on `\n`; each complete line is cleaned, written to the
/// device log and published as a log event. The unterminated tail is
/// inspected for prompts and the pager but stays buffered, so a prompt line
/// is logged together with the command echoed after it.
pub(crate) struct ShellIo {
    transport: Box<dyn Transport>,
    matcher: PromptMatcher,
    log: DeviceLog,
    events: EventPublisher,
    address: String,
    display_name: String,
    buffer: String,
    /// Output lines of the command being executed.
    current: String,
    pub paging_suppressed: bool,
}

impl ShellIo {
    pub fn new(
        transport: Box<dyn Transport>,
        matcher: PromptMatcher,
        log: DeviceLog,
        events: EventPublisher,
        device: &Device,
    ) -> Self {
        Self {
            transport,
            matcher,
            log,
            events,
            address: device.address.clone(),
            display_name: device.name().to_string(),
            buffer: String::new(),
            current: String::new(),
            paging_suppressed: false,
        }
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        self.transport.authenticate(username, password).await
    }

    pub async fn open_shell(&mut self) -> Result<(), SessionError> {
        self.transport.open_shell().await
    }

    /// Sends `text` followed by a newline.
    pub async fn send_line(&mut self, text: &str) -> Result<(), SessionError> {
        self.current.clear();
        self.transport.send(&format!("{text}\n")).await
    }

    /// Output collected since the last `send_line`.
    pub fn take_current(&mut self) -> String {
        std::mem::take(&mut self.current)
    }

    /// Reads until the tail is a prompt or a password prompt.
    ///
    /// A prompt left in the buffer by the previous read only counts again once
    /// a complete line has arrived, so a command echo split across chunks is
    /// not mistaken for the next prompt.
    ///
    /// Dropping the future on a deadline keeps the shell usable. Each line is
    /// published before it is written, so only a file write interrupted at
    /// that moment can come up short.
    pub async fn read_until_prompt(&mut self) -> Result<Reply, SessionError> {
        let mut fresh = self.buffer.is_empty();
        let mut error = None;
        loop {
            let chunk = self
                .transport
                .recv()
                .await
                .ok_or(SessionError::ChannelClosed)?;
            self.buffer.push_str(&chunk);
            let drained = self.drain_lines().await?;
            if drained.lines > 0 {
                fresh = true;
            }
            if drained.error.is_some() {
                error = drained.error;
            }

            if self.buffer.is_empty() || !fresh {
                continue;
            }
            if self.matcher.has_more(&self.buffer) {
                trace!("{} pager prompt, continuing", self.address);
                self.buffer = self.matcher.strip_more(&self.buffer);
                self.transport.send(" ").await?;
                continue;
            }
            match self.matcher.classify(&clean_line(&self.buffer)) {
                LineClass::Prompt(level) => {
                    return Ok(Reply {
                        stop: Stop::Prompt(level),
                        error,
                    });
                }
                LineClass::Password => {
                    return Ok(Reply {
                        stop: Stop::Password,
                        error,
                    });
                }
                _ => {}
            }
        }
    }

    /// Reads until the remote side closes, logging whatever arrives.
    pub async fn drain_to_close(&mut self) -> Result<(), SessionError> {
        while let Some(chunk) = self.transport.recv().await {
            self.buffer.push_str(&chunk);
            self.drain_lines().await?;
        }
        Ok(())
    }

    /// Logs the complete lines still buffered, then the unterminated tail.
    pub async fn flush_tail(&mut self) -> Result<(), SessionError> {
        self.drain_lines().await?;
        let mut tail = clean_line(&std::mem::take(&mut self.buffer));
        if self.matcher.has_more(&tail) {
            tail = self.matcher.strip_more(&tail);
        }
        if !tail.is_empty() {
            self.current.push_str(&tail);
            self.emit(&tail).await?;
        }
        Ok(())
    }

    /// Writes a line that did not come from the device.
    pub async fn note(&mut self, text: &str) -> Result<(), SessionError> {
        self.emit(text).await
    }

    /// Flushes the tail and the log, then closes the transport.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let flushed = self.flush_tail().await;
        self.transport.close().await;
        self.log.flush().await?;
        flushed
    }

    /// Emits every complete line in the buffer.
    async fn drain_lines(&mut self) -> Result<Drained, SessionError> {
        let mut drained = Drained::default();
        while let Some(pos) = self.buffer.find('\n') {
            let raw: String = self.buffer.drain(..=pos).collect();
            let mut line = clean_line(&raw);
            if self.matcher.has_more(&line) {
                line = self.matcher.strip_more(&line);
            }
            if self.matcher.classify(&line) == LineClass::Error {
                drained.error = Some(line.clone());
            }
            drained.lines += 1;
            self.current.push_str(&line);
            self.current.push('\n');
            self.emit(&line).await?;
        }
        Ok(drained)
    }

    async fn emit(&mut self, text: &str) -> Result<(), SessionError> {
        self.events.publish(RunEvent::Log(LogEvent {
            device: self.address.clone(),
            display_name: self.display_name.clone(),
            line: text.to_string(),
        }));
        self.log.write(text).await?;
        Ok(())
    }
}
