use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::shell::{ShellIo, Stop};
use super::transport::Connector;
use super::{CancelToken, SessionState};
use crate::config::FINALIZE_COMMAND_TIMEOUT;
use crate::device::{PromptLevel, PromptMatcher, PromptProfile};
use crate::error::SessionError;
use crate::events::{EventPublisher, ProgressEvent, RunEvent};
use crate::model::{CommandScript, Credentials, Device, DeviceResult, ExecutionOptions};
use crate::sink::{DeviceLog, LogSink};

/// Read-only inputs shared by every session of a run.
#[derive(Debug)]
pub struct SessionPlan {
    pub script: CommandScript,
    pub options: ExecutionOptions,
    pub profile: PromptProfile,
    pub matcher: PromptMatcher,
    pub dial_timeout: Duration,
}

/// One device's walk through the session phases.
pub struct DeviceSession {
    pub device: Device,
    /// 1-based dispatch position, reported as `current` in progress events.
    pub ordinal: usize,
    pub total: usize,
    pub plan: Arc<SessionPlan>,
    pub connector: Arc<dyn Connector>,
    pub sink: Arc<LogSink>,
    pub events: EventPublisher,
    pub cancel: CancelToken,
}

impl DeviceSession {
    /// Runs the session to completion. Never fails: every error ends up in
    /// the returned result.
    pub async fn run(self) -> DeviceResult {
        let started = Instant::now();
        self.transition(SessionState::Connecting);

        let log = match self.sink.open(&self.device).await {
            Ok(log) => log,
            Err(e) => {
                let err = SessionError::Log(e);
                warn!("{} could not open log: {}", self.device.address, err);
                let path = self.sink.path_for(&self.device);
                return DeviceResult::from_error(self.device, &err, Some(path), started.elapsed());
            }
        };
        let log_path = log.path().to_path_buf();

        let outcome = self.drive(log).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                info!(
                    "{} completed {} commands in {:?}",
                    self.device.address,
                    self.plan.script.len(),
                    elapsed
                );
                DeviceResult::success(self.device, log_path, elapsed)
            }
            Err(err) => {
                if matches!(err, SessionError::Cancelled) {
                    debug!("{} cancelled", self.device.address);
                } else {
                    warn!("{} failed: {}", self.device.address, err);
                }
                DeviceResult::from_error(self.device, &err, Some(log_path), elapsed)
            }
        }
    }

    async fn drive(&self, log: DeviceLog) -> Result<(), SessionError> {
        let dial_timeout = self.plan.dial_timeout;
        let transport = guarded(&self.cancel, dial_timeout, self.connector.connect(&self.device))
            .await?
            .ok_or_else(|| {
                SessionError::Connect(format!("no connection within {dial_timeout:?}"))
            })?;

        let mut shell = ShellIo::new(
            transport,
            self.plan.matcher.clone(),
            log,
            self.events.clone(),
            &self.device,
        );
        let result = self.converse(&mut shell).await;

        self.transition(SessionState::Finalizing);
        if result.is_ok() {
            self.finalize(&mut shell).await;
        }
        let closed = shell.close().await;
        result.and(closed)
    }

    async fn converse(&self, shell: &mut ShellIo) -> Result<(), SessionError> {
        let options = &self.plan.options;
        let credentials = options.credentials_for(&self.device);
        let dial_timeout = self.plan.dial_timeout;

        self.transition(SessionState::Authenticating);
        guarded(
            &self.cancel,
            dial_timeout,
            shell.authenticate(&credentials.username, &credentials.password),
        )
        .await?
        .ok_or_else(|| SessionError::Auth("authentication timed out".to_string()))?;
        guarded(&self.cancel, dial_timeout, shell.open_shell())
            .await?
            .ok_or_else(|| SessionError::Auth("shell request timed out".to_string()))?;

        let login = guarded(&self.cancel, options.command_timeout, shell.read_until_prompt())
            .await?
            .ok_or_else(|| SessionError::Auth("no prompt after login".to_string()))?;
        let level = match login.stop {
            Stop::Prompt(level) => level,
            Stop::Password => {
                return Err(SessionError::Auth(
                    "device asked for a password after login".to_string(),
                ));
            }
        };
        debug!("{} logged in at {:?} level", self.device.address, level);

        if options.enable_privilege {
            self.transition(SessionState::Escalating);
            self.escalate(shell, level, &credentials).await?;
        }

        if options.suppress_paging {
            self.transition(SessionState::SuppressingPaging);
            match self.suppress_paging(shell).await {
                Ok(()) => shell.paging_suppressed = true,
                Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
                Err(err) => {
                    warn!(
                        "{} paging suppression failed, continuing: {}",
                        self.device.address, err
                    );
                    shell
                        .note(&format!("[warn] paging suppression failed: {err}"))
                        .await?;
                }
            }
        }

        for (index, command) in self.plan.script.iter().enumerate() {
            self.transition(SessionState::Executing { command: index + 1 });
            debug!("{} executing {:?}", self.device.address, command);
            let reply = guarded(&self.cancel, options.command_timeout, async {
                shell.send_line(command).await?;
                shell.read_until_prompt().await
            })
            .await?;
            if reply.is_none() {
                shell.flush_tail().await?;
                return Err(SessionError::CommandTimeout {
                    command: command.clone(),
                    partial: shell.take_current(),
                });
            }
        }
        Ok(())
    }

    /// Reaches a privileged prompt, answering a password prompt if one comes.
    async fn escalate(
        &self,
        shell: &mut ShellIo,
        level: PromptLevel,
        credentials: &Credentials,
    ) -> Result<(), SessionError> {
        if level.is_privileged() {
            debug!("{} already privileged", self.device.address);
            return Ok(());
        }
        let timeout = self.plan.options.command_timeout;

        let mut reply = guarded(&self.cancel, timeout, async {
            shell.send_line(&self.plan.profile.escalate_command).await?;
            shell.read_until_prompt().await
        })
        .await?
            .ok_or_else(|| SessionError::Privilege("no response to escalation".to_string()))?;

        if reply.stop == Stop::Password {
            if credentials.enable_password.is_empty() {
                return Err(SessionError::Privilege(
                    "enable password requested but none configured".to_string(),
                ));
            }
            reply = guarded(&self.cancel, timeout, async {
                shell.send_line(&credentials.enable_password).await?;
                shell.read_until_prompt().await
            })
            .await?
                .ok_or_else(|| {
                    SessionError::Privilege("no response to enable password".to_string())
                })?;
        }

        match reply.stop {
            Stop::Prompt(level) if level.is_privileged() => Ok(()),
            Stop::Password => Err(SessionError::Privilege("enable password rejected".to_string())),
            Stop::Prompt(_) => Err(SessionError::Privilege(
                reply
                    .error
                    .unwrap_or_else(|| "still at user prompt".to_string()),
            )),
        }
    }

    async fn suppress_paging(&self, shell: &mut ShellIo) -> Result<(), SessionError> {
        let command = &self.plan.profile.paging_disable_command;
        let reply = guarded(&self.cancel, self.plan.options.command_timeout, async {
            shell.send_line(command).await?;
            shell.read_until_prompt().await
        })
        .await?
        .ok_or_else(|| SessionError::CommandTimeout {
            command: command.clone(),
            partial: String::new(),
        })?;
        match reply.error {
            Some(error) => Err(SessionError::PagingRejected(error)),
            None => Ok(()),
        }
    }

    /// Best-effort housekeeping after a successful script.
    async fn finalize(&self, shell: &mut ShellIo) {
        if shell.paging_suppressed
            && let Some(restore) = self.plan.profile.paging_restore_command.as_deref()
        {
            let restored = guarded(&self.cancel, FINALIZE_COMMAND_TIMEOUT, async {
                shell.send_line(restore).await?;
                shell.read_until_prompt().await
            })
            .await;
            if !matches!(restored, Ok(Some(_))) {
                debug!("{} paging restore skipped", self.device.address);
            }
        }

        let _ = guarded(&self.cancel, FINALIZE_COMMAND_TIMEOUT, async {
            shell.send_line(&self.plan.profile.exit_command).await?;
            shell.drain_to_close().await
        })
        .await;
    }

    fn transition(&self, state: SessionState) {
        debug!("{} -> {:?}", self.device.address, state);
        self.events.publish(RunEvent::Progress(ProgressEvent {
            current: self.ordinal,
            total: self.total,
            device: self.device.address.clone(),
            display_name: self.device.name().to_string(),
            status: state.into(),
            phase: state,
        }));
    }
}

/// Awaits `fut` for at most `limit`, giving up early on cancellation.
///
/// Every write to the device and every wait for its output goes through here,
/// so a stalled channel is abandoned within one deadline.
///
/// `Ok(None)` means the deadline passed.
async fn guarded<T, F>(cancel: &CancelToken, limit: Duration, fut: F) -> Result<Option<T>, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(value) => value.map(Some),
            Err(_) => Ok(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guarded_reports_deadline_as_none() {
        let cancel = CancelToken::new();
        let res = guarded(&cancel, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SessionError>(())
        })
        .await
        .expect("not cancelled");
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn guarded_prefers_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let res = guarded(&cancel, Duration::from_secs(1), async { Ok::<_, SessionError>(1) }).await;
        assert!(matches!(res, Err(SessionError::Cancelled)));
    }
}
