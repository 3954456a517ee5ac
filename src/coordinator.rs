//! Run lifecycle: configuration, dispatch, aggregation, cancellation, export.
//!
//! [`RunCoordinator`] is the only writer of run state. Sessions report into a
//! single aggregation task over an mpsc channel; that task owns every state
//! transition after `Running` except the `Cancelling` flag set by
//! [`RunCoordinator::cancel`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, RunError, SessionError};
use crate::events::{EventPublisher, ProgressEvent, ResultEvent, RunEvent};
use crate::model::{
    CommandScript, Device, DeviceResult, ExecutionOptions, LogLine, RunId, RunSnapshot,
    RunStatus, RunSummary, normalize_commands, validate_devices,
};
use crate::pool::{RunContext, WorkerPool};
use crate::report::RunReport;
use crate::session::{CancelToken, Connector, SessionPlan, SessionState};
use crate::sink::LogSink;

struct Run {
    id: RunId,
    devices: Arc<[Device]>,
    script: CommandScript,
    status: RunStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    results: Vec<DeviceResult>,
    log_dir: PathBuf,
    summary: Option<RunSummary>,
}

struct RunSlot {
    run: Run,
    cancel: CancelToken,
    sink: Arc<LogSink>,
    done: watch::Receiver<Option<RunSummary>>,
}

#[derive(Default)]
struct CoordinatorState {
    devices: Vec<Device>,
    commands: Vec<String>,
    current: Option<RunSlot>,
}

impl CoordinatorState {
    fn active(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|slot| slot.run.status.is_active())
    }
}

/// Orchestrates batch runs. At most one run is active at a time.
pub struct RunCoordinator {
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,
    events: EventPublisher,
    state: Arc<Mutex<CoordinatorState>>,
}

impl RunCoordinator {
    pub fn new(connector: Arc<dyn Connector>, config: CoordinatorConfig) -> Self {
        let events = EventPublisher::new(config.event_capacity);
        Self {
            connector,
            config,
            events,
            state: Arc::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Replaces the device list of the next run.
    pub fn set_devices<I>(&self, devices: I) -> Result<(), RunError>
    where
        I: IntoIterator<Item = Device>,
    {
        let mut state = lock(&self.state);
        if state.active() {
            return Err(RunError::RunActive);
        }
        state.devices = devices
            .into_iter()
            .map(|device| {
                let credentials = device.credentials.clone();
                let mut normalized = Device::new(device.address, device.display_name);
                normalized.credentials = credentials;
                normalized
            })
            .collect();
        debug!("Loaded {} devices", state.devices.len());
        Ok(())
    }

    /// Replaces the command script of the next run. Blank entries are
    /// dropped; returns the number of commands kept.
    pub fn set_commands<I, S>(&self, commands: I) -> Result<usize, RunError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = lock(&self.state);
        if state.active() {
            return Err(RunError::RunActive);
        }
        state.commands = normalize_commands(commands);
        debug!("Loaded {} commands", state.commands.len());
        Ok(state.commands.len())
    }

    /// Validates the configuration and starts a run.
    ///
    /// Rejections are returned and also published as [`RunEvent::Error`].
    pub async fn start_run(&self, options: ExecutionOptions) -> Result<RunId, RunError> {
        let result = self.try_start(options).await;
        if let Err(err) = &result {
            warn!("Run rejected: {}", err);
            self.events.publish(RunEvent::Error {
                message: err.to_string(),
            });
        }
        result
    }

    async fn try_start(&self, options: ExecutionOptions) -> Result<RunId, RunError> {
        let (devices, script) = {
            let state = lock(&self.state);
            if state.active() {
                return Err(RunError::RunActive);
            }
            validate_devices(&state.devices)?;
            if state.commands.is_empty() {
                return Err(ConfigError::NoCommands.into());
            }
            (state.devices.clone(), state.commands.clone())
        };
        options.validate()?;
        let matcher = self.config.profile.matcher()?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let log_dir = self
            .config
            .log_root
            .join(started_at.format("%Y-%m-%d").to_string())
            .join(id.to_string());
        tokio::fs::create_dir_all(&log_dir).await?;

        let devices: Arc<[Device]> = devices.into();
        let script: CommandScript = script.into();
        let sink = Arc::new(LogSink::new(&log_dir, &devices, self.config.log_capacity));
        let cancel = CancelToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        {
            let mut state = lock(&self.state);
            // Re-checked: the lock was released while creating the directory.
            if state.active() {
                return Err(RunError::RunActive);
            }
            state.current = Some(RunSlot {
                run: Run {
                    id,
                    devices: devices.clone(),
                    script: script.clone(),
                    status: RunStatus::Running,
                    started_at,
                    finished_at: None,
                    results: Vec::with_capacity(devices.len()),
                    log_dir: log_dir.clone(),
                    summary: None,
                },
                cancel: cancel.clone(),
                sink: sink.clone(),
                done: done_rx,
            });
        }
        info!(
            "Run {} started: {} devices, {} commands, limit {}, logs in {}",
            id,
            devices.len(),
            script.len(),
            options.concurrency_limit,
            log_dir.display()
        );

        let limit = options.concurrency_limit;
        let plan = Arc::new(SessionPlan {
            script,
            options,
            profile: self.config.profile.clone(),
            matcher,
            dial_timeout: self.config.dial_timeout,
        });
        let context = RunContext {
            plan,
            sink,
            events: self.events.clone(),
            cancel,
        };
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        WorkerPool::new(self.connector.clone(), limit).start(devices, context, results_tx);
        tokio::spawn(aggregate(
            self.state.clone(),
            self.events.clone(),
            id,
            results_rx,
            done_tx,
        ));
        Ok(id)
    }

    /// Requests cancellation of the running run. Returns whether this call
    /// changed anything; cancelling twice, or after completion, is a no-op.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(slot) = state.current.as_mut() else {
            return false;
        };
        if slot.run.status != RunStatus::Running {
            return false;
        }
        slot.run.status = RunStatus::Cancelling;
        slot.cancel.cancel();
        info!("Run {} cancelling", slot.run.id);
        true
    }

    /// Waits for the current run to complete. `None` if no run was started.
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut done = lock(&self.state).current.as_ref()?.done.clone();
        if done.wait_for(Option::is_some).await.is_err() {
            debug!("Aggregator ended before completion");
        }
        let summary = done.borrow().clone();
        summary
    }

    pub fn status(&self) -> RunStatus {
        lock(&self.state)
            .current
            .as_ref()
            .map_or(RunStatus::Idle, |slot| slot.run.status)
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        let state = lock(&self.state);
        let run = &state.current.as_ref()?.run;
        Some(RunSnapshot {
            id: run.id,
            devices: run.devices.to_vec(),
            commands: run.script.to_vec(),
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            results: run.results.clone(),
            completed_count: run.results.len(),
            log_dir: run.log_dir.clone(),
        })
    }

    /// Summary of the last completed run.
    pub fn summary(&self) -> Option<RunSummary> {
        lock(&self.state).current.as_ref()?.run.summary.clone()
    }

    /// Run events from now on. Subscribe before `start_run` to see them all.
    pub fn subscribe(&self) -> BoxStream<'static, RunEvent> {
        self.events.subscribe()
    }

    /// Live device lines of the current run.
    pub fn subscribe_logs(&self) -> Option<BoxStream<'static, LogLine>> {
        Some(lock(&self.state).current.as_ref()?.sink.subscribe())
    }

    /// Writes `results.json` into the run log directory.
    pub async fn export_results(&self) -> Result<PathBuf, RunError> {
        let report = {
            let state = lock(&self.state);
            let run = &state.current.as_ref().ok_or(RunError::NoRun)?.run;
            let summary = match (&run.summary, run.status) {
                (Some(summary), RunStatus::Completed) => summary.clone(),
                _ => return Err(RunError::NotCompleted),
            };
            RunReport {
                run_id: run.id,
                started_at: run.started_at,
                finished_at: run.finished_at,
                summary,
                results: run.results.clone(),
            }
        };
        let path = report.write_to(&report.summary.log_dir).await?;
        info!("Results exported to {}", path.display());
        Ok(path)
    }

    /// Contents of a device log written so far.
    pub async fn read_log(&self, path: impl AsRef<Path>) -> Result<String, RunError> {
        Ok(LogSink::read_all(path).await?)
    }
}

fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What one recorded result asks the aggregator to publish.
struct Recorded {
    result: ResultEvent,
    progress: ProgressEvent,
    completed: Option<RunSummary>,
}

async fn aggregate(
    state: Arc<Mutex<CoordinatorState>>,
    events: EventPublisher,
    run_id: RunId,
    mut results: mpsc::UnboundedReceiver<DeviceResult>,
    done: watch::Sender<Option<RunSummary>>,
) {
    while let Some(result) = results.recv().await {
        let Some(recorded) = record(&state, run_id, result) else {
            continue;
        };
        publish(&events, &done, recorded);
    }

    // The pool reports every device; fill any gap so the run still completes.
    let missing: Vec<Device> = {
        let guard = lock(&state);
        match guard.current.as_ref().filter(|slot| slot.run.id == run_id) {
            Some(slot) if slot.run.summary.is_none() => slot
                .run
                .devices
                .iter()
                .filter(|d| !slot.run.results.iter().any(|r| r.device.address == d.address))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    };
    for device in missing {
        warn!("{} produced no result", device.address);
        let err = SessionError::TaskFailed("no result reported".to_string());
        let result = DeviceResult::from_error(device, &err, None, std::time::Duration::ZERO);
        if let Some(recorded) = record(&state, run_id, result) {
            publish(&events, &done, recorded);
        }
    }
}

fn record(
    state: &Mutex<CoordinatorState>,
    run_id: RunId,
    result: DeviceResult,
) -> Option<Recorded> {
    let mut guard = lock(state);
    let run = &mut guard
        .current
        .as_mut()
        .filter(|slot| slot.run.id == run_id)?
        .run;

    let result_event = ResultEvent::from(&result);
    let terminal = if result.is_success() {
        SessionState::Success
    } else {
        SessionState::Failed
    };
    let progress = ProgressEvent {
        current: run.results.len() + 1,
        total: run.devices.len(),
        device: result.device.address.clone(),
        display_name: result.device.name().to_string(),
        status: terminal.into(),
        phase: terminal,
    };
    run.results.push(result);

    let completed = if run.results.len() == run.devices.len() {
        let summary = RunSummary::from_results(run.id, &run.results, run.log_dir.clone());
        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        run.summary = Some(summary.clone());
        info!(
            "Run {} completed: {} succeeded, {} failed ({} cancelled)",
            run.id, summary.success_count, summary.fail_count, summary.cancelled_count
        );
        Some(summary)
    } else {
        None
    };

    Some(Recorded {
        result: result_event,
        progress,
        completed,
    })
}

fn publish(
    events: &EventPublisher,
    done: &watch::Sender<Option<RunSummary>>,
    recorded: Recorded,
) {
    events.publish(RunEvent::Result(recorded.result));
    events.publish(RunEvent::Progress(recorded.progress));
    if let Some(summary) = recorded.completed {
        events.publish(RunEvent::Completed(summary.clone()));
        done.send_replace(Some(summary));
    }
}
