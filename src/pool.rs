//! Bounded dispatch of device sessions.
//!
//! Devices are dispatched in list order; a session starts only after it holds
//! one of `limit` semaphore permits and keeps it until it reaches a terminal
//! state. Results are forwarded as sessions finish, not in dispatch order.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

use crate::error::SessionError;
use crate::events::EventPublisher;
use crate::model::{Device, DeviceResult};
use crate::session::{CancelToken, Connector, DeviceSession, SessionPlan};
use crate::sink::LogSink;

/// Shared handles every dispatched session receives.
pub struct RunContext {
    pub plan: Arc<SessionPlan>,
    pub sink: Arc<LogSink>,
    pub events: EventPublisher,
    pub cancel: CancelToken,
}

/// Runs sessions with at most `limit` active at once.
pub struct WorkerPool {
    connector: Arc<dyn Connector>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(connector: Arc<dyn Connector>, limit: usize) -> Self {
        Self {
            connector,
            limit: limit.max(1),
        }
    }

    /// Spawns the dispatcher. Exactly one result per device is sent on
    /// `results`; devices still waiting when the run is cancelled are reported
    /// as cancelled without being connected.
    pub fn start(
        self,
        devices: Arc<[Device]>,
        context: RunContext,
        results: mpsc::UnboundedSender<DeviceResult>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.dispatch(devices, context, results))
    }

    async fn dispatch(
        self,
        devices: Arc<[Device]>,
        context: RunContext,
        results: mpsc::UnboundedSender<DeviceResult>,
    ) {
        let total = devices.len();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut sessions = JoinSet::new();
        let mut in_flight: HashMap<Id, Device> = HashMap::new();
        let mut next = 0;

        debug!("Dispatching {} devices, limit {}", total, self.limit);
        while next < total {
            tokio::select! {
                biased;
                _ = context.cancel.cancelled() => break,
                Some(joined) = sessions.join_next_with_id(), if !sessions.is_empty() => {
                    forward(joined, &mut in_flight, &results);
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    let device = devices[next].clone();
                    next += 1;
                    let session = DeviceSession {
                        device: device.clone(),
                        ordinal: next,
                        total,
                        plan: context.plan.clone(),
                        connector: self.connector.clone(),
                        sink: context.sink.clone(),
                        events: context.events.clone(),
                        cancel: context.cancel.clone(),
                    };
                    let handle = sessions.spawn(async move {
                        let _permit = permit;
                        session.run().await
                    });
                    in_flight.insert(handle.id(), device);
                }
            }
        }

        if next < total {
            debug!("Cancelled with {} devices never dispatched", total - next);
            for device in &devices[next..] {
                let _ = results.send(DeviceResult::not_dispatched(device.clone()));
            }
        }
        while let Some(joined) = sessions.join_next_with_id().await {
            forward(joined, &mut in_flight, &results);
        }
        debug!("All sessions finished");
    }
}

fn forward(
    joined: Result<(Id, DeviceResult), JoinError>,
    in_flight: &mut HashMap<Id, Device>,
    results: &mpsc::UnboundedSender<DeviceResult>,
) {
    let result = match joined {
        Ok((id, result)) => {
            in_flight.remove(&id);
            result
        }
        Err(err) => {
            let Some(device) = in_flight.remove(&err.id()) else {
                warn!("Unknown session task ended: {}", err);
                return;
            };
            warn!("{} session task failed: {}", device.address, err);
            let failure = SessionError::TaskFailed(err.to_string());
            DeviceResult::from_error(device, &failure, None, std::time::Duration::ZERO)
        }
    };
    let _ = results.send(result);
}
