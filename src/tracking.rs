//! Route tracking lifecycle.
//!
//! `start()` spawns one loop that turns location samples into
//! `LocationRecord`s and writes them through the [`SyncGateway`]. `stop()`
//! cancels that loop and waits for it, so a write already under way lands
//! and the platform subscription is released before the current-position
//! slot is cleared.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    LocationError, LocationProvider, LocationRecord, LocationSample, LocationStream,
    SessionStateMachine, SyncGateway, TrackingError,
};

// ---

/// Tunables of the tracking loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingSettings {
    /// Requested interval between location samples.
    pub interval: Duration,
    /// Also append every sample to the assignment's location history.
    pub record_history: bool,
}

impl TrackingSettings {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            record_history: false,
        }
    }
}

/// Progress of the current (or last) tracking loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingStatus {
    // ---
    pub last_sample: Option<LocationSample>,
    /// When the current position was last written successfully.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub failed_writes: u64,
    /// Error that ended the loop, if it ended on its own.
    pub last_error: Option<LocationError>,
}

/// Resets the running flag when dropped, whatever ends the loop.
struct RunningGuard {
    flag: Arc<watch::Sender<bool>>,
}

impl RunningGuard {
    fn acquire(flag: &Arc<watch::Sender<bool>>) -> Option<Self> {
        // ---
        let acquired = flag.send_if_modified(|running| !std::mem::replace(running, true));
        acquired.then(|| Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.send_replace(false);
    }
}

struct TrackingLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    assignment_id: String,
}

// ---

/// Starts and stops location tracking for the active assignment.
pub struct RouteTrackingOrchestrator {
    // ---
    session: Arc<SessionStateMachine>,
    provider: LocationProvider,
    gateway: Arc<SyncGateway>,
    settings: TrackingSettings,

    running: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<TrackingStatus>>,
    current: Mutex<Option<TrackingLoop>>,
}

impl RouteTrackingOrchestrator {
    pub fn new(
        session: Arc<SessionStateMachine>,
        provider: LocationProvider,
        gateway: Arc<SyncGateway>,
        settings: TrackingSettings,
    ) -> Self {
        // ---
        Self {
            session,
            provider,
            gateway,
            settings,
            running: Arc::new(watch::Sender::new(false)),
            status: Arc::new(watch::Sender::new(TrackingStatus::default())),
            current: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    pub fn status(&self) -> TrackingStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TrackingStatus> {
        self.status.subscribe()
    }

    /// Begin tracking the active assignment. Ignored while already running.
    pub async fn start(&self) -> Result<(), TrackingError> {
        // ---
        let mut current = self.current.lock().await;
        if self.is_running() {
            debug!("Tracking already running, ignoring start");
            return Ok(());
        }

        let (Some(_), Some(assignment)) =
            (self.session.conductor(), self.session.assignment())
        else {
            warn!("Cannot start tracking without a session and an assignment");
            return Err(TrackingError::NoActiveAssignment);
        };

        // A loop that ended on its own still holds its join handle
        if let Some(finished) = current.take() {
            finished.cancel.cancel();
            if let Err(e) = finished.handle.await {
                error!("Previous tracking task failed: {}", e);
            }
        }

        let Some(guard) = RunningGuard::acquire(&self.running) else {
            return Ok(());
        };
        self.status.send_replace(TrackingStatus::default());

        let cancel = CancellationToken::new();
        let worker = TrackingWorker {
            session: Arc::clone(&self.session),
            gateway: Arc::clone(&self.gateway),
            status: Arc::clone(&self.status),
            record_history: self.settings.record_history,
        };
        let stream = self.provider.stream(self.settings.interval);
        let handle = tokio::spawn(worker.run(stream, cancel.clone(), guard));

        info!(
            "Tracking started for assignment {} every {:?}",
            assignment.assignment_id, self.settings.interval
        );
        *current = Some(TrackingLoop {
            cancel,
            handle,
            assignment_id: assignment.assignment_id,
        });
        Ok(())
    }

    /// Stop tracking and clear the current position.
    ///
    /// Returns `false` when no loop was running. When it returns, the location
    /// subscription has been released.
    pub async fn stop(&self) -> bool {
        // ---
        let mut current = self.current.lock().await;
        let was_running = self.is_running();

        let Some(tracking) = current.take() else {
            debug!("Tracking not running, ignoring stop");
            return false;
        };

        tracking.cancel.cancel();
        if let Err(e) = tracking.handle.await {
            error!("Tracking task failed: {}", e);
        }

        if !was_running {
            debug!("Tracking loop had already ended");
            return false;
        }

        if !self.gateway.clear_current_location(&tracking.assignment_id).await {
            warn!("Current location for {} was not cleared", tracking.assignment_id);
        }
        info!("Tracking stopped for assignment {}", tracking.assignment_id);
        true
    }
}

/// State moved into the spawned loop.
struct TrackingWorker {
    session: Arc<SessionStateMachine>,
    gateway: Arc<SyncGateway>,
    status: Arc<watch::Sender<TrackingStatus>>,
    record_history: bool,
}

impl TrackingWorker {
    async fn run(
        self,
        mut stream: LocationStream,
        cancel: CancellationToken,
        _running: RunningGuard,
    ) {
        // ---
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(sample)) => {
                    // A write that has started runs to completion; stop() clears after it
                    self.sync_sample(sample).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("Location stream failed, tracking stops: {}", e);
                    self.status.send_modify(|s| s.last_error = Some(e));
                    break;
                }
                None => {
                    info!("Location stream ended");
                    break;
                }
            }
        }
        stream.close();
    }

    async fn sync_sample(&self, sample: LocationSample) {
        // ---
        self.status.send_modify(|s| s.last_sample = Some(sample));

        let (Some(conductor), Some(assignment)) =
            (self.session.conductor(), self.session.assignment())
        else {
            debug!("Session or assignment gone, dropping sample");
            return;
        };

        let record = LocationRecord::from_sample(&sample, &conductor, &assignment);
        let mut failed = 0;

        let synced = self.gateway.put_current_location(&record).await;
        if !synced {
            failed += 1;
        }
        if self.record_history && !self.gateway.append_history(&record).await {
            failed += 1;
        }

        self.status.send_modify(|s| {
            if synced {
                s.last_synced_at = Some(Utc::now());
            }
            s.failed_writes += failed;
        });
    }
}
