//! Location source that replays a recorded track.
//!
//! Stands in for the device location API on hosts without one. A track is a
//! JSON array of `[lat, lon]` pairs; a `null` entry replays a callback that
//! carried no usable fix.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{LocationRequest, LocationSink, LocationSource, SubscriptionId};
use crate::{LocationError, LocationSample};

// ---

/// Replays a fixed track at the requested interval.
pub struct ReplayLocationSource {
    // ---
    track: Arc<Vec<Option<(f64, f64)>>>,
    looping: bool,
    permission: AtomicBool,
    next_id: AtomicU64,
    registrations: AtomicUsize,
    active: Mutex<HashMap<SubscriptionId, CancellationToken>>,
    last: Arc<Mutex<Option<LocationSample>>>,
}

impl ReplayLocationSource {
    /// Source replaying `track` once, with permission granted.
    pub fn new(track: Vec<Option<(f64, f64)>>) -> Self {
        // ---
        Self {
            track: Arc::new(track),
            looping: false,
            permission: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            registrations: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Load a track file (`[[lat, lon], null, ...]`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read track file {}", path.display()))?;
        let points: Vec<Option<[f64; 2]>> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid track file {}", path.display()))?;

        info!("Loaded {} track points from {}", points.len(), path.display());
        Ok(Self::new(
            points.into_iter().map(|p| p.map(|[lat, lon]| (lat, lon))).collect(),
        ))
    }

    /// Restart from the first point instead of ending the subscription.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Grant or revoke location permission.
    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    /// Subscriptions registered and not yet removed.
    pub fn active_subscriptions(&self) -> usize {
        self.lock_active().len()
    }

    /// Every successful `request_updates` call so far.
    pub fn total_registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<SubscriptionId, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocationSource for ReplayLocationSource {
    fn permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn request_updates(
        &self,
        request: LocationRequest,
        sink: LocationSink,
    ) -> Result<SubscriptionId, LocationError> {
        // ---
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LocationError::Registration(e.to_string()))?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        self.lock_active().insert(id, cancel.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);

        let track = Arc::clone(&self.track);
        let last = Arc::clone(&self.last);
        let looping = self.looping;
        let period = request.min_interval.max(Duration::from_millis(1));

        runtime.spawn(async move {
            // ---
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut index = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if sink.is_closed() {
                    break;
                }
                if index >= track.len() {
                    if looping && !track.is_empty() {
                        index = 0;
                    } else {
                        debug!("Track exhausted for {:?}", id);
                        break;
                    }
                }

                let fix = track[index].map(|(lat, lon)| LocationSample::new(lat, lon, Utc::now()));
                index += 1;
                if let Some(sample) = fix {
                    *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
                }
                sink.on_location_result(fix);
            }
        });

        Ok(id)
    }

    fn remove_updates(&self, id: SubscriptionId) {
        // ---
        if let Some(cancel) = self.lock_active().remove(&id) {
            cancel.cancel();
        }
    }

    async fn last_location(&self) -> Result<Option<LocationSample>, LocationError> {
        Ok(*self.last.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::LocationProvider;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn replays_points_and_skips_gaps() {
        // ---
        let source = Arc::new(ReplayLocationSource::new(vec![
            Some((40.0, -3.0)),
            None,
            Some((41.0, -3.5)),
        ]));
        let provider = LocationProvider::new(source.clone());
        let mut stream = provider.stream(Duration::from_secs(5));

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((first.latitude, first.longitude), (40.0, -3.0));
        assert_eq!((second.latitude, second.longitude), (41.0, -3.5));

        // Track exhausted: the source hangs up and the stream ends
        assert!(stream.next().await.is_none());
        assert_eq!(source.active_subscriptions(), 0);

        let last = provider.last_known_location().await.unwrap();
        assert_eq!(last.latitude, 41.0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stream_removes_subscription() {
        // ---
        let source = Arc::new(ReplayLocationSource::new(vec![Some((1.0, 1.0))]).looping(true));
        let provider = LocationProvider::new(source.clone());

        let mut stream = provider.stream(Duration::from_secs(1));
        stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(source.active_subscriptions(), 1);

        drop(stream);
        assert_eq!(source.active_subscriptions(), 0);
        assert_eq!(source.total_registrations(), 1);
    }

    #[test]
    fn track_file_round_trip() {
        // ---
        let path =
            std::env::temp_dir().join(format!("fieldtrack-track-{}.json", std::process::id()));
        std::fs::write(&path, "[[40.4, -3.7], null, [40.5, -3.6]]").unwrap();

        let source = ReplayLocationSource::from_file(&path).unwrap();
        assert_eq!(source.track.len(), 3);
        assert_eq!(source.track[1], None);

        std::fs::write(&path, "{\"not\": \"a track\"}").unwrap();
        assert!(ReplayLocationSource::from_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
