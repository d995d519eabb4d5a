//! Location provider gateway.
//!
//! Wraps a callback-driven platform [`LocationSource`] into a lazy,
//! cancellable [`LocationStream`]. The platform pushes fixes through a
//! [`LocationSink`] into a bounded channel; the stream drains that channel.
//!
//! The platform subscription is owned by a [`Registration`] guard inside the
//! stream. Whatever ends the stream (the consumer dropping it, `close()`, a
//! provider error, or the source hanging up) drops the guard, and the guard
//! deregisters from the platform.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{LocationError, LocationSample};

mod replay;

pub use replay::ReplayLocationSource;

// ---

/// Default channel capacity between the platform callback and the consumer.
pub const DEFAULT_BUFFER: usize = 16;

/// Largest channel capacity a provider accepts.
pub const MAX_BUFFER: usize = 4096;

/// Accuracy requested from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    HighAccuracy,
}

/// Parameters of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub priority: Priority,
    pub interval: Duration,
    /// Updates are never delivered more often than this.
    pub min_interval: Duration,
}

impl LocationRequest {
    pub fn high_accuracy(interval: Duration) -> Self {
        Self {
            priority: Priority::HighAccuracy,
            interval,
            min_interval: interval,
        }
    }
}

/// Handle of one platform subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback-driven platform location API.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Whether fine location permission is currently granted.
    fn permission_granted(&self) -> bool;

    /// Start delivering updates to `sink` until `remove_updates` is called.
    fn request_updates(
        &self,
        request: LocationRequest,
        sink: LocationSink,
    ) -> Result<SubscriptionId, LocationError>;

    /// Stop a subscription started by `request_updates`.
    fn remove_updates(&self, id: SubscriptionId);

    /// Last fix the platform has cached, if any.
    async fn last_location(&self) -> Result<Option<LocationSample>, LocationError>;
}

/// What a platform callback can report.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// A location result; `None` when the result carried no usable fix.
    Fix(Option<LocationSample>),
    /// Hardware availability changed.
    Availability(bool),
    /// The platform failed after registration.
    Failed(String),
}

/// Callback side of the channel, handed to the platform source.
#[derive(Debug, Clone)]
pub struct LocationSink {
    tx: mpsc::Sender<PlatformEvent>,
}

impl LocationSink {
    /// Report a location result.
    pub fn on_location_result(&self, fix: Option<LocationSample>) {
        self.deliver(PlatformEvent::Fix(fix));
    }

    /// Report an availability change.
    pub fn on_availability(&self, available: bool) {
        self.deliver(PlatformEvent::Availability(available));
    }

    /// Report a fatal platform error.
    pub fn on_error(&self, message: impl Into<String>) {
        self.deliver(PlatformEvent::Failed(message.into()));
    }

    /// True once the consuming stream is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, event: PlatformEvent) {
        // ---
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!("Consumer is behind, dropping platform event {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Deregisters its subscription when dropped.
struct Registration {
    source: Arc<dyn LocationSource>,
    id: SubscriptionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        info!("Removing location updates for subscription {:?}", self.id);
        self.source.remove_updates(self.id);
    }
}

// ---

/// Entry point for location consumers.
#[derive(Clone)]
pub struct LocationProvider {
    // ---
    source: Arc<dyn LocationSource>,
    buffer: usize,
}

impl LocationProvider {
    pub fn new(source: Arc<dyn LocationSource>) -> Self {
        Self::with_buffer(source, DEFAULT_BUFFER)
    }

    /// Provider whose streams buffer at most `buffer` undelivered events,
    /// clamped to `1..=MAX_BUFFER`.
    pub fn with_buffer(source: Arc<dyn LocationSource>, buffer: usize) -> Self {
        Self {
            source,
            buffer: buffer.clamp(1, MAX_BUFFER),
        }
    }

    pub fn permission_granted(&self) -> bool {
        self.source.permission_granted()
    }

    /// Fresh, not yet registered stream of fixes at most every `interval`.
    pub fn stream(&self, interval: Duration) -> LocationStream {
        // ---
        LocationStream {
            state: StreamState::Idle {
                source: Arc::clone(&self.source),
                request: LocationRequest::high_accuracy(interval),
                buffer: self.buffer,
            },
        }
    }

    /// Best-effort single read of the platform's cached fix.
    pub async fn last_known_location(&self) -> Option<LocationSample> {
        // ---
        if !self.source.permission_granted() {
            return None;
        }

        match self.source.last_location().await {
            Ok(Some(sample)) => {
                debug!(
                    "Last known location: {}, {}",
                    sample.latitude, sample.longitude
                );
                Some(sample)
            }
            Ok(None) => {
                debug!("No last known location cached");
                None
            }
            Err(e) => {
                warn!("Failed to read last known location: {}", e);
                None
            }
        }
    }
}

enum StreamState {
    Idle {
        source: Arc<dyn LocationSource>,
        request: LocationRequest,
        buffer: usize,
    },
    Active {
        rx: mpsc::Receiver<PlatformEvent>,
        // Held for its Drop
        _registration: Registration,
    },
    Done,
}

/// Infinite stream of fixes; registers with the platform on first poll.
///
/// Ends after the first error. Once ended or closed it never yields again;
/// call [`LocationProvider::stream`] for a new one.
pub struct LocationStream {
    state: StreamState,
}

impl LocationStream {
    /// Stop the stream and release the platform subscription now.
    pub fn close(&mut self) {
        self.state = StreamState::Done;
    }

    /// True while registered with the platform.
    pub fn is_active(&self) -> bool {
        matches!(self.state, StreamState::Active { .. })
    }

    fn register(
        source: Arc<dyn LocationSource>,
        request: LocationRequest,
        buffer: usize,
    ) -> Result<StreamState, LocationError> {
        // ---
        if !source.permission_granted() {
            error!("Location permission missing, not starting updates");
            return Err(LocationError::PermissionDenied);
        }

        let (tx, rx) = mpsc::channel(buffer);
        let id = source.request_updates(request, LocationSink { tx })?;
        info!(
            "Location updates registered ({:?}, every {:?}) as {:?}",
            request.priority, request.interval, id
        );

        Ok(StreamState::Active {
            rx,
            _registration: Registration { source, id },
        })
    }
}

impl Stream for LocationStream {
    type Item = Result<LocationSample, LocationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // ---
        let this = self.get_mut();

        if let StreamState::Idle { .. } = this.state {
            let StreamState::Idle {
                source,
                request,
                buffer,
            } = std::mem::replace(&mut this.state, StreamState::Done)
            else {
                unreachable!("state checked above");
            };

            match Self::register(source, request, buffer) {
                Ok(active) => this.state = active,
                Err(e) => return Poll::Ready(Some(Err(e))),
            }
        }

        loop {
            let StreamState::Active { rx, .. } = &mut this.state else {
                return Poll::Ready(None);
            };

            match rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    debug!("Platform source hung up, ending location stream");
                    this.state = StreamState::Done;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(PlatformEvent::Fix(Some(sample)))) => {
                    debug!(
                        "Location fix: lat={}, lon={}",
                        sample.latitude, sample.longitude
                    );
                    return Poll::Ready(Some(Ok(sample)));
                }
                Poll::Ready(Some(PlatformEvent::Fix(None))) => {
                    warn!("Location result arrived without a usable fix, skipping");
                }
                Poll::Ready(Some(PlatformEvent::Availability(available))) => {
                    if available {
                        debug!("Location hardware available");
                    } else {
                        warn!("Location reported unavailable");
                    }
                }
                Poll::Ready(Some(PlatformEvent::Failed(message))) => {
                    error!("Location provider failed: {}", message);
                    this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(LocationError::Provider(message))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Utc;
    use futures::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Source that hands the sink to the test so it can play the platform.
    #[derive(Default)]
    struct ManualSource {
        denied: bool,
        fail_registration: bool,
        next_id: AtomicU64,
        sinks: Mutex<Vec<(SubscriptionId, LocationSink)>>,
        requests: Mutex<Vec<LocationRequest>>,
        removed: Mutex<Vec<SubscriptionId>>,
    }

    impl ManualSource {
        fn sink(&self) -> LocationSink {
            self.sinks.lock().unwrap().last().unwrap().1.clone()
        }

        fn removed(&self) -> usize {
            self.removed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LocationSource for ManualSource {
        fn permission_granted(&self) -> bool {
            !self.denied
        }

        fn request_updates(
            &self,
            request: LocationRequest,
            sink: LocationSink,
        ) -> Result<SubscriptionId, LocationError> {
            if self.fail_registration {
                return Err(LocationError::Registration("no provider".into()));
            }
            self.requests.lock().unwrap().push(request);
            let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.sinks.lock().unwrap().push((id, sink));
            Ok(id)
        }

        fn remove_updates(&self, id: SubscriptionId) {
            self.removed.lock().unwrap().push(id);
        }

        async fn last_location(&self) -> Result<Option<LocationSample>, LocationError> {
            Ok(Some(LocationSample::new(1.0, 2.0, Utc::now())))
        }
    }

    fn sample(lat: f64) -> LocationSample {
        LocationSample::new(lat, -3.7, Utc::now())
    }

    #[tokio::test]
    async fn stream_is_lazy_until_polled() {
        // ---
        let source = Arc::new(ManualSource::default());
        let provider = LocationProvider::new(source.clone());

        let mut stream = provider.stream(Duration::from_secs(5));
        assert!(!stream.is_active());
        assert!(source.sinks.lock().unwrap().is_empty());

        drop(stream.next().now_or_never());
        assert!(stream.is_active());
        assert_eq!(source.sinks.lock().unwrap().len(), 1);

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].priority, Priority::HighAccuracy);
        assert_eq!(requests[0].interval, Duration::from_secs(5));
        assert_eq!(requests[0].min_interval, Duration::from_secs(5));
    }

    #[test]
    fn buffer_is_clamped() {
        let source = Arc::new(ManualSource::default());
        assert_eq!(LocationProvider::with_buffer(source.clone(), 0).buffer, 1);
        assert_eq!(LocationProvider::with_buffer(source.clone(), usize::MAX).buffer, MAX_BUFFER);
        assert_eq!(LocationProvider::new(source).buffer, DEFAULT_BUFFER);
    }

    #[tokio::test]
    async fn denied_permission_fails_without_registering() {
        // ---
        let source = Arc::new(ManualSource {
            denied: true,
            ..Default::default()
        });
        let provider = LocationProvider::new(source.clone());
        let mut stream = provider.stream(Duration::from_secs(5));

        assert_eq!(stream.next().await, Some(Err(LocationError::PermissionDenied)));
        assert_eq!(stream.next().await, None);
        assert!(source.sinks.lock().unwrap().is_empty());
        assert_eq!(provider.last_known_location().await, None);
    }

    #[tokio::test]
    async fn skips_unusable_results_and_emits_fixes() {
        // ---
        let source = Arc::new(ManualSource::default());
        let provider = LocationProvider::new(source.clone());
        let mut stream = provider.stream(Duration::from_secs(5));
        drop(stream.next().now_or_never());

        let sink = source.sink();
        sink.on_availability(false);
        sink.on_location_result(None);
        sink.on_location_result(Some(sample(40.0)));
        sink.on_location_result(Some(sample(41.0)));

        assert_eq!(stream.next().await.unwrap().unwrap().latitude, 40.0);
        assert_eq!(stream.next().await.unwrap().unwrap().latitude, 41.0);
    }

    #[tokio::test]
    async fn full_buffer_drops_newest() {
        // ---
        let source = Arc::new(ManualSource::default());
        let provider = LocationProvider::with_buffer(source.clone(), 2);
        let mut stream = provider.stream(Duration::from_secs(5));
        drop(stream.next().now_or_never());

        let sink = source.sink();
        for lat in [1.0, 2.0, 3.0] {
            sink.on_location_result(Some(sample(lat)));
        }
        assert_eq!(stream.next().await.unwrap().unwrap().latitude, 1.0);
        assert_eq!(stream.next().await.unwrap().unwrap().latitude, 2.0);
        assert!(stream.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn every_exit_path_deregisters() {
        // ---
        let source = Arc::new(ManualSource::default());
        let provider = LocationProvider::new(source.clone());

        // Consumer drops the stream
        let mut dropped = provider.stream(Duration::from_secs(5));
        drop(dropped.next().now_or_never());
        drop(dropped);
        assert_eq!(source.removed(), 1);

        // Explicit close, and no restart afterwards
        let mut closed = provider.stream(Duration::from_secs(5));
        drop(closed.next().now_or_never());
        closed.close();
        assert_eq!(source.removed(), 2);
        assert_eq!(closed.next().await, None);

        // Provider error
        let mut failing = provider.stream(Duration::from_secs(5));
        drop(failing.next().now_or_never());
        source.sink().on_error("gps off");
        assert_eq!(
            failing.next().await,
            Some(Err(LocationError::Provider("gps off".into())))
        );
        assert_eq!(source.removed(), 3);
        assert_eq!(source.sinks.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn registration_failure_is_reported() {
        // ---
        let source = Arc::new(ManualSource {
            fail_registration: true,
            ..Default::default()
        });
        let provider = LocationProvider::new(source.clone());
        let mut stream = provider.stream(Duration::from_secs(5));

        assert!(matches!(
            stream.next().await,
            Some(Err(LocationError::Registration(_)))
        ));
        assert_eq!(stream.next().await, None);
        assert_eq!(source.removed(), 0);
    }

    #[tokio::test]
    async fn last_known_location_when_permitted() {
        // ---
        let provider = LocationProvider::new(Arc::new(ManualSource::default()));
        let last = provider.last_known_location().await.unwrap();
        assert_eq!((last.latitude, last.longitude), (1.0, 2.0));
    }
}
