use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use nest_types::models::{AlertRole, LocationSample};

use crate::error::RealtimeError;
use crate::store::{LocationStore, LocationTarget};

/// Device sensor failures. Codes follow the platform geolocation API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
}

impl LocationError {
    pub fn code(self) -> u16 {
        match self {
            Self::PermissionDenied => 1,
            Self::PositionUnavailable => 2,
            Self::Timeout => 3,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::PermissionDenied),
            2 => Some(Self::PositionUnavailable),
            3 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Human-readable explanation shown once when tracking stops.
    pub fn reason(self) -> &'static str {
        match self {
            Self::PermissionDenied => "Location access was denied. Allow it in settings to share where you are.",
            Self::PositionUnavailable => "Your location is unavailable right now.",
            Self::Timeout => "Finding your location took too long.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix a one-shot read will accept.
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::ZERO,
        }
    }
}

/// Source of device position fixes.
pub trait LocationProvider: Send + Sync {
    /// Continuous watch. Dropping the stream cancels it.
    fn watch(&self, options: &WatchOptions) -> BoxStream<'static, Result<LocationSample, LocationError>>;
}

/// Provider fed by hand: simulators, tests and platforms that push fixes in.
#[derive(Default)]
pub struct ManualLocationProvider {
    watchers: Mutex<Vec<mpsc::UnboundedSender<Result<LocationSample, LocationError>>>>,
}

impl ManualLocationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a fix to every live watch. Returns how many received it.
    pub fn push(&self, sample: LocationSample) -> usize {
        self.deliver(Ok(sample))
    }

    pub fn fail(&self, error: LocationError) -> usize {
        self.deliver(Err(error))
    }

    fn deliver(&self, reading: Result<LocationSample, LocationError>) -> usize {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| tx.send(reading).is_ok());
        watchers.len()
    }

    pub fn active_watches(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }
}

impl LocationProvider for ManualLocationProvider {
    fn watch(&self, _options: &WatchOptions) -> BoxStream<'static, Result<LocationSample, LocationError>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        async_stream::stream! {
            while let Some(reading) = rx.recv().await {
                yield reading;
            }
        }
        .boxed()
    }
}

/// One-shot position read bounded by `options.timeout`.
pub async fn current_position(
    provider: &dyn LocationProvider,
    options: &WatchOptions,
) -> Result<LocationSample, LocationError> {
    let mut stream = provider.watch(options);
    let too_old = |sample: &LocationSample| {
        !options.maximum_age.is_zero()
            && (Utc::now() - sample.timestamp).to_std().unwrap_or_default() > options.maximum_age
    };

    let first = async {
        while let Some(reading) = stream.next().await {
            match reading {
                Ok(sample) if too_old(&sample) => {
                    trace!("skipping cached fix from {}", sample.timestamp);
                }
                other => return other,
            }
        }
        Err(LocationError::PositionUnavailable)
    };

    match tokio::time::timeout(options.timeout, first).await {
        Ok(result) => result,
        Err(_) => Err(LocationError::Timeout),
    }
}

/// Whether and where to share live location.
#[derive(Debug, Clone)]
pub struct TrackingRequest {
    pub enabled: bool,
    pub alert_id: Option<Uuid>,
    pub role: AlertRole,
    /// Signed-in user doing the tracking.
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Idle,
    Tracking,
}

#[derive(Debug, Clone)]
pub struct TrackingState {
    pub status: TrackingStatus,
    pub last_sample: Option<LocationSample>,
    pub last_error: Option<LocationError>,
}

#[derive(Default)]
struct UpdaterStats {
    samples: AtomicU64,
    writes_failed: AtomicU64,
}

/// Streams device location into the alert row for one (alert, role, actor)
/// while it is alive.
pub struct LocationUpdater {
    target: LocationTarget,
    state: watch::Receiver<TrackingState>,
    stats: Arc<UpdaterStats>,
    task: JoinHandle<()>,
}

impl LocationUpdater {
    /// `Ok(None)` when tracking is off or there is no alert to track for.
    pub fn start(
        provider: Arc<dyn LocationProvider>,
        store: Arc<dyn LocationStore>,
        request: TrackingRequest,
        options: WatchOptions,
    ) -> Result<Option<Self>, RealtimeError> {
        let alert_id = match request.alert_id {
            Some(alert_id) if request.enabled => alert_id,
            _ => return Ok(None),
        };
        let actor_id = request.actor_id.ok_or(RealtimeError::AuthRequired)?;

        let target = LocationTarget {
            alert_id,
            role: request.role,
            actor_id,
        };
        let (state_tx, state) = watch::channel(TrackingState {
            status: TrackingStatus::Tracking,
            last_sample: None,
            last_error: None,
        });
        let stats = Arc::new(UpdaterStats::default());

        let stream = provider.watch(&options);
        info!(
            "tracking location for alert {} as {:?} {}",
            alert_id, target.role, actor_id
        );
        let task = tokio::spawn(run(stream, store, target.clone(), state_tx, stats.clone()));

        Ok(Some(Self {
            target,
            state,
            stats,
            task,
        }))
    }

    pub fn target(&self) -> &LocationTarget {
        &self.target
    }

    pub fn state(&self) -> TrackingState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<TrackingState> {
        self.state.clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.state.borrow().status == TrackingStatus::Tracking
    }

    /// Samples received, each of which triggered one write attempt.
    pub fn samples(&self) -> u64 {
        self.stats.samples.load(Ordering::Relaxed)
    }

    pub fn writes_failed(&self) -> u64 {
        self.stats.writes_failed.load(Ordering::Relaxed)
    }
}

impl Drop for LocationUpdater {
    fn drop(&mut self) {
        self.task.abort();
        debug!("location watch for alert {} cancelled", self.target.alert_id);
    }
}

async fn run(
    mut stream: BoxStream<'static, Result<LocationSample, LocationError>>,
    store: Arc<dyn LocationStore>,
    target: LocationTarget,
    state_tx: watch::Sender<TrackingState>,
    stats: Arc<UpdaterStats>,
) {
    while let Some(reading) = stream.next().await {
        match reading {
            Ok(sample) => {
                // Only helper rows carry accuracy
                let sample = match target.role {
                    AlertRole::Helper => sample,
                    AlertRole::Requester => LocationSample { accuracy: None, ..sample },
                };
                trace!(
                    "location fix {:.5},{:.5} for alert {}",
                    sample.latitude, sample.longitude, target.alert_id
                );
                state_tx.send_modify(|state| state.last_sample = Some(sample));
                stats.samples.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = store.write_location(&target, &sample).await {
                    stats.writes_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("location write for alert {} failed: {}", target.alert_id, e);
                }
            }
            Err(error) => {
                warn!(
                    "location watch for alert {} stopped: {}",
                    target.alert_id,
                    error.reason()
                );
                state_tx.send_modify(|state| {
                    state.status = TrackingStatus::Idle;
                    state.last_error = Some(error);
                });
                return;
            }
        }
    }
    state_tx.send_modify(|state| state.status = TrackingStatus::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(LocationTarget, LocationSample)>>,
    }

    #[async_trait]
    impl LocationStore for Recorder {
        async fn write_location(&self, target: &LocationTarget, sample: &LocationSample) -> Result<(), RealtimeError> {
            self.writes.lock().unwrap().push((target.clone(), *sample));
            Ok(())
        }
    }

    fn request(role: AlertRole) -> TrackingRequest {
        TrackingRequest {
            enabled: true,
            alert_id: Some(Uuid::new_v4()),
            role,
            actor_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn error_codes_round_trip() {
        for error in [LocationError::PermissionDenied, LocationError::PositionUnavailable, LocationError::Timeout] {
            assert_eq!(LocationError::from_code(error.code()), Some(error));
        }
        assert_eq!(LocationError::from_code(9), None);
    }

    #[tokio::test]
    async fn disabled_or_missing_alert_does_nothing() {
        let provider = Arc::new(ManualLocationProvider::new());
        let store = Arc::new(Recorder::default());

        let mut off = request(AlertRole::Helper);
        off.enabled = false;
        assert!(LocationUpdater::start(provider.clone(), store.clone(), off, WatchOptions::default())
            .unwrap()
            .is_none());

        let mut no_alert = request(AlertRole::Helper);
        no_alert.alert_id = None;
        assert!(LocationUpdater::start(provider.clone(), store, no_alert, WatchOptions::default())
            .unwrap()
            .is_none());
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test]
    async fn signed_out_actor_is_rejected() {
        let mut req = request(AlertRole::Requester);
        req.actor_id = None;
        let result = LocationUpdater::start(
            Arc::new(ManualLocationProvider::new()),
            Arc::new(Recorder::default()),
            req,
            WatchOptions::default(),
        );
        assert!(matches!(result, Err(RealtimeError::AuthRequired)));
    }

    #[tokio::test]
    async fn requester_writes_drop_accuracy() {
        let provider = Arc::new(ManualLocationProvider::new());
        let store = Arc::new(Recorder::default());
        let updater = LocationUpdater::start(
            provider.clone(),
            store.clone(),
            request(AlertRole::Requester),
            WatchOptions::default(),
        )
        .unwrap()
        .unwrap();

        provider.push(LocationSample::new(51.5, -0.12).with_accuracy(8.0));
        let mut state = updater.watch_state();
        state.wait_for(|s| s.last_sample.is_some()).await.unwrap();
        tokio::task::yield_now().await;

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1.accuracy, None);
    }

    #[tokio::test]
    async fn sensor_error_goes_idle_once() {
        let provider = Arc::new(ManualLocationProvider::new());
        let updater = LocationUpdater::start(
            provider.clone(),
            Arc::new(Recorder::default()),
            request(AlertRole::Helper),
            WatchOptions::default(),
        )
        .unwrap()
        .unwrap();

        provider.fail(LocationError::PermissionDenied);
        let mut state = updater.watch_state();
        let idle = state
            .wait_for(|s| s.status == TrackingStatus::Idle)
            .await
            .unwrap()
            .clone();
        assert_eq!(idle.last_error, Some(LocationError::PermissionDenied));
        assert!(!updater.is_tracking());
    }

    #[tokio::test]
    async fn drop_cancels_the_watch() {
        let provider = Arc::new(ManualLocationProvider::new());
        let updater = LocationUpdater::start(
            provider.clone(),
            Arc::new(Recorder::default()),
            request(AlertRole::Helper),
            WatchOptions::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(provider.active_watches(), 1);

        drop(updater);
        for _ in 0..10 {
            if provider.active_watches() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_read_times_out() {
        let provider = ManualLocationProvider::new();
        let result = current_position(&provider, &WatchOptions::default()).await;
        assert_eq!(result, Err(LocationError::Timeout));
    }

    #[tokio::test]
    async fn one_shot_read_returns_first_fix() {
        let provider = Arc::new(ManualLocationProvider::new());
        let reader = {
            let provider = provider.clone();
            tokio::spawn(async move { current_position(provider.as_ref(), &WatchOptions::default()).await })
        };
        while provider.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
        provider.push(LocationSample::new(1.0, 2.0));
        let sample = reader.await.unwrap().unwrap();
        assert_eq!((sample.latitude, sample.longitude), (1.0, 2.0));
    }
}
