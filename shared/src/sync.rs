//! Keeps a local snapshot of the incident list in step with the service.
//!
//! The engine polls on a fixed period while at least one observer holds a
//! receiver from [`SyncEngine::subscribe`], and accepts manual triggers in
//! between. At most one list request is outstanding at a time; triggers that
//! arrive while one is running are coalesced into it.

use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::client::RemoteClient;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, FetchError};
use crate::model::{prepare_snapshot, IncidentId, IncidentRecord, UnixTimeMs};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncState {
    /// Newest first by `created_at`.
    pub incidents: Vec<IncidentRecord>,
    /// Time of the last successful fetch.
    pub last_sync_at: Option<UnixTimeMs>,
    pub is_syncing: bool,
    /// Error of the most recent attempt, cleared by the next success.
    pub last_error: Option<FetchError>,
}

impl SyncState {
    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(FetchError::kind)
    }

    /// Nothing has been fetched yet and no attempt has failed.
    #[must_use]
    pub fn is_initial_load(&self) -> bool {
        self.last_sync_at.is_none() && self.last_error.is_none()
    }

    #[must_use]
    pub fn staleness(&self, now: UnixTimeMs) -> Option<Duration> {
        self.last_sync_at
            .map(|at| Duration::from_millis(now.saturating_sub(at)))
    }

    /// A snapshot that has never been fetched is stale.
    #[must_use]
    pub fn is_stale(&self, now: UnixTimeMs, threshold: Duration) -> bool {
        self.staleness(now).map_or(true, |age| age > threshold)
    }

    #[must_use]
    pub fn find(&self, id: &IncidentId) -> Option<&IncidentRecord> {
        self.incidents.iter().find(|record| record.id == *id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Timer,
    Manual,
    Simulation,
}

impl SyncTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
            Self::Simulation => "simulation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A fresh snapshot was published.
    Applied { count: usize },
    /// The attempt failed; the previous incidents are still published.
    Failed(ErrorKind),
    /// Another sync was already in flight and absorbed this trigger.
    Coalesced,
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub requests_issued: AtomicU64,
    pub snapshots_applied: AtomicU64,
    pub syncs_failed: AtomicU64,
    pub triggers_coalesced: AtomicU64,
    pub simulations_requested: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            triggers_coalesced: self.triggers_coalesced.load(Ordering::Relaxed),
            simulations_requested: self.simulations_requested.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub requests_issued: u64,
    pub snapshots_applied: u64,
    pub syncs_failed: u64,
    pub triggers_coalesced: u64,
    pub simulations_requested: u64,
}

// ============================================================================
// In-flight guard
// ============================================================================

/// Exclusive claim on the single list request. Dropping it clears the busy
/// flag and `is_syncing`, including when the sync future is cancelled.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    state_tx: &'a watch::Sender<SyncState>,
}

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool, state_tx: &'a watch::Sender<SyncState>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        state_tx.send_modify(|state| state.is_syncing = true);
        Some(Self { flag, state_tx })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state_tx
            .send_if_modified(|state| std::mem::replace(&mut state.is_syncing, false));
        self.flag.store(false, Ordering::Release);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The running poll loop, tagged with the epoch it was spawned under.
#[derive(Default)]
struct PollerSlot {
    epoch: u64,
    handle: Option<JoinHandle<()>>,
}

impl PollerSlot {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

pub struct SyncEngine<C: RemoteClient> {
    client: Arc<C>,
    config: SyncConfig,
    state_tx: watch::Sender<SyncState>,
    in_flight: AtomicBool,
    poller: Mutex<PollerSlot>,
    metrics: SyncMetrics,
}

impl<C: RemoteClient + 'static> SyncEngine<C> {
    pub fn new(client: Arc<C>, config: SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(SyncState::default());
        Self {
            client,
            config: config.clamped(),
            state_tx,
            in_flight: AtomicBool::new(false),
            poller: Mutex::new(PollerSlot::default()),
            metrics: SyncMetrics::default(),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state_tx.receiver_count()
    }

    /// Registers an observer and makes sure polling is running. Polling ends
    /// on the first tick after the last receiver is dropped.
    pub fn subscribe(self: &Arc<Self>) -> watch::Receiver<SyncState> {
        let receiver = self.state_tx.subscribe();
        self.start_polling();
        receiver
    }

    /// Fetches the full list once and publishes it. Returns
    /// [`SyncOutcome::Coalesced`] without issuing a request when another sync
    /// is still running.
    #[instrument(skip_all, fields(trigger = trigger.as_str()))]
    pub async fn sync_now(&self, trigger: SyncTrigger) -> SyncOutcome {
        let Some(guard) = InFlight::acquire(&self.in_flight, &self.state_tx) else {
            self.metrics.triggers_coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("sync already in flight, trigger coalesced");
            return SyncOutcome::Coalesced;
        };
        self.metrics.requests_issued.fetch_add(1, Ordering::Relaxed);

        let result = self
            .client
            .list_incidents()
            .await
            .and_then(prepare_snapshot);

        let outcome = match result {
            Ok(incidents) => {
                let count = incidents.len();
                let now = UnixTimeMs::now();
                self.state_tx.send_modify(|state| {
                    state.incidents = incidents;
                    state.last_sync_at = Some(now);
                    state.last_error = None;
                    state.is_syncing = false;
                });
                self.metrics.snapshots_applied.fetch_add(1, Ordering::Relaxed);
                info!(count, "incident snapshot applied");
                SyncOutcome::Applied { count }
            }
            Err(error) => {
                let kind = error.kind();
                warn!(error = %error, kind = kind.code(), "sync failed, keeping previous incidents");
                self.state_tx.send_modify(|state| {
                    state.last_error = Some(error);
                    state.is_syncing = false;
                });
                self.metrics.syncs_failed.fetch_add(1, Ordering::Relaxed);
                SyncOutcome::Failed(kind)
            }
        };

        drop(guard);
        outcome
    }

    pub async fn refresh(&self) -> SyncOutcome {
        self.sync_now(SyncTrigger::Manual).await
    }

    /// Asks the service to generate `count` incidents, then syncs. A failed
    /// simulation is recorded in `last_error` and no sync follows.
    #[instrument(skip(self))]
    pub async fn simulate(&self, count: NonZeroU32) -> SyncOutcome {
        self.metrics
            .simulations_requested
            .fetch_add(1, Ordering::Relaxed);

        if let Err(error) = self.client.simulate_incidents(count).await {
            let kind = error.kind();
            warn!(error = %error, "simulation request failed");
            self.state_tx.send_modify(|state| state.last_error = Some(error));
            return SyncOutcome::Failed(kind);
        }
        self.sync_now(SyncTrigger::Simulation).await
    }

    /// Spawns the poll loop on the current Tokio runtime. Returns `false` when
    /// a loop is already running or there is no runtime.
    pub fn start_polling(self: &Arc<Self>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no Tokio runtime available, polling not started");
            return false;
        };

        let mut slot = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_running() {
            return false;
        }

        let period = self.config.poll_interval;
        slot.epoch += 1;
        let epoch = slot.epoch;
        slot.handle = Some(runtime.spawn(poll_loop(Arc::downgrade(self), period, epoch)));
        info!(interval = ?period, epoch, "polling started");
        true
    }

    /// Cancels the poll loop, including a sync it has in flight.
    pub fn stop_polling(&self) -> bool {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                info!("polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_running()
    }

    /// Called by the loop spawned under `epoch` once it sees no receivers.
    /// Decided under the poller lock: either a concurrent `subscribe` finds
    /// the slot empty and spawns a new loop, or this one keeps running.
    fn retire_idle_poller(&self, epoch: u64) -> bool {
        let mut slot = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state_tx.receiver_count() > 0 {
            return false;
        }
        if slot.epoch == epoch {
            slot.handle = None;
        }
        true
    }
}

impl<C: RemoteClient> Drop for SyncEngine<C> {
    fn drop(&mut self) {
        let slot = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }
}

/// Ticks immediately, then every `period`. Holds only a weak reference
/// between ticks so dropping the engine ends the loop.
async fn poll_loop<C: RemoteClient + 'static>(
    engine: Weak<SyncEngine<C>>,
    period: Duration,
    epoch: u64,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(engine) = engine.upgrade() else {
            debug!("engine dropped, poll loop exiting");
            break;
        };
        if engine.state_tx.receiver_count() == 0 && engine.retire_idle_poller(epoch) {
            info!("no subscribers left, polling stopped");
            break;
        }
        engine.sync_now(SyncTrigger::Timer).await;
    }
}
