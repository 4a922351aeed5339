//! Scripted in-memory [`RemoteClient`] with call counters, injectable
//! failures and gates that hold a call open until the test releases it.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

use crate::client::RemoteClient;
use crate::error::FetchError;
use crate::model::{
    AuditEntry, Details, DispatchDecision, IncidentId, IncidentRecord, IncidentStatus, Urgency,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blocks callers until permits are added. Closing the gate lets every
/// pending and future caller through.
#[derive(Clone, Default)]
struct Gate(Option<Arc<Semaphore>>);

impl Gate {
    fn held() -> Self {
        Self(Some(Arc::new(Semaphore::new(0))))
    }

    async fn pass(&self) {
        if let Some(semaphore) = &self.0 {
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }
    }

    fn release(&self, n: usize) {
        if let Some(semaphore) = &self.0 {
            semaphore.add_permits(n);
        }
    }

    fn open(&self) {
        if let Some(semaphore) = &self.0 {
            semaphore.close();
        }
    }
}

#[derive(Default)]
pub struct ScriptedClient {
    incidents: Mutex<Vec<IncidentRecord>>,
    list_failures: Mutex<VecDeque<FetchError>>,
    get_failures: Mutex<HashMap<IncidentId, FetchError>>,
    simulate_failure: Mutex<Option<FetchError>>,
    list_gate: Mutex<Gate>,
    record_gates: Mutex<HashMap<IncidentId, Gate>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    simulate_calls: AtomicUsize,
    action_calls: AtomicUsize,
    simulated: AtomicUsize,
}

impl ScriptedClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_incidents(incidents: Vec<IncidentRecord>) -> Self {
        let client = Self::new();
        client.set_incidents(incidents);
        client
    }

    pub fn set_incidents(&self, incidents: Vec<IncidentRecord>) {
        *lock(&self.incidents) = incidents;
    }

    /// The next `list_incidents` call fails with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next_list(&self, error: FetchError) {
        lock(&self.list_failures).push_back(error);
    }

    pub fn fail_get(&self, id: impl Into<IncidentId>, error: FetchError) {
        lock(&self.get_failures).insert(id.into(), error);
    }

    pub fn fail_simulation(&self, error: FetchError) {
        *lock(&self.simulate_failure) = Some(error);
    }

    /// Holds every subsequent `list_incidents` call until released.
    pub fn hold_lists(&self) {
        *lock(&self.list_gate) = Gate::held();
    }

    pub fn release_lists(&self, n: usize) {
        lock(&self.list_gate).release(n);
    }

    pub fn open_lists(&self) {
        let gate = std::mem::take(&mut *lock(&self.list_gate));
        gate.open();
    }

    /// Holds per-incident calls (`get`, dispatch actions) for `id`.
    pub fn hold_incident(&self, id: impl Into<IncidentId>) {
        lock(&self.record_gates).insert(id.into(), Gate::held());
    }

    pub fn release_incident(&self, id: &IncidentId) {
        if let Some(gate) = lock(&self.record_gates).remove(id) {
            gate.open();
        }
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn simulate_calls(&self) -> usize {
        self.simulate_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn action_calls(&self) -> usize {
        self.action_calls.load(Ordering::SeqCst)
    }

    fn record_gate(&self, id: &IncidentId) -> Gate {
        lock(&self.record_gates).get(id).cloned().unwrap_or_default()
    }

    fn update_record<F>(&self, id: &IncidentId, apply: F) -> Result<IncidentRecord, FetchError>
    where
        F: FnOnce(&mut IncidentRecord),
    {
        let mut incidents = lock(&self.incidents);
        let record = incidents
            .iter_mut()
            .find(|r| r.id == *id)
            .ok_or_else(|| FetchError::not_found(id.as_str()))?;
        apply(record);
        Ok(record.clone())
    }

    fn synthesize(&self) -> IncidentRecord {
        let n = self.simulated.fetch_add(1, Ordering::SeqCst);
        let created_at = format!(
            "2030-01-01T{:02}:{:02}:{:02}Z",
            (n / 3600) % 24,
            (n / 60) % 60,
            n % 60
        );
        IncidentRecord::new(
            format!("sim-{n}"),
            "Multiple injuries after road accident",
            Urgency::Critical,
            created_at,
        )
        .with_symptoms(["trauma", "bleeding"])
        .with_location(23.2599, 77.4126)
    }
}

fn audit(event: &str, details: Details) -> AuditEntry {
    AuditEntry {
        event: event.to_string(),
        timestamp: "2030-01-02T00:00:00Z".to_string(),
        details,
    }
}

#[async_trait::async_trait]
impl RemoteClient for ScriptedClient {
    async fn list_incidents(&self) -> Result<Vec<IncidentRecord>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.list_gate).clone();
        gate.pass().await;

        if let Some(error) = lock(&self.list_failures).pop_front() {
            return Err(error);
        }
        Ok(lock(&self.incidents).clone())
    }

    async fn get_incident(&self, id: &IncidentId) -> Result<IncidentRecord, FetchError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.record_gate(id).pass().await;

        if let Some(error) = lock(&self.get_failures).get(id).cloned() {
            return Err(error);
        }
        lock(&self.incidents)
            .iter()
            .find(|r| r.id == *id)
            .cloned()
            .ok_or_else(|| FetchError::not_found(id.as_str()))
    }

    async fn simulate_incidents(&self, count: NonZeroU32) -> Result<(), FetchError> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.simulate_failure).clone() {
            return Err(error);
        }
        let fresh: Vec<_> = (0..count.get()).map(|_| self.synthesize()).collect();
        lock(&self.incidents).extend(fresh);
        Ok(())
    }

    async fn confirm_dispatch(
        &self,
        id: &IncidentId,
        decision: &DispatchDecision,
    ) -> Result<IncidentRecord, FetchError> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        self.record_gate(id).pass().await;
        self.update_record(id, |record| {
            record.dispatch_decision = Some(decision.clone());
            record.dispatch_confirmed = true;
            record.status = Some(IncidentStatus::DispatchConfirmed);
            record
                .audit_log
                .push(audit("DISPATCH_CONFIRMED", decision.0.clone()));
        })
    }

    async fn override_dispatch(
        &self,
        id: &IncidentId,
        reason: &str,
    ) -> Result<IncidentRecord, FetchError> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        self.record_gate(id).pass().await;
        self.update_record(id, |record| {
            record.dispatch_confirmed = false;
            record.status = Some(IncidentStatus::DispatchOverridden);
            record.override_reason = Some(reason.to_string());
            let mut details = Details::new();
            details.insert("reason".into(), reason.into());
            record.audit_log.push(audit("DISPATCH_OVERRIDDEN", details));
        })
    }
}

/// Yields to the scheduler until `condition` holds. Panics after a bounded
/// number of rounds so a broken test fails instead of hanging.
pub async fn yield_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached while yielding");
}
