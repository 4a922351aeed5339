//! Fetch lifecycle for the single-incident view.
//!
//! Every `open` or `close` bumps a generation counter stored alongside the
//! state. A fetch applies its result only if the generation it started under
//! is still current, so a slow response for an incident the user has already
//! navigated away from can never overwrite the one on screen.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::client::RemoteClient;
use crate::error::{ErrorKind, FetchError};
use crate::model::{DispatchDecision, IncidentId, IncidentRecord};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailPhase {
    Idle,
    Loading,
    Loaded,
    NotFound,
    Errored,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailState {
    pub requested_id: Option<IncidentId>,
    pub record: Option<IncidentRecord>,
    pub is_loading: bool,
    pub not_found: bool,
    /// Load failure, or the failure of the last dispatch action on a loaded
    /// record.
    pub last_error: Option<FetchError>,
    pub action_pending: bool,
    pub generation: u64,
}

impl DetailState {
    #[must_use]
    pub fn phase(&self) -> DetailPhase {
        if self.requested_id.is_none() {
            DetailPhase::Idle
        } else if self.is_loading {
            DetailPhase::Loading
        } else if self.not_found {
            DetailPhase::NotFound
        } else if self.record.is_some() {
            DetailPhase::Loaded
        } else if self.last_error.is_some() {
            DetailPhase::Errored
        } else {
            DetailPhase::Idle
        }
    }

    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(FetchError::kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailOutcome {
    Loaded,
    NotFound,
    Failed(ErrorKind),
    /// The result arrived after the view moved on and was dropped.
    Discarded,
    /// Nothing to act on: no record loaded or an action already running.
    Ignored,
}

// ============================================================================
// Action claim
// ============================================================================

/// Exclusive claim on the dispatch action for the record loaded under
/// `generation`. Dropping it clears `action_pending` while that generation is
/// still current, including when the action future is cancelled.
struct ActionClaim<'a> {
    state_tx: &'a watch::Sender<DetailState>,
    id: IncidentId,
    generation: u64,
}

impl Drop for ActionClaim<'_> {
    fn drop(&mut self) {
        self.state_tx.send_if_modified(|state| {
            state.generation == self.generation
                && std::mem::replace(&mut state.action_pending, false)
        });
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct DetailLoader<C: RemoteClient> {
    client: Arc<C>,
    state_tx: watch::Sender<DetailState>,
}

impl<C: RemoteClient> DetailLoader<C> {
    pub fn new(client: Arc<C>) -> Self {
        let (state_tx, _) = watch::channel(DetailState::default());
        Self { client, state_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<DetailState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> DetailState {
        self.state_tx.borrow().clone()
    }

    /// Switches the view to `id`. The previous record is cleared before the
    /// request is issued.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn open(&self, id: IncidentId) -> DetailOutcome {
        let generation = self.reset(Some(id.clone()));

        if id.is_blank() {
            self.state_tx.send_modify(|state| {
                state.is_loading = false;
                state.not_found = true;
            });
            return DetailOutcome::NotFound;
        }

        let result = self.client.get_incident(&id).await;
        let outcome = match &result {
            Ok(_) => DetailOutcome::Loaded,
            Err(FetchError::NotFound { .. }) => DetailOutcome::NotFound,
            Err(error) => DetailOutcome::Failed(error.kind()),
        };

        let applied = self.state_tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.is_loading = false;
            match result {
                Ok(record) => state.record = Some(record),
                Err(FetchError::NotFound { .. }) => state.not_found = true,
                Err(error) => {
                    warn!(error = %error, "incident load failed");
                    state.last_error = Some(error);
                }
            }
            true
        });

        if applied {
            debug!(?outcome, "detail state settled");
            outcome
        } else {
            debug!(generation, "stale incident result discarded");
            DetailOutcome::Discarded
        }
    }

    /// Fetches the current incident again.
    pub async fn reload(&self) -> DetailOutcome {
        let current = self.state_tx.borrow().requested_id.clone();
        match current {
            Some(id) => self.open(id).await,
            None => DetailOutcome::Ignored,
        }
    }

    /// Leaves the view. Results still in flight are discarded.
    pub fn close(&self) {
        self.reset(None);
    }

    #[instrument(skip_all)]
    pub async fn confirm_dispatch(&self, decision: &DispatchDecision) -> DetailOutcome {
        let Some(claim) = self.claim_action() else {
            return DetailOutcome::Ignored;
        };
        info!(id = %claim.id, "confirming dispatch");
        let result = self.client.confirm_dispatch(&claim.id, decision).await;
        self.finish_action(claim, result)
    }

    #[instrument(skip_all)]
    pub async fn override_dispatch(&self, reason: &str) -> DetailOutcome {
        let Some(claim) = self.claim_action() else {
            return DetailOutcome::Ignored;
        };
        info!(id = %claim.id, "overriding dispatch");
        let result = self.client.override_dispatch(&claim.id, reason).await;
        self.finish_action(claim, result)
    }

    /// Starts a new generation with a fresh state.
    fn reset(&self, requested_id: Option<IncidentId>) -> u64 {
        let mut generation = 0;
        self.state_tx.send_modify(|state| {
            generation = state.generation + 1;
            *state = DetailState {
                is_loading: requested_id.is_some(),
                requested_id,
                generation,
                ..DetailState::default()
            };
        });
        generation
    }

    fn claim_action(&self) -> Option<ActionClaim<'_>> {
        let mut claim = None;
        self.state_tx.send_if_modified(|state| match &state.record {
            Some(record) if !state.action_pending => {
                claim = Some(ActionClaim {
                    state_tx: &self.state_tx,
                    id: record.id.clone(),
                    generation: state.generation,
                });
                state.action_pending = true;
                state.last_error = None;
                true
            }
            _ => false,
        });
        if claim.is_none() {
            debug!("no loaded incident or action already pending");
        }
        claim
    }

    fn finish_action(
        &self,
        claim: ActionClaim<'_>,
        result: Result<IncidentRecord, FetchError>,
    ) -> DetailOutcome {
        let generation = claim.generation;
        let outcome = match &result {
            Ok(_) => DetailOutcome::Loaded,
            Err(error) => DetailOutcome::Failed(error.kind()),
        };

        let applied = self.state_tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.action_pending = false;
            match result {
                Ok(record) => state.record = Some(record),
                Err(error) => {
                    warn!(error = %error, "dispatch action failed");
                    state.last_error = Some(error);
                }
            }
            true
        });
        drop(claim);

        if applied {
            outcome
        } else {
            debug!(generation, "stale dispatch result discarded");
            DetailOutcome::Discarded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IncidentStatus, Urgency};
    use crate::testing::{yield_until, ScriptedClient};

    fn client() -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::with_incidents(vec![
            IncidentRecord::new("a", "Fall from ladder", Urgency::High, "2024-01-01T10:00:00Z"),
            IncidentRecord::new("b", "Allergic reaction", Urgency::Critical, "2024-01-01T11:00:00Z"),
        ]))
    }

    fn loaded_id(state: &DetailState) -> Option<&str> {
        state.record.as_ref().map(|r| r.id.as_str())
    }

    mod load_tests {
        use super::*;

        #[tokio::test]
        async fn test_starts_idle() {
            let loader = DetailLoader::new(client());
            assert_eq!(loader.state().phase(), DetailPhase::Idle);
        }

        #[tokio::test]
        async fn test_open_loads_record() {
            let loader = DetailLoader::new(client());

            assert_eq!(loader.open("a".into()).await, DetailOutcome::Loaded);

            let state = loader.state();
            assert_eq!(state.phase(), DetailPhase::Loaded);
            assert_eq!(loaded_id(&state), Some("a"));
            assert!(!state.is_loading);
            assert!(state.last_error.is_none());
        }

        #[tokio::test]
        async fn test_missing_id_is_not_found() {
            let loader = DetailLoader::new(client());

            assert_eq!(loader.open("missing-id".into()).await, DetailOutcome::NotFound);

            let state = loader.state();
            assert!(state.not_found);
            assert!(state.record.is_none());
            assert!(state.last_error.is_none());
            assert_eq!(state.phase(), DetailPhase::NotFound);
        }

        #[tokio::test]
        async fn test_blank_id_skips_request() {
            let client = client();
            let loader = DetailLoader::new(Arc::clone(&client));

            assert_eq!(loader.open("  ".into()).await, DetailOutcome::NotFound);
            assert_eq!(client.get_calls(), 0);
        }

        #[tokio::test]
        async fn test_other_failures_are_errored() {
            let client = client();
            client.fail_get(
                "a",
                FetchError::Server {
                    status: 500,
                    message: "db down".into(),
                },
            );
            let loader = DetailLoader::new(Arc::clone(&client));

            let outcome = loader.open("a".into()).await;

            assert_eq!(outcome, DetailOutcome::Failed(ErrorKind::Server));
            let state = loader.state();
            assert_eq!(state.phase(), DetailPhase::Errored);
            assert!(!state.not_found);
            assert_eq!(state.last_error_kind(), Some(ErrorKind::Server));
        }

        #[tokio::test]
        async fn test_reload_refetches_current_id() {
            let client = client();
            let loader = DetailLoader::new(Arc::clone(&client));
            assert_eq!(loader.reload().await, DetailOutcome::Ignored);

            loader.open("a".into()).await;
            assert_eq!(loader.reload().await, DetailOutcome::Loaded);
            assert_eq!(client.get_calls(), 2);
        }

        #[tokio::test]
        async fn test_close_returns_to_idle() {
            let loader = DetailLoader::new(client());
            loader.open("a".into()).await;
            let before = loader.state().generation;

            loader.close();

            let state = loader.state();
            assert_eq!(state.phase(), DetailPhase::Idle);
            assert!(state.record.is_none());
            assert!(state.generation > before);
        }
    }

    mod race_tests {
        use super::*;

        #[tokio::test]
        async fn test_switching_clears_previous_record_immediately() {
            let client = client();
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));
            loader.open("a".into()).await;
            client.hold_incident("b");

            let pending = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.open("b".into()).await }
            });
            yield_until(|| client.get_calls() == 2).await;

            let state = loader.state();
            assert_eq!(state.phase(), DetailPhase::Loading);
            assert_eq!(state.requested_id, Some(IncidentId::new("b")));
            assert!(state.record.is_none());

            client.release_incident(&IncidentId::new("b"));
            assert_eq!(pending.await.unwrap(), DetailOutcome::Loaded);
            assert_eq!(loaded_id(&loader.state()), Some("b"));
        }

        #[tokio::test]
        async fn test_slow_first_response_is_discarded() {
            let client = client();
            client.hold_incident("a");
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));

            let slow = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.open("a".into()).await }
            });
            yield_until(|| client.get_calls() == 1).await;

            assert_eq!(loader.open("b".into()).await, DetailOutcome::Loaded);
            client.release_incident(&IncidentId::new("a"));

            assert_eq!(slow.await.unwrap(), DetailOutcome::Discarded);
            let state = loader.state();
            assert_eq!(loaded_id(&state), Some("b"));
            assert_eq!(state.requested_id, Some(IncidentId::new("b")));
        }

        #[tokio::test]
        async fn test_stale_result_leaves_new_request_loading() {
            let client = client();
            client.hold_incident("a");
            client.hold_incident("b");
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));

            let first = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.open("a".into()).await }
            });
            yield_until(|| client.get_calls() == 1).await;
            let second = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.open("b".into()).await }
            });
            yield_until(|| client.get_calls() == 2).await;

            client.release_incident(&IncidentId::new("a"));
            assert_eq!(first.await.unwrap(), DetailOutcome::Discarded);
            let state = loader.state();
            assert_eq!(state.phase(), DetailPhase::Loading);
            assert!(state.record.is_none());

            client.release_incident(&IncidentId::new("b"));
            assert_eq!(second.await.unwrap(), DetailOutcome::Loaded);
            assert_eq!(loaded_id(&loader.state()), Some("b"));
        }

        #[tokio::test]
        async fn test_close_discards_in_flight_load() {
            let client = client();
            client.hold_incident("a");
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));

            let pending = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.open("a".into()).await }
            });
            yield_until(|| client.get_calls() == 1).await;
            loader.close();
            client.release_incident(&IncidentId::new("a"));

            assert_eq!(pending.await.unwrap(), DetailOutcome::Discarded);
            assert_eq!(loader.state().phase(), DetailPhase::Idle);
        }
    }

    mod dispatch_tests {
        use super::*;

        #[tokio::test]
        async fn test_confirm_replaces_loaded_record() {
            let loader = DetailLoader::new(client());
            loader.open("a".into()).await;

            let decision = DispatchDecision::new().with("unit", "ALS-2");
            assert_eq!(loader.confirm_dispatch(&decision).await, DetailOutcome::Loaded);

            let state = loader.state();
            let record = state.record.unwrap();
            assert!(record.dispatch_confirmed);
            assert_eq!(record.status, Some(IncidentStatus::DispatchConfirmed));
            assert_eq!(record.dispatch_decision, Some(decision));
            assert!(!state.action_pending);
        }

        #[tokio::test]
        async fn test_override_records_reason() {
            let loader = DetailLoader::new(client());
            loader.open("b".into()).await;

            assert_eq!(
                loader.override_dispatch("crew already on scene").await,
                DetailOutcome::Loaded
            );

            let record = loader.state().record.unwrap();
            assert_eq!(record.override_reason.as_deref(), Some("crew already on scene"));
            assert_eq!(record.audit_log.last().unwrap().event, "DISPATCH_OVERRIDDEN");
        }

        #[tokio::test]
        async fn test_action_failure_keeps_record() {
            let client = client();
            let loader = DetailLoader::new(Arc::clone(&client));
            loader.open("a".into()).await;
            let before = loader.state().record;

            client.set_incidents(Vec::new());
            let outcome = loader.override_dispatch("duplicate call").await;

            assert_eq!(outcome, DetailOutcome::Failed(ErrorKind::NotFound));
            let state = loader.state();
            assert_eq!(state.record, before);
            assert_eq!(state.phase(), DetailPhase::Loaded);
            assert_eq!(state.last_error_kind(), Some(ErrorKind::NotFound));
        }

        #[tokio::test]
        async fn test_action_without_record_is_ignored() {
            let client = client();
            let loader = DetailLoader::new(Arc::clone(&client));

            assert_eq!(
                loader.confirm_dispatch(&DispatchDecision::new()).await,
                DetailOutcome::Ignored
            );
            assert_eq!(client.action_calls(), 0);
        }

        #[tokio::test]
        async fn test_cancelled_action_allows_retry() {
            let client = client();
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));
            loader.open("a".into()).await;
            client.hold_incident("a");

            let pending = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.confirm_dispatch(&DispatchDecision::new()).await }
            });
            yield_until(|| client.action_calls() == 1).await;
            assert!(loader.state().action_pending);
            pending.abort();
            let _ = pending.await;

            assert!(!loader.state().action_pending);
            client.release_incident(&IncidentId::new("a"));
            assert_eq!(
                loader.override_dispatch("caller cancelled").await,
                DetailOutcome::Loaded
            );
            assert_eq!(client.action_calls(), 2);
        }

        #[tokio::test]
        async fn test_action_result_after_navigation_is_discarded() {
            let client = client();
            let loader = Arc::new(DetailLoader::new(Arc::clone(&client)));
            loader.open("a".into()).await;
            client.hold_incident("a");

            let pending = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader.confirm_dispatch(&DispatchDecision::new()).await }
            });
            yield_until(|| client.action_calls() == 1).await;
            assert!(loader.state().action_pending);
            assert_eq!(
                loader.override_dispatch("second click").await,
                DetailOutcome::Ignored
            );

            loader.open("b".into()).await;
            client.release_incident(&IncidentId::new("a"));

            assert_eq!(pending.await.unwrap(), DetailOutcome::Discarded);
            let state = loader.state();
            assert_eq!(loaded_id(&state), Some("b"));
            assert!(!state.action_pending);
        }
    }
}
