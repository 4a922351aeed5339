//! Wiring of the monitor core for a host shell.

use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::capabilities::HttpTransport;
use crate::client::{HttpIncidentClient, RemoteClient};
use crate::config::MonitorConfig;
use crate::detail::DetailLoader;
use crate::error::{ConfigError, ErrorKind};
use crate::geo::{GeoProjector, MapView};
use crate::model::{IncidentRecord, UnixTimeMs};
use crate::sync::{SyncEngine, SyncOutcome, SyncState};
use crate::view::{filter_incidents, truncate, FeedRow, IncidentCounts};

/// Dashboard grid: the newest incidents as cards plus headline counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardView {
    pub cards: Vec<FeedRow>,
    /// Incidents beyond the card limit.
    pub more: usize,
    pub counts: IncidentCounts,
    pub is_syncing: bool,
    pub is_stale: bool,
    pub error: Option<ErrorKind>,
}

pub struct Monitor<C: RemoteClient> {
    config: MonitorConfig,
    client: Arc<C>,
    sync: Arc<SyncEngine<C>>,
    projector: GeoProjector,
}

impl<C: RemoteClient + 'static> Monitor<C> {
    pub fn new(client: Arc<C>, config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sync = Arc::new(SyncEngine::new(Arc::clone(&client), config.sync_config()));
        let projector = GeoProjector::new(config.map.clone());
        Ok(Self {
            config,
            client,
            sync,
            projector,
        })
    }

    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub const fn sync(&self) -> &Arc<SyncEngine<C>> {
        &self.sync
    }

    pub const fn projector(&self) -> &GeoProjector {
        &self.projector
    }

    /// Subscribes a list view (dashboard, feed or map); polling runs while
    /// any such receiver is alive.
    pub fn watch_incidents(&self) -> watch::Receiver<SyncState> {
        self.sync.subscribe()
    }

    /// A fresh loader for one detail view.
    pub fn detail_loader(&self) -> DetailLoader<C> {
        DetailLoader::new(Arc::clone(&self.client))
    }

    pub async fn refresh(&self) -> SyncOutcome {
        self.sync.refresh().await
    }

    /// Generates a batch of the configured size on the service.
    pub async fn simulate(&self) -> SyncOutcome {
        let count = NonZeroU32::new(self.config.simulate_batch_size).unwrap_or(NonZeroU32::MIN);
        self.sync.simulate(count).await
    }

    #[must_use]
    pub fn dashboard(&self, state: &SyncState, now: UnixTimeMs) -> DashboardView {
        let grid = truncate(&state.incidents, self.config.dashboard_card_limit);
        DashboardView {
            cards: grid
                .shown
                .iter()
                .map(|record| self.row(record, now))
                .collect(),
            more: grid.elided,
            counts: IncidentCounts::from_records(&state.incidents),
            is_syncing: state.is_syncing,
            is_stale: state.is_stale(now, self.config.stale_after()),
            error: state.last_error_kind(),
        }
    }

    /// Feed table rows matching `query`, newest first.
    #[must_use]
    pub fn feed(&self, state: &SyncState, query: &str, now: UnixTimeMs) -> Vec<FeedRow> {
        filter_incidents(&state.incidents, query)
            .into_iter()
            .map(|record| self.row(record, now))
            .collect()
    }

    #[must_use]
    pub fn live_map(&self, state: &SyncState) -> MapView {
        self.projector.overview(&state.incidents)
    }

    fn row(&self, record: &IncidentRecord, now: UnixTimeMs) -> FeedRow {
        FeedRow::with_limits(
            record,
            now,
            self.config.symptom_chip_limit,
            self.config.preview_length,
        )
    }
}

impl<T: HttpTransport + 'static> Monitor<HttpIncidentClient<T>> {
    /// Builds a monitor that talks to the configured service through the
    /// shell's HTTP transport.
    pub fn connect(transport: Arc<T>, config: MonitorConfig) -> Result<Self, ConfigError> {
        let client = HttpIncidentClient::new(transport, &config)
            .map_err(|e| ConfigError::Invalid(format!("base_url: {e}")))?;
        info!(base_url = %config.base_url, api_prefix = %config.api_prefix, "monitor connected");
        Self::new(Arc::new(client), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpRequest, HttpResponse, HttpResult};
    use crate::error::FetchError;
    use crate::model::Urgency;
    use crate::testing::ScriptedClient;

    fn incidents(n: usize) -> Vec<IncidentRecord> {
        (0..n)
            .map(|i| {
                IncidentRecord::new(
                    format!("incident-{i:02}"),
                    format!("report number {i}"),
                    if i % 3 == 0 { Urgency::Critical } else { Urgency::Standard },
                    format!("2024-01-01T10:{i:02}:00Z"),
                )
                .with_symptoms(["a", "b", "c"])
            })
            .collect()
    }

    fn monitor(client: Arc<ScriptedClient>) -> Monitor<ScriptedClient> {
        Monitor::new(client, MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = MonitorConfig {
            poll_interval_ms: 1,
            ..Default::default()
        };
        assert!(Monitor::new(Arc::new(ScriptedClient::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_dashboard_truncates_to_card_limit() {
        let monitor = monitor(Arc::new(ScriptedClient::with_incidents(incidents(11))));
        monitor.refresh().await;
        let state = monitor.sync().state();
        let now = state.last_sync_at.unwrap();

        let dashboard = monitor.dashboard(&state, now);

        assert_eq!(dashboard.cards.len(), 8);
        assert_eq!(dashboard.more, 3);
        assert_eq!(dashboard.cards[0].id, "incident-10");
        assert_eq!(dashboard.cards[0].symptom_overflow.as_deref(), Some("+1"));
        assert_eq!(dashboard.counts.total, 11);
        assert_eq!(dashboard.counts.critical, 4);
        assert!(!dashboard.is_stale);
        assert_eq!(dashboard.error, None);
    }

    #[tokio::test]
    async fn test_dashboard_surfaces_error_and_staleness() {
        let client = Arc::new(ScriptedClient::with_incidents(incidents(2)));
        let monitor = monitor(Arc::clone(&client));
        monitor.refresh().await;
        client.fail_next_list(FetchError::network("offline"));
        monitor.refresh().await;

        let state = monitor.sync().state();
        let later = UnixTimeMs(state.last_sync_at.unwrap().as_millis() + 60_000);
        let dashboard = monitor.dashboard(&state, later);

        assert_eq!(dashboard.cards.len(), 2);
        assert!(dashboard.is_stale);
        assert_eq!(dashboard.error, Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_feed_filters_rows() {
        let monitor = monitor(Arc::new(ScriptedClient::with_incidents(incidents(11))));
        monitor.refresh().await;
        let state = monitor.sync().state();

        let rows = monitor.feed(&state, "number 7", UnixTimeMs::now());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "incident-07");
    }

    #[tokio::test]
    async fn test_simulate_uses_batch_size() {
        let client = Arc::new(ScriptedClient::new());
        let monitor = monitor(Arc::clone(&client));

        assert_eq!(monitor.simulate().await, SyncOutcome::Applied { count: 3 });
        assert_eq!(monitor.live_map(&monitor.sync().state()).markers.len(), 3);
    }

    #[tokio::test]
    async fn test_detail_loaders_are_independent() {
        let monitor = monitor(Arc::new(ScriptedClient::with_incidents(incidents(2))));
        let first = monitor.detail_loader();
        let second = monitor.detail_loader();

        first.open("incident-00".into()).await;

        assert!(first.state().record.is_some());
        assert!(second.state().record.is_none());
    }

    struct EmptyList;

    #[async_trait::async_trait]
    impl HttpTransport for EmptyList {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            HttpResponse::json_body(200, &Vec::<IncidentRecord>::new(), request.request_id())
        }
    }

    #[tokio::test]
    async fn test_connect_over_http_transport() {
        let monitor = Monitor::connect(Arc::new(EmptyList), MonitorConfig::default()).unwrap();
        assert_eq!(monitor.refresh().await, SyncOutcome::Applied { count: 0 });
    }
}
