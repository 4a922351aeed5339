use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::capabilities::http::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl,
};
use crate::config::MonitorConfig;
use crate::error::FetchError;
use crate::model::{DispatchDecision, IncidentId, IncidentRecord};

// ============================================================================
// Contract
// ============================================================================

/// Request contract with the incident service. Every call is a single
/// suspension point; callers "cancel" by ignoring the result.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Full incident set, in whatever order the service returns it.
    async fn list_incidents(&self) -> Result<Vec<IncidentRecord>, FetchError>;

    /// Single incident. Absence is reported as [`FetchError::NotFound`].
    async fn get_incident(&self, id: &IncidentId) -> Result<IncidentRecord, FetchError>;

    /// Asks the service to synthesise `count` incidents. The new records are
    /// only observable through a later `list_incidents`.
    async fn simulate_incidents(&self, count: NonZeroU32) -> Result<(), FetchError>;

    async fn confirm_dispatch(
        &self,
        id: &IncidentId,
        decision: &DispatchDecision,
    ) -> Result<IncidentRecord, FetchError>;

    async fn override_dispatch(
        &self,
        id: &IncidentId,
        reason: &str,
    ) -> Result<IncidentRecord, FetchError>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// List responses are either a bare array or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListPayload {
    Bare(Vec<IncidentRecord>),
    Wrapped { incidents: Vec<IncidentRecord> },
}

impl ListPayload {
    fn into_records(self) -> Vec<IncidentRecord> {
        match self {
            Self::Bare(records) | Self::Wrapped { incidents: records } => records,
        }
    }
}

#[derive(serde::Serialize)]
struct OverrideBody<'a> {
    reason: &'a str,
}

pub struct HttpIncidentClient<T: HttpTransport> {
    transport: Arc<T>,
    api_root: Url,
    timeout: Duration,
}

impl<T: HttpTransport> HttpIncidentClient<T> {
    pub fn new(transport: Arc<T>, config: &MonitorConfig) -> Result<Self, HttpError> {
        let mut api_root = ValidatedUrl::parse(&config.base_url)?;
        {
            let mut segments = api_root
                .path_segments_mut()
                .map_err(|()| HttpError::InvalidUrl {
                    url: config.base_url.clone(),
                    reason: "URL cannot be a base".to_string(),
                })?;
            segments.pop_if_empty();
            segments.extend(config.api_prefix.split('/').filter(|s| !s.is_empty()));
        }
        ValidatedUrl::from_url(api_root.clone())?;

        Ok(Self {
            transport,
            api_root,
            timeout: config.request_timeout(),
        })
    }

    /// Appends percent-encoded path segments to the API root.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, HttpError> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::InvalidUrl {
                url: self.api_root.to_string(),
                reason: "URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: HttpMethod, url: Url) -> Result<HttpRequest, HttpError> {
        HttpRequest::new(method, ValidatedUrl::from_url(url)?)
            .with_header("Accept", "application/json")?
            .with_timeout(self.timeout)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let request_id = request.request_id().to_string();
        let method = request.method();
        let timeout = request.timeout();
        debug!(
            method = request.method().as_str(),
            url = %request.url(),
            request_id = %request_id,
            "sending request"
        );

        let response = match tokio::time::timeout(timeout, self.transport.execute(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(transport_failure(method, &request_id, error)),
            Err(_) => {
                let error = HttpError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    request_id: request_id.clone(),
                };
                return Err(transport_failure(method, &request_id, error));
            }
        };

        debug!(
            status = response.status(),
            request_id = %request_id,
            duration_ms = response.duration_ms(),
            "received response"
        );
        Ok(response)
    }

    /// Sends a request whose success body is a single incident.
    async fn fetch_record(
        &self,
        id: &IncidentId,
        request: HttpRequest,
    ) -> Result<IncidentRecord, FetchError> {
        let response = self.send(request).await?;
        if response.status() == 404 {
            return Err(FetchError::not_found(id.as_str()));
        }
        if !response.is_success() {
            return Err(FetchError::from_http_status(response.status(), response.body()));
        }

        let record: Option<IncidentRecord> = response.json()?;
        let record = record.ok_or_else(|| FetchError::not_found(id.as_str()))?;
        record.validate()?;
        if record.id != *id {
            warn!(requested = %id, returned = %record.id, "service returned a different incident");
            return Err(FetchError::decode(format!(
                "requested incident {id} but received {}",
                record.id
            )));
        }
        Ok(record)
    }
}

/// Logs a request that produced no response and tags connectivity errors with
/// the request id the shell saw.
fn transport_failure(method: HttpMethod, request_id: &str, error: HttpError) -> FetchError {
    let request_id = error.request_id().unwrap_or(request_id).to_string();
    warn!(
        method = method.as_str(),
        request_id = %request_id,
        retryable = error.is_retryable(),
        idempotent = method.is_idempotent(),
        error = %error,
        "request failed without a response"
    );
    match FetchError::from(error) {
        FetchError::Network { message } => {
            FetchError::network(format!("{message} (request {request_id})"))
        }
        other => other,
    }
}

#[async_trait::async_trait]
impl<T: HttpTransport> RemoteClient for HttpIncidentClient<T> {
    #[instrument(skip(self))]
    async fn list_incidents(&self) -> Result<Vec<IncidentRecord>, FetchError> {
        let request = self.request(HttpMethod::Get, self.endpoint(&["incidents"])?)?;
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(FetchError::from_http_status(response.status(), response.body()));
        }

        let records = response.json::<ListPayload>()?.into_records();
        for record in &records {
            record.validate()?;
        }
        Ok(records)
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn get_incident(&self, id: &IncidentId) -> Result<IncidentRecord, FetchError> {
        let request = self.request(HttpMethod::Get, self.endpoint(&["incidents", id.as_str()])?)?;
        self.fetch_record(id, request).await
    }

    #[instrument(skip(self))]
    async fn simulate_incidents(&self, count: NonZeroU32) -> Result<(), FetchError> {
        let mut url = self.endpoint(&["simulate"])?;
        url.query_pairs_mut()
            .append_pair("num_cases", &count.get().to_string());

        let request = self.request(HttpMethod::Post, url)?;
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(FetchError::from_http_status(response.status(), response.body()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn confirm_dispatch(
        &self,
        id: &IncidentId,
        decision: &DispatchDecision,
    ) -> Result<IncidentRecord, FetchError> {
        let url = self.endpoint(&["incidents", id.as_str(), "dispatch", "confirm"])?;
        let request = self.request(HttpMethod::Post, url)?.with_json(decision)?;
        self.fetch_record(id, request).await
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn override_dispatch(
        &self,
        id: &IncidentId,
        reason: &str,
    ) -> Result<IncidentRecord, FetchError> {
        let url = self.endpoint(&["incidents", id.as_str(), "dispatch", "override"])?;
        let request = self
            .request(HttpMethod::Post, url)?
            .with_json(&OverrideBody { reason })?;
        self.fetch_record(id, request).await
    }
}
