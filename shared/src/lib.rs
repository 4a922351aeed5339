//! Core of the incident triage monitor: keeps a live, ordered view of the
//! incidents held by the triage service, loads single incidents for the
//! detail view, and derives what the dashboard, feed and map render.
//!
//! The crate performs no I/O of its own. HTTP goes through the
//! [`capabilities::HttpTransport`] the host shell provides, timers run on the
//! shell's Tokio runtime, and state is published through `watch` channels.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod detail;
pub mod error;
pub mod geo;
pub mod model;
pub mod sync;
pub mod view;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use app::{DashboardView, Monitor};
pub use client::{HttpIncidentClient, RemoteClient};
pub use config::{MapConfig, MonitorConfig, SyncConfig};
pub use detail::{DetailLoader, DetailOutcome, DetailPhase, DetailState};
pub use error::{ConfigError, ErrorKind, FetchError};
pub use geo::{DetailMap, GeoProjector, MapView, Marker, Viewport};
pub use model::{
    AuditEntry, DispatchDecision, IncidentId, IncidentRecord, IncidentStatus, LatLon, UnixTimeMs,
    Urgency,
};
pub use sync::{SyncEngine, SyncOutcome, SyncState, SyncTrigger};
pub use view::{FeedRow, IncidentCounts, Truncated, UrgencyStyle};
