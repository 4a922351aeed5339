use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use crate::error::FetchError;

/// Free-form key/value mapping as delivered by the incident service.
pub type Details = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Identifiers and Time
// ============================================================================

/// Server-assigned incident identifier. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IncidentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for IncidentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Instants before the epoch clamp to zero.
    #[must_use]
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let ms = dt.unix_timestamp_nanos() / 1_000_000;
        Self(u64::try_from(ms).unwrap_or(0))
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn saturating_sub(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Parses an ISO-8601 timestamp. Values without an offset are read as UTC,
/// which is what the incident service emits.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(raw, &Iso8601::DEFAULT))
        .ok()
        .or_else(|| {
            PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
                .ok()
                .map(PrimitiveDateTime::assume_utc)
        })
}

// ============================================================================
// Classification
// ============================================================================

/// Urgency assigned by upstream triage. Unrecognised labels are kept
/// verbatim so rendering never fails on a new classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Urgency {
    Critical,
    High,
    Standard,
    Low,
    Other(String),
}

impl Urgency {
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "CRITICAL" => Self::Critical,
            "HIGH" | "URGENT" => Self::High,
            "STANDARD" | "NORMAL" | "MODERATE" => Self::Standard,
            "LOW" | "NON_URGENT" => Self::Low,
            _ => Self::Other(label.trim().to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Standard => "STANDARD",
            Self::Low => "LOW",
            Self::Other(label) => label,
        }
    }

    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Urgency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Urgency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

/// Workflow status of an incident on the service side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IncidentStatus {
    Triaged,
    DispatchConfirmed,
    DispatchOverridden,
    Other(String),
}

impl IncidentStatus {
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "TRIAGED" => Self::Triaged,
            "DISPATCH_CONFIRMED" => Self::DispatchConfirmed,
            "DISPATCH_OVERRIDDEN" => Self::DispatchOverridden,
            _ => Self::Other(label.trim().to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Triaged => "TRIAGED",
            Self::DispatchConfirmed => "DISPATCH_CONFIRMED",
            Self::DispatchOverridden => "DISPATCH_OVERRIDDEN",
            Self::Other(label) => label,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Triaged => "Triaged",
            Self::DispatchConfirmed => "Dispatch Confirmed",
            Self::DispatchOverridden => "Dispatch Overridden",
            Self::Other(label) => label,
        }
    }
}

impl Serialize for IncidentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IncidentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

// ============================================================================
// Audit Trail and Dispatch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: String,
    pub timestamp: String,
    #[serde(default)]
    pub details: Details,
}

impl AuditEntry {
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

/// Dispatch decision payload sent when an operator confirms a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchDecision(pub Details);

impl DispatchDecision {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Coordinates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

impl LatLon {
    /// Returns `None` unless both components are finite. Zero is a valid
    /// coordinate.
    #[must_use]
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        (lat.is_finite() && lon.is_finite()).then_some(Self { lat, lon })
    }

    /// Unchecked constructor for literals known to be finite.
    pub(crate) const fn from_finite(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    #[must_use]
    pub fn from_parts(lat: Option<f64>, lon: Option<f64>) -> Option<Self> {
        Self::new(lat?, lon?)
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }

    #[must_use]
    pub const fn as_tuple(self) -> (f64, f64) {
        (self.lat, self.lon)
    }
}

// ============================================================================
// Incident Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: IncidentId,
    pub input_text: String,
    pub urgency: Urgency,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub reasoning: Vec<String>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IncidentStatus>,
    #[serde(default)]
    pub dispatch_required: bool,
    #[serde(default)]
    pub dispatch_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_decision: Option<DispatchDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
}

impl IncidentRecord {
    pub fn new(
        id: impl Into<IncidentId>,
        input_text: impl Into<String>,
        urgency: Urgency,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input_text: input_text.into(),
            urgency,
            symptoms: Vec::new(),
            reasoning: Vec::new(),
            audit_log: Vec::new(),
            lat: None,
            lon: None,
            created_at: created_at.into(),
            updated_at: None,
            status: None,
            dispatch_required: false,
            dispatch_confirmed: false,
            dispatch_decision: None,
            override_reason: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    #[must_use]
    pub fn with_symptoms<I, S>(mut self, symptoms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symptoms = symptoms.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the invariants a decoded record must hold.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.id.is_blank() {
            return Err(FetchError::decode("incident id cannot be empty"));
        }
        if self.input_text.trim().is_empty() {
            return Err(FetchError::decode(format!(
                "incident {} has empty input_text",
                self.id
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn created_at_utc(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.created_at)
    }

    /// Plot position, present only when both coordinates are finite.
    #[must_use]
    pub fn coordinate(&self) -> Option<LatLon> {
        LatLon::from_parts(self.lat, self.lon)
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.urgency.is_critical()
    }
}

/// Stable sort, newest `created_at` first. Unparseable timestamps go last.
pub fn sort_newest_first(records: &mut [IncidentRecord]) {
    records.sort_by_cached_key(|record| Reverse(record.created_at_utc()));
}

/// Turns a decoded list response into a publishable snapshot: validated,
/// unique by id (first occurrence wins) and ordered newest first.
pub fn prepare_snapshot(records: Vec<IncidentRecord>) -> Result<Vec<IncidentRecord>, FetchError> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut snapshot = Vec::with_capacity(records.len());

    for record in records {
        record.validate()?;
        if record.created_at_utc().is_none() {
            warn!(id = %record.id, created_at = %record.created_at, "unparseable created_at");
        }
        if seen.insert(record.id.clone()) {
            snapshot.push(record);
        } else {
            warn!(id = %record.id, "dropping duplicate incident id in snapshot");
        }
    }

    sort_newest_first(&mut snapshot);
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: &str, created_at: &str) -> IncidentRecord {
        IncidentRecord::new(id, "caller reports chest pain", Urgency::Standard, created_at)
    }

    mod decode_tests {
        use super::*;

        #[test]
        fn test_decodes_service_payload() {
            let json = r#"{
                "id": "4f1c",
                "input_text": "Patient unconscious and not breathing",
                "urgency": "CRITICAL",
                "symptoms": ["unconscious", "not breathing"],
                "reasoning": ["airway compromise"],
                "audit_log": [{
                    "timestamp": "2024-01-01T12:00:00.123456",
                    "event": "INCIDENT_CREATED",
                    "details": {"urgency": "CRITICAL", "dispatch_required": true}
                }],
                "lat": 23.25,
                "lon": 77.41,
                "created_at": "2024-01-01T12:00:00.123456",
                "status": "TRIAGED",
                "dispatch_required": true,
                "hospital": "ignored"
            }"#;

            let record: IncidentRecord = serde_json::from_str(json).unwrap();
            assert_eq!(record.id.as_str(), "4f1c");
            assert_eq!(record.urgency, Urgency::Critical);
            assert_eq!(record.symptoms.len(), 2);
            assert_eq!(record.audit_log[0].event, "INCIDENT_CREATED");
            assert_eq!(record.audit_log[0].details["dispatch_required"], true);
            assert_eq!(record.status, Some(IncidentStatus::Triaged));
            assert!(record.dispatch_required);
            assert!(!record.dispatch_confirmed);
            assert!(record.coordinate().is_some());
            assert!(record.validate().is_ok());
        }

        #[test]
        fn test_optional_fields_default() {
            let json = r#"{"id": "a", "input_text": "fall", "urgency": "STANDARD",
                           "created_at": "2024-01-01T10:00:00Z", "lat": null}"#;
            let record: IncidentRecord = serde_json::from_str(json).unwrap();
            assert!(record.symptoms.is_empty());
            assert!(record.reasoning.is_empty());
            assert!(record.audit_log.is_empty());
            assert_eq!(record.lat, None);
            assert_eq!(record.lon, None);
            assert_eq!(record.status, None);
        }

        #[test]
        fn test_missing_required_field_fails() {
            let json = r#"{"id": "a", "urgency": "STANDARD", "created_at": "2024-01-01T10:00:00Z"}"#;
            assert!(serde_json::from_str::<IncidentRecord>(json).is_err());
        }

        #[test]
        fn test_unknown_urgency_is_preserved() {
            let json = r#"{"id": "a", "input_text": "x", "urgency": "SEVERE",
                           "created_at": "2024-01-01T10:00:00Z"}"#;
            let record: IncidentRecord = serde_json::from_str(json).unwrap();
            assert_eq!(record.urgency, Urgency::Other("SEVERE".into()));
            assert_eq!(serde_json::to_value(&record).unwrap()["urgency"], "SEVERE");
        }

        #[test]
        fn test_validate_rejects_blank_fields() {
            let blank_text = IncidentRecord::new("a", "   ", Urgency::Standard, "2024-01-01T10:00:00Z");
            assert!(matches!(blank_text.validate(), Err(FetchError::Decode { .. })));

            let blank_id = IncidentRecord::new("", "text", Urgency::Standard, "2024-01-01T10:00:00Z");
            assert!(matches!(blank_id.validate(), Err(FetchError::Decode { .. })));
        }
    }

    mod urgency_tests {
        use super::*;

        #[test]
        fn test_label_aliases() {
            assert_eq!(Urgency::from_label("critical"), Urgency::Critical);
            assert_eq!(Urgency::from_label(" URGENT "), Urgency::High);
            assert_eq!(Urgency::from_label("High"), Urgency::High);
            assert_eq!(Urgency::from_label("non-urgent"), Urgency::Low);
            assert_eq!(Urgency::from_label("STANDARD"), Urgency::Standard);
        }

        #[test]
        fn test_status_labels() {
            assert_eq!(
                IncidentStatus::from_label("dispatch_confirmed"),
                IncidentStatus::DispatchConfirmed
            );
            assert_eq!(
                IncidentStatus::from_label("ESCALATED").display_name(),
                "ESCALATED"
            );
        }
    }

    mod coordinate_tests {
        use super::*;

        #[test]
        fn test_zero_is_a_valid_coordinate() {
            assert_eq!(LatLon::from_parts(Some(0.0), Some(0.0)).map(LatLon::as_tuple), Some((0.0, 0.0)));
        }

        #[test]
        fn test_missing_or_non_finite_is_rejected() {
            assert!(LatLon::from_parts(None, Some(77.4)).is_none());
            assert!(LatLon::from_parts(Some(23.2), None).is_none());
            assert!(LatLon::from_parts(Some(f64::NAN), Some(77.4)).is_none());
            assert!(LatLon::from_parts(Some(23.2), Some(f64::INFINITY)).is_none());
        }
    }

    mod time_tests {
        use super::*;

        #[test]
        fn test_parses_offset_and_naive_forms() {
            let zulu = parse_timestamp("2024-01-01T12:00:00Z").unwrap();
            let offset = parse_timestamp("2024-01-01T17:30:00+05:30").unwrap();
            let naive = parse_timestamp("2024-01-01T12:00:00").unwrap();
            let micros = parse_timestamp("2024-01-01T12:00:00.123456").unwrap();

            assert_eq!(zulu, offset);
            assert_eq!(zulu, naive);
            assert_eq!(micros.microsecond(), 123_456);
        }

        #[test]
        fn test_rejects_garbage() {
            assert!(parse_timestamp("").is_none());
            assert!(parse_timestamp("yesterday").is_none());
        }

        #[test]
        fn test_unix_ms_conversion() {
            let dt = parse_timestamp("1970-01-01T00:00:01.5Z").unwrap();
            assert_eq!(UnixTimeMs::from_datetime(dt), UnixTimeMs(1500));
        }
    }

    mod ordering_tests {
        use super::*;

        #[test]
        fn test_newest_first() {
            let mut records = vec![
                record("older", "2024-01-01T10:00:00Z"),
                record("newer", "2024-01-01T12:00:00Z"),
            ];
            sort_newest_first(&mut records);
            assert_eq!(records[0].id.as_str(), "newer");
            assert_eq!(records[1].id.as_str(), "older");
        }

        #[test]
        fn test_ties_keep_input_order() {
            let mut records = vec![
                record("a", "2024-01-01T10:00:00Z"),
                record("b", "2024-01-01T11:00:00Z"),
                record("c", "2024-01-01T10:00:00Z"),
            ];
            sort_newest_first(&mut records);
            let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, ["b", "a", "c"]);
        }

        #[test]
        fn test_unparseable_timestamps_sort_last() {
            let mut records = vec![
                record("bad", "not a date"),
                record("good", "2020-01-01T00:00:00Z"),
            ];
            sort_newest_first(&mut records);
            assert_eq!(records[0].id.as_str(), "good");
        }

        #[test]
        fn test_snapshot_drops_duplicate_ids() {
            let first = record("dup", "2024-01-01T10:00:00Z");
            let mut second = record("dup", "2024-01-01T12:00:00Z");
            second.input_text = "second copy".into();

            let snapshot = prepare_snapshot(vec![first.clone(), second]).unwrap();
            assert_eq!(snapshot, vec![first]);
        }

        #[test]
        fn test_snapshot_rejects_invalid_record() {
            let bad = IncidentRecord::new("x", "", Urgency::Critical, "2024-01-01T10:00:00Z");
            assert!(matches!(prepare_snapshot(vec![bad]), Err(FetchError::Decode { .. })));
        }
    }

    proptest! {
        #[test]
        fn prop_sort_is_non_increasing_and_stable(hours in prop::collection::vec(0u8..6, 0..40)) {
            let mut records: Vec<_> = hours
                .iter()
                .enumerate()
                .map(|(i, h)| record(&format!("r{i}"), &format!("2024-01-01T{h:02}:00:00Z")))
                .collect();
            sort_newest_first(&mut records);

            for pair in records.windows(2) {
                let a = pair[0].created_at_utc().unwrap();
                let b = pair[1].created_at_utc().unwrap();
                prop_assert!(a >= b);
                if a == b {
                    let ia: usize = pair[0].id.as_str()[1..].parse().unwrap();
                    let ib: usize = pair[1].id.as_str()[1..].parse().unwrap();
                    prop_assert!(ia < ib);
                }
            }
        }
    }
}
