//! Projection of incidents onto map markers and viewports.

use geojson::{feature, Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde::Serialize;
use tracing::debug;

use crate::config::MapConfig;
use crate::model::{IncidentId, IncidentRecord, LatLon};
use crate::view::{preview_text, urgency_style, UrgencyStyle};

const SUMMARY_LENGTH: usize = 60;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: IncidentId,
    pub position: LatLon,
    pub style: UrgencyStyle,
    pub urgency_label: String,
    /// Popup text.
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub center: LatLon,
    pub zoom: f64,
}

/// Aggregate map of the current incident set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub viewport: Viewport,
    pub markers: Vec<Marker>,
    /// Records left off the map for lack of a usable coordinate.
    pub unlocated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetailMap {
    Located { viewport: Viewport, marker: Marker },
    /// Rendered as a placeholder instead of a map.
    NoLocation,
}

// ============================================================================
// Projector
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GeoProjector {
    map: MapConfig,
}

impl GeoProjector {
    #[must_use]
    pub const fn new(map: MapConfig) -> Self {
        Self { map }
    }

    /// `None` unless both coordinates are present and finite. Zero is a valid
    /// coordinate.
    #[must_use]
    pub fn marker_for(&self, record: &IncidentRecord) -> Option<Marker> {
        let position = record.coordinate()?;
        Some(Marker {
            id: record.id.clone(),
            position,
            style: urgency_style(&record.urgency),
            urgency_label: record.urgency.as_str().to_string(),
            summary: format!(
                "{}: {}",
                record.urgency,
                preview_text(&record.input_text, SUMMARY_LENGTH)
            ),
        })
    }

    /// One marker per located record, in input order.
    #[must_use]
    pub fn project(&self, records: &[IncidentRecord]) -> Vec<Marker> {
        records
            .iter()
            .filter_map(|record| self.marker_for(record))
            .collect()
    }

    #[must_use]
    pub fn overview(&self, records: &[IncidentRecord]) -> MapView {
        let markers = self.project(records);
        let unlocated = records.len() - markers.len();
        if unlocated > 0 {
            debug!(unlocated, "incidents without coordinates left off the map");
        }
        MapView {
            viewport: Viewport {
                center: self.map.fallback_center,
                zoom: self.map.overview_zoom,
            },
            markers,
            unlocated,
        }
    }

    /// Centres on the incident itself.
    #[must_use]
    pub fn detail(&self, record: &IncidentRecord) -> DetailMap {
        match self.marker_for(record) {
            Some(marker) => DetailMap::Located {
                viewport: Viewport {
                    center: marker.position,
                    zoom: self.map.detail_zoom,
                },
                marker,
            },
            None => DetailMap::NoLocation,
        }
    }
}

// ============================================================================
// GeoJSON
// ============================================================================

/// Points are written `[lon, lat]` as GeoJSON requires.
#[must_use]
pub fn to_feature_collection(markers: &[Marker]) -> FeatureCollection {
    let features = markers
        .iter()
        .map(|marker| {
            let mut properties = JsonObject::new();
            properties.insert("id".into(), marker.id.as_str().into());
            properties.insert("urgency".into(), marker.urgency_label.clone().into());
            properties.insert("style".into(), marker.style.token().into());

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![
                    marker.position.lon(),
                    marker.position.lat(),
                ]))),
                id: Some(feature::Id::String(marker.id.to_string())),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}
