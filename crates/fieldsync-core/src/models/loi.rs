//! Location of interest model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{JobId, LoiId, SurveyId, UserId};

/// WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Geometry of a location of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Point {
        coordinate: Coordinate,
    },
    LineString {
        coordinates: Vec<Coordinate>,
    },
    Polygon {
        shell: Vec<Coordinate>,
        #[serde(default)]
        holes: Vec<Vec<Coordinate>>,
    },
    MultiPolygon {
        polygons: Vec<Vec<Coordinate>>,
    },
}

impl Geometry {
    /// Closed polygon rings need at least four points with matching endpoints.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Point { coordinate } => {
                (-90.0..=90.0).contains(&coordinate.lat)
                    && (-180.0..=180.0).contains(&coordinate.lng)
            }
            Self::LineString { coordinates } => coordinates.len() >= 2,
            Self::Polygon { shell, holes } => {
                is_closed_ring(shell) && holes.iter().all(|hole| is_closed_ring(hole))
            }
            Self::MultiPolygon { polygons } => {
                !polygons.is_empty() && polygons.iter().all(|ring| is_closed_ring(ring))
            }
        }
    }
}

fn is_closed_ring(ring: &[Coordinate]) -> bool {
    ring.len() >= 4 && ring.first() == ring.last()
}

/// Creation/modification stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub user_id: UserId,
    /// Client clock (Unix ms)
    pub client_timestamp: i64,
    /// Server clock once synced (Unix ms)
    pub server_timestamp: Option<i64>,
}

impl AuditInfo {
    pub fn now(user_id: UserId) -> Self {
        Self {
            user_id,
            client_timestamp: chrono::Utc::now().timestamp_millis(),
            server_timestamp: None,
        }
    }
}

/// A geographic entity that is the subject of data collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationOfInterest {
    pub id: LoiId,
    pub survey_id: SurveyId,
    pub job_id: JobId,
    /// Optional user-visible identifier (e.g. a plot code)
    pub custom_id: Option<String>,
    pub geometry: Geometry,
    pub properties: BTreeMap<String, String>,
    /// Imported by survey organizers rather than added in the field
    pub is_predefined: bool,
    pub created: AuditInfo,
    pub last_modified: AuditInfo,
}

impl LocationOfInterest {
    /// Display name: the `name` property, then the custom id, then the id.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.properties
            .get("name")
            .cloned()
            .or_else(|| self.custom_id.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}
