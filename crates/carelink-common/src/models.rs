//! Alert models shared between the monitor loop and the SMS dispatcher.
//!
//! An [`AlertEvent`] is immutable once built and renders to the
//! pipe-delimited ASCII body carried by the text message:
//!
//! ```text
//! FALL_ALERT|<patient>|<lat,lon|NO_GPS_FIX>|<status>|<HH:MM:SS>|Impact:<g>g|Device:<tag>
//! LOCATION_UPDATE|<patient>|<lat,lon>|<status>|<HH:MM:SS>|Device:<tag>
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Placeholder written in place of coordinates when no fresh fix exists.
pub const NO_GPS_FIX: &str = "NO_GPS_FIX";

// ── Position ────────────────────────────────────────────────────────

/// A latitude/longitude pair in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Freshness of the positioning receiver, as reported in alert payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// A fix younger than the staleness limit is held.
    Ok { age_s: u64 },
    /// No fix, or only a stale one.
    NoFix,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Ok { age_s } => write!(f, "GPS_OK({age_s}s)"),
            PositionStatus::NoFix => write!(f, "GPS_NO_FIX"),
        }
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Fall,
    LocationUpdate,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Fall => write!(f, "FALL_ALERT"),
            AlertKind::LocationUpdate => write!(f, "LOCATION_UPDATE"),
        }
    }
}

/// A single outbound alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    kind: AlertKind,
    patient_id: String,
    position: Option<Coordinates>,
    status: PositionStatus,
    timestamp: DateTime<Local>,
    impact_g: Option<f64>,
    device_tag: String,
}

impl AlertEvent {
    /// A confirmed fall. `position` is `None` when no fresh fix exists.
    pub fn fall(
        patient_id: impl Into<String>,
        device_tag: impl Into<String>,
        position: Option<Coordinates>,
        status: PositionStatus,
        impact_g: f64,
        timestamp: DateTime<Local>,
    ) -> Self {
        AlertEvent {
            kind: AlertKind::Fall,
            patient_id: patient_id.into(),
            position,
            status,
            timestamp,
            impact_g: Some(impact_g.max(0.0)),
            device_tag: device_tag.into(),
        }
    }

    /// A periodic location report. Only built when a fix is available.
    pub fn location_update(
        patient_id: impl Into<String>,
        device_tag: impl Into<String>,
        position: Coordinates,
        status: PositionStatus,
        timestamp: DateTime<Local>,
    ) -> Self {
        AlertEvent {
            kind: AlertKind::LocationUpdate,
            patient_id: patient_id.into(),
            position: Some(position),
            status,
            timestamp,
            impact_g: None,
            device_tag: device_tag.into(),
        }
    }

    pub fn kind(&self) -> AlertKind {
        self.kind
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn position(&self) -> Option<Coordinates> {
        self.position
    }

    pub fn status(&self) -> PositionStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn impact_g(&self) -> Option<f64> {
        self.impact_g
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    /// Render the message body sent to the caregiver.
    pub fn to_payload(&self) -> String {
        let location = match self.position {
            Some(coords) => coords.to_string(),
            None => NO_GPS_FIX.to_string(),
        };
        let time = self.timestamp.format("%H:%M:%S");

        let mut payload = format!(
            "{}|{}|{}|{}|{}",
            self.kind, self.patient_id, location, self.status, time
        );
        if let Some(g) = self.impact_g {
            payload.push_str(&format!("|Impact:{g:.2}g"));
        }
        payload.push_str(&format!("|Device:{}", self.device_tag));
        payload
    }
}

impl std::fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_payload())
    }
}
