//! Data models shared across the engine.
//!
//! Remote records are untyped maps produced by several clients, so the
//! `from_*` constructors here read them field by field and substitute an
//! explicit empty sentinel for anything missing or of the wrong type. A model
//! is either fully built from a record or not built at all.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stops;

// ---

/// Wire format of `LocationRecord::timestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Read a string field, `None` when absent or not a string.
pub(crate) fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Read a string field, falling back to `default`.
pub(crate) fn str_or(map: &Map<String, Value>, key: &str, default: &str) -> String {
    str_field(map, key).unwrap_or_else(|| default.to_string())
}

// ---

/// Authenticated driver, built from `conductores/{uid}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConductorSession {
    // ---
    pub uid: String,
    pub name: String,
    pub email: String,
    pub national_id: String,
    pub license_id: String,
    pub phone: String,
    pub status: String,
}

impl ConductorSession {
    /// Build a session from a profile record.
    ///
    /// `email` falls back to the address used to sign in and `status` to
    /// `"Activo"`; every other missing field becomes `""`.
    pub fn from_profile(uid: &str, login_email: &str, profile: &Map<String, Value>) -> Self {
        // ---
        Self {
            uid: uid.to_string(),
            name: str_or(profile, "nombre", ""),
            email: str_or(profile, "email", login_email),
            national_id: str_or(profile, "dni", ""),
            license_id: str_or(profile, "licencia", ""),
            phone: str_or(profile, "telefono", ""),
            status: str_or(profile, "estado", "Activo"),
        }
    }
}

/// Binding of the driver to a route and a vehicle, built from
/// `asignaciones/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAssignment {
    // ---
    pub assignment_id: String,
    pub route_id: String,
    pub route_name: String,
    pub vehicle_id: String,
    pub vehicle_plate: String,
    pub status: String,
}

impl ActiveAssignment {
    /// Build an assignment from its record key and body.
    pub fn from_record(key: &str, record: &Map<String, Value>) -> Self {
        // ---
        Self {
            assignment_id: key.to_string(),
            route_id: str_or(record, "id_ruta", ""),
            route_name: str_or(record, "nombre_ruta", ""),
            vehicle_id: str_or(record, "id_vehiculo", ""),
            vehicle_plate: str_or(record, "matricula_vehiculo", ""),
            status: str_or(record, "estado", ""),
        }
    }

    /// Driver id of an assignment record, `None` when absent or not a string.
    pub fn driver_of(record: &Map<String, Value>) -> Option<String> {
        str_field(record, "id_conductor")
    }
}

/// One position fix from the platform location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    // ---
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            captured_at,
        }
    }
}

/// Position written to the remote store, joined with session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    // ---
    #[serde(rename = "id_asignacion")]
    pub assignment_id: String,
    #[serde(rename = "latitud")]
    pub latitude: f64,
    #[serde(rename = "longitud")]
    pub longitude: f64,
    pub timestamp: String,
    #[serde(rename = "nombre_conductor")]
    pub driver_name: String,
    #[serde(rename = "matricula_vehiculo")]
    pub vehicle_plate: String,
    #[serde(rename = "nombre_ruta")]
    pub route_name: String,
}

impl LocationRecord {
    /// Join a sample with the session and assignment at the moment of send.
    pub fn from_sample(
        sample: &LocationSample,
        conductor: &ConductorSession,
        assignment: &ActiveAssignment,
    ) -> Self {
        // ---
        Self {
            assignment_id: assignment.assignment_id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.captured_at.format(TIMESTAMP_FORMAT).to_string(),
            driver_name: conductor.name.clone(),
            vehicle_plate: assignment.vehicle_plate.clone(),
            route_name: assignment.route_name.clone(),
        }
    }
}

/// One ordered waypoint of a route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stop {
    // ---
    pub id: String,
    pub address: String,
    pub order: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub completed: bool,
}

/// Progress of a route as recorded by the dispatch console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteStatus {
    Pending,
    InProgress,
    Completed,
}

impl RouteStatus {
    /// Decode the console's status label; unknown labels are `Pending`.
    pub fn from_remote(label: &str) -> Self {
        // ---
        match label.trim().to_lowercase().as_str() {
            "en curso" | "en progreso" => RouteStatus::InProgress,
            "completada" => RouteStatus::Completed,
            _ => RouteStatus::Pending,
        }
    }
}

/// A route joined with the assignment that references it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    // ---
    pub id: String,
    pub name: String,
    pub origin: String,
    pub destination: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: RouteStatus,
    pub stops: Vec<Stop>,
    pub assignment_id: String,
    pub vehicle_plate: String,
}

impl Route {
    /// Build a route from `rutas/{id}` and the referencing assignment.
    pub fn from_record(
        id: &str,
        record: &Map<String, Value>,
        assignment_id: &str,
        vehicle_plate: &str,
    ) -> Self {
        // ---
        let stops = record.get("paradas").map(stops::parse).unwrap_or_default();

        Self {
            id: id.to_string(),
            name: str_or(record, "nombre", "Unnamed route"),
            origin: str_or(record, "origen", ""),
            destination: str_or(record, "destino", ""),
            date: str_or(record, "fecha", ""),
            start_time: str_or(record, "hora_inicio_prevista", "00:00"),
            end_time: str_or(record, "hora_fin_prevista", "00:00"),
            status: RouteStatus::from_remote(&str_or(record, "estado", "Pendiente")),
            stops,
            assignment_id: assignment_id.to_string(),
            vehicle_plate: vehicle_plate.to_string(),
        }
    }

    /// Rough distance estimate used by the route list (15 km per stop).
    pub fn distance_label(&self) -> String {
        format!("{} km", self.stops.len() * 15)
    }

    /// Planned duration from `start_time`/`end_time`.
    pub fn duration_label(&self) -> String {
        duration_label(&self.start_time, &self.end_time)
    }
}

/// Format the span between two `HH:MM` clock times, `"--"` if unparsable.
pub fn duration_label(start: &str, end: &str) -> String {
    // ---
    fn minutes(clock: &str) -> Option<i64> {
        let (h, m) = clock.trim().split_once(':')?;
        Some(h.parse::<i64>().ok()? * 60 + m.parse::<i64>().ok()?)
    }

    let Some(total) = minutes(end).zip(minutes(start)).map(|(e, s)| e - s) else {
        return "--".to_string();
    };

    let (hours, mins) = (total / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {mins}min")
    } else {
        format!("{mins}min")
    }
}

/// Incident categories understood by the dispatch console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentType {
    #[serde(rename = "Avería")]
    Breakdown,
    #[serde(rename = "Accidente")]
    Accident,
    #[serde(rename = "Mantenimiento")]
    Maintenance,
    #[serde(rename = "Otro")]
    Other,
}

/// Incident filed by the driver, appended under `incidencias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    // ---
    #[serde(rename = "tipo")]
    pub kind: IncidentType,
    #[serde(rename = "descripcion")]
    pub description: String,
    #[serde(rename = "estado")]
    pub status: String,
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "hora")]
    pub time: String,
    #[serde(rename = "id_vehiculo", skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "matricula", skip_serializing_if = "Option::is_none")]
    pub vehicle_plate: Option<String>,
}

impl IncidentReport {
    /// Status of every newly filed report.
    pub const INITIAL_STATUS: &'static str = "Pendiente";

    /// New report stamped with local date/time; vehicle fields come from the
    /// active assignment when there is one.
    pub fn new(
        kind: IncidentType,
        description: &str,
        assignment: Option<&ActiveAssignment>,
        now: DateTime<Local>,
    ) -> Self {
        // ---
        Self {
            kind,
            description: description.to_string(),
            status: Self::INITIAL_STATUS.to_string(),
            date: now.format("%d/%m/%Y").to_string(),
            time: now.format("%H:%M").to_string(),
            vehicle_id: assignment.map(|a| a.vehicle_id.clone()),
            vehicle_plate: assignment.map(|a| a.vehicle_plate.clone()),
        }
    }
}
