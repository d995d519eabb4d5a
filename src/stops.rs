//! Stop-sequence parser.
//!
//! The `paradas` field of a route record arrives either as a JSON array of
//! stop maps or, when the store has re-keyed it, as an object whose keys are
//! stringified indices. Both encodings are decoded into [`RawStops`] first and
//! then normalized into a `Vec<Stop>` sorted by `order`.
//!
//! Malformed input never fails: bad entries are skipped and missing fields
//! take the documented defaults.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::Stop;

// ---

/// Address used when a stop has no `direccion`.
pub const UNKNOWN_ADDRESS: &str = "Unknown address";

/// The two encodings a stop field can arrive in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawStops {
    Sequence(Vec<Value>),
    IndexedMap(Map<String, Value>),
}

impl RawStops {
    /// Decode a raw field; `None` for anything that is neither shape.
    pub fn decode(raw: &Value) -> Option<Self> {
        RawStops::deserialize(raw).ok()
    }
}

/// Normalize a raw stop field into stops sorted by `order` (stable).
pub fn parse(raw: &Value) -> Vec<Stop> {
    // ---
    let mut stops = Vec::new();

    match RawStops::decode(raw) {
        Some(RawStops::Sequence(items)) => {
            for (index, item) in items.iter().enumerate() {
                match item.as_object() {
                    Some(entry) => stops.push(build_stop(index as i64, entry)),
                    None => debug!("Skipping non-map stop at position {}", index),
                }
            }
        }
        Some(RawStops::IndexedMap(entries)) => {
            for (key, item) in &entries {
                let Some(entry) = item.as_object() else {
                    debug!("Skipping non-map stop under key {:?}", key);
                    continue;
                };
                // Keys outside the i32 range are treated like non-numeric keys
                let index = key
                    .trim()
                    .parse::<i32>()
                    .map(i64::from)
                    .unwrap_or(stops.len() as i64);
                stops.push(build_stop(index, entry));
            }
        }
        None => {
            if !raw.is_null() {
                debug!("Stop field is neither a list nor a map, using no stops: {}", raw);
            }
        }
    }

    // sort_by_key is stable: equal orders keep encounter order
    stops.sort_by_key(|s| s.order);
    stops
}

/// Points to draw for a route, skipping stops without a fix (`0.0, 0.0`).
pub fn route_points(stops: &[Stop]) -> Vec<(f64, f64)> {
    // ---
    stops
        .iter()
        .filter(|s| s.latitude != 0.0 || s.longitude != 0.0)
        .map(|s| (s.latitude, s.longitude))
        .collect()
}

// ---

fn build_stop(index: i64, entry: &Map<String, Value>) -> Stop {
    // ---
    let address = entry
        .get("direccion")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

    let order = entry
        .get("orden")
        .and_then(|o| o.as_i64().or_else(|| o.as_f64().map(|f| f as i64)))
        .unwrap_or(index.saturating_add(1));

    let (latitude, longitude) = entry.get("coords").and_then(coord_pair).unwrap_or_else(|| {
        debug!("Stop {} has no usable coords, defaulting to (0, 0)", index);
        (0.0, 0.0)
    });

    Stop {
        id: index.to_string(),
        address,
        order,
        latitude,
        longitude,
        completed: false,
    }
}

fn coord_pair(coords: &Value) -> Option<(f64, f64)> {
    // ---
    match coords.as_array()?.as_slice() {
        [lat, lon, ..] => Some((lat.as_f64()?, lon.as_f64()?)),
        _ => None,
    }
}
