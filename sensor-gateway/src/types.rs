//! Core sensor data model (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tagged sensor kind. Each value carries its own decoding contract in
/// [`crate::decode`] and its own cache/document-store naming in [`crate::cache`]
/// and [`crate::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    WindSpeed,
    Pressure,
    Humidity,
}

impl SensorType {
    /// The lowercase, key-schema-safe name used in cache keys and collection names.
    pub fn as_key_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::WindSpeed => "wind_speed",
            SensorType::Pressure => "pressure",
            SensorType::Humidity => "humidity",
        }
    }

    /// Engineering unit for a successfully decoded reading of this type.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "°C",
            SensorType::WindSpeed => "m/s",
            SensorType::Pressure => "kPa",
            SensorType::Humidity => "%RH",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key_str())
    }
}

/// One decoded measurement from one channel at one time (§3).
///
/// Produced by a [`crate::reader::ModuleReader`], consumed exactly once by
/// the [`crate::manager::ModuleManager`]'s fan-out. Never mutated after
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub module_id: String,
    pub sensor_type: SensorType,
    pub sensor_id: String,
    pub channel: u32,
    pub timestamp: DateTime<Utc>,
    pub raw: u16,
    pub value: f64,
    pub unit: String,
    pub session_prefix: String,
}

impl SensorReading {
    /// `sensor_id` convention: `{type}_{module}_{channel:02}` (§3).
    pub fn make_sensor_id(sensor_type: SensorType, module_id: &str, channel: u32) -> String {
        format!("{}_{}_{:02}", sensor_type.as_key_str(), module_id, channel)
    }
}

/// Format the current instant as the `YYYYMMDD_HHMMSS` session prefix (§3, §9).
///
/// One prefix is generated per process lifetime; the open question in §9 on
/// session rotation is resolved in favor of "no rotation" (see DESIGN.md).
pub fn new_session_prefix(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_id_matches_convention() {
        let id = SensorReading::make_sensor_id(SensorType::Temperature, "mod1", 3);
        assert_eq!(id, "temperature_mod1_03");
    }

    #[test]
    fn session_prefix_format() {
        let now: DateTime<Utc> = "2026-07-28T09:05:03Z".parse().unwrap();
        assert_eq!(new_session_prefix(now), "20260728_090503");
    }
}
