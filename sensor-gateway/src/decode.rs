//! Decoder Registry (C3, §4.3).
//!
//! Raw-to-engineering-unit conversion is a data table, not dynamic dispatch
//! per-sensor (§9): built-in decoders are a fixed match on
//! `(SensorType, is_rtc)`, and custom conversions are plain records
//! (`ConversionSpec`) interpreted by one generic linear formula. Unknown
//! conversion kinds are rejected by [`crate::config`] at load time, so this
//! module only ever sees kinds it understands.

use crate::config::ConversionSpec;
use crate::error::GatewayError;
use crate::types::SensorType;

/// Decode one raw register word into an engineering-unit value for
/// `sensor_id`, using `conversion` if the module configured a custom one,
/// otherwise the built-in table for `(sensor_type, is_rtc)`.
pub fn decode(
    sensor_type: SensorType,
    is_rtc: bool,
    conversion: Option<&ConversionSpec>,
    sensor_id: &str,
    raw: u16,
) -> Result<f64, GatewayError> {
    if let Some(conv) = conversion {
        return decode_custom(conv, sensor_id, raw);
    }
    decode_builtin(sensor_type, is_rtc, sensor_id, raw)
}

fn decode_custom(conv: &ConversionSpec, sensor_id: &str, raw: u16) -> Result<f64, GatewayError> {
    let base = if conv.signed {
        raw as i16 as f64
    } else {
        raw as f64
    };
    let value = base * conv.scale + conv.offset;
    apply_clamp(conv.clamp, sensor_id, value)
}

fn decode_builtin(
    sensor_type: SensorType,
    is_rtc: bool,
    sensor_id: &str,
    raw: u16,
) -> Result<f64, GatewayError> {
    match (sensor_type, is_rtc) {
        (SensorType::Temperature, true) => Ok(raw as i16 as f64 / 10.0),
        (SensorType::Temperature, false) => {
            let value = raw as f64 / 10.0;
            apply_clamp(Some((-50.0, 200.0)), sensor_id, value)
        }
        (SensorType::WindSpeed, _) => Ok(raw as f64 / 100.0),
        (SensorType::Pressure, _) => Ok(raw as f64 / 1000.0),
        (SensorType::Humidity, _) => Ok(raw as f64 / 100.0),
    }
}

fn apply_clamp(
    clamp: Option<(f64, f64)>,
    sensor_id: &str,
    value: f64,
) -> Result<f64, GatewayError> {
    if let Some((lo, hi)) = clamp {
        if value < lo || value > hi {
            return Err(GatewayError::DecodeError {
                sensor_id: sensor_id.to_string(),
                reason: format!("value {value} outside clamp range [{lo}, {hi}]"),
            });
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_rtc_reads_negative() {
        // 0xFFEC = -20 as i16, /10.0 = -2.0 (§8 scenario 1)
        let v = decode(SensorType::Temperature, true, None, "t1", 0xFFEC).unwrap();
        assert_eq!(v, -2.0);
    }

    #[test]
    fn temperature_rtc_reads_positive() {
        // 0x00FA = 250, /10.0 = 25.0
        let v = decode(SensorType::Temperature, true, None, "t1", 0x00FA).unwrap();
        assert_eq!(v, 25.0);
    }

    #[test]
    fn temperature_plain_clamps_out_of_range() {
        // 3000 / 10.0 = 300.0, above the 200.0 clamp ceiling
        let err = decode(SensorType::Temperature, false, None, "t1", 3000).unwrap_err();
        assert!(matches!(err, GatewayError::DecodeError { .. }));
    }

    #[test]
    fn wind_speed_scales_by_hundred() {
        let v = decode(SensorType::WindSpeed, false, None, "w1", 1234).unwrap();
        assert!((v - 12.34).abs() < 1e-9);
    }

    #[test]
    fn pressure_scales_by_thousand() {
        let v = decode(SensorType::Pressure, false, None, "p1", 50_000u16).unwrap();
        assert!((v - 50.0).abs() < 1e-9);
    }

    #[test]
    fn custom_linear_signed_with_clamp() {
        let conv = ConversionSpec {
            kind: "linear".into(),
            scale: 0.1,
            offset: 5.0,
            signed: true,
            clamp: Some((-100.0, 100.0)),
        };
        let v = decode(SensorType::Temperature, false, Some(&conv), "c1", 100).unwrap();
        assert!((v - 15.0).abs() < 1e-9);
    }

    #[test]
    fn custom_linear_out_of_clamp_is_rejected() {
        let conv = ConversionSpec {
            kind: "linear".into(),
            scale: 1.0,
            offset: 0.0,
            signed: false,
            clamp: Some((0.0, 10.0)),
        };
        let err = decode(SensorType::Humidity, false, Some(&conv), "c1", 9999).unwrap_err();
        assert!(matches!(err, GatewayError::DecodeError { .. }));
    }
}
