//! Tagged error kinds for the acquisition and storage pipeline (§7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("connect error to {host}:{port}: {source}")]
    ConnectError {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("frame truncated: got {got} bytes, need at least {need}")]
    FrameTruncated { got: usize, need: usize },

    #[error("frame malformed: expected byte_count {expected}, got {actual}")]
    FrameMalformed { expected: usize, actual: usize },

    #[error("crc mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
    CrcError { expected: u16, actual: u16 },

    #[error("slave address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error("modbus exception: code {0}")]
    ModbusException(u8),

    #[error("decode error on sensor {sensor_id}: {reason}")]
    DecodeError { sensor_id: String, reason: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("backpressure drop: channel full, dropped oldest sample")]
    BackpressureDrop,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
