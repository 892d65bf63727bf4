//! Modbus RTU-over-TCP wire format (C1).

pub mod frame;

pub use frame::{decode_request, decode_response, encode_request, ModbusRequest};
