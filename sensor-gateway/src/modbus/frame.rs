//! Modbus Framer (C1, §4.1).
//!
//! Pure byte-level encode/decode of the RTU frame written directly to a raw
//! TCP stream (no MBAP header, §6). No I/O happens in this module, which
//! makes it fully testable on byte vectors per §4.1 and the round-trip laws
//! in §8.

use crate::error::GatewayError;
use crc::{Crc, CRC_16_MODBUS};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// A Modbus request: read `count` holding/input registers starting at
/// `start_register` from `slave_addr` using `function_code` (3 or 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_addr: u8,
    pub function_code: u8,
    pub start_register: u16,
    pub count: u16,
}

/// Encode a request as `slave_addr | function_code | start_hi | start_lo |
/// count_hi | count_lo | crc_lo | crc_hi` (§4.1).
pub fn encode_request(req: &ModbusRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(req.slave_addr);
    frame.push(req.function_code);
    frame.extend_from_slice(&req.start_register.to_be_bytes());
    frame.extend_from_slice(&req.count.to_be_bytes());
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes()); // low byte first on the wire
    frame
}

/// Decode a request frame back into its fields, verifying the CRC. Used by
/// the framer round-trip tests and by anything that needs to parse a
/// request it just built.
pub fn decode_request(frame: &[u8]) -> Result<ModbusRequest, GatewayError> {
    if frame.len() < 8 {
        return Err(GatewayError::FrameTruncated {
            got: frame.len(),
            need: 8,
        });
    }
    verify_crc(frame)?;
    Ok(ModbusRequest {
        slave_addr: frame[0],
        function_code: frame[1],
        start_register: u16::from_be_bytes([frame[2], frame[3]]),
        count: u16::from_be_bytes([frame[4], frame[5]]),
    })
}

/// Decode a response: `slave_addr | function_code | byte_count |
/// data[byte_count] | crc_lo | crc_hi`, returning the big-endian u16 words.
///
/// The CRC is verified before any other field is interpreted: a corrupted
/// frame must never be trusted enough to read its function code or byte
/// count, so CRC failure always wins over a coincidentally-plausible
/// exception or byte-count reading (§8's corruption property: any single
/// bit flip yields `CrcError` or `FrameMalformed`, never a misread
/// exception code).
pub fn decode_response(
    frame: &[u8],
    expected_slave: u8,
    expected_register_count: u16,
) -> Result<Vec<u16>, GatewayError> {
    if frame.len() < 5 {
        return Err(GatewayError::FrameTruncated {
            got: frame.len(),
            need: 5,
        });
    }

    verify_crc(frame)?;

    let function_code = frame[1];
    if function_code & 0x80 != 0 {
        return Err(GatewayError::ModbusException(frame[2]));
    }

    let byte_count = frame[2] as usize;
    let expected_bytes = 2 * expected_register_count as usize;
    if byte_count != expected_bytes {
        return Err(GatewayError::FrameMalformed {
            expected: expected_bytes,
            actual: byte_count,
        });
    }
    if frame.len() != 3 + byte_count + 2 {
        return Err(GatewayError::FrameMalformed {
            expected: 3 + byte_count + 2,
            actual: frame.len(),
        });
    }

    if frame[0] != expected_slave {
        return Err(GatewayError::AddressMismatch {
            expected: expected_slave,
            actual: frame[0],
        });
    }

    let data = &frame[3..3 + byte_count];
    Ok(data
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect())
}

fn verify_crc(frame: &[u8]) -> Result<(), GatewayError> {
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = MODBUS_CRC.checksum(body);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(GatewayError::CrcError { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = ModbusRequest {
            slave_addr: 1,
            function_code: 4,
            start_register: 0,
            count: 2,
        };
        let frame = encode_request(&req);
        assert_eq!(decode_request(&frame).unwrap(), req);
    }

    fn sample_response() -> Vec<u8> {
        // slave=1 func=4 byte_count=4 regs=[0x00FA, 0xFFEC]
        let mut frame = vec![0x01, 0x04, 0x04, 0x00, 0xFA, 0xFF, 0xEC];
        let crc = MODBUS_CRC.checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    #[test]
    fn decodes_two_registers() {
        let frame = sample_response();
        let words = decode_response(&frame, 1, 2).unwrap();
        assert_eq!(words, vec![0x00FA, 0xFFEC]);
    }

    #[test]
    fn rejects_short_frame() {
        let err = decode_response(&[0x01, 0x04], 1, 2).unwrap_err();
        assert!(matches!(err, GatewayError::FrameTruncated { .. }));
    }

    #[test]
    fn rejects_exception_frame() {
        let mut frame = vec![0x01, 0x84, 0x02];
        let crc = MODBUS_CRC.checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        let err = decode_response(&frame, 1, 2).unwrap_err();
        assert!(matches!(err, GatewayError::ModbusException(2)));
    }

    #[test]
    fn rejects_mismatched_byte_count() {
        let frame = sample_response();
        let err = decode_response(&frame, 1, 3).unwrap_err();
        assert!(matches!(err, GatewayError::FrameMalformed { .. }));
    }

    #[test]
    fn rejects_bad_crc() {
        let mut frame = sample_response();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = decode_response(&frame, 1, 2).unwrap_err();
        assert!(matches!(err, GatewayError::CrcError { .. }));
    }

    #[test]
    fn rejects_address_mismatch() {
        let frame = sample_response();
        let err = decode_response(&frame, 9, 2).unwrap_err();
        assert!(matches!(err, GatewayError::AddressMismatch { .. }));
    }

    #[test]
    fn corruption_yields_crc_or_malformed() {
        let original = sample_response();
        for bit in 0..(original.len() * 8) {
            let mut corrupted = original.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            match decode_response(&corrupted, 1, 2) {
                Ok(words) => {
                    // Only acceptable if the flip left the frame identical
                    // in the bits that matter for our fixed register count,
                    // which cannot happen here since CRC covers everything.
                    panic!("expected corruption to be detected, got {words:?}");
                }
                Err(GatewayError::CrcError { .. }) | Err(GatewayError::FrameMalformed { .. }) => {}
                Err(other) => panic!("unexpected error variant: {other:?}"),
            }
        }
    }
}
