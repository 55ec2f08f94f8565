use bytes::Bytes;
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{BusError, Result};

use super::commands::FunctionCode;


const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Exception responses have the high bit of the function code set.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF, no final xor).
/// Sent little-endian on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Offset of the checksum within a response frame.
///
/// Read responses carry a byte count at offset 2; every other response this
/// master can receive (write echoes) is a fixed 6 bytes before the checksum.
fn checksum_offset(frame: &[u8]) -> Result<usize> {
    if frame[1] == FunctionCode::ReadInputRegisters as u8 {
        let byte_count = *frame.get(2)
            .ok_or_else(|| BusError::ProtocolViolation("read response is missing its byte count".into()))?;

        Ok(3 + byte_count as usize)
    } else {
        Ok(6)
    }
}

/// Check a raw response frame.
///
/// On success the whole frame is returned unchanged (callers slice out the
/// register data with [`register_data`]).
pub fn validate(frame: &[u8]) -> Result<Bytes> {
    let [_address, function, rest @ ..] = frame else {
        return Err(BusError::ProtocolViolation(format!("frame too short: {frame:02x?}")))
    };

    if function & EXCEPTION_FLAG != 0 {
        return Err(BusError::ExceptionResponse {
            function: *function,
            code: rest.first().copied()
        })
    }

    let offset = checksum_offset(frame)?;

    let Some(checksum) = frame.get(offset..offset + 2) else {
        return Err(BusError::ProtocolViolation(format!(
            "frame of {} bytes is too short for a checksum at offset {offset}", frame.len()
        )))
    };

    let actual = u16::from_le_bytes([checksum[0], checksum[1]]);
    let expected = crc16(&frame[..offset]);

    if expected != actual {
        return Err(BusError::ChecksumMismatch { expected, actual })
    }

    Ok(Bytes::copy_from_slice(frame))
}

/// The register data of a validated read response, checked against the
/// number of registers that were requested.
pub fn register_data(frame: &[u8], count: u16) -> Result<&[u8]> {
    let expected = count as usize * 2;

    match frame {
        [_, function, byte_count, data @ ..] if *function == FunctionCode::ReadInputRegisters as u8 => {
            let byte_count = *byte_count as usize;

            if byte_count != expected || data.len() < byte_count {
                return Err(BusError::ProtocolViolation(format!(
                    "expected {expected} bytes of register data, response carries {byte_count}"
                )))
            }

            Ok(&data[..byte_count])
        },
        _ => Err(BusError::ProtocolViolation(format!("not a read response: {frame:02x?}")))
    }
}

/// Append a checksum to `frame`. Used for building responses in the emulator and tests.
pub fn with_checksum(frame: &[u8]) -> Vec<u8> {
    let mut out = frame.to_vec();
    out.extend_from_slice(&crc16(frame).to_le_bytes());
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_vector() {
        // 01 04 00 00 00 01 31 CA
        assert_eq!(crc16(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01]), 0xca31);

        // 01 03 00 00 00 01 84 0A
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0a84);
    }

    #[test]
    fn test_validate_read_response() {
        let response = with_checksum(&[0x01, 0x04, 0x02, 0x00, 0x01]);

        let frame = validate(&response).expect("valid frame");
        assert_eq!(&frame[..], &response[..]);

        assert_eq!(register_data(&frame, 1).expect("data"), &[0x00, 0x01]);
        assert!(matches!(register_data(&frame, 2), Err(BusError::ProtocolViolation(_))));
    }

    #[test]
    fn test_validate_detects_any_flipped_bit() {
        let response = with_checksum(&[0x01, 0x04, 0x04, 0x12, 0x34, 0x56, 0x78]);

        // flip each bit of the register data
        for byte in 3..7 {
            for bit in 0..8 {
                let mut corrupted = response.clone();
                corrupted[byte] ^= 1 << bit;

                assert!(
                    matches!(validate(&corrupted), Err(BusError::ChecksumMismatch { .. })),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_validate_write_echo() {
        let echo = with_checksum(&[0x01, 0x10, 0x00, 0x03, 0x00, 0x04]);
        assert!(validate(&echo).is_ok());

        let echo = with_checksum(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x01]);
        assert!(validate(&echo).is_ok());
    }

    #[test]
    fn test_validate_exception() {
        // trailing bytes are irrelevant, even a garbage checksum
        for frame in [&[0x01, 0x84, 0x02, 0xff, 0xff][..], &[0x01, 0x84][..], &[0x01, 0x84, 0x03, 0x00][..]] {
            match validate(frame) {
                Err(BusError::ExceptionResponse { function: 0x84, code }) => {
                    assert_eq!(code, frame.get(2).copied())
                },
                other => panic!("unexpected {other:?}")
            }
        }

        assert!(matches!(validate(&[0x01, 0x90, 0x04]), Err(BusError::ExceptionResponse { function: 0x90, code: Some(0x04) })));
        assert!(matches!(validate(&[0x01, 0x86, 0x01]), Err(BusError::ExceptionResponse { function: 0x86, code: Some(0x01) })));
    }

    #[test]
    fn test_validate_truncated() {
        assert!(matches!(validate(&[0x01]), Err(BusError::ProtocolViolation(_))));
        assert!(matches!(validate(&[0x01, 0x04]), Err(BusError::ProtocolViolation(_))));

        // byte count promises more data than arrived
        assert!(matches!(validate(&[0x01, 0x04, 0x08, 0x00, 0x01]), Err(BusError::ProtocolViolation(_))));
        assert!(matches!(validate(&[0x01, 0x06, 0x00, 0x00]), Err(BusError::ProtocolViolation(_))));
    }
}
