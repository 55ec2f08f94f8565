use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::BusError;

use super::commands::{FunctionCode, Request};
use super::frame::{crc16, EXCEPTION_FLAG};


/// Length of the response at the start of `src`, if enough of it has arrived to tell.
fn response_len(src: &[u8]) -> Result<Option<usize>, BusError> {
    let len = match src {
        [_, function, ..] if function & EXCEPTION_FLAG != 0 => 5, // addr, func, code, crc[2]
        [_, function, byte_count, ..] if *function == FunctionCode::ReadInputRegisters as u8 => {
            3 + *byte_count as usize + 2
        },
        [_, function, ..] => match FunctionCode::from_repr(*function) {
            Some(FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters) => 8,
            // byte count not yet received
            Some(FunctionCode::ReadInputRegisters) => return Ok(None),
            None => {
                return Err(BusError::ProtocolViolation(format!("unexpected function code {function:#04x} in response")))
            }
        },
        _ => return Ok(None)
    };

    Ok(Some(len))
}

/// Length-aware framing of responses read by the master.
///
/// The frame length is derived from the function code (and the byte count of
/// read responses) so frames are split correctly no matter how the bytes were
/// chunked on their way in. Checksums are left to [`super::frame::validate`].
#[derive(Default)]
pub struct ResponseCodec;

impl ResponseCodec {
    pub fn new() -> Self {
        ResponseCodec
    }
}

impl Decoder for ResponseCodec {
    type Item = Bytes;

    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = response_len(src)? else {
            return Ok(None)
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None)
        }

        Ok(Some(src.split_to(len).freeze()))
    }
}


/// Slave-side framing: decodes requests from a master and encodes raw response frames.
#[derive(Default)]
pub struct AdaptorCodec;

impl AdaptorCodec {
    pub fn new() -> Self {
        AdaptorCodec
    }
}

fn request_len(src: &[u8]) -> Option<usize> {
    match src {
        [_, 0x04 | 0x06, ..] => Some(8),
        [_, 0x10, _, _, _, _, byte_count, ..] => Some(9 + *byte_count as usize),
        _ => None
    }
}

impl Decoder for AdaptorCodec {
    type Item = Request;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 2 {
                return Ok(None)
            }

            let Some(function) = FunctionCode::from_repr(src[1]) else {
                // not a request we understand, skip the junk to resync
                src.advance(1);
                continue;
            };

            let Some(len) = request_len(src) else {
                return Ok(None)
            };

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None)
            }

            let mut frame = src.split_to(len);
            let checksum = frame.split_off(len - 2).get_u16_le();

            let expected = crc16(&frame);
            if expected != checksum {
                warn!("dropping request with invalid checksum (expected {expected:#06x}, actual: {checksum:#06x})");
                continue;
            }

            let slave = frame.get_u8();
            let _function = frame.get_u8();
            let address = frame.get_u16();

            let request = match function {
                FunctionCode::ReadInputRegisters => Request::ReadInputRegisters {
                    slave, address, count: frame.get_u16()
                },
                FunctionCode::WriteSingleRegister => Request::WriteSingleRegister {
                    slave, address, value: [frame.get_u8(), frame.get_u8()]
                },
                FunctionCode::WriteMultipleRegisters => {
                    let _count = frame.get_u16();
                    let _byte_count = frame.get_u8();

                    Request::WriteMultipleRegisters { slave, address, values: frame.freeze() }
                }
            };

            return Ok(Some(request))
        }
    }
}

impl Encoder<Bytes> for AdaptorCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len());
        dst.put(frame);

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::protocol::commands::*;
    use crate::protocol::frame::with_checksum;

    #[tokio::test]
    async fn test_response_codec_decode() {
        let read_response = with_checksum(&[0x01, 0x04, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let write_echo = with_checksum(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x03]);
        let exception = with_checksum(&[0x01, 0x84, 0x02]);

        let mut buf = BytesMut::new();
        buf.put(&read_response[..]);
        buf.put(&write_echo[..]);
        buf.put(&exception[..]);

        let mut fr = FramedRead::new(&buf[..], ResponseCodec::new());

        assert_eq!(&fr.next().await.unwrap().unwrap()[..], &read_response[..]);
        assert_eq!(&fr.next().await.unwrap().unwrap()[..], &write_echo[..]);
        assert_eq!(&fr.next().await.unwrap().unwrap()[..], &exception[..]);
        assert!(fr.next().await.is_none());
    }

    #[test]
    fn test_response_codec_partial() {
        let mut codec = ResponseCodec::new();
        let response = with_checksum(&[0x01, 0x04, 0x02, 0x00, 0x01]);

        let mut buf = BytesMut::new();
        buf.put(&response[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put(&response[2..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put(&response[5..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &response[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_codec_unknown_function() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&[0x01, 0x03, 0x02, 0x00][..]);

        assert!(matches!(codec.decode(&mut buf), Err(BusError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_adaptor_codec_decode() {
        let read = Request::read_input_registers(1, 30002, 1).unwrap();
        let write = Request::write_multiple_registers(1, 40004, &[0x00, 0x01, 0x00, 0x02]).unwrap();
        let single = Request::write_single_register(1, 40001, [0x00, 0x01]).unwrap();

        let mut buf = BytesMut::new();
        buf.put(&[0xff, 0x33][..]); // some junk
        read.encode(&mut buf);

        let mut corrupted = BytesMut::new();
        single.encode(&mut corrupted);
        corrupted[5] ^= 0x01;
        buf.put(corrupted);

        write.encode(&mut buf);
        single.encode(&mut buf);

        let mut fr = FramedRead::new(&buf[..], AdaptorCodec::new());

        assert_eq!(fr.next().await.unwrap().unwrap(), read);
        assert_eq!(fr.next().await.unwrap().unwrap(), write);
        assert_eq!(fr.next().await.unwrap().unwrap(), single);
        assert!(fr.next().await.is_none());
    }
}
