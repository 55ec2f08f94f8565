//! The half-duplex line to the adaptor.
//!
//! The adaptor emits a response in chunks of at most [`MAX_CHUNK`] bytes. With
//! [`Framing::ChunkLength`] a read that returns fewer bytes than that ends the
//! frame. A response whose length is an exact multiple of 32 bytes therefore
//! never ends on its own; no response this master requests has such a length
//! (1, 24 and 32 register reads give 7, 53 and 69 byte frames), and the
//! command timeout clears the accumulator should one ever appear.
//! [`Framing::LengthAware`] has no such blind spot.

use std::io;

use bytes::{Bytes, BytesMut};
use strum_macros::{Display, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::protocol::addresses::MAX_CHUNK;
use crate::protocol::codec::ResponseCodec;


/// How received bytes are split into frames.
#[derive(Display, EnumString, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum Framing {
    /// A chunk shorter than 32 bytes ends the frame.
    #[default]
    ChunkLength,

    /// The frame length is taken from the function code and byte count.
    LengthAware,
}


pub struct Transport<T> {
    port: T,
    framing: Framing,
    codec: ResponseCodec,
    buffer: BytesMut,
    closed: bool,
}

impl<T> Transport<T> where
    T: AsyncRead + AsyncWrite + Unpin
{
    pub fn new(port: T, framing: Framing) -> Self {
        Self {
            port,
            framing,
            codec: ResponseCodec::new(),
            buffer: BytesMut::with_capacity(256),
            closed: false
        }
    }

    /// The port reported end-of-file. Nothing will be received any more.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Transmit a prebuilt frame verbatim.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.closed {
            return Err(closed_error())
        }

        self.port.write_all(frame).await?;
        self.port.flush().await?;

        Ok(())
    }

    /// Receive the next complete frame.
    ///
    /// Cancel safe: bytes already read stay in the accumulator for the next call.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if self.framing == Framing::LengthAware {
                if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                    return Ok(frame)
                }
            }

            if self.closed {
                return Err(closed_error())
            }

            let mut chunk = [0; MAX_CHUNK];
            let n = self.port.read(&mut chunk).await?;

            if n == 0 {
                self.closed = true;
                return Err(closed_error())
            }

            debug!("[Chunk] {:02x?}", &chunk[..n]);
            self.buffer.extend_from_slice(&chunk[..n]);

            if self.framing == Framing::ChunkLength && n < MAX_CHUNK {
                return Ok(self.buffer.split().freeze())
            }
        }
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("discarding {} buffered bytes: {:02x?}", self.buffer.len(), &self.buffer[..]);
            self.buffer.clear();
        }
    }
}

fn closed_error() -> BusError {
    io::Error::new(io::ErrorKind::UnexpectedEof, "port closed").into()
}


#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::protocol::frame::with_checksum;

    #[tokio::test]
    async fn test_chunk_length_framing() {
        let (near, mut far) = duplex(1024);
        let mut transport = Transport::new(near, Framing::ChunkLength);

        // 32 register read response: 69 bytes, emitted as 32 + 32 + 5
        let mut data = vec![0x01, 0x04, 64];
        data.extend((0..64).map(|b| b as u8));
        let response = with_checksum(&data);
        assert_eq!(response.len(), 69);

        far.write_all(&response).await.unwrap();
        assert_eq!(&transport.next_frame().await.unwrap()[..], &response[..]);

        // short frame in one chunk
        let echo = with_checksum(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x01]);
        far.write_all(&echo).await.unwrap();
        assert_eq!(&transport.next_frame().await.unwrap()[..], &echo[..]);
    }

    #[tokio::test]
    async fn test_length_aware_framing() {
        let (near, mut far) = duplex(1024);
        let mut transport = Transport::new(near, Framing::LengthAware);

        let first = with_checksum(&[0x01, 0x04, 0x02, 0x00, 0x01]);
        let second = with_checksum(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x03]);

        // split mid-frame, and two frames glued together
        far.write_all(&first[..3]).await.unwrap();
        let pending = tokio::spawn(async move {
            let frame = transport.next_frame().await.unwrap();
            (transport, frame)
        });
        far.write_all(&first[3..]).await.unwrap();
        far.write_all(&second).await.unwrap();

        let (mut transport, frame) = pending.await.unwrap();
        assert_eq!(&frame[..], &first[..]);
        assert_eq!(&transport.next_frame().await.unwrap()[..], &second[..]);
    }

    #[tokio::test]
    async fn test_closed_port() {
        let (near, far) = duplex(64);
        let mut transport = Transport::new(near, Framing::ChunkLength);

        drop(far);

        assert!(matches!(transport.next_frame().await, Err(BusError::Transport(_))));
        assert!(transport.is_closed());
        assert!(matches!(transport.send(&[0x01]).await, Err(BusError::Transport(_))));
    }

    #[test]
    fn test_framing_from_str() {
        assert_eq!("chunk-length".parse::<Framing>().unwrap(), Framing::ChunkLength);
        assert_eq!("length-aware".parse::<Framing>().unwrap(), Framing::LengthAware);
        assert!("bogus".parse::<Framing>().is_err());
    }
}
