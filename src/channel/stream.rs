use std::io::{ErrorKind, Read, Write};

use tracing::trace;

use super::{Address, ExchangeChannel, Packet};
use crate::errors::ChannelError;
use crate::tagged::DbTag;

/// FIFO channel framing packets over any byte stream.
///
/// Each packet is written as one bincode frame holding its address and payload.
/// The receiving side checks every frame's address against the one it asks for.
#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
    last_db_tag: u32,
}

impl<S: Read + Write> StreamChannel<S> {
    /// Wrap a byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            last_db_tag: 0,
        }
    }

    /// Borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Flush buffered frames.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] when the stream cannot be flushed.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        Ok(self.stream.flush()?)
    }

    /// Give the underlying stream back.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> ExchangeChannel for StreamChannel<S> {
    fn send_packet(&mut self, address: Address, packet: Packet) -> Result<(), ChannelError> {
        trace!(%address, kind = packet.kind(), "stream frame out");
        bincode::serialize_into(&mut self.stream, &(address, packet))?;
        Ok(())
    }

    fn recv_packet(&mut self, address: Address) -> Result<Packet, ChannelError> {
        let frame: Result<(Address, Packet), _> = bincode::deserialize_from(&mut self.stream);
        let (found, packet) = match frame {
            Ok(frame) => frame,
            Err(error) => {
                let eof = matches!(
                    &*error,
                    bincode::ErrorKind::Io(io) if io.kind() == ErrorKind::UnexpectedEof
                );
                return Err(if eof {
                    ChannelError::Exhausted(address)
                } else {
                    ChannelError::Codec(error)
                });
            }
        };
        if found != address {
            return Err(ChannelError::OutOfOrder {
                expected: address,
                found,
            });
        }
        Ok(packet)
    }

    fn next_db_tag(&mut self) -> DbTag {
        self.last_db_tag += 1;
        DbTag(self.last_db_tag)
    }
}
