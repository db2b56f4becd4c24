use std::collections::VecDeque;

use tracing::trace;

use super::{Address, ExchangeChannel, Packet};
use crate::errors::ChannelError;
use crate::tagged::DbTag;

/// In-process FIFO channel.
///
/// Packets are replayed in the order they were sent. Every read checks that the
/// requested address matches the head of the queue, which catches send/receive
/// sequences that drifted apart.
#[derive(Debug)]
pub struct LoopbackChannel {
    /// Packets not read yet.
    queue: VecDeque<(Address, Packet)>,
    /// Last database tag handed out.
    last_db_tag: u32,
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackChannel {
    /// Create an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            last_db_tag: 0,
        }
    }

    /// Number of packets waiting to be read.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Return `true` when every sent packet was read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Addresses of the packets waiting to be read, in send order.
    pub fn pending_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.queue.iter().map(|(address, _)| *address)
    }
}

impl ExchangeChannel for LoopbackChannel {
    fn send_packet(&mut self, address: Address, packet: Packet) -> Result<(), ChannelError> {
        trace!(%address, kind = packet.kind(), len = packet.len(), "loopback send");
        self.queue.push_back((address, packet));
        Ok(())
    }

    fn recv_packet(&mut self, address: Address) -> Result<Packet, ChannelError> {
        match self.queue.front() {
            None => Err(ChannelError::Exhausted(address)),
            Some((found, _)) if *found != address => Err(ChannelError::OutOfOrder {
                expected: address,
                found: *found,
            }),
            Some(_) => self
                .queue
                .pop_front()
                .map(|(_, packet)| packet)
                .ok_or(ChannelError::Exhausted(address)),
        }
    }

    fn next_db_tag(&mut self) -> DbTag {
        self.last_db_tag += 1;
        DbTag(self.last_db_tag)
    }
}
