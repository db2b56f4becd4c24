//! Transports moving addressed primitive packets between two endpoints.
//!
//! A channel knows nothing about analysis objects: it moves integer arrays,
//! double arrays and opaque byte buffers, each stamped with the [`Address`] the
//! [`ExchangeContext`](crate::ExchangeContext) computed for it, and it owns the
//! allocation of database tags.

mod datastore;
mod loopback;
mod stream;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ChannelError;
use crate::tagged::{CommitTag, DbTag};

pub use datastore::Datastore;
pub use loopback::LoopbackChannel;
pub use stream::StreamChannel;

/// Part of an object's transmission a packet belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// Root header announcing the class and database tag of a top-level object.
    Header,
    /// The object's whole slot table.
    Slots,
    /// Shape information of the field stored at a slot position.
    Shape(usize),
    /// Payload of the field stored at a slot position.
    Field(usize),
}

/// Location of a packet in the addressing scheme of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Database tag of the object owning the packet.
    pub db_tag: DbTag,
    /// Checkpoint or transmission the packet belongs to.
    pub commit_tag: CommitTag,
    /// Part of the object's transmission.
    pub key: Key,
}

impl Address {
    /// Create an address.
    #[must_use]
    pub const fn new(db_tag: DbTag, commit_tag: CommitTag, key: Key) -> Self {
        Self {
            db_tag,
            commit_tag,
            key,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Key::Header => write!(f, "[{} {} header]", self.db_tag, self.commit_tag),
            Key::Slots => write!(f, "[{} {} slots]", self.db_tag, self.commit_tag),
            Key::Shape(position) => {
                write!(f, "[{} {} shape {position}]", self.db_tag, self.commit_tag)
            }
            Key::Field(position) => {
                write!(f, "[{} {} field {position}]", self.db_tag, self.commit_tag)
            }
        }
    }
}

/// Primitive payload moved by a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Integer array.
    Ints(Vec<i64>),
    /// Double precision array.
    Doubles(Vec<f64>),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

impl Packet {
    /// Short name of the packet kind, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ints(_) => "ints",
            Self::Doubles(_) => "doubles",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Number of elements carried by the packet.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Ints(values) => values.len(),
            Self::Doubles(values) => values.len(),
            Self::Bytes(values) => values.len(),
        }
    }

    /// Return `true` when the packet carries no element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport between two exchange endpoints.
///
/// Implementations decide how packets are routed: a FIFO channel replays them in
/// send order, a backing store files them by address.
pub trait ExchangeChannel {
    /// Write a packet at `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the transport cannot accept the packet.
    fn send_packet(&mut self, address: Address, packet: Packet) -> Result<(), ChannelError>;

    /// Read the packet stored at `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the packet is not available.
    fn recv_packet(&mut self, address: Address) -> Result<Packet, ChannelError>;

    /// Hand out a database tag never returned before by this channel.
    fn next_db_tag(&mut self) -> DbTag;
}
