use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Address, ExchangeChannel, Packet};
use crate::errors::ChannelError;
use crate::tagged::{CommitTag, DbTag};

/// Addressed backing store.
///
/// Packets are filed by [`Address`], so they can be read back in any order and
/// any number of times. Writing twice to the same address replaces the packet,
/// which lets a checkpoint be rewritten under the same commit tag.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Datastore {
    /// Stored packets.
    packets: BTreeMap<Address, Packet>,
    /// Last database tag handed out. Persisted with the packets so reopened
    /// stores keep allocating fresh tags.
    last_db_tag: u32,
}

impl Datastore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Return `true` when nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Return `true` when a packet is stored at `address`.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.packets.contains_key(address)
    }

    /// Distinct commit tags present in the store, in increasing order.
    #[must_use]
    pub fn commit_tags(&self) -> Vec<CommitTag> {
        self.packets
            .keys()
            .map(|address| address.commit_tag)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Drop every packet written under `commit_tag` and return how many were removed.
    pub fn discard(&mut self, commit_tag: CommitTag) -> usize {
        let before = self.packets.len();
        self.packets.retain(|address, _| address.commit_tag != commit_tag);
        before - self.packets.len()
    }

    /// Encode the whole store into `writer`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Codec`] when encoding or writing fails.
    pub fn save<W: Write>(&self, writer: W) -> Result<(), ChannelError> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Decode a store previously written by [`Datastore::save`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Codec`] when reading or decoding fails.
    pub fn load<R: Read>(reader: R) -> Result<Self, ChannelError> {
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Write the store to a file, replacing it if it exists.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the file cannot be created or written.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ChannelError> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.save(&mut writer)?;
        writer.flush()?;
        debug!(path = %path.display(), packets = self.packets.len(), "datastore saved");
        Ok(())
    }

    /// Open a store written by [`Datastore::save_to_path`].
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] when the file cannot be read or decoded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let store = Self::load(BufReader::new(File::open(path)?))?;
        debug!(path = %path.display(), packets = store.packets.len(), "datastore opened");
        Ok(store)
    }
}

impl ExchangeChannel for Datastore {
    fn send_packet(&mut self, address: Address, packet: Packet) -> Result<(), ChannelError> {
        trace!(%address, kind = packet.kind(), "datastore write");
        self.packets.insert(address, packet);
        Ok(())
    }

    fn recv_packet(&mut self, address: Address) -> Result<Packet, ChannelError> {
        self.packets
            .get(&address)
            .cloned()
            .ok_or(ChannelError::Missing(address))
    }

    fn next_db_tag(&mut self) -> DbTag {
        self.last_db_tag += 1;
        DbTag(self.last_db_tag)
    }
}
