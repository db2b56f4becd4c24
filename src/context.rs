//! Exchange sessions binding a channel, a broker and a commit tag.
//!
//! An [`ExchangeContext`] is created for one checkpoint or one transmission and
//! dropped when it completes. Objects use its primitives from their
//! [`Movable::send_data`] and [`Movable::recv_data`] implementations; the
//! context turns every primitive into addressed [`Packet`]s.
//!
//! Fields written by `send_data` are staged on the current object frame and only
//! reach the channel after the object's slot table, so the receiver always
//! reads the table first and can validate every variable-sized payload against
//! it.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::broker::Broker;
use crate::channel::{Address, ExchangeChannel, Key, Packet};
use crate::errors::{ChannelError, ExchangeError, ExchangeResult};
use crate::movable::Movable;
use crate::slots::SlotBuffer;
use crate::tagged::{ClassTag, CommitTag, DbTag, Tag};

/// Slot positions holding the class tag and database tag of a required
/// polymorphic member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokedMeta {
    /// Position of the member's class tag.
    pub class_tag_pos: usize,
    /// Position of the member's database tag.
    pub db_tag_pos: usize,
}

/// Slot positions of an optional polymorphic member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionalMeta {
    /// Bit of the flag slot set when the member is absent.
    pub flag_bit: u32,
    /// Position of the member's class tag.
    pub class_tag_pos: usize,
    /// Position of the member's database tag.
    pub db_tag_pos: usize,
}

impl OptionalMeta {
    const fn broked(self) -> BrokedMeta {
        BrokedMeta {
            class_tag_pos: self.class_tag_pos,
            db_tag_pos: self.db_tag_pos,
        }
    }
}

/// Object being sent or received.
#[derive(Debug)]
struct Frame {
    db_tag: DbTag,
    slots: SlotBuffer,
    /// Field packets waiting for the slot table to be flushed.
    staged: Vec<(Address, Packet)>,
}

/// One exchange session.
pub struct ExchangeContext<'a> {
    channel: &'a mut dyn ExchangeChannel,
    broker: &'a Broker,
    commit_tag: CommitTag,
    frames: Vec<Frame>,
}

fn channel_failure(address: Address, source: ChannelError) -> ExchangeError {
    match source {
        ChannelError::OutOfOrder { expected, found } => {
            ExchangeError::ProtocolOrder { expected, found }
        }
        source => ExchangeError::Marshal { address, source },
    }
}

fn count_of(value: i64, position: usize) -> ExchangeResult<usize> {
    usize::try_from(value).map_err(|_| ExchangeError::InvalidHandle { position, value })
}

fn handle_of(value: i64, position: usize) -> ExchangeResult<u32> {
    u32::try_from(value).map_err(|_| ExchangeError::InvalidHandle { position, value })
}

fn checked_len(position: usize, expected: usize, found: usize) -> ExchangeResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(ExchangeError::SizeMismatch {
            position: Some(position),
            expected,
            found,
        })
    }
}

// A size computed from a corrupted header that overflows is reported as
// `usize::MAX`.
fn checked_size(position: usize, expected: usize, size: Option<usize>) -> ExchangeResult<usize> {
    size.ok_or(ExchangeError::SizeMismatch {
        position: Some(position),
        expected,
        found: usize::MAX,
    })
}

fn into_ints(packet: Packet, position: Option<usize>) -> ExchangeResult<Vec<i64>> {
    match packet {
        Packet::Ints(values) => Ok(values),
        other => Err(ExchangeError::PacketKind {
            position,
            expected: "ints",
            found: other.kind(),
        }),
    }
}

fn into_doubles(packet: Packet, position: usize) -> ExchangeResult<Vec<f64>> {
    match packet {
        Packet::Doubles(values) => Ok(values),
        other => Err(ExchangeError::PacketKind {
            position: Some(position),
            expected: "doubles",
            found: other.kind(),
        }),
    }
}

impl<'a> ExchangeContext<'a> {
    /// Open a session on `channel` for `commit_tag`.
    pub fn new(
        channel: &'a mut dyn ExchangeChannel,
        broker: &'a Broker,
        commit_tag: CommitTag,
    ) -> Self {
        Self {
            channel,
            broker,
            commit_tag,
            frames: Vec::new(),
        }
    }

    /// Commit tag of the session.
    #[must_use]
    pub const fn commit_tag(&self) -> CommitTag {
        self.commit_tag
    }

    /// Broker used for polymorphic reconstruction.
    #[must_use]
    pub const fn broker(&self) -> &'a Broker {
        self.broker
    }

    /// Return the object's database tag, allocating one from the channel if the
    /// object never had one.
    pub fn assign_db_tag<M: Movable + ?Sized>(&mut self, object: &mut M) -> DbTag {
        if let Some(db_tag) = object.base().db_tag() {
            return db_tag;
        }
        let db_tag = self.channel.next_db_tag();
        object.base_mut().set_db_tag(db_tag);
        db_tag
    }

    // ------------------------------------------------------------------
    // frames
    // ------------------------------------------------------------------

    pub(crate) fn enter(&mut self, db_tag: DbTag, slots: SlotBuffer) {
        self.frames.push(Frame {
            db_tag,
            slots,
            staged: Vec::new(),
        });
    }

    /// Close the current frame and hand its slot table back to the object.
    /// Packets still staged are dropped.
    pub(crate) fn leave(&mut self) -> SlotBuffer {
        self.frames
            .pop()
            .map(|frame| frame.slots)
            .unwrap_or_default()
    }

    fn frame(&self) -> ExchangeResult<&Frame> {
        self.frames.last().ok_or(ExchangeError::NoOpenFrame)
    }

    fn frame_mut(&mut self) -> ExchangeResult<&mut Frame> {
        self.frames.last_mut().ok_or(ExchangeError::NoOpenFrame)
    }

    fn address(&self, key: Key) -> ExchangeResult<Address> {
        Ok(Address::new(self.frame()?.db_tag, self.commit_tag, key))
    }

    fn stage(&mut self, key: Key, packet: Packet) -> ExchangeResult<()> {
        let address = self.address(key)?;
        self.frame_mut()?.staged.push((address, packet));
        Ok(())
    }

    fn fetch(&mut self, key: Key) -> ExchangeResult<Packet> {
        let address = self.address(key)?;
        self.recv_at(address)
    }

    fn send_at(&mut self, address: Address, packet: Packet) -> ExchangeResult<()> {
        self.channel
            .send_packet(address, packet)
            .map_err(|source| channel_failure(address, source))
    }

    fn recv_at(&mut self, address: Address) -> ExchangeResult<Packet> {
        self.channel
            .recv_packet(address)
            .map_err(|source| channel_failure(address, source))
    }

    // ------------------------------------------------------------------
    // slot table
    // ------------------------------------------------------------------

    /// Store a raw value in the current object's slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn set_slot(&mut self, position: usize, value: i64) -> ExchangeResult<()> {
        self.frame_mut()?.slots.set(position, value)
    }

    /// Read a raw value from the current object's slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn slot(&self, position: usize) -> ExchangeResult<i64> {
        self.frame()?.slots.get(position)
    }

    fn set_flag(&mut self, bit: u32, absent: bool) -> ExchangeResult<()> {
        self.frame_mut()?.slots.set_flag(bit, absent)
    }

    fn flag(&self, bit: u32) -> ExchangeResult<bool> {
        self.frame()?.slots.flag(bit)
    }

    fn count(&self, position: usize) -> ExchangeResult<usize> {
        count_of(self.slot(position)?, position)
    }

    /// Flush the current object's slot table followed by its staged fields.
    ///
    /// Nested objects flush into their owner's frame; the outermost object
    /// writes to the channel.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Marshal`] when the channel rejects a packet.
    pub fn send_id_data(&mut self) -> ExchangeResult<()> {
        let commit_tag = self.commit_tag;
        let frame = self.frame_mut()?;
        let table = (
            Address::new(frame.db_tag, commit_tag, Key::Slots),
            Packet::Ints(frame.slots.as_slice().to_vec()),
        );
        let mut packets = Vec::with_capacity(frame.staged.len() + 1);
        packets.push(table);
        packets.append(&mut frame.staged);

        let depth = self.frames.len();
        if depth >= 2 {
            self.frames[depth - 2].staged.extend(packets);
            return Ok(());
        }
        for (address, packet) in packets {
            self.send_at(address, packet)?;
        }
        Ok(())
    }

    /// Receive the current object's slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the received table length
    /// differs from the reserved capacity.
    pub fn recv_id_data(&mut self) -> ExchangeResult<()> {
        let values = into_ints(self.fetch(Key::Slots)?, None)?;
        self.frame_mut()?.slots.load(&values)
    }

    // ------------------------------------------------------------------
    // primitives stored in the slot table
    // ------------------------------------------------------------------

    /// Store a small integer directly in the slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_int(&mut self, position: usize, value: i64) -> ExchangeResult<()> {
        self.set_slot(position, value)
    }

    /// Read an integer stored by [`ExchangeContext::send_int`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn recv_int(&mut self, position: usize) -> ExchangeResult<i64> {
        self.slot(position)
    }

    /// Store a flag in the slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_bool(&mut self, position: usize, value: bool) -> ExchangeResult<()> {
        self.set_slot(position, i64::from(value))
    }

    /// Read a flag stored by [`ExchangeContext::send_bool`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidHandle`] for a value other than 0 or 1.
    pub fn recv_bool(&mut self, position: usize) -> ExchangeResult<bool> {
        match self.slot(position)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(ExchangeError::InvalidHandle { position, value }),
        }
    }

    /// Store an object tag in the slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_tag(&mut self, position: usize, tag: Tag) -> ExchangeResult<()> {
        self.set_slot(position, i64::from(tag.0))
    }

    /// Read an object tag stored by [`ExchangeContext::send_tag`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidHandle`] for a negative or oversized value.
    pub fn recv_tag(&mut self, position: usize) -> ExchangeResult<Tag> {
        Ok(Tag(handle_of(self.slot(position)?, position)?))
    }

    // ------------------------------------------------------------------
    // field payloads
    // ------------------------------------------------------------------

    /// Send one double.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::NoOpenFrame`] outside an object exchange.
    pub fn send_scalar(&mut self, position: usize, value: f64) -> ExchangeResult<()> {
        self.stage(Key::Field(position), Packet::Doubles(vec![value]))
    }

    /// Receive one double.
    ///
    /// # Errors
    ///
    /// Returns an [`ExchangeError`] when the packet is missing or malformed.
    pub fn recv_scalar(&mut self, position: usize) -> ExchangeResult<f64> {
        let [value] = self.recv_doubles::<1>(position)?;
        Ok(value)
    }

    /// Send a fixed-length group of doubles.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::NoOpenFrame`] outside an object exchange.
    pub fn send_doubles(&mut self, position: usize, values: &[f64]) -> ExchangeResult<()> {
        self.stage(Key::Field(position), Packet::Doubles(values.to_vec()))
    }

    /// Receive a group of exactly `N` doubles.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the group has another length.
    pub fn recv_doubles<const N: usize>(&mut self, position: usize) -> ExchangeResult<[f64; N]> {
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        let found = values.len();
        <[f64; N]>::try_from(values).map_err(|_| ExchangeError::SizeMismatch {
            position: Some(position),
            expected: N,
            found,
        })
    }

    /// Receive a group of doubles whose length the caller derived from
    /// earlier fields.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the group is not `len` long.
    pub fn recv_double_group(&mut self, position: usize, len: usize) -> ExchangeResult<Vec<f64>> {
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        checked_len(position, len, values.len())?;
        Ok(values)
    }

    /// Send a variable-length integer array; its length goes to the slot.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_ints(&mut self, position: usize, values: &[i64]) -> ExchangeResult<()> {
        self.set_slot(position, values.len() as i64)?;
        self.stage(Key::Field(position), Packet::Ints(values.to_vec()))
    }

    /// Receive an integer array sent by [`ExchangeContext::send_ints`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the payload length differs
    /// from the count recorded in the slot.
    pub fn recv_ints(&mut self, position: usize) -> ExchangeResult<Vec<i64>> {
        let expected = self.count(position)?;
        let values = into_ints(self.fetch(Key::Field(position))?, Some(position))?;
        checked_len(position, expected, values.len())?;
        Ok(values)
    }

    /// Send opaque bytes; their length goes to the slot.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_bytes(&mut self, position: usize, bytes: &[u8]) -> ExchangeResult<()> {
        self.set_slot(position, bytes.len() as i64)?;
        self.stage(Key::Field(position), Packet::Bytes(bytes.to_vec()))
    }

    /// Receive bytes sent by [`ExchangeContext::send_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the payload length differs
    /// from the count recorded in the slot.
    pub fn recv_bytes(&mut self, position: usize) -> ExchangeResult<Vec<u8>> {
        let expected = self.count(position)?;
        match self.fetch(Key::Field(position))? {
            Packet::Bytes(bytes) => {
                checked_len(position, expected, bytes.len())?;
                Ok(bytes)
            }
            other => Err(ExchangeError::PacketKind {
                position: Some(position),
                expected: "bytes",
                found: other.kind(),
            }),
        }
    }

    /// Send a dense vector; its length goes to the slot.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_vector(&mut self, position: usize, vector: &DVector<f64>) -> ExchangeResult<()> {
        self.set_slot(position, vector.len() as i64)?;
        self.stage(
            Key::Field(position),
            Packet::Doubles(vector.as_slice().to_vec()),
        )
    }

    /// Receive a vector sent by [`ExchangeContext::send_vector`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the payload length differs
    /// from the count recorded in the slot.
    pub fn recv_vector(&mut self, position: usize) -> ExchangeResult<DVector<f64>> {
        let expected = self.count(position)?;
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        checked_len(position, expected, values.len())?;
        Ok(DVector::from_vec(values))
    }

    /// Send a dense matrix in row-major order.
    ///
    /// The slot records the element count; a shape header carries the row and
    /// column counts.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_matrix(&mut self, position: usize, matrix: &DMatrix<f64>) -> ExchangeResult<()> {
        self.set_slot(position, matrix.len() as i64)?;
        self.stage(
            Key::Shape(position),
            Packet::Ints(vec![matrix.nrows() as i64, matrix.ncols() as i64]),
        )?;
        self.stage(
            Key::Field(position),
            Packet::Doubles(matrix.transpose().as_slice().to_vec()),
        )
    }

    /// Receive a matrix sent by [`ExchangeContext::send_matrix`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the shape or payload
    /// disagrees with the count recorded in the slot.
    pub fn recv_matrix(&mut self, position: usize) -> ExchangeResult<DMatrix<f64>> {
        let expected = self.count(position)?;
        let shape = into_ints(self.fetch(Key::Shape(position))?, Some(position))?;
        checked_len(position, 2, shape.len())?;
        let rows = count_of(shape[0], position)?;
        let cols = count_of(shape[1], position)?;
        let size = checked_size(position, expected, rows.checked_mul(cols))?;
        checked_len(position, expected, size)?;
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        checked_len(position, expected, values.len())?;
        Ok(DMatrix::from_row_slice(rows, cols, &values))
    }

    /// Send a sequence of vectors as one payload.
    ///
    /// The slot records the number of vectors; a shape header lists their
    /// lengths.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_vectors(&mut self, position: usize, vectors: &[DVector<f64>]) -> ExchangeResult<()> {
        self.set_slot(position, vectors.len() as i64)?;
        let lengths = vectors.iter().map(|vector| vector.len() as i64).collect();
        let values = vectors
            .iter()
            .flat_map(|vector| vector.iter().copied())
            .collect();
        self.stage(Key::Shape(position), Packet::Ints(lengths))?;
        self.stage(Key::Field(position), Packet::Doubles(values))
    }

    /// Receive vectors sent by [`ExchangeContext::send_vectors`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the header or payload
    /// disagrees with the recorded count.
    pub fn recv_vectors(&mut self, position: usize) -> ExchangeResult<Vec<DVector<f64>>> {
        let expected = self.count(position)?;
        let lengths = into_ints(self.fetch(Key::Shape(position))?, Some(position))?;
        checked_len(position, expected, lengths.len())?;
        let lengths = lengths
            .into_iter()
            .map(|length| count_of(length, position))
            .collect::<ExchangeResult<Vec<_>>>()?;
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        let total = lengths
            .iter()
            .try_fold(0_usize, |total, length| total.checked_add(*length));
        checked_len(
            position,
            checked_size(position, values.len(), total)?,
            values.len(),
        )?;

        let mut offset = 0;
        Ok(lengths
            .into_iter()
            .map(|length| {
                let vector = DVector::from_column_slice(&values[offset..offset + length]);
                offset += length;
                vector
            })
            .collect())
    }

    /// Send a sequence of matrices as one payload, each in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_matrices(
        &mut self,
        position: usize,
        matrices: &[DMatrix<f64>],
    ) -> ExchangeResult<()> {
        self.set_slot(position, matrices.len() as i64)?;
        let shapes = matrices
            .iter()
            .flat_map(|matrix| [matrix.nrows() as i64, matrix.ncols() as i64])
            .collect();
        let values = matrices
            .iter()
            .flat_map(|matrix| matrix.transpose().as_slice().to_vec())
            .collect();
        self.stage(Key::Shape(position), Packet::Ints(shapes))?;
        self.stage(Key::Field(position), Packet::Doubles(values))
    }

    /// Receive matrices sent by [`ExchangeContext::send_matrices`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the header or payload
    /// disagrees with the recorded count.
    pub fn recv_matrices(&mut self, position: usize) -> ExchangeResult<Vec<DMatrix<f64>>> {
        let expected = self.count(position)?;
        let shapes = into_ints(self.fetch(Key::Shape(position))?, Some(position))?;
        checked_len(position, 2 * expected, shapes.len())?;
        let shapes = shapes
            .chunks_exact(2)
            .map(|shape| Ok((count_of(shape[0], position)?, count_of(shape[1], position)?)))
            .collect::<ExchangeResult<Vec<_>>>()?;
        let values = into_doubles(self.fetch(Key::Field(position))?, position)?;
        let total = shapes.iter().try_fold(0_usize, |total, (rows, cols)| {
            rows.checked_mul(*cols)
                .and_then(|size| total.checked_add(size))
        });
        checked_len(
            position,
            checked_size(position, values.len(), total)?,
            values.len(),
        )?;

        let mut offset = 0;
        Ok(shapes
            .into_iter()
            .map(|(rows, cols)| {
                let matrix =
                    DMatrix::from_row_slice(rows, cols, &values[offset..offset + rows * cols]);
                offset += rows * cols;
                matrix
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // nested objects
    // ------------------------------------------------------------------

    /// Send a member whose concrete type the owner knows statically.
    ///
    /// The member's database tag is stored at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Nested`] wrapping the member's own failure.
    pub fn send_movable<M: Movable + ?Sized>(
        &mut self,
        position: usize,
        member: &mut M,
    ) -> ExchangeResult<()> {
        let db_tag = self.assign_db_tag(member);
        self.set_slot(position, i64::from(db_tag.0))?;
        let class_tag = member.class_tag();
        member
            .send_self(self)
            .map_err(|error| error.nested(position, class_tag))
    }

    /// Receive into a member sent by [`ExchangeContext::send_movable`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidHandle`] for a bad database tag and
    /// [`ExchangeError::Nested`] wrapping the member's own failure.
    pub fn recv_movable<M: Movable + ?Sized>(
        &mut self,
        position: usize,
        member: &mut M,
    ) -> ExchangeResult<()> {
        let db_tag = self.db_tag_at(position)?;
        member.base_mut().set_db_tag(db_tag);
        let class_tag = member.class_tag();
        member
            .recv_self(self)
            .map_err(|error| error.nested(position, class_tag))
    }

    fn db_tag_at(&self, position: usize) -> ExchangeResult<DbTag> {
        let value = self.slot(position)?;
        match handle_of(value, position)? {
            0 => Err(ExchangeError::InvalidHandle { position, value }),
            db_tag => Ok(DbTag(db_tag)),
        }
    }

    fn class_tag_at(&self, position: usize) -> ExchangeResult<ClassTag> {
        Ok(ClassTag(handle_of(self.slot(position)?, position)?))
    }

    /// Send a required polymorphic member.
    ///
    /// The member's class tag and database tag are stored at the positions of
    /// `meta` so the receiver can ask the broker for a blank instance.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Nested`] wrapping the member's own failure.
    pub fn send_broked<M: Movable + ?Sized>(
        &mut self,
        meta: BrokedMeta,
        member: &mut M,
    ) -> ExchangeResult<()> {
        let class_tag = member.class_tag();
        let db_tag = self.assign_db_tag(member);
        self.set_slot(meta.class_tag_pos, i64::from(class_tag.0))?;
        self.set_slot(meta.db_tag_pos, i64::from(db_tag.0))?;
        member
            .send_self(self)
            .map_err(|error| error.nested(meta.db_tag_pos, class_tag))
    }

    /// Rebuild a required polymorphic member of family `F`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Nested`] wrapping
    /// [`ExchangeError::UnknownVariant`] when the broker has no factory for the
    /// announced class tag, or the member's own failure.
    pub fn recv_broked<F: Movable + ?Sized + 'static>(
        &mut self,
        meta: BrokedMeta,
    ) -> ExchangeResult<Box<F>> {
        let class_tag = self.class_tag_at(meta.class_tag_pos)?;
        let db_tag = self.db_tag_at(meta.db_tag_pos)?;
        self.recv_new::<F>(class_tag, db_tag)
            .map_err(|error| error.nested(meta.db_tag_pos, class_tag))
    }

    /// Receive into an existing polymorphic member, replacing it with a fresh
    /// instance when the announced variant differs.
    ///
    /// # Errors
    ///
    /// Same as [`ExchangeContext::recv_broked`].
    pub fn recv_broked_into<F: Movable + ?Sized + 'static>(
        &mut self,
        meta: BrokedMeta,
        member: &mut Box<F>,
    ) -> ExchangeResult<()> {
        let class_tag = self.class_tag_at(meta.class_tag_pos)?;
        if member.class_tag() != class_tag {
            *member = self.recv_broked::<F>(meta)?;
            return Ok(());
        }
        let db_tag = self.db_tag_at(meta.db_tag_pos)?;
        member.base_mut().set_db_tag(db_tag);
        member
            .recv_self(self)
            .map_err(|error| error.nested(meta.db_tag_pos, class_tag))
    }

    /// Send an optional polymorphic member.
    ///
    /// Absence is recorded in the flag slot; the class tag position is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Same as [`ExchangeContext::send_broked`].
    pub fn send_optional<M: Movable + ?Sized>(
        &mut self,
        meta: OptionalMeta,
        member: Option<&mut M>,
    ) -> ExchangeResult<()> {
        match member {
            None => self.set_flag(meta.flag_bit, true),
            Some(member) => {
                self.set_flag(meta.flag_bit, false)?;
                self.send_broked(meta.broked(), member)
            }
        }
    }

    /// Rebuild an optional polymorphic member of family `F`.
    ///
    /// The broker is not consulted when the member was flagged absent.
    ///
    /// # Errors
    ///
    /// Same as [`ExchangeContext::recv_broked`].
    pub fn recv_optional<F: Movable + ?Sized + 'static>(
        &mut self,
        meta: OptionalMeta,
    ) -> ExchangeResult<Option<Box<F>>> {
        if self.flag(meta.flag_bit)? {
            return Ok(None);
        }
        self.recv_broked::<F>(meta.broked()).map(Some)
    }

    /// Send a sequence of polymorphic members.
    ///
    /// The slot records the number of members and an integer payload lists
    /// their class and database tags ahead of the members themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Nested`] wrapping the first member failure.
    pub fn send_broked_vec<M: Movable + ?Sized>(
        &mut self,
        position: usize,
        members: &mut [Box<M>],
    ) -> ExchangeResult<()> {
        let mut table = Vec::with_capacity(members.len());
        for member in members.iter_mut() {
            let db_tag = self.assign_db_tag(member.as_mut());
            table.push((member.class_tag(), db_tag));
        }
        self.send_table(position, &table)?;
        for member in members.iter_mut() {
            let class_tag = member.class_tag();
            member
                .send_self(self)
                .map_err(|error| error.nested(position, class_tag))?;
        }
        Ok(())
    }

    /// Rebuild a sequence sent by [`ExchangeContext::send_broked_vec`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Nested`] wrapping the first member failure.
    pub fn recv_broked_vec<F: Movable + ?Sized + 'static>(
        &mut self,
        position: usize,
    ) -> ExchangeResult<Vec<Box<F>>> {
        self.recv_table(position)?
            .into_iter()
            .map(|(class_tag, db_tag)| {
                self.recv_new::<F>(class_tag, db_tag)
                    .map_err(|error| error.nested(position, class_tag))
            })
            .collect()
    }

    /// Send a table of `(class tag, database tag)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] for an unreserved position.
    pub fn send_table(
        &mut self,
        position: usize,
        entries: &[(ClassTag, DbTag)],
    ) -> ExchangeResult<()> {
        self.set_slot(position, entries.len() as i64)?;
        let values = entries
            .iter()
            .flat_map(|(class_tag, db_tag)| [i64::from(class_tag.0), i64::from(db_tag.0)])
            .collect();
        self.stage(Key::Field(position), Packet::Ints(values))
    }

    /// Receive a table sent by [`ExchangeContext::send_table`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the payload does not hold
    /// two integers per recorded entry.
    pub fn recv_table(&mut self, position: usize) -> ExchangeResult<Vec<(ClassTag, DbTag)>> {
        let expected = self.count(position)?;
        let values = into_ints(self.fetch(Key::Field(position))?, Some(position))?;
        checked_len(position, 2 * expected, values.len())?;
        values
            .chunks_exact(2)
            .map(|pair| {
                Ok((
                    ClassTag(handle_of(pair[0], position)?),
                    DbTag(handle_of(pair[1], position)?),
                ))
            })
            .collect()
    }

    /// Ask the broker for a blank member of family `F` and fill it from the
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::UnknownVariant`] when the broker has no factory
    /// for `class_tag`, or the member's own failure.
    pub fn recv_new<F: Movable + ?Sized + 'static>(
        &mut self,
        class_tag: ClassTag,
        db_tag: DbTag,
    ) -> ExchangeResult<Box<F>> {
        let mut member = self.broker.create::<F>(class_tag)?;
        member.base_mut().set_db_tag(db_tag);
        member.recv_self(self)?;
        Ok(member)
    }

    // ------------------------------------------------------------------
    // root objects
    // ------------------------------------------------------------------

    /// Send a top-level object.
    ///
    /// A root header carrying the object's class and database tags is written
    /// first, so a receiver holding only the commit tag can rebuild it.
    ///
    /// # Errors
    ///
    /// Returns an [`ExchangeError`] when the object or the channel fails.
    pub fn send_object<M: Movable + ?Sized>(&mut self, object: &mut M) -> ExchangeResult<()> {
        let class_tag = object.class_tag();
        let db_tag = self.assign_db_tag(object);
        trace!(%class_tag, %db_tag, commit_tag = %self.commit_tag, "send root object");
        self.send_at(
            self.root_address(),
            Packet::Ints(vec![i64::from(class_tag.0), i64::from(db_tag.0)]),
        )?;
        object.send_self(self)
    }

    fn root_address(&self) -> Address {
        Address::new(DbTag::ROOT, self.commit_tag, Key::Header)
    }

    fn recv_header(&mut self) -> ExchangeResult<(ClassTag, DbTag)> {
        let header = into_ints(self.recv_at(self.root_address())?, None)?;
        if header.len() != 2 {
            return Err(ExchangeError::SizeMismatch {
                position: None,
                expected: 2,
                found: header.len(),
            });
        }
        Ok((
            ClassTag(handle_of(header[0], 0)?),
            DbTag(handle_of(header[1], 1)?),
        ))
    }

    /// Rebuild a top-level object of family `F` sent by
    /// [`ExchangeContext::send_object`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::UnknownVariant`] for an unregistered class tag,
    /// or the object's own failure.
    pub fn recv_object<F: Movable + ?Sized + 'static>(&mut self) -> ExchangeResult<Box<F>> {
        let (class_tag, db_tag) = self.recv_header()?;
        trace!(%class_tag, %db_tag, commit_tag = %self.commit_tag, "recv root object");
        self.recv_new::<F>(class_tag, db_tag)
    }

    /// Receive a top-level object into an existing instance.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::ClassMismatch`] when the channel announces
    /// another variant, or the object's own failure.
    pub fn recv_object_into<M: Movable + ?Sized>(&mut self, object: &mut M) -> ExchangeResult<()> {
        let (class_tag, db_tag) = self.recv_header()?;
        if class_tag != object.class_tag() {
            return Err(ExchangeError::ClassMismatch {
                expected: object.class_tag(),
                found: class_tag,
            });
        }
        object.base_mut().set_db_tag(db_tag);
        object.recv_self(self)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::channel::{Datastore, LoopbackChannel};
    use crate::material::{ElasticMaterial, ElasticPerfectlyPlasticMaterial, UniaxialMaterial};
    use crate::movable::MovableBase;
    use crate::slots::FIRST_FREE_SLOT;
    use crate::tagged::{class_tags, Tagged};

    const ENABLED: usize = FIRST_FREE_SLOT;
    const OWNER: usize = FIRST_FREE_SLOT + 1;
    const SCALAR: usize = FIRST_FREE_SLOT + 2;
    const GROUP: usize = FIRST_FREE_SLOT + 3;
    const IDS: usize = FIRST_FREE_SLOT + 4;
    const BYTES: usize = FIRST_FREE_SLOT + 5;
    const VECTOR: usize = FIRST_FREE_SLOT + 6;
    const MATRIX: usize = FIRST_FREE_SLOT + 7;
    const VECTORS: usize = FIRST_FREE_SLOT + 8;
    const MATRICES: usize = FIRST_FREE_SLOT + 9;
    const HELPER: OptionalMeta = OptionalMeta {
        flag_bit: 0,
        class_tag_pos: FIRST_FREE_SLOT + 10,
        db_tag_pos: FIRST_FREE_SLOT + 11,
    };
    const MEMBERS: usize = FIRST_FREE_SLOT + 12;

    /// Uses every primitive once.
    #[derive(Debug)]
    struct Record {
        base: MovableBase,
        enabled: bool,
        owner: Tag,
        scalar: f64,
        group: [f64; 3],
        ids: Vec<i64>,
        bytes: Vec<u8>,
        vector: DVector<f64>,
        matrix: DMatrix<f64>,
        vectors: Vec<DVector<f64>>,
        matrices: Vec<DMatrix<f64>>,
        helper: Option<Box<dyn UniaxialMaterial>>,
        members: Vec<Box<dyn UniaxialMaterial>>,
    }

    impl Default for Record {
        fn default() -> Self {
            Self {
                base: MovableBase::default(),
                enabled: false,
                owner: Tag::UNASSIGNED,
                scalar: 0.0,
                group: [0.0; 3],
                ids: Vec::new(),
                bytes: Vec::new(),
                vector: DVector::zeros(0),
                matrix: DMatrix::zeros(0, 0),
                vectors: Vec::new(),
                matrices: Vec::new(),
                helper: None,
                members: Vec::new(),
            }
        }
    }

    impl Tagged for Record {
        fn tag(&self) -> Tag {
            self.base.tag()
        }

        fn class_tag(&self) -> ClassTag {
            ClassTag(2)
        }
    }

    impl Movable for Record {
        fn base(&self) -> &MovableBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut MovableBase {
            &mut self.base
        }

        fn slot_count(&self) -> usize {
            MEMBERS + 1
        }

        fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
            ctx.send_bool(ENABLED, self.enabled)?;
            ctx.send_tag(OWNER, self.owner)?;
            ctx.send_scalar(SCALAR, self.scalar)?;
            ctx.send_doubles(GROUP, &self.group)?;
            ctx.send_ints(IDS, &self.ids)?;
            ctx.send_bytes(BYTES, &self.bytes)?;
            ctx.send_vector(VECTOR, &self.vector)?;
            ctx.send_matrix(MATRIX, &self.matrix)?;
            ctx.send_vectors(VECTORS, &self.vectors)?;
            ctx.send_matrices(MATRICES, &self.matrices)?;
            ctx.send_optional(HELPER, self.helper.as_deref_mut())?;
            ctx.send_broked_vec(MEMBERS, &mut self.members)
        }

        fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
            self.enabled = ctx.recv_bool(ENABLED)?;
            self.owner = ctx.recv_tag(OWNER)?;
            self.scalar = ctx.recv_scalar(SCALAR)?;
            self.group = ctx.recv_doubles::<3>(GROUP)?;
            self.ids = ctx.recv_ints(IDS)?;
            self.bytes = ctx.recv_bytes(BYTES)?;
            self.vector = ctx.recv_vector(VECTOR)?;
            self.matrix = ctx.recv_matrix(MATRIX)?;
            self.vectors = ctx.recv_vectors(VECTORS)?;
            self.matrices = ctx.recv_matrices(MATRICES)?;
            self.helper = ctx.recv_optional(HELPER)?;
            self.members = ctx.recv_broked_vec(MEMBERS)?;
            Ok(())
        }
    }

    fn record() -> Record {
        Record {
            base: MovableBase::new(Tag(9)),
            enabled: true,
            owner: Tag(4),
            scalar: 2.5,
            group: [1.0, 2.0, 3.0],
            ids: vec![-1, 0, 7],
            bytes: b"chord".to_vec(),
            vector: DVector::from_vec(vec![0.5, -0.5]),
            matrix: DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vectors: vec![DVector::from_vec(vec![1.0]), DVector::zeros(0)],
            matrices: vec![DMatrix::identity(2, 2), DMatrix::from_element(1, 3, 4.0)],
            helper: Some(Box::new(ElasticMaterial::new(Tag(3), 70.0e9))),
            members: vec![
                Box::new(ElasticMaterial::new(Tag(1), 1.0)),
                Box::new(ElasticPerfectlyPlasticMaterial::new(Tag(2), 2.0, 3.0)),
            ],
        }
    }

    fn round_trip(record: &mut Record, broker: &Broker) -> ExchangeResult<Record> {
        let mut channel = LoopbackChannel::new();
        let mut ctx = ExchangeContext::new(&mut channel, broker, CommitTag(1));
        ctx.send_object(record)?;
        let mut copy = Record::default();
        ctx.recv_object_into(&mut copy)?;
        Ok(copy)
    }

    #[test]
    fn every_primitive_round_trips() {
        let mut original = record();
        let copy = round_trip(&mut original, &Broker::standard()).expect("round trip");

        assert_eq!(copy.tag(), Tag(9));
        assert!(copy.enabled);
        assert_eq!(copy.owner, Tag(4));
        assert_eq!(copy.scalar, 2.5);
        assert_eq!(copy.group, [1.0, 2.0, 3.0]);
        assert_eq!(copy.ids, original.ids);
        assert_eq!(copy.bytes, original.bytes);
        assert_eq!(copy.vector, original.vector);
        assert_eq!(copy.matrix, original.matrix);
        assert_eq!(copy.vectors, original.vectors);
        assert_eq!(copy.matrices, original.matrices);
        let helper = copy.helper.as_deref().expect("helper present");
        assert_eq!(helper.tag(), Tag(3));
        assert_eq!(helper.tangent(), 70.0e9);
        let members: Vec<_> = copy
            .members
            .iter()
            .map(|member| (member.tag(), member.class_tag()))
            .collect();
        assert_eq!(
            members,
            vec![
                (Tag(1), class_tags::ELASTIC_MATERIAL),
                (Tag(2), class_tags::ELASTIC_PP_MATERIAL)
            ]
        );
    }

    #[test]
    fn slot_table_precedes_the_fields() {
        let broker = Broker::standard();
        let mut channel = LoopbackChannel::new();
        let mut original = record();
        ExchangeContext::new(&mut channel, &broker, CommitTag(1))
            .send_object(&mut original)
            .expect("send");
        let db_tag = original.base().db_tag().expect("allocated");

        let keys: Vec<_> = channel
            .pending_addresses()
            .filter(|address| address.db_tag == db_tag || address.key == Key::Header)
            .map(|address| address.key)
            .collect();
        assert_eq!(keys[0], Key::Header);
        assert_eq!(keys[1], Key::Slots);
        assert!(keys[2..].iter().all(|key| *key != Key::Slots));
    }

    #[test]
    fn absent_helper_needs_no_factory() {
        let broker = Broker::builder().build();
        let mut original = Record {
            helper: None,
            members: Vec::new(),
            ..record()
        };
        let copy = round_trip(&mut original, &broker).expect("no lookup happens");
        assert!(copy.helper.is_none());
        assert!(copy.members.is_empty());
    }

    #[test]
    fn member_failure_names_its_position() {
        let broker = Broker::builder()
            .register::<dyn UniaxialMaterial>(
                class_tags::ELASTIC_MATERIAL,
                || -> Box<dyn UniaxialMaterial> { Box::new(ElasticMaterial::default()) },
            )
            .build();
        let error = round_trip(&mut record(), &broker).expect_err("plastic member unknown");
        assert!(matches!(
            error,
            ExchangeError::Nested {
                position: MEMBERS,
                class_tag: class_tags::ELASTIC_PP_MATERIAL,
                ..
            }
        ));
        assert!(matches!(
            error.root_cause(),
            ExchangeError::UnknownVariant { .. }
        ));
    }

    #[test]
    fn wrong_group_length_is_a_size_mismatch() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
        let mut slots = SlotBuffer::new();
        slots.reserve(FIRST_FREE_SLOT + 1);
        ctx.enter(DbTag(5), slots.clone());
        ctx.send_doubles(FIRST_FREE_SLOT, &[1.0, 2.0, 3.0]).expect("staged");
        ctx.send_id_data().expect("flushed");
        ctx.leave();

        ctx.enter(DbTag(5), slots);
        ctx.recv_id_data().expect("slot table");
        let error = ctx
            .recv_doubles::<2>(FIRST_FREE_SLOT)
            .expect_err("three values sent");
        assert!(matches!(
            error,
            ExchangeError::SizeMismatch {
                position: Some(FIRST_FREE_SLOT),
                expected: 2,
                found: 3
            }
        ));
    }

    /// Stage a shape header and payload at `FIRST_FREE_SLOT` as if they came
    /// from a corrupted sender, then open the frame for reading.
    fn corrupted_frame<'a>(
        channel: &'a mut LoopbackChannel,
        broker: &'a Broker,
        count: i64,
        shape: Vec<i64>,
    ) -> ExchangeContext<'a> {
        let mut ctx = ExchangeContext::new(channel, broker, CommitTag(1));
        let mut slots = SlotBuffer::new();
        slots.reserve(FIRST_FREE_SLOT + 1);
        ctx.enter(DbTag(5), slots.clone());
        ctx.set_slot(FIRST_FREE_SLOT, count).expect("reserved");
        ctx.stage(Key::Shape(FIRST_FREE_SLOT), Packet::Ints(shape))
            .expect("staged");
        ctx.stage(Key::Field(FIRST_FREE_SLOT), Packet::Doubles(vec![0.0; 4]))
            .expect("staged");
        ctx.send_id_data().expect("flushed");
        ctx.leave();

        ctx.enter(DbTag(5), slots);
        ctx.recv_id_data().expect("slot table");
        ctx
    }

    #[test]
    fn overflowing_matrix_shape_is_a_size_mismatch() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = corrupted_frame(&mut channel, &broker, 4, vec![i64::MAX, i64::MAX]);
        let error = ctx.recv_matrix(FIRST_FREE_SLOT).expect_err("shape overflows");
        assert!(matches!(
            error,
            ExchangeError::SizeMismatch {
                position: Some(FIRST_FREE_SLOT),
                expected: 4,
                found: usize::MAX
            }
        ));
    }

    #[test]
    fn overflowing_vector_lengths_are_a_size_mismatch() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = corrupted_frame(&mut channel, &broker, 2, vec![i64::MAX, i64::MAX]);
        let error = ctx.recv_vectors(FIRST_FREE_SLOT).expect_err("lengths overflow");
        assert!(matches!(
            error,
            ExchangeError::SizeMismatch {
                found: usize::MAX,
                ..
            }
        ));
    }

    #[test]
    fn overflowing_matrix_shapes_are_a_size_mismatch() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = corrupted_frame(&mut channel, &broker, 2, vec![1, 4, i64::MAX, 3]);
        let error = ctx.recv_matrices(FIRST_FREE_SLOT).expect_err("shapes overflow");
        assert!(matches!(
            error,
            ExchangeError::SizeMismatch {
                found: usize::MAX,
                ..
            }
        ));
    }

    #[test]
    fn wrong_primitive_kind_is_reported() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
        let mut slots = SlotBuffer::new();
        slots.reserve(FIRST_FREE_SLOT + 1);
        ctx.enter(DbTag(5), slots.clone());
        ctx.send_scalar(FIRST_FREE_SLOT, 1.0).expect("staged");
        ctx.send_id_data().expect("flushed");
        ctx.leave();

        ctx.enter(DbTag(5), slots);
        ctx.recv_id_data().expect("slot table");
        let error = ctx.recv_ints(FIRST_FREE_SLOT).expect_err("doubles sent");
        assert!(matches!(
            error,
            ExchangeError::PacketKind {
                expected: "ints",
                found: "doubles",
                ..
            }
        ));
    }

    #[test]
    fn primitives_need_an_open_frame() {
        let broker = Broker::builder().build();
        let mut channel = LoopbackChannel::new();
        let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
        assert!(matches!(
            ctx.send_scalar(FIRST_FREE_SLOT, 1.0),
            Err(ExchangeError::NoOpenFrame)
        ));
        assert!(channel.is_empty());
    }

    proptest! {
        #[test]
        fn slot_layout_is_identical_on_both_sides(
            scalar in -1.0e6..1.0e6f64,
            ids in proptest::collection::vec(any::<i64>(), 0..6),
            bytes in proptest::collection::vec(any::<u8>(), 0..16),
            vector in proptest::collection::vec(-1.0..1.0f64, 0..6),
            rows in 0usize..4,
            cols in 0usize..4,
            with_helper in any::<bool>(),
        ) {
            let broker = Broker::standard();
            let mut original = Record {
                scalar,
                ids,
                bytes,
                vector: DVector::from_vec(vector.clone()),
                matrix: DMatrix::from_fn(rows, cols, |row, col| (row * cols + col) as f64),
                vectors: vec![DVector::from_vec(vector), DVector::zeros(rows)],
                ..record()
            };
            if !with_helper {
                original.helper = None;
            }

            let mut store = Datastore::new();
            ExchangeContext::new(&mut store, &broker, CommitTag(1))
                .send_object(&mut original)
                .expect("send");
            let mut copy = Record::default();
            ExchangeContext::new(&mut store, &broker, CommitTag(1))
                .recv_object_into(&mut copy)
                .expect("recv");

            prop_assert_eq!(copy.base().slots(), original.base().slots());
            prop_assert_eq!(copy.base().slots().capacity(), original.slot_count());
            prop_assert_eq!(copy.helper.is_some(), with_helper);
            prop_assert_eq!(copy.matrix, original.matrix);
        }
    }
}
