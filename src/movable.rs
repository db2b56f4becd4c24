//! The capability to be sent through, and rebuilt from, an exchange channel.

use tracing::trace;

use crate::context::ExchangeContext;
use crate::errors::{ExchangeError, ExchangeResult};
use crate::slots::{SlotBuffer, SLOT_TAG};
use crate::tagged::{DbTag, Tag, Tagged};

/// Identity and exchange bookkeeping embedded in every movable object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MovableBase {
    tag: Tag,
    db_tag: Option<DbTag>,
    slots: SlotBuffer,
}

impl MovableBase {
    /// Create the bookkeeping of an object with identity `tag`.
    #[must_use]
    pub const fn new(tag: Tag) -> Self {
        Self {
            tag,
            db_tag: None,
            slots: SlotBuffer::new(),
        }
    }

    /// Identity of the object.
    #[must_use]
    pub const fn tag(&self) -> Tag {
        self.tag
    }

    /// Replace the identity of the object.
    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    /// Database tag, once one was allocated or received.
    #[must_use]
    pub const fn db_tag(&self) -> Option<DbTag> {
        self.db_tag
    }

    /// Record the object's database tag.
    pub fn set_db_tag(&mut self, db_tag: DbTag) {
        self.db_tag = Some(db_tag);
    }

    /// Slot table used by the last exchange.
    #[must_use]
    pub const fn slots(&self) -> &SlotBuffer {
        &self.slots
    }
}

/// An object that can marshal itself through an [`ExchangeContext`].
///
/// Implementors describe their fields in [`Movable::send_data`] and read them
/// back, in the same order and at the same positions, in
/// [`Movable::recv_data`]. The provided [`Movable::send_self`] and
/// [`Movable::recv_self`] wrap that pair with the slot table handling.
pub trait Movable: Tagged {
    /// Exchange bookkeeping.
    fn base(&self) -> &MovableBase;

    /// Mutable exchange bookkeeping.
    fn base_mut(&mut self) -> &mut MovableBase;

    /// Capacity of the slot table, one past the largest position used.
    fn slot_count(&self) -> usize;

    /// Describe the object's fields.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExchangeError`] raised by a primitive.
    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()>;

    /// Read back the fields written by [`Movable::send_data`].
    ///
    /// # Errors
    ///
    /// Returns the first [`ExchangeError`] raised by a primitive.
    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()>;

    /// Send the whole object: slot table first, then its fields.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExchangeError`] raised while sending.
    fn send_self(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let db_tag = ctx.assign_db_tag(self);
        trace!(tag = %self.tag(), class_tag = %self.class_tag(), %db_tag, "send_self");
        let capacity = self.slot_count();
        let mut slots = std::mem::take(&mut self.base_mut().slots);
        slots.reserve(capacity);
        ctx.enter(db_tag, slots);
        let outcome = send_frame(self, ctx);
        self.base_mut().slots = ctx.leave();
        outcome
    }

    /// Fill the object from the channel.
    ///
    /// The database tag must be known beforehand, either from an earlier send
    /// or from the owner's slot table.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::MissingDbTag`] when no database tag is known,
    /// or the first error raised while receiving.
    fn recv_self(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let db_tag = self
            .base()
            .db_tag()
            .ok_or_else(|| ExchangeError::MissingDbTag(self.class_tag()))?;
        trace!(class_tag = %self.class_tag(), %db_tag, "recv_self");
        let capacity = self.slot_count();
        let mut slots = std::mem::take(&mut self.base_mut().slots);
        slots.reserve(capacity);
        ctx.enter(db_tag, slots);
        let outcome = recv_frame(self, ctx);
        self.base_mut().slots = ctx.leave();
        outcome
    }
}

fn send_frame<M: Movable + ?Sized>(
    object: &mut M,
    ctx: &mut ExchangeContext<'_>,
) -> ExchangeResult<()> {
    ctx.send_tag(SLOT_TAG, object.tag())?;
    object.send_data(ctx)?;
    ctx.send_id_data()
}

fn recv_frame<M: Movable + ?Sized>(
    object: &mut M,
    ctx: &mut ExchangeContext<'_>,
) -> ExchangeResult<()> {
    ctx.recv_id_data()?;
    let tag = ctx.recv_tag(SLOT_TAG)?;
    object.base_mut().set_tag(tag);
    object.recv_data(ctx)
}
