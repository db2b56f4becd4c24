//! Per-object table of integer handles addressed by symbolic position.

use crate::errors::ExchangeError;

/// Position holding the owning object's [`Tag`](crate::Tag).
pub const SLOT_TAG: usize = 0;
/// Position holding the absent-optional-member bit set.
pub const SLOT_FLAGS: usize = 1;
/// First position available to an object's own fields.
pub const FIRST_FREE_SLOT: usize = 2;

/// Fixed-capacity table of database handles, sizes and small integers.
///
/// The table is reserved once with the largest position used by an object's
/// `send_data`/`recv_data` pair and then travels as a single block ahead of the
/// object's field payloads.
///
/// # Examples
/// ```
/// use femstate::SlotBuffer;
///
/// let mut slots = SlotBuffer::new();
/// slots.reserve(4);
/// slots.set(3, 42).expect("position reserved");
/// assert_eq!(slots.get(3).expect("position reserved"), 42);
/// assert!(slots.get(4).is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotBuffer {
    /// Handle values, one per position.
    values: Vec<i64>,
    /// Set by the first reservation, even one of zero positions.
    reserved: bool,
}

impl SlotBuffer {
    /// Create an unreserved table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: Vec::new(),
            reserved: false,
        }
    }

    /// Allocate positions `0..capacity`.
    ///
    /// Reserving an already reserved table with the same capacity does nothing.
    ///
    /// # Panics
    ///
    /// Panics when the table was already reserved with a different capacity. That
    /// only happens when an object's send and receive layouts disagree.
    pub fn reserve(&mut self, capacity: usize) {
        if !self.reserved {
            self.values = vec![0; capacity];
            self.reserved = true;
            return;
        }
        assert_eq!(
            self.values.len(),
            capacity,
            "slot table reserved twice with different capacities"
        );
    }

    /// Number of addressable positions.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Return `true` before the first call to [`SlotBuffer::reserve`].
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Store `value` at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] when `position` was not reserved.
    pub fn set(&mut self, position: usize, value: i64) -> Result<(), ExchangeError> {
        let capacity = self.capacity();
        let slot = self
            .values
            .get_mut(position)
            .ok_or(ExchangeError::SlotOutOfRange { position, capacity })?;
        *slot = value;
        Ok(())
    }

    /// Fetch the value stored at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] when `position` was not reserved.
    pub fn get(&self, position: usize) -> Result<i64, ExchangeError> {
        self.values
            .get(position)
            .copied()
            .ok_or(ExchangeError::SlotOutOfRange {
                position,
                capacity: self.capacity(),
            })
    }

    /// Mark optional member `bit` as absent (`true`) or present (`false`).
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] when the flag slot is not reserved.
    pub fn set_flag(&mut self, bit: u32, absent: bool) -> Result<(), ExchangeError> {
        let flags = self.get(SLOT_FLAGS)?;
        let mask = 1_i64 << bit;
        let flags = if absent { flags | mask } else { flags & !mask };
        self.set(SLOT_FLAGS, flags)
    }

    /// Return `true` when optional member `bit` was flagged absent.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SlotOutOfRange`] when the flag slot is not reserved.
    pub fn flag(&self, bit: u32) -> Result<bool, ExchangeError> {
        Ok(self.get(SLOT_FLAGS)? & (1_i64 << bit) != 0)
    }

    /// Borrow the raw handle values.
    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.values
    }

    /// Replace every handle with the received block.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the block length differs from the
    /// reserved capacity.
    pub fn load(&mut self, values: &[i64]) -> Result<(), ExchangeError> {
        if values.len() != self.values.len() {
            return Err(ExchangeError::SizeMismatch {
                position: None,
                expected: self.values.len(),
                found: values.len(),
            });
        }
        self.values.copy_from_slice(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_idempotent() {
        let mut slots = SlotBuffer::new();
        assert!(!slots.is_reserved());
        slots.reserve(5);
        slots.set(4, 9).expect("reserved");
        slots.reserve(5);
        assert_eq!(slots.get(4).expect("reserved"), 9);
        assert_eq!(slots.capacity(), 5);
    }

    #[test]
    #[should_panic(expected = "different capacities")]
    fn reserve_with_other_capacity_panics() {
        let mut slots = SlotBuffer::new();
        slots.reserve(5);
        slots.reserve(6);
    }

    #[test]
    #[should_panic(expected = "different capacities")]
    fn empty_reservation_still_fixes_the_capacity() {
        let mut slots = SlotBuffer::new();
        slots.reserve(0);
        assert!(slots.is_reserved());
        assert_eq!(slots.capacity(), 0);
        slots.reserve(3);
    }

    #[test]
    fn out_of_range_access_is_reported() {
        let mut slots = SlotBuffer::new();
        slots.reserve(2);
        assert!(matches!(
            slots.set(2, 1),
            Err(ExchangeError::SlotOutOfRange {
                position: 2,
                capacity: 2
            })
        ));
        assert!(slots.get(7).is_err());
    }

    #[test]
    fn flags_are_independent_bits() {
        let mut slots = SlotBuffer::new();
        slots.reserve(FIRST_FREE_SLOT);
        slots.set_flag(0, true).expect("flag slot");
        slots.set_flag(3, true).expect("flag slot");
        slots.set_flag(0, false).expect("flag slot");
        assert!(!slots.flag(0).expect("flag slot"));
        assert!(slots.flag(3).expect("flag slot"));
        assert_eq!(slots.get(SLOT_FLAGS).expect("flag slot"), 8);
    }

    #[test]
    fn load_rejects_wrong_length() {
        let mut slots = SlotBuffer::new();
        slots.reserve(3);
        assert!(slots.load(&[1, 2]).is_err());
        slots.load(&[1, 2, 3]).expect("matching block");
        assert_eq!(slots.as_slice(), &[1, 2, 3]);
    }
}
