//! Nodes: coordinates, restraints and a trial displacement history.

use nalgebra::Vector3;

use crate::context::ExchangeContext;
use crate::errors::{ExchangeResult, StateResult};
use crate::geometry::{NodeState, Point};
use crate::movable::{Movable, MovableBase};
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{finite, Stateful, TrialState};
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};

const COORDS: usize = FIRST_FREE_SLOT;
const FIXITY: usize = FIRST_FREE_SLOT + 1;
const DISPLACEMENT: usize = FIRST_FREE_SLOT + 2;

/// A point of the model carrying three translational degrees of freedom.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    base: MovableBase,
    coords: Point,
    /// `true` for each restrained direction.
    fixity: [bool; 3],
    displacement: TrialState<Vector3<f64>>,
}

impl Node {
    /// Create a free node at `coords`.
    ///
    /// The node receives its tag when it is added to a
    /// [`Domain`](crate::Domain).
    #[must_use]
    pub fn new(coords: Point) -> Self {
        Self {
            base: MovableBase::new(Tag::UNASSIGNED),
            coords,
            fixity: [false; 3],
            displacement: TrialState::default(),
        }
    }

    /// Restrain the directions flagged `true`.
    #[must_use]
    pub fn with_fixity(mut self, fixity: [bool; 3]) -> Self {
        self.fixity = fixity;
        self
    }

    pub(crate) fn set_tag(&mut self, tag: Tag) {
        self.base.set_tag(tag);
    }

    /// Undeformed coordinates.
    #[must_use]
    pub const fn coords(&self) -> &Point {
        &self.coords
    }

    /// Restrained directions.
    #[must_use]
    pub const fn fixity(&self) -> [bool; 3] {
        self.fixity
    }

    /// Replace the restrained directions.
    pub fn set_fixity(&mut self, fixity: [bool; 3]) {
        self.fixity = fixity;
    }

    /// Trial displacement.
    #[must_use]
    pub fn displacement(&self) -> &Vector3<f64> {
        self.displacement.trial()
    }

    /// Last committed displacement.
    #[must_use]
    pub fn committed_displacement(&self) -> &Vector3<f64> {
        self.displacement.committed()
    }

    /// Replace the trial displacement.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NonFinite`](crate::StateError::NonFinite) when a
    /// component is not finite; the trial state is left unchanged.
    pub fn set_trial_displacement(&mut self, displacement: Vector3<f64>) -> StateResult<()> {
        for component in displacement.iter() {
            finite("displacement", *component)?;
        }
        self.displacement.set_trial(displacement);
        Ok(())
    }

    /// Add `increment` to the trial displacement.
    ///
    /// # Errors
    ///
    /// Same as [`Node::set_trial_displacement`].
    pub fn increment_trial_displacement(&mut self, increment: &Vector3<f64>) -> StateResult<()> {
        self.set_trial_displacement(self.displacement.trial() + increment)
    }

    /// Snapshot handed to connected elements.
    #[must_use]
    pub fn state(&self) -> NodeState {
        NodeState {
            coords: self.coords,
            displacement: *self.displacement.trial(),
        }
    }
}

impl Tagged for Node {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::NODE
    }
}

impl Stateful for Node {
    fn commit_state(&mut self) -> StateResult<()> {
        self.displacement.commit();
        Ok(())
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        self.displacement.revert_to_last_commit();
        Ok(())
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        self.displacement.revert_to_start();
        Ok(())
    }
}

fn fixity_bits(fixity: [bool; 3]) -> i64 {
    fixity
        .iter()
        .enumerate()
        .filter(|(_, fixed)| **fixed)
        .map(|(axis, _)| 1_i64 << axis)
        .sum()
}

impl Movable for Node {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        DISPLACEMENT + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_doubles(COORDS, self.coords.as_slice())?;
        ctx.send_int(FIXITY, fixity_bits(self.fixity))?;
        self.displacement.send(ctx, DISPLACEMENT)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.coords = Vector3::from(ctx.recv_doubles::<3>(COORDS)?);
        let bits = ctx.recv_int(FIXITY)?;
        self.fixity = [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0];
        self.displacement.recv(ctx, DISPLACEMENT)
    }
}
