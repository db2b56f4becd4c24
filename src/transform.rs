//! Coordinate transformations between element and global kinematics.

use std::fmt::Debug;

use nalgebra::{Matrix3, Vector3};

use crate::context::ExchangeContext;
use crate::errors::{ExchangeResult, StateError, StateResult};
use crate::geometry::NodeState;
use crate::movable::{Movable, MovableBase};
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{finite, Stateful, TrialState};
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};

/// Maps the end states of a two-node member onto its axial deformation.
pub trait CrdTransf: Movable + Stateful + Debug + Send {
    /// Compute the trial kinematics from the end node states.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ZeroLength`] for coincident nodes.
    fn update(&mut self, first: &NodeState, second: &NodeState) -> StateResult<()>;

    /// Undeformed length.
    fn initial_length(&self) -> f64;

    /// Trial elongation.
    fn elongation(&self) -> f64;

    /// Unit vector from the first to the second node used for the stiffness.
    fn direction(&self) -> Vector3<f64>;

    /// Stiffness block contributed by an axial force through rotation of the
    /// member, zero for small-displacement transformations.
    fn geometric_stiffness(&self, _axial_force: f64) -> Matrix3<f64> {
        Matrix3::zeros()
    }
}

const AXIS: usize = FIRST_FREE_SLOT;
const KINEMATICS: usize = FIRST_FREE_SLOT + 1;

/// Returns the undeformed axis, refusing coincident nodes.
fn initial_axis(first: &NodeState, second: &NodeState) -> StateResult<Vector3<f64>> {
    let axis = second.coords - first.coords;
    if axis.norm() <= f64::EPSILON {
        return Err(StateError::ZeroLength);
    }
    Ok(axis)
}

/// Small-displacement transformation: the member direction never changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinearCrdTransf {
    base: MovableBase,
    axis: Vector3<f64>,
    elongation: TrialState<f64>,
}

impl LinearCrdTransf {
    /// Create a transformation.
    #[must_use]
    pub fn new(tag: Tag) -> Self {
        Self {
            base: MovableBase::new(tag),
            ..Self::default()
        }
    }
}

impl Tagged for LinearCrdTransf {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::LINEAR_TRANSF
    }
}

impl Stateful for LinearCrdTransf {
    fn commit_state(&mut self) -> StateResult<()> {
        self.elongation.commit();
        Ok(())
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        self.elongation.revert_to_last_commit();
        Ok(())
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        self.elongation.revert_to_start();
        Ok(())
    }
}

impl CrdTransf for LinearCrdTransf {
    fn update(&mut self, first: &NodeState, second: &NodeState) -> StateResult<()> {
        self.axis = initial_axis(first, second)?;
        let relative = second.displacement - first.displacement;
        let elongation = finite("elongation", self.direction().dot(&relative))?;
        self.elongation.set_trial(elongation);
        Ok(())
    }

    fn initial_length(&self) -> f64 {
        self.axis.norm()
    }

    fn elongation(&self) -> f64 {
        *self.elongation.trial()
    }

    fn direction(&self) -> Vector3<f64> {
        self.axis.normalize()
    }
}

impl Movable for LinearCrdTransf {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        KINEMATICS + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_doubles(AXIS, self.axis.as_slice())?;
        self.elongation.send(ctx, KINEMATICS)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.axis = Vector3::from(ctx.recv_doubles::<3>(AXIS)?);
        self.elongation.recv(ctx, KINEMATICS)
    }
}

/// Corotational transformation following the rigid rotation of the member.
///
/// The deformed chord is the state variable; its length gives the elongation
/// and its direction the stiffness orientation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorotCrdTransf {
    base: MovableBase,
    axis: Vector3<f64>,
    chord: TrialState<Vector3<f64>>,
}

impl CorotCrdTransf {
    /// Create a transformation.
    #[must_use]
    pub fn new(tag: Tag) -> Self {
        Self {
            base: MovableBase::new(tag),
            ..Self::default()
        }
    }

    /// Trial deformed length.
    #[must_use]
    pub fn current_length(&self) -> f64 {
        self.chord.trial().norm()
    }
}

impl Tagged for CorotCrdTransf {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::COROT_TRANSF
    }
}

impl Stateful for CorotCrdTransf {
    fn commit_state(&mut self) -> StateResult<()> {
        self.chord.commit();
        Ok(())
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        self.chord.revert_to_last_commit();
        Ok(())
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        self.chord.revert_to_start();
        Ok(())
    }
}

impl CrdTransf for CorotCrdTransf {
    fn update(&mut self, first: &NodeState, second: &NodeState) -> StateResult<()> {
        let axis = initial_axis(first, second)?;
        if axis != self.axis {
            self.axis = axis;
            self.chord.reset(axis);
        }
        let chord = second.current() - first.current();
        for component in chord.iter() {
            finite("chord", *component)?;
        }
        if chord.norm() <= f64::EPSILON {
            return Err(StateError::ZeroLength);
        }
        self.chord.set_trial(chord);
        Ok(())
    }

    fn initial_length(&self) -> f64 {
        self.axis.norm()
    }

    fn elongation(&self) -> f64 {
        self.current_length() - self.initial_length()
    }

    fn direction(&self) -> Vector3<f64> {
        self.chord.trial().normalize()
    }

    fn geometric_stiffness(&self, axial_force: f64) -> Matrix3<f64> {
        let direction = self.direction();
        let projector = Matrix3::identity() - direction * direction.transpose();
        projector * (axial_force / self.current_length())
    }
}

impl Movable for CorotCrdTransf {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        KINEMATICS + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_doubles(AXIS, self.axis.as_slice())?;
        self.chord.send(ctx, KINEMATICS)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.axis = Vector3::from(ctx.recv_doubles::<3>(AXIS)?);
        self.chord.recv(ctx, KINEMATICS)
    }
}
