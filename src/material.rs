//! Uniaxial stress-strain laws.

use std::fmt::Debug;

use crate::context::ExchangeContext;
use crate::errors::{ExchangeResult, StateResult};
use crate::movable::{Movable, MovableBase};
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{finite, Stateful, TrialState};
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};

/// A one-dimensional constitutive law driven by strain.
pub trait UniaxialMaterial: Movable + Stateful + Debug + Send {
    /// Replace the trial strain and update the trial response.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NonFinite`](crate::StateError::NonFinite) for a
    /// non-finite strain.
    fn set_trial_strain(&mut self, strain: f64) -> StateResult<()>;

    /// Trial strain.
    fn strain(&self) -> f64;

    /// Trial stress.
    fn stress(&self) -> f64;

    /// Trial tangent modulus.
    fn tangent(&self) -> f64;
}

const MODULUS: usize = FIRST_FREE_SLOT;
const STRAIN: usize = FIRST_FREE_SLOT + 1;

/// Linear elastic material.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ElasticMaterial {
    base: MovableBase,
    modulus: f64,
    strain: TrialState<f64>,
}

impl ElasticMaterial {
    /// Create a material with Young's modulus `modulus`.
    #[must_use]
    pub fn new(tag: Tag, modulus: f64) -> Self {
        Self {
            base: MovableBase::new(tag),
            modulus,
            strain: TrialState::default(),
        }
    }

    /// Young's modulus.
    #[must_use]
    pub const fn modulus(&self) -> f64 {
        self.modulus
    }
}

impl Tagged for ElasticMaterial {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::ELASTIC_MATERIAL
    }
}

impl Stateful for ElasticMaterial {
    fn commit_state(&mut self) -> StateResult<()> {
        self.strain.commit();
        Ok(())
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        self.strain.revert_to_last_commit();
        Ok(())
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        self.strain.revert_to_start();
        Ok(())
    }
}

impl UniaxialMaterial for ElasticMaterial {
    fn set_trial_strain(&mut self, strain: f64) -> StateResult<()> {
        self.strain.set_trial(finite("strain", strain)?);
        Ok(())
    }

    fn strain(&self) -> f64 {
        *self.strain.trial()
    }

    fn stress(&self) -> f64 {
        self.modulus * self.strain()
    }

    fn tangent(&self) -> f64 {
        self.modulus
    }
}

impl Movable for ElasticMaterial {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        STRAIN + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_scalar(MODULUS, self.modulus)?;
        self.strain.send(ctx, STRAIN)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.modulus = ctx.recv_scalar(MODULUS)?;
        self.strain.recv(ctx, STRAIN)
    }
}

// Extends the elastic layout; the yield stress travels with the modulus.
const PLASTIC_STRAIN: usize = STRAIN + 1;

/// Elastic perfectly plastic material with a symmetric yield stress.
///
/// The committed plastic strain is the only history variable; the trial
/// plastic strain follows from a return mapping on every trial strain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ElasticPerfectlyPlasticMaterial {
    base: MovableBase,
    modulus: f64,
    yield_stress: f64,
    strain: TrialState<f64>,
    plastic_strain: TrialState<f64>,
}

impl ElasticPerfectlyPlasticMaterial {
    /// Create a material with Young's modulus `modulus` yielding at
    /// `yield_stress`.
    #[must_use]
    pub fn new(tag: Tag, modulus: f64, yield_stress: f64) -> Self {
        Self {
            base: MovableBase::new(tag),
            modulus,
            yield_stress: yield_stress.abs(),
            strain: TrialState::default(),
            plastic_strain: TrialState::default(),
        }
    }

    /// Young's modulus.
    #[must_use]
    pub const fn modulus(&self) -> f64 {
        self.modulus
    }

    /// Yield stress.
    #[must_use]
    pub const fn yield_stress(&self) -> f64 {
        self.yield_stress
    }

    /// Trial plastic strain.
    #[must_use]
    pub fn plastic_strain(&self) -> f64 {
        *self.plastic_strain.trial()
    }

    /// Return `true` while the trial state flows plastically.
    #[must_use]
    pub fn is_yielding(&self) -> bool {
        !self.plastic_strain.is_settled()
    }
}

impl Tagged for ElasticPerfectlyPlasticMaterial {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::ELASTIC_PP_MATERIAL
    }
}

impl Stateful for ElasticPerfectlyPlasticMaterial {
    fn commit_state(&mut self) -> StateResult<()> {
        self.strain.commit();
        self.plastic_strain.commit();
        Ok(())
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        self.strain.revert_to_last_commit();
        self.plastic_strain.revert_to_last_commit();
        Ok(())
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        self.strain.revert_to_start();
        self.plastic_strain.revert_to_start();
        Ok(())
    }
}

impl UniaxialMaterial for ElasticPerfectlyPlasticMaterial {
    fn set_trial_strain(&mut self, strain: f64) -> StateResult<()> {
        let strain = finite("strain", strain)?;
        let committed_plastic = *self.plastic_strain.committed();
        let elastic_stress = self.modulus * (strain - committed_plastic);
        let plastic = if elastic_stress.abs() > self.yield_stress {
            strain - elastic_stress.signum() * self.yield_stress / self.modulus
        } else {
            committed_plastic
        };
        self.strain.set_trial(strain);
        self.plastic_strain.set_trial(plastic);
        Ok(())
    }

    fn strain(&self) -> f64 {
        *self.strain.trial()
    }

    fn stress(&self) -> f64 {
        self.modulus * (self.strain() - self.plastic_strain())
    }

    fn tangent(&self) -> f64 {
        if self.is_yielding() {
            0.0
        } else {
            self.modulus
        }
    }
}

impl Movable for ElasticPerfectlyPlasticMaterial {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        PLASTIC_STRAIN + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_doubles(MODULUS, &[self.modulus, self.yield_stress])?;
        self.strain.send(ctx, STRAIN)?;
        self.plastic_strain.send(ctx, PLASTIC_STRAIN)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        [self.modulus, self.yield_stress] = ctx.recv_doubles::<2>(MODULUS)?;
        self.strain.recv(ctx, STRAIN)?;
        self.plastic_strain.recv(ctx, PLASTIC_STRAIN)
    }
}
