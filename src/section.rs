//! Cross-sections aggregating fibers of uniaxial material.

use std::fmt::Debug;

use nalgebra::DVector;

use crate::context::ExchangeContext;
use crate::errors::{ExchangeError, ExchangeResult, StateResult};
use crate::material::UniaxialMaterial;
use crate::movable::{Movable, MovableBase};
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{accumulate, Stateful};
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};

/// Axial section response driven by a generalized axial strain.
pub trait Section: Movable + Stateful + Debug + Send {
    /// Impose the trial axial strain on the section.
    ///
    /// # Errors
    ///
    /// Returns every fiber failure folded by [`accumulate`].
    fn set_trial_deformation(&mut self, strain: f64) -> StateResult<()>;

    /// Trial axial force resultant.
    fn axial_force(&self) -> f64;

    /// Trial axial stiffness `EA`.
    fn axial_stiffness(&self) -> f64;
}

const AREAS: usize = FIRST_FREE_SLOT;
const MATERIALS: usize = FIRST_FREE_SLOT + 1;

/// Section made of parallel fibers sharing the same axial strain.
#[derive(Debug, Default)]
pub struct FiberSection {
    base: MovableBase,
    areas: Vec<f64>,
    materials: Vec<Box<dyn UniaxialMaterial>>,
}

impl FiberSection {
    /// Create an empty section.
    #[must_use]
    pub fn new(tag: Tag) -> Self {
        Self {
            base: MovableBase::new(tag),
            areas: Vec::new(),
            materials: Vec::new(),
        }
    }

    /// Add a fiber of `area` made of `material`.
    #[must_use]
    pub fn with_fiber(mut self, area: f64, material: Box<dyn UniaxialMaterial>) -> Self {
        self.areas.push(area);
        self.materials.push(material);
        self
    }

    /// Number of fibers.
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.areas.len()
    }

    /// Fibers as `(area, material)` pairs.
    pub fn fibers(&self) -> impl Iterator<Item = (f64, &(dyn UniaxialMaterial + 'static))> + '_ {
        self.areas
            .iter()
            .copied()
            .zip(self.materials.iter().map(|material| &**material))
    }
}

impl Tagged for FiberSection {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::FIBER_SECTION
    }
}

impl Stateful for FiberSection {
    fn commit_state(&mut self) -> StateResult<()> {
        accumulate(self.materials.iter_mut().map(|material| material.commit_state()))
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        accumulate(
            self.materials
                .iter_mut()
                .map(|material| material.revert_to_last_commit()),
        )
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        accumulate(
            self.materials
                .iter_mut()
                .map(|material| material.revert_to_start()),
        )
    }
}

impl Section for FiberSection {
    fn set_trial_deformation(&mut self, strain: f64) -> StateResult<()> {
        accumulate(
            self.materials
                .iter_mut()
                .map(|material| material.set_trial_strain(strain)),
        )
    }

    fn axial_force(&self) -> f64 {
        self.fibers()
            .map(|(area, material)| area * material.stress())
            .sum()
    }

    fn axial_stiffness(&self) -> f64 {
        self.fibers()
            .map(|(area, material)| area * material.tangent())
            .sum()
    }
}

impl Movable for FiberSection {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        MATERIALS + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        ctx.send_vector(AREAS, &DVector::from_column_slice(&self.areas))?;
        ctx.send_broked_vec(MATERIALS, &mut self.materials)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let areas = ctx.recv_vector(AREAS)?;
        let materials = ctx.recv_broked_vec::<dyn UniaxialMaterial>(MATERIALS)?;
        if materials.len() != areas.len() {
            return Err(ExchangeError::SizeMismatch {
                position: Some(MATERIALS),
                expected: areas.len(),
                found: materials.len(),
            });
        }
        self.areas = areas.iter().copied().collect();
        self.materials = materials;
        Ok(())
    }
}
