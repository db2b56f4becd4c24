//! Two-node axial elements.

use std::fmt::Debug;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::context::{BrokedMeta, ExchangeContext, OptionalMeta};
use crate::errors::{ExchangeError, ExchangeResult, StateError, StateResult};
use crate::geometry::{axial_forces, axial_stiffness, to_dynamic, two_node_block, NodeState};
use crate::material::{ElasticMaterial, UniaxialMaterial};
use crate::movable::{Movable, MovableBase};
use crate::section::{FiberSection, Section};
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{accumulate, Stateful};
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};
use crate::transform::CrdTransf;

/// A finite element connecting nodes of a [`Domain`](crate::Domain).
pub trait Element: Movable + Stateful + Debug + Send {
    /// Tags of the connected nodes, in element order.
    fn node_tags(&self) -> &[Tag];

    /// Compute the trial response from the states of the connected nodes,
    /// given in the order of [`Element::node_tags`].
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] when the node count is wrong or a member
    /// rejects its trial input.
    fn update(&mut self, nodes: &[NodeState]) -> StateResult<()>;

    /// Trial tangent stiffness, three translations per node.
    fn tangent_stiffness(&self) -> DMatrix<f64>;

    /// Trial internal nodal forces, three per node.
    fn resisting_force(&self) -> DVector<f64>;

    /// Trial axial force, positive in tension.
    fn axial_force(&self) -> f64;
}

// Layout shared by every two-node element; variants append after
// `CONNECTIVITY_SLOTS`.
const NODES: usize = FIRST_FREE_SLOT;
const AXIS: usize = FIRST_FREE_SLOT + 1;
const TRANSF: OptionalMeta = OptionalMeta {
    flag_bit: 0,
    class_tag_pos: FIRST_FREE_SLOT + 2,
    db_tag_pos: FIRST_FREE_SLOT + 3,
};
const CONNECTIVITY_SLOTS: usize = FIRST_FREE_SLOT + 4;

/// End nodes, undeformed axis and optional transformation of a two-node member.
#[derive(Debug, Default)]
struct Connectivity {
    nodes: [Tag; 2],
    axis: Vector3<f64>,
    transf: Option<Box<dyn CrdTransf>>,
}

impl Connectivity {
    fn new(nodes: [Tag; 2]) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    /// Returns the trial axial strain.
    fn update(&mut self, nodes: &[NodeState]) -> StateResult<f64> {
        let [first, second] = nodes else {
            return Err(StateError::Connectivity {
                expected: 2,
                found: nodes.len(),
            });
        };
        let axis = second.coords - first.coords;
        if axis.norm() <= f64::EPSILON {
            return Err(StateError::ZeroLength);
        }
        self.axis = axis;
        match self.transf.as_mut() {
            Some(transf) => {
                transf.update(first, second)?;
                Ok(transf.elongation() / transf.initial_length())
            }
            None => {
                let relative = second.displacement - first.displacement;
                Ok(axis.normalize().dot(&relative) / axis.norm())
            }
        }
    }

    fn length(&self) -> f64 {
        self.transf
            .as_ref()
            .map_or_else(|| self.axis.norm(), |transf| transf.initial_length())
    }

    fn direction(&self) -> Vector3<f64> {
        self.transf
            .as_ref()
            .map_or_else(|| self.axis.normalize(), |transf| transf.direction())
    }

    fn stiffness(&self, axial_rigidity: f64, axial_force: f64) -> DMatrix<f64> {
        let mut matrix = axial_stiffness(&self.direction(), axial_rigidity / self.length());
        if let Some(transf) = self.transf.as_ref() {
            matrix += two_node_block(&transf.geometric_stiffness(axial_force));
        }
        to_dynamic(&matrix)
    }

    fn forces(&self, axial_force: f64) -> DVector<f64> {
        axial_forces(&self.direction(), axial_force)
    }

    fn transition(
        &mut self,
        step: impl FnOnce(&mut Box<dyn CrdTransf>) -> StateResult<()>,
    ) -> StateResult<()> {
        self.transf.as_mut().map_or(Ok(()), step)
    }

    fn send(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let nodes = self.nodes.map(|tag| i64::from(tag.0));
        ctx.send_ints(NODES, &nodes)?;
        ctx.send_doubles(AXIS, self.axis.as_slice())?;
        ctx.send_optional(TRANSF, self.transf.as_deref_mut())
    }

    fn recv(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let nodes = ctx.recv_ints(NODES)?;
        let &[first, second] = nodes.as_slice() else {
            return Err(ExchangeError::SizeMismatch {
                position: Some(NODES),
                expected: 2,
                found: nodes.len(),
            });
        };
        let tag = |value: i64| {
            u32::try_from(value)
                .map(Tag)
                .map_err(|_| ExchangeError::InvalidHandle {
                    position: NODES,
                    value,
                })
        };
        self.nodes = [tag(first)?, tag(second)?];
        self.axis = Vector3::from(ctx.recv_doubles::<3>(AXIS)?);
        self.transf = ctx.recv_optional::<dyn CrdTransf>(TRANSF)?;
        Ok(())
    }
}

const AREA: usize = CONNECTIVITY_SLOTS;
const MATERIAL: BrokedMeta = BrokedMeta {
    class_tag_pos: CONNECTIVITY_SLOTS + 1,
    db_tag_pos: CONNECTIVITY_SLOTS + 2,
};

/// Bar of constant area made of a uniaxial material.
#[derive(Debug)]
pub struct TrussElement {
    base: MovableBase,
    connectivity: Connectivity,
    area: f64,
    material: Box<dyn UniaxialMaterial>,
}

impl Default for TrussElement {
    fn default() -> Self {
        Self {
            base: MovableBase::default(),
            connectivity: Connectivity::default(),
            area: 0.0,
            material: Box::new(ElasticMaterial::default()),
        }
    }
}

impl TrussElement {
    /// Create a bar between two nodes.
    #[must_use]
    pub fn new(nodes: [Tag; 2], area: f64, material: Box<dyn UniaxialMaterial>) -> Self {
        Self {
            base: MovableBase::new(Tag::UNASSIGNED),
            connectivity: Connectivity::new(nodes),
            area,
            material,
        }
    }

    /// Use `transf` to compute the member kinematics.
    #[must_use]
    pub fn with_transf(mut self, transf: Box<dyn CrdTransf>) -> Self {
        self.connectivity.transf = Some(transf);
        self
    }

    /// Cross-sectional area.
    #[must_use]
    pub const fn area(&self) -> f64 {
        self.area
    }

    /// Material of the bar.
    #[must_use]
    pub fn material(&self) -> &dyn UniaxialMaterial {
        self.material.as_ref()
    }

    /// Coordinate transformation, when one was attached.
    #[must_use]
    pub fn transf(&self) -> Option<&dyn CrdTransf> {
        self.connectivity.transf.as_deref()
    }
}

impl Tagged for TrussElement {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::TRUSS
    }
}

impl Stateful for TrussElement {
    fn commit_state(&mut self) -> StateResult<()> {
        accumulate([
            self.material.commit_state(),
            self.connectivity.transition(|transf| transf.commit_state()),
        ])
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        accumulate([
            self.material.revert_to_last_commit(),
            self.connectivity
                .transition(|transf| transf.revert_to_last_commit()),
        ])
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        accumulate([
            self.material.revert_to_start(),
            self.connectivity.transition(|transf| transf.revert_to_start()),
        ])
    }
}

impl Element for TrussElement {
    fn node_tags(&self) -> &[Tag] {
        &self.connectivity.nodes
    }

    fn update(&mut self, nodes: &[NodeState]) -> StateResult<()> {
        let strain = self.connectivity.update(nodes)?;
        self.material.set_trial_strain(strain)
    }

    fn tangent_stiffness(&self) -> DMatrix<f64> {
        self.connectivity
            .stiffness(self.area * self.material.tangent(), self.axial_force())
    }

    fn resisting_force(&self) -> DVector<f64> {
        self.connectivity.forces(self.axial_force())
    }

    fn axial_force(&self) -> f64 {
        self.area * self.material.stress()
    }
}

impl Movable for TrussElement {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        MATERIAL.db_tag_pos + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.connectivity.send(ctx)?;
        ctx.send_scalar(AREA, self.area)?;
        ctx.send_broked(MATERIAL, self.material.as_mut())
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.connectivity.recv(ctx)?;
        self.area = ctx.recv_scalar(AREA)?;
        ctx.recv_broked_into(MATERIAL, &mut self.material)
    }
}

const SECTION: BrokedMeta = BrokedMeta {
    class_tag_pos: CONNECTIVITY_SLOTS,
    db_tag_pos: CONNECTIVITY_SLOTS + 1,
};

/// Bar whose axial response comes from a cross-section.
#[derive(Debug)]
pub struct SectionTrussElement {
    base: MovableBase,
    connectivity: Connectivity,
    section: Box<dyn Section>,
}

impl Default for SectionTrussElement {
    fn default() -> Self {
        Self {
            base: MovableBase::default(),
            connectivity: Connectivity::default(),
            section: Box::new(FiberSection::default()),
        }
    }
}

impl SectionTrussElement {
    /// Create a bar between two nodes.
    #[must_use]
    pub fn new(nodes: [Tag; 2], section: Box<dyn Section>) -> Self {
        Self {
            base: MovableBase::new(Tag::UNASSIGNED),
            connectivity: Connectivity::new(nodes),
            section,
        }
    }

    /// Use `transf` to compute the member kinematics.
    #[must_use]
    pub fn with_transf(mut self, transf: Box<dyn CrdTransf>) -> Self {
        self.connectivity.transf = Some(transf);
        self
    }

    /// Section of the bar.
    #[must_use]
    pub fn section(&self) -> &dyn Section {
        self.section.as_ref()
    }
}

impl Tagged for SectionTrussElement {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::SECTION_TRUSS
    }
}

impl Stateful for SectionTrussElement {
    fn commit_state(&mut self) -> StateResult<()> {
        accumulate([
            self.section.commit_state(),
            self.connectivity.transition(|transf| transf.commit_state()),
        ])
    }

    fn revert_to_last_commit(&mut self) -> StateResult<()> {
        accumulate([
            self.section.revert_to_last_commit(),
            self.connectivity
                .transition(|transf| transf.revert_to_last_commit()),
        ])
    }

    fn revert_to_start(&mut self) -> StateResult<()> {
        accumulate([
            self.section.revert_to_start(),
            self.connectivity.transition(|transf| transf.revert_to_start()),
        ])
    }
}

impl Element for SectionTrussElement {
    fn node_tags(&self) -> &[Tag] {
        &self.connectivity.nodes
    }

    fn update(&mut self, nodes: &[NodeState]) -> StateResult<()> {
        let strain = self.connectivity.update(nodes)?;
        self.section.set_trial_deformation(strain)
    }

    fn tangent_stiffness(&self) -> DMatrix<f64> {
        self.connectivity
            .stiffness(self.section.axial_stiffness(), self.axial_force())
    }

    fn resisting_force(&self) -> DVector<f64> {
        self.connectivity.forces(self.axial_force())
    }

    fn axial_force(&self) -> f64 {
        self.section.axial_force()
    }
}

impl Movable for SectionTrussElement {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        SECTION.db_tag_pos + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.connectivity.send(ctx)?;
        ctx.send_broked(SECTION, self.section.as_mut())
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.connectivity.recv(ctx)?;
        ctx.recv_broked_into(SECTION, &mut self.section)
    }
}
