//! A two-bar plane truss loaded at its apex.
//!
//! The left bar follows its rotation through a corotational transformation and
//! the right bar is described by a fiber section, so every checkpoint carries
//! nested materials, a section and a transformation.

use femstate::{
    force, point, ConstantPattern, CorotCrdTransf, Domain, DomainError, ElasticMaterial,
    ElasticPerfectlyPlasticMaterial, FiberSection, Node, PlainPattern, SectionTrussElement,
    Tag, TrussElement,
};

/// Tags of the parts the report looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoModel {
    /// Loaded node.
    pub apex: Tag,
    /// Both bars, left then right.
    pub members: [Tag; 2],
}

/// Steel properties shared by both bars.
const MODULUS: f64 = 200.0e9;
const YIELD_STRESS: f64 = 250.0e6;
const AREA: f64 = 1.0e-3;
/// Vertical load at the apex in newtons.
const APEX_LOAD: f64 = -100.0e3;

/// Build the model in a fresh domain.
///
/// # Errors
///
/// Returns a [`DomainError`] when an element cannot be added.
pub fn build() -> Result<(Domain, DemoModel), DomainError> {
    let mut domain = Domain::new();
    let planar = [false, false, true];
    let left = domain.add_node(Node::new(point(0.0, 0.0, 0.0)).with_fixity([true; 3]));
    let right = domain.add_node(Node::new(point(4.0, 0.0, 0.0)).with_fixity([true; 3]));
    let apex = domain.add_node(Node::new(point(2.0, 1.5, 0.0)).with_fixity(planar));

    let left_bar = TrussElement::new(
        [left, apex],
        AREA,
        Box::new(ElasticPerfectlyPlasticMaterial::new(Tag(1), MODULUS, YIELD_STRESS)),
    )
    .with_transf(Box::new(CorotCrdTransf::new(Tag(1))));
    let section = FiberSection::new(Tag(1))
        .with_fiber(
            0.5 * AREA,
            Box::new(ElasticPerfectlyPlasticMaterial::new(Tag(2), MODULUS, YIELD_STRESS)),
        )
        .with_fiber(0.5 * AREA, Box::new(ElasticMaterial::new(Tag(3), MODULUS)));
    let right_bar = SectionTrussElement::new([right, apex], Box::new(section));

    let members = [
        domain.add_element(Box::new(left_bar))?,
        domain.add_element(Box::new(right_bar))?,
    ];
    domain.add_pattern(Box::new(
        PlainPattern::new().with_load(apex, force(0.0, APEX_LOAD, 0.0)),
    ))?;
    domain.add_pattern(Box::new(
        ConstantPattern::new().with_load(apex, force(1.0e3, 0.0, 0.0)),
    ))?;
    Ok((domain, DemoModel { apex, members }))
}
