#![warn(clippy::pedantic)]

use approx::assert_relative_eq;
use femstate::{
    force, point, AnalysisError, Domain, ElasticPerfectlyPlasticMaterial, Node,
    PlainPattern, StaticAnalysis, Tag, TrussElement,
};

#[derive(Debug, Clone, Copy)]
struct CantileverGeometry {
    fixed_joint: Tag,
    loaded_joint: Tag,
    member: Tag,
}

#[derive(Debug, Clone, Copy)]
struct CantileverProperties {
    area: f64,
    elastic_modulus: f64,
    yield_strength: f64,
    axial_load: f64,
}

impl Default for CantileverProperties {
    fn default() -> Self {
        Self {
            area: 0.01,
            elastic_modulus: 200.0e9,
            yield_strength: 250.0e6,
            axial_load: -1_000.0,
        }
    }
}

fn build_cantilever(properties: CantileverProperties) -> (Domain, CantileverGeometry) {
    let mut domain = Domain::new();
    let fixed_joint = domain.add_node(Node::new(point(0.0, 0.0, 0.0)).with_fixity([true; 3]));
    let loaded_joint =
        domain.add_node(Node::new(point(1.0, 0.0, 0.0)).with_fixity([false, true, true]));
    let material = ElasticPerfectlyPlasticMaterial::new(
        Tag(1),
        properties.elastic_modulus,
        properties.yield_strength,
    );
    let member = domain
        .add_element(Box::new(TrussElement::new(
            [fixed_joint, loaded_joint],
            properties.area,
            Box::new(material),
        )))
        .expect("member connects existing joints");
    domain
        .add_pattern(Box::new(PlainPattern::new().with_load(
            loaded_joint,
            force(properties.axial_load, 0.0, 0.0),
        )))
        .expect("axial load targets an existing joint");

    (
        domain,
        CantileverGeometry {
            fixed_joint,
            loaded_joint,
            member,
        },
    )
}

#[test]
fn builds_expected_topology() {
    let (domain, geometry) = build_cantilever(CantileverProperties::default());

    assert_eq!(domain.node_count(), 2);
    assert_eq!(domain.element_count(), 1);
    assert_eq!(
        domain
            .connected_elements(geometry.fixed_joint)
            .expect("fixed joint exists"),
        vec![geometry.member]
    );
}

#[test]
fn cantilever_response_matches_closed_form_solution() {
    let properties = CantileverProperties::default();
    let (mut domain, geometry) = build_cantilever(properties);

    let report = StaticAnalysis::default()
        .run(&mut domain, None)
        .expect("cantilever analysis converges");
    assert_eq!(report.steps, 10);

    let displacement = *domain
        .node(geometry.loaded_joint)
        .expect("loaded joint exists")
        .committed_displacement();
    let axial_force = domain
        .element(geometry.member)
        .expect("member exists")
        .axial_force();

    let expected_displacement =
        properties.axial_load * 1.0 / (properties.area * properties.elastic_modulus);

    assert_relative_eq!(displacement.x, expected_displacement, max_relative = 1.0e-9);
    assert!(displacement.y.abs() < f64::EPSILON);
    assert!(displacement.z.abs() < f64::EPSILON);
    assert_relative_eq!(axial_force, properties.axial_load, max_relative = 1.0e-9);
}

#[test]
fn overloaded_cantilever_stops_at_its_plastic_capacity() {
    let properties = CantileverProperties {
        axial_load: 3.0e6,
        ..CantileverProperties::default()
    };
    let (mut domain, geometry) = build_cantilever(properties);
    let capacity = properties.yield_strength * properties.area / properties.axial_load;

    let error = StaticAnalysis::default()
        .run(&mut domain, None)
        .expect_err("load exceeds the squash load");
    let AnalysisError::NotConverged {
        load_factor,
        increment,
    } = error
    else {
        panic!("expected a convergence failure, got {error:?}");
    };

    assert!(load_factor > 0.8);
    assert!(load_factor <= capacity * (1.0 + 1.0e-6));
    assert!(increment < 0.1 / 64.0);
    // The domain stays at its last converged step.
    assert_relative_eq!(domain.committed_load_factor(), load_factor, epsilon = 1.0e-12);
    let axial_force = domain
        .element(geometry.member)
        .expect("member exists")
        .axial_force();
    assert_relative_eq!(
        axial_force,
        load_factor * properties.axial_load,
        max_relative = 1.0e-6
    );
}
