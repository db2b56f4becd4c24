use approx::assert_relative_eq;
use femstate::{
    point, CommitTag, CorotCrdTransf, Domain, ElasticPerfectlyPlasticMaterial, LoopbackChannel,
    Node, Stateful, Tag, TrussElement, UniaxialMaterial,
};
use nalgebra::Vector3;

const AREA: f64 = 0.01;
const MODULUS: f64 = 200.0e9;
const YIELD_STRESS: f64 = 250.0e6;

fn plastic_bar() -> (Domain, Tag, Tag) {
    let mut domain = Domain::new();
    let fixed = domain.add_node(Node::new(point(0.0, 0.0, 0.0)).with_fixity([true; 3]));
    let free = domain.add_node(Node::new(point(1.0, 0.0, 0.0)).with_fixity([false, true, true]));
    let material = ElasticPerfectlyPlasticMaterial::new(Tag(1), MODULUS, YIELD_STRESS);
    let element = domain
        .add_element(Box::new(
            TrussElement::new([fixed, free], AREA, Box::new(material))
                .with_transf(Box::new(CorotCrdTransf::new(Tag(1)))),
        ))
        .expect("nodes exist");
    (domain, free, element)
}

fn stretch(domain: &mut Domain, node: Tag, ux: f64) {
    domain
        .node_mut(node)
        .expect("node exists")
        .set_trial_displacement(Vector3::new(ux, 0.0, 0.0))
        .expect("finite displacement");
    domain.update_elements().expect("bar accepts the trial state");
}

fn axial_force(domain: &Domain, element: Tag) -> f64 {
    domain.element(element).expect("element exists").axial_force()
}

#[test]
fn material_keeps_its_plastic_history_across_commits() {
    let mut material = ElasticPerfectlyPlasticMaterial::new(Tag(1), MODULUS, YIELD_STRESS);
    material.set_trial_strain(2.0e-3).expect("finite");
    assert!(material.is_yielding());
    assert_relative_eq!(material.stress(), YIELD_STRESS);
    material.commit_state().expect("commit");
    assert!(!material.is_yielding());
    assert_relative_eq!(material.plastic_strain(), 7.5e-4, max_relative = 1.0e-12);

    material.set_trial_strain(0.0).expect("finite");
    assert_relative_eq!(material.stress(), -150.0e6, max_relative = 1.0e-9);
    material.revert_to_last_commit().expect("revert");
    assert_relative_eq!(material.strain(), 2.0e-3);

    material.revert_to_start().expect("revert");
    assert_relative_eq!(material.plastic_strain(), 0.0);
    assert_relative_eq!(material.stress(), 0.0);
}

#[test]
fn domain_sweeps_undo_trial_yielding() {
    let (mut domain, free, element) = plastic_bar();

    stretch(&mut domain, free, 2.0e-3);
    assert_relative_eq!(axial_force(&domain, element), YIELD_STRESS * AREA, max_relative = 1.0e-9);
    domain.commit().expect("commit");

    stretch(&mut domain, free, 0.0);
    assert_relative_eq!(axial_force(&domain, element), -150.0e6 * AREA, max_relative = 1.0e-6);

    domain.revert_to_last_commit().expect("revert");
    let node = domain.node(free).expect("node exists");
    assert_relative_eq!(node.displacement().x, 2.0e-3);
    assert_relative_eq!(axial_force(&domain, element), YIELD_STRESS * AREA, max_relative = 1.0e-9);

    domain.revert_to_start().expect("revert");
    assert_eq!(domain.step(), 0);
    assert_relative_eq!(axial_force(&domain, element), 0.0);
}

#[test]
fn checkpoint_carries_the_committed_history() {
    let (mut domain, free, element) = plastic_bar();
    stretch(&mut domain, free, 2.0e-3);
    domain.commit().expect("commit");

    let mut channel = LoopbackChannel::new();
    domain.checkpoint(&mut channel, CommitTag(1)).expect("checkpoint");
    let mut copy = Domain::new();
    copy.restore(&mut channel, CommitTag(1)).expect("restore");
    assert!(channel.is_empty());

    // Unloading the copy follows the elastic branch shifted by the plastic strain.
    stretch(&mut copy, free, 0.0);
    assert_relative_eq!(axial_force(&copy, element), -150.0e6 * AREA, max_relative = 1.0e-6);
    assert_eq!(copy.step(), 1);
}
