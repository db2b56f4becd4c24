use std::fmt::Debug;
use std::sync::Arc;

use approx::assert_relative_eq;
use femstate::{
    class_tags, force, point, Broker, BrokerBuilder, ClassTag, CommitTag, ConstantPattern,
    CorotCrdTransf, CrdTransf, Datastore, Domain, ElasticMaterial,
    ElasticPerfectlyPlasticMaterial, Element, ExchangeContext, ExchangeError, ExchangeResult,
    FiberSection, LinearCrdTransf, LoadPattern, LoopbackChannel, Movable, MovableBase, Node,
    NodeState, PlainPattern, Section, SectionTrussElement, StateResult, Stateful, Tag, Tagged,
    TrialState, TrussElement, UniaxialMaterial, FIRST_FREE_SLOT,
};
use nalgebra::{DVector, Vector3};

const SCALED_ELASTIC: ClassTag = ClassTag(7);

/// Material defined outside the crate: an elastic law scaled by `rho` that
/// also carries a vector of calibration weights.
#[derive(Clone, Debug, PartialEq)]
struct ScaledElastic {
    base: MovableBase,
    modulus: f64,
    rho: f64,
    weights: DVector<f64>,
    strain: TrialState<f64>,
}

impl Default for ScaledElastic {
    fn default() -> Self {
        Self {
            base: MovableBase::default(),
            modulus: 0.0,
            rho: 0.0,
            weights: DVector::zeros(0),
            strain: TrialState::default(),
        }
    }
}

const MODULUS: usize = FIRST_FREE_SLOT;
const RHO: usize = FIRST_FREE_SLOT + 1;
const WEIGHTS: usize = FIRST_FREE_SLOT + 2;
const STRAIN: usize = FIRST_FREE_SLOT + 3;

impl Tagged for ScaledElastic {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        SCALED_ELASTIC
    }
}

impl Stateful for ScaledElastic {
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

impl UniaxialMaterial for ScaledElastic {
    fn set_trial_strain(&mut self, strain: f64) -> StateResult<()> {
        self.strain.set_trial(strain);
        Ok(())
    }

    fn strain(&self) -> f64 {
        *self.strain.trial()
    }

    fn stress(&self) -> f64 {
        self.tangent() * self.strain()
    }

    fn tangent(&self) -> f64 {
        self.rho * self.modulus
    }
}

impl Movable for ScaledElastic {
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
        ctx.send_scalar(RHO, self.rho)?;
        ctx.send_vector(WEIGHTS, &self.weights)?;
        self.strain.send(ctx, STRAIN)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.modulus = ctx.recv_scalar(MODULUS)?;
        self.rho = ctx.recv_scalar(RHO)?;
        self.weights = ctx.recv_vector(WEIGHTS)?;
        self.strain.recv(ctx, STRAIN)
    }
}

fn scaled_elastic() -> ScaledElastic {
    let mut material = ScaledElastic {
        base: MovableBase::new(Tag(12)),
        modulus: 200.0e9,
        rho: 2.5,
        weights: DVector::from_vec(vec![1.0, 2.0, 3.0]),
        strain: TrialState::new(0.0),
    };
    material.set_trial_strain(1.0e-4).expect("finite strain");
    material.commit_state().expect("commit");
    material
}

fn broker_with_user_variant() -> Broker {
    Broker::builder()
        .register::<dyn UniaxialMaterial>(class_tags::ELASTIC_MATERIAL, || -> Box<dyn UniaxialMaterial> {
            Box::new(ElasticMaterial::default())
        })
        .register::<dyn UniaxialMaterial>(SCALED_ELASTIC, || -> Box<dyn UniaxialMaterial> {
            Box::new(ScaledElastic::default())
        })
        .register::<dyn Element>(class_tags::TRUSS, || -> Box<dyn Element> {
            Box::new(TrussElement::default())
        })
        .build()
}

#[test]
fn user_variant_round_trips_through_its_family() {
    let broker = broker_with_user_variant();
    let mut channel = LoopbackChannel::new();
    let mut material = scaled_elastic();

    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(3));
    ctx.send_object(&mut material).expect("send");
    let copy = ctx
        .recv_object::<dyn UniaxialMaterial>()
        .expect("registered variant");

    assert_eq!(copy.class_tag(), SCALED_ELASTIC);
    assert_eq!(copy.tag(), Tag(12));
    assert_relative_eq!(copy.tangent(), 2.5 * 200.0e9);
    assert_relative_eq!(copy.strain(), 1.0e-4);
    assert!(channel.is_empty());
}

#[test]
fn user_variant_travels_inside_a_standard_element() {
    let broker = broker_with_user_variant();
    let mut channel = LoopbackChannel::new();
    let mut element = TrussElement::new([Tag(1), Tag(2)], 0.01, Box::new(scaled_elastic()));

    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
    ctx.send_object(&mut element).expect("send");
    let copy = ctx.recv_object::<dyn Element>().expect("recv");

    assert_eq!(copy.node_tags(), &[Tag(1), Tag(2)]);
    let truss = format!("{copy:?}");
    assert!(truss.contains("rho: 2.5"));
}

#[test]
fn unregistered_variant_is_reported_by_class_tag() {
    let broker = Broker::standard();
    let mut channel = LoopbackChannel::new();
    let mut element = TrussElement::new([Tag(1), Tag(2)], 0.01, Box::new(scaled_elastic()));

    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
    ctx.send_object(&mut element).expect("send");
    let error = ctx.recv_object::<dyn Element>().expect_err("material missing");

    match error.root_cause() {
        ExchangeError::UnknownVariant { class_tag, family } => {
            assert_eq!(*class_tag, SCALED_ELASTIC);
            assert!(family.contains("UniaxialMaterial"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn absent_optional_member_never_consults_the_broker() {
    // No coordinate transformation is registered at all.
    let broker = broker_with_user_variant();
    assert!(broker.variants::<dyn CrdTransf>().is_empty());

    let mut channel = LoopbackChannel::new();
    let mut element = TrussElement::new(
        [Tag(4), Tag(5)],
        0.02,
        Box::new(ElasticMaterial::new(Tag(1), 70.0e9)),
    );
    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
    ctx.send_object(&mut element).expect("send");
    let copy = ctx.recv_object::<dyn Element>().expect("recv");
    assert_eq!(copy.node_tags(), &[Tag(4), Tag(5)]);
}

#[test]
fn standard_broker_knows_every_shipped_variant() {
    let broker = Broker::standard();
    assert!(broker.contains::<Node>(class_tags::NODE));
    assert_eq!(
        broker.variants::<dyn UniaxialMaterial>(),
        vec![class_tags::ELASTIC_MATERIAL, class_tags::ELASTIC_PP_MATERIAL]
    );
    assert_eq!(
        broker.variants::<dyn Element>(),
        vec![class_tags::TRUSS, class_tags::SECTION_TRUSS]
    );
    assert_eq!(
        broker.variants::<dyn CrdTransf>(),
        vec![class_tags::LINEAR_TRANSF, class_tags::COROT_TRANSF]
    );
    assert_eq!(
        broker.variants::<dyn LoadPattern>(),
        vec![class_tags::PLAIN_PATTERN, class_tags::CONSTANT_PATTERN]
    );
    assert!(!broker.contains::<dyn Element>(class_tags::NODE));
}

/// Send `original` as a top-level object, rebuild it as a member of family `F`
/// and require every field, nested members included, to match.
fn assert_round_trip<F, M>(original: &mut M)
where
    F: Movable + Debug + ?Sized + 'static,
    M: Movable + Debug,
{
    let broker = Broker::standard();
    let mut channel = LoopbackChannel::new();
    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(4));
    ctx.send_object(original).expect("send");
    let copy = ctx.recv_object::<F>().expect("recv");

    assert_eq!(copy.class_tag(), original.class_tag());
    assert_eq!(copy.base().db_tag(), original.base().db_tag());
    assert_eq!(format!("{copy:?}"), format!("{original:?}"));
    assert!(channel.is_empty());
}

fn bar_ends(displacement: Vector3<f64>) -> [NodeState; 2] {
    [
        NodeState {
            coords: point(0.0, 0.0, 0.0),
            displacement: Vector3::zeros(),
        },
        NodeState {
            coords: point(2.0, 0.0, 0.0),
            displacement,
        },
    ]
}

/// Commit the member at rest, then leave it on an uncommitted trial.
fn commit_then_stretch<E: Element>(element: &mut E, stretch: f64) {
    element
        .update(&bar_ends(Vector3::zeros()))
        .expect("rest state");
    element.commit_state().expect("commit");
    element
        .update(&bar_ends(Vector3::new(stretch, 0.0, 0.0)))
        .expect("trial state");
}

#[test]
fn plastic_material_keeps_its_history_through_a_round_trip() {
    let mut material = ElasticPerfectlyPlasticMaterial::new(Tag(3), 200.0e9, 250.0e6);
    material.set_trial_strain(2.0e-3).expect("yielding strain");
    material.commit_state().expect("commit");
    material.set_trial_strain(1.0e-3).expect("unloading strain");
    assert_relative_eq!(material.plastic_strain(), 7.5e-4, epsilon = 1.0e-15);

    assert_round_trip::<dyn UniaxialMaterial, _>(&mut material);
}

#[test]
fn transformations_round_trip_with_uncommitted_trials() {
    let [first, second] = bar_ends(Vector3::zeros());
    let [_, moved] = bar_ends(Vector3::new(0.1, 0.2, 0.0));

    let mut linear = LinearCrdTransf::new(Tag(5));
    linear.update(&first, &second).expect("rest state");
    linear.commit_state().expect("commit");
    linear.update(&first, &moved).expect("trial state");
    assert_round_trip::<dyn CrdTransf, _>(&mut linear);

    let mut corot = CorotCrdTransf::new(Tag(6));
    corot.update(&first, &second).expect("rest state");
    corot.commit_state().expect("commit");
    corot.update(&first, &moved).expect("trial state");
    assert_round_trip::<dyn CrdTransf, _>(&mut corot);
}

#[test]
fn fiber_section_round_trips_every_fiber() {
    let mut section = FiberSection::new(Tag(2))
        .with_fiber(
            5.0e-4,
            Box::new(ElasticPerfectlyPlasticMaterial::new(Tag(1), 200.0e9, 250.0e6)),
        )
        .with_fiber(5.0e-4, Box::new(ElasticMaterial::new(Tag(2), 70.0e9)));
    section.set_trial_deformation(3.0e-3).expect("yield first fiber");
    section.commit_state().expect("commit");
    section.set_trial_deformation(2.0e-3).expect("unload");

    assert_round_trip::<dyn Section, _>(&mut section);
}

#[test]
fn truss_with_corotational_trial_round_trips_unchanged() {
    let mut element = TrussElement::new(
        [Tag(1), Tag(2)],
        0.01,
        Box::new(ElasticMaterial::new(Tag(1), 200.0e9)),
    )
    .with_transf(Box::new(CorotCrdTransf::new(Tag(1))));
    commit_then_stretch(&mut element, 1.0e-3);
    let transf = element.transf().expect("transformation attached");
    assert_relative_eq!(transf.elongation(), 1.0e-3, epsilon = 1.0e-12);

    assert_round_trip::<dyn Element, _>(&mut element);
}

#[test]
fn received_truss_keeps_material_and_transformation_in_step() {
    let broker = Broker::standard();
    let mut channel = LoopbackChannel::new();
    let mut element = TrussElement::new(
        [Tag(1), Tag(2)],
        0.01,
        Box::new(ElasticMaterial::new(Tag(1), 200.0e9)),
    )
    .with_transf(Box::new(CorotCrdTransf::new(Tag(1))));
    commit_then_stretch(&mut element, 1.0e-3);

    let mut ctx = ExchangeContext::new(&mut channel, &broker, CommitTag(1));
    ctx.send_object(&mut element).expect("send");
    let copy = ctx.recv_object::<dyn Element>().expect("recv");

    // Same trial kinematics on both sides: the force and the geometric
    // stiffness only agree when the chord was not reset.
    assert_relative_eq!(copy.axial_force(), element.axial_force());
    assert_relative_eq!(copy.tangent_stiffness(), element.tangent_stiffness());
    assert_relative_eq!(copy.resisting_force(), element.resisting_force());
}

#[test]
fn section_truss_round_trips_with_its_fibers() {
    let section = FiberSection::new(Tag(1))
        .with_fiber(
            5.0e-4,
            Box::new(ElasticPerfectlyPlasticMaterial::new(Tag(1), 200.0e9, 250.0e6)),
        )
        .with_fiber(5.0e-4, Box::new(ElasticMaterial::new(Tag(2), 200.0e9)));
    let mut element = SectionTrussElement::new([Tag(1), Tag(2)], Box::new(section))
        .with_transf(Box::new(LinearCrdTransf::new(Tag(1))));
    commit_then_stretch(&mut element, 4.0e-3);

    assert_round_trip::<dyn Element, _>(&mut element);
}

#[test]
fn nodes_and_patterns_round_trip() {
    let mut node = Node::new(point(1.0, 2.0, 0.0)).with_fixity([true, false, true]);
    node.set_trial_displacement(Vector3::new(0.0, -1.0e-3, 0.0))
        .expect("finite displacement");
    node.commit_state().expect("commit");
    node.set_trial_displacement(Vector3::new(0.0, -2.0e-3, 0.0))
        .expect("finite displacement");
    assert_round_trip::<Node, _>(&mut node);

    let mut plain = PlainPattern::new()
        .with_scale(2.0)
        .with_load(Tag(3), force(0.0, -100.0e3, 0.0));
    assert_round_trip::<dyn LoadPattern, _>(&mut plain);

    let mut constant = ConstantPattern::new().with_load(Tag(3), force(1.0e3, 0.0, 0.0));
    assert_round_trip::<dyn LoadPattern, _>(&mut constant);
}

#[test]
fn user_variant_survives_a_domain_checkpoint() {
    let broker = Arc::new(
        BrokerBuilder::standard()
            .register::<dyn UniaxialMaterial>(SCALED_ELASTIC, || -> Box<dyn UniaxialMaterial> {
                Box::new(ScaledElastic::default())
            })
            .build(),
    );
    let mut domain = Domain::with_broker(Arc::clone(&broker));
    let fixed = domain.add_node(Node::new(point(0.0, 0.0, 0.0)).with_fixity([true; 3]));
    let free = domain.add_node(Node::new(point(2.0, 0.0, 0.0)));
    let element = domain
        .add_element(Box::new(TrussElement::new(
            [fixed, free],
            0.01,
            Box::new(scaled_elastic()),
        )))
        .expect("nodes exist");
    domain.commit().expect("commit");

    let mut store = Datastore::new();
    domain.checkpoint(&mut store, CommitTag(1)).expect("checkpoint");
    let original = domain.element(element).expect("element added");
    let db_tag = original.base().db_tag().expect("allocated by the checkpoint");

    let mut restored = Domain::with_broker(broker);
    restored.restore(&mut store, CommitTag(1)).expect("restore");
    let copy = restored.element(element).expect("container tag survives");

    assert_eq!(copy.tag(), element);
    assert_eq!(copy.class_tag(), class_tags::TRUSS);
    assert_eq!(copy.base().db_tag(), Some(db_tag));
    assert_eq!(copy.node_tags(), &[fixed, free]);
    assert!(format!("{copy:?}").contains("rho: 2.5"));
    assert_relative_eq!(copy.tangent_stiffness(), original.tangent_stiffness());
}
