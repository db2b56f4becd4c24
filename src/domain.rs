//! The owning container of an analysis model.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableUnGraph};
use petgraph::visit::EdgeRef;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::channel::ExchangeChannel;
use crate::context::ExchangeContext;
use crate::element::Element;
use crate::errors::{
    ComponentFailure, DomainError, ExchangeError, ExchangeResult, StateError, StateResult,
};
use crate::geometry::{Force, NodeState};
use crate::movable::{Movable, MovableBase};
use crate::node::Node;
use crate::pattern::LoadPattern;
use crate::slots::FIRST_FREE_SLOT;
use crate::state::{Stateful, TrialState};
use crate::tagged::{class_tags, ClassTag, CommitTag, Tag, Tagged};

const LOAD_FACTOR: usize = FIRST_FREE_SLOT;
const STEP: usize = FIRST_FREE_SLOT + 1;
const NEXT_TAG: usize = FIRST_FREE_SLOT + 2;
const NODES: usize = FIRST_FREE_SLOT + 3;
const ELEMENTS: usize = FIRST_FREE_SLOT + 4;
const PATTERNS: usize = FIRST_FREE_SLOT + 5;

#[derive(Clone, Copy, Debug)]
enum Transition {
    Commit,
    RevertToLastCommit,
    RevertToStart,
}

impl Transition {
    fn apply<S: Stateful + ?Sized>(self, target: &mut S) -> StateResult<()> {
        match self {
            Self::Commit => target.commit_state(),
            Self::RevertToLastCommit => target.revert_to_last_commit(),
            Self::RevertToStart => target.revert_to_start(),
        }
    }

    fn apply_to_load_factor(self, load_factor: &mut TrialState<f64>) {
        match self {
            Self::Commit => load_factor.commit(),
            Self::RevertToLastCommit => load_factor.revert_to_last_commit(),
            Self::RevertToStart => load_factor.revert_to_start(),
        }
    }
}

/// Nodes, elements and load patterns of one model, with the current load
/// factor and step count.
///
/// The domain issues the tags of everything added to it, keeps the element
/// connectivity in a graph and drives the commit and revert sweeps. It is
/// itself [`Movable`], so a whole model can be checkpointed to a channel and
/// rebuilt from it.
///
/// # Examples
/// ```
/// use femstate::{point, Domain, ElasticMaterial, Tag, TrussElement};
///
/// let mut domain = Domain::new();
/// let a = domain.add_node(femstate::Node::new(point(0.0, 0.0, 0.0)));
/// let b = domain.add_node(femstate::Node::new(point(1.0, 0.0, 0.0)));
/// let material = Box::new(ElasticMaterial::new(Tag(1), 200.0e9));
/// let bar = domain
///     .add_element(Box::new(TrussElement::new([a, b], 0.01, material)))
///     .expect("nodes exist");
/// assert_eq!(domain.connected_elements(a).expect("node exists"), vec![bar]);
/// ```
#[derive(Debug)]
pub struct Domain {
    base: MovableBase,
    broker: Arc<Broker>,
    nodes: BTreeMap<Tag, Node>,
    elements: BTreeMap<Tag, Box<dyn Element>>,
    patterns: BTreeMap<Tag, Box<dyn LoadPattern>>,
    /// Nodes as vertices, one edge per pair of consecutive element nodes.
    graph: StableUnGraph<Tag, Tag>,
    vertices: HashMap<Tag, NodeIndex>,
    edges: HashMap<Tag, Vec<EdgeIndex>>,
    load_factor: TrialState<f64>,
    step: u32,
    next_tag: u32,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain {
    /// Create an empty domain rebuilding components with [`Broker::global`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_broker(Broker::global())
    }

    /// Create an empty domain rebuilding components with `broker`.
    #[must_use]
    pub fn with_broker(broker: Arc<Broker>) -> Self {
        Self {
            base: MovableBase::new(Tag(1)),
            broker,
            nodes: BTreeMap::new(),
            elements: BTreeMap::new(),
            patterns: BTreeMap::new(),
            graph: StableUnGraph::default(),
            vertices: HashMap::new(),
            edges: HashMap::new(),
            load_factor: TrialState::default(),
            step: 0,
            next_tag: 1,
        }
    }

    /// Broker used to rebuild components.
    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn issue_tag(&mut self) -> Tag {
        let tag = Tag(self.next_tag);
        self.next_tag += 1;
        tag
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Number of load patterns.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Adopt `node` and return the tag issued for it.
    pub fn add_node(&mut self, mut node: Node) -> Tag {
        let tag = self.issue_tag();
        node.set_tag(tag);
        self.nodes.insert(tag, node);
        self.vertices.insert(tag, self.graph.add_node(tag));
        debug!(%tag, "node added");
        tag
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, tag: Tag) -> Option<&Node> {
        self.nodes.get(&tag)
    }

    /// Look up a node for editing.
    pub fn node_mut(&mut self, tag: Tag) -> Option<&mut Node> {
        self.nodes.get_mut(&tag)
    }

    /// Nodes in tag order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    /// Remove a node that no element references.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownNode`] for a missing node and
    /// [`DomainError::NodeInUse`] while elements are still connected to it.
    pub fn remove_node(&mut self, tag: Tag) -> Result<Node, DomainError> {
        let connected = self.connected_elements(tag)?;
        if !connected.is_empty() {
            return Err(DomainError::NodeInUse {
                node: tag,
                elements: connected.len(),
            });
        }
        if let Some(vertex) = self.vertices.remove(&tag) {
            self.graph.remove_node(vertex);
        }
        debug!(%tag, "node removed");
        self.nodes.remove(&tag).ok_or(DomainError::UnknownNode(tag))
    }

    /// Tags of the elements attached to a node, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownNode`] for a missing node.
    pub fn connected_elements(&self, node: Tag) -> Result<Vec<Tag>, DomainError> {
        let vertex = self
            .vertices
            .get(&node)
            .ok_or(DomainError::UnknownNode(node))?;
        let elements: BTreeSet<Tag> = self
            .graph
            .edges(*vertex)
            .map(|edge| *edge.weight())
            .collect();
        Ok(elements.into_iter().collect())
    }

    fn states_of(nodes: &BTreeMap<Tag, Node>, tags: &[Tag]) -> Result<Vec<NodeState>, DomainError> {
        tags.iter()
            .map(|tag| {
                nodes
                    .get(tag)
                    .map(Node::state)
                    .ok_or(DomainError::UnknownNode(*tag))
            })
            .collect()
    }

    /// Adopt `element`, compute its initial response and return the tag issued
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownNode`] when a referenced node is missing
    /// and [`DomainError::Update`] when the element rejects its node states.
    /// The element is dropped in both cases.
    pub fn add_element(&mut self, mut element: Box<dyn Element>) -> Result<Tag, DomainError> {
        let states = Self::states_of(&self.nodes, element.node_tags())?;
        let tag = Tag(self.next_tag);
        element.base_mut().set_tag(tag);
        element
            .update(&states)
            .map_err(|source| DomainError::Update {
                element: tag,
                source,
            })?;
        self.next_tag += 1;
        self.connect(tag, element.node_tags());
        self.elements.insert(tag, element);
        debug!(%tag, "element added");
        Ok(tag)
    }

    fn connect(&mut self, element: Tag, nodes: &[Tag]) {
        let edges = nodes
            .windows(2)
            .filter_map(|pair| {
                let first = self.vertices.get(&pair[0])?;
                let second = self.vertices.get(&pair[1])?;
                Some(self.graph.add_edge(*first, *second, element))
            })
            .collect();
        self.edges.insert(element, edges);
    }

    /// Look up an element.
    #[must_use]
    pub fn element(&self, tag: Tag) -> Option<&dyn Element> {
        self.elements.get(&tag).map(|element| &**element)
    }

    /// Elements in tag order.
    pub fn elements(&self) -> impl Iterator<Item = &dyn Element> + '_ {
        self.elements.values().map(|element| &**element)
    }

    /// Remove an element.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownElement`] for a missing element.
    pub fn remove_element(&mut self, tag: Tag) -> Result<Box<dyn Element>, DomainError> {
        let element = self
            .elements
            .remove(&tag)
            .ok_or(DomainError::UnknownElement(tag))?;
        for edge in self.edges.remove(&tag).unwrap_or_default() {
            self.graph.remove_edge(edge);
        }
        debug!(%tag, "element removed");
        Ok(element)
    }

    /// Adopt `pattern` and return the tag issued for it.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownNode`] when a load targets a missing node.
    pub fn add_pattern(&mut self, mut pattern: Box<dyn LoadPattern>) -> Result<Tag, DomainError> {
        if let Some(load) = pattern
            .loads()
            .iter()
            .find(|load| !self.nodes.contains_key(&load.node))
        {
            return Err(DomainError::UnknownNode(load.node));
        }
        let tag = self.issue_tag();
        pattern.base_mut().set_tag(tag);
        self.patterns.insert(tag, pattern);
        debug!(%tag, "load pattern added");
        Ok(tag)
    }

    /// Look up a load pattern.
    #[must_use]
    pub fn pattern(&self, tag: Tag) -> Option<&dyn LoadPattern> {
        self.patterns.get(&tag).map(|pattern| &**pattern)
    }

    /// Load patterns in tag order.
    pub fn patterns(&self) -> impl Iterator<Item = &dyn LoadPattern> + '_ {
        self.patterns.values().map(|pattern| &**pattern)
    }

    /// Remove a load pattern.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownPattern`] for a missing pattern.
    pub fn remove_pattern(&mut self, tag: Tag) -> Result<Box<dyn LoadPattern>, DomainError> {
        self.patterns
            .remove(&tag)
            .ok_or(DomainError::UnknownPattern(tag))
    }

    /// Trial load factor.
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        *self.load_factor.trial()
    }

    /// Last committed load factor.
    #[must_use]
    pub fn committed_load_factor(&self) -> f64 {
        *self.load_factor.committed()
    }

    /// Replace the trial load factor.
    pub fn set_load_factor(&mut self, load_factor: f64) {
        self.load_factor.set_trial(load_factor);
    }

    /// Number of committed steps.
    #[must_use]
    pub const fn step(&self) -> u32 {
        self.step
    }

    /// Total external force on each loaded node at the trial load factor.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownNode`] when a load targets a node that was
    /// removed after the pattern was added.
    pub fn nodal_loads(&self) -> Result<BTreeMap<Tag, Force>, DomainError> {
        let mut totals = BTreeMap::new();
        for pattern in self.patterns.values() {
            let factor = pattern.factor(self.load_factor());
            for load in pattern.loads() {
                if !self.nodes.contains_key(&load.node) {
                    return Err(DomainError::UnknownNode(load.node));
                }
                *totals.entry(load.node).or_insert_with(Force::zeros) += load.force * factor;
            }
        }
        Ok(totals)
    }

    /// Recompute every element response from the trial node states.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Update`] for the first element that rejects its
    /// trial state.
    pub fn update_elements(&mut self) -> Result<(), DomainError> {
        for (tag, element) in &mut self.elements {
            let states = Self::states_of(&self.nodes, element.node_tags())?;
            element
                .update(&states)
                .map_err(|source| DomainError::Update {
                    element: *tag,
                    source,
                })?;
        }
        Ok(())
    }

    fn sweep(&mut self, transition: Transition) -> Result<(), DomainError> {
        let mut failures: Vec<(Tag, StateError)> = Vec::new();
        for (tag, node) in &mut self.nodes {
            if let Err(error) = transition.apply(node) {
                failures.push((*tag, error));
            }
        }
        for (tag, element) in &mut self.elements {
            if let Err(error) = transition.apply(element.as_mut()) {
                failures.push((*tag, error));
            }
        }
        transition.apply_to_load_factor(&mut self.load_factor);
        if failures.is_empty() {
            debug!(?transition, step = self.step, "sweep complete");
            Ok(())
        } else {
            warn!(?transition, failures = failures.len(), "sweep failed");
            Err(DomainError::Sweep { failures })
        }
    }

    /// Commit every node, element and the load factor, then count the step.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Sweep`] listing every component that failed; the
    /// others are committed regardless and the step is not counted.
    pub fn commit(&mut self) -> Result<(), DomainError> {
        self.sweep(Transition::Commit)?;
        self.step += 1;
        Ok(())
    }

    /// Discard every trial state.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Sweep`] listing every component that failed.
    pub fn revert_to_last_commit(&mut self) -> Result<(), DomainError> {
        self.sweep(Transition::RevertToLastCommit)
    }

    /// Return every component to its initial state and reset the step count.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Sweep`] listing every component that failed.
    pub fn revert_to_start(&mut self) -> Result<(), DomainError> {
        self.step = 0;
        self.sweep(Transition::RevertToStart)
    }

    /// Send the whole model to `channel` under `commit_tag`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Exchange`] wrapping the first failure.
    pub fn checkpoint(
        &mut self,
        channel: &mut dyn ExchangeChannel,
        commit_tag: CommitTag,
    ) -> Result<(), DomainError> {
        let broker = Arc::clone(&self.broker);
        let mut ctx = ExchangeContext::new(channel, &broker, commit_tag);
        ctx.send_object(self)
            .map_err(|source| DomainError::Exchange { commit_tag, source })?;
        info!(
            %commit_tag,
            step = self.step,
            nodes = self.nodes.len(),
            elements = self.elements.len(),
            "checkpoint written"
        );
        Ok(())
    }

    /// Replace the model with the one stored in `channel` under `commit_tag`.
    ///
    /// Components are rebuilt with this domain's broker. The domain is left
    /// untouched when anything fails.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Exchange`]; a failure of individual components is
    /// reported as [`ExchangeError::Incomplete`] listing each of them.
    pub fn restore(
        &mut self,
        channel: &mut dyn ExchangeChannel,
        commit_tag: CommitTag,
    ) -> Result<(), DomainError> {
        let broker = Arc::clone(&self.broker);
        let saved = self.base.clone();
        let mut ctx = ExchangeContext::new(channel, &broker, commit_tag);
        if let Err(source) = ctx.recv_object_into(self) {
            self.base = saved;
            warn!(%commit_tag, error = %source, "restore failed");
            return Err(DomainError::Exchange { commit_tag, source });
        }
        info!(
            %commit_tag,
            step = self.step,
            nodes = self.nodes.len(),
            elements = self.elements.len(),
            "checkpoint restored"
        );
        Ok(())
    }

    fn rebuild_graph(&mut self) {
        self.graph = StableUnGraph::default();
        self.vertices = self
            .nodes
            .keys()
            .map(|tag| (*tag, self.graph.add_node(*tag)))
            .collect();
        self.edges.clear();
        let connectivity: Vec<(Tag, Vec<Tag>)> = self
            .elements
            .iter()
            .map(|(tag, element)| (*tag, element.node_tags().to_vec()))
            .collect();
        for (element, nodes) in connectivity {
            if let Some(missing) = nodes.iter().find(|node| !self.vertices.contains_key(*node)) {
                warn!(%element, node = %missing, "element references a missing node");
            }
            self.connect(element, &nodes);
        }
    }
}

impl Tagged for Domain {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::DOMAIN
    }
}

fn send_components<M: Movable + ?Sized>(
    ctx: &mut ExchangeContext<'_>,
    position: usize,
    mut components: Vec<&mut M>,
) -> ExchangeResult<()> {
    let table: Vec<_> = components
        .iter_mut()
        .map(|component| {
            let db_tag = ctx.assign_db_tag(&mut **component);
            (component.class_tag(), db_tag)
        })
        .collect();
    ctx.send_table(position, &table)?;
    for component in components {
        let class_tag = component.class_tag();
        component
            .send_self(ctx)
            .map_err(|error| error.nested(position, class_tag))?;
    }
    Ok(())
}

/// Rebuild every component listed at `position`, recording failures instead of
/// stopping at the first one.
fn recv_components<F: Movable + ?Sized + 'static>(
    ctx: &mut ExchangeContext<'_>,
    position: usize,
    family: &'static str,
    failures: &mut Vec<ComponentFailure>,
) -> ExchangeResult<BTreeMap<Tag, Box<F>>> {
    let mut components = BTreeMap::new();
    for (class_tag, db_tag) in ctx.recv_table(position)? {
        match ctx.recv_new::<F>(class_tag, db_tag) {
            Ok(component) => {
                components.insert(component.tag(), component);
            }
            Err(error) => {
                warn!(family, %class_tag, %db_tag, %error, "component failed to transfer");
                failures.push(ComponentFailure {
                    family,
                    class_tag,
                    db_tag,
                    error,
                });
            }
        }
    }
    Ok(components)
}

fn counter(ctx: &ExchangeContext<'_>, position: usize) -> ExchangeResult<u32> {
    let value = ctx.slot(position)?;
    u32::try_from(value).map_err(|_| ExchangeError::InvalidHandle { position, value })
}

impl Movable for Domain {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        PATTERNS + 1
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        self.load_factor.send(ctx, LOAD_FACTOR)?;
        ctx.send_int(STEP, i64::from(self.step))?;
        ctx.send_int(NEXT_TAG, i64::from(self.next_tag))?;
        send_components(ctx, NODES, self.nodes.values_mut().collect())?;
        send_components::<dyn Element>(
            ctx,
            ELEMENTS,
            self.elements
                .values_mut()
                .map(|element| &mut **element)
                .collect(),
        )?;
        send_components::<dyn LoadPattern>(
            ctx,
            PATTERNS,
            self.patterns
                .values_mut()
                .map(|pattern| &mut **pattern)
                .collect(),
        )
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        let mut load_factor = TrialState::default();
        load_factor.recv(ctx, LOAD_FACTOR)?;
        let step = counter(ctx, STEP)?;
        let next_tag = counter(ctx, NEXT_TAG)?;

        let mut failures = Vec::new();
        let nodes = recv_components::<Node>(ctx, NODES, "node", &mut failures)?;
        let elements = recv_components::<dyn Element>(ctx, ELEMENTS, "element", &mut failures)?;
        let patterns =
            recv_components::<dyn LoadPattern>(ctx, PATTERNS, "load pattern", &mut failures)?;
        if !failures.is_empty() {
            return Err(ExchangeError::Incomplete { failures });
        }

        self.nodes = nodes.into_iter().map(|(tag, node)| (tag, *node)).collect();
        self.elements = elements;
        self.patterns = patterns;
        self.load_factor = load_factor;
        self.step = step;
        self.next_tag = next_tag;
        self.rebuild_graph();
        Ok(())
    }
}
