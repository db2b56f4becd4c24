//! Error types produced while exchanging, updating or analysing objects.

use thiserror::Error;

use crate::channel::Address;
use crate::tagged::{ClassTag, CommitTag, DbTag, Tag};

/// Result alias for exchange operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Result alias for state transitions.
pub type StateResult<T> = Result<T, StateError>;

/// Error returned by an [`ExchangeChannel`](crate::ExchangeChannel) implementation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Returned when the underlying byte stream fails.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when a frame cannot be encoded or decoded.
    #[error("frame codec failure: {0}")]
    Codec(#[from] bincode::Error),
    /// Returned when a FIFO channel has nothing left to read.
    #[error("channel exhausted while reading {0}")]
    Exhausted(Address),
    /// Returned when a backing store holds no packet for the address.
    #[error("no packet stored at {0}")]
    Missing(Address),
    /// Returned when a FIFO channel holds a different address at its head.
    #[error("expected packet {expected} but found {found}")]
    OutOfOrder {
        /// Address requested by the receiver.
        expected: Address,
        /// Address found at the head of the channel.
        found: Address,
    },
}

/// Error returned while marshalling or reconstructing an object.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Returned when the channel fails to write or read a packet.
    #[error("marshal failure at {address}: {source}")]
    Marshal {
        /// Address of the failed packet.
        address: Address,
        /// Transport error.
        #[source]
        source: ChannelError,
    },
    /// Returned when a received payload disagrees with the negotiated size.
    #[error("size mismatch at position {position:?}: expected {expected}, found {found}")]
    SizeMismatch {
        /// Slot position of the field, `None` for the slot table itself.
        position: Option<usize>,
        /// Size negotiated through the slot table or expected by the receiver.
        expected: usize,
        /// Size actually received, `usize::MAX` when a received header
        /// overflows.
        found: usize,
    },
    /// Returned when the broker has no factory for a received class tag.
    #[error("no variant registered for {class_tag} in family {family}")]
    UnknownVariant {
        /// Received class tag.
        class_tag: ClassTag,
        /// Type name of the requested family.
        family: &'static str,
    },
    /// Returned when the send and receive sequences diverge on a FIFO channel.
    #[error("protocol order violated: expected {expected}, found {found}")]
    ProtocolOrder {
        /// Address requested by the receiver.
        expected: Address,
        /// Address produced by the sender.
        found: Address,
    },
    /// Returned when a packet of another primitive kind is received.
    #[error("position {position:?} expected {expected} packet, found {found}")]
    PacketKind {
        /// Slot position of the field.
        position: Option<usize>,
        /// Expected packet kind.
        expected: &'static str,
        /// Received packet kind.
        found: &'static str,
    },
    /// Returned when a slot position beyond the reserved capacity is accessed.
    #[error("slot position {position} outside reserved capacity {capacity}")]
    SlotOutOfRange {
        /// Requested position.
        position: usize,
        /// Reserved capacity.
        capacity: usize,
    },
    /// Returned when a slot holds a value that is not a valid handle.
    #[error("slot position {position} holds invalid handle {value}")]
    InvalidHandle {
        /// Slot position.
        position: usize,
        /// Stored value.
        value: i64,
    },
    /// Returned when an object is received before its database tag is known.
    #[error("object of {0} has no database tag")]
    MissingDbTag(ClassTag),
    /// Returned when an object is received into an instance of another variant.
    #[error("expected {expected} but the channel announces {found}")]
    ClassMismatch {
        /// Variant of the receiving instance.
        expected: ClassTag,
        /// Variant announced on the channel.
        found: ClassTag,
    },
    /// Returned when a field primitive is used outside `send_self`/`recv_self`.
    #[error("no object frame is open on the exchange context")]
    NoOpenFrame,
    /// Returned when a nested member fails, carrying the member's slot position.
    #[error("member at position {position} ({class_tag}) failed: {source}")]
    Nested {
        /// Slot position of the member in its owner's table.
        position: usize,
        /// Variant of the member.
        class_tag: ClassTag,
        /// Failure of the member.
        #[source]
        source: Box<ExchangeError>,
    },
    /// Returned when a container exchange could not rebuild every component.
    #[error("{} component(s) failed to transfer", failures.len())]
    Incomplete {
        /// Every component that failed.
        failures: Vec<ComponentFailure>,
    },
}

/// Description of one component that failed during a container exchange.
#[derive(Debug)]
pub struct ComponentFailure {
    /// Kind of component (`"node"`, `"element"`, `"load pattern"`).
    pub family: &'static str,
    /// Announced variant.
    pub class_tag: ClassTag,
    /// Database tag of the component.
    pub db_tag: DbTag,
    /// Reason of the failure.
    pub error: ExchangeError,
}

impl ExchangeError {
    /// Wrap an error raised by a nested member stored at `position`.
    #[must_use]
    pub fn nested(self, position: usize, class_tag: ClassTag) -> Self {
        Self::Nested {
            position,
            class_tag,
            source: Box::new(self),
        }
    }

    /// Return the innermost error, skipping [`ExchangeError::Nested`] wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &ExchangeError {
        match self {
            Self::Nested { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Error returned by a trial update or a commit/revert transition.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StateError {
    /// Returned when a trial quantity is not a finite number.
    #[error("trial {quantity} is not finite ({value})")]
    NonFinite {
        /// Name of the rejected quantity.
        quantity: &'static str,
        /// Rejected value.
        value: f64,
    },
    /// Returned when an element receives the wrong number of node states.
    #[error("element expects {expected} node states, received {found}")]
    Connectivity {
        /// Number of connected nodes.
        expected: usize,
        /// Number of states supplied.
        found: usize,
    },
    /// Returned when a member has zero length.
    #[error("member has zero length")]
    ZeroLength,
    /// Returned when several owned members fail during one transition.
    #[error("{} member transitions failed", .0.len())]
    Multiple(Vec<StateError>),
}

/// Error returned when editing a [`Domain`](crate::Domain) or sweeping its state.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Returned when a node cannot be found in the domain.
    #[error("node {0} does not exist in this domain")]
    UnknownNode(Tag),
    /// Returned when an element cannot be found in the domain.
    #[error("element {0} does not exist in this domain")]
    UnknownElement(Tag),
    /// Returned when a load pattern cannot be found in the domain.
    #[error("load pattern {0} does not exist in this domain")]
    UnknownPattern(Tag),
    /// Returned when a node is still referenced by elements.
    #[error("node {node} is still connected to {elements} element(s)")]
    NodeInUse {
        /// Node that was asked to be removed.
        node: Tag,
        /// Number of elements still attached.
        elements: usize,
    },
    /// Returned when a commit or revert sweep fails on one or more components.
    #[error("state sweep failed on {} component(s)", failures.len())]
    Sweep {
        /// Failing components and their errors.
        failures: Vec<(Tag, StateError)>,
    },
    /// Returned when an element update fails.
    #[error("element {element} rejected its trial state: {source}")]
    Update {
        /// Element that failed.
        element: Tag,
        /// Reason of the failure.
        #[source]
        source: StateError,
    },
    /// Returned when a checkpoint or restore fails.
    #[error("exchange at {commit_tag} failed: {source}")]
    Exchange {
        /// Commit tag of the exchange.
        commit_tag: CommitTag,
        /// Reason of the failure.
        #[source]
        source: ExchangeError,
    },
}

/// Error returned when a static analysis fails.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Returned when the domain holds no node.
    #[error("domain has no nodes to analyse")]
    EmptyDomain,
    /// Returned when the load increment shrank below the configured minimum.
    #[error("step at load factor {load_factor} did not converge with increment {increment}")]
    NotConverged {
        /// Last committed load factor.
        load_factor: f64,
        /// Smallest increment attempted.
        increment: f64,
    },
    /// Returned when the domain rejects an update, commit or checkpoint.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when the configuration file cannot be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when the configuration is not valid JSON for the expected schema.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// Returned when a configuration value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}
