#![warn(clippy::all)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod analysis;
pub mod broker;
pub mod channel;
pub mod config;
pub mod context;
pub mod domain;
pub mod element;
pub mod errors;
pub mod geometry;
pub mod material;
pub mod movable;
pub mod node;
pub mod pattern;
pub mod section;
pub mod slots;
pub mod state;
pub mod tagged;
pub mod transform;

pub use analysis::{AnalysisReport, StaticAnalysis};
pub use broker::{Broker, BrokerBuilder, Factory};
pub use channel::{
    Address, Datastore, ExchangeChannel, Key, LoopbackChannel, Packet, StreamChannel,
};
pub use config::AnalysisConfig;
pub use context::{BrokedMeta, ExchangeContext, OptionalMeta};
pub use domain::Domain;
pub use element::{Element, SectionTrussElement, TrussElement};
pub use errors::{
    AnalysisError, ChannelError, ComponentFailure, ConfigError, DomainError, ExchangeError,
    ExchangeResult, StateError, StateResult,
};
pub use geometry::{force, point, Force, NodeState, Point};
pub use material::{ElasticMaterial, ElasticPerfectlyPlasticMaterial, UniaxialMaterial};
pub use movable::{Movable, MovableBase};
pub use node::Node;
pub use pattern::{ConstantPattern, LoadPattern, NodalLoad, PlainPattern};
pub use section::{FiberSection, Section};
pub use slots::{SlotBuffer, FIRST_FREE_SLOT, SLOT_FLAGS, SLOT_TAG};
pub use state::{accumulate, finite, SnapshotValue, Stateful, TrialState};
pub use tagged::{class_tags, ClassTag, CommitTag, DbTag, Tag, Tagged};
pub use transform::{CorotCrdTransf, CrdTransf, LinearCrdTransf};
