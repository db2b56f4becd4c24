//! Identity types shared by every analysis object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an object inside its owning container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub u32);

/// Integer key identifying the concrete variant of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassTag(pub u32);

/// Handle into the addressing scheme of a channel or backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbTag(pub u32);

/// Identifier of one checkpoint (or one transmission) of an object graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitTag(pub u32);

impl Tag {
    /// Tag carried by objects that have not been adopted by a container yet.
    pub const UNASSIGNED: Tag = Tag(0);

    /// Return `true` once a container has assigned this tag.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl DbTag {
    /// Address reserved for root headers; channels never hand it out.
    pub const ROOT: DbTag = DbTag(0);
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.0)
    }
}

impl fmt::Display for DbTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db {}", self.0)
    }
}

impl fmt::Display for CommitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit {}", self.0)
    }
}

/// An object with a container identity and a variant identity.
pub trait Tagged {
    /// Identity of the object within its owning container.
    fn tag(&self) -> Tag;

    /// Variant key used by the [`Broker`](crate::Broker) to rebuild the object.
    fn class_tag(&self) -> ClassTag;
}

/// Class tags of the variants shipped with the crate.
///
/// Values below 10 are left free for user variants.
pub mod class_tags {
    use super::ClassTag;

    /// [`Node`](crate::Node).
    pub const NODE: ClassTag = ClassTag(10);
    /// [`Domain`](crate::Domain).
    pub const DOMAIN: ClassTag = ClassTag(11);
    /// [`TrussElement`](crate::TrussElement).
    pub const TRUSS: ClassTag = ClassTag(20);
    /// [`SectionTrussElement`](crate::SectionTrussElement).
    pub const SECTION_TRUSS: ClassTag = ClassTag(21);
    /// [`ElasticMaterial`](crate::ElasticMaterial).
    pub const ELASTIC_MATERIAL: ClassTag = ClassTag(30);
    /// [`ElasticPerfectlyPlasticMaterial`](crate::ElasticPerfectlyPlasticMaterial).
    pub const ELASTIC_PP_MATERIAL: ClassTag = ClassTag(31);
    /// [`FiberSection`](crate::FiberSection).
    pub const FIBER_SECTION: ClassTag = ClassTag(40);
    /// [`LinearCrdTransf`](crate::LinearCrdTransf).
    pub const LINEAR_TRANSF: ClassTag = ClassTag(50);
    /// [`CorotCrdTransf`](crate::CorotCrdTransf).
    pub const COROT_TRANSF: ClassTag = ClassTag(51);
    /// [`PlainPattern`](crate::PlainPattern).
    pub const PLAIN_PATTERN: ClassTag = ClassTag(60);
    /// [`ConstantPattern`](crate::ConstantPattern).
    pub const CONSTANT_PATTERN: ClassTag = ClassTag(61);
}
