//! Registry mapping `(family, class tag)` to factories of blank instances.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::element::{Element, SectionTrussElement, TrussElement};
use crate::errors::{ExchangeError, ExchangeResult};
use crate::material::{ElasticMaterial, ElasticPerfectlyPlasticMaterial, UniaxialMaterial};
use crate::node::Node;
use crate::pattern::{ConstantPattern, LoadPattern, PlainPattern};
use crate::section::{FiberSection, Section};
use crate::tagged::{class_tags, ClassTag};
use crate::transform::{CorotCrdTransf, CrdTransf, LinearCrdTransf};

/// Factory producing a blank instance of family `F`.
pub type Factory<F> = fn() -> Box<F>;

struct Entry {
    /// Type-erased [`Factory`].
    factory: Box<dyn Any + Send + Sync>,
    family: &'static str,
}

/// Immutable registry of variant factories.
///
/// A family is any type, usually a trait object such as
/// `dyn UniaxialMaterial`, and the same class tag may be registered in several
/// families.
pub struct Broker {
    factories: HashMap<(TypeId, ClassTag), Entry>,
}

/// Builder collecting registrations before the broker is frozen.
#[derive(Default)]
pub struct BrokerBuilder {
    factories: HashMap<(TypeId, ClassTag), Entry>,
}

impl BrokerBuilder {
    /// Start an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from every variant shipped with the crate.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .register::<Node>(class_tags::NODE, || Box::new(Node::default()))
            .register::<dyn UniaxialMaterial>(
                class_tags::ELASTIC_MATERIAL,
                || -> Box<dyn UniaxialMaterial> { Box::new(ElasticMaterial::default()) },
            )
            .register::<dyn UniaxialMaterial>(
                class_tags::ELASTIC_PP_MATERIAL,
                || -> Box<dyn UniaxialMaterial> {
                    Box::new(ElasticPerfectlyPlasticMaterial::default())
                },
            )
            .register::<dyn Section>(class_tags::FIBER_SECTION, || -> Box<dyn Section> {
                Box::new(FiberSection::default())
            })
            .register::<dyn CrdTransf>(class_tags::LINEAR_TRANSF, || -> Box<dyn CrdTransf> {
                Box::new(LinearCrdTransf::default())
            })
            .register::<dyn CrdTransf>(class_tags::COROT_TRANSF, || -> Box<dyn CrdTransf> {
                Box::new(CorotCrdTransf::default())
            })
            .register::<dyn Element>(class_tags::TRUSS, || -> Box<dyn Element> {
                Box::new(TrussElement::default())
            })
            .register::<dyn Element>(class_tags::SECTION_TRUSS, || -> Box<dyn Element> {
                Box::new(SectionTrussElement::default())
            })
            .register::<dyn LoadPattern>(class_tags::PLAIN_PATTERN, || -> Box<dyn LoadPattern> {
                Box::new(PlainPattern::default())
            })
            .register::<dyn LoadPattern>(
                class_tags::CONSTANT_PATTERN,
                || -> Box<dyn LoadPattern> { Box::new(ConstantPattern::default()) },
            )
    }

    /// Register `factory` for `class_tag` within family `F`.
    ///
    /// Registering the same pair twice keeps the last factory.
    #[must_use]
    pub fn register<F: ?Sized + 'static>(mut self, class_tag: ClassTag, factory: Factory<F>) -> Self {
        let family = type_name::<F>();
        let replaced = self
            .factories
            .insert(
                (TypeId::of::<F>(), class_tag),
                Entry {
                    factory: Box::new(factory),
                    family,
                },
            )
            .is_some();
        if replaced {
            debug!(%class_tag, family, "factory replaced");
        }
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> Broker {
        Broker {
            factories: self.factories,
        }
    }
}

static GLOBAL: OnceLock<Arc<Broker>> = OnceLock::new();

impl Broker {
    /// Start a [`BrokerBuilder`].
    #[must_use]
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// A broker holding every variant shipped with the crate.
    #[must_use]
    pub fn standard() -> Self {
        BrokerBuilder::standard().build()
    }

    /// Process-wide standard broker, built on first use.
    #[must_use]
    pub fn global() -> Arc<Broker> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::standard())))
    }

    /// Build a blank instance of variant `class_tag` in family `F`.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::UnknownVariant`] when nothing was registered
    /// for the pair.
    pub fn create<F: ?Sized + 'static>(&self, class_tag: ClassTag) -> ExchangeResult<Box<F>> {
        self.factories
            .get(&(TypeId::of::<F>(), class_tag))
            .and_then(|entry| entry.factory.downcast_ref::<Factory<F>>())
            .map(|factory| factory())
            .ok_or(ExchangeError::UnknownVariant {
                class_tag,
                family: type_name::<F>(),
            })
    }

    /// Return `true` when `class_tag` is registered in family `F`.
    #[must_use]
    pub fn contains<F: ?Sized + 'static>(&self, class_tag: ClassTag) -> bool {
        self.factories.contains_key(&(TypeId::of::<F>(), class_tag))
    }

    /// Class tags registered in family `F`, in increasing order.
    #[must_use]
    pub fn variants<F: ?Sized + 'static>(&self) -> Vec<ClassTag> {
        let family = TypeId::of::<F>();
        let mut tags: Vec<_> = self
            .factories
            .keys()
            .filter(|(id, _)| *id == family)
            .map(|(_, class_tag)| *class_tag)
            .collect();
        tags.sort_unstable();
        tags
    }

    /// Number of registrations across all families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Return `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self
            .factories
            .iter()
            .map(|((_, class_tag), entry)| (entry.family, class_tag.0))
            .collect();
        entries.sort_unstable();
        f.debug_struct("Broker").field("factories", &entries).finish()
    }
}
