//! Load patterns: nodal loads scaled by a time series.

use std::fmt::Debug;

use nalgebra::{DMatrix, Vector3};

use crate::context::ExchangeContext;
use crate::errors::{ExchangeError, ExchangeResult};
use crate::geometry::Force;
use crate::movable::{Movable, MovableBase};
use crate::slots::FIRST_FREE_SLOT;
use crate::tagged::{class_tags, ClassTag, Tag, Tagged};

/// Reference force applied at a node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodalLoad {
    /// Loaded node.
    pub node: Tag,
    /// Reference force, scaled by [`LoadPattern::factor`].
    pub force: Force,
}

/// Set of nodal loads following a common time series.
pub trait LoadPattern: Movable + Debug + Send {
    /// Reference loads of the pattern.
    fn loads(&self) -> &[NodalLoad];

    /// Add a reference load.
    fn add_load(&mut self, node: Tag, force: Force);

    /// Multiplier applied to the reference loads at `load_factor`.
    fn factor(&self, load_factor: f64) -> f64;
}

const LOAD_NODES: usize = FIRST_FREE_SLOT;
const LOAD_FORCES: usize = FIRST_FREE_SLOT + 1;
const SCALE: usize = FIRST_FREE_SLOT + 2;
const PATTERN_SLOTS: usize = SCALE + 1;

fn send_loads(
    ctx: &mut ExchangeContext<'_>,
    loads: &[NodalLoad],
    scale: f64,
) -> ExchangeResult<()> {
    let nodes: Vec<i64> = loads.iter().map(|load| i64::from(load.node.0)).collect();
    let forces = DMatrix::from_fn(loads.len(), 3, |row, col| loads[row].force[col]);
    ctx.send_ints(LOAD_NODES, &nodes)?;
    ctx.send_matrix(LOAD_FORCES, &forces)?;
    ctx.send_scalar(SCALE, scale)
}

fn recv_loads(ctx: &mut ExchangeContext<'_>) -> ExchangeResult<(Vec<NodalLoad>, f64)> {
    let nodes = ctx.recv_ints(LOAD_NODES)?;
    let forces = ctx.recv_matrix(LOAD_FORCES)?;
    if forces.nrows() != nodes.len() || forces.ncols() != 3 {
        return Err(ExchangeError::SizeMismatch {
            position: Some(LOAD_FORCES),
            expected: 3 * nodes.len(),
            found: forces.len(),
        });
    }
    let loads = nodes
        .iter()
        .enumerate()
        .map(|(row, &value)| {
            let node = u32::try_from(value).map_err(|_| ExchangeError::InvalidHandle {
                position: LOAD_NODES,
                value,
            })?;
            Ok(NodalLoad {
                node: Tag(node),
                force: Vector3::new(forces[(row, 0)], forces[(row, 1)], forces[(row, 2)]),
            })
        })
        .collect::<ExchangeResult<Vec<_>>>()?;
    let scale = ctx.recv_scalar(SCALE)?;
    Ok((loads, scale))
}

/// Pattern whose loads grow linearly with the load factor.
#[derive(Clone, Debug, PartialEq)]
pub struct PlainPattern {
    base: MovableBase,
    loads: Vec<NodalLoad>,
    scale: f64,
}

impl Default for PlainPattern {
    fn default() -> Self {
        Self {
            base: MovableBase::default(),
            loads: Vec::new(),
            scale: 1.0,
        }
    }
}

impl PlainPattern {
    /// Create an empty pattern with unit scale.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Multiply every load by `scale`.
    #[must_use]
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Add a reference load.
    #[must_use]
    pub fn with_load(mut self, node: Tag, force: Force) -> Self {
        self.add_load(node, force);
        self
    }
}

impl Tagged for PlainPattern {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::PLAIN_PATTERN
    }
}

impl LoadPattern for PlainPattern {
    fn loads(&self) -> &[NodalLoad] {
        &self.loads
    }

    fn add_load(&mut self, node: Tag, force: Force) {
        self.loads.push(NodalLoad { node, force });
    }

    fn factor(&self, load_factor: f64) -> f64 {
        load_factor * self.scale
    }
}

impl Movable for PlainPattern {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        PATTERN_SLOTS
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        send_loads(ctx, &self.loads, self.scale)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        (self.loads, self.scale) = recv_loads(ctx)?;
        Ok(())
    }
}

/// Pattern applied at full magnitude regardless of the load factor, such as
/// gravity.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantPattern {
    base: MovableBase,
    loads: Vec<NodalLoad>,
    scale: f64,
}

impl Default for ConstantPattern {
    fn default() -> Self {
        Self {
            base: MovableBase::default(),
            loads: Vec::new(),
            scale: 1.0,
        }
    }
}

impl ConstantPattern {
    /// Create an empty pattern with unit scale.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Multiply every load by `scale`.
    #[must_use]
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Add a reference load.
    #[must_use]
    pub fn with_load(mut self, node: Tag, force: Force) -> Self {
        self.add_load(node, force);
        self
    }
}

impl Tagged for ConstantPattern {
    fn tag(&self) -> Tag {
        self.base.tag()
    }

    fn class_tag(&self) -> ClassTag {
        class_tags::CONSTANT_PATTERN
    }
}

impl LoadPattern for ConstantPattern {
    fn loads(&self) -> &[NodalLoad] {
        &self.loads
    }

    fn add_load(&mut self, node: Tag, force: Force) {
        self.loads.push(NodalLoad { node, force });
    }

    fn factor(&self, _load_factor: f64) -> f64 {
        self.scale
    }
}

impl Movable for ConstantPattern {
    fn base(&self) -> &MovableBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MovableBase {
        &mut self.base
    }

    fn slot_count(&self) -> usize {
        PATTERN_SLOTS
    }

    fn send_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        send_loads(ctx, &self.loads, self.scale)
    }

    fn recv_data(&mut self, ctx: &mut ExchangeContext<'_>) -> ExchangeResult<()> {
        (self.loads, self.scale) = recv_loads(ctx)?;
        Ok(())
    }
}
