//! Trial, committed and initial snapshots of path-dependent quantities.

use nalgebra::{DVector, Vector3};

use crate::context::ExchangeContext;
use crate::errors::{ExchangeError, ExchangeResult, StateError, StateResult};

/// An object whose response depends on a history it can commit or discard.
pub trait Stateful {
    /// Accept the trial state as the new committed state.
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] listing every owned member that failed.
    fn commit_state(&mut self) -> StateResult<()>;

    /// Discard the trial state.
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] listing every owned member that failed.
    fn revert_to_last_commit(&mut self) -> StateResult<()>;

    /// Return to the initial state, forgetting every commit.
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] listing every owned member that failed.
    fn revert_to_start(&mut self) -> StateResult<()>;
}

/// Run every transition of a composite and fold their failures.
///
/// Each result is inspected, so a failing member never prevents its siblings
/// from transitioning.
///
/// # Errors
///
/// Returns the single failure as is, or [`StateError::Multiple`] when several
/// members failed.
pub fn accumulate<I>(results: I) -> StateResult<()>
where
    I: IntoIterator<Item = StateResult<()>>,
{
    let mut failures: Vec<StateError> = results.into_iter().filter_map(Result::err).collect();
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(StateError::Multiple(failures)),
    }
}

/// Reject non-finite trial input before it reaches a snapshot.
///
/// # Errors
///
/// Returns [`StateError::NonFinite`] naming `quantity`.
pub fn finite(quantity: &'static str, value: f64) -> StateResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(StateError::NonFinite { quantity, value })
    }
}

/// The three snapshots of one quantity.
///
/// # Examples
/// ```
/// use femstate::TrialState;
///
/// let mut strain = TrialState::new(0.0);
/// strain.set_trial(0.002);
/// strain.commit();
/// strain.set_trial(0.004);
/// strain.revert_to_last_commit();
/// assert_eq!(*strain.trial(), 0.002);
/// strain.revert_to_start();
/// assert_eq!(*strain.committed(), 0.0);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrialState<T> {
    initial: T,
    trial: T,
    committed: T,
}

impl<T: Clone> TrialState<T> {
    /// Start with every snapshot equal to `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            trial: initial.clone(),
            committed: initial.clone(),
            initial,
        }
    }

    /// Replace the trial snapshot.
    pub fn set_trial(&mut self, value: T) {
        self.trial = value;
    }

    /// Trial snapshot.
    pub fn trial(&self) -> &T {
        &self.trial
    }

    /// Last committed snapshot.
    pub fn committed(&self) -> &T {
        &self.committed
    }

    /// Snapshot the quantity started from.
    pub fn initial(&self) -> &T {
        &self.initial
    }

    /// committed := trial.
    pub fn commit(&mut self) {
        self.committed = self.trial.clone();
    }

    /// trial := committed.
    pub fn revert_to_last_commit(&mut self) {
        self.trial = self.committed.clone();
    }

    /// trial := committed := initial.
    pub fn revert_to_start(&mut self) {
        self.committed = self.initial.clone();
        self.trial = self.initial.clone();
    }

    /// Restart the history from a new initial value.
    pub fn reset(&mut self, initial: T) {
        *self = Self::new(initial);
    }
}

impl<T: PartialEq> TrialState<T> {
    /// Return `true` when the trial snapshot holds no uncommitted change.
    pub fn is_settled(&self) -> bool {
        self.trial == self.committed
    }
}

/// A quantity whose snapshots can be flattened into doubles.
pub trait SnapshotValue: Clone {
    /// Fixed number of doubles, `None` for variable-sized quantities.
    const WIDTH: Option<usize>;

    /// Append the quantity to `out`.
    fn flatten(&self, out: &mut Vec<f64>);

    /// Rebuild a quantity from exactly its doubles.
    fn unflatten(values: &[f64]) -> Self;

    /// Number of doubles produced by [`SnapshotValue::flatten`].
    fn width(&self) -> usize;
}

impl SnapshotValue for f64 {
    const WIDTH: Option<usize> = Some(1);

    fn flatten(&self, out: &mut Vec<f64>) {
        out.push(*self);
    }

    fn unflatten(values: &[f64]) -> Self {
        values[0]
    }

    fn width(&self) -> usize {
        1
    }
}

impl SnapshotValue for Vector3<f64> {
    const WIDTH: Option<usize> = Some(3);

    fn flatten(&self, out: &mut Vec<f64>) {
        out.extend(self.iter().copied());
    }

    fn unflatten(values: &[f64]) -> Self {
        Vector3::from_column_slice(values)
    }

    fn width(&self) -> usize {
        3
    }
}

impl SnapshotValue for DVector<f64> {
    const WIDTH: Option<usize> = None;

    fn flatten(&self, out: &mut Vec<f64>) {
        out.extend(self.iter().copied());
    }

    fn unflatten(values: &[f64]) -> Self {
        DVector::from_column_slice(values)
    }

    fn width(&self) -> usize {
        self.len()
    }
}

impl<T: SnapshotValue> TrialState<T> {
    /// Send the three snapshots at `position`.
    ///
    /// The slot records the width of one snapshot; the payload holds initial,
    /// committed and trial values in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the snapshots disagree in
    /// width, or a primitive failure.
    pub fn send(&self, ctx: &mut ExchangeContext<'_>, position: usize) -> ExchangeResult<()> {
        let width = self.initial.width();
        for snapshot in [&self.committed, &self.trial] {
            if snapshot.width() != width {
                return Err(ExchangeError::SizeMismatch {
                    position: Some(position),
                    expected: width,
                    found: snapshot.width(),
                });
            }
        }
        let mut values = Vec::with_capacity(3 * width);
        self.initial.flatten(&mut values);
        self.committed.flatten(&mut values);
        self.trial.flatten(&mut values);
        ctx.send_int(position, width as i64)?;
        ctx.send_doubles(position, &values)
    }

    /// Receive snapshots sent by [`TrialState::send`].
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::SizeMismatch`] when the recorded width or the
    /// payload length is inconsistent.
    pub fn recv(&mut self, ctx: &mut ExchangeContext<'_>, position: usize) -> ExchangeResult<()> {
        let value = ctx.recv_int(position)?;
        let width =
            usize::try_from(value).map_err(|_| ExchangeError::InvalidHandle { position, value })?;
        if let Some(expected) = T::WIDTH {
            if expected != width {
                return Err(ExchangeError::SizeMismatch {
                    position: Some(position),
                    expected,
                    found: width,
                });
            }
        }
        let total = width.checked_mul(3).ok_or(ExchangeError::SizeMismatch {
            position: Some(position),
            expected: width,
            found: usize::MAX,
        })?;
        let values = ctx.recv_double_group(position, total)?;
        self.initial = T::unflatten(&values[..width]);
        self.committed = T::unflatten(&values[width..2 * width]);
        self.trial = T::unflatten(&values[2 * width..]);
        Ok(())
    }
}
