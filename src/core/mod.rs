//! The core module: the model ensemble interface, the accumulators and the estimators built on
//! top of them.
pub mod accumulators;
pub mod estimators;

use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::{AddAssign, Index, IndexMut, SubAssign};

/// Numeric type used by the engine. Every type satisfying the bounds implements it, in particular
/// `f32` and `f64`.
pub trait Real: Float + FromPrimitive + AddAssign + SubAssign + Debug {}

impl<T: Float + FromPrimitive + AddAssign + SubAssign + Debug> Real for T {}

/// Interface to the layer evaluating the hierarchy of models.
///
/// The ensemble consists of `num_approx()` low-fidelity models followed by a single high-fidelity
/// model with index `num_approx()`. Each model returns `num_functions()` QoI values per sample. A
/// response is the concatenation of the QoI values of all models, i.e. QoI `q` of model `m` is
/// stored at index `m * num_functions() + q`. Non-finite values mark failed evaluations.
///
/// Both increments are blocking: they return only after every requested sample has been
/// evaluated.
pub trait ModelEnsemble<T> {
    /// Number of low-fidelity models.
    fn num_approx(&self) -> usize;

    /// Number of QoI returned by every model.
    fn num_functions(&self) -> usize;

    /// Cost of a single evaluation of each model, `num_approx() + 1` values with the
    /// high-fidelity model last.
    fn costs(&self) -> Vec<T>;

    /// Evaluates `samples` new samples on all models.
    fn shared_increment(&mut self, iteration: usize, samples: usize) -> Vec<Vec<T>>;

    /// Evaluates `samples` new samples on the low-fidelity `models` only. The returned responses
    /// have the full length; entries belonging to other models are ignored.
    fn approx_increment(&mut self, iteration: usize, models: &[usize], samples: usize)
        -> Vec<Vec<T>>;
}

/// Converts a sample count into `T`.
pub(crate) fn count<T: Real>(n: usize) -> T {
    // floats represent every count, if necessary rounded
    T::from_usize(n).unwrap_or_else(T::infinity)
}

/// Arithmetic mean of `values`, `NaN` if it is empty.
pub(crate) fn average<T: Real>(values: &[T]) -> T {
    values.iter().fold(T::zero(), |acc, &v| acc + v) / count(values.len())
}

/// Arithmetic mean of sample counts.
pub(crate) fn average_count<T: Real>(counts: &[usize]) -> T {
    counts.iter().fold(T::zero(), |acc, &n| acc + count(n)) / count(counts.len())
}

/// Returns the model at position `i` of the approximation `sequence`. An empty sequence denotes
/// the nominal model order.
pub fn sequenced(sequence: &[usize], i: usize) -> usize {
    if sequence.is_empty() {
        i
    } else {
        sequence[i]
    }
}

/// Returns the number of additional samples needed to move `current` towards `targets`.
///
/// The positive shortfalls `targets[q] - current[q]` are averaged over all QoI and rounded up, so
/// that the increment is deterministic and never negative. A non-zero increment is at least
/// `min_increment`; QoI whose counts already exceed their targets do not reduce the result.
pub fn one_sided_delta<T: Real>(current: &[usize], targets: &[T], min_increment: usize) -> usize {
    debug_assert_eq!(current.len(), targets.len());

    if current.is_empty() {
        return 0;
    }

    let shortfall = current
        .iter()
        .zip(targets)
        .fold(T::zero(), |acc, (&n, &target)| {
            let diff = target - count(n);
            if diff > T::zero() {
                acc + diff
            } else {
                acc
            }
        });
    let delta = shortfall / count(current.len());

    // also catches `NaN` targets
    if !(delta > T::zero()) {
        return 0;
    }

    delta
        .ceil()
        .to_usize()
        .unwrap_or(usize::MAX)
        .max(min_increment)
}

/// A dense matrix with one row per QoI and one column per low-fidelity model.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct QoiMatrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> QoiMatrix<T> {
    /// Matrix of `rows` QoI and `cols` models with all entries set to `value`.
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Matrix whose rows are all equal to `row`.
    pub fn from_row(rows: usize, row: &[T]) -> Self {
        Self {
            rows,
            cols: row.len(),
            data: (0..rows).flat_map(|_| row.iter().copied()).collect(),
        }
    }

    /// Number of QoI.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of low-fidelity models.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The entries of QoI `qoi`, one per model.
    pub fn row(&self, qoi: usize) -> &[T] {
        &self.data[qoi * self.cols..(qoi + 1) * self.cols]
    }

    /// The entries of model `approx`, one per QoI.
    pub fn column(&self, approx: usize) -> Vec<T> {
        (0..self.rows).map(|qoi| self[(qoi, approx)]).collect()
    }
}

impl<T: Real> QoiMatrix<T> {
    /// Matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, T::zero())
    }

    /// Averages over QoI, one value per model.
    pub fn column_means(&self) -> Vec<T> {
        (0..self.cols)
            .map(|approx| average(&self.column(approx)))
            .collect()
    }
}

impl<T> Index<(usize, usize)> for QoiMatrix<T> {
    type Output = T;

    fn index(&self, (qoi, approx): (usize, usize)) -> &T {
        debug_assert!(qoi < self.rows && approx < self.cols);
        &self.data[qoi * self.cols + approx]
    }
}

impl<T> IndexMut<(usize, usize)> for QoiMatrix<T> {
    fn index_mut(&mut self, (qoi, approx): (usize, usize)) -> &mut T {
        debug_assert!(qoi < self.rows && approx < self.cols);
        &mut self.data[qoi * self.cols + approx]
    }
}
