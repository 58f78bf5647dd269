//! Running power sums of the model responses.
//!
//! [`PowerSums`] accumulates over samples shared by all models and [`RefinedSums`] over the
//! additional low-fidelity samples of the approximation increments.
use crate::core::{sequenced, QoiMatrix, Real};
use crate::error::{Error, Result};

/// Power sums of orders $1, \ldots, M$ over samples shared by all models.
///
/// For a sample entering QoI $q$ with low-fidelity values $L_i$ and high-fidelity value $H$ this
/// adds $L_i^m$, $H^m$, $L_i^m L_i^m$ and $L_i^m H^m$ to the order-$m$ sums, and $H^2$ to
/// `sum_hh`. A sample enters QoI $q$ only if the values of all models at $q$ are finite; other QoI
/// of the same sample are not affected.
#[derive(Clone, Debug)]
pub struct PowerSums<T, const M: usize> {
    num_approx: usize,
    num_functions: usize,
    sum_l: [QoiMatrix<T>; M],
    sum_h: [Vec<T>; M],
    sum_ll: [QoiMatrix<T>; M],
    sum_lh: [QoiMatrix<T>; M],
    sum_hh: Vec<T>,
    n_shared: Vec<usize>,
}

/// Single-moment sums, sufficient for correlations.
pub type PilotSums<T> = PowerSums<T, 1>;

/// Sums of the first four moments, needed for the final moment estimates.
pub type MomentSums<T> = PowerSums<T, 4>;

fn check_lengths<T>(batch: &[Vec<T>], expected: usize) -> Result<()> {
    match batch.iter().find(|response| response.len() != expected) {
        Some(response) => Err(Error::ResponseLength {
            expected,
            found: response.len(),
        }),
        None => Ok(()),
    }
}

impl<T: Real, const M: usize> PowerSums<T, M> {
    /// Empty sums for an ensemble of `num_approx` low-fidelity models returning `num_functions`
    /// QoI each.
    pub fn new(num_approx: usize, num_functions: usize) -> Self {
        Self {
            num_approx,
            num_functions,
            sum_l: std::array::from_fn(|_| QoiMatrix::zeros(num_functions, num_approx)),
            sum_h: std::array::from_fn(|_| vec![T::zero(); num_functions]),
            sum_ll: std::array::from_fn(|_| QoiMatrix::zeros(num_functions, num_approx)),
            sum_lh: std::array::from_fn(|_| QoiMatrix::zeros(num_functions, num_approx)),
            sum_hh: vec![T::zero(); num_functions],
            n_shared: vec![0; num_functions],
        }
    }

    /// Adds a batch of shared responses. If any response has the wrong length, nothing is
    /// accumulated.
    pub fn accumulate(&mut self, batch: &[Vec<T>]) -> Result<()> {
        check_lengths(batch, (self.num_approx + 1) * self.num_functions)?;

        for response in batch {
            for qoi in 0..self.num_functions {
                self.accumulate_qoi(response, qoi);
            }
        }

        Ok(())
    }

    fn accumulate_qoi(&mut self, response: &[T], qoi: usize) {
        let nf = self.num_functions;

        if !(0..=self.num_approx).all(|model| response[model * nf + qoi].is_finite()) {
            return;
        }

        self.n_shared[qoi] += 1;

        let h = response[self.num_approx * nf + qoi];
        self.sum_hh[qoi] += h * h;

        let mut h_pow = h;
        for order in 0..M {
            self.sum_h[order][qoi] += h_pow;
            h_pow = h_pow * h;
        }

        for approx in 0..self.num_approx {
            let l = response[approx * nf + qoi];
            let mut l_pow = l;
            let mut h_pow = h;

            for order in 0..M {
                self.sum_l[order][(qoi, approx)] += l_pow;
                self.sum_ll[order][(qoi, approx)] += l_pow * l_pow;
                self.sum_lh[order][(qoi, approx)] += l_pow * h_pow;
                l_pow = l_pow * l;
                h_pow = h_pow * h;
            }
        }
    }

    /// Number of low-fidelity models.
    pub fn num_approx(&self) -> usize {
        self.num_approx
    }

    /// Number of QoI.
    pub fn num_functions(&self) -> usize {
        self.num_functions
    }

    /// Number of jointly finite samples per QoI.
    pub fn n_shared(&self) -> &[usize] {
        &self.n_shared
    }

    /// $\sum L^m$ for the moment `order` $m \in [1, M]$.
    pub fn sum_l(&self, order: usize) -> &QoiMatrix<T> {
        &self.sum_l[order - 1]
    }

    /// $\sum H^m$ for the moment `order` $m \in [1, M]$.
    pub fn sum_h(&self, order: usize) -> &[T] {
        &self.sum_h[order - 1]
    }

    /// $\sum L^m L^m$ for the moment `order` $m \in [1, M]$.
    pub fn sum_ll(&self, order: usize) -> &QoiMatrix<T> {
        &self.sum_ll[order - 1]
    }

    /// $\sum L^m H^m$ for the moment `order` $m \in [1, M]$.
    pub fn sum_lh(&self, order: usize) -> &QoiMatrix<T> {
        &self.sum_lh[order - 1]
    }

    /// $\sum H^2$.
    pub fn sum_hh(&self) -> &[T] {
        &self.sum_hh
    }
}

/// Low-fidelity power sums of orders 1 to 4 over the pyramid of approximation increments.
///
/// Both the shared and the refined sums start from the baseline sums over the samples shared
/// with the high-fidelity model. An increment over the sub-sequence `[start, end)` adds to the
/// refined sums of every model in it and to the shared sums of all but the last one, so that the
/// shared samples of a model are exactly the refined samples of the next model in the sequence.
#[derive(Clone, Debug)]
pub struct RefinedSums<T> {
    num_approx: usize,
    num_functions: usize,
    sum_l_shared: [QoiMatrix<T>; 4],
    sum_l_refined: [QoiMatrix<T>; 4],
    n_l_shared: Vec<Vec<usize>>,
    n_l_refined: Vec<Vec<usize>>,
}

impl<T: Real> RefinedSums<T> {
    /// Starts the refinement from the shared `baseline`.
    pub fn from_baseline(baseline: &MomentSums<T>) -> Self {
        let counts = vec![baseline.n_shared.clone(); baseline.num_approx];

        Self {
            num_approx: baseline.num_approx,
            num_functions: baseline.num_functions,
            sum_l_shared: baseline.sum_l.clone(),
            sum_l_refined: baseline.sum_l.clone(),
            n_l_shared: counts.clone(),
            n_l_refined: counts,
        }
    }

    /// Adds a batch of responses evaluated on the models `sequence[start..end]`. Values are
    /// filtered individually per model and QoI.
    pub fn accumulate(
        &mut self,
        batch: &[Vec<T>],
        sequence: &[usize],
        start: usize,
        end: usize,
    ) -> Result<()> {
        debug_assert!(start < end && end <= self.num_approx);
        check_lengths(batch, (self.num_approx + 1) * self.num_functions)?;

        let shared_end = end - 1;

        for response in batch {
            for s in start..end {
                let approx = sequenced(sequence, s);
                let shared = s < shared_end;

                for qoi in 0..self.num_functions {
                    let value = response[approx * self.num_functions + qoi];

                    if !value.is_finite() {
                        continue;
                    }

                    self.n_l_refined[approx][qoi] += 1;
                    if shared {
                        self.n_l_shared[approx][qoi] += 1;
                    }

                    let mut pow = value;
                    for order in 0..4 {
                        self.sum_l_refined[order][(qoi, approx)] += pow;
                        if shared {
                            self.sum_l_shared[order][(qoi, approx)] += pow;
                        }
                        pow = pow * value;
                    }
                }
            }
        }

        Ok(())
    }

    /// $\sum L^m$ over the shared samples of each model for `order` $m \in [1, 4]$.
    pub fn sum_l_shared(&self, order: usize) -> &QoiMatrix<T> {
        &self.sum_l_shared[order - 1]
    }

    /// $\sum L^m$ over the refined samples of each model for `order` $m \in [1, 4]$.
    pub fn sum_l_refined(&self, order: usize) -> &QoiMatrix<T> {
        &self.sum_l_refined[order - 1]
    }

    /// Shared sample counts per QoI of model `approx`.
    pub fn n_l_shared(&self, approx: usize) -> &[usize] {
        &self.n_l_shared[approx]
    }

    /// Refined sample counts per QoI of model `approx`.
    pub fn n_l_refined(&self, approx: usize) -> &[usize] {
        &self.n_l_refined[approx]
    }

    /// Refined sample counts indexed by model and QoI.
    pub fn refined_counts(&self) -> &[Vec<usize>] {
        &self.n_l_refined
    }
}
