//! This module contains everything related to estimators.
use crate::core::accumulators::{MomentSums, PowerSums, RefinedSums};
use crate::core::{count, QoiMatrix, Real};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Variances of the low- and high-fidelity responses and their squared correlations, estimated
/// from shared samples.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Correlations<T> {
    var_l: QoiMatrix<T>,
    var_h: Vec<T>,
    rho2_lh: QoiMatrix<T>,
}

impl<T: Real> Correlations<T> {
    /// Constructor.
    pub fn new(var_l: QoiMatrix<T>, var_h: Vec<T>, rho2_lh: QoiMatrix<T>) -> Self {
        debug_assert_eq!(var_l.rows(), var_h.len());
        Self {
            var_l,
            var_h,
            rho2_lh,
        }
    }

    /// Returns the variances $V_{L_i}$ of the low-fidelity models.
    pub fn var_l(&self) -> &QoiMatrix<T> {
        &self.var_l
    }

    /// Returns the variance $V_H$ of the high-fidelity model.
    pub fn var_h(&self) -> &[T] {
        &self.var_h
    }

    /// Returns the squared correlations $\rho^2_{L_i H}$.
    pub fn rho2_lh(&self) -> &QoiMatrix<T> {
        &self.rho2_lh
    }

    /// Returns the covariances $\mathrm{Cov}(L_i, H) = \sqrt{\rho^2 V_{L_i} V_H}$.
    pub fn cov_lh(&self) -> QoiMatrix<T> {
        covariances(&self.rho2_lh, &self.var_l, &self.var_h)
    }
}

/// Reconstructs the covariances $\sqrt{\rho^2 V_{L_i} V_H}$ from squared correlations and
/// variances.
pub fn covariances<T: Real>(
    rho2: &QoiMatrix<T>,
    var_l: &QoiMatrix<T>,
    var_h: &[T],
) -> QoiMatrix<T> {
    let mut cov = QoiMatrix::zeros(rho2.rows(), rho2.cols());
    for qoi in 0..cov.rows() {
        for approx in 0..cov.cols() {
            cov[(qoi, approx)] = (rho2[(qoi, approx)] * var_l[(qoi, approx)] * var_h[qoi]).sqrt();
        }
    }
    cov
}

/// Estimates variances and squared correlations from the first-order sums.
///
/// Uses the Bessel-corrected estimators
///
/// $$ V = \frac{\sum x^2 - N \bar{x}^2}{N - 1}, \quad
///    C = \frac{\sum x y - N \bar{x} \bar{y}}{N - 1}, \quad
///    \rho^2 = \frac{C^2}{V_L V_H} $$
///
/// A pair with a vanishing variance carries no information and gets $\rho^2 = 0$. Returns
/// [`Error::InsufficientSamples`] if a QoI has fewer than two shared samples.
pub fn compute_lh_correlation<T: Real, const M: usize>(
    sums: &PowerSums<T, M>,
) -> Result<Correlations<T>> {
    let (na, nf) = (sums.num_approx(), sums.num_functions());
    let mut var_l = QoiMatrix::zeros(nf, na);
    let mut var_h = vec![T::zero(); nf];
    let mut rho2_lh = QoiMatrix::zeros(nf, na);

    for qoi in 0..nf {
        let n = sums.n_shared()[qoi];

        if n < 2 {
            return Err(Error::InsufficientSamples { qoi, count: n });
        }

        let n = count::<T>(n);
        let bessel = n - T::one();
        let mu_h = sums.sum_h(1)[qoi] / n;
        var_h[qoi] = (sums.sum_hh()[qoi] - n * mu_h * mu_h) / bessel;

        for approx in 0..na {
            let mu_l = sums.sum_l(1)[(qoi, approx)] / n;
            let var = (sums.sum_ll(1)[(qoi, approx)] - n * mu_l * mu_l) / bessel;
            let cov = (sums.sum_lh(1)[(qoi, approx)] - n * mu_l * mu_h) / bessel;
            let denom = var * var_h[qoi];

            var_l[(qoi, approx)] = var;
            rho2_lh[(qoi, approx)] = if denom > T::zero() {
                cov * cov / denom
            } else {
                T::zero()
            };
        }
    }

    Ok(Correlations {
        var_l,
        var_h,
        rho2_lh,
    })
}

/// Variance $V_H / N_H$ of the plain Monte Carlo estimator of the high-fidelity mean.
pub fn mc_estimator_variance<T: Real>(var_h: &[T], n_h: &[usize]) -> Vec<T> {
    var_h
        .iter()
        .zip(n_h)
        .map(|(&var, &n)| var / count(n))
        .collect()
}

/// Optimal control variate parameter $\beta = \mathrm{Cov}(L, H) / V_L$ from `n` shared samples.
/// The Bessel corrections cancel. A constant low-fidelity response yields $\beta = 0$.
pub fn control_variate_beta<T: Real>(sum_l: T, sum_h: T, sum_ll: T, sum_lh: T, n: usize) -> T {
    let mu_l = sum_l / count(n);
    let var = sum_ll - mu_l * sum_l;

    if var > T::zero() {
        (sum_lh - mu_l * sum_h) / var
    } else {
        T::zero()
    }
}

/// Estimates the raw moments $E[H^m]$, $m = 1, \ldots, 4$, of every high-fidelity QoI.
///
/// Starting from the high-fidelity sample mean of $H^m$ each low-fidelity model $i$ subtracts
/// the control variate term
///
/// $$ \beta_i \left( \bar{L}^m_{i,\mathrm{shared}} - \bar{L}^m_{i,\mathrm{refined}} \right) $$
///
/// with $\beta_i$ computed from the `baseline` sums of order $m$. Since the MFMC control variates
/// couple only consecutive models no cross-model terms appear.
pub fn mf_raw_moments<T: Real>(
    baseline: &MomentSums<T>,
    refined: &RefinedSums<T>,
) -> Result<Vec<[T; 4]>> {
    let (na, nf) = (baseline.num_approx(), baseline.num_functions());
    let mut moments = vec![[T::zero(); 4]; nf];

    for (qoi, raw) in moments.iter_mut().enumerate() {
        let n_h = baseline.n_shared()[qoi];

        if n_h == 0 {
            return Err(Error::InsufficientSamples { qoi, count: n_h });
        }

        for order in 1..=4 {
            let sum_h = baseline.sum_h(order)[qoi];
            let mut estimate = sum_h / count(n_h);

            for approx in 0..na {
                let beta = control_variate_beta(
                    baseline.sum_l(order)[(qoi, approx)],
                    sum_h,
                    baseline.sum_ll(order)[(qoi, approx)],
                    baseline.sum_lh(order)[(qoi, approx)],
                    n_h,
                );
                let mean_shared = refined.sum_l_shared(order)[(qoi, approx)]
                    / count(refined.n_l_shared(approx)[qoi]);
                let mean_refined = refined.sum_l_refined(order)[(qoi, approx)]
                    / count(refined.n_l_refined(approx)[qoi]);

                log::debug!(
                    "moment {} QoI {} approx {}: control variate beta = {:?}",
                    order,
                    qoi,
                    approx,
                    beta
                );

                estimate -= beta * (mean_shared - mean_refined);
            }

            raw[order - 1] = estimate;
        }
    }

    Ok(moments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::accumulators::PilotSums;
    use assert_approx_eq::assert_approx_eq;

    const TOLERANCE: f64 = 1e-12;

    fn pilot(samples: &[(f64, f64)]) -> PilotSums<f64> {
        let mut sums = PilotSums::new(1, 1);
        let batch: Vec<_> = samples.iter().map(|&(l, h)| vec![l, h]).collect();
        sums.accumulate(&batch).unwrap();
        sums
    }

    #[test]
    fn bessel_corrected_correlation() {
        // L = (1, 2, 3, 4), H = (2, 4, 5, 9)
        let sums = pilot(&[(1.0, 2.0), (2.0, 4.0), (3.0, 5.0), (4.0, 9.0)]);
        let corr = compute_lh_correlation(&sums).unwrap();

        // mean_L = 2.5, mean_H = 5, var_L = 5/3, var_H = 26/3, cov = 11/3
        assert_approx_eq!(corr.var_l()[(0, 0)], 5.0 / 3.0, TOLERANCE);
        assert_approx_eq!(corr.var_h()[0], 26.0 / 3.0, TOLERANCE);
        assert_approx_eq!(corr.rho2_lh()[(0, 0)], 121.0 / 130.0, TOLERANCE);
        assert_approx_eq!(corr.cov_lh()[(0, 0)], 11.0 / 3.0, TOLERANCE);
    }

    #[test]
    fn correlation_is_idempotent() {
        let sums = pilot(&[(0.3, 2.0), (1.7, 4.1), (3.1, 5.3), (4.9, 9.7), (2.2, 1.1)]);
        let first = compute_lh_correlation(&sums).unwrap();
        let second = compute_lh_correlation(&sums).unwrap();

        // bit-identical
        assert_eq!(first, second);
    }

    #[test]
    fn correlation_needs_two_samples() {
        let sums = pilot(&[(1.0, 2.0), (f64::NAN, 3.0), (2.0, f64::NAN)]);

        assert_eq!(
            compute_lh_correlation(&sums),
            Err(Error::InsufficientSamples { qoi: 0, count: 1 })
        );
    }

    #[test]
    fn constant_low_fidelity_model_is_uncorrelated() {
        let sums = pilot(&[(1.0, 2.0), (1.0, 4.0), (1.0, 5.0)]);
        let corr = compute_lh_correlation(&sums).unwrap();

        assert_eq!(corr.var_l()[(0, 0)], 0.0);
        assert_eq!(corr.rho2_lh()[(0, 0)], 0.0);
    }

    #[test]
    fn beta_of_linear_relation() {
        // H = 3 L + 1
        let l = [1.0_f64, 2.0, 4.0];
        let h: Vec<_> = l.iter().map(|x| 3.0 * x + 1.0).collect();
        let beta = control_variate_beta::<f64>(
            l.iter().sum(),
            h.iter().sum(),
            l.iter().map(|x| x * x).sum(),
            l.iter().zip(&h).map(|(x, y)| x * y).sum(),
            l.len(),
        );

        assert_approx_eq!(beta, 3.0, TOLERANCE);
        assert_eq!(control_variate_beta::<f64>(3.0, 7.0, 3.0, 7.0, 3), 0.0);
    }

    #[test]
    fn raw_moments_without_refinement_are_sample_moments() {
        let mut sums = MomentSums::<f64>::new(1, 1);
        sums.accumulate(&[vec![1.0, 2.0], vec![2.0, 3.0], vec![4.0, 1.0]])
            .unwrap();
        let refined = RefinedSums::from_baseline(&sums);
        let moments = mf_raw_moments(&sums, &refined).unwrap();

        assert_approx_eq!(moments[0][0], 2.0, TOLERANCE);
        assert_approx_eq!(moments[0][1], 14.0 / 3.0, TOLERANCE);
        assert_approx_eq!(moments[0][2], 12.0, TOLERANCE);
        assert_approx_eq!(moments[0][3], 98.0 / 3.0, TOLERANCE);
    }

    #[test]
    fn raw_moments_apply_control_variate() {
        // H = 2 L exactly, so beta = 2 for the first moment
        let mut sums = MomentSums::<f64>::new(1, 1);
        sums.accumulate(&[vec![1.0, 2.0], vec![3.0, 6.0]]).unwrap();

        let mut refined = RefinedSums::from_baseline(&sums);
        refined
            .accumulate(&[vec![5.0, f64::NAN], vec![7.0, f64::NAN]], &[], 0, 1)
            .unwrap();

        let moments = mf_raw_moments(&sums, &refined).unwrap();

        // mean_H = 4, shared mean of L = 2, refined mean of L = 4, so that the estimate follows
        // the refined low-fidelity mean: E[H] = 2 E[L] = 8
        assert_approx_eq!(moments[0][0], 8.0, TOLERANCE);
    }
}
