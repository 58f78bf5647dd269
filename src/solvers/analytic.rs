//! Closed-form MFMC evaluation ratios.
use crate::core::{sequenced, QoiMatrix, Real};
use std::cmp::Ordering;

/// Returns `true` if the squared correlations do not decrease with the model index for any QoI,
/// allowing for decreases of at most `tolerance`.
pub fn is_ordered<T: Real>(rho2: &QoiMatrix<T>, tolerance: T) -> bool {
    (0..rho2.rows()).all(|qoi| {
        rho2.row(qoi)
            .windows(2)
            .all(|pair| pair[1] >= pair[0] - tolerance)
    })
}

/// Evaluation ratios of a single QoI along `sequence`, indexed by model.
///
/// With $\rho^2_{-1} = 0$ and the most correlated model last in the sequence the ratios are
///
/// $$ r_i = \sqrt{ \frac{c_H}{c_i} \frac{\rho^2_i - \rho^2_{i-1}}{1 - \rho^2_\mathrm{last}} } $$
///
/// clamped to at least one and made non-increasing along the sequence.
pub fn sequence_ratios<T: Real>(rho2: &[T], costs: &[T], sequence: &[usize]) -> Vec<T> {
    let num_approx = rho2.len();
    let cost_h = costs[num_approx];
    let denom = T::one() - rho2[sequenced(sequence, num_approx - 1)];
    let mut ratios = vec![T::one(); num_approx];
    let mut prev = T::zero();

    for i in 0..num_approx {
        let approx = sequenced(sequence, i);
        let diff = (rho2[approx] - prev).max(T::zero());

        ratios[approx] = (cost_h / costs[approx] * diff / denom).sqrt().max(T::one());
        prev = rho2[approx];
    }

    // less correlated models sample at least as often as more correlated ones
    for i in (1..num_approx).rev() {
        let (lower, upper) = (sequenced(sequence, i - 1), sequenced(sequence, i));
        ratios[lower] = ratios[lower].max(ratios[upper]);
    }

    ratios
}

/// Per-QoI analytic evaluation ratios for models in the nominal order.
pub fn mfmc_analytic_solution<T: Real>(rho2: &QoiMatrix<T>, costs: &[T]) -> QoiMatrix<T> {
    let mut eval_ratios = QoiMatrix::zeros(rho2.rows(), rho2.cols());

    for qoi in 0..rho2.rows() {
        for (approx, ratio) in sequence_ratios(rho2.row(qoi), costs, &[])
            .into_iter()
            .enumerate()
        {
            eval_ratios[(qoi, approx)] = ratio;
        }
    }

    eval_ratios
}

/// Sorts the models by ascending QoI-averaged squared correlation. Ties keep the nominal order.
pub fn correlation_sequence<T: Real>(rho2: &QoiMatrix<T>) -> Vec<usize> {
    let avg_rho2 = rho2.column_means();
    let mut sequence: Vec<_> = (0..avg_rho2.len()).collect();

    sequence.sort_by(|&a, &b| {
        avg_rho2[a]
            .partial_cmp(&avg_rho2[b])
            .unwrap_or(Ordering::Equal)
    });

    sequence
}

/// Analytic evaluation ratios along the sequence of QoI-averaged correlations. All QoI share the
/// same ratios, which are computed from the averaged squared correlations.
pub fn mfmc_reordered_analytic_solution<T: Real>(
    rho2: &QoiMatrix<T>,
    costs: &[T],
) -> (Vec<usize>, QoiMatrix<T>) {
    let sequence = correlation_sequence(rho2);
    let ratios = sequence_ratios(&rho2.column_means(), costs, &sequence);

    (sequence, QoiMatrix::from_row(rho2.rows(), &ratios))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn ordering_check() {
        let mut rho2 = QoiMatrix::from_row(2, &[0.1, 0.5, 0.5]);
        assert!(is_ordered(&rho2, 0.0));

        rho2[(1, 1)] = 0.5 + 1e-12;
        assert!(is_ordered(&rho2, 1e-10));
        assert!(!is_ordered(&rho2, 0.0));

        rho2[(1, 2)] = 0.2;
        assert!(!is_ordered(&rho2, 1e-10));
    }

    #[test]
    fn ratios_are_monotone_for_ordered_correlations() {
        let rho2 = QoiMatrix::from_row(1, &[0.2, 0.25, 0.9]);
        let costs = [1.0, 2.0, 3.0, 1000.0];
        let r = mfmc_analytic_solution(&rho2, &costs);

        assert!(r.row(0).iter().all(|&x| x >= 1.0));
        assert!(r[(0, 0)] >= r[(0, 1)] && r[(0, 1)] >= r[(0, 2)]);
        assert_approx_eq!(r[(0, 2)], (1000.0 / 3.0 * 0.65 / 0.1_f64).sqrt(), 1e-9);
        // the closed forms sqrt(1000 * 0.2 / 0.1) and sqrt(500 * 0.05 / 0.1) are both smaller
        // than the ratio of the most correlated model and get lifted to it
        assert_approx_eq!(r[(0, 1)], r[(0, 2)], TOLERANCE);
        assert_approx_eq!(r[(0, 0)], r[(0, 2)], TOLERANCE);
    }

    #[test]
    fn small_correlation_gain_gives_unit_ratio() {
        let rho2 = [0.5_f64, 0.5];
        let r = sequence_ratios(&rho2, &[1.0, 1.0, 1.0], &[]);

        // the first model carries all the correlation, the second adds nothing
        assert_approx_eq!(r[0], 1.0, TOLERANCE);
        assert_approx_eq!(r[1], 1.0, TOLERANCE);
    }

    #[test]
    fn reordered_solution() {
        let mut rho2 = QoiMatrix::zeros(2, 2);
        rho2[(0, 0)] = 0.8;
        rho2[(0, 1)] = 0.4;
        rho2[(1, 0)] = 0.6;
        rho2[(1, 1)] = 0.2;

        let (sequence, r) = mfmc_reordered_analytic_solution(&rho2, &[1.0, 5.0, 100.0]);

        assert_eq!(sequence, vec![1, 0]);
        assert_eq!(r.row(0), r.row(1));
        // averaged rho2 = (0.7, 0.3): the closed form of model 0 is sqrt(100 * 0.4 / 0.3)
        assert_approx_eq!(r[(0, 0)], (100.0 * 0.4 / 0.3_f64).sqrt(), TOLERANCE);
        // model 1 would get sqrt(100 / 5 * 0.3 / 0.3) but is lifted to the ratio of model 0
        assert_approx_eq!(r[(0, 1)], r[(0, 0)], TOLERANCE);
    }
}
