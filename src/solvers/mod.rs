//! Solvers for the optimal evaluation ratios $r_i = N_{L_i} / N_H$ and the resulting
//! high-fidelity sample targets.
pub mod analytic;
pub mod numerical;

use crate::config::{Target, Tolerances};
use crate::core::estimators::Correlations;
use crate::core::{average, count, sequenced, QoiMatrix, Real};
use crate::error::{Error, Result, Warning};
use numerical::RatioOptimizer;
use serde::{Deserialize, Serialize};

/// The way the evaluation ratios were computed.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum SolutionForm {
    /// Closed-form solution for models ordered by correlation.
    Analytic,
    /// Closed-form solution along a model sequence sorted by QoI-averaged correlation.
    ReorderedAnalytic,
    /// Numerically optimized ratios along a model sequence.
    Numerical,
}

/// Evaluation ratios together with the data specific to the way they were computed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum RatioSolution<T> {
    /// Per-QoI closed-form ratios in the nominal model order.
    Analytic {
        /// Ratios indexed by QoI and model.
        eval_ratios: QoiMatrix<T>,
    },
    /// Closed-form ratios shared by all QoI.
    ReorderedAnalytic {
        /// Models sorted from the least to the most correlated one.
        sequence: Vec<usize>,
        /// Ratios indexed by QoI and model, all rows are equal.
        eval_ratios: QoiMatrix<T>,
    },
    /// Numerically optimized ratios shared by all QoI.
    Numerical {
        /// Models sorted from the least to the most correlated one.
        sequence: Vec<usize>,
        /// Ratios indexed by QoI and model, all rows are equal.
        eval_ratios: QoiMatrix<T>,
        /// Optimal high-fidelity sample count.
        avg_hf_target: T,
        /// QoI-averaged estimator variance at the optimum.
        avg_est_var: T,
    },
}

impl<T> RatioSolution<T> {
    /// Returns the form of this solution.
    pub fn form(&self) -> SolutionForm {
        match self {
            Self::Analytic { .. } => SolutionForm::Analytic,
            Self::ReorderedAnalytic { .. } => SolutionForm::ReorderedAnalytic,
            Self::Numerical { .. } => SolutionForm::Numerical,
        }
    }

    /// Returns the evaluation ratios indexed by QoI and model.
    pub fn eval_ratios(&self) -> &QoiMatrix<T> {
        match self {
            Self::Analytic { eval_ratios }
            | Self::ReorderedAnalytic { eval_ratios, .. }
            | Self::Numerical { eval_ratios, .. } => eval_ratios,
        }
    }

    /// Returns the approximation sequence, which is empty for the nominal model order.
    pub fn sequence(&self) -> &[usize] {
        match self {
            Self::Analytic { .. } => &[],
            Self::ReorderedAnalytic { sequence, .. } | Self::Numerical { sequence, .. } => sequence,
        }
    }
}

/// Everything the ratio solvers need to know about the current state of a run.
#[derive(Clone, Copy, Debug)]
pub struct RatioInputs<'a, T> {
    /// Variances and squared correlations estimated from the shared samples.
    pub correlations: &'a Correlations<T>,
    /// Cost of each model, high fidelity last.
    pub costs: &'a [T],
    /// Budget or tolerance the allocation is scaled to.
    pub target: Target<T>,
    /// Current high-fidelity sample counts per QoI.
    pub n_h: &'a [usize],
    /// Cost spent so far in equivalent high-fidelity evaluations.
    pub equivalent_hf_evals: T,
    /// Monte Carlo estimator variance of the pilot, needed by the tolerance target.
    pub est_var_iter0: Option<&'a [T]>,
    /// Solution of the previous iteration, used for warm starts.
    pub previous: Option<&'a RatioSolution<T>>,
    /// Prefer the reordered analytic over the numerical solution.
    pub prefer_reordered: bool,
    /// Numerical thresholds.
    pub tolerances: &'a Tolerances<T>,
}

/// Result of [`mfmc_eval_ratios`].
#[derive(Clone, Debug, PartialEq)]
pub struct EvalRatios<T> {
    /// The evaluation ratios.
    pub solution: RatioSolution<T>,
    /// High-fidelity sample targets per QoI.
    pub hf_targets: Vec<T>,
    /// The squared correlations the ratios were computed from, after clamping.
    pub rho2: QoiMatrix<T>,
    /// Degeneracies found on the way.
    pub warnings: Vec<Warning>,
}

/// Clamps the squared correlations into $[0, 1 - \epsilon]$ and zeroes everything at or below the
/// floor. QoI without any correlated model raise [`Warning::DegenerateCorrelation`].
pub fn sanitize_rho2<T: Real>(
    rho2: &QoiMatrix<T>,
    tolerances: &Tolerances<T>,
) -> (QoiMatrix<T>, Vec<Warning>) {
    let ceiling = T::one() - tolerances.rho2_ceiling;
    let mut clamped = rho2.clone();
    let mut warnings = Vec::new();

    for qoi in 0..rho2.rows() {
        for approx in 0..rho2.cols() {
            let value = rho2[(qoi, approx)];

            clamped[(qoi, approx)] = if value.is_nan() || value <= tolerances.rho2_floor {
                T::zero()
            } else if value > ceiling {
                warnings.push(Warning::PerfectCorrelation { qoi, approx });
                ceiling
            } else {
                value
            };
        }

        if clamped.row(qoi).iter().all(|&value| value == T::zero()) {
            warnings.push(Warning::DegenerateCorrelation { qoi });
        }
    }

    (clamped, warnings)
}

/// Picks the solution form for the squared correlations `rho2`.
pub fn select_form<T: Real>(
    rho2: &QoiMatrix<T>,
    ordering: T,
    prefer_reordered: bool,
) -> SolutionForm {
    if analytic::is_ordered(rho2, ordering) {
        SolutionForm::Analytic
    } else if prefer_reordered {
        SolutionForm::ReorderedAnalytic
    } else {
        SolutionForm::Numerical
    }
}

/// Returns $R^2 \in [0, 1)$ of a single QoI.
///
/// With the models along the sequence from the least to the most correlated one and $r_K = 1$
/// denoting the high-fidelity model this is
///
/// $$ R^2 = \sum_{k=0}^{K-1} \left( \frac{1}{r_{k+1}} - \frac{1}{r_k} \right) \rho^2_k $$
pub fn r_squared<T: Real>(rho2: &[T], ratios: &[T], sequence: &[usize]) -> T {
    let num_approx = rho2.len();

    (0..num_approx).fold(T::zero(), |acc, k| {
        let approx = sequenced(sequence, k);
        let next = if k + 1 == num_approx {
            T::one()
        } else {
            ratios[sequenced(sequence, k + 1)]
        };

        acc + (next.recip() - ratios[approx].recip()) * rho2[approx]
    })
}

/// Returns the ratio $1 - R^2$ of the MFMC to the Monte Carlo estimator variance for every QoI.
pub fn mfmc_estvar_ratios<T: Real>(
    rho2: &QoiMatrix<T>,
    eval_ratios: &QoiMatrix<T>,
    sequence: &[usize],
) -> Vec<T> {
    (0..rho2.rows())
        .map(|qoi| T::one() - r_squared(rho2.row(qoi), eval_ratios.row(qoi), sequence))
        .collect()
}

/// Returns the estimator variance ratios of the sample profile that is actually realized.
///
/// The low-fidelity targets are $r^* N^*$ with $N^*$ the average high-fidelity target. If a
/// high-fidelity count already exceeds the rounded target, the realized ratios of its QoI are
/// $r^* N^* / N_H$, but never smaller than one. The clamp departs from scaling the ratios alone:
/// every low-fidelity model is evaluated on all shared samples, so that $N_{L_i} \ge N_H$ and a
/// realized ratio below one cannot occur.
pub fn est_var_ratios<T: Real>(
    rho2: &QoiMatrix<T>,
    solution: &RatioSolution<T>,
    hf_targets: &[T],
    n_h: &[usize],
) -> Vec<T> {
    let avg_target = average(hf_targets);
    let rounded = avg_target.round();
    let eval_ratios = solution.eval_ratios();

    if !n_h.iter().any(|&n| count::<T>(n) > rounded) {
        return mfmc_estvar_ratios(rho2, eval_ratios, solution.sequence());
    }

    let mut scaled = eval_ratios.clone();

    for (qoi, &n) in n_h.iter().enumerate() {
        let star_to_actual = avg_target / count(n);

        for approx in 0..scaled.cols() {
            scaled[(qoi, approx)] = (scaled[(qoi, approx)] * star_to_actual).max(T::one());
        }
    }

    mfmc_estvar_ratios(rho2, &scaled, solution.sequence())
}

/// High-fidelity targets $N_H^* = B c_H / (c_H + \sum_i c_i r_i)$ exhausting a budget $B$ given in
/// equivalent high-fidelity evaluations.
pub fn budget_targets<T: Real>(eval_ratios: &QoiMatrix<T>, costs: &[T], budget: T) -> Vec<T> {
    (0..eval_ratios.rows())
        .map(|qoi| numerical::allocate_budget(eval_ratios.row(qoi), costs, budget))
        .collect()
}

/// High-fidelity targets reaching an estimator variance of `tolerance` times the pilot estimator
/// variance, $N_H^* = (1 - R^2) V_H / (\mathrm{EstVar}_0 \cdot \mathrm{tol})$.
pub fn tolerance_targets<T: Real>(
    estvar_ratios: &[T],
    var_h: &[T],
    est_var_iter0: &[T],
    tolerance: T,
) -> Vec<T> {
    estvar_ratios
        .iter()
        .zip(var_h)
        .zip(est_var_iter0)
        .map(|((&ratio, &var), &est_var)| {
            if est_var > T::zero() {
                ratio * var / (est_var * tolerance)
            } else {
                T::zero()
            }
        })
        .collect()
}

/// Computes the evaluation ratios and the high-fidelity targets of the current iteration.
pub fn mfmc_eval_ratios<T: Real>(
    inputs: &RatioInputs<T>,
    optimizer: &dyn RatioOptimizer<T>,
) -> Result<EvalRatios<T>> {
    let (rho2, warnings) = sanitize_rho2(inputs.correlations.rho2_lh(), inputs.tolerances);
    let form = select_form(&rho2, inputs.tolerances.ordering, inputs.prefer_reordered);

    for warning in &warnings {
        log::warn!("{}", warning);
    }

    let solution = match form {
        SolutionForm::Analytic => {
            log::info!("models are ordered by correlation for all QoI, using analytic solution");
            RatioSolution::Analytic {
                eval_ratios: analytic::mfmc_analytic_solution(&rho2, inputs.costs),
            }
        }
        SolutionForm::ReorderedAnalytic => {
            let (sequence, eval_ratios) =
                analytic::mfmc_reordered_analytic_solution(&rho2, inputs.costs);
            log::info!(
                "models are not ordered by correlation, using analytic solution along {:?}",
                sequence
            );
            RatioSolution::ReorderedAnalytic {
                sequence,
                eval_ratios,
            }
        }
        SolutionForm::Numerical => {
            log::info!("models are not ordered by correlation, using the numerical solution");
            numerical::mfmc_numerical_solution(inputs, &rho2, optimizer)?
        }
    };

    let hf_targets = match (&solution, inputs.target) {
        (RatioSolution::Numerical { avg_hf_target, .. }, _) => {
            vec![*avg_hf_target; rho2.rows()]
        }
        (_, Target::Budget(budget)) => {
            budget_targets(solution.eval_ratios(), inputs.costs, budget)
        }
        (_, Target::Tolerance(tolerance)) => {
            let est_var_iter0 = inputs.est_var_iter0.ok_or_else(|| {
                Error::InvalidConfig(
                    "a tolerance target needs the pilot estimator variance".to_string(),
                )
            })?;
            let estvar_ratios =
                mfmc_estvar_ratios(&rho2, solution.eval_ratios(), solution.sequence());
            tolerance_targets(
                &estvar_ratios,
                inputs.correlations.var_h(),
                est_var_iter0,
                tolerance,
            )
        }
    };

    log::info!(
        "scaled profile for {:?}: average HF target = {:?}",
        inputs.target,
        average(&hf_targets)
    );

    for qoi in 0..rho2.rows() {
        log::debug!(
            "QoI {}: rho2_LH = {:?}, eval ratios = {:?}",
            qoi,
            rho2.row(qoi),
            solution.eval_ratios().row(qoi)
        );
    }

    Ok(EvalRatios {
        solution,
        hf_targets,
        rho2,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::numerical::CompassSearch;
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const TOLERANCE: f64 = 1e-12;

    fn correlations(rho2: &[&[f64]]) -> Correlations<f64> {
        let rows = rho2.len();
        let cols = rho2[0].len();
        let mut matrix = QoiMatrix::zeros(rows, cols);

        for (qoi, row) in rho2.iter().enumerate() {
            for (approx, &value) in row.iter().enumerate() {
                matrix[(qoi, approx)] = value;
            }
        }

        Correlations::new(QoiMatrix::filled(rows, cols, 1.0), vec![1.0; rows], matrix)
    }

    fn inputs<'a>(
        correlations: &'a Correlations<f64>,
        costs: &'a [f64],
        target: Target<f64>,
        n_h: &'a [usize],
        tolerances: &'a Tolerances<f64>,
    ) -> RatioInputs<'a, f64> {
        RatioInputs {
            correlations,
            costs,
            target,
            n_h,
            equivalent_hf_evals: 0.0,
            est_var_iter0: None,
            previous: None,
            prefer_reordered: false,
            tolerances,
        }
    }

    #[test]
    fn ordered_scenario() {
        let corr = correlations(&[&[0.4, 0.8]]);
        let costs = [1.0, 5.0, 100.0];
        let tolerances = Tolerances::default();
        let n_h = [100];
        let result = mfmc_eval_ratios(
            &inputs(&corr, &costs, Target::Budget(10000.0), &n_h, &tolerances),
            &CompassSearch::default(),
        )
        .unwrap();

        assert_eq!(result.solution.form(), SolutionForm::Analytic);
        assert!(result.solution.sequence().is_empty());
        assert!(result.warnings.is_empty());

        let r = result.solution.eval_ratios();
        assert_approx_eq!(r[(0, 0)], 200.0_f64.sqrt(), TOLERANCE);
        assert_approx_eq!(r[(0, 1)], 40.0_f64.sqrt(), TOLERANCE);
        assert!(r[(0, 0)] > r[(0, 1)] && r[(0, 1)] > 1.0);

        let target = 10000.0 * 100.0 / (100.0 + 200.0_f64.sqrt() + 5.0 * 40.0_f64.sqrt());
        assert_approx_eq!(result.hf_targets[0], target, 1e-9);

        // equivalent cost of the profile equals the budget
        let spent = target * (1.0 + (r[(0, 0)] + 5.0 * r[(0, 1)]) / 100.0);
        assert_approx_eq!(spent, 10000.0, 1e-9);

        let estvar = est_var_ratios(&result.rho2, &result.solution, &result.hf_targets, &n_h);
        let r2 = (1.0 / 40.0_f64.sqrt() - 1.0 / 200.0_f64.sqrt()) * 0.4
            + (1.0 - 1.0 / 40.0_f64.sqrt()) * 0.8;
        assert_approx_eq!(estvar[0], 1.0 - r2, TOLERANCE);
    }

    #[test]
    fn degenerate_correlation_collapses_to_high_fidelity() {
        let corr = correlations(&[&[0.0, 0.0], &[0.3, 0.5]]);
        let costs = [1.0, 5.0, 100.0];
        let tolerances = Tolerances::default();
        let n_h = [10, 10];
        let result = mfmc_eval_ratios(
            &inputs(&corr, &costs, Target::Budget(1000.0), &n_h, &tolerances),
            &CompassSearch::default(),
        )
        .unwrap();

        assert_eq!(
            result.warnings,
            vec![Warning::DegenerateCorrelation { qoi: 0 }]
        );
        assert_eq!(result.solution.eval_ratios().row(0), &[1.0, 1.0]);
        // budget divided by the cost of one sample on every model
        assert_approx_eq!(result.hf_targets[0], 1000.0 * 100.0 / 106.0, 1e-9);

        let estvar = est_var_ratios(&result.rho2, &result.solution, &result.hf_targets, &n_h);
        assert_eq!(estvar[0], 1.0);
        assert!(estvar[1] < 1.0);
    }

    #[test]
    fn perfect_correlation_is_clamped() {
        let corr = correlations(&[&[0.5, 1.0]]);
        let tolerances = Tolerances::default();
        let (rho2, warnings) = sanitize_rho2(corr.rho2_lh(), &tolerances);

        assert_eq!(warnings, vec![Warning::PerfectCorrelation { qoi: 0, approx: 1 }]);
        assert!(rho2[(0, 1)] < 1.0);
        assert_eq!(rho2[(0, 0)], 0.5);
    }

    #[test]
    fn form_selection() {
        let ordered = correlations(&[&[0.2, 0.6], &[0.1, 0.9]]);
        let unordered = correlations(&[&[0.2, 0.6], &[0.9, 0.1]]);

        assert_eq!(
            select_form(ordered.rho2_lh(), 1e-10, false),
            SolutionForm::Analytic
        );
        assert_eq!(
            select_form(unordered.rho2_lh(), 1e-10, false),
            SolutionForm::Numerical
        );
        assert_eq!(
            select_form(unordered.rho2_lh(), 1e-10, true),
            SolutionForm::ReorderedAnalytic
        );
    }

    #[test]
    fn overshooting_pilot_takes_credit() {
        let corr = correlations(&[&[0.4, 0.8]]);
        let costs = [1.0, 5.0, 100.0];
        let tolerances = Tolerances::default();
        let result = mfmc_eval_ratios(
            &inputs(&corr, &costs, Target::Budget(1000.0), &[5], &tolerances),
            &CompassSearch::default(),
        )
        .unwrap();

        let nominal = est_var_ratios(&result.rho2, &result.solution, &result.hf_targets, &[5]);
        // far beyond the target of about 686 samples, so that all realized ratios collapse to one
        let oversampled =
            est_var_ratios(&result.rho2, &result.solution, &result.hf_targets, &[100_000]);

        assert!(nominal[0] < 1.0);
        assert_approx_eq!(oversampled[0], 1.0, TOLERANCE);
    }

    #[test]
    fn tolerance_mode_targets() {
        let corr = correlations(&[&[0.4, 0.8]]);
        let costs = [1.0, 5.0, 100.0];
        let tolerances = Tolerances::default();
        let n_h = [20];
        let est_var_iter0 = [1.0 / 20.0];
        let mut inputs = inputs(&corr, &costs, Target::Tolerance(0.1), &n_h, &tolerances);

        assert!(matches!(
            mfmc_eval_ratios(&inputs, &CompassSearch::default()),
            Err(Error::InvalidConfig(_))
        ));

        inputs.est_var_iter0 = Some(&est_var_iter0);
        let result = mfmc_eval_ratios(&inputs, &CompassSearch::default()).unwrap();
        let estvar = mfmc_estvar_ratios(
            &result.rho2,
            result.solution.eval_ratios(),
            result.solution.sequence(),
        );

        // (1 - R^2) * var_H / (var_H / 20 * 0.1)
        assert_approx_eq!(result.hf_targets[0], estvar[0] * 200.0, 1e-9);
        assert_eq!(tolerance_targets(&[0.5], &[1.0], &[0.0], 0.1), vec![0.0]);
    }

    #[test]
    fn r_squared_along_sequence() {
        // model 1 is the least correlated one
        let rho2 = [0.8, 0.4];
        let ratios = [40.0_f64.sqrt(), 200.0_f64.sqrt()];
        let r2 = r_squared(&rho2, &ratios, &[1, 0]);

        assert_approx_eq!(
            r2,
            (1.0 / ratios[0] - 1.0 / ratios[1]) * 0.4 + (1.0 - 1.0 / ratios[0]) * 0.8,
            TOLERANCE
        );
        assert_eq!(r_squared(&rho2, &[1.0, 1.0], &[1, 0]), 0.0);
    }
}
