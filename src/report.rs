//! Per-iteration checkpoints and the final report of a run.
use crate::config::PilotMode;
use crate::core::{average, average_count, count, QoiMatrix, Real};
use crate::error::Warning;
use crate::solvers::{RatioSolution, SolutionForm};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of the allocation after a shared sample increment.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Checkpoint<T> {
    iteration: usize,
    samples: usize,
    n_h: Vec<usize>,
    equivalent_hf_evals: T,
    var_h: Vec<T>,
    rho2: QoiMatrix<T>,
    solution: RatioSolution<T>,
    hf_targets: Vec<T>,
    est_var_ratios: Vec<T>,
    next_samples: usize,
}

impl<T: Real> Checkpoint<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        iteration: usize,
        samples: usize,
        n_h: Vec<usize>,
        equivalent_hf_evals: T,
        var_h: Vec<T>,
        rho2: QoiMatrix<T>,
        solution: RatioSolution<T>,
        hf_targets: Vec<T>,
        est_var_ratios: Vec<T>,
        next_samples: usize,
    ) -> Self {
        Self {
            iteration,
            samples,
            n_h,
            equivalent_hf_evals,
            var_h,
            rho2,
            solution,
            hf_targets,
            est_var_ratios,
            next_samples,
        }
    }

    /// Index of the shared increment.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Number of shared samples requested in this increment.
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// High-fidelity sample counts per QoI after this increment.
    pub fn n_h(&self) -> &[usize] {
        &self.n_h
    }

    /// Cost spent so far in equivalent high-fidelity evaluations.
    pub fn equivalent_hf_evals(&self) -> T {
        self.equivalent_hf_evals
    }

    /// High-fidelity variances per QoI.
    pub fn var_h(&self) -> &[T] {
        &self.var_h
    }

    /// Squared correlations the ratios were computed from.
    pub fn rho2(&self) -> &QoiMatrix<T> {
        &self.rho2
    }

    /// Evaluation ratios of this iteration.
    pub fn solution(&self) -> &RatioSolution<T> {
        &self.solution
    }

    /// High-fidelity sample targets per QoI.
    pub fn hf_targets(&self) -> &[T] {
        &self.hf_targets
    }

    /// Ratios of the MFMC to the Monte Carlo estimator variance per QoI.
    pub fn est_var_ratios(&self) -> &[T] {
        &self.est_var_ratios
    }

    /// Number of shared samples the next increment needs, zero once converged.
    pub fn next_samples(&self) -> usize {
        self.next_samples
    }
}

/// Everything a run has estimated.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MfmcReport<T> {
    /// Treatment of the pilot sample.
    pub pilot_mode: PilotMode,
    /// Final evaluation ratios.
    pub solution: RatioSolution<T>,
    /// Number of shared increments.
    pub iterations: usize,
    /// Total cost in equivalent high-fidelity evaluations.
    pub equivalent_hf_evals: T,
    /// Monte Carlo estimator variance of the pilot, not available for an offline pilot.
    pub est_var_iter0: Option<Vec<T>>,
    /// High-fidelity pilot sample counts, not available for an offline pilot.
    pub num_h_iter0: Option<Vec<usize>>,
    /// High-fidelity sample counts, projected ones for [`PilotMode::Projection`].
    pub num_h: Vec<usize>,
    /// High-fidelity sample counts actually evaluated.
    pub n_shared: Vec<usize>,
    /// High-fidelity variances.
    pub var_h: Vec<T>,
    /// Squared correlations indexed by QoI and model.
    pub rho2: QoiMatrix<T>,
    /// High-fidelity sample targets.
    pub hf_targets: Vec<T>,
    /// Ratios of the MFMC to the Monte Carlo estimator variance.
    pub est_var_ratios: Vec<T>,
    /// Low-fidelity sample counts indexed by model and QoI, projected ones for
    /// [`PilotMode::Projection`].
    pub n_l: Vec<Vec<usize>>,
    /// Raw moments $E[H^m]$, $m = 1, \ldots, 4$, per QoI. Not estimated for
    /// [`PilotMode::Projection`].
    pub raw_moments: Option<Vec<[T; 4]>>,
    /// Non-fatal conditions encountered during the run.
    pub warnings: Vec<Warning>,
}

impl<T: Real> MfmcReport<T> {
    /// The form of the final solution.
    pub fn form(&self) -> SolutionForm {
        self.solution.form()
    }

    /// Final evaluation ratios indexed by QoI and model.
    pub fn eval_ratios(&self) -> &QoiMatrix<T> {
        self.solution.eval_ratios()
    }

    /// Final approximation sequence, empty for the nominal model order.
    pub fn approx_sequence(&self) -> &[usize] {
        self.solution.sequence()
    }

    /// Summarizes the variance of the mean estimators.
    pub fn variance_reduction(&self) -> VarianceReduction<T> {
        let mc_est_var: Vec<_> = self
            .var_h
            .iter()
            .zip(&self.num_h)
            .map(|(&var, &n)| var / count(n))
            .collect();
        let mfmc_est_var: Vec<_> = mc_est_var
            .iter()
            .zip(&self.est_var_ratios)
            .map(|(&var, &ratio)| var * ratio)
            .collect();
        let initial = match (&self.est_var_iter0, &self.num_h_iter0) {
            (Some(est_var), Some(n)) => Some((rounded(average_count::<T>(n)), average(est_var))),
            _ => None,
        };
        let avg_mc_est_var = average(&mc_est_var);
        let avg_mfmc_est_var = average(&mfmc_est_var);

        VarianceReduction {
            projected: self.pilot_mode == PilotMode::Projection,
            initial,
            hf_samples: rounded(average_count::<T>(&self.num_h)),
            mc_est_var: avg_mc_est_var,
            mfmc_est_var: avg_mfmc_est_var,
            ratio: avg_mfmc_est_var / avg_mc_est_var,
        }
    }
}

fn rounded<T: Real>(value: T) -> usize {
    value.round().to_usize().unwrap_or(0)
}

/// QoI-averaged variances of the Monte Carlo and the MFMC mean estimators.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct VarianceReduction<T> {
    /// The sample profile was projected and not evaluated.
    pub projected: bool,
    /// Rounded average pilot sample count and the Monte Carlo estimator variance of the pilot.
    pub initial: Option<(usize, T)>,
    /// Rounded average high-fidelity sample count.
    pub hf_samples: usize,
    /// Variance of the Monte Carlo estimator with the final high-fidelity samples.
    pub mc_est_var: T,
    /// Variance of the MFMC estimator.
    pub mfmc_est_var: T,
    /// Ratio of the averaged estimator variances, $1 - R^2$ for a single QoI.
    pub ratio: T,
}

impl<T: fmt::LowerExp> fmt::Display for VarianceReduction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.projected { "Projected" } else { "    Final" };

        writeln!(f, "<<<<< Variance for mean estimator:")?;

        if let Some((samples, est_var)) = &self.initial {
            writeln!(
                f,
                "      Initial MC ({:4} HF samples): {:14.6e}",
                samples, est_var
            )?;
        }

        writeln!(
            f,
            "  {}   MC ({:4} HF samples): {:14.6e}",
            label, self.hf_samples, self.mc_est_var
        )?;
        writeln!(
            f,
            "  {} MFMC (sample profile):  {:14.6e}",
            label, self.mfmc_est_var
        )?;
        write!(
            f,
            "  {} MFMC ratio (1 - R^2):   {:14.6e}",
            label, self.ratio
        )
    }
}
