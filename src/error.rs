//! Errors that abort a run and warnings that are attached to its report.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the sample-allocation engine. Each of them aborts the current run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// The offline pilot mode can only be targeted at a fixed budget.
    #[error("budget (`max_function_evals`) required for offline pilot mode")]
    BudgetRequired,

    /// Both a budget and a convergence tolerance were configured.
    #[error("both `max_function_evals` and `convergence_tol` are set, exactly one is allowed")]
    ConflictingTargets,

    /// Neither a budget nor a convergence tolerance was configured.
    #[error("one of `max_function_evals` or `convergence_tol` must be set")]
    MissingTarget,

    /// A configuration value is out of its admissible range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The model costs do not describe the ensemble: either their number is wrong or one of them
    /// is not positive and finite.
    #[error("expected {expected} positive finite model costs, found {found} ({invalid} invalid)")]
    InvalidCosts {
        /// Number of models in the ensemble, high fidelity included.
        expected: usize,
        /// Number of costs reported by the ensemble.
        found: usize,
        /// Number of reported costs that are not positive and finite.
        invalid: usize,
    },

    /// Fewer than two jointly finite samples are available for a QoI, so that its variance is
    /// undefined.
    #[error("QoI {qoi} has {count} shared samples, at least 2 are needed to estimate variances")]
    InsufficientSamples {
        /// Index of the QoI.
        qoi: usize,
        /// Number of shared samples accumulated for it.
        count: usize,
    },

    /// A response returned by the ensemble does not have `(num_approx + 1) * num_functions` values.
    #[error("response has {found} values, expected {expected}")]
    ResponseLength {
        /// Required number of values.
        expected: usize,
        /// Number of values found.
        found: usize,
    },

    /// The numerical evaluation-ratio solve failed.
    #[error("evaluation ratio optimization failed: {0}")]
    Optimizer(String),
}

/// Shorthand for results of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Conditions that do not abort a run but make its results less trustworthy.
#[derive(Clone, Debug, Deserialize, Error, Serialize, PartialEq, Eq)]
pub enum Warning {
    /// All low-fidelity models are uncorrelated with the high-fidelity model for this QoI: the
    /// allocation collapses to high-fidelity-only sampling.
    #[error("QoI {qoi}: no low-fidelity model is correlated, using high-fidelity samples only")]
    DegenerateCorrelation {
        /// Index of the QoI.
        qoi: usize,
    },

    /// The squared correlation of a model reached one (or left `[0, 1]`) and was clamped.
    #[error("QoI {qoi} approx {approx}: squared correlation clamped below one")]
    PerfectCorrelation {
        /// Index of the QoI.
        qoi: usize,
        /// Index of the low-fidelity model.
        approx: usize,
    },

    /// The iteration limit stopped the high-fidelity refinement before its target was met.
    #[error(
        "iteration limit reached after {iterations} iterations with {remaining_samples} shared \
         samples outstanding"
    )]
    MaxIterations {
        /// Number of completed iterations.
        iterations: usize,
        /// Shared samples that would still have been needed.
        remaining_samples: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_messages() {
        assert_eq!(
            Warning::MaxIterations {
                iterations: 3,
                remaining_samples: 17
            }
            .to_string(),
            "iteration limit reached after 3 iterations with 17 shared samples outstanding"
        );
        assert_eq!(
            Warning::PerfectCorrelation { qoi: 1, approx: 0 }.to_string(),
            "QoI 1 approx 0: squared correlation clamped below one"
        );

        let warning: &dyn std::error::Error = &Warning::DegenerateCorrelation { qoi: 2 };
        assert!(warning.to_string().starts_with("QoI 2:"));
    }
}
