//! Run configuration.
use crate::core::Real;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// How the pilot sample is treated.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PilotMode {
    /// The pilot is the first shared increment of an iterated refinement of the high-fidelity
    /// sample count.
    Online,
    /// The pilot only estimates correlations and is not charged; a separate online shared
    /// increment is drawn from the resulting allocation.
    Offline,
    /// Only the pilot is evaluated, the variance reduction of the optimal allocation is projected.
    Projection,
}

impl Default for PilotMode {
    fn default() -> Self {
        Self::Online
    }
}

/// Numerical thresholds used by the ratio solvers.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Tolerances<T> {
    /// Largest decrease of the squared correlation between two consecutive models that still
    /// counts as ordered.
    pub ordering: T,
    /// Squared correlations at or below this value are treated as zero.
    pub rho2_floor: T,
    /// Squared correlations are clamped to at most `1 - rho2_ceiling`.
    pub rho2_ceiling: T,
}

impl<T: Real> Default for Tolerances<T> {
    fn default() -> Self {
        let eps = T::from_f64(1e-10).unwrap_or_else(T::epsilon);
        Self {
            ordering: eps,
            rho2_floor: eps,
            rho2_ceiling: eps,
        }
    }
}

/// The quantity the allocation is scaled to.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub enum Target<T> {
    /// Total budget in equivalent high-fidelity evaluations.
    Budget(T),
    /// Relative reduction of the estimator variance with respect to the pilot Monte Carlo
    /// estimator.
    Tolerance(T),
}

/// Settings of a sample-allocation run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, bound(deserialize = "T: Real + Deserialize<'de>"))]
pub struct MfmcConfig<T> {
    /// Number of shared samples in the pilot.
    pub pilot_samples: usize,
    /// Maximum number of refinement iterations after the pilot (online mode only).
    pub max_iterations: usize,
    /// Budget in equivalent high-fidelity evaluations.
    pub max_function_evals: Option<T>,
    /// Target ratio of the final to the pilot estimator variance.
    pub convergence_tol: Option<T>,
    /// Treatment of the pilot sample.
    pub pilot_mode: PilotMode,
    /// Use the reordered analytic solution instead of the numerical one if the models are not
    /// ordered by correlation.
    pub prefer_reordered_analytic: bool,
    /// Thresholds of the ratio solvers.
    pub tolerances: Tolerances<T>,
}

impl<T: Real> Default for MfmcConfig<T> {
    fn default() -> Self {
        Self {
            pilot_samples: 100,
            max_iterations: 100,
            max_function_evals: None,
            convergence_tol: None,
            pilot_mode: PilotMode::default(),
            prefer_reordered_analytic: false,
            tolerances: Tolerances::default(),
        }
    }
}

impl<T: Real> MfmcConfig<T> {
    /// Configuration targeting a budget of `budget` equivalent high-fidelity evaluations.
    pub fn with_budget(pilot_samples: usize, budget: T) -> Self {
        Self {
            pilot_samples,
            max_function_evals: Some(budget),
            ..Self::default()
        }
    }

    /// Configuration targeting an estimator variance of `tolerance` times the pilot estimator
    /// variance.
    pub fn with_tolerance(pilot_samples: usize, tolerance: T) -> Self {
        Self {
            pilot_samples,
            convergence_tol: Some(tolerance),
            ..Self::default()
        }
    }

    /// Validates the configuration and returns the active target.
    pub fn target(&self) -> Result<Target<T>> {
        if self.pilot_samples == 0 {
            return Err(Error::InvalidConfig(
                "`pilot_samples` must be positive".to_string(),
            ));
        }

        let target = match (self.max_function_evals, self.convergence_tol) {
            (Some(_), Some(_)) => return Err(Error::ConflictingTargets),
            (None, None) => return Err(Error::MissingTarget),
            (Some(budget), None) => {
                if !(budget.is_finite() && budget > T::zero()) {
                    return Err(Error::InvalidConfig(format!(
                        "`max_function_evals` must be positive and finite, got {:?}",
                        budget
                    )));
                }
                Target::Budget(budget)
            }
            (None, Some(tol)) => {
                if !(tol.is_finite() && tol > T::zero()) {
                    return Err(Error::InvalidConfig(format!(
                        "`convergence_tol` must be positive and finite, got {:?}",
                        tol
                    )));
                }
                Target::Tolerance(tol)
            }
        };

        if self.pilot_mode == PilotMode::Offline {
            if let Target::Tolerance(_) = target {
                return Err(Error::BudgetRequired);
            }
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_and_tolerance_are_exclusive() {
        let mut config = MfmcConfig::<f64>::with_budget(20, 100.0);
        assert_eq!(config.target(), Ok(Target::Budget(100.0)));

        config.convergence_tol = Some(0.01);
        assert_eq!(config.target(), Err(Error::ConflictingTargets));

        config.max_function_evals = None;
        assert_eq!(config.target(), Ok(Target::Tolerance(0.01)));

        config.convergence_tol = None;
        assert_eq!(config.target(), Err(Error::MissingTarget));
    }

    #[test]
    fn offline_pilot_needs_budget() {
        let mut config = MfmcConfig::<f64>::with_tolerance(20, 0.1);
        config.pilot_mode = PilotMode::Offline;
        assert_eq!(config.target(), Err(Error::BudgetRequired));

        let mut config = MfmcConfig::<f64>::with_budget(20, 50.0);
        config.pilot_mode = PilotMode::Offline;
        assert_eq!(config.target(), Ok(Target::Budget(50.0)));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            MfmcConfig::<f64>::with_budget(0, 50.0).target(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            MfmcConfig::<f64>::with_budget(10, f64::INFINITY).target(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            MfmcConfig::<f64>::with_tolerance(10, -1.0).target(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: MfmcConfig<f64> =
            serde_json::from_str(r#"{ "pilot_samples": 50, "max_function_evals": 1000.0 }"#)
                .unwrap();

        assert_eq!(config.pilot_samples, 50);
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.pilot_mode, PilotMode::Online);
        assert_eq!(config.tolerances, Tolerances::default());
        assert_eq!(config.target(), Ok(Target::Budget(1000.0)));
    }
}
