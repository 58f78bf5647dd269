//! Numerically optimized evaluation ratios for model sequences that are not ordered by
//! correlation.
use super::{analytic, r_squared, RatioInputs, RatioSolution};
use crate::config::Target;
use crate::core::estimators::covariances;
use crate::core::{average, average_count, sequenced, QoiMatrix, Real};
use crate::error::{Error, Result};

/// The constraint the optimal sample profile has to satisfy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProblemTarget<T> {
    /// Total cost in equivalent high-fidelity evaluations.
    Budget(T),
    /// QoI-averaged estimator variance.
    EstimatorVariance(T),
}

/// The evaluation-ratio sub-problem: find ratios $r$, non-increasing along `sequence` and at least
/// one, minimizing the estimator variance under a budget or the cost under a variance target.
///
/// For a budget the high-fidelity samples already evaluated bound the solution from below, see
/// [`RatioProblem::with_min_hf_samples`]: ratios whose profile would need fewer high-fidelity
/// samples are infeasible.
#[derive(Clone, Debug)]
pub struct RatioProblem<'a, T> {
    rho2: &'a QoiMatrix<T>,
    var_h: &'a [T],
    var_l: &'a QoiMatrix<T>,
    costs: &'a [T],
    sequence: &'a [usize],
    target: ProblemTarget<T>,
    min_hf_samples: Option<T>,
}

impl<'a, T: Real> RatioProblem<'a, T> {
    /// Constructor.
    pub fn new(
        rho2: &'a QoiMatrix<T>,
        var_h: &'a [T],
        var_l: &'a QoiMatrix<T>,
        costs: &'a [T],
        sequence: &'a [usize],
        target: ProblemTarget<T>,
    ) -> Self {
        Self {
            rho2,
            var_h,
            var_l,
            costs,
            sequence,
            target,
            min_hf_samples: None,
        }
    }

    /// Requires at least `samples` high-fidelity samples in the profile of a budget problem.
    pub fn with_min_hf_samples(mut self, samples: T) -> Self {
        self.min_hf_samples = Some(samples);
        self
    }

    /// Number of low-fidelity models, i.e. the dimension of the problem.
    pub fn num_approx(&self) -> usize {
        self.rho2.cols()
    }

    /// The model sequence, least correlated model first.
    pub fn sequence(&self) -> &[usize] {
        self.sequence
    }

    /// The constraint of the problem.
    pub fn target(&self) -> ProblemTarget<T> {
        self.target
    }

    /// Lower bound of the high-fidelity sample count, if any.
    pub fn min_hf_samples(&self) -> Option<T> {
        self.min_hf_samples
    }

    /// Covariances $\mathrm{Cov}(L_i, H) = \sqrt{\rho^2 V_{L_i} V_H}$ of the problem.
    pub fn cov_lh(&self) -> QoiMatrix<T> {
        covariances(self.rho2, self.var_l, self.var_h)
    }

    /// Cost of one high-fidelity sample and its low-fidelity companions, relative to the
    /// high-fidelity cost: $1 + \sum_i c_i r_i / c_H$.
    pub fn relative_cost(&self, ratios: &[T]) -> T {
        let cost_h = self.costs[self.num_approx()];

        ratios
            .iter()
            .zip(self.costs)
            .fold(T::one(), |acc, (&r, &c)| acc + c * r / cost_h)
    }

    /// QoI-averaged estimator variance times the high-fidelity sample count,
    /// $\langle V_H (1 - R^2) \rangle$.
    pub fn variance_factor(&self, ratios: &[T]) -> T {
        let factors: Vec<_> = self
            .var_h
            .iter()
            .enumerate()
            .map(|(qoi, &var)| {
                var * (T::one() - r_squared(self.rho2.row(qoi), ratios, self.sequence))
            })
            .collect();

        average(&factors)
    }

    /// Whether the profile of `ratios` keeps the high-fidelity samples already evaluated within
    /// the budget.
    pub fn is_feasible(&self, ratios: &[T]) -> bool {
        match (self.target, self.min_hf_samples) {
            (ProblemTarget::Budget(budget), Some(samples)) => {
                let slack = T::one() + T::from_f64(1e-10).unwrap_or_else(T::epsilon);
                samples * self.relative_cost(ratios) <= budget * slack
            }
            _ => true,
        }
    }

    /// High-fidelity sample count satisfying the constraint with the given ratios, never below
    /// the lower bound.
    pub fn hf_target(&self, ratios: &[T]) -> T {
        let target = match self.target {
            ProblemTarget::Budget(budget) => budget / self.relative_cost(ratios),
            ProblemTarget::EstimatorVariance(est_var) => self.variance_factor(ratios) / est_var,
        };

        match (self.target, self.min_hf_samples) {
            (ProblemTarget::Budget(_), Some(samples)) => target.max(samples),
            _ => target,
        }
    }

    /// The objective, proportional to the estimator variance for a fixed budget and to the total
    /// cost for a fixed estimator variance. Infeasible ratios have an infinite objective.
    pub fn objective(&self, ratios: &[T]) -> T {
        if !self.is_feasible(ratios) {
            return T::infinity();
        }

        self.variance_factor(ratios) * self.relative_cost(ratios)
    }
}

/// Interface to the optimizer solving a [`RatioProblem`].
pub trait RatioOptimizer<T: Real> {
    /// Returns optimized ratios indexed by model, starting from the feasible `initial` ratios.
    /// The result has to be non-increasing along the problem sequence and at least one.
    fn optimize(&self, problem: &RatioProblem<T>, initial: &[T]) -> Result<Vec<T>>;
}

/// Derivative-free compass search.
///
/// The ratios are parametrized by non-negative logarithmic increments along the sequence, so
/// that every trial point satisfies the ordering constraints: the most correlated model gets
/// $r = e^{z_{K-1}}$ and every other model $r_k = r_{k+1} e^{z_k}$. Each sweep tries steps of
/// $\pm h$ in every coordinate, accepting the first improvement, and halves $h$ after a sweep
/// without improvement.
#[derive(Clone, Debug)]
pub struct CompassSearch<T> {
    initial_step: T,
    min_step: T,
    max_log_ratio: T,
    max_evaluations: usize,
}

impl<T: Real> Default for CompassSearch<T> {
    fn default() -> Self {
        Self::new(
            T::one(),
            T::from_f64(1e-8).unwrap_or_else(T::epsilon),
            T::from_f64(1e6).map_or_else(T::max_value, |max| max.ln()),
            10_000,
        )
    }
}

impl<T: Real> CompassSearch<T> {
    /// Constructor.
    pub fn new(initial_step: T, min_step: T, max_log_ratio: T, max_evaluations: usize) -> Self {
        Self {
            initial_step,
            min_step,
            max_log_ratio,
            max_evaluations,
        }
    }

    fn to_ratios(&self, increments: &[T], sequence: &[usize]) -> Vec<T> {
        let num_approx = increments.len();
        let mut ratios = vec![T::one(); num_approx];
        let mut log_ratio = T::zero();

        for k in (0..num_approx).rev() {
            log_ratio = log_ratio + increments[k];
            ratios[sequenced(sequence, k)] = log_ratio.exp();
        }

        ratios
    }

    fn to_increments(&self, ratios: &[T], sequence: &[usize]) -> Vec<T> {
        let num_approx = ratios.len();
        let mut increments = vec![T::zero(); num_approx];
        let mut upper = T::zero();

        for k in (0..num_approx).rev() {
            let log_ratio = ratios[sequenced(sequence, k)].max(T::one()).ln().max(upper);
            increments[k] = (log_ratio - upper).min(self.max_log_ratio);
            upper = log_ratio;
        }

        increments
    }
}

impl<T: Real> RatioOptimizer<T> for CompassSearch<T> {
    fn optimize(&self, problem: &RatioProblem<T>, initial: &[T]) -> Result<Vec<T>> {
        let sequence = problem.sequence();
        let mut x = self.to_increments(initial, sequence);
        let mut f = problem.objective(&self.to_ratios(&x, sequence));

        if !f.is_finite() {
            return Err(Error::Optimizer(format!(
                "objective is not finite at the initial guess {:?}",
                initial
            )));
        }

        let mut step = self.initial_step;
        let mut evaluations = 1;

        while step >= self.min_step && evaluations < self.max_evaluations {
            let mut improved = false;

            for dim in 0..x.len() {
                for &sign in &[T::one(), -T::one()] {
                    let value = (x[dim] + sign * step).max(T::zero()).min(self.max_log_ratio);

                    if value == x[dim] {
                        continue;
                    }

                    let mut trial = x.clone();
                    trial[dim] = value;
                    let f_trial = problem.objective(&self.to_ratios(&trial, sequence));
                    evaluations += 1;

                    if f_trial < f {
                        x = trial;
                        f = f_trial;
                        improved = true;
                        break;
                    }
                }
            }

            if !improved {
                step = step / (T::one() + T::one());
            }
        }

        log::debug!(
            "compass search finished after {} objective evaluations with objective {:?}",
            evaluations,
            f
        );

        Ok(self.to_ratios(&x, sequence))
    }
}

/// High-fidelity sample count $N_H = B c_H / (c_H + \sum_i c_i r_i)$ exhausting the `budget` given
/// in equivalent high-fidelity evaluations.
pub fn allocate_budget<T: Real>(ratios: &[T], costs: &[T], budget: T) -> T {
    let cost_h = costs[ratios.len()];
    let inner_prod = ratios
        .iter()
        .zip(costs)
        .fold(cost_h, |acc, (&r, &c)| acc + c * r);

    budget / inner_prod * cost_h
}

/// Scales `ratios` such that `n_h` high-fidelity samples together with their low-fidelity
/// companions use exactly the `budget`. Ratios never drop below one: ratios reaching one are
/// fixed there and the remaining ones are scaled to the budget left, so that the result is exact
/// whenever unit ratios fit into the budget.
pub fn scale_to_budget_with_pilot<T: Real>(ratios: &mut [T], costs: &[T], n_h: T, budget: T) {
    let cost_h = costs[ratios.len()];
    let mut fixed = vec![false; ratios.len()];

    loop {
        let (fixed_cost, free_cost) = ratios.iter().zip(costs).zip(&fixed).fold(
            (T::zero(), T::zero()),
            |(fixed_cost, free_cost), ((&r, &c), &is_fixed)| {
                if is_fixed {
                    (fixed_cost + c / cost_h, free_cost)
                } else {
                    (fixed_cost, free_cost + c * r / cost_h)
                }
            },
        );

        if !(free_cost > T::zero()) {
            return;
        }

        let factor = (budget / n_h - T::one() - fixed_cost) / free_cost;
        let mut clamped = false;

        for (ratio, is_fixed) in ratios.iter_mut().zip(fixed.iter_mut()) {
            if *is_fixed {
                continue;
            }

            *ratio = *ratio * factor;

            if *ratio <= T::one() {
                *ratio = T::one();
                *is_fixed = true;
                clamped = true;
            }
        }

        if !clamped {
            return;
        }

        // the clamped ratios were scaled with the others, undo it for the free ones
        for (ratio, &is_fixed) in ratios.iter_mut().zip(&fixed) {
            if !is_fixed {
                *ratio = *ratio / factor;
            }
        }
    }
}

/// Computes the numerical solution of the evaluation-ratio problem.
///
/// If the budget does not allow more than the current high-fidelity sample count with unit
/// ratios, only that count is feasible and the optimizer is not called. Otherwise the optimizer
/// starts from the previous numerical solution, or if there is none from the reordered analytic
/// solution. In budget mode the current high-fidelity sample count bounds the problem from below:
/// a starting point overshooting the budget is scaled back to it, and so is a result the
/// optimizer returns outside of the feasible set.
pub fn mfmc_numerical_solution<T: Real>(
    inputs: &RatioInputs<T>,
    rho2: &QoiMatrix<T>,
    optimizer: &dyn RatioOptimizer<T>,
) -> Result<RatioSolution<T>> {
    let num_functions = rho2.rows();
    let num_approx = rho2.cols();
    let avg_n_h = average_count::<T>(inputs.n_h);

    if let Target::Budget(budget) = inputs.target {
        let unit_ratios = vec![T::one(); num_approx];

        if inputs.equivalent_hf_evals >= budget
            || allocate_budget(&unit_ratios, inputs.costs, budget) <= avg_n_h
        {
            log::info!(
                "budget {:?} exhausted by {:?} equivalent HF evaluations, skipping optimization",
                budget,
                inputs.equivalent_hf_evals
            );

            let (sequence, _) = analytic::mfmc_reordered_analytic_solution(rho2, inputs.costs);
            let eval_ratios = QoiMatrix::filled(num_functions, num_approx, T::one());
            let avg_est_var = average(
                &inputs
                    .correlations
                    .var_h()
                    .iter()
                    .map(|&var| var / avg_n_h)
                    .collect::<Vec<_>>(),
            );

            return Ok(RatioSolution::Numerical {
                sequence,
                eval_ratios,
                avg_hf_target: avg_n_h,
                avg_est_var,
            });
        }
    }

    let (sequence, mut initial) = match inputs.previous {
        Some(RatioSolution::Numerical {
            sequence,
            eval_ratios,
            ..
        }) => (sequence.clone(), eval_ratios.column_means()),
        _ => {
            let (sequence, eval_ratios) =
                analytic::mfmc_reordered_analytic_solution(rho2, inputs.costs);
            let initial = eval_ratios.column_means();

            log::debug!(
                "initial guess from the reordered analytic solution: {:?}",
                initial
            );

            (sequence, initial)
        }
    };

    if let Target::Budget(budget) = inputs.target {
        if avg_n_h > allocate_budget(&initial, inputs.costs, budget) {
            scale_to_budget_with_pilot(&mut initial, inputs.costs, avg_n_h, budget);
            log::debug!("initial guess scaled to the pilot: {:?}", initial);
        }
    }

    let target = match inputs.target {
        Target::Budget(budget) => ProblemTarget::Budget(budget),
        Target::Tolerance(tolerance) => {
            let est_var_iter0 = inputs.est_var_iter0.ok_or_else(|| {
                Error::InvalidConfig(
                    "a tolerance target needs the pilot estimator variance".to_string(),
                )
            })?;
            ProblemTarget::EstimatorVariance(tolerance * average(est_var_iter0))
        }
    };

    let mut problem = RatioProblem::new(
        rho2,
        inputs.correlations.var_h(),
        inputs.correlations.var_l(),
        inputs.costs,
        &sequence,
        target,
    );
    if let Target::Budget(_) = inputs.target {
        problem = problem.with_min_hf_samples(avg_n_h);
    }

    let mut ratios = optimizer.optimize(&problem, &initial)?;

    if ratios.len() != num_approx || ratios.iter().any(|r| !r.is_finite()) {
        return Err(Error::Optimizer(format!(
            "optimizer returned invalid ratios {:?}",
            ratios
        )));
    }

    if let Target::Budget(budget) = inputs.target {
        if !problem.is_feasible(&ratios) {
            log::debug!(
                "optimized ratios {:?} overshoot the budget with {:?} HF samples, scaling",
                ratios,
                avg_n_h
            );
            scale_to_budget_with_pilot(&mut ratios, inputs.costs, avg_n_h, budget);
        }
    }

    let avg_hf_target = problem.hf_target(&ratios);
    let avg_est_var = problem.variance_factor(&ratios) / avg_hf_target;

    log::info!(
        "numerical solution: eval ratios = {:?}, HF target = {:?}, estimator variance = {:?}",
        ratios,
        avg_hf_target,
        avg_est_var
    );

    Ok(RatioSolution::Numerical {
        sequence: sequence.clone(),
        eval_ratios: QoiMatrix::from_row(num_functions, &ratios),
        avg_hf_target,
        avg_est_var,
    })
}
