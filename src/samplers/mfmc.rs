//! Multifidelity Monte Carlo sampler
use crate::callbacks::Callback;
use crate::config::{MfmcConfig, PilotMode, Target};
use crate::core::accumulators::{MomentSums, PilotSums, PowerSums, RefinedSums};
use crate::core::estimators::{
    compute_lh_correlation, mc_estimator_variance, mf_raw_moments, Correlations,
};
use crate::core::{average, count, one_sided_delta, sequenced, ModelEnsemble, QoiMatrix, Real};
use crate::error::{Error, Result, Warning};
use crate::report::{Checkpoint, MfmcReport};
use crate::solvers::numerical::{CompassSearch, RatioOptimizer};
use crate::solvers::{est_var_ratios, mfmc_eval_ratios, EvalRatios, RatioInputs};

/// Runs the MFMC sample allocation for `ensemble` as set up by `config`, solving unordered model
/// sequences with the default [`CompassSearch`]. After each shared sample increment `callback`
/// is called with all checkpoints so far.
pub fn sample<T, E, C>(
    ensemble: &mut E,
    config: &MfmcConfig<T>,
    callback: &C,
) -> Result<MfmcReport<T>>
where
    T: Real,
    E: ModelEnsemble<T> + ?Sized,
    C: Callback<T>,
{
    sample_with_optimizer(ensemble, config, &CompassSearch::default(), callback)
}

/// Same as [`sample`], but solving unordered model sequences with `optimizer`.
pub fn sample_with_optimizer<T, E, O, C>(
    ensemble: &mut E,
    config: &MfmcConfig<T>,
    optimizer: &O,
    callback: &C,
) -> Result<MfmcReport<T>>
where
    T: Real,
    E: ModelEnsemble<T> + ?Sized,
    O: RatioOptimizer<T>,
    C: Callback<T>,
{
    let sampler = MfmcSampler::new(ensemble, config, optimizer, callback)?;

    match config.pilot_mode {
        PilotMode::Online => sampler.online_pilot(),
        PilotMode::Offline => sampler.offline_pilot(),
        PilotMode::Projection => sampler.pilot_projection(),
    }
}

/// The state of a single allocation run.
struct MfmcSampler<'a, T, E: ?Sized> {
    ensemble: &'a mut E,
    config: &'a MfmcConfig<T>,
    optimizer: &'a dyn RatioOptimizer<T>,
    callback: &'a dyn Callback<T>,
    target: Target<T>,
    costs: Vec<T>,
    num_approx: usize,
    num_functions: usize,
    iteration: usize,
    equivalent_hf_evals: T,
    checkpoints: Vec<Checkpoint<T>>,
    warnings: Vec<Warning>,
}

/// What a single iteration has estimated.
struct Allocation<T> {
    correlations: Correlations<T>,
    ratios: EvalRatios<T>,
    est_var_ratios: Vec<T>,
}

impl<'a, T, E> MfmcSampler<'a, T, E>
where
    T: Real,
    E: ModelEnsemble<T> + ?Sized,
{
    fn new(
        ensemble: &'a mut E,
        config: &'a MfmcConfig<T>,
        optimizer: &'a dyn RatioOptimizer<T>,
        callback: &'a dyn Callback<T>,
    ) -> Result<Self> {
        let target = config.target()?;
        let num_approx = ensemble.num_approx();
        let num_functions = ensemble.num_functions();

        if num_approx == 0 || num_functions == 0 {
            return Err(Error::InvalidConfig(format!(
                "ensemble needs at least one low-fidelity model and one QoI, got {} and {}",
                num_approx, num_functions
            )));
        }

        let costs = ensemble.costs();
        let invalid = costs
            .iter()
            .filter(|c| !(c.is_finite() && **c > T::zero()))
            .count();

        if costs.len() != num_approx + 1 || invalid != 0 {
            return Err(Error::InvalidCosts {
                expected: num_approx + 1,
                found: costs.len(),
                invalid,
            });
        }

        Ok(Self {
            ensemble,
            config,
            optimizer,
            callback,
            target,
            costs,
            num_approx,
            num_functions,
            iteration: 0,
            equivalent_hf_evals: T::zero(),
            checkpoints: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Iterates shared sample increments, starting with the pilot, until the high-fidelity
    /// targets are met, then refines the low-fidelity models and estimates the moments.
    fn online_pilot(mut self) -> Result<MfmcReport<T>> {
        let mut sums = MomentSums::new(self.num_approx, self.num_functions);
        let mut num_samples = self.config.pilot_samples;
        let mut est_var_iter0 = None;
        let mut num_h_iter0 = None;
        let mut allocation: Option<Allocation<T>> = None;

        while num_samples > 0 && self.iteration <= self.config.max_iterations {
            self.shared_increment(&mut sums, num_samples, true)?;

            let correlations = compute_lh_correlation(&sums)?;

            // the control variate terms cancel before any refinement, so that the initial
            // estimator variance is the one of the high-fidelity pilot
            if self.iteration == 0 {
                est_var_iter0 = Some(mc_estimator_variance(
                    correlations.var_h(),
                    sums.n_shared(),
                ));
                num_h_iter0 = Some(sums.n_shared().to_vec());
            }

            let next = self.allocate(
                correlations,
                sums.n_shared(),
                est_var_iter0.as_deref(),
                allocation.as_ref(),
            )?;
            let previous = num_samples;
            num_samples = one_sided_delta(sums.n_shared(), &next.ratios.hf_targets, 1);

            self.checkpoint(previous, sums.n_shared(), &next, num_samples);
            allocation = Some(next);
            self.iteration += 1;
        }

        if num_samples > 0 {
            let warning = Warning::MaxIterations {
                iterations: self.iteration,
                remaining_samples: num_samples,
            };
            log::warn!("{}", warning);
            self.warnings.push(warning);
        }

        let allocation = allocation.ok_or_else(|| {
            Error::InvalidConfig("no shared increment was evaluated".to_string())
        })?;

        self.finalize(sums, allocation, est_var_iter0, num_h_iter0)
    }

    /// Estimates the correlations from a pilot that is not charged, then draws a single online
    /// shared increment for the frozen allocation.
    fn offline_pilot(mut self) -> Result<MfmcReport<T>> {
        let mut pilot = PilotSums::new(self.num_approx, self.num_functions);
        self.shared_increment(&mut pilot, self.config.pilot_samples, false)?;

        let correlations = compute_lh_correlation(&pilot)?;
        let mut allocation = self.allocate(correlations, pilot.n_shared(), None, None)?;
        self.checkpoint(self.config.pilot_samples, pilot.n_shared(), &allocation, 0);

        // the pilot is not reused, at least two samples are needed for the variances
        let mut sums = MomentSums::new(self.num_approx, self.num_functions);
        let zeros = vec![0; self.num_functions];
        let num_samples = one_sided_delta(&zeros, &allocation.ratios.hf_targets, 1).max(2);

        self.iteration += 1;
        self.shared_increment(&mut sums, num_samples, true)?;

        // the pilot variances are kept, but the pilot samples do not count towards R^2
        allocation.est_var_ratios = est_var_ratios(
            &allocation.ratios.rho2,
            &allocation.ratios.solution,
            &allocation.ratios.hf_targets,
            sums.n_shared(),
        );
        self.checkpoint(num_samples, sums.n_shared(), &allocation, 0);
        self.iteration += 1;

        self.finalize(sums, allocation, None, None)
    }

    /// Evaluates only the pilot and projects the sample profile and the variance reduction of the
    /// optimal allocation.
    fn pilot_projection(mut self) -> Result<MfmcReport<T>> {
        let mut pilot = PilotSums::new(self.num_approx, self.num_functions);
        self.shared_increment(&mut pilot, self.config.pilot_samples, true)?;

        let correlations = compute_lh_correlation(&pilot)?;
        let est_var_iter0 = mc_estimator_variance(correlations.var_h(), pilot.n_shared());
        let num_h_iter0 = pilot.n_shared().to_vec();
        let mut allocation =
            self.allocate(correlations, pilot.n_shared(), Some(&est_var_iter0), None)?;

        let hf_targets = &allocation.ratios.hf_targets;
        let eval_ratios = allocation.ratios.solution.eval_ratios();
        let delta = one_sided_delta(&num_h_iter0, hf_targets, 1);
        let num_h: Vec<_> = num_h_iter0.iter().map(|&n| n + delta).collect();
        let n_l: Vec<Vec<_>> = (0..self.num_approx)
            .map(|approx| {
                let targets = lf_targets(eval_ratios, hf_targets, approx);
                let delta = one_sided_delta(&num_h_iter0, &targets, 1);
                num_h_iter0.iter().map(|&n| n + delta).collect()
            })
            .collect();

        allocation.est_var_ratios = est_var_ratios(
            &allocation.ratios.rho2,
            &allocation.ratios.solution,
            hf_targets,
            &num_h,
        );
        self.checkpoint(self.config.pilot_samples, &num_h_iter0, &allocation, 0);
        self.iteration += 1;

        log::info!(
            "projected sample profile: N_H = {:?}, N_L = {:?}",
            num_h,
            n_l
        );

        Ok(MfmcReport {
            pilot_mode: self.config.pilot_mode,
            iterations: self.iteration,
            equivalent_hf_evals: self.equivalent_hf_evals,
            est_var_iter0: Some(est_var_iter0),
            num_h_iter0: Some(num_h_iter0.clone()),
            num_h,
            n_shared: num_h_iter0,
            var_h: allocation.correlations.var_h().to_vec(),
            rho2: allocation.ratios.rho2,
            hf_targets: allocation.ratios.hf_targets,
            est_var_ratios: allocation.est_var_ratios,
            solution: allocation.ratios.solution,
            n_l,
            raw_moments: None,
            warnings: self.warnings,
        })
    }

    /// Draws `samples` shared samples on all models and accumulates them into `sums`.
    fn shared_increment<const M: usize>(
        &mut self,
        sums: &mut PowerSums<T, M>,
        samples: usize,
        charge: bool,
    ) -> Result<()> {
        log::debug!(
            "iteration {}: shared increment of {} samples",
            self.iteration,
            samples
        );

        let batch = self.ensemble.shared_increment(self.iteration, samples);
        sums.accumulate(&batch)?;

        if charge {
            let models: Vec<_> = (0..=self.num_approx).collect();
            self.increment_equivalent_cost(batch.len(), &models);
        }

        Ok(())
    }

    /// Adds the cost of `samples` evaluations of each of `models` to the ledger.
    fn increment_equivalent_cost(&mut self, samples: usize, models: &[usize]) {
        let cost_h = self.costs[self.num_approx];
        let cost = models
            .iter()
            .fold(T::zero(), |acc, &model| acc + self.costs[model]);

        self.equivalent_hf_evals += count::<T>(samples) * cost / cost_h;
    }

    /// Computes evaluation ratios, targets and estimator variance ratios from `correlations`.
    fn allocate(
        &mut self,
        correlations: Correlations<T>,
        n_h: &[usize],
        est_var_iter0: Option<&[T]>,
        previous: Option<&Allocation<T>>,
    ) -> Result<Allocation<T>> {
        let inputs = RatioInputs {
            correlations: &correlations,
            costs: &self.costs,
            target: self.target,
            n_h,
            equivalent_hf_evals: self.equivalent_hf_evals,
            est_var_iter0,
            previous: previous.map(|allocation| &allocation.ratios.solution),
            prefer_reordered: self.config.prefer_reordered_analytic,
            tolerances: &self.config.tolerances,
        };
        let ratios = mfmc_eval_ratios(&inputs, self.optimizer)?;
        let est_var_ratios =
            est_var_ratios(&ratios.rho2, &ratios.solution, &ratios.hf_targets, n_h);

        for qoi in 0..self.num_functions {
            log::debug!(
                "QoI {}: variance reduction factor = {:?}",
                qoi,
                est_var_ratios[qoi]
            );
        }

        // only the degeneracies of the latest correlation estimate are reported
        self.warnings
            .retain(|warning| matches!(warning, Warning::MaxIterations { .. }));
        self.warnings.extend(ratios.warnings.iter().cloned());

        Ok(Allocation {
            correlations,
            ratios,
            est_var_ratios,
        })
    }

    fn checkpoint(
        &mut self,
        samples: usize,
        n_h: &[usize],
        allocation: &Allocation<T>,
        next_samples: usize,
    ) {
        self.checkpoints.push(Checkpoint::new(
            self.iteration,
            samples,
            n_h.to_vec(),
            self.equivalent_hf_evals,
            allocation.correlations.var_h().to_vec(),
            allocation.ratios.rho2.clone(),
            allocation.ratios.solution.clone(),
            allocation.ratios.hf_targets.clone(),
            allocation.est_var_ratios.clone(),
            next_samples,
        ));
        self.callback.print(&self.checkpoints);
    }

    /// Runs the pyramid of approximation increments and estimates the raw moments.
    fn finalize(
        mut self,
        sums: MomentSums<T>,
        allocation: Allocation<T>,
        est_var_iter0: Option<Vec<T>>,
        num_h_iter0: Option<Vec<usize>>,
    ) -> Result<MfmcReport<T>> {
        let refined = self.approx_increments(&sums, &allocation)?;
        let raw_moments = mf_raw_moments(&sums, &refined)?;

        log::info!(
            "finished after {} iterations with {:?} equivalent HF evaluations",
            self.iteration,
            self.equivalent_hf_evals
        );

        Ok(MfmcReport {
            pilot_mode: self.config.pilot_mode,
            iterations: self.iteration,
            equivalent_hf_evals: self.equivalent_hf_evals,
            est_var_iter0,
            num_h_iter0,
            num_h: sums.n_shared().to_vec(),
            n_shared: sums.n_shared().to_vec(),
            var_h: allocation.correlations.var_h().to_vec(),
            rho2: allocation.ratios.rho2,
            hf_targets: allocation.ratios.hf_targets,
            est_var_ratios: allocation.est_var_ratios,
            solution: allocation.ratios.solution,
            n_l: refined.refined_counts().to_vec(),
            raw_moments: Some(raw_moments),
            warnings: self.warnings,
        })
    }

    /// Draws low-fidelity samples for the nested model ranges `[0, end)` of the sequence, from the
    /// full range down to the least correlated model alone.
    fn approx_increments(
        &mut self,
        sums: &MomentSums<T>,
        allocation: &Allocation<T>,
    ) -> Result<RefinedSums<T>> {
        let mut refined = RefinedSums::from_baseline(sums);
        let mut drawn = 0;

        for end in (1..=self.num_approx).rev() {
            if self.approx_increment(&mut refined, allocation, 0, end)? {
                drawn += 1;
            }
        }

        log::debug!(
            "{} of {} nested approximation increments drew samples",
            drawn,
            self.num_approx
        );

        Ok(refined)
    }

    /// Draws the samples of the range `[start, end)` of the sequence. Their number is determined
    /// by the target of the last model in the range. Returns whether samples were drawn.
    fn approx_increment(
        &mut self,
        refined: &mut RefinedSums<T>,
        allocation: &Allocation<T>,
        start: usize,
        end: usize,
    ) -> Result<bool> {
        let solution = &allocation.ratios.solution;
        let sequence = solution.sequence();
        let approx = sequenced(sequence, end - 1);
        let targets = lf_targets(
            solution.eval_ratios(),
            &allocation.ratios.hf_targets,
            approx,
        );
        let samples = one_sided_delta(refined.n_l_refined(approx), &targets, 1);

        log::debug!(
            "approx {}: average LF target = {:?}, current counts = {:?}, increment = {}",
            approx,
            average(&targets),
            refined.n_l_refined(approx),
            samples
        );

        if samples == 0 {
            return Ok(false);
        }

        let models: Vec<_> = (start..end).map(|s| sequenced(sequence, s)).collect();
        let batch = self
            .ensemble
            .approx_increment(self.iteration, &models, samples);

        refined.accumulate(&batch, sequence, start, end)?;
        self.increment_equivalent_cost(batch.len(), &models);

        Ok(!batch.is_empty())
    }
}

/// Low-fidelity sample targets $r_a N_H^*$ of model `approx` per QoI.
fn lf_targets<T: Real>(eval_ratios: &QoiMatrix<T>, hf_targets: &[T], approx: usize) -> Vec<T> {
    hf_targets
        .iter()
        .enumerate()
        .map(|(qoi, &target)| eval_ratios[(qoi, approx)] * target)
        .collect()
}
