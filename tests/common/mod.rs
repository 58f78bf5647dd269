#![allow(dead_code)]

use mfmc::ModelEnsemble;
use rand::Rng;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

pub fn rng() -> Pcg64 {
    Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
}

/// Returns the noise level `b` for which `Z + b * eps` has the squared correlation `rho2` with
/// `Z`.
pub fn noise_for(rho2: f64) -> f64 {
    (1.0 / rho2 - 1.0).sqrt()
}

/// A hierarchy of jointly Gaussian models. QoI `q` of the high-fidelity model is
/// `means[q] + scales[q] * Z`, low-fidelity model `i` returns `means[q] + scales[q] * (Z + b_i *
/// eps)` with independent standard normal `Z` and `eps`.
pub struct GaussianEnsemble {
    rng: Pcg64,
    noise: Vec<f64>,
    costs: Vec<f64>,
    means: Vec<f64>,
    scales: Vec<f64>,
    /// Number of evaluations of each model, the high-fidelity model last.
    pub evaluations: Vec<usize>,
    /// Sizes of the shared increments.
    pub shared_calls: Vec<usize>,
    /// Models and sizes of the low-fidelity increments.
    pub approx_calls: Vec<(Vec<usize>, usize)>,
}

impl GaussianEnsemble {
    pub fn new(rho2: &[f64], costs: &[f64], means: &[f64], scales: &[f64]) -> Self {
        assert_eq!(means.len(), scales.len());

        Self {
            rng: rng(),
            noise: rho2.iter().map(|&r| noise_for(r)).collect(),
            costs: costs.to_vec(),
            means: means.to_vec(),
            scales: scales.to_vec(),
            evaluations: vec![0; rho2.len() + 1],
            shared_calls: Vec::new(),
            approx_calls: Vec::new(),
        }
    }

    /// Two low-fidelity models ordered by correlation and two QoI.
    pub fn ordered() -> Self {
        Self::new(&[0.4, 0.8], &[1.0, 5.0, 100.0], &[1.0, -2.0], &[2.0, 0.5])
    }

    /// The equivalent high-fidelity cost of all evaluations so far.
    pub fn equivalent_hf_evals(&self) -> f64 {
        let cost_h = self.costs[self.noise.len()];

        self.evaluations
            .iter()
            .zip(&self.costs)
            .map(|(&n, &cost)| n as f64 * cost / cost_h)
            .sum()
    }

    fn response(&mut self, models: &[usize], high_fidelity: bool) -> Vec<f64> {
        let nf = self.means.len();
        let na = self.noise.len();
        let mut response = vec![f64::NAN; (na + 1) * nf];

        for qoi in 0..nf {
            let z: f64 = self.rng.sample(StandardNormal);

            for &model in models {
                let eps: f64 = self.rng.sample(StandardNormal);
                response[model * nf + qoi] =
                    self.means[qoi] + self.scales[qoi] * (z + self.noise[model] * eps);
            }

            if high_fidelity {
                response[na * nf + qoi] = self.means[qoi] + self.scales[qoi] * z;
            }
        }

        response
    }
}

impl ModelEnsemble<f64> for GaussianEnsemble {
    fn num_approx(&self) -> usize {
        self.noise.len()
    }

    fn num_functions(&self) -> usize {
        self.means.len()
    }

    fn costs(&self) -> Vec<f64> {
        self.costs.clone()
    }

    fn shared_increment(&mut self, _: usize, samples: usize) -> Vec<Vec<f64>> {
        let models: Vec<_> = (0..self.noise.len()).collect();

        self.shared_calls.push(samples);
        for n in &mut self.evaluations {
            *n += samples;
        }

        (0..samples).map(|_| self.response(&models, true)).collect()
    }

    fn approx_increment(&mut self, _: usize, models: &[usize], samples: usize) -> Vec<Vec<f64>> {
        self.approx_calls.push((models.to_vec(), samples));
        for &model in models {
            self.evaluations[model] += samples;
        }

        (0..samples).map(|_| self.response(models, false)).collect()
    }
}

/// Wraps an ensemble and replaces the value of `model` at `qoi` in every `period`-th response
/// with `NaN`.
pub struct FaultyEnsemble<E> {
    pub inner: E,
    model: usize,
    qoi: usize,
    period: usize,
    counter: usize,
    /// Number of values that were replaced.
    pub failures: usize,
}

impl<E: ModelEnsemble<f64>> FaultyEnsemble<E> {
    pub fn new(inner: E, model: usize, qoi: usize, period: usize) -> Self {
        Self {
            inner,
            model,
            qoi,
            period,
            counter: 0,
            failures: 0,
        }
    }

    fn inject(&mut self, mut batch: Vec<Vec<f64>>, models: &[usize]) -> Vec<Vec<f64>> {
        if !models.contains(&self.model) {
            return batch;
        }

        let index = self.model * self.inner.num_functions() + self.qoi;

        for response in &mut batch {
            self.counter += 1;

            if self.counter % self.period == 0 {
                response[index] = f64::NAN;
                self.failures += 1;
            }
        }

        batch
    }
}

impl<E: ModelEnsemble<f64>> ModelEnsemble<f64> for FaultyEnsemble<E> {
    fn num_approx(&self) -> usize {
        self.inner.num_approx()
    }

    fn num_functions(&self) -> usize {
        self.inner.num_functions()
    }

    fn costs(&self) -> Vec<f64> {
        self.inner.costs()
    }

    fn shared_increment(&mut self, iteration: usize, samples: usize) -> Vec<Vec<f64>> {
        let batch = self.inner.shared_increment(iteration, samples);
        let models: Vec<_> = (0..=self.inner.num_approx()).collect();

        self.inject(batch, &models)
    }

    fn approx_increment(
        &mut self,
        iteration: usize,
        models: &[usize],
        samples: usize,
    ) -> Vec<Vec<f64>> {
        let batch = self.inner.approx_increment(iteration, models, samples);

        self.inject(batch, models)
    }
}

/// An ensemble returning responses that are one value too short.
pub struct TruncatedEnsemble;

impl ModelEnsemble<f64> for TruncatedEnsemble {
    fn num_approx(&self) -> usize {
        1
    }

    fn num_functions(&self) -> usize {
        1
    }

    fn costs(&self) -> Vec<f64> {
        vec![1.0, 10.0]
    }

    fn shared_increment(&mut self, _: usize, samples: usize) -> Vec<Vec<f64>> {
        vec![vec![1.0]; samples]
    }

    fn approx_increment(&mut self, _: usize, _: &[usize], samples: usize) -> Vec<Vec<f64>> {
        vec![vec![1.0]; samples]
    }
}

/// A standard normal high-fidelity model with low-fidelity models that always return the same
/// value, i.e. carry no information about it.
pub struct ConstantApproximations {
    rng: Pcg64,
    num_approx: usize,
    /// Sizes of the low-fidelity increments.
    pub approx_calls: Vec<usize>,
}

impl ConstantApproximations {
    pub fn new(num_approx: usize) -> Self {
        Self {
            rng: rng(),
            num_approx,
            approx_calls: Vec::new(),
        }
    }

    fn response(&mut self) -> Vec<f64> {
        let mut response = vec![1.0; self.num_approx + 1];
        response[self.num_approx] = self.rng.sample(StandardNormal);
        response
    }
}

impl ModelEnsemble<f64> for ConstantApproximations {
    fn num_approx(&self) -> usize {
        self.num_approx
    }

    fn num_functions(&self) -> usize {
        1
    }

    fn costs(&self) -> Vec<f64> {
        let mut costs: Vec<_> = (1..=self.num_approx).map(|m| m as f64).collect();
        costs.push(100.0);
        costs
    }

    fn shared_increment(&mut self, _: usize, samples: usize) -> Vec<Vec<f64>> {
        (0..samples).map(|_| self.response()).collect()
    }

    fn approx_increment(&mut self, _: usize, _: &[usize], samples: usize) -> Vec<Vec<f64>> {
        self.approx_calls.push(samples);
        (0..samples).map(|_| self.response()).collect()
    }
}
