use mfmc::callbacks::SimpleCallback;
use mfmc::{sample, MfmcConfig, ModelEnsemble, PilotMode};

use rand::Rng;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

/// A damped oscillator `exp(-d t) cos(w t)` with random damping and frequency, evaluated at two
/// times. The low-fidelity models truncate the Taylor series of the exponential.
struct Oscillator {
    rng: Pcg64,
}

impl Oscillator {
    const TIMES: [f64; 2] = [0.5, 1.0];
    const TERMS: [usize; 2] = [2, 4];

    fn exp_taylor(x: f64, terms: usize) -> f64 {
        (1..terms)
            .fold((1.0, 1.0), |(sum, term), k| {
                let term = term * x / k as f64;
                (sum + term, term)
            })
            .0
    }

    fn response(&mut self, models: &[usize], high_fidelity: bool) -> Vec<f64> {
        let damping = 1.0 + 0.2 * self.rng.sample::<f64, _>(StandardNormal);
        let frequency = 3.0 + 0.5 * self.rng.sample::<f64, _>(StandardNormal);
        let nf = Self::TIMES.len();
        let mut response = vec![f64::NAN; (Self::TERMS.len() + 1) * nf];

        for (qoi, &t) in Self::TIMES.iter().enumerate() {
            let oscillation = (frequency * t).cos();

            for &model in models {
                response[model * nf + qoi] =
                    Self::exp_taylor(-damping * t, Self::TERMS[model]) * oscillation;
            }

            if high_fidelity {
                response[Self::TERMS.len() * nf + qoi] = (-damping * t).exp() * oscillation;
            }
        }

        response
    }
}

impl ModelEnsemble<f64> for Oscillator {
    fn num_approx(&self) -> usize {
        Self::TERMS.len()
    }

    fn num_functions(&self) -> usize {
        Self::TIMES.len()
    }

    fn costs(&self) -> Vec<f64> {
        vec![1.0, 4.0, 200.0]
    }

    fn shared_increment(&mut self, _: usize, samples: usize) -> Vec<Vec<f64>> {
        (0..samples).map(|_| self.response(&[0, 1], true)).collect()
    }

    fn approx_increment(&mut self, _: usize, models: &[usize], samples: usize) -> Vec<Vec<f64>> {
        (0..samples).map(|_| self.response(models, false)).collect()
    }
}

fn main() {
    env_logger::init();

    for pilot_mode in [PilotMode::Online, PilotMode::Offline, PilotMode::Projection] {
        // Initialize the random number generator.
        let rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96);
        let mut ensemble = Oscillator { rng };
        let config = MfmcConfig {
            pilot_mode,
            ..MfmcConfig::with_budget(50, 500.0)
        };

        match sample(&mut ensemble, &config, &SimpleCallback {}) {
            Ok(report) => {
                println!("{:?} pilot, {:?} ratios", pilot_mode, report.form());
                println!("{}", report.variance_reduction());

                for warning in &report.warnings {
                    println!("warning: {}", warning);
                }
                if let Some(moments) = &report.raw_moments {
                    for (qoi, m) in moments.iter().enumerate() {
                        println!("QoI {}: mean = {:.6}, E[H^2] = {:.6}", qoi, m[0], m[1]);
                    }
                }
            }
            Err(err) => eprintln!("{:?} pilot failed: {}", pilot_mode, err),
        }
    }
}
