#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! The crate `mfmc` implements [Multifidelity Monte Carlo] (MFMC) sample allocation: given a
//! hierarchy of models of differing cost and fidelity, it decides how many evaluations to draw
//! from each of them so that the variance of the estimated mean, or a higher raw moment, of a
//! high-fidelity quantity is minimized under a fixed computational budget or accuracy target.
//!
//! # Features
//!
//! - **Generic numeric type**. The numeric type is a generic parameter, so that the sampler can
//! be used with either `f32`, `f64`, or a custom numeric type that implements the `Float` trait
//! from the `num-traits` crate.
//! - **Generic model layer**. Every type implementing [`ModelEnsemble`] can be sampled. The
//! sampler only decides how many samples are evaluated on which models; how they are evaluated
//! is up to the caller.
//! - **Non-finite number filtering**. Simulations fail. A non-finite response marks a failed
//! evaluation, which is excluded from the estimators of the affected quantity of interest
//! without discarding the remaining quantities of the same sample.
//! - **Three pilot strategies**. The pilot sample either starts an iterated refinement of the
//! high-fidelity sample count, estimates correlations offline, or is used to project the
//! variance reduction without drawing further samples. See [`PilotMode`].
//! - **Checkpoints**. After every shared sample increment a [`Checkpoint`] is passed to a
//! [`Callback`](callbacks::Callback), which can print it or write it to disk.
//!
//! # What is ...?
//!
//! This section is a dictionary of terms that are used in this documentation. Given a
//! high-fidelity model $H$ and low-fidelity models $L_0, \ldots, L_{K-1}$ with costs $c_H$ and
//! $c_i$, the MFMC estimator of $E[H]$ is
//!
//! $$ \hat{H} = \bar{H}^{(N_H)} + \sum_{i=0}^{K-1} \beta_i \left( \bar{L}_i^{(N_{L_i})} -
//! \bar{L}_i^{(N_{L_i}^\mathrm{shared})} \right) $$
//!
//! where the bars denote sample means over the given number of samples. We use the following
//! terms:
//!
//! - a *QoI* (quantity of interest) is one of the scalar responses of a model, all models return
//! the same number of them,
//! - *shared samples* are evaluated on all models, their number is $N_H$,
//! - the *evaluation ratio* of model $i$ is $r_i = N_{L_i} / N_H$,
//! - the *approximation sequence* orders the low-fidelity models from the least to the most
//! correlated one; it is empty if the nominal order already is such a sequence,
//! - the *pyramid* is the nested pattern of low-fidelity increments drawn after the
//! high-fidelity count converged: less correlated models get at least as many samples as more
//! correlated ones,
//! - *equivalent high-fidelity evaluations* measure costs in units of $c_H$,
//! - $R^2$ is the fraction of the Monte Carlo estimator variance removed by the control
//! variates, so that the MFMC estimator has the variance $(1 - R^2) V_H / N_H$.
//!
//! [Multifidelity Monte Carlo]: https://doi.org/10.1137/15M1046472

pub mod callbacks;
pub mod config;
pub mod core;
pub mod error;
pub mod report;
pub mod samplers;
pub mod solvers;

pub use crate::config::{MfmcConfig, PilotMode, Target, Tolerances};
pub use crate::core::*;
pub use crate::error::{Error, Result, Warning};
pub use crate::report::{Checkpoint, MfmcReport, VarianceReduction};
pub use crate::samplers::mfmc::{sample, sample_with_optimizer};
