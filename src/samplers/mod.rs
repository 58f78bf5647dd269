//! Sample-allocation drivers.
pub mod mfmc;
