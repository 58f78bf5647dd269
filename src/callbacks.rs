//! Implementation of different callback functions.
use crate::core::{average, average_count, Real};
use crate::report::Checkpoint;
use serde::Serialize;
use std::fmt::Display;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

/// Trait for implementing callbacks for the iterative sample allocation
pub trait Callback<T> {
    /// This method is called after each shared sample increment and may print information about
    /// it.
    fn print(&self, chkpts: &[Checkpoint<T>]);
}

/// A callback function that does nothing
pub struct SinkCallback {}

impl<T> Callback<T> for SinkCallback {
    fn print(&self, _: &[Checkpoint<T>]) {}
}

/// A callback function that prints the result of each individual iteration
pub struct SimpleCallback {}

impl<T> Callback<T> for SimpleCallback
where
    T: Display + Real,
{
    fn print(&self, chkpts: &[Checkpoint<T>]) {
        // Make sure that there is at least one checkpoint
        // otherwise do nothing.
        if let Some(chkpt) = chkpts.last() {
            println!("iteration {} finished.", chkpt.iteration());
            println!(
                "this iteration: N_H={} target={} (1 - R^2)={} cost={} next={}",
                average_count::<T>(chkpt.n_h()),
                average(chkpt.hf_targets()),
                average(chkpt.est_var_ratios()),
                chkpt.equivalent_hf_evals(),
                chkpt.next_samples()
            );
        }
    }
}

/// A callback that writes all checkpoints as JSON to a file, overwriting it after every
/// iteration.
pub struct FileWriterCallback {
    path: PathBuf,
}

impl FileWriterCallback {
    /// Writes the checkpoints to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl<T> Callback<T> for FileWriterCallback
where
    T: Serialize,
{
    fn print(&self, chkpts: &[Checkpoint<T>]) {
        let result = File::create(&self.path)
            .map_err(serde_json::Error::io)
            .and_then(|file| serde_json::to_writer_pretty(BufWriter::new(file), chkpts));

        if let Err(err) = result {
            log::error!(
                "could not write checkpoints to {}: {}",
                self.path.display(),
                err
            );
        }
    }
}
