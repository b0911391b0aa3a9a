//! Per-run logging handle.
//!
//! Training code never reaches for a global logger: the harness creates a
//! [`RunLog`] for the experiment and hands each seed its own copy through
//! [`RunLog::for_seed`]. Events are emitted through `tracing`; installing a
//! subscriber is left to programs ([`init_tracing`]).

use crate::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging context of one experiment run (and optionally one seed)
#[derive(Debug, Clone, PartialEq)]
pub struct RunLog {
    title: String,
    log_every: usize,
    seed: Option<u64>,
}

impl RunLog {
    pub fn new(title: impl Into<String>, log_every: usize) -> Self {
        Self {
            title: title.into(),
            log_every,
            seed: None,
        }
    }

    pub fn for_seed(&self, seed: u64) -> Self {
        Self {
            title: self.title.clone(),
            log_every: self.log_every,
            seed: Some(seed),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Whether iteration `i` falls on the logging cadence
    pub fn should_log(&self, i: usize) -> bool {
        self.log_every > 0 && i % self.log_every == 0
    }

    pub fn experiment_started(&self, num_seeds: usize, parallel: bool) {
        tracing::info!(title = %self.title, num_seeds, parallel, "starting experiment");
    }

    pub fn seed_started(&self, iterations: usize, theta: &[f64]) {
        tracing::info!(
            title = %self.title,
            seed = ?self.seed,
            iterations,
            theta = ?theta,
            "starting training"
        );
    }

    /// Evaluation summary, emitted on the `log_every` cadence
    #[allow(clippy::too_many_arguments)]
    pub fn evaluation(
        &self,
        i: usize,
        n: usize,
        avg_return: f64,
        running_avg: f64,
        ci_half_width: f64,
        avg_length: f64,
        thresholds: &[f64],
    ) {
        if !self.should_log(i) {
            return;
        }
        tracing::info!(
            title = %self.title,
            seed = ?self.seed,
            "[T-SPSA] i: {}/{}, J: {:.3}, J_avg: {:.3} +- {:.3}, T_avg: {:.2}, thresholds: {:?}",
            i,
            n,
            avg_return,
            running_avg,
            ci_half_width,
            avg_length,
            thresholds
        );
    }

    pub fn gradient_step(&self, i: usize, ak: f64, ck: f64, gradient: &[f64]) {
        tracing::debug!(
            title = %self.title,
            seed = ?self.seed,
            i,
            ak,
            ck,
            gradient = ?gradient,
            "gradient step"
        );
    }

    pub fn checkpoint(&self, i: usize, key: &str) {
        tracing::info!(title = %self.title, seed = ?self.seed, i, key, "saved checkpoint");
    }

    pub fn seed_finished(&self, avg_return: f64) {
        tracing::info!(title = %self.title, seed = ?self.seed, avg_return, "training finished");
    }

    pub fn seed_failed(&self, err: &Error) {
        tracing::warn!(
            title = %self.title,
            seed = ?self.seed,
            kind = err.kind(),
            error = %err,
            "training aborted"
        );
    }

    pub fn experiment_finished(&self, completed: usize, failed: usize) {
        tracing::info!(title = %self.title, completed, failed, "experiment finished");
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`.
///
/// Returns `false` when a global subscriber was already set; that subscriber
/// is kept and receives the events of this crate.
pub fn init_tracing(default_directive: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
    match installed {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "keeping the existing tracing subscriber");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_seed_keeps_title() {
        let log = RunLog::new("T-SPSA test", 5);
        let seeded = log.for_seed(399);
        assert_eq!(seeded.title(), "T-SPSA test");
        assert_eq!(seeded.seed(), Some(399));
        assert_eq!(log.seed(), None);
    }

    #[test]
    fn test_cadence() {
        let log = RunLog::new("t", 5);
        assert!(log.should_log(0));
        assert!(!log.should_log(3));
        assert!(log.should_log(10));
        assert!(!RunLog::new("quiet", 0).should_log(0));
    }

    #[test]
    fn test_init_tracing_twice_keeps_first_subscriber() {
        init_tracing("warn");
        assert!(!init_tracing("debug"));
    }
}
