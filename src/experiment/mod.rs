//! Experiment configuration, results and the training harness.
//!
//! [`run_experiment`] validates an [`ExperimentConfig`], trains one policy per
//! random seed with T-SPSA and persists the resulting [`ExperimentExecution`].
//! Seeds are independent: a failing seed is recorded as [`SeedStatus::Failed`]
//! and the remaining seeds carry on.

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::game::{AgentType, PlayerType};
use crate::logging::RunLog;
use crate::metastore::Metastore;
use crate::optimizer::{TSpsaAgent, TSpsaParams};
use crate::policy::MultiThresholdStoppingPolicy;
use crate::stats::{mean, mean_confidence_interval};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Hyper-parameter names
pub mod keys {
    pub const N: &str = "N";
    pub const C: &str = "c";
    pub const A_STEP: &str = "a";
    pub const A_STABILITY: &str = "A";
    pub const LAMBDA: &str = "lambda";
    pub const EPSILON: &str = "epsilon";
    pub const L: &str = "L";
    pub const THETA1: &str = "theta1";
    pub const GRADIENT_BATCH_SIZE: &str = "gradient_batch_size";
    pub const EVAL_BATCH_SIZE: &str = "eval_batch_size";
    pub const EVAL_EVERY: &str = "eval_every";
    pub const SAVE_EVERY: &str = "save_every";
    pub const CONFIDENCE_INTERVAL: &str = "confidence_interval";
    pub const MAX_ENV_STEPS: &str = "max_env_steps";
    pub const RUNNING_AVERAGE: &str = "running_average";
    pub const GAMMA: &str = "gamma";
}

/// Names of the aggregated per-evaluation metrics
pub mod metrics {
    pub const AVERAGE_RETURN: &str = "average_return";
    pub const RUNNING_AVERAGE_RETURN: &str = "running_average_return";
    pub const AVERAGE_EPISODE_LENGTH: &str = "average_episode_length";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Vector(Vec<f64>),
}

impl HParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HParamValue::Int(i) => Some(*i as f64),
            HParamValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Non-negative integers, also when written as an integral float
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            HParamValue::Int(i) => usize::try_from(*i).ok(),
            HParamValue::Float(x) if *x >= 0.0 && x.fract() == 0.0 => Some(*x as usize),
            _ => None,
        }
    }

    pub fn as_vec(&self) -> Option<&[f64]> {
        match self {
            HParamValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for HParamValue {
    fn from(i: i64) -> Self {
        HParamValue::Int(i)
    }
}

impl From<f64> for HParamValue {
    fn from(x: f64) -> Self {
        HParamValue::Float(x)
    }
}

impl From<Vec<f64>> for HParamValue {
    fn from(v: Vec<f64>) -> Self {
        HParamValue::Vector(v)
    }
}

/// A named configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HParam {
    pub name: String,
    pub value: HParamValue,
    pub descr: String,
}

/// Definition of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub output_dir: String,
    pub title: String,
    pub random_seeds: Vec<u64>,
    pub agent_type: AgentType,
    pub hparams: BTreeMap<String, HParam>,
    pub log_every: usize,
    pub player_type: PlayerType,
    pub player_idx: usize,
    /// Train seeds on the rayon pool instead of one after another
    #[serde(default)]
    pub parallel_seeds: bool,
}

impl ExperimentConfig {
    pub fn new(
        title: impl Into<String>,
        output_dir: impl Into<String>,
        random_seeds: Vec<u64>,
        player_type: PlayerType,
    ) -> Self {
        let player_idx = match player_type {
            PlayerType::Defender => 0,
            PlayerType::Attacker => 1,
        };
        Self {
            output_dir: output_dir.into(),
            title: title.into(),
            random_seeds,
            agent_type: AgentType::TSpsa,
            hparams: BTreeMap::new(),
            log_every: 1,
            player_type,
            player_idx,
            parallel_seeds: false,
        }
    }

    /// The reference T-SPSA setup for the stopping game
    pub fn t_spsa_defaults(
        title: impl Into<String>,
        output_dir: impl Into<String>,
        random_seeds: Vec<u64>,
        player_type: PlayerType,
    ) -> Self {
        Self::new(title, output_dir, random_seeds, player_type)
            .with_hparam(keys::N, 200_i64, "the number of training iterations")
            .with_hparam(keys::C, 10_i64, "scalar coefficient for determining perturbation sizes in T-SPSA")
            .with_hparam(keys::A_STEP, 1_i64, "scalar coefficient for determining gradient step sizes in T-SPSA")
            .with_hparam(keys::A_STABILITY, 100_i64, "stability constant of the T-SPSA step sizes")
            .with_hparam(keys::LAMBDA, 0.602, "decay exponent of the perturbation sizes")
            .with_hparam(keys::EPSILON, 0.101, "decay exponent of the gradient step sizes")
            .with_hparam(keys::L, 3_i64, "the number of stop actions")
            .with_hparam(keys::EVAL_BATCH_SIZE, 100_i64, "number of episodes to evaluate theta")
            .with_hparam(keys::EVAL_EVERY, 1_i64, "how often (in iterations) to evaluate theta")
            .with_hparam(keys::SAVE_EVERY, 1000_i64, "how frequently to checkpoint the policy")
            .with_hparam(keys::CONFIDENCE_INTERVAL, 0.95, "confidence interval")
            .with_hparam(keys::MAX_ENV_STEPS, 500_i64, "maximum number of steps per episode")
            .with_hparam(keys::GRADIENT_BATCH_SIZE, 1_i64, "the batch size of the gradient estimator")
            .with_hparam(keys::RUNNING_AVERAGE, 100_i64, "number of evaluations in the running average")
            .with_hparam(keys::GAMMA, 0.99, "the discount factor gamma")
    }

    pub fn with_hparam(mut self, name: &str, value: impl Into<HParamValue>, descr: &str) -> Self {
        self.hparams.insert(
            name.to_string(),
            HParam {
                name: name.to_string(),
                value: value.into(),
                descr: descr.to_string(),
            },
        );
        self
    }

    /// Logging handle of a run of this experiment
    pub fn run_log(&self) -> RunLog {
        RunLog::new(self.title.as_str(), self.log_every)
    }

    pub fn hparam(&self, name: &str) -> Option<&HParamValue> {
        self.hparams.get(name).map(|h| &h.value)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Evaluation trace of one seed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedMetrics {
    /// Iteration at which each evaluation ran (0 = before training)
    pub iterations: Vec<usize>,
    pub average_returns: Vec<f64>,
    pub running_average_returns: Vec<f64>,
    pub confidence_half_widths: Vec<f64>,
    pub average_episode_lengths: Vec<f64>,
    pub thetas: Vec<Vec<f64>>,
    pub thresholds: Vec<Vec<f64>>,
    /// Stop curves of the most recently evaluated policy
    pub stop_distributions: BTreeMap<String, Vec<f64>>,
}

impl SeedMetrics {
    pub fn series(&self, metric: &str) -> Option<&[f64]> {
        match metric {
            metrics::AVERAGE_RETURN => Some(&self.average_returns),
            metrics::RUNNING_AVERAGE_RETURN => Some(&self.running_average_returns),
            metrics::AVERAGE_EPISODE_LENGTH => Some(&self.average_episode_lengths),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeedStatus {
    Completed,
    Failed {
        kind: String,
        error: String,
        /// Iteration that was in progress
        iteration: usize,
    },
}

impl SeedStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, SeedStatus::Completed)
    }
}

/// Per-seed traces and policies plus cross-seed aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub all_metrics: BTreeMap<u64, SeedMetrics>,
    pub policies: BTreeMap<u64, MultiThresholdStoppingPolicy>,
    pub statuses: BTreeMap<u64, SeedStatus>,
    /// Mean over completed seeds, per evaluation
    pub avg_metrics: BTreeMap<String, Vec<f64>>,
    /// Confidence-interval half width over completed seeds, per evaluation
    pub std_metrics: BTreeMap<String, Vec<f64>>,
}

impl ExperimentResult {
    pub fn completed_seeds(&self) -> Vec<u64> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.is_completed())
            .map(|(seed, _)| *seed)
            .collect()
    }

    pub fn failed_seeds(&self) -> Vec<u64> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.is_completed())
            .map(|(seed, _)| *seed)
            .collect()
    }

    /// Fills `avg_metrics`/`std_metrics` from the completed seeds
    pub fn aggregate(&mut self, confidence: f64) -> Result<()> {
        self.avg_metrics.clear();
        self.std_metrics.clear();
        let completed: Vec<&SeedMetrics> = self
            .completed_seeds()
            .iter()
            .filter_map(|seed| self.all_metrics.get(seed))
            .collect();
        if completed.is_empty() {
            return Ok(());
        }
        for metric in [
            metrics::AVERAGE_RETURN,
            metrics::RUNNING_AVERAGE_RETURN,
            metrics::AVERAGE_EPISODE_LENGTH,
        ] {
            let series: Vec<&[f64]> = completed.iter().filter_map(|m| m.series(metric)).collect();
            let len = series.iter().map(|s| s.len()).min().unwrap_or(0);
            let mut avg = Vec::with_capacity(len);
            let mut std = Vec::with_capacity(len);
            for j in 0..len {
                let xs: Vec<f64> = series.iter().map(|s| s[j]).collect();
                let ci = mean_confidence_interval(&xs, confidence)?;
                avg.push(ci.mean);
                std.push(ci.half_width);
            }
            self.avg_metrics.insert(metric.to_string(), avg);
            self.std_metrics.insert(metric.to_string(), std);
        }
        Ok(())
    }
}

/// A finished experiment as stored in the metastore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentExecution {
    #[serde(default)]
    pub id: Option<u64>,
    pub config: ExperimentConfig,
    pub result: ExperimentResult,
    pub timestamp: DateTime<Utc>,
    pub simulation_name: String,
    #[serde(default)]
    pub emulation_name: Option<String>,
    pub descr: String,
}

impl ExperimentExecution {
    pub fn to_json_str(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::serialization(format!("malformed experiment execution: {}", e)))
    }

    /// Mean of the final running-average return over completed seeds
    pub fn final_running_average(&self) -> Option<f64> {
        let finals: Vec<f64> = self
            .result
            .completed_seeds()
            .iter()
            .filter_map(|seed| self.result.all_metrics.get(seed))
            .filter_map(|m| m.running_average_returns.last().copied())
            .collect();
        if finals.is_empty() {
            None
        } else {
            Some(mean(&finals))
        }
    }
}

struct SeedRun {
    seed: u64,
    metrics: SeedMetrics,
    outcome: std::result::Result<MultiThresholdStoppingPolicy, (Error, usize)>,
}

fn run_seed<E, F>(
    seed: u64,
    config: &ExperimentConfig,
    params: &TSpsaParams,
    simulation_name: &str,
    env_factory: &F,
    metastore: &dyn Metastore,
    log: &RunLog,
) -> SeedRun
where
    E: Environment,
    F: Fn(u64) -> Result<E> + Sync,
{
    let log = log.for_seed(seed);
    let mut agent = TSpsaAgent::with_params(params.clone(), config.clone(), simulation_name);
    let outcome = env_factory(seed)
        .and_then(|mut env| agent.train(seed, &mut env, metastore, &log))
        .map_err(|e| {
            log.seed_failed(&e);
            (e, agent.iteration())
        });
    SeedRun {
        seed,
        metrics: agent.into_metrics(),
        outcome,
    }
}

/// Trains one policy per seed and stores the execution and the policies.
///
/// Configuration problems are returned before any seed starts. Failures of
/// individual seeds are recorded in the result instead of being returned.
pub fn run_experiment<E, F>(
    config: &ExperimentConfig,
    simulation_name: &str,
    env_factory: F,
    metastore: &dyn Metastore,
) -> Result<ExperimentExecution>
where
    E: Environment,
    F: Fn(u64) -> Result<E> + Sync,
{
    if config.random_seeds.is_empty() {
        return Err(Error::configuration("experiment needs at least one random seed"));
    }
    let mut seen = BTreeSet::new();
    if let Some(seed) = config.random_seeds.iter().find(|seed| !seen.insert(**seed)) {
        return Err(Error::configuration(format!("random seed {} is listed more than once", seed)));
    }
    if config.agent_type != AgentType::TSpsa {
        return Err(Error::configuration(format!(
            "the harness trains T-SPSA agents, got {:?}",
            config.agent_type
        )));
    }
    let params = TSpsaParams::from_config(config)?;
    let log = config.run_log();
    log.experiment_started(config.random_seeds.len(), config.parallel_seeds);

    let run = |seed: &u64| run_seed(*seed, config, &params, simulation_name, &env_factory, metastore, &log);
    let runs: Vec<SeedRun> = if config.parallel_seeds {
        config.random_seeds.par_iter().map(run).collect()
    } else {
        config.random_seeds.iter().map(run).collect()
    };

    let mut result = ExperimentResult::default();
    for run in runs {
        let status = match run.outcome {
            Ok(mut policy) => {
                policy.id = Some(metastore.save_multi_threshold_stopping_policy(&policy)?);
                result.policies.insert(run.seed, policy);
                SeedStatus::Completed
            }
            Err((e, iteration)) => SeedStatus::Failed {
                kind: e.kind().to_string(),
                error: e.to_string(),
                iteration,
            },
        };
        result.statuses.insert(run.seed, status);
        result.all_metrics.insert(run.seed, run.metrics);
    }
    result.aggregate(params.confidence_interval)?;

    let mut execution = ExperimentExecution {
        id: None,
        config: config.clone(),
        result,
        timestamp: Utc::now(),
        simulation_name: simulation_name.to_string(),
        emulation_name: None,
        descr: format!("Training of policies with the T-SPSA algorithm: {}", config.title),
    };
    execution.id = Some(metastore.save_experiment_execution(&execution)?);
    log.experiment_finished(
        execution.result.completed_seeds().len(),
        execution.result.failed_seeds().len(),
    );
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_run_log_follows_log_every() {
        let mut config = ExperimentConfig::t_spsa_defaults("cadence", "/tmp", vec![1], PlayerType::Defender);
        config.log_every = 4;
        let log = config.run_log();
        assert_eq!(log.title(), "cadence");
        assert!(log.should_log(8));
        assert!(!log.should_log(6));

        config.log_every = 0;
        assert!(!config.run_log().should_log(0));
    }

    #[test]
    fn test_hparam_values_round_trip() {
        let config = ExperimentConfig::t_spsa_defaults("t", "/tmp/t", vec![1, 2], PlayerType::Defender)
            .with_hparam(keys::THETA1, vec![-1.0, 0.5, 2.0], "initial theta");
        let json = serde_json::to_string(&config).unwrap();
        let restored: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
        assert_eq!(restored.hparam(keys::N), Some(&HParamValue::Int(200)));
        assert_eq!(restored.hparam(keys::LAMBDA).and_then(|v| v.as_f64()), Some(0.602));
        assert_eq!(restored.hparam(keys::THETA1).and_then(|v| v.as_vec()).map(|v| v.len()), Some(3));
    }

    #[test]
    fn test_as_usize() {
        assert_eq!(HParamValue::Int(5).as_usize(), Some(5));
        assert_eq!(HParamValue::Int(-1).as_usize(), None);
        assert_eq!(HParamValue::Float(3.0).as_usize(), Some(3));
        assert_eq!(HParamValue::Float(3.5).as_usize(), None);
        assert_eq!(HParamValue::Bool(true).as_usize(), None);
    }

    #[test]
    fn test_config_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ExperimentConfig::t_spsa_defaults("file", "/tmp/out", vec![399], PlayerType::Attacker);
        config.to_json_file(&path).unwrap();
        assert_eq!(ExperimentConfig::from_json_file(&path).unwrap(), config);
        assert_eq!(config.player_idx, 1);
    }

    #[test]
    fn test_aggregate_skips_failed_seeds() {
        let mut result = ExperimentResult::default();
        for (seed, value) in [(1_u64, 2.0), (2, 4.0), (3, 100.0)] {
            let metrics = SeedMetrics {
                average_returns: vec![value, value],
                running_average_returns: vec![value, value],
                average_episode_lengths: vec![1.0, 1.0],
                ..Default::default()
            };
            result.all_metrics.insert(seed, metrics);
            let status = if seed == 3 {
                SeedStatus::Failed {
                    kind: "rollout".into(),
                    error: "boom".into(),
                    iteration: 1,
                }
            } else {
                SeedStatus::Completed
            };
            result.statuses.insert(seed, status);
        }
        result.aggregate(0.95).unwrap();
        assert_eq!(result.completed_seeds(), vec![1, 2]);
        assert_eq!(result.failed_seeds(), vec![3]);
        let avg = &result.avg_metrics[metrics::AVERAGE_RETURN];
        assert_eq!(avg.len(), 2);
        assert_abs_diff_eq!(avg[0], 3.0);
        assert!(result.std_metrics[metrics::AVERAGE_RETURN][0] > 0.0);
    }

    #[test]
    fn test_seed_status_json() {
        let status = SeedStatus::Failed {
            kind: "rollout".into(),
            error: "env crashed".into(),
            iteration: 4,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(serde_json::from_value::<SeedStatus>(json).unwrap(), status);
    }
}
