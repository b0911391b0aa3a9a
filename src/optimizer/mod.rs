//! T-SPSA: simultaneous perturbation stochastic approximation for threshold policies.
//!
//! Each iteration perturbs all parameters at once with a random ±1 vector,
//! estimates the return on both sides of the perturbation with rollouts and
//! takes a gradient ascent step. Step and perturbation sizes decay with the
//! standard SPSA gain sequences.

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::experiment::{keys, ExperimentConfig, HParamValue, SeedMetrics};
use crate::game::{AgentType, PlayerType};
use crate::logging::RunLog;
use crate::metastore::Metastore;
use crate::policy::{MultiThresholdStoppingPolicy, Policy};
use crate::stats::{mean, mean_confidence_interval, running_average};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution};

/// Validated T-SPSA hyper-parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TSpsaParams {
    pub n: usize,
    pub c: f64,
    pub a: f64,
    pub big_a: f64,
    pub lambda: f64,
    pub epsilon: f64,
    pub l: usize,
    pub theta1: Option<Vec<f64>>,
    pub gradient_batch_size: usize,
    pub eval_batch_size: usize,
    pub eval_every: usize,
    pub save_every: usize,
    pub confidence_interval: f64,
    pub max_env_steps: usize,
    pub running_average: usize,
    pub gamma: f64,
    pub player_type: PlayerType,
}

fn lookup<'a>(config: &'a ExperimentConfig, key: &str) -> Result<&'a HParamValue> {
    config
        .hparam(key)
        .ok_or_else(|| Error::configuration(format!("missing hyper-parameter `{}`", key)))
}

fn positive_f64(config: &ExperimentConfig, key: &str) -> Result<f64> {
    match lookup(config, key)?.as_f64() {
        Some(x) if x > 0.0 && x.is_finite() => Ok(x),
        _ => Err(Error::configuration(format!("hyper-parameter `{}` must be a positive number", key))),
    }
}

fn non_negative_f64(config: &ExperimentConfig, key: &str) -> Result<f64> {
    match lookup(config, key)?.as_f64() {
        Some(x) if x >= 0.0 && x.is_finite() => Ok(x),
        _ => Err(Error::configuration(format!("hyper-parameter `{}` must be a non-negative number", key))),
    }
}

fn count(config: &ExperimentConfig, key: &str, min: usize) -> Result<usize> {
    match lookup(config, key)?.as_usize() {
        Some(n) if n >= min => Ok(n),
        _ => Err(Error::configuration(format!("hyper-parameter `{}` must be an integer >= {}", key, min))),
    }
}

fn count_or(config: &ExperimentConfig, key: &str, min: usize, default: usize) -> Result<usize> {
    if config.hparam(key).is_none() {
        return Ok(default);
    }
    count(config, key, min)
}

impl TSpsaParams {
    /// Reads and validates every hyper-parameter before training starts
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        let l = count(config, keys::L, 1)?;
        let confidence_interval = positive_f64(config, keys::CONFIDENCE_INTERVAL)?;
        if confidence_interval >= 1.0 {
            return Err(Error::configuration(format!(
                "hyper-parameter `{}` must lie in (0,1), got {}",
                keys::CONFIDENCE_INTERVAL,
                confidence_interval
            )));
        }
        let gamma = if config.hparam(keys::GAMMA).is_some() {
            positive_f64(config, keys::GAMMA)?
        } else {
            1.0
        };
        if gamma > 1.0 {
            return Err(Error::configuration(format!(
                "hyper-parameter `{}` must lie in (0,1], got {}",
                keys::GAMMA,
                gamma
            )));
        }
        let dim = MultiThresholdStoppingPolicy::theta_dimension(config.player_type, l);
        let theta1 = match config.hparam(keys::THETA1) {
            None => None,
            Some(value) => {
                let theta = value.as_vec().ok_or_else(|| {
                    Error::configuration(format!("hyper-parameter `{}` must be a vector", keys::THETA1))
                })?;
                if theta.len() != dim || theta.iter().any(|x| !x.is_finite()) {
                    return Err(Error::configuration(format!(
                        "hyper-parameter `{}` must hold {} finite values, got {:?}",
                        keys::THETA1,
                        dim,
                        theta
                    )));
                }
                Some(theta.to_vec())
            }
        };
        Ok(Self {
            n: count(config, keys::N, 0)?,
            c: positive_f64(config, keys::C)?,
            a: positive_f64(config, keys::A_STEP)?,
            big_a: non_negative_f64(config, keys::A_STABILITY)?,
            lambda: positive_f64(config, keys::LAMBDA)?,
            epsilon: positive_f64(config, keys::EPSILON)?,
            l,
            theta1,
            gradient_batch_size: count_or(config, keys::GRADIENT_BATCH_SIZE, 1, 1)?,
            eval_batch_size: count(config, keys::EVAL_BATCH_SIZE, 1)?,
            eval_every: count_or(config, keys::EVAL_EVERY, 1, 1)?,
            save_every: count(config, keys::SAVE_EVERY, 1)?,
            confidence_interval,
            max_env_steps: count(config, keys::MAX_ENV_STEPS, 1)?,
            running_average: count(config, keys::RUNNING_AVERAGE, 1)?,
            gamma,
            player_type: config.player_type,
        })
    }

    pub fn theta_dimension(&self) -> usize {
        MultiThresholdStoppingPolicy::theta_dimension(self.player_type, self.l)
    }
}

/// Step size `a_k = a / (k + 1 + A)^epsilon` for zero-based iteration `k`
pub fn standard_ak(a: f64, big_a: f64, epsilon: f64, k: usize) -> f64 {
    a / (k as f64 + 1.0 + big_a).powf(epsilon)
}

/// Perturbation size `c_k = c / (k + 1)^lambda` for zero-based iteration `k`
pub fn standard_ck(c: f64, lambda: f64, k: usize) -> f64 {
    c / (k as f64 + 1.0).powf(lambda)
}

/// Perturbation direction with i.i.d. ±1 entries
pub fn standard_deltak<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Result<Vec<f64>> {
    let coin = Bernoulli::new(0.5).map_err(|e| Error::domain(e.to_string()))?;
    Ok((0..dim)
        .map(|_| if coin.sample(rng) { 1.0 } else { -1.0 })
        .collect())
}

/// Runs one episode of at most `max_steps` steps and returns the discounted
/// return and the episode length
pub fn rollout<E: Environment + ?Sized>(
    policy: &dyn Policy,
    env: &mut E,
    max_steps: usize,
    gamma: f64,
) -> Result<(f64, usize)> {
    let mut o = env.reset()?;
    let mut ret = 0.0;
    let mut discount = 1.0;
    for t in 0..max_steps {
        let a = policy.action(&o)?;
        let outcome = env.step(a)?;
        ret += discount * outcome.reward;
        discount *= gamma;
        o = outcome.observation;
        if outcome.done {
            return Ok((ret, t + 1));
        }
    }
    Ok((ret, max_steps))
}

/// T-SPSA learner for one player; trains one policy per call to [`TSpsaAgent::train`]
#[derive(Debug)]
pub struct TSpsaAgent {
    params: TSpsaParams,
    config: ExperimentConfig,
    simulation_name: String,
    metrics: SeedMetrics,
    iteration: usize,
}

impl TSpsaAgent {
    pub fn new(config: &ExperimentConfig, simulation_name: impl Into<String>) -> Result<Self> {
        let params = TSpsaParams::from_config(config)?;
        Ok(Self::with_params(params, config.clone(), simulation_name))
    }

    pub fn with_params(params: TSpsaParams, config: ExperimentConfig, simulation_name: impl Into<String>) -> Self {
        Self {
            params,
            config,
            simulation_name: simulation_name.into(),
            metrics: SeedMetrics::default(),
            iteration: 0,
        }
    }

    pub fn params(&self) -> &TSpsaParams {
        &self.params
    }

    /// Trace of the latest (possibly aborted) training run
    pub fn metrics(&self) -> &SeedMetrics {
        &self.metrics
    }

    pub fn into_metrics(self) -> SeedMetrics {
        self.metrics
    }

    /// Iteration in progress, or the number of iterations after a completed run
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn policy(&self, theta: Vec<f64>) -> Result<MultiThresholdStoppingPolicy> {
        MultiThresholdStoppingPolicy::new(
            theta,
            self.params.player_type,
            self.params.l,
            self.simulation_name.as_str(),
            AgentType::TSpsa,
        )
    }

    /// Snapshot carrying the training provenance
    fn snapshot(&self, theta: &[f64]) -> Result<MultiThresholdStoppingPolicy> {
        let avg_r = self.metrics.running_average_returns.last().copied().unwrap_or(-1.0);
        Ok(self
            .policy(theta.to_vec())?
            .with_experiment_config(self.config.clone())
            .with_avg_r(avg_r))
    }

    fn batch_returns<E: Environment + ?Sized>(
        &self,
        policy: &dyn Policy,
        env: &mut E,
        batch_size: usize,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut returns = Vec::with_capacity(batch_size);
        let mut lengths = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let (ret, len) = rollout(policy, env, self.params.max_env_steps, self.params.gamma)?;
            returns.push(ret);
            lengths.push(len as f64);
        }
        Ok((returns, lengths))
    }

    /// Two-sided simultaneous perturbation estimate of the return gradient.
    ///
    /// Both sides are evaluated under the same `deltak`; any rollout error
    /// discards the estimate.
    pub fn estimate_gradient<E: Environment + ?Sized>(
        &self,
        theta: &[f64],
        ck: f64,
        deltak: &[f64],
        env: &mut E,
    ) -> Result<Vec<f64>> {
        let plus: Vec<f64> = theta.iter().zip(deltak).map(|(t, d)| t + ck * d).collect();
        let minus: Vec<f64> = theta.iter().zip(deltak).map(|(t, d)| t - ck * d).collect();
        let batch = self.params.gradient_batch_size;
        let (j_plus, _) = self.batch_returns(&self.policy(plus)?, env, batch)?;
        let (j_minus, _) = self.batch_returns(&self.policy(minus)?, env, batch)?;
        let diff = mean(&j_plus) - mean(&j_minus);
        Ok(deltak.iter().map(|d| diff / (2.0 * ck * d)).collect())
    }

    /// Evaluates `theta` without perturbation and appends to the trace
    pub fn eval_theta<E: Environment + ?Sized>(
        &mut self,
        i: usize,
        theta: &[f64],
        env: &mut E,
        log: &RunLog,
    ) -> Result<f64> {
        let policy = self.policy(theta.to_vec())?;
        let (returns, lengths) = self.batch_returns(&policy, env, self.params.eval_batch_size)?;
        let ci = mean_confidence_interval(&returns, self.params.confidence_interval)?;
        let avg_length = mean(&lengths);

        let m = &mut self.metrics;
        m.iterations.push(i);
        m.average_returns.push(ci.mean);
        let running = running_average(&m.average_returns, self.params.running_average);
        m.running_average_returns.push(running);
        m.confidence_half_widths.push(ci.half_width);
        m.average_episode_lengths.push(avg_length);
        m.thetas.push(theta.to_vec());
        m.thresholds.push(policy.thresholds());
        m.stop_distributions = policy.stop_distributions();

        log.evaluation(
            i,
            self.params.n,
            ci.mean,
            running,
            ci.half_width,
            avg_length,
            &policy.thresholds(),
        );
        Ok(ci.mean)
    }

    fn checkpoint(&self, seed: u64, i: usize, theta: &[f64], metastore: &dyn Metastore, log: &RunLog) -> Result<()> {
        let key = format!("{}_seed_{}", self.config.title, seed);
        metastore.save_checkpoint(&key, &self.snapshot(theta)?)?;
        log.checkpoint(i, &key);
        Ok(())
    }

    /// Trains a policy for one seed.
    ///
    /// The environment is reseeded with `seed` and a `ChaCha8Rng` seeded the
    /// same way drives the perturbations, so equal seeds give equal runs. An
    /// error aborts the run; the trace collected so far stays in
    /// [`TSpsaAgent::metrics`].
    pub fn train<E: Environment + ?Sized>(
        &mut self,
        seed: u64,
        env: &mut E,
        metastore: &dyn Metastore,
        log: &RunLog,
    ) -> Result<MultiThresholdStoppingPolicy> {
        self.metrics = SeedMetrics::default();
        self.iteration = 0;
        env.seed(seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let dim = self.params.theta_dimension();
        let mut theta = self
            .params
            .theta1
            .clone()
            .unwrap_or_else(|| MultiThresholdStoppingPolicy::initial_theta(dim));
        log.seed_started(self.params.n, &theta);
        self.eval_theta(0, &theta, env, log)?;

        for i in 0..self.params.n {
            self.iteration = i;
            let ak = standard_ak(self.params.a, self.params.big_a, self.params.epsilon, i);
            let ck = standard_ck(self.params.c, self.params.lambda, i);
            let deltak = standard_deltak(dim, &mut rng)?;
            let gk = self.estimate_gradient(&theta, ck, &deltak, env)?;
            for (t, g) in theta.iter_mut().zip(&gk) {
                *t += ak * g;
            }
            log.gradient_step(i, ak, ck, &gk);

            let done = i + 1;
            if done % self.params.eval_every == 0 {
                self.eval_theta(done, &theta, env, log)?;
            }
            if done % self.params.save_every == 0 {
                self.checkpoint(seed, done, &theta, metastore, log)?;
            }
        }
        self.iteration = self.params.n;

        let policy = self.snapshot(&theta)?;
        log.seed_finished(policy.avg_r);
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StoppingGameEnv;
    use crate::game::StoppingGameConfig;
    use crate::metastore::InMemoryMetastore;
    use crate::policy::RandomPolicy;
    use approx::assert_abs_diff_eq;

    fn config(n: i64) -> ExperimentConfig {
        ExperimentConfig::t_spsa_defaults("optimizer test", "/tmp", vec![1], PlayerType::Defender)
            .with_hparam(keys::N, n, "iterations")
            .with_hparam(keys::EVAL_BATCH_SIZE, 5_i64, "eval batch")
            .with_hparam(keys::MAX_ENV_STEPS, 50_i64, "steps")
            .with_hparam(keys::SAVE_EVERY, 2_i64, "save")
    }

    fn env() -> StoppingGameEnv {
        let attacker = RandomPolicy::new(
            PlayerType::Attacker,
            Some(ndarray::array![[0.7, 0.3], [0.9, 0.1], [1.0, 0.0]]),
            0,
        )
        .unwrap();
        StoppingGameEnv::defender(StoppingGameConfig::default(), Box::new(attacker)).unwrap()
    }

    #[test]
    fn test_gain_sequences() {
        assert_abs_diff_eq!(standard_ak(1.0, 100.0, 0.101, 0), 1.0 / 101.0_f64.powf(0.101));
        assert_abs_diff_eq!(standard_ck(10.0, 0.602, 0), 10.0);
        assert!(standard_ck(10.0, 0.602, 50) < standard_ck(10.0, 0.602, 5));
        assert!(standard_ak(1.0, 100.0, 0.101, 50) < standard_ak(1.0, 100.0, 0.101, 5));
    }

    #[test]
    fn test_deltak_entries_are_plus_minus_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let delta = standard_deltak(1000, &mut rng).unwrap();
        assert!(delta.iter().all(|d| *d == 1.0 || *d == -1.0));
        let positives = delta.iter().filter(|d| **d > 0.0).count();
        assert!(positives > 400 && positives < 600);
    }

    #[test]
    fn test_params_validation() {
        assert!(TSpsaParams::from_config(&config(10)).is_ok());

        let mut missing = config(10);
        missing.hparams.remove(keys::C);
        let err = TSpsaParams::from_config(&missing).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("`c`"));

        let bad = config(10).with_hparam(keys::CONFIDENCE_INTERVAL, 1.5, "ci");
        assert!(TSpsaParams::from_config(&bad).is_err());
        let bad = config(10).with_hparam(keys::L, 0_i64, "stops");
        assert!(TSpsaParams::from_config(&bad).is_err());
        let bad = config(10).with_hparam(keys::THETA1, vec![0.0, 1.0], "wrong length");
        assert!(TSpsaParams::from_config(&bad).is_err());
    }

    #[test]
    fn test_gamma_defaults_to_one() {
        let mut config = config(1);
        config.hparams.remove(keys::GAMMA);
        config.hparams.remove(keys::EVAL_EVERY);
        let params = TSpsaParams::from_config(&config).unwrap();
        assert_eq!(params.gamma, 1.0);
        assert_eq!(params.eval_every, 1);
    }

    #[test]
    fn test_train_records_trace_and_checkpoints() {
        let config = config(4);
        let metastore = InMemoryMetastore::new();
        let mut agent = TSpsaAgent::new(&config, "stopping-game-default").unwrap();
        let mut env = env();
        let policy = agent
            .train(1, &mut env, &metastore, &RunLog::new("optimizer test", 1))
            .unwrap();
        let metrics = agent.metrics();
        assert_eq!(metrics.iterations, vec![0, 1, 2, 3, 4]);
        assert_eq!(metrics.average_returns.len(), 5);
        assert_eq!(metrics.thetas.last().unwrap(), &policy.theta);
        assert_eq!(policy.agent_type, AgentType::TSpsa);
        assert!(policy.experiment_config.is_some());
        assert!(metastore
            .get_checkpoint("optimizer test_seed_1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_same_seed_same_theta() {
        let config = config(3);
        let metastore = InMemoryMetastore::new();
        let log = RunLog::new("determinism", 0);
        let mut a = TSpsaAgent::new(&config, "sim").unwrap();
        let mut b = TSpsaAgent::new(&config, "sim").unwrap();
        let pa = a.train(7, &mut env(), &metastore, &log).unwrap();
        let pb = b.train(7, &mut env(), &metastore, &log).unwrap();
        assert_eq!(pa.theta, pb.theta);
    }
}
