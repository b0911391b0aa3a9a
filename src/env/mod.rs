//! Simulated stopping game.
//!
//! [`StoppingGameEnv`] turns a [`StoppingGameConfig`] and a static opponent
//! policy into a single-agent environment for the learning player: a POMDP
//! for the defender, an MDP for the attacker (which observes the true state).

use crate::error::{Error, Result};
use crate::game::{
    sample_categorical, Belief, Observation, PlayerType, StoppingGameConfig, INTRUSION, NO_INTRUSION,
    STOP, TERMINAL,
};
use crate::policy::Policy;
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Environment stepped by the optimizer's rollouts
pub trait Environment: Send {
    fn reset(&mut self) -> Result<Observation>;

    fn step(&mut self, action: usize) -> Result<StepOutcome>;

    /// Reseeds the environment's randomness; identical seeds give identical episodes
    fn seed(&mut self, seed: u64);
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Observation,
    /// Reward from the learning player's perspective
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Diagnostics of one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Stops left before the step
    pub l: usize,
    pub s: usize,
    pub a1: usize,
    pub a2: usize,
    pub o: usize,
    /// Set on the final step of an episode
    pub episode: Option<EpisodeSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    /// Undiscounted return of the learning player
    #[serde(rename = "R")]
    pub r: f64,
    /// Episode length
    #[serde(rename = "T")]
    pub t: usize,
    pub intrusion_start: Option<usize>,
    pub intrusion_length: usize,
    /// Time steps at which the defender stopped
    pub stop_times: Vec<usize>,
}

#[derive(Debug, Clone)]
struct GameState {
    s: usize,
    l: usize,
    b: Belief,
    t: usize,
    episode_return: f64,
    intrusion_start: Option<usize>,
    intrusion_end: Option<usize>,
    stop_times: Vec<usize>,
    done: bool,
}

impl GameState {
    fn initial(config: &StoppingGameConfig) -> Self {
        Self {
            s: NO_INTRUSION,
            l: config.l,
            b: config.b1.clone(),
            t: 0,
            episode_return: 0.0,
            intrusion_start: None,
            intrusion_end: None,
            stop_times: Vec::new(),
            done: false,
        }
    }
}

/// Stopping game seen by one learning player against a fixed opponent
#[derive(Debug)]
pub struct StoppingGameEnv {
    config: StoppingGameConfig,
    learner: PlayerType,
    opponent: Box<dyn Policy>,
    rng: ChaCha8Rng,
    state: GameState,
}

impl StoppingGameEnv {
    /// Defender POMDP against a static attacker strategy
    pub fn defender(config: StoppingGameConfig, attacker: Box<dyn Policy>) -> Result<Self> {
        Self::new(config, PlayerType::Defender, attacker)
    }

    /// Attacker MDP against a static defender strategy
    pub fn attacker(config: StoppingGameConfig, defender: Box<dyn Policy>) -> Result<Self> {
        Self::new(config, PlayerType::Attacker, defender)
    }

    fn new(config: StoppingGameConfig, learner: PlayerType, opponent: Box<dyn Policy>) -> Result<Self> {
        config.validate()?;
        if opponent.player_type() != learner.opponent() {
            return Err(Error::configuration(format!(
                "a {:?} environment needs a {:?} opponent, got {:?}",
                learner,
                learner.opponent(),
                opponent.player_type()
            )));
        }
        let state = GameState::initial(&config);
        Ok(Self {
            config,
            learner,
            opponent,
            rng: ChaCha8Rng::seed_from_u64(0),
            state,
        })
    }

    pub fn config(&self) -> &StoppingGameConfig {
        &self.config
    }

    pub fn learner(&self) -> PlayerType {
        self.learner
    }

    fn observation(&self) -> Observation {
        match self.learner {
            PlayerType::Defender => Observation::defender(self.state.l, self.state.b.clone()),
            PlayerType::Attacker => {
                Observation::attacker(self.state.l, self.state.b.clone(), self.state.s)
            }
        }
    }

    fn sample_row(&mut self, pi: &Array2<f64>, s: usize) -> Result<usize> {
        let weights = pi.row(s).to_vec();
        sample_categorical(&mut self.rng, &weights).map_err(|e| Error::rollout(e.to_string()))
    }

    /// Joint action and the attacker stage strategy the defender filters with
    fn joint_action(&mut self, action: usize) -> Result<(usize, usize, Array2<f64>)> {
        let GameState { s, l, .. } = self.state;
        let b = self.state.b.clone();
        match self.learner {
            PlayerType::Defender => {
                let pi2 = self.opponent.stage_policy(&Observation::attacker(l, b, s))?;
                let a2 = self.sample_row(&pi2, s)?;
                Ok((action, a2, pi2))
            }
            PlayerType::Attacker => {
                let pi1 = self.opponent.stage_policy(&Observation::defender(l, b))?;
                let a1 = self.sample_row(&pi1, s)?;
                // the defender's filter conditions on the realised attacker action
                let mut pi2 = Array2::zeros((3, 2));
                pi2.column_mut(action).fill(1.0);
                Ok((a1, action, pi2))
            }
        }
    }
}

impl Environment for StoppingGameEnv {
    fn reset(&mut self) -> Result<Observation> {
        self.state = GameState::initial(&self.config);
        Ok(self.observation())
    }

    fn step(&mut self, action: usize) -> Result<StepOutcome> {
        if self.state.done {
            return Err(Error::rollout("step called on a finished episode; reset first"));
        }
        if action > STOP {
            return Err(Error::rollout(format!("unknown action {}", action)));
        }
        let GameState { s, l, t, .. } = self.state;
        let (a1, a2, pi2) = self.joint_action(action)?;

        let r = self.config.reward(l, a1, a2, s)?;
        let row = self.config.transition_row(l, a1, a2, s)?;
        let s_prime = sample_categorical(&mut self.rng, &row.to_vec())
            .map_err(|e| Error::rollout(e.to_string()))?;
        let z = self.config.observation_tensor.row(s_prime).to_vec();
        let o = sample_categorical(&mut self.rng, &z).map_err(|e| Error::rollout(e.to_string()))?;
        let b_prime = self.config.next_belief(o, a1, &self.state.b, &pi2, l)?;

        let reward = match self.learner {
            PlayerType::Defender => r,
            PlayerType::Attacker => -r,
        };
        let state = &mut self.state;
        if a1 == STOP {
            state.stop_times.push(t);
            state.l -= 1;
        }
        if s == NO_INTRUSION && s_prime == INTRUSION {
            state.intrusion_start = Some(t + 1);
        }
        if s == INTRUSION && s_prime != INTRUSION {
            state.intrusion_end = Some(t + 1);
        }
        state.s = s_prime;
        state.b = b_prime;
        state.t = t + 1;
        state.episode_return += reward;
        state.done = s_prime == TERMINAL;

        let episode = if state.done {
            let intrusion_length = match (state.intrusion_start, state.intrusion_end) {
                (Some(start), Some(end)) => end - start,
                (Some(start), None) => state.t - start,
                _ => 0,
            };
            Some(EpisodeSummary {
                r: state.episode_return,
                t: state.t,
                intrusion_start: state.intrusion_start,
                intrusion_length,
                stop_times: state.stop_times.clone(),
            })
        } else {
            None
        };
        let done = state.done;

        Ok(StepOutcome {
            observation: self.observation(),
            reward,
            done,
            info: StepInfo {
                l,
                s,
                a1,
                a2,
                o,
                episode,
            },
        })
    }

    fn seed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{AgentType, CONTINUE};
    use crate::policy::{MultiThresholdStoppingPolicy, RandomPolicy};
    use ndarray::array;

    fn defender_env() -> StoppingGameEnv {
        let attacker = RandomPolicy::new(
            PlayerType::Attacker,
            Some(array![[0.8, 0.2], [0.9, 0.1], [1.0, 0.0]]),
            0,
        )
        .unwrap();
        StoppingGameEnv::defender(StoppingGameConfig::default(), Box::new(attacker)).unwrap()
    }

    fn play(env: &mut StoppingGameEnv, action: usize, max_steps: usize) -> Vec<StepOutcome> {
        env.reset().unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..max_steps {
            let outcome = env.step(action).unwrap();
            let done = outcome.done;
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        outcomes
    }

    #[test]
    fn test_reset_returns_initial_observation() {
        let mut env = defender_env();
        let o = env.reset().unwrap();
        assert_eq!(o.stops_remaining, 3);
        assert_eq!(o.belief.as_slice(), &[1.0, 0.0, 0.0]);
        assert_eq!(o.state, None);
    }

    #[test]
    fn test_same_seed_same_episode() {
        let mut a = defender_env();
        let mut b = defender_env();
        a.seed(17);
        b.seed(17);
        assert_eq!(play(&mut a, CONTINUE, 200), play(&mut b, CONTINUE, 200));
    }

    #[test]
    fn test_stopping_l_times_ends_the_episode() {
        let mut env = defender_env();
        env.seed(3);
        let outcomes = play(&mut env, STOP, 10);
        let last = outcomes.last().unwrap();
        assert!(last.done);
        let summary = last.info.episode.as_ref().unwrap();
        assert!(outcomes.len() <= 3);
        assert_eq!(summary.t, outcomes.len());
        assert_eq!(summary.stop_times.len(), outcomes.len());
        assert!(env.step(CONTINUE).is_err());
    }

    #[test]
    fn test_belief_stays_normalised() {
        let mut env = defender_env();
        env.seed(11);
        for outcome in play(&mut env, CONTINUE, 100) {
            let sum: f64 = outcome.observation.belief.as_slice().iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_attacker_env_observes_state_and_negates_reward() {
        let defender = MultiThresholdStoppingPolicy::from_thresholds(
            &[0.99, 0.99, 0.99],
            PlayerType::Defender,
            3,
            "t",
            AgentType::None,
        )
        .unwrap();
        let mut env = StoppingGameEnv::attacker(StoppingGameConfig::default(), Box::new(defender)).unwrap();
        env.seed(5);
        let o = env.reset().unwrap();
        assert_eq!(o.state, Some(NO_INTRUSION));
        // once intruding against a continuing defender the attacker earns -(R_SLA + R_INT) = 1
        let first = env.step(STOP).unwrap();
        assert_eq!(first.reward, 0.0);
        if first.observation.state == Some(INTRUSION) {
            let second = env.step(CONTINUE).unwrap();
            if second.info.a1 == CONTINUE {
                assert_eq!(second.reward, 1.0);
            }
        }
    }

    #[test]
    fn test_opponent_must_be_the_other_player() {
        let defender = RandomPolicy::new(PlayerType::Defender, None, 0).unwrap();
        let err = StoppingGameEnv::defender(StoppingGameConfig::default(), Box::new(defender)).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_inconsistent_game_is_rejected() {
        let attacker = RandomPolicy::new(PlayerType::Attacker, None, 0).unwrap();
        let mut game = StoppingGameConfig::default();
        game.l = 4;
        let err = StoppingGameEnv::defender(game, Box::new(attacker)).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }
}
