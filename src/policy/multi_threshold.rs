use super::{check_action, deterministic_stage_policy, from_dict, to_dict, Policy};
use crate::error::{Error, Result};
use crate::experiment::ExperimentConfig;
use crate::game::{
    attacker_actions, defender_actions, state_space, Action, AgentType, Observation, PlayerType,
    State, CONTINUE, INTRUSION, NO_INTRUSION, STOP, TERMINAL,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

const KIND: &str = "multi-threshold policy";
const REQUIRED_KEYS: [&str; 8] = [
    "theta",
    "simulation_name",
    "L",
    "states",
    "player_type",
    "actions",
    "avg_R",
    "agent_type",
];

/// Points of the belief grid used by [`MultiThresholdStoppingPolicy::stop_distributions`]
const STOP_DISTRIBUTION_POINTS: usize = 100;

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Exact inverse of [`sigmoid`]; `p` must lie strictly inside (0,1)
pub fn inverse_sigmoid(p: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::domain(format!(
            "inverse_sigmoid is defined on (0,1), got {}",
            p
        )));
    }
    Ok((p / (1.0 - p)).ln())
}

/// Threshold policy with one stopping threshold per remaining stop.
///
/// `theta` holds unconstrained parameters; `sigmoid(theta[i])` is the belief
/// threshold on b(1). A defender policy has `L` parameters: with `l` stops left
/// it stops once `b(1) >= sigmoid(theta[l-1])`. An attacker policy has `2L`:
/// `theta[l-1]` decides when to abort an ongoing intrusion
/// (`b(1) >= threshold`) and `theta[L+l-1]` when to start one
/// (`b(1) < threshold`). The terminal state always continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiThresholdStoppingPolicy {
    pub theta: Vec<f64>,
    pub simulation_name: String,
    #[serde(rename = "L")]
    pub l: usize,
    pub states: Vec<State>,
    pub player_type: PlayerType,
    pub actions: Vec<Action>,
    /// Configuration the policy was trained with
    #[serde(default)]
    pub experiment_config: Option<ExperimentConfig>,
    #[serde(rename = "avg_R")]
    pub avg_r: f64,
    pub agent_type: AgentType,
    #[serde(default)]
    pub id: Option<u64>,
}

impl MultiThresholdStoppingPolicy {
    /// Policy over the canonical stopping-game states and actions
    pub fn new(
        theta: Vec<f64>,
        player_type: PlayerType,
        l: usize,
        simulation_name: impl Into<String>,
        agent_type: AgentType,
    ) -> Result<Self> {
        let actions = match player_type {
            PlayerType::Defender => defender_actions(),
            PlayerType::Attacker => attacker_actions(),
        };
        let policy = Self {
            theta,
            simulation_name: simulation_name.into(),
            l,
            states: state_space(),
            player_type,
            actions,
            experiment_config: None,
            avg_r: -1.0,
            agent_type,
            id: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Seeds the parameters from human-readable threshold probabilities
    pub fn from_thresholds(
        thresholds: &[f64],
        player_type: PlayerType,
        l: usize,
        simulation_name: impl Into<String>,
        agent_type: AgentType,
    ) -> Result<Self> {
        let theta = thresholds
            .iter()
            .map(|p| inverse_sigmoid(*p))
            .collect::<Result<Vec<_>>>()?;
        Self::new(theta, player_type, l, simulation_name, agent_type)
    }

    pub fn with_experiment_config(mut self, config: ExperimentConfig) -> Self {
        self.experiment_config = Some(config);
        self
    }

    pub fn with_avg_r(mut self, avg_r: f64) -> Self {
        self.avg_r = avg_r;
        self
    }

    /// Number of parameters a policy for `player_type` with `l` stops carries
    pub fn theta_dimension(player_type: PlayerType, l: usize) -> usize {
        match player_type {
            PlayerType::Defender => l,
            PlayerType::Attacker => 2 * l,
        }
    }

    /// Starting point for training: every threshold at sigmoid(-3)
    pub fn initial_theta(dim: usize) -> Vec<f64> {
        vec![-3.0; dim]
    }

    fn validate(&self) -> Result<()> {
        if self.l == 0 {
            return Err(Error::configuration("a stopping policy needs L >= 1"));
        }
        let expected = Self::theta_dimension(self.player_type, self.l);
        if self.theta.len() != expected {
            return Err(Error::configuration(format!(
                "{:?} policy with L={} needs {} parameters, got {}",
                self.player_type,
                self.l,
                expected,
                self.theta.len()
            )));
        }
        if self.theta.iter().any(|x| !x.is_finite()) {
            return Err(Error::configuration(format!("theta must be finite, got {:?}", self.theta)));
        }
        check_action(&self.actions, CONTINUE)
            .and_then(|_| check_action(&self.actions, STOP))
            .map_err(|_| Error::configuration("a stopping policy needs continue and stop actions"))
    }

    /// Thresholds on b(1), in the layout of `theta`
    pub fn thresholds(&self) -> Vec<f64> {
        self.theta.iter().map(|x| sigmoid(*x)).collect()
    }

    /// Decision for `l` stops left, intrusion belief `b1` and (for the
    /// attacker) the true state
    pub fn action_for(&self, l: usize, b1: f64, state: Option<usize>) -> Result<usize> {
        if l == 0 {
            return Ok(CONTINUE);
        }
        if l > self.l {
            return Err(Error::domain(format!("stops remaining {} outside 1..={}", l, self.l)));
        }
        let stop_if = |crossed: bool| if crossed { STOP } else { CONTINUE };
        match self.player_type {
            PlayerType::Defender => Ok(stop_if(b1 >= sigmoid(self.theta[l - 1]))),
            PlayerType::Attacker => match state {
                Some(INTRUSION) => Ok(stop_if(b1 >= sigmoid(self.theta[l - 1]))),
                Some(NO_INTRUSION) => Ok(stop_if(b1 < sigmoid(self.theta[self.l + l - 1]))),
                Some(TERMINAL) => Ok(CONTINUE),
                Some(s) => Err(Error::domain(format!("unknown state {}", s))),
                None => Err(Error::domain("attacker observations must carry the state")),
            },
        }
    }

    /// Stop indicator on a 100-point grid over b(1), one curve per stop level
    /// (and per active state for the attacker)
    pub fn stop_distributions(&self) -> BTreeMap<String, Vec<f64>> {
        let grid: Vec<f64> = (0..STOP_DISTRIBUTION_POINTS)
            .map(|i| i as f64 / (STOP_DISTRIBUTION_POINTS - 1) as f64)
            .collect();
        let curve = |l: usize, state: Option<usize>| -> Vec<f64> {
            grid.iter()
                .map(|b1| match self.action_for(l, *b1, state) {
                    Ok(STOP) => 1.0,
                    _ => 0.0,
                })
                .collect()
        };
        let mut distributions = BTreeMap::new();
        for l in 1..=self.l {
            match self.player_type {
                PlayerType::Defender => {
                    distributions.insert(format!("stop_distribution_defender_l={}", l), curve(l, None));
                }
                PlayerType::Attacker => {
                    for s in [NO_INTRUSION, INTRUSION] {
                        distributions.insert(
                            format!("stop_distribution_attacker_l={}_s={}", l, s),
                            curve(l, Some(s)),
                        );
                    }
                }
            }
        }
        distributions
    }
}

impl Policy for MultiThresholdStoppingPolicy {
    fn action(&self, o: &Observation) -> Result<usize> {
        self.action_for(o.stops_remaining, o.b1(), o.state)
    }

    fn probability(&self, o: &Observation, a: usize) -> Result<f64> {
        check_action(&self.actions, a)?;
        Ok(if self.action(o)? == a { 1.0 } else { 0.0 })
    }

    fn stage_policy(&self, o: &Observation) -> Result<Array2<f64>> {
        let (l, b1) = (o.stops_remaining, o.b1());
        match self.player_type {
            PlayerType::Defender => {
                let a = self.action_for(l, b1, None)?;
                deterministic_stage_policy(self.states.len(), self.actions.len(), |_| Ok(a))
            }
            PlayerType::Attacker => {
                deterministic_stage_policy(self.states.len(), self.actions.len(), |s| {
                    self.action_for(l, b1, Some(s))
                })
            }
        }
    }

    fn player_type(&self) -> PlayerType {
        self.player_type
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn to_dict(&self) -> Result<Value> {
        to_dict(self)
    }

    fn from_dict(d: &Value) -> Result<Self> {
        let policy: Self = from_dict(d, &REQUIRED_KEYS, KIND)?;
        policy
            .validate()
            .map_err(|e| Error::serialization(format!("invalid {} dict: {}", KIND, e)))?;
        Ok(policy)
    }
}

impl fmt::Display for MultiThresholdStoppingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let thresholds: Vec<String> = self.thresholds().iter().map(|t| format!("{:.3}", t)).collect();
        write!(
            f,
            "{:?} multi-threshold policy (L={}, agent_type: {:?}, simulation: {}, avg_R: {:.3}) thresholds: [{}]",
            self.player_type,
            self.l,
            self.agent_type,
            self.simulation_name,
            self.avg_r,
            thresholds.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Belief;
    use approx::assert_abs_diff_eq;

    fn defender(thresholds: &[f64]) -> MultiThresholdStoppingPolicy {
        MultiThresholdStoppingPolicy::from_thresholds(
            thresholds,
            PlayerType::Defender,
            thresholds.len(),
            "test",
            AgentType::TSpsa,
        )
        .unwrap()
    }

    fn attacker() -> MultiThresholdStoppingPolicy {
        MultiThresholdStoppingPolicy::from_thresholds(
            &[0.2, 0.3, 0.4, 0.85, 0.9, 0.95],
            PlayerType::Attacker,
            3,
            "test",
            AgentType::None,
        )
        .unwrap()
    }

    fn obs(l: usize, b1: f64) -> Observation {
        Observation::defender(l, Belief::from_intrusion_probability(b1).unwrap())
    }

    #[test]
    fn test_sigmoid_inverse() {
        for p in [0.01, 0.2, 0.5, 0.8, 0.99] {
            assert_abs_diff_eq!(sigmoid(inverse_sigmoid(p).unwrap()), p, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn test_inverse_sigmoid_domain() {
        for p in [0.0, 1.0, -0.1, 1.5, f64::NAN] {
            assert_eq!(inverse_sigmoid(p).unwrap_err().kind(), "domain");
        }
    }

    #[test]
    fn test_defender_uses_threshold_of_current_stop() {
        let policy = defender(&[0.9, 0.6, 0.3]);
        // with three stops left the third threshold applies
        assert_eq!(policy.action(&obs(3, 0.2)).unwrap(), CONTINUE);
        assert_eq!(policy.action(&obs(3, 0.5)).unwrap(), STOP);
        assert_eq!(policy.action(&obs(1, 0.5)).unwrap(), CONTINUE);
        assert_eq!(policy.action(&obs(1, 0.95)).unwrap(), STOP);
        assert_eq!(policy.action(&obs(0, 1.0)).unwrap(), CONTINUE);
        assert!(policy.action(&obs(4, 0.5)).is_err());
    }

    #[test]
    fn test_attacker_start_and_abort() {
        let policy = attacker();
        let b = Belief::from_intrusion_probability(0.1).unwrap();
        // not yet intruding, low suspicion: start
        assert_eq!(policy.action(&Observation::attacker(3, b.clone(), NO_INTRUSION)).unwrap(), STOP);
        // intruding, low suspicion: keep going
        assert_eq!(policy.action(&Observation::attacker(3, b.clone(), INTRUSION)).unwrap(), CONTINUE);
        assert_eq!(policy.action(&Observation::attacker(3, b, TERMINAL)).unwrap(), CONTINUE);

        let b = Belief::from_intrusion_probability(0.92).unwrap();
        assert_eq!(policy.action(&Observation::attacker(2, b.clone(), NO_INTRUSION)).unwrap(), CONTINUE);
        assert_eq!(policy.action(&Observation::attacker(2, b.clone(), INTRUSION)).unwrap(), STOP);
        assert!(policy.action(&Observation::defender(2, b)).is_err());
    }

    #[test]
    fn test_attacker_stage_policy_rows() {
        let policy = attacker();
        let o = Observation::defender(3, Belief::from_intrusion_probability(0.1).unwrap());
        let pi = policy.stage_policy(&o).unwrap();
        assert_eq!(pi.row(NO_INTRUSION).to_vec(), vec![0.0, 1.0]);
        assert_eq!(pi.row(INTRUSION).to_vec(), vec![1.0, 0.0]);
        assert_eq!(pi.row(TERMINAL).to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_theta_dimension_is_checked() {
        let err = MultiThresholdStoppingPolicy::new(vec![0.0; 3], PlayerType::Attacker, 3, "t", AgentType::TSpsa)
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(MultiThresholdStoppingPolicy::new(vec![f64::NAN], PlayerType::Defender, 1, "t", AgentType::TSpsa)
            .is_err());
    }

    #[test]
    fn test_initial_theta() {
        let theta = MultiThresholdStoppingPolicy::initial_theta(4);
        assert_eq!(theta, vec![-3.0; 4]);
        let policy = MultiThresholdStoppingPolicy::new(theta, PlayerType::Attacker, 2, "t", AgentType::TSpsa).unwrap();
        assert!(policy.thresholds().iter().all(|t| *t < 0.05));
    }

    #[test]
    fn test_stop_distributions() {
        let distributions = defender(&[0.5, 0.25]).stop_distributions();
        assert_eq!(distributions.len(), 2);
        let l1 = &distributions["stop_distribution_defender_l=1"];
        assert_eq!(l1.len(), 100);
        assert_eq!(l1[0], 0.0);
        assert_eq!(l1[99], 1.0);
        // stops from b(1) = 50/99 onwards
        assert_eq!(l1.iter().sum::<f64>(), 50.0);
        assert_eq!(distributions["stop_distribution_defender_l=2"].iter().sum::<f64>(), 75.0);

        let distributions = attacker().stop_distributions();
        assert_eq!(distributions.len(), 6);
        assert!(distributions.contains_key("stop_distribution_attacker_l=1_s=0"));
    }

    #[test]
    fn test_dict_round_trip() {
        let policy = attacker().with_avg_r(3.5);
        let d = policy.to_dict().unwrap();
        let restored = MultiThresholdStoppingPolicy::from_dict(&d).unwrap();
        assert_eq!(restored, policy);
        assert_eq!(restored.to_dict().unwrap(), d);
    }

    #[test]
    fn test_from_dict_missing_key() {
        let mut d = defender(&[0.5]).to_dict().unwrap();
        d.as_object_mut().unwrap().remove("L");
        let err = MultiThresholdStoppingPolicy::from_dict(&d).unwrap_err();
        assert!(err.to_string().contains("`L`"));
    }
}
