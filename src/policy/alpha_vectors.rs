use super::{check_action, deterministic_stage_policy, from_dict, to_dict, Policy};
use crate::error::{Error, Result};
use crate::game::{validate_row_stochastic, Action, AgentType, Belief, Observation, PlayerType, State};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const KIND: &str = "alpha-vectors policy";
const REQUIRED_KEYS: [&str; 9] = [
    "player_type",
    "agent_type",
    "actions",
    "states",
    "alpha_vectors",
    "transition_tensor",
    "reward_tensor",
    "simulation_name",
    "avg_R",
];

/// POMDP policy given by a set of alpha vectors (a piecewise-linear value function).
///
/// The action for a belief `b` is the one with the highest one-step lookahead
/// value `sum_s sum_s' b(s) R(a,s) T(a,s,s') max_alpha <alpha, b>`. Ties keep the
/// earliest action in `actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaVectorsPolicy {
    pub player_type: PlayerType,
    pub agent_type: AgentType,
    pub actions: Vec<Action>,
    pub states: Vec<State>,
    /// Each vector covers a prefix of the state list
    pub alpha_vectors: Vec<Vec<f64>>,
    /// `[a, s, s']`
    pub transition_tensor: Array3<f64>,
    /// `[a, s]`
    pub reward_tensor: Array2<f64>,
    pub simulation_name: String,
    #[serde(rename = "avg_R")]
    pub avg_r: f64,
    #[serde(default)]
    pub id: Option<u64>,
}

impl AlphaVectorsPolicy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        player_type: PlayerType,
        agent_type: AgentType,
        actions: Vec<Action>,
        states: Vec<State>,
        alpha_vectors: Vec<Vec<f64>>,
        transition_tensor: Array3<f64>,
        reward_tensor: Array2<f64>,
        simulation_name: impl Into<String>,
        avg_r: f64,
    ) -> Result<Self> {
        let policy = Self {
            player_type,
            agent_type,
            actions,
            states,
            alpha_vectors,
            transition_tensor,
            reward_tensor,
            simulation_name: simulation_name.into(),
            avg_r,
            id: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        if self.actions.is_empty() || self.states.is_empty() {
            return Err(Error::configuration(
                "alpha-vectors policy needs at least one action and one state",
            ));
        }
        let (num_a, num_s) = (self.actions.len(), self.states.len());
        if self.transition_tensor.dim() != (num_a, num_s, num_s) {
            return Err(Error::configuration(format!(
                "transition tensor must be |A|x|S|x|S| = {}x{}x{}, got {:?}",
                num_a,
                num_s,
                num_s,
                self.transition_tensor.dim()
            )));
        }
        if self.reward_tensor.dim() != (num_a, num_s) {
            return Err(Error::configuration(format!(
                "reward tensor must be |A|x|S| = {}x{}, got {:?}",
                num_a,
                num_s,
                self.reward_tensor.dim()
            )));
        }
        if let Some(a) = self.actions.iter().find(|a| a.id >= num_a) {
            return Err(Error::configuration(format!("action id {} exceeds the tensors", a.id)));
        }
        if let Some(s) = self.states.iter().find(|s| s.id >= num_s) {
            return Err(Error::configuration(format!("state id {} exceeds the tensors", s.id)));
        }
        if let Some(alpha) = self.alpha_vectors.iter().find(|alpha| alpha.len() > num_s) {
            return Err(Error::configuration(format!(
                "alpha vector of length {} is longer than the state space ({})",
                alpha.len(),
                num_s
            )));
        }
        validate_row_stochastic(&self.transition_tensor)
    }

    /// Largest inner product of an alpha vector with the matching prefix of `b`
    pub fn value(&self, b: &Belief) -> f64 {
        self.alpha_vectors
            .iter()
            .map(|alpha| alpha.iter().zip(b.as_slice()).map(|(x, p)| x * p).sum::<f64>())
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Greedy one-step lookahead action for a belief.
    ///
    /// With no alpha vectors every action value is undefined and the first
    /// action is returned.
    pub fn action_for_belief(&self, b: &Belief) -> Result<usize> {
        if b.len() != self.states.len() {
            return Err(Error::domain(format!(
                "belief has {} entries but the policy has {} states",
                b.len(),
                self.states.len()
            )));
        }
        let first = self.actions[0].id;
        if self.alpha_vectors.is_empty() {
            return Ok(first);
        }
        let max_alpha_v = self.value(b);
        let b = b.as_slice();

        let mut max_a_v = f64::NEG_INFINITY;
        let mut max_a = first;
        for a in &self.actions {
            let mut v_a = 0.0;
            for s in &self.states {
                for s_prime in &self.states {
                    let weight = b[s.id]
                        * self.reward_tensor[[a.id, s.id]]
                        * self.transition_tensor[[a.id, s.id, s_prime.id]];
                    v_a += max_alpha_v * weight;
                }
            }
            if v_a > max_a_v {
                max_a_v = v_a;
                max_a = a.id;
            }
        }
        Ok(max_a)
    }
}

impl Policy for AlphaVectorsPolicy {
    fn action(&self, o: &Observation) -> Result<usize> {
        self.action_for_belief(&o.belief)
    }

    fn probability(&self, o: &Observation, a: usize) -> Result<f64> {
        check_action(&self.actions, a)?;
        Ok(if self.action(o)? == a { 1.0 } else { 0.0 })
    }

    /// The policy only depends on the belief, so every state row is the same
    /// one-hot vector
    fn stage_policy(&self, o: &Observation) -> Result<Array2<f64>> {
        let a = self.action(o)?;
        deterministic_stage_policy(self.states.len(), self.actions.len(), |_| Ok(a))
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

impl fmt::Display for AlphaVectorsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent_type: {:?}, player_type: {:?}, actions: [{}], alpha_vectors: {:?}, \
             simulation_name: {}, id: {:?}, avg_R: {}, states: [{}]",
            self.agent_type,
            self.player_type,
            self.actions
                .iter()
                .map(|a| a.descr.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            self.alpha_vectors,
            self.simulation_name,
            self.id,
            self.avg_r,
            self.states
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{defender_actions, state_space, StoppingGameConfig, CONTINUE, STOP};
    use ndarray::array;

    fn policy(alpha_vectors: Vec<Vec<f64>>) -> AlphaVectorsPolicy {
        let config = StoppingGameConfig::default();
        let pi2 = array![[0.9, 0.1], [0.95, 0.05], [1.0, 0.0]];
        let (t, r) = config.defender_pomdp_tensors(3, &pi2).unwrap();
        AlphaVectorsPolicy::new(
            PlayerType::Defender,
            AgentType::PomdpSolver,
            defender_actions(),
            state_space(),
            alpha_vectors,
            t,
            r,
            "stopping-game-default",
            -1.0,
        )
        .unwrap()
    }

    fn grid() -> Vec<Belief> {
        (0..=20)
            .map(|i| Belief::from_intrusion_probability(i as f64 / 20.0).unwrap())
            .collect()
    }

    #[test]
    fn test_action_is_in_action_list() {
        let policy = policy(vec![vec![1.0, -2.0, 0.0], vec![-0.5, 3.0], vec![0.2]]);
        for b in grid() {
            let a = policy.action(&Observation::from_belief(b)).unwrap();
            assert!(policy.actions.iter().any(|action| action.id == a));
        }
    }

    #[test]
    fn test_lookahead_picks_higher_value() {
        // positive value: the action with the larger expected reward wins
        let policy = policy(vec![vec![1.0, 1.0, 1.0]]);
        let b = Belief::from_intrusion_probability(0.9).unwrap();
        assert_eq!(policy.action_for_belief(&b).unwrap(), STOP);
        let b = Belief::from_intrusion_probability(0.0).unwrap();
        assert_eq!(policy.action_for_belief(&b).unwrap(), CONTINUE);
    }

    #[test]
    fn test_ties_keep_the_first_action() {
        let t = Array3::from_shape_fn((2, 2, 2), |(_, s, s_prime)| if s == s_prime { 1.0 } else { 0.0 });
        let r = array![[1.0, 1.0], [1.0, 1.0]];
        let actions = vec![Action::new(0, "continue"), Action::new(1, "stop")];
        let states = state_space().into_iter().take(2).collect();
        let policy = AlphaVectorsPolicy::new(
            PlayerType::Defender,
            AgentType::PomdpSolver,
            actions,
            states,
            vec![vec![2.0, 2.0]],
            t,
            r,
            "tie",
            0.0,
        )
        .unwrap();
        let b = Belief::new(vec![0.3, 0.7]).unwrap();
        assert_eq!(policy.action_for_belief(&b).unwrap(), 0);
    }

    #[test]
    fn test_empty_alpha_vectors_default_to_first_action() {
        let policy = policy(vec![]);
        for b in grid() {
            assert_eq!(policy.action_for_belief(&b).unwrap(), CONTINUE);
        }
        assert_eq!(policy.value(&Belief::from_intrusion_probability(0.5).unwrap()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_belief_length_must_match_states() {
        let policy = policy(vec![vec![1.0]]);
        let b = Belief::new(vec![0.5, 0.5]).unwrap();
        assert_eq!(policy.action_for_belief(&b).unwrap_err().kind(), "domain");
    }

    #[test]
    fn test_probability_is_deterministic() {
        let policy = policy(vec![vec![1.0, 1.0, 1.0]]);
        let o = Observation::from_belief(Belief::from_intrusion_probability(0.9).unwrap());
        assert_eq!(policy.probability(&o, STOP).unwrap(), 1.0);
        assert_eq!(policy.probability(&o, CONTINUE).unwrap(), 0.0);
        assert!(policy.probability(&o, 7).is_err());
        let pi = policy.stage_policy(&o).unwrap();
        assert_eq!(pi.dim(), (3, 2));
        assert!(pi.rows().into_iter().all(|row| row[STOP] == 1.0));
    }

    #[test]
    fn test_rejects_malformed_tensors() {
        let t = Array3::zeros((2, 3, 3));
        let r = Array2::zeros((2, 3));
        let err = AlphaVectorsPolicy::new(
            PlayerType::Defender,
            AgentType::PomdpSolver,
            defender_actions(),
            state_space(),
            vec![],
            t,
            r,
            "bad",
            0.0,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn test_dict_round_trip() {
        let mut policy = policy(vec![vec![1.0, -2.0, 0.0], vec![0.5]]);
        policy.id = Some(4);
        let d = policy.to_dict().unwrap();
        assert!(d.get("avg_R").is_some());
        let restored = AlphaVectorsPolicy::from_dict(&d).unwrap();
        assert_eq!(restored, policy);
        assert_eq!(restored.to_dict().unwrap(), d);
    }

    #[test]
    fn test_from_dict_reports_missing_key() {
        let mut d = policy(vec![vec![1.0]]).to_dict().unwrap();
        d.as_object_mut().unwrap().remove("alpha_vectors");
        let err = AlphaVectorsPolicy::from_dict(&d).unwrap_err();
        assert_eq!(err.kind(), "serialization");
        assert!(err.to_string().contains("alpha_vectors"));
    }
}
