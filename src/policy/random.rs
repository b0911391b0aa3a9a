use super::{from_dict, to_dict, Policy};
use crate::error::{Error, Result};
use crate::game::{
    attacker_actions, defender_actions, sample_categorical, state_space, validate_row_stochastic,
    Action, AgentType, Observation, PlayerType, State,
};
use ndarray::Array2;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const KIND: &str = "random policy";
const REQUIRED_KEYS: [&str; 4] = ["player_type", "actions", "states", "stage_policy"];

/// Static stochastic opponent given by a fixed |S|x|A| stage policy
#[derive(Debug)]
pub struct RandomPolicy {
    record: RandomPolicyRecord,
    rng: Mutex<ChaCha8Rng>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RandomPolicyRecord {
    player_type: PlayerType,
    actions: Vec<Action>,
    states: Vec<State>,
    stage_policy: Array2<f64>,
    #[serde(default)]
    seed: u64,
}

impl RandomPolicy {
    /// Uniform over the canonical actions of `player_type` unless a stage policy is given
    pub fn new(player_type: PlayerType, stage_policy: Option<Array2<f64>>, seed: u64) -> Result<Self> {
        let actions = match player_type {
            PlayerType::Defender => defender_actions(),
            PlayerType::Attacker => attacker_actions(),
        };
        let states = state_space();
        let stage_policy = stage_policy.unwrap_or_else(|| {
            Array2::from_elem((states.len(), actions.len()), 1.0 / actions.len() as f64)
        });
        Self::from_record(RandomPolicyRecord {
            player_type,
            actions,
            states,
            stage_policy,
            seed,
        })
    }

    fn from_record(record: RandomPolicyRecord) -> Result<Self> {
        let expected = (record.states.len(), record.actions.len());
        if record.stage_policy.dim() != expected {
            return Err(Error::configuration(format!(
                "stage policy must be |S|x|A| = {:?}, got {:?}",
                expected,
                record.stage_policy.dim()
            )));
        }
        validate_row_stochastic(&record.stage_policy)?;
        let rng = Mutex::new(ChaCha8Rng::seed_from_u64(record.seed));
        Ok(Self { record, rng })
    }

    fn row(&self, o: &Observation) -> Result<usize> {
        // without the state every row applies; rows are equal for belief-only opponents
        let s = o.state.unwrap_or(0);
        if s >= self.record.states.len() {
            return Err(Error::domain(format!("unknown state {}", s)));
        }
        Ok(s)
    }
}

impl Clone for RandomPolicy {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            rng: Mutex::new(self.rng.lock().clone()),
        }
    }
}

impl Policy for RandomPolicy {
    fn action(&self, o: &Observation) -> Result<usize> {
        let weights = self.record.stage_policy.row(self.row(o)?).to_vec();
        let idx = sample_categorical(&mut *self.rng.lock(), &weights)?;
        Ok(self.record.actions[idx].id)
    }

    fn probability(&self, o: &Observation, a: usize) -> Result<f64> {
        let idx = self
            .record
            .actions
            .iter()
            .position(|action| action.id == a)
            .ok_or_else(|| Error::domain(format!("unknown action id {}", a)))?;
        Ok(self.record.stage_policy[[self.row(o)?, idx]])
    }

    fn stage_policy(&self, _o: &Observation) -> Result<Array2<f64>> {
        Ok(self.record.stage_policy.clone())
    }

    fn player_type(&self) -> PlayerType {
        self.record.player_type
    }

    fn agent_type(&self) -> AgentType {
        AgentType::Random
    }

    fn to_dict(&self) -> Result<Value> {
        to_dict(&self.record)
    }

    fn from_dict(d: &Value) -> Result<Self> {
        let record: RandomPolicyRecord = from_dict(d, &REQUIRED_KEYS, KIND)?;
        Self::from_record(record).map_err(|e| Error::serialization(format!("invalid {} dict: {}", KIND, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Belief, CONTINUE, STOP};
    use ndarray::array;

    #[test]
    fn test_uniform_by_default() {
        let policy = RandomPolicy::new(PlayerType::Attacker, None, 1).unwrap();
        let o = Observation::attacker(1, Belief::from_intrusion_probability(0.5).unwrap(), 0);
        assert_eq!(policy.probability(&o, STOP).unwrap(), 0.5);
        assert_eq!(policy.agent_type(), AgentType::Random);
    }

    #[test]
    fn test_samples_follow_stage_policy() {
        let pi = array![[0.0, 1.0], [1.0, 0.0], [1.0, 0.0]];
        let policy = RandomPolicy::new(PlayerType::Attacker, Some(pi), 7).unwrap();
        let b = Belief::from_intrusion_probability(0.0).unwrap();
        for _ in 0..20 {
            assert_eq!(policy.action(&Observation::attacker(1, b.clone(), 0)).unwrap(), STOP);
            assert_eq!(policy.action(&Observation::attacker(1, b.clone(), 1)).unwrap(), CONTINUE);
        }
    }

    #[test]
    fn test_same_seed_same_actions() {
        let a = RandomPolicy::new(PlayerType::Defender, None, 42).unwrap();
        let b = a.clone();
        let o = Observation::defender(2, Belief::from_intrusion_probability(0.3).unwrap());
        let xs: Vec<usize> = (0..30).map(|_| a.action(&o).unwrap()).collect();
        let ys: Vec<usize> = (0..30).map(|_| b.action(&o).unwrap()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_rejects_non_stochastic_rows() {
        let pi = array![[0.5, 0.6], [1.0, 0.0], [1.0, 0.0]];
        assert!(RandomPolicy::new(PlayerType::Defender, Some(pi), 0).is_err());
    }

    #[test]
    fn test_dict_round_trip() {
        let pi = array![[0.3, 0.7], [0.9, 0.1], [1.0, 0.0]];
        let policy = RandomPolicy::new(PlayerType::Attacker, Some(pi), 5).unwrap();
        let d = policy.to_dict().unwrap();
        let restored = RandomPolicy::from_dict(&d).unwrap();
        assert_eq!(restored.to_dict().unwrap(), d);
    }
}
