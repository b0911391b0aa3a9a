//! Policies for the stopping game.
//!
//! Every policy kind implements [`Policy`]: it chooses an action for an
//! [`Observation`], reports the probability of an action, exposes its |S|x|A|
//! stage policy and converts to and from a JSON dict. Policy kinds register no
//! global state; the optimizer and the environments only see the trait.

mod alpha_vectors;
mod multi_threshold;
mod random;

pub use alpha_vectors::AlphaVectorsPolicy;
pub use multi_threshold::{inverse_sigmoid, sigmoid, MultiThresholdStoppingPolicy};
pub use random::RandomPolicy;

use crate::error::{Error, Result};
use crate::game::{Action, AgentType, Observation, PlayerType};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Decision rule of one player
pub trait Policy: fmt::Debug + Send + Sync {
    /// Action id chosen for the observation
    fn action(&self, o: &Observation) -> Result<usize>;

    /// p(a | o)
    fn probability(&self, o: &Observation, a: usize) -> Result<f64>;

    /// Row-stochastic |S|x|A| matrix: the action distribution per state given `o`
    fn stage_policy(&self, o: &Observation) -> Result<Array2<f64>>;

    fn player_type(&self) -> PlayerType;

    fn agent_type(&self) -> AgentType;

    fn to_dict(&self) -> Result<Value>;

    fn from_dict(d: &Value) -> Result<Self>
    where
        Self: Sized;
}

/// Serializes a policy record into its dict form
pub(crate) fn to_dict<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

/// Checks for the required keys, then deserializes the record
pub(crate) fn from_dict<T: DeserializeOwned>(d: &Value, keys: &[&str], kind: &str) -> Result<T> {
    let map = d
        .as_object()
        .ok_or_else(|| Error::serialization(format!("{} dict must be a JSON object", kind)))?;
    if let Some(key) = keys.iter().find(|k| !map.contains_key(**k)) {
        return Err(Error::missing_key(key, kind));
    }
    serde_json::from_value(d.clone())
        .map_err(|e| Error::serialization(format!("malformed {} dict: {}", kind, e)))
}

/// One-hot |S|x|A| stage policy that plays `action(s)` in every state `s`
pub(crate) fn deterministic_stage_policy(
    num_states: usize,
    num_actions: usize,
    action: impl Fn(usize) -> Result<usize>,
) -> Result<Array2<f64>> {
    let mut pi = Array2::zeros((num_states, num_actions));
    for s in 0..num_states {
        let a = action(s)?;
        if a >= num_actions {
            return Err(Error::domain(format!(
                "action {} out of range for {} actions",
                a, num_actions
            )));
        }
        pi[[s, a]] = 1.0;
    }
    Ok(pi)
}

pub(crate) fn check_action(actions: &[Action], a: usize) -> Result<()> {
    if actions.iter().any(|action| action.id == a) {
        Ok(())
    } else {
        Err(Error::domain(format!("unknown action id {}", a)))
    }
}
