use crate::error::{Error, Result};
use crate::stats::beta_binomial_pmf;
use ndarray::{s, Array1, Array2, Array3, Array4, Array5, ArrayBase, Axis, Data, Dimension};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// No intrusion is in progress
pub const NO_INTRUSION: usize = 0;
/// The attacker has started the intrusion
pub const INTRUSION: usize = 1;
/// The episode has ended
pub const TERMINAL: usize = 2;

pub const CONTINUE: usize = 0;
pub const STOP: usize = 1;

/// Tolerance used when checking that probability vectors sum to one
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Represents a player in the stopping game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerType {
    Defender,
    Attacker,
}

impl PlayerType {
    pub fn opponent(self) -> Self {
        match self {
            PlayerType::Defender => PlayerType::Attacker,
            PlayerType::Attacker => PlayerType::Defender,
        }
    }
}

/// How a policy was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    TSpsa,
    PomdpSolver,
    Random,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Active,
    Terminal,
}

/// A state of the game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: usize,
    pub name: String,
    pub state_type: StateType,
}

/// Action available to a player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: usize,
    pub descr: String,
}

impl Action {
    pub fn new(id: usize, descr: impl Into<String>) -> Self {
        Self {
            id,
            descr: descr.into(),
        }
    }
}

/// Probability distribution over states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Belief(Vec<f64>);

impl TryFrom<Vec<f64>> for Belief {
    type Error = Error;

    fn try_from(probs: Vec<f64>) -> Result<Self> {
        Self::new(probs)
    }
}

impl From<Belief> for Vec<f64> {
    fn from(belief: Belief) -> Self {
        belief.0
    }
}

impl Belief {
    /// Validated belief: non-negative entries summing to one
    pub fn new(probs: Vec<f64>) -> Result<Self> {
        if probs.is_empty() {
            return Err(Error::domain("belief must not be empty"));
        }
        let valid = -PROBABILITY_TOLERANCE..=1.0 + PROBABILITY_TOLERANCE;
        if let Some(p) = probs.iter().find(|p| !valid.contains(*p)) {
            return Err(Error::domain(format!("belief entry {} outside [0,1]", p)));
        }
        let sum: f64 = probs.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(Error::domain(format!("belief sums to {} instead of 1", sum)));
        }
        Ok(Self(probs))
    }

    /// All mass on one state
    pub fn certain(num_states: usize, state: usize) -> Result<Self> {
        if state >= num_states {
            return Err(Error::domain(format!(
                "state {} out of range for {} states",
                state, num_states
            )));
        }
        let mut probs = vec![0.0; num_states];
        probs[state] = 1.0;
        Ok(Self(probs))
    }

    /// Two-state-plus-terminal belief with `b1` mass on the intrusion state
    pub fn from_intrusion_probability(b1: f64) -> Result<Self> {
        Self::new(vec![1.0 - b1, b1, 0.0])
    }

    pub fn prob(&self, state: usize) -> f64 {
        self.0.get(state).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

/// What a player sees before choosing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Stops the defender has left (l)
    pub stops_remaining: usize,
    /// The defender's belief over states
    pub belief: Belief,
    /// True state; only the attacker observes it
    pub state: Option<usize>,
}

impl Observation {
    pub fn defender(stops_remaining: usize, belief: Belief) -> Self {
        Self {
            stops_remaining,
            belief,
            state: None,
        }
    }

    pub fn attacker(stops_remaining: usize, belief: Belief, state: usize) -> Self {
        Self {
            stops_remaining,
            belief,
            state: Some(state),
        }
    }

    /// Observation carrying only a belief, as consumed by belief-based policies
    pub fn from_belief(belief: Belief) -> Self {
        Self::defender(1, belief)
    }

    /// Probability the defender assigns to an ongoing intrusion
    pub fn b1(&self) -> f64 {
        self.belief.prob(INTRUSION)
    }
}

pub fn state_space() -> Vec<State> {
    vec![
        State {
            id: NO_INTRUSION,
            name: "no_intrusion".to_string(),
            state_type: StateType::Active,
        },
        State {
            id: INTRUSION,
            name: "intrusion".to_string(),
            state_type: StateType::Active,
        },
        State {
            id: TERMINAL,
            name: "terminal".to_string(),
            state_type: StateType::Terminal,
        },
    ]
}

pub fn defender_actions() -> Vec<Action> {
    vec![Action::new(CONTINUE, "continue"), Action::new(STOP, "stop")]
}

pub fn attacker_actions() -> Vec<Action> {
    vec![Action::new(CONTINUE, "continue"), Action::new(STOP, "stop")]
}

/// Number of IDS alert levels 0..=n
pub fn observation_space(n: usize) -> Vec<usize> {
    (0..=n).collect()
}

pub fn initial_belief() -> Belief {
    Belief(vec![1.0, 0.0, 0.0])
}

/// Reward tensor indexed as `[l - 1, a1, a2, s]` from the defender's perspective
pub fn reward_tensor(r_sla: f64, r_int: f64, r_cost: f64, l: usize, r_st: f64) -> Array4<f64> {
    let mut r = Array4::zeros((l, 2, 2, 3));
    for stops in 1..=l {
        let i = stops - 1;
        let scale = stops as f64;
        // defender continues
        r[[i, CONTINUE, CONTINUE, NO_INTRUSION]] = r_sla;
        r[[i, CONTINUE, CONTINUE, INTRUSION]] = r_sla + r_int;
        r[[i, CONTINUE, STOP, NO_INTRUSION]] = r_sla;
        r[[i, CONTINUE, STOP, INTRUSION]] = r_sla;
        // defender stops
        r[[i, STOP, CONTINUE, NO_INTRUSION]] = r_cost / scale;
        r[[i, STOP, CONTINUE, INTRUSION]] = r_st / scale;
        r[[i, STOP, STOP, NO_INTRUSION]] = r_cost / scale;
        r[[i, STOP, STOP, INTRUSION]] = r_sla;
    }
    r
}

/// Transition tensor indexed as `[l - 1, a1, a2, s, s']`.
///
/// `p` is the per-step probability that the episode ends on its own. The
/// defender's final stop (l = 1) always leads to the terminal state.
pub fn transition_tensor(l: usize, p: f64) -> Array5<f64> {
    let mut t = Array5::zeros((l, 2, 2, 3, 3));
    for stops in 1..=l {
        let i = stops - 1;
        for a1 in [CONTINUE, STOP] {
            if a1 == STOP && stops == 1 {
                for a2 in [CONTINUE, STOP] {
                    for s in 0..3 {
                        t[[i, a1, a2, s, TERMINAL]] = 1.0;
                    }
                }
                continue;
            }
            // attacker continues
            t[[i, a1, CONTINUE, NO_INTRUSION, NO_INTRUSION]] = 1.0 - p;
            t[[i, a1, CONTINUE, NO_INTRUSION, TERMINAL]] = p;
            t[[i, a1, CONTINUE, INTRUSION, INTRUSION]] = 1.0 - p;
            t[[i, a1, CONTINUE, INTRUSION, TERMINAL]] = p;
            t[[i, a1, CONTINUE, TERMINAL, TERMINAL]] = 1.0;
            // attacker stops: starts the intrusion, or aborts it
            t[[i, a1, STOP, NO_INTRUSION, INTRUSION]] = 1.0 - p;
            t[[i, a1, STOP, NO_INTRUSION, TERMINAL]] = p;
            t[[i, a1, STOP, INTRUSION, TERMINAL]] = 1.0;
            t[[i, a1, STOP, TERMINAL, TERMINAL]] = 1.0;
        }
    }
    t
}

/// Observation tensor `[s, o]` over IDS alert counts 0..=n
pub fn observation_tensor(n: usize) -> Array2<f64> {
    let mut z = Array2::zeros((3, n + 1));
    for o in 0..=n {
        z[[NO_INTRUSION, o]] = beta_binomial_pmf(o, n, 0.7, 3.0);
        z[[INTRUSION, o]] = beta_binomial_pmf(o, n, 1.0, 0.7);
    }
    z[[TERMINAL, n]] = 1.0;
    // renormalise rows to absorb rounding in the log-gamma evaluation
    for mut row in z.rows_mut() {
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
    z
}

/// Checks that every lane along the last axis is a probability distribution
pub fn validate_row_stochastic<S, D>(tensor: &ArrayBase<S, D>) -> Result<()>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    if tensor.ndim() == 0 {
        return Err(Error::configuration("tensor has no axes"));
    }
    let last = Axis(tensor.ndim() - 1);
    for (i, lane) in tensor.lanes(last).into_iter().enumerate() {
        if lane.iter().any(|p| *p < -PROBABILITY_TOLERANCE || *p > 1.0 + PROBABILITY_TOLERANCE) {
            return Err(Error::configuration(format!(
                "row {} has entries outside [0,1]",
                i
            )));
        }
        let sum = lane.sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(Error::configuration(format!(
                "row {} sums to {} instead of 1",
                i, sum
            )));
        }
    }
    Ok(())
}

/// Samples an index from an (unnormalised) weight vector
pub fn sample_categorical<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Result<usize> {
    let dist = WeightedIndex::new(weights)
        .map_err(|e| Error::domain(format!("cannot sample from {:?}: {}", weights, e)))?;
    Ok(dist.sample(rng))
}

/// Stopping game definition (the simulation config)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoppingGameConfig {
    pub name: String,
    /// Number of stop actions available to the defender
    pub l: usize,
    pub r_int: f64,
    pub r_cost: f64,
    pub r_sla: f64,
    pub r_st: f64,
    pub p: f64,
    pub n: usize,
    pub gamma: f64,
    pub b1: Belief,
    pub transition_tensor: Array5<f64>,
    pub reward_tensor: Array4<f64>,
    pub observation_tensor: Array2<f64>,
}

impl StoppingGameConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        l: usize,
        r_int: f64,
        r_cost: f64,
        r_sla: f64,
        r_st: f64,
        p: f64,
        n: usize,
        gamma: f64,
    ) -> Result<Self> {
        let config = Self::build(name.into(), l, r_int, r_cost, r_sla, r_st, p, n, gamma);
        config.validate()?;
        Ok(config)
    }

    /// Checks the scalar parameters, the tensor shapes against `l` and `n`
    /// and that every transition and observation row is a distribution.
    ///
    /// Configs built with [`StoppingGameConfig::new`] always pass; decoded or
    /// hand-edited configs may not.
    pub fn validate(&self) -> Result<()> {
        let (l, n) = (self.l, self.n);
        if l == 0 {
            return Err(Error::configuration("the game needs at least one stop (L >= 1)"));
        }
        if !(0.0..=1.0).contains(&self.p) {
            return Err(Error::configuration(format!("p must lie in [0,1], got {}", self.p)));
        }
        if n == 0 {
            return Err(Error::configuration("observation space needs n >= 1"));
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return Err(Error::configuration(format!(
                "gamma must lie in (0,1], got {}",
                self.gamma
            )));
        }
        if self.b1.len() != 3 {
            return Err(Error::configuration(format!(
                "initial belief needs 3 entries, got {}",
                self.b1.len()
            )));
        }
        let shape_error = |tensor: &str, expected: &[usize], actual: &[usize]| {
            Error::configuration(format!(
                "{} tensor has shape {:?}, expected {:?} for L={} and n={}",
                tensor, actual, expected, l, n
            ))
        };
        let expected = [l, 2, 2, 3, 3];
        if self.transition_tensor.shape() != expected {
            return Err(shape_error("transition", &expected, self.transition_tensor.shape()));
        }
        let expected = [l, 2, 2, 3];
        if self.reward_tensor.shape() != expected {
            return Err(shape_error("reward", &expected, self.reward_tensor.shape()));
        }
        let expected = [3, n + 1];
        if self.observation_tensor.shape() != expected {
            return Err(shape_error("observation", &expected, self.observation_tensor.shape()));
        }
        if self.reward_tensor.iter().any(|r| !r.is_finite()) {
            return Err(Error::configuration("reward tensor has non-finite entries"));
        }
        validate_row_stochastic(&self.transition_tensor)?;
        validate_row_stochastic(&self.observation_tensor)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: String,
        l: usize,
        r_int: f64,
        r_cost: f64,
        r_sla: f64,
        r_st: f64,
        p: f64,
        n: usize,
        gamma: f64,
    ) -> Self {
        Self {
            name,
            l,
            r_int,
            r_cost,
            r_sla,
            r_st,
            p,
            n,
            gamma,
            b1: initial_belief(),
            transition_tensor: transition_tensor(l, p),
            reward_tensor: reward_tensor(r_sla, r_int, r_cost, l, r_st),
            observation_tensor: observation_tensor(n),
        }
    }

    pub fn states(&self) -> Vec<State> {
        state_space()
    }

    pub fn num_observations(&self) -> usize {
        self.n + 1
    }

    fn check_stops(&self, l: usize) -> Result<usize> {
        if l == 0 || l > self.l {
            return Err(Error::domain(format!(
                "stops remaining {} outside 1..={}",
                l, self.l
            )));
        }
        Ok(l - 1)
    }

    fn check_stage_policy(&self, pi2: &Array2<f64>) -> Result<()> {
        if pi2.dim() != (3, 2) {
            return Err(Error::domain(format!(
                "stage policy must be |S|x|A| = 3x2, got {:?}",
                pi2.dim()
            )));
        }
        Ok(())
    }

    /// Bayes filter: belief over s' after the defender took `a1`, observed `o`,
    /// and the attacker played its stage strategy `pi2` (|S| x |A2|)
    pub fn next_belief(
        &self,
        o: usize,
        a1: usize,
        b: &Belief,
        pi2: &Array2<f64>,
        l: usize,
    ) -> Result<Belief> {
        let li = self.check_stops(l)?;
        self.check_stage_policy(pi2)?;
        if o > self.n {
            return Err(Error::domain(format!("observation {} outside 0..={}", o, self.n)));
        }
        if a1 > STOP {
            return Err(Error::domain(format!("unknown defender action {}", a1)));
        }
        let num_states = 3;
        let mut unnormalised = vec![0.0; num_states];
        for (s_prime, mass) in unnormalised.iter_mut().enumerate() {
            let z = self.observation_tensor[[s_prime, o]];
            if z == 0.0 {
                continue;
            }
            for s in 0..num_states {
                for a2 in [CONTINUE, STOP] {
                    *mass += b.prob(s)
                        * pi2[[s, a2]]
                        * self.transition_tensor[[li, a1, a2, s, s_prime]]
                        * z;
                }
            }
        }
        let norm: f64 = unnormalised.iter().sum();
        if norm <= 0.0 {
            return Err(Error::rollout(format!(
                "observation {} has zero probability under belief {:?} (a1={}, l={})",
                o,
                b.as_slice(),
                a1,
                l
            )));
        }
        Belief::new(unnormalised.into_iter().map(|m| m / norm).collect())
    }

    /// Reduces the game to the defender's POMDP at stop level `l` given the
    /// attacker's stage strategy, returning T `[a1, s, s']` and R `[a1, s]`
    pub fn defender_pomdp_tensors(&self, l: usize, pi2: &Array2<f64>) -> Result<(Array3<f64>, Array2<f64>)> {
        let li = self.check_stops(l)?;
        self.check_stage_policy(pi2)?;
        let mut t = Array3::zeros((2, 3, 3));
        let mut r = Array2::zeros((2, 3));
        for a1 in [CONTINUE, STOP] {
            for s in 0..3 {
                for a2 in [CONTINUE, STOP] {
                    let w = pi2[[s, a2]];
                    r[[a1, s]] += w * self.reward_tensor[[li, a1, a2, s]];
                    for s_prime in 0..3 {
                        t[[a1, s, s_prime]] += w * self.transition_tensor[[li, a1, a2, s, s_prime]];
                    }
                }
            }
        }
        validate_row_stochastic(&t)?;
        Ok((t, r))
    }

    /// Transition row `P(. | s, a1, a2)` at stop level `l`
    pub fn transition_row(&self, l: usize, a1: usize, a2: usize, s: usize) -> Result<Array1<f64>> {
        let li = self.check_stops(l)?;
        Ok(self.transition_tensor.slice(s![li, a1, a2, s, ..]).to_owned())
    }

    pub fn reward(&self, l: usize, a1: usize, a2: usize, s: usize) -> Result<f64> {
        let li = self.check_stops(l)?;
        Ok(self.reward_tensor[[li, a1, a2, s]])
    }
}

impl Default for StoppingGameConfig {
    fn default() -> Self {
        Self::build(
            "stopping-game-default".to_string(),
            3,
            -1.0,
            -2.0,
            0.0,
            20.0,
            0.01,
            10,
            0.99,
        )
    }
}

impl fmt::Display for StoppingGameConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stopping Game `{}`", self.name)?;
        writeln!(f, "Stops (L): {}", self.l)?;
        writeln!(
            f,
            "R_INT={} R_COST={} R_SLA={} R_ST={}",
            self.r_int, self.r_cost, self.r_sla, self.r_st
        )?;
        writeln!(f, "p={} n={} gamma={}", self.p, self.n, self.gamma)?;
        writeln!(f, "\nObservation Tensor:")?;
        writeln!(f, "{:.3}", self.observation_tensor)?;
        Ok(())
    }
}
