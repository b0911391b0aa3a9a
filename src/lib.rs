//! # Intrusion Stopping
//!
//! Optimal stopping policies for intrusion prevention. The defender of an IT
//! infrastructure decides when to take (up to `L`) defensive stop actions
//! while an attacker decides when to start and abort its intrusion. This
//! library provides:
//!
//! - The stopping game: reward, transition and observation tensors and the
//!   defender's belief filter
//! - Policies: alpha-vector (POMDP value function), multi-threshold and random
//! - T-SPSA: stochastic approximation of optimal threshold strategies
//! - An experiment harness that trains one policy per random seed and stores
//!   the results in a metastore
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use intrusion_stopping::env::StoppingGameEnv;
//! use intrusion_stopping::experiment::{run_experiment, ExperimentConfig};
//! use intrusion_stopping::game::{PlayerType, StoppingGameConfig};
//! use intrusion_stopping::metastore::InMemoryMetastore;
//! use intrusion_stopping::policy::RandomPolicy;
//!
//! let config = ExperimentConfig::t_spsa_defaults("quickstart", "/tmp/quickstart", vec![399], PlayerType::Defender);
//! let metastore = InMemoryMetastore::new();
//! let execution = run_experiment(
//!     &config,
//!     "stopping-game",
//!     |seed| {
//!         let attacker = RandomPolicy::new(PlayerType::Attacker, None, seed)?;
//!         StoppingGameEnv::defender(StoppingGameConfig::default(), Box::new(attacker))
//!     },
//!     &metastore,
//! )
//! .unwrap();
//! println!("{:?}", execution.final_running_average());
//! ```

pub mod analysis;
pub mod command;
pub mod env;
pub mod error;
pub mod experiment;
pub mod game;
pub mod logging;
pub mod metastore;
pub mod optimizer;
pub mod policy;
pub mod stats;

// Re-export commonly used types
pub use analysis::{Analyzer, TrainingReport};
pub use env::{Environment, StoppingGameEnv};
pub use error::{Error, Result};
pub use experiment::{run_experiment, ExperimentConfig, ExperimentExecution, SeedStatus};
pub use game::{AgentType, Belief, Observation, PlayerType, StoppingGameConfig};
pub use metastore::{InMemoryMetastore, JsonFileMetastore, Metastore};
pub use optimizer::{TSpsaAgent, TSpsaParams};
pub use policy::{AlphaVectorsPolicy, MultiThresholdStoppingPolicy, Policy, RandomPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
