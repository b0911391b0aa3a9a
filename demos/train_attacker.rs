use colored::*;
use intrusion_stopping::env::StoppingGameEnv;
use intrusion_stopping::experiment::{keys, run_experiment, ExperimentConfig, SeedStatus};
use intrusion_stopping::game::{AgentType, PlayerType, StoppingGameConfig};
use intrusion_stopping::logging::init_tracing;
use intrusion_stopping::metastore::InMemoryMetastore;
use intrusion_stopping::policy::MultiThresholdStoppingPolicy;
use intrusion_stopping::Analyzer;

fn main() -> anyhow::Result<()> {
    init_tracing("info");

    println!("{}", "=".repeat(80).bright_blue());
    println!("{}", "    T-SPSA: ATTACKER STOPPING STRATEGY".bright_white().bold());
    println!("{}", "    Multi-threshold attacker against a fixed threshold defender".bright_cyan());
    println!("{}", "=".repeat(80).bright_blue());

    let game = StoppingGameConfig::default();
    let defender_thresholds = [0.7, 0.8, 0.9];
    println!("\nDefender thresholds: {:?}", defender_thresholds);

    let mut config = ExperimentConfig::t_spsa_defaults(
        "T-SPSA training attacker",
        "/tmp/tspsa_attacker",
        vec![399, 98912],
        PlayerType::Attacker,
    )
    .with_hparam(keys::N, 30_i64, "the number of training iterations")
    .with_hparam(keys::EVAL_BATCH_SIZE, 20_i64, "number of episodes to evaluate theta");
    config.log_every = 5;

    let metastore = InMemoryMetastore::new();
    let execution = run_experiment(
        &config,
        &game.name,
        |_seed| {
            let defender = MultiThresholdStoppingPolicy::from_thresholds(
                &defender_thresholds,
                PlayerType::Defender,
                game.l,
                game.name.as_str(),
                AgentType::None,
            )?;
            StoppingGameEnv::attacker(game.clone(), Box::new(defender))
        },
        &metastore,
    )?;

    for (seed, status) in &execution.result.statuses {
        match status {
            SeedStatus::Completed => println!("   seed {}: {}", seed, "completed".green()),
            SeedStatus::Failed { error, iteration, .. } => {
                println!("   seed {}: {} at iteration {} ({})", seed, "failed".red(), iteration, error)
            }
        }
    }

    Analyzer::new(execution.clone()).print_summary();

    for (seed, policy) in &execution.result.policies {
        println!("\n{} {}", "Stop probabilities, seed".bright_white().bold(), seed);
        for (key, curve) in policy.stop_distributions() {
            let stop_from = curve.iter().position(|p| *p > 0.5);
            match stop_from {
                Some(i) => println!("   {}: stops from b1 = {:.2}", key, i as f64 / 99.0),
                None => println!("   {}: never stops", key),
            }
        }
    }
    Ok(())
}
