use anyhow::Context;
use colored::*;
use intrusion_stopping::env::StoppingGameEnv;
use intrusion_stopping::experiment::{keys, run_experiment, ExperimentConfig};
use intrusion_stopping::game::{PlayerType, StoppingGameConfig};
use intrusion_stopping::logging::init_tracing;
use intrusion_stopping::metastore::{JsonFileMetastore, Metastore};
use intrusion_stopping::policy::RandomPolicy;
use intrusion_stopping::Analyzer;
use ndarray::array;

fn main() -> anyhow::Result<()> {
    init_tracing("info");

    println!("{}", "=".repeat(80).bright_blue());
    println!("{}", "    T-SPSA: DEFENDER STOPPING STRATEGY".bright_white().bold());
    println!("{}", "    Multi-threshold policy against a static attacker".bright_cyan());
    println!("{}", "=".repeat(80).bright_blue());

    let game = StoppingGameConfig::default();
    println!("\n{}", "Simulation:".bright_white().bold());
    println!("   {}", game);

    let config = ExperimentConfig::t_spsa_defaults(
        "T-SPSA training defender",
        "/tmp/tspsa_defender",
        vec![399, 98912, 999],
        PlayerType::Defender,
    )
    .with_hparam(keys::N, 50_i64, "the number of training iterations")
    .with_hparam(keys::EVAL_BATCH_SIZE, 20_i64, "number of episodes to evaluate theta")
    .with_hparam(keys::SAVE_EVERY, 10_i64, "how frequently to checkpoint the policy");
    let config = ExperimentConfig {
        parallel_seeds: true,
        log_every: 10,
        ..config
    };

    let metastore = JsonFileMetastore::open(&config.output_dir)
        .with_context(|| format!("opening metastore at {}", config.output_dir))?;
    metastore.save_simulation(&game)?;

    let execution = run_experiment(
        &config,
        &game.name,
        |seed| {
            let attacker = RandomPolicy::new(
                PlayerType::Attacker,
                Some(array![[0.9, 0.1], [1.0, 0.0], [1.0, 0.0]]),
                seed,
            )?;
            StoppingGameEnv::defender(game.clone(), Box::new(attacker))
        },
        &metastore,
    )?;

    Analyzer::new(execution.clone()).print_summary();

    for (seed, policy) in &execution.result.policies {
        println!("   seed {}: {}", seed.to_string().bright_white(), policy);
    }
    if let Some(id) = execution.id {
        println!(
            "\n{}",
            format!("Stored experiment execution {} under {}", id, config.output_dir).green()
        );
    }
    Ok(())
}
