use colored::*;
use intrusion_stopping::game::{
    defender_actions, AgentType, Belief, Observation, PlayerType, StoppingGameConfig, STOP,
};
use intrusion_stopping::metastore::{InMemoryMetastore, Metastore};
use intrusion_stopping::policy::{AlphaVectorsPolicy, Policy};
use ndarray::array;

fn main() -> anyhow::Result<()> {
    println!("{}", "=".repeat(80).bright_blue());
    println!("{}", "    ALPHA-VECTOR POLICY FOR THE DEFENDER POMDP".bright_white().bold());
    println!("{}", "=".repeat(80).bright_blue());

    let game = StoppingGameConfig::default();
    // attacker intrudes with probability 0.2 per step and never aborts
    let pi2 = array![[0.8, 0.2], [1.0, 0.0], [1.0, 0.0]];
    let (transitions, rewards) = game.defender_pomdp_tensors(1, &pi2)?;

    // value function of a solved POMDP: continue-like and stop-like hyperplanes
    let alpha_vectors = vec![vec![0.0, -10.0, 0.0], vec![-2.0, 20.0, 0.0], vec![-0.5, 5.0]];

    let policy = AlphaVectorsPolicy::new(
        PlayerType::Defender,
        AgentType::PomdpSolver,
        defender_actions(),
        game.states(),
        alpha_vectors,
        transitions,
        rewards,
        game.name.as_str(),
        0.0,
    )?;
    println!("\n{}", policy);

    println!("\n{}", "Decisions over the intrusion belief:".bright_white().bold());
    for i in 0..=10 {
        let b1 = i as f64 / 10.0;
        let b = Belief::from_intrusion_probability(b1)?;
        let value = policy.value(&b);
        let a = policy.action(&Observation::from_belief(b))?;
        let decision = if a == STOP { "stop".red() } else { "continue".green() };
        println!("   b1 = {:.1}  V(b) = {:>7.3}  -> {}", b1, value, decision);
    }

    let metastore = InMemoryMetastore::new();
    let id = metastore.save_alpha_vectors_policy(&policy)?;
    let restored = metastore
        .get_alpha_vectors_policy(id)?
        .ok_or_else(|| anyhow::anyhow!("policy {} not found", id))?;
    println!(
        "\n{}",
        format!("Stored and reloaded policy {} ({} alpha vectors)", id, restored.alpha_vectors.len()).green()
    );
    Ok(())
}
