use crate::experiment::{metrics, ExperimentExecution, SeedStatus};
use crate::stats::mean;
use serde::{Deserialize, Serialize};
use tabled::{Table, Tabled};

/// Training report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub title: String,
    pub simulation_name: String,
    pub seeds: Vec<SeedSummary>,
    pub convergence: ConvergenceAnalysis,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSummary {
    pub seed: u64,
    pub completed: bool,
    pub evaluations: usize,
    pub final_return: Option<f64>,
    pub best_return: Option<f64>,
    pub final_running_average: Option<f64>,
    pub final_thresholds: Vec<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceAnalysis {
    pub completed_seeds: usize,
    pub failed_seeds: usize,
    /// Running average at the last evaluation, averaged over completed seeds
    pub final_running_average: Option<f64>,
    /// Change of the averaged running average over the last `window` evaluations
    pub recent_improvement: Option<f64>,
    pub converged: bool,
}

/// Analyzer for experiment executions
pub struct Analyzer {
    execution: ExperimentExecution,
    window: usize,
    tolerance: f64,
}

impl Analyzer {
    pub fn new(execution: ExperimentExecution) -> Self {
        Self {
            execution,
            window: 10,
            tolerance: 0.05,
        }
    }

    /// Convergence is declared when the averaged running return moved less
    /// than `tolerance` (relative) over the last `window` evaluations
    pub fn with_convergence_window(mut self, window: usize, tolerance: f64) -> Self {
        self.window = window.max(1);
        self.tolerance = tolerance;
        self
    }

    /// Generate the training report
    pub fn generate_report(&self) -> TrainingReport {
        let convergence = self.analyze_convergence();
        TrainingReport {
            title: self.execution.config.title.clone(),
            simulation_name: self.execution.simulation_name.clone(),
            seeds: self.summarize_seeds(),
            recommendations: self.generate_recommendations(&convergence),
            convergence,
        }
    }

    fn summarize_seeds(&self) -> Vec<SeedSummary> {
        let result = &self.execution.result;
        result
            .statuses
            .iter()
            .map(|(seed, status)| {
                let trace = result.all_metrics.get(seed);
                let returns = trace.map(|m| m.average_returns.as_slice()).unwrap_or(&[]);
                let final_thresholds = match result.policies.get(seed) {
                    Some(policy) => policy.thresholds(),
                    None => trace.and_then(|m| m.thresholds.last().cloned()).unwrap_or_default(),
                };
                SeedSummary {
                    seed: *seed,
                    completed: status.is_completed(),
                    evaluations: returns.len(),
                    final_return: returns.last().copied(),
                    best_return: returns.iter().copied().reduce(f64::max),
                    final_running_average: trace.and_then(|m| m.running_average_returns.last().copied()),
                    final_thresholds,
                    error: match status {
                        SeedStatus::Completed => None,
                        SeedStatus::Failed { error, .. } => Some(error.clone()),
                    },
                }
            })
            .collect()
    }

    fn analyze_convergence(&self) -> ConvergenceAnalysis {
        let result = &self.execution.result;
        let averaged = result
            .avg_metrics
            .get(metrics::RUNNING_AVERAGE_RETURN)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let recent_improvement = if averaged.len() > self.window {
            let last = averaged[averaged.len() - 1];
            let before = averaged[averaged.len() - 1 - self.window];
            Some(last - before)
        } else {
            None
        };
        let converged = match (recent_improvement, averaged.last()) {
            (Some(delta), Some(last)) => delta.abs() <= self.tolerance * last.abs().max(1.0),
            _ => false,
        };

        ConvergenceAnalysis {
            completed_seeds: result.completed_seeds().len(),
            failed_seeds: result.failed_seeds().len(),
            final_running_average: self.execution.final_running_average(),
            recent_improvement,
            converged,
        }
    }

    fn generate_recommendations(&self, convergence: &ConvergenceAnalysis) -> Vec<String> {
        let mut recommendations = Vec::new();

        if convergence.failed_seeds > 0 {
            recommendations.push(format!(
                "{} seed(s) failed. Inspect the recorded errors before comparing policies.",
                convergence.failed_seeds
            ));
        }

        if convergence.completed_seeds < 2 {
            recommendations.push(
                "Fewer than two completed seeds; confidence intervals across seeds are not informative.".to_string(),
            );
        }

        if !convergence.converged {
            recommendations.push(
                "Running average is still moving. Consider more iterations or smaller step sizes (a, c).".to_string(),
            );
        }

        let spread = self.threshold_spread();
        if spread > 0.2 {
            recommendations.push(format!(
                "Final thresholds differ by up to {:.2} across seeds; the optimum may be flat or not yet reached.",
                spread
            ));
        }

        recommendations
    }

    /// Largest per-component gap between final thresholds of completed seeds
    fn threshold_spread(&self) -> f64 {
        let thresholds: Vec<Vec<f64>> = self
            .execution
            .result
            .policies
            .values()
            .map(|p| p.thresholds())
            .collect();
        let dim = thresholds.iter().map(Vec::len).min().unwrap_or(0);
        (0..dim)
            .map(|i| {
                let column = thresholds.iter().map(|t| t[i]);
                let max = column.clone().fold(f64::NEG_INFINITY, f64::max);
                let min = column.fold(f64::INFINITY, f64::min);
                max - min
            })
            .fold(0.0, f64::max)
    }

    /// Print summary to console
    pub fn print_summary(&self) {
        let report = self.generate_report();

        println!("\n{}", "=".repeat(80));
        println!("T-SPSA TRAINING REPORT: {}", report.title);
        println!("{}", "=".repeat(80));
        println!("Simulation: {}", report.simulation_name);

        println!("\nCONVERGENCE");
        println!("{}", "-".repeat(80));
        println!("Converged: {}", if report.convergence.converged { "✓ Yes" } else { "✗ No" });
        println!(
            "Seeds: {} completed, {} failed",
            report.convergence.completed_seeds, report.convergence.failed_seeds
        );
        if let Some(avg) = report.convergence.final_running_average {
            println!("Final Running Average Return: {:.3}", avg);
        }
        if let Some(delta) = report.convergence.recent_improvement {
            println!("Recent Improvement: {:+.3}", delta);
        }

        println!("\nSEEDS");
        println!("{}", report.display_table());

        if !report.recommendations.is_empty() {
            println!("\nRECOMMENDATIONS");
            println!("{}", "-".repeat(80));
            for (i, rec) in report.recommendations.iter().enumerate() {
                println!("{}. {}", i + 1, rec);
            }
        }

        println!("\n{}", "=".repeat(80));
    }

    /// Export the report to JSON
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.generate_report())
    }

    /// Averaged running-average return per evaluation
    pub fn return_trend(&self) -> Vec<f64> {
        self.execution
            .result
            .avg_metrics
            .get(metrics::RUNNING_AVERAGE_RETURN)
            .cloned()
            .unwrap_or_default()
    }
}

/// One row of the per-seed table
#[derive(Tabled)]
pub struct SeedRow {
    #[tabled(rename = "Seed")]
    pub seed: u64,
    #[tabled(rename = "Final J")]
    pub final_return: String,
    #[tabled(rename = "Best J")]
    pub best_return: String,
    #[tabled(rename = "Thresholds")]
    pub thresholds: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

fn fmt_opt(x: Option<f64>) -> String {
    x.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".to_string())
}

impl TrainingReport {
    /// Display as formatted table
    pub fn display_table(&self) -> String {
        let rows: Vec<SeedRow> = self
            .seeds
            .iter()
            .map(|s| SeedRow {
                seed: s.seed,
                final_return: fmt_opt(s.final_return),
                best_return: fmt_opt(s.best_return),
                thresholds: s
                    .final_thresholds
                    .iter()
                    .map(|t| format!("{:.3}", t))
                    .collect::<Vec<_>>()
                    .join(", "),
                status: if s.completed { "✓" } else { "✗" }.to_string(),
            })
            .collect();

        Table::new(rows).to_string()
    }

    /// Mean of the final evaluation returns of the completed seeds
    pub fn mean_final_return(&self) -> Option<f64> {
        let finals: Vec<f64> = self
            .seeds
            .iter()
            .filter(|s| s.completed)
            .filter_map(|s| s.final_return)
            .collect();
        if finals.is_empty() {
            None
        } else {
            Some(mean(&finals))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{ExperimentConfig, ExperimentResult, SeedMetrics};
    use crate::game::{AgentType, PlayerType};
    use crate::policy::MultiThresholdStoppingPolicy;
    use chrono::Utc;

    fn execution(returns: &[(u64, Vec<f64>)], failed: Option<u64>) -> ExperimentExecution {
        let mut result = ExperimentResult::default();
        for (seed, series) in returns {
            result.all_metrics.insert(
                *seed,
                SeedMetrics {
                    iterations: (0..series.len()).collect(),
                    average_returns: series.clone(),
                    running_average_returns: series.clone(),
                    average_episode_lengths: vec![5.0; series.len()],
                    ..Default::default()
                },
            );
            if Some(*seed) == failed {
                result.statuses.insert(
                    *seed,
                    SeedStatus::Failed {
                        kind: "rollout".into(),
                        error: "env crashed".into(),
                        iteration: 2,
                    },
                );
            } else {
                let policy = MultiThresholdStoppingPolicy::from_thresholds(
                    &[0.5 + *seed as f64 * 0.01],
                    PlayerType::Defender,
                    1,
                    "sim",
                    AgentType::TSpsa,
                )
                .unwrap();
                result.policies.insert(*seed, policy);
                result.statuses.insert(*seed, SeedStatus::Completed);
            }
        }
        result.aggregate(0.95).unwrap();
        ExperimentExecution {
            id: Some(1),
            config: ExperimentConfig::t_spsa_defaults("report", "/tmp", vec![1, 2], PlayerType::Defender),
            result,
            timestamp: Utc::now(),
            simulation_name: "sim".into(),
            emulation_name: None,
            descr: String::new(),
        }
    }

    #[test]
    fn test_report_per_seed() {
        let exec = execution(&[(1, vec![1.0, 3.0, 2.0]), (2, vec![0.0, 1.0, 4.0])], Some(2));
        let report = Analyzer::new(exec).generate_report();

        assert_eq!(report.seeds.len(), 2);
        assert_eq!(report.seeds[0].best_return, Some(3.0));
        assert_eq!(report.seeds[0].final_return, Some(2.0));
        assert!(!report.seeds[1].completed);
        assert_eq!(report.seeds[1].error.as_deref(), Some("env crashed"));
        assert_eq!(report.convergence.failed_seeds, 1);
        assert_eq!(report.mean_final_return(), Some(2.0));
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn test_flat_trend_converges() {
        let flat = vec![5.0; 20];
        let exec = execution(&[(1, flat.clone()), (2, flat)], None);
        let analyzer = Analyzer::new(exec).with_convergence_window(5, 0.01);
        let report = analyzer.generate_report();
        assert!(report.convergence.converged);
        assert_eq!(report.convergence.recent_improvement, Some(0.0));
        assert_eq!(analyzer.return_trend().len(), 20);
    }

    #[test]
    fn test_table_and_json() {
        let exec = execution(&[(1, vec![1.0])], None);
        let analyzer = Analyzer::new(exec);
        let table = analyzer.generate_report().display_table();
        assert!(table.contains("Thresholds"));
        assert!(table.contains("0.510"));
        assert!(analyzer.export_json().is_ok());
    }
}
