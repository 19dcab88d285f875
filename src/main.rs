use std::sync::Arc;

use abtrack::cli::{experiment_from_weights, hash_report, simulate, Args, Command};
use abtrack::{AbConfig, Experiment, KeyValueStore, MemoryStore, SqliteStore, VariantAssigner};
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let default = if debug { "abtrack=debug" } else { "abtrack=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    match args.command {
        Command::Assign { config, subject, store, json } => {
            let cfg = AbConfig::from_file(&config)?;
            let store: Arc<dyn KeyValueStore> = match store {
                Some(path) => Arc::new(SqliteStore::open(path)?),
                None => Arc::new(MemoryStore::new()),
            };
            let mut assigner = VariantAssigner::new(store);

            let mut assignments = Vec::new();
            for exp in &cfg.experiments {
                match assigner.get_variant(exp, subject.as_deref()) {
                    Some(a) => assignments.push(a),
                    None if !json => println!("{} {}", exp.test_id.bold(), "disabled".dimmed()),
                    None => {}
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&assignments)?);
            } else {
                for a in &assignments {
                    let variant = if a.is_control {
                        a.variant_id.green()
                    } else {
                        a.variant_id.yellow()
                    };
                    println!("{} -> {} ({})", a.test_id.bold(), variant, a.variant_name);
                }
                if assigner.is_degraded() {
                    eprintln!("{}", "warning: assignment store unavailable, nothing persisted".red());
                }
            }
        }

        Command::Simulate { test, config, weights, runs, deterministic } => {
            let exp: Experiment = match test {
                Some(test_id) => {
                    let path = config.ok_or("--test requires --config")?;
                    let cfg = AbConfig::from_file(path)?;
                    cfg.experiment(&test_id)
                        .cloned()
                        .ok_or_else(|| format!("no experiment '{test_id}' in config"))?
                }
                None => {
                    let exp = experiment_from_weights("simulation", &weights);
                    exp.validate()?;
                    exp
                }
            };

            let counts = simulate(&exp, runs, deterministic);
            let total = exp.total_weight();
            println!(
                "{} {} ({} runs, {})",
                "simulate".bold(),
                exp.test_id,
                runs,
                if deterministic { "deterministic" } else { "random" }
            );
            for v in &exp.variants {
                let n = counts.get(&v.id).copied().unwrap_or(0);
                let observed = if runs > 0 { n as f64 / f64::from(runs) * 100.0 } else { 0.0 };
                let expected = if total > 0.0 { v.effective_weight() / total * 100.0 } else { 0.0 };
                let line = format!("{:>12}  {:>7}  {:>6.2}%  (expected {:.2}%)", v.id, n, observed, expected);
                if (observed - expected).abs() <= 3.0 {
                    println!("{}", line.green());
                } else {
                    println!("{}", line.yellow());
                }
            }
        }

        Command::Hash { test_id, subject } => {
            let (hash, bucket) = hash_report(&test_id, &subject);
            println!("{} {}-{}", "input".bold(), test_id, subject);
            println!("{} {}", "hash".bold(), hash);
            println!("{} {}", "bucket".bold(), bucket.to_string().cyan());
        }
    }

    Ok(())
}
