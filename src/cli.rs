use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::assignment::{assign_variant, bucket, rolling_hash};
use crate::experiment::{Experiment, Variant};

#[derive(Parser)]
#[command(name = "abtrack")]
#[command(version)]
#[command(about = "Resolve and inspect A/B experiment variant assignments")]
pub struct Args {
    /// Verbose diagnostics (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Resolve the variant of every experiment in a config file
    Assign {
        /// TOML file with [[experiments]] definitions
        #[arg(long, short, default_value = "abtrack.toml")]
        config: PathBuf,

        /// Stable subject key (user id). Omit for a weighted-random draw.
        #[arg(long, short)]
        subject: Option<String>,

        /// SQLite file to persist assignments in (in-memory when omitted)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Print assignments as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run many assignments and print the observed split
    Simulate {
        /// Experiment to load from --config
        #[arg(long, short)]
        test: Option<String>,

        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Inline weights, e.g. 70,30 (used when --test is not given)
        #[arg(long, value_delimiter = ',', default_value = "50,50")]
        weights: Vec<f64>,

        #[arg(long, default_value = "10000")]
        runs: u32,

        /// Use subject keys `user-<n>` instead of random draws
        #[arg(long)]
        deterministic: bool,
    },

    /// Print the rolling hash and bucket for a test/subject pair
    Hash {
        test_id: String,
        subject: String,
    },
}

/// Build an ad-hoc experiment with variants `control, v2, v3, ...`.
pub fn experiment_from_weights(test_id: &str, weights: &[f64]) -> Experiment {
    weights
        .iter()
        .enumerate()
        .fold(Experiment::new(test_id), |exp, (i, w)| {
            let id = if i == 0 { "control".to_string() } else { format!("v{}", i + 1) };
            exp.with(Variant::new(id, *w))
        })
}

/// Count how often each variant is chosen over `runs` assignments.
pub fn simulate(experiment: &Experiment, runs: u32, deterministic: bool) -> BTreeMap<String, u64> {
    let mut counts: BTreeMap<String, u64> =
        experiment.variants.iter().map(|v| (v.id.clone(), 0)).collect();
    for i in 0..runs {
        let key = deterministic.then(|| format!("user-{i}"));
        if let Some(v) = assign_variant(experiment, key.as_deref()) {
            *counts.entry(v.id.clone()).or_default() += 1;
        }
    }
    counts
}

/// `(hash, bucket)` for the deterministic path.
pub fn hash_report(test_id: &str, subject: &str) -> (u32, u32) {
    (rolling_hash(&format!("{test_id}-{subject}")), bucket(test_id, subject))
}
