//! Command-line entry point: `train` runs an experiment from a YAML file,
//! `test` re-evaluates the best checkpoint of a finished run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusty_fewshot::config::{parse_overrides, Config};
use rusty_fewshot::logging::init_logging;
use rusty_fewshot::runner::{Test, Trainer, CONFIG_FILE};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rusty-fewshot")]
#[command(author, version, about = "Episodic few-shot learning: ANIL, R2D2, Baseline, Baseline++", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a model and keep its best checkpoint
    Train {
        /// Experiment file
        #[arg(short, long)]
        config: PathBuf,

        /// Override a config entry, e.g. `-s classifier.kwargs.gamma=10`
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Evaluate the best checkpoint of a finished run
    Test {
        /// Result directory written by `train`
        #[arg(short, long)]
        result_dir: PathBuf,

        /// Override a config entry, e.g. `-s test_episode=600`
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, set } => {
            let overrides = parse_overrides(&set)?;
            let config = Config::load(&config, &overrides)
                .with_context(|| format!("loading {}", config.display()))?;
            let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
            init_logging(level, Some(&config.result_dir().join("train.log")))?;

            info!("Training {}", config.model_name());
            let mut trainer = Trainer::new(config)?;
            let report = trainer.train_loop()?;
            info!(
                "Finished: best val acc {:.3} at epoch {}, test acc {:.3} +- {:.3}",
                report.best_val_acc, report.best_epoch, report.test_at_best.acc, report.test_at_best.h
            );
            info!("Results saved to {}", trainer.result_dir().display());
        }
        Commands::Test { result_dir, set } => {
            let overrides = parse_overrides(&set)?;
            let config_path = result_dir.join(CONFIG_FILE);
            let config = Config::load(&config_path, &overrides)
                .with_context(|| format!("loading {}", config_path.display()))?;
            let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
            init_logging(level, Some(&result_dir.join("test.log")))?;

            let mut test = Test::new(config, &result_dir)?;
            let report = test.test_loop()?;
            println!("{:.3} +- {:.3}", report.mean_acc, report.mean_h);
        }
    }
    Ok(())
}
