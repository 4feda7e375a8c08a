//! CLI definitions for executor-verifier.
//!
//! One-shot tool: load the run configuration, apply flag and `--cfg-options`
//! overrides, run the pipeline against the named executor image and print a
//! per-check verification summary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::pipeline::{parse_task_selection, Pipeline, VerifierConfig};
use crate::runner::DockerRuntime;

/// Default run configuration file.
const DEFAULT_CONFIG_FILE: &str = "verifier-config.yaml";

/// Executor image contract verifier.
#[derive(Parser)]
#[command(name = "executor-verifier")]
#[command(about = "Verify executor docker images against the training/mining/infer contract")]
#[command(version)]
#[command(
    long_about = "executor-verifier runs an executor docker image through a configurable \
sequence of training, mining and inference tasks, builds the mounted workspace each task \
expects, and checks every produced artifact against the contract.\n\nExample usage:\n  \
executor-verifier --config verifier-config.yaml --image executor:latest --tasks tmi"
)]
pub struct Cli {
    /// Run configuration file (YAML).
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Executor image to verify; overrides the configuration file.
    #[arg(short = 'i', long)]
    pub image: Option<String>,

    /// Task selection shorthand: t, m, i, mi, tmi or ttmi.
    #[arg(short = 't', long)]
    pub tasks: Option<String>,

    /// Host GPU ids to hand to the container, comma separated.
    #[arg(short = 'g', long)]
    pub gpu_id: Option<String>,

    /// Weights directory seeding mining/infer runs without a preceding
    /// training task.
    #[arg(short = 'p', long)]
    pub pretrain_weights_dir: Option<PathBuf>,

    /// Ad-hoc configuration overrides as key=value pairs.
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub cfg_options: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running
/// the pipeline.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the pipeline.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the executor-verifier CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    info!(image = %config.docker_image, tasks = ?config.tasks, "starting verification run");

    let runtime = DockerRuntime::connect()?;
    let pipeline = Pipeline::new(config, Arc::new(runtime))?;
    let report = pipeline.run().await?;

    report.print_summary();

    if report.error_count() > 0 || report.aborted() {
        anyhow::bail!(
            "verification failed with {} contract error(s)",
            report.error_count()
        );
    }
    Ok(())
}

/// Loads the configuration file and layers the CLI flags on top.
fn build_config(cli: &Cli) -> anyhow::Result<VerifierConfig> {
    let mut config = VerifierConfig::load(&cli.config)?;

    if let Some(image) = &cli.image {
        config.docker_image = image.clone();
    }
    if let Some(tasks) = &cli.tasks {
        config.tasks = parse_task_selection(tasks)?;
    }
    if let Some(gpu_id) = &cli.gpu_id {
        config.gpu_id = gpu_id.clone();
    }
    if let Some(dir) = &cli.pretrain_weights_dir {
        config.pretrain_weights_dir = Some(dir.clone());
    }

    for option in &cli.cfg_options {
        let Some((key, value)) = option.split_once('=') else {
            anyhow::bail!("invalid --cfg-options entry '{option}', expected KEY=VALUE");
        };
        config.apply_override(key.trim(), value.trim())?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::TaskKind;
    use std::fs;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("verifier-config.yaml");
        fs::write(
            &path,
            concat!(
                "docker_image: executor:latest\n",
                "data_dir: /data/voc_dog\n",
                "work_dir: /tmp/verifier\n",
                "tasks: [training]\n",
                "class_names: [dog]\n",
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_cli_flags_override_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = write_config(tmp.path());

        let cli = Cli::parse_from([
            "executor-verifier",
            "--config",
            config_path.to_str().unwrap(),
            "--image",
            "other:v2",
            "--tasks",
            "mi",
            "--gpu-id",
            "2,5",
        ]);

        let config = build_config(&cli).unwrap();
        assert_eq!(config.docker_image, "other:v2");
        assert_eq!(config.tasks, vec![TaskKind::Mining, TaskKind::Infer]);
        assert_eq!(config.gpu_id, "2,5");
    }

    #[test]
    fn test_cfg_options_applied_after_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = write_config(tmp.path());

        let cli = Cli::parse_from([
            "executor-verifier",
            "--config",
            config_path.to_str().unwrap(),
            "--cfg-options",
            "gpu_id=1",
            "reuse_workspace=true",
        ]);

        let config = build_config(&cli).unwrap();
        assert_eq!(config.gpu_id, "1");
        assert!(config.reuse_workspace);
    }

    #[test]
    fn test_malformed_cfg_option_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = write_config(tmp.path());

        let cli = Cli::parse_from([
            "executor-verifier",
            "--config",
            config_path.to_str().unwrap(),
            "--cfg-options",
            "gpu_id",
        ]);

        assert!(build_config(&cli).is_err());
    }
}
