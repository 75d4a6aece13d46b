//! Operator commands for the evaluation harness.
//!
//! Thin layer over the `harness` library: parses flags, loads the config and
//! dataset, wires the Docker runtime and git source provider into an
//! [`Engine`](harness::scheduler::Engine), and hands off to the library's
//! evaluate, produce, and build operations.

mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use harness::io::config::{HarnessConfig, load_config_with};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Evaluate candidate patches inside per-environment containers"
)]
struct Cli {
    /// Harness configuration file.
    #[arg(long, global = true, default_value = "harness.toml")]
    config: PathBuf,

    #[command(flatten)]
    registry: RegistryArgs,

    #[command(subcommand)]
    command: Command,
}

/// Registry overrides; they take precedence over the config file and environment.
#[derive(Args, Debug, Default)]
struct RegistryArgs {
    /// Push freshly built images to the registry.
    #[arg(long, global = true)]
    push_to_registry: bool,

    /// Try the registry before building locally.
    #[arg(long, global = true)]
    pull_from_registry: bool,

    #[arg(long, global = true)]
    registry_url: Option<String>,

    #[arg(long, global = true)]
    registry_user: Option<String>,

    #[arg(long, global = true)]
    registry_pass: Option<String>,
}

impl RegistryArgs {
    fn apply(&self, cfg: &mut HarnessConfig) {
        if self.push_to_registry {
            cfg.registry.push = true;
        }
        if self.pull_from_registry {
            cfg.registry.pull = true;
        }
        if let Some(url) = &self.registry_url {
            cfg.registry.url = Some(url.clone());
        }
        if let Some(user) = &self.registry_user {
            cfg.registry.user = Some(user.clone());
        }
        if let Some(pass) = &self.registry_pass {
            cfg.registry.password = Some(pass.clone());
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate predictions (or gold patches) and write `evaluation_report.json`.
    Evaluate(EvaluateArgs),
    /// Run the golden and pre-golden rounds and classify every test.
    Produce(ProduceArgs),
    /// Build evaluation images without running anything.
    Build(BuildArgs),
    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Dataset file (`.json` or `.jsonl`).
    #[arg(long)]
    dataset: PathBuf,

    /// Predictions file (`.jsonl` with `instance_id` and `model_patch`), or `gold`.
    #[arg(long, default_value = "gold")]
    predictions: String,

    /// Space-separated instance ids to evaluate; all records when omitted.
    #[arg(long)]
    instance_ids: Option<String>,

    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Instance timeout in seconds; the config value when omitted.
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop each instance's test command at the first failure.
    #[arg(long)]
    failfast: bool,

    /// Submit instances in chunks and stop after a chunk that failed entirely.
    #[arg(long)]
    batch_mode: bool,

    #[arg(long)]
    run_id: Option<String>,

    #[arg(long, default_value = ".")]
    output_path: PathBuf,

    /// Also write `resolved_dataset.jsonl`.
    #[arg(long)]
    output_passed: bool,

    /// Keep run logs under the system temp directory.
    #[arg(long)]
    use_tmp_dir: bool,

    /// Remove the images this run produced once it finishes.
    #[arg(long)]
    remove_images: bool,
}

#[derive(Args, Debug)]
struct ProduceArgs {
    #[arg(long)]
    dataset: PathBuf,

    /// Replacement environment spec: inline JSON or a file, either one spec
    /// or a map of version to spec.
    #[arg(long)]
    spec_dict: Option<String>,

    /// Space-separated test files never targeted.
    #[arg(long)]
    black_list: Option<String>,

    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, overrides_with = "no_batch_mode")]
    batch_mode: bool,

    /// Submit every instance at once instead of in chunks.
    #[arg(long, overrides_with = "batch_mode")]
    no_batch_mode: bool,

    #[arg(long)]
    run_id: Option<String>,

    #[arg(long, default_value = ".")]
    output_path: PathBuf,

    /// Also write `produced_dataset.jsonl`.
    #[arg(long)]
    output_passed: bool,
}

impl ProduceArgs {
    fn batch(&self) -> bool {
        self.batch_mode || !self.no_batch_mode
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Build one image per distinct environment in the dataset.
    #[arg(long, conflicts_with_all = ["repo", "spec"])]
    dataset: Option<PathBuf>,

    /// Repository (`owner/name`) to build for.
    #[arg(long, requires = "spec")]
    repo: Option<String>,

    /// Environment spec: inline JSON or a file.
    #[arg(long, requires = "repo")]
    spec: Option<String>,

    /// Rebuild even when a cached image exists.
    #[arg(long)]
    force: bool,

    #[arg(long, default_value_t = 4)]
    max_workers: usize,
}

/// Split a space-separated flag value.
fn split_words(value: Option<&str>) -> Option<Vec<String>> {
    value.map(|v| v.split_whitespace().map(str::to_string).collect())
}

fn main() {
    harness::logging::init("harness=info,harness_cli=info");
    let code = match run() {
        Ok(()) => harness::exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            harness::exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if let Command::Config {
        command: ConfigCommand::Init { force },
    } = &cli.command
    {
        return cli::config_init(&cli.config, *force);
    }

    let cfg = load_config_with(&cli.config, |cfg| cli.registry.apply(cfg))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let cancel = cli::cancel_on_interrupt();
        match cli.command {
            Command::Evaluate(args) => cli::evaluate(&cfg, args, cancel).await,
            Command::Produce(args) => cli::produce(&cfg, args, cancel).await,
            Command::Build(args) => cli::build(&cfg, args, cancel).await,
            // Handled before the config is loaded.
            Command::Config { .. } => Ok(()),
        }
    })
}
