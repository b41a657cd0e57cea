//! Supervisor for autonomous coding-agent loops.
//!
//! Runs an agent CLI against one or more project directories until the agent
//! signals completion through sentinel files, with operator control over
//! pauses, stops and missing checkpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use supervisor::control::{ControlLoop, LinePrompt, MissingCheckpointPolicy, exit_code};
use supervisor::core::types::InvocationParams;
use supervisor::exit_codes;
use supervisor::io::config::{DEFAULT_CONFIG_FILE, SupervisorConfig, load_config, write_config};
use supervisor::io::invoker::{CliInvoker, Invoker};
use supervisor::io::sentinel::{
    FsSentinels, Sentinel, SentinelReport, SentinelStore, scaffold_if_absent,
};
use supervisor::io::templates::Templates;
use supervisor::logging;
use supervisor::runner::{LoopRunner, RunnerOptions};
use supervisor::shutdown::Shutdown;
use supervisor::task::TaskRegistry;

#[derive(Parser)]
#[command(
    name = "supervisor",
    version,
    about = "Supervise autonomous coding-agent loops through sentinel files"
)]
struct Cli {
    /// Config file (defaults to `supervisor.toml` in the current directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold RALPH-PLAN.md and RALPH-PROGRESS.md and write a default config.
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Show which sentinel files are present.
    Status {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Supervise one agent loop per directory until all finish.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directories to supervise; each must contain RALPH-DESIGN.md.
    #[arg(required = true)]
    dirs: Vec<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    variant: Option<String>,
    /// Log level forwarded to the agent.
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Seconds between attempts after a checkpoint, failure or cooldown.
    #[arg(long)]
    delay_secs: Option<u64>,
    #[arg(long, value_enum, default_value_t = MissingCheckpointPolicy::Ask)]
    on_missing_checkpoint: MissingCheckpointPolicy,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    match cli.command {
        Command::Init { dir, force } => {
            logging::init("warn");
            cmd_init(&dir, &config_path, force)
        }
        Command::Status { dir, json } => {
            logging::init("warn");
            cmd_status(&dir, json)
        }
        Command::Run(args) => {
            logging::init("info");
            cmd_run(args, &config_path)
        }
    }
}

fn cmd_init(dir: &Path, config_path: &Path, force: bool) -> Result<i32> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let cfg = load_config(config_path)?;
    let templates = Templates::load(cfg.template_dir.as_deref())?;
    let store = FsSentinels::new(dir);

    for (sentinel, template) in [
        (Sentinel::Plan, &templates.plan),
        (Sentinel::Progress, &templates.progress),
    ] {
        if scaffold_if_absent(&store, sentinel, template)? {
            println!("created {}", store.path(sentinel).display());
        }
    }

    if force || !config_path.exists() {
        write_config(config_path, &cfg)?;
        println!("wrote {}", config_path.display());
    }

    if !store.exists(Sentinel::Design)? {
        println!(
            "note: write {} before running",
            store.path(Sentinel::Design).display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_status(dir: &Path, json: bool) -> Result<i32> {
    if !dir.is_dir() {
        bail!("not a directory: {}", dir.display());
    }
    let report = SentinelReport::collect(&FsSentinels::new(dir))?;
    if json {
        let payload = serde_json::to_string_pretty(&report).context("serialize status json")?;
        println!("{payload}");
    } else {
        for entry in &report.entries {
            let mark = if entry.present { "x" } else { " " };
            println!("[{mark}] {}", entry.file);
        }
        if !report.is_present(Sentinel::Design) {
            println!("note: {} is required before running", Sentinel::Design.file_name());
        }
    }
    Ok(exit_codes::OK)
}

/// Apply command-line overrides on top of the file config.
fn apply_overrides(cfg: &mut SupervisorConfig, args: &RunArgs) {
    if let Some(model) = &args.model {
        cfg.agent.model = Some(model.clone());
    }
    if let Some(variant) = &args.variant {
        cfg.agent.variant = Some(variant.clone());
    }
    if let Some(level) = &args.log_level {
        cfg.agent.log_level = level.clone();
    }
    if let Some(max_attempts) = args.max_attempts {
        cfg.max_attempts = max_attempts;
    }
    if let Some(delay) = args.delay_secs {
        cfg.delay_secs = delay;
    }
}

fn cmd_run(args: RunArgs, config_path: &Path) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    apply_overrides(&mut cfg, &args);
    cfg.validate()?;

    let model = cfg
        .agent
        .model
        .clone()
        .ok_or_else(|| anyhow!("no model configured; pass --model or set agent.model"))?;
    let params = InvocationParams::new(model)
        .with_variant(cfg.variant())
        .with_log_level(cfg.agent.log_level.clone());
    let templates = Templates::load(cfg.template_dir.as_deref())?;
    let invoker: Arc<dyn Invoker> = Arc::new(CliInvoker::from_config(&cfg.agent));
    let options = RunnerOptions::from(&cfg);

    let mut registry = TaskRegistry::new();
    for dir in &args.dirs {
        if !dir.is_dir() {
            bail!("not a directory: {}", dir.display());
        }
        let dir = dir
            .canonicalize()
            .with_context(|| format!("resolve {}", dir.display()))?;
        let runner = LoopRunner::builder(&dir, params.clone())
            .options(options.clone())
            .templates(templates.clone())
            .invoker(Arc::clone(&invoker))
            .build();
        registry.insert(&dir, Some(runner));
    }

    // Handler first so no agent can start without a way to stop it.
    let handles = registry
        .iter()
        .filter_map(|task| task.runner().map(LoopRunner::handle))
        .collect();
    let shutdown = Arc::new(Shutdown::new(handles));
    shutdown.install()?;

    for task in registry.iter() {
        task.start()
            .with_context(|| format!("start {}", task.dir().display()))?;
        info!(task = %task.id(), dir = %task.dir().display(), backup_id = %task.backup_id(), "task started");
    }

    let stdin = std::io::stdin();
    let prompt = LinePrompt::new(stdin.lock(), std::io::stdout());
    let reports = ControlLoop::new(
        &mut registry,
        args.on_missing_checkpoint,
        prompt,
        std::io::stdout(),
    )
    .run()?;

    let code = exit_code(&reports);
    if shutdown.signals() > 0 {
        warn!(signals = shutdown.signals(), "run interrupted");
    }
    if code != exit_codes::OK {
        warn!(code, "not every task completed");
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_defaults_to_current_dir() {
        let cli = Cli::parse_from(["supervisor", "init"]);
        match cli.command {
            Command::Init { dir, force } => {
                assert_eq!(dir, PathBuf::from("."));
                assert!(!force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn parse_status_json() {
        let cli = Cli::parse_from(["supervisor", "status", "proj", "--json"]);
        assert!(matches!(cli.command, Command::Status { json: true, .. }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "supervisor",
            "--config",
            "custom.toml",
            "run",
            "a",
            "b",
            "--model",
            "anthropic/claude",
            "--max-attempts",
            "3",
            "--on-missing-checkpoint",
            "continue",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(args.max_attempts, Some(3));
        assert_eq!(args.on_missing_checkpoint, MissingCheckpointPolicy::Continue);

        let mut cfg = SupervisorConfig::default();
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.agent.model.as_deref(), Some("anthropic/claude"));
        assert_eq!(cfg.delay_secs, 2);
    }

    #[test]
    fn run_requires_a_directory() {
        assert!(Cli::try_parse_from(["supervisor", "run"]).is_err());
    }

    #[test]
    fn init_scaffolds_and_writes_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("proj");
        let config = temp.path().join("supervisor.toml");

        cmd_init(&project, &config, false).expect("init");
        assert!(project.join("RALPH-PLAN.md").exists());
        assert!(project.join("RALPH-PROGRESS.md").exists());
        assert_eq!(
            load_config(&config).expect("load"),
            SupervisorConfig::default()
        );
    }
}
