//! devstack - disposable development stacks for PHP and Python projects.
//!
//! Analyzes a project directory, plans the containers it needs and runs them
//! through the docker CLI.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use devstack::blueprint::{resolve, Overrides, StackBlueprint};
use devstack::core::{Config, PullPolicy};
use devstack::engine::{ContainerEngine, DockerCli, MemoryEngine};
use devstack::env::{masked_value, ProjectEnv};
use devstack::lifecycle::{CancelToken, Orchestrator, OrchestratorOptions, StatusReport};
use devstack::project::{analyze, Project};
use devstack::store::{StackRecord, StateStore};
use devstack::synth::{synthesize, to_compose, PortAllocation, StackPlan, SynthesisContext, TcpProbe};

/// Disposable development stacks for PHP and Python projects
#[derive(Parser)]
#[command(name = "devstack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Container engine to drive
    #[arg(long, global = true, value_enum, default_value_t = EngineKind::Docker)]
    engine: EngineKind,

    /// Directory holding stack records
    #[arg(long, global = true, env = "DEVSTACK_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected project kind and features
    Analyze {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show the stack that `up` would run
    Plan {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        selection: Selection,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,

        /// Print sensitive environment values unmasked
        #[arg(long)]
        show_secrets: bool,
    },

    /// Create or update the project's stack
    Up {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        selection: Selection,

        /// Start instances one at a time
        #[arg(long)]
        sequential: bool,

        /// Image pull policy (missing, always)
        #[arg(long)]
        pull: Option<PullPolicy>,
    },

    /// Show the state of the project's stack
    Status {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Stop the project's containers
    Stop {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Remove the project's stack
    Down {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Also remove named volumes
        #[arg(long)]
        volumes: bool,
    },

    /// List known stacks
    Ls {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long, conflicts_with = "init")]
        path: bool,

        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Role selection and environment overrides given on the command line.
#[derive(Args, Clone, Default)]
struct Selection {
    /// Force a role into the stack
    #[arg(long = "with", value_name = "ROLE")]
    with: Vec<String>,

    /// Leave a role out of the stack
    #[arg(long = "without", value_name = "ROLE")]
    without: Vec<String>,

    /// Environment override applied to every instance
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// docker CLI
    Docker,
    /// In-process engine; nothing is started
    Memory,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlanFormat {
    Text,
    Json,
    Compose,
}

/// Lifecycle commands, detached from argument parsing.
enum Lifecycle {
    Up { selection: Selection, sequential: bool, pull: Option<PullPolicy> },
    Status { format: Format },
    Stop,
    Down { volumes: bool },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let state_dir = cli.state_dir.clone();
    let engine = cli.engine;

    match cli.command {
        Commands::Analyze { path, format } => cmd_analyze(&path, format)?,
        Commands::Plan { path, selection, format, show_secrets } => {
            cmd_plan(&path, &selection, format, show_secrets, engine, state_dir.as_deref())?;
        }
        Commands::Up { path, selection, sequential, pull } => {
            cmd_lifecycle(&path, Lifecycle::Up { selection, sequential, pull }, engine, state_dir.as_deref())?;
        }
        Commands::Status { path, format } => {
            cmd_lifecycle(&path, Lifecycle::Status { format }, engine, state_dir.as_deref())?;
        }
        Commands::Stop { path } => cmd_lifecycle(&path, Lifecycle::Stop, engine, state_dir.as_deref())?,
        Commands::Down { path, volumes } => {
            cmd_lifecycle(&path, Lifecycle::Down { volumes }, engine, state_dir.as_deref())?;
        }
        Commands::Ls { format } => cmd_ls(format, state_dir.as_deref())?,
        Commands::Config { path, init } => cmd_config(path, init)?,
        Commands::Completions { shell } => cmd_completions(shell),
    }

    Ok(())
}

/// Parse a `KEY=VALUE` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn open_store(config: &Config, explicit: Option<&Path>) -> Result<StateStore> {
    let dir = config.state_dir(explicit)?;
    tracing::debug!(state_dir = %dir.display(), "Using state directory");
    Ok(StateStore::new(dir))
}

fn analyze_project(path: &Path) -> Result<Project> {
    analyze(path).with_context(|| format!("Failed to analyze {}", path.display()))
}

/// Analyze a project and resolve its blueprint with file and command line
/// overrides.
fn load_blueprint(path: &Path, selection: &Selection) -> Result<(StackBlueprint, ProjectEnv)> {
    let project = analyze_project(path)?;

    let mut overrides = Overrides::load(&project.path)?;
    for role in &selection.with {
        overrides.enable(role);
    }
    for role in &selection.without {
        overrides.disable(role);
    }
    for (key, value) in &selection.env {
        overrides.set_env(key, value);
    }

    let blueprint = resolve(&project, &overrides)?;
    let project_env = ProjectEnv::load(&project.path);
    Ok((blueprint, project_env))
}

/// Show the detected project.
fn cmd_analyze(path: &Path, format: Format) -> Result<()> {
    let project = analyze_project(path)?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&project)?;
            println!("{json}");
        }
        Format::Text => {
            println!("Project:  {}", project.name);
            println!("Path:     {}", project.path.display());
            println!("Kind:     {}", project.kind.display_name());
            if project.features.is_empty() {
                println!("Features: none");
            } else {
                let features: Vec<_> = project.features.iter().map(|f| f.as_str()).collect();
                println!("Features: {}", features.join(", "));
            }

            let project_env = ProjectEnv::load(&project.path);
            if project_env.sources().is_empty() {
                println!("Env:      none");
            } else {
                let files: Vec<_> = project_env
                    .sources()
                    .iter()
                    .map(|p| p.file_name().map_or_else(|| p.display().to_string(), |n| n.to_string_lossy().into_owned()))
                    .collect();
                println!("Env:      {}", files.join(", "));
            }
        }
    }

    Ok(())
}

/// Synthesize and print a plan without touching the engine.
fn cmd_plan(
    path: &Path,
    selection: &Selection,
    format: PlanFormat,
    show_secrets: bool,
    engine: EngineKind,
    state_dir: Option<&Path>,
) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config, state_dir)?;
    let (blueprint, project_env) = load_blueprint(path, selection)?;

    let report = store.load()?;
    let mut allocation = PortAllocation::from_plans(report.records.iter().map(|r| &r.plan));
    if engine == EngineKind::Docker && config.ports.probe_host {
        allocation = allocation.with_probe(TcpProbe);
    }
    let previous =
        report.records.into_iter().find(|r| r.project_path == blueprint.project.path).map(|r| r.plan);

    let ctx = SynthesisContext::new().with_env(project_env).with_previous(previous);
    let plan = synthesize(&blueprint, &mut allocation, &ctx)?;

    match format {
        PlanFormat::Json => {
            let shown = if show_secrets { plan } else { masked(&plan) };
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        PlanFormat::Compose => {
            print!("{}", to_compose(&plan, !show_secrets)?);
        }
        PlanFormat::Text => print_plan(&plan, !show_secrets),
    }

    Ok(())
}

fn masked(plan: &StackPlan) -> StackPlan {
    let mut plan = plan.clone();
    for instance in &mut plan.instances {
        for (key, value) in &mut instance.env {
            *value = masked_value(key, value);
        }
    }
    plan
}

fn print_plan(plan: &StackPlan, mask: bool) {
    println!("Stack {} ({})", plan.project.name, plan.project.kind.display_name());
    println!("Network: {}", plan.network);
    if !plan.volumes.is_empty() {
        println!("Volumes: {}", plan.volumes.join(", "));
    }

    for instance in &plan.instances {
        println!();
        println!("{} [{}]", instance.name, instance.role);
        println!("  image:  {}", instance.image);
        println!("  port:   {} -> {}", instance.host_port, instance.container_port);
        if !instance.depends_on.is_empty() {
            let deps: Vec<_> = instance.depends_on.iter().map(|d| d.as_str()).collect();
            println!("  after:  {}", deps.join(", "));
        }
        for (key, value) in &instance.env {
            let value = if mask { masked_value(key, value) } else { value.clone() };
            println!("  {key}={value}");
        }
    }

    print_warnings(&plan.warnings);
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

/// Run a lifecycle command against the selected engine.
fn cmd_lifecycle(path: &Path, command: Lifecycle, engine: EngineKind, state_dir: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config, state_dir)?;
    let project = analyze_project(path)?;

    let rt = tokio::runtime::Runtime::new()?;
    match engine {
        EngineKind::Docker => {
            let mut orchestrator = Orchestrator::new(DockerCli::new(config.engine.binary.clone()), store)?;
            if config.ports.probe_host {
                orchestrator = orchestrator.with_port_probe(TcpProbe);
            }
            rt.block_on(run_lifecycle(orchestrator, &config, &project, command))
        }
        EngineKind::Memory => {
            let orchestrator = Orchestrator::new(MemoryEngine::new(), store)?;
            rt.block_on(run_lifecycle(orchestrator, &config, &project, command))
        }
    }
}

async fn run_lifecycle<E: ContainerEngine>(
    mut orchestrator: Orchestrator<E>,
    config: &Config,
    project: &Project,
    command: Lifecycle,
) -> Result<()> {
    tracing::debug!(engine = orchestrator.engine().name(), project = %project.name, "Running lifecycle command");

    match command {
        Lifecycle::Up { selection, sequential, pull } => {
            let options = OrchestratorOptions {
                parallel: config.general.parallel && !sequential,
                pull: pull.unwrap_or(config.engine.pull),
                ..OrchestratorOptions::default()
            };

            let cancel = CancelToken::new();
            let handler = cancel.clone();
            ctrlc::set_handler(move || handler.cancel()).context("Failed to install Ctrl-C handler")?;
            let mut orchestrator = orchestrator.with_options(options).with_cancel(cancel);

            let (blueprint, project_env) = load_blueprint(&project.path, &selection)?;
            let plan = orchestrator.plan(&blueprint, project_env)?;
            print_warnings(&plan.warnings);

            let record = orchestrator.apply(&plan).await?;
            print_running(&record);
        }
        Lifecycle::Status { format } => {
            let report = orchestrator.status(project).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Format::Text => print_status(&report),
            }
        }
        Lifecycle::Stop => {
            orchestrator.stop(project).await?;
            println!("Stack {} stopped", project.name);
        }
        Lifecycle::Down { volumes } => {
            if orchestrator.destroy(project, volumes).await? {
                println!("Stack {} removed", project.name);
            } else {
                println!("No stack for {}", project.name);
            }
        }
    }

    Ok(())
}

fn print_running(record: &StackRecord) {
    println!("Stack {} is {}", record.project_name, record.status);
    for instance in &record.plan.instances {
        println!("  {:<24} {:<28} localhost:{}", instance.name, instance.image, instance.host_port);
    }
}

fn print_status(report: &StatusReport) {
    println!("Stack {} is {}", report.project, report.status);
    for instance in &report.instances {
        let state = match &instance.state {
            Some(state) => state.status.to_string(),
            None => "missing".to_string(),
        };
        println!("  {:<24} {:<10} localhost:{}", instance.name, state, instance.host_port);
    }
}

/// List every recorded stack.
fn cmd_ls(format: Format, state_dir: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    let store = open_store(&config, state_dir)?;
    let report = store.load()?;

    match format {
        Format::Json => {
            let stacks: Vec<_> = report
                .records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "name": r.project_name,
                        "path": r.project_path,
                        "status": r.status,
                        "ports": r.plan.instances.iter().map(|i| i.host_port).collect::<Vec<_>>(),
                        "updated_at": r.updated_at,
                    })
                })
                .collect();
            let corrupt: Vec<_> = report
                .corrupt
                .iter()
                .map(|c| serde_json::json!({ "path": c.path, "error": c.error }))
                .collect();
            let json = serde_json::json!({ "stacks": stacks, "corrupt": corrupt });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        Format::Text => {
            if report.records.is_empty() {
                println!("No stacks");
            }
            for record in &report.records {
                let ports: Vec<_> = record.plan.instances.iter().map(|i| i.host_port.to_string()).collect();
                println!(
                    "{:<20} {:<12} {:<20} {}",
                    record.project_name,
                    record.status,
                    ports.join(","),
                    record.project_path.display()
                );
            }
            for corrupt in &report.corrupt {
                eprintln!("warning: unreadable record {}: {}", corrupt.path.display(), corrupt.error);
            }
        }
    }

    Ok(())
}

/// Show configuration.
fn cmd_config(show_path: bool, init: bool) -> Result<()> {
    if init {
        if let Some(path) = Config::config_path().filter(|p| p.exists()) {
            println!("Config already exists at {}", path.display());
            return Ok(());
        }
        let path = Config::default().save()?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    if show_path {
        if let Some(path) = Config::config_path() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load()?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "devstack", &mut io::stdout());
}
