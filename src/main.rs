//! Stratum CLI entrypoint.
//!
//! This is the main entrypoint for the stratum command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stratum::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use stratum::config::{ConfigParser, ConfigValidator, StackConfig, find_config_file};
use stratum::engine::{Engine, base_dir_of};
use stratum::error::Result;
use stratum::provider::ProviderRegistry;
use stratum::state::{LocalStateStore, StateStore, generate_holder_id};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply {
            yes,
            max_concurrency,
        } => cmd_apply(cli.config.as_ref(), yes, max_concurrency, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(cli.config.as_ref(), yes, &formatter).await,
        Commands::Outputs { name } => cmd_outputs(cli.config.as_ref(), name, &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stratum.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stratum.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".stratum/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stratum")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.stratum/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your provider tokens");
    eprintln!("  2. Edit stratum.yaml to describe your resources");
    eprintln!("  3. Run 'stratum validate' to check the stack");
    eprintln!("  4. Run 'stratum plan' to see what will change");
    eprintln!("  5. Run 'stratum apply' to provision it");

    Ok(ExitCode::SUCCESS)
}

/// Validate the stack file.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, base_dir) = load_config(config_path)?;
    let result = ConfigValidator::new().check(&config);

    emit(formatter, &formatter.format_validation(&result, show_warnings));

    if !result.is_valid() {
        return Ok(ExitCode::FAILURE);
    }

    if !formatter.is_json() {
        eprintln!("\nStack summary:");
        eprintln!("  Stack: {}", config.stack.name);
        eprintln!("  Environment: {}", config.stack.environment);
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Providers: {}", config.providers.len());
        eprintln!("  Outputs: {}", config.outputs.len());
        eprintln!("  State: {}", config.state_dir(&base_dir).display());
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, base_dir) = load_config(config_path)?;
    let store = state_store(&config, &base_dir);
    let engine = Engine::new(&config, &store, ProviderRegistry::new()).with_base_dir(&base_dir);

    let plan = engine.plan().await?;
    emit(formatter, &formatter.format_plan(&plan, detailed));

    Ok(ExitCode::SUCCESS)
}

/// Apply the stack.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    max_concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (mut config, base_dir) = load_config(config_path)?;
    if max_concurrency.is_some() {
        config.scheduler.max_concurrency = max_concurrency;
    }

    let store = state_store(&config, &base_dir);
    let registry = ProviderRegistry::from_config(&config)?;
    let engine = Engine::new(&config, &store, registry).with_base_dir(&base_dir);

    let plan = engine.plan().await?;
    if plan.is_noop() {
        eprintln!("No changes to apply.");
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&plan, false));
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_ctrl_c();
    let report = engine.apply(cancel).await?;
    emit(formatter, &formatter.format_apply(&report));

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        report_failures(&report.run.failed_names());
        Ok(ExitCode::FAILURE)
    }
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, base_dir) = load_config(config_path)?;
    let store = state_store(&config, &base_dir);
    let registry = ProviderRegistry::from_config(&config)?;
    let engine = Engine::new(&config, &store, registry).with_base_dir(&base_dir);

    let state = engine.load_state().await?;
    if state.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for record in state.resources.values() {
        eprintln!(
            "  - {} ({}, {})",
            record.name,
            record.kind,
            record.id.as_deref().unwrap_or("no id")
        );
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_ctrl_c();
    let report = engine.destroy(cancel).await?;
    emit(formatter, &formatter.format_destroy(&report));

    if report.run.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        report_failures(&report.run.failed_names());
        Ok(ExitCode::FAILURE)
    }
}

/// Show exported outputs.
async fn cmd_outputs(
    config_path: Option<&PathBuf>,
    name: Option<String>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, base_dir) = load_config(config_path)?;
    let store = state_store(&config, &base_dir);
    let engine = Engine::new(&config, &store, ProviderRegistry::new()).with_base_dir(&base_dir);

    let outputs = engine.outputs().await?;

    let Some(name) = name else {
        emit(formatter, &formatter.format_outputs(&outputs));
        return Ok(ExitCode::SUCCESS);
    };

    match outputs.get(&name) {
        Some(serde_json::Value::String(s)) => println!("{s}"),
        Some(value) => println!("{value}"),
        None => {
            eprintln!("No output named '{name}'.");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, base_dir) = load_config(config_path)?;
    let store = state_store(&config, &base_dir);

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                let lock = store.get_lock_info().await?;
                emit(formatter, &formatter.format_state(&state, lock.as_ref()));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            emit(formatter, &formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env` and the stack file with environment overrides.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let base_dir = base_dir_of(&config_file);
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Creates the state store configured for the stack.
fn state_store(config: &StackConfig, base_dir: &Path) -> LocalStateStore {
    LocalStateStore::with_base_dir(config.state_dir(base_dir))
}

/// Returns a token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight resources and stopping");
            trigger.cancel();
        }
    });

    token
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes formatted output; JSON goes to stdout for scripting.
fn emit(formatter: &OutputFormatter, output: &str) {
    if formatter.is_json() {
        println!("{output}");
    } else {
        eprintln!("{output}");
    }
}

/// Lists resources that did not converge on stderr.
fn report_failures(names: &[&str]) {
    for name in names {
        eprintln!("not converged: {name}");
    }
}
