//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, OutputFormatter, StateCommands};
use converge::config::{
    find_config_file, ConfigParser, ConfigValidator, Description, FailureMode, ResourceKey,
    StateBackend,
};
use converge::engine::{build_graph, Engine};
use converge::error::{ApplyError, ConfigError, ConvergeError, Result};
use converge::planner::{ApplyReport, ExecutorSettings};
use converge::provider::{HttpProvider, Provider};
use converge::state::{
    generate_holder_id, LocalStateStore, S3StateStore, StateStore, STATE_DIR,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply {
            yes,
            best_effort,
            concurrency,
        } => cmd_apply(config, yes, best_effort, concurrency, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Reconcile { max_attempts } => {
            cmd_reconcile(config, max_attempts, &formatter).await
        }
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Write a starter stack description.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("converge.stack.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let template = include_str!("../templates/converge.stack.yaml");
    std::fs::write(&config_path, template)?;
    eprintln!("Created: {}", config_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(&state_entry) || !existing.contains(".env") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(&state_entry) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!(
        "  1. Set provider.endpoint (or CONVERGE_PROVIDER_ENDPOINT) and CONVERGE_PROVIDER_TOKEN"
    );
    eprintln!("  2. Run 'converge validate' to check the description");
    eprintln!("  3. Run 'converge plan' to see what will change");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(())
}

/// Validate the description and its graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack description: {}", config_file.display());

    let description = load_description(&config_file)?;
    let result = ConfigValidator::new().validate(&description)?;
    let graph = build_graph(&description)?;

    println!("{}", formatter.format_validation(&result, &graph, show_warnings));
    Ok(())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (description, engine) = load_engine(config_path, CancellationToken::new()).await?;

    let plan = engine.plan(&description).await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    best_effort: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (description, engine) = load_engine(config_path, cancel).await?;

    let mut settings = ExecutorSettings::from(&description.execution);
    if best_effort {
        settings.on_failure = FailureMode::BestEffort;
    }
    if let Some(concurrency) = concurrency {
        settings.concurrency = concurrency.max(1);
    }
    let engine = engine.with_settings(settings);

    let plan = engine.plan(&description).await?;
    if plan.is_empty() {
        println!("{}", formatter.format_plan(&plan, false));
        return Ok(());
    }

    println!("{}", formatter.format_plan(&plan, false));
    if !auto_approve && !confirm("Do you want to apply this plan?")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let report = engine.apply(&plan).await?;
    println!("{}", formatter.format_report(&report));
    into_result(&report)
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (description, engine) = load_engine(config_path, cancel).await?;

    let plan = engine.plan_destroy(&description).await?;
    println!("{}", formatter.format_plan(&plan, false));
    if plan.is_empty() {
        return Ok(());
    }

    if !auto_approve
        && !confirm(&format!(
            "This will destroy every resource of {}/{}. Continue?",
            description.stack.name, description.stack.environment
        ))?
    {
        eprintln!("Destroy cancelled.");
        return Ok(());
    }

    let report = engine.apply(&plan).await?;
    println!("{}", formatter.format_report(&report));
    into_result(&report)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (description, engine) = load_engine(config_path, CancellationToken::new()).await?;

    let report = engine.check_drift(&description).await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// Plan and apply until converged.
async fn cmd_reconcile(
    config_path: Option<&Path>,
    max_attempts: usize,
    formatter: &OutputFormatter,
) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let (description, engine) = load_engine(config_path, cancel).await?;

    let result = engine.reconcile(&description, max_attempts).await?;
    println!("{}", formatter.format_reconciliation(&result));

    if result.converged {
        Ok(())
    } else {
        Err(ConvergeError::Apply(ApplyError::Aborted {
            reason: format!("not converged after {} pass(es)", result.attempts),
        }))
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let description = load_description(&config_file)?;
    let store = build_store(&description, &config_file).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                let lock = store.get_lock_info().await?;
                println!("{}", formatter.format_state(&state, lock.as_ref()));
            } else {
                println!("{}", formatter.message("warning", "No state found."));
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            let message = format!("State locked: {} (holder {})", lock.lock_id, lock.holder);
            println!("{}", formatter.message("success", &message));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                println!("{}", formatter.message("success", "State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.message("success", "State unlocked."));
            } else {
                println!(
                    "{}",
                    formatter.message("error", "Please provide --lock-id or use --force")
                );
            }
        }
        StateCommands::ClearPending { key } => {
            let key = ResourceKey::parse(&key)
                .map_err(|e| ConvergeError::Config(ConfigError::validation(e, "key")))?;
            if store.abandon(&key).await? {
                warn!("Cleared interrupted operation for {key}");
                let message = format!("Cleared pending operation for {key}.");
                println!("{}", formatter.message("success", &message));
            } else {
                let message = format!("No pending operation for {key}.");
                println!("{}", formatter.message("warning", &message));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the description file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the description, honouring `.env` and overrides.
fn load_description(config_file: &Path) -> Result<Description> {
    debug!("Loading stack description from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(config_file));
    parser.load_dotenv()?;

    let description = parser.load_with_env(config_file)?;
    let result = ConfigValidator::new().validate(&description)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok(description)
}

/// Loads the description and wires an engine for it.
async fn load_engine(
    config_path: Option<&Path>,
    cancel: CancellationToken,
) -> Result<(Description, Engine)> {
    let config_file = resolve_config_path(config_path)?;
    let description = load_description(&config_file)?;

    let store = build_store(&description, &config_file).await?;
    let provider = build_provider(&description)?;
    let engine = Engine::new(store, provider)
        .with_settings(ExecutorSettings::from(&description.execution))
        .with_cancellation(cancel);

    Ok((description, engine))
}

/// Creates the state store the description asks for.
async fn build_store(description: &Description, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match description.state.backend {
        StateBackend::Local => {
            let base = description.state.path.as_ref().map_or_else(
                || config_dir(config_file).join(STATE_DIR),
                |p| config_dir(config_file).join(p),
            );
            Arc::new(LocalStateStore::with_base_dir(base))
        }
        StateBackend::S3 => {
            let bucket = description.state.bucket.as_deref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation(
                    "S3 backend requires a bucket",
                    "state.bucket",
                ))
            })?;
            Arc::new(
                S3StateStore::new(
                    bucket,
                    description.state.prefix.as_deref(),
                    description.state.region.as_deref(),
                )
                .await,
            )
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the REST provider for the configured endpoint.
fn build_provider(description: &Description) -> Result<Arc<dyn Provider>> {
    let endpoint = description.provider.endpoint.as_deref().ok_or_else(|| {
        ConvergeError::Config(ConfigError::validation(
            "no provider endpoint configured (set provider.endpoint or CONVERGE_PROVIDER_ENDPOINT)",
            "provider.endpoint",
        ))
    })?;
    let token = ConfigParser::get_provider_token().ok();
    if token.is_none() {
        debug!("No provider token set; calling {endpoint} unauthenticated");
    }

    let provider = HttpProvider::with_timeout(endpoint, token, description.provider.timeout_secs)?;
    Ok(Arc::new(provider))
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations to finish");
            trigger.cancel();
        }
    });
    token
}

/// Asks for confirmation on stderr.
fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Maps an incomplete run to a failing exit status.
fn into_result(report: &ApplyReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }
    let reason = report.failure_summary().unwrap_or_else(|| {
        if report.cancelled {
            String::from("cancelled")
        } else {
            String::from("some resources were not applied")
        }
    });
    Err(ConvergeError::Apply(ApplyError::Aborted { reason }))
}
