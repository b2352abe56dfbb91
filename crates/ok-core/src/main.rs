//! OpsKernel agent
//!
//! The main entry point for the `opskernel` binary:
//! - `serve` runs the plugin API, gateway and reconcile loop
//! - `validate` checks a plugin directory's manifest
//! - `check-version` prints a plugin directory's manifest version

use clap::{Args, Parser, Subcommand};
use ok_config::{AgentConfig, ConfigOverrides, DockerSettings};
use ok_core::api::{create_router, AppState};
use ok_core::auth::TokenAuthority;
use ok_core::docker::EngineClient;
use ok_core::exit_codes::ExitCode;
use ok_core::logging::{event_names, init_logging, LogConfig, LogFormat, LogLevel, Stage};
use ok_core::plugin::{detect_manifest_version, load_manifest, ManifestError, PluginManager, PluginPolicy, Registry, Store};
use ok_core::runtime::Runtime;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// OpsKernel agent - Docker-backed plugin host
#[derive(Parser)]
#[command(name = "opskernel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Serve(ServeArgs),

    /// Validate a plugin directory's manifest
    Validate(ValidateArgs),

    /// Print a plugin directory's manifest version ("1", "2", or as written)
    CheckVersion(CheckVersionArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding one subdirectory per plugin
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Directory for persisted plugin state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Policy preset (default, strict)
    #[arg(long)]
    policy: Option<String>,

    /// Seconds between reconcile passes
    #[arg(long)]
    reconcile_interval: Option<u64>,

    /// URL plugin containers use to reach the agent
    #[arg(long, env = "OPSKERNEL_AGENT_URL")]
    agent_url: Option<String>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Plugin directory containing manifest.json or plugin.json
    dir: PathBuf,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CheckVersionArgs {
    /// Plugin directory containing manifest.json or plugin.json
    dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(cli.global.log_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match cli.command {
        Commands::Serve(args) => run_serve(&args),
        Commands::Validate(args) => run_validate(&args),
        Commands::CheckVersion(args) => run_check_version(&args),
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// serve
// ============================================================================

fn run_serve(args: &ServeArgs) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::InternalError;
        }
    };
    runtime.block_on(serve(args))
}

async fn serve(args: &ServeArgs) -> ExitCode {
    let overrides = ConfigOverrides {
        plugins_dir: args.plugins_dir.clone(),
        data_dir: args.data_dir.clone(),
        port: args.port,
        policy: args.policy.clone(),
        reconcile_interval_secs: args.reconcile_interval,
    };
    let config = match AgentConfig::resolve(&overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(stage = %Stage::Init, error = %e, "invalid configuration");
            return ExitCode::ConfigError;
        }
    };
    let secret = match config.require_jwt_secret() {
        Ok(secret) => secret.to_string(),
        Err(e) => {
            error!(stage = %Stage::Init, error = %e, "invalid configuration");
            return ExitCode::ConfigError;
        }
    };
    let docker_settings = match DockerSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(stage = %Stage::Init, error = %e, "invalid Docker settings");
            return ExitCode::ConfigError;
        }
    };
    if docker_settings.read_only {
        warn!(stage = %Stage::Init, "Docker read-only mode: container mutations are refused");
    }

    let legacy = config.legacy_enabled_file();
    let store = match Store::open(config.state_file(), Some(legacy.as_path())) {
        Ok(store) => store,
        Err(e) => {
            error!(stage = %Stage::Store, error = %e, "failed to open plugin state");
            return ExitCode::FileError;
        }
    };

    let tokens = TokenAuthority::new(secret.as_bytes());
    let mut manager = PluginManager::new(
        Registry::new(&config.plugins_dir),
        store,
        PluginPolicy::from_preset(config.policy),
        Runtime::new(Arc::new(EngineClient::new(docker_settings))),
    )
    .with_tokens(tokens.clone());
    if let Some(url) = &args.agent_url {
        manager = manager.with_agent_url(url.clone());
    }

    if let Err(e) = manager.load().await {
        error!(stage = %Stage::Registry, error = %e, "failed to load plugins");
        return ExitCode::FileError;
    }
    let manager = Arc::new(manager);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let reconciler = manager.spawn_reconciler(config.reconcile_interval, shutdown_rx);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(stage = %Stage::Init, port = config.port, error = %e, "failed to bind listener");
            let _ = shutdown_tx.send(());
            return ExitCode::InternalError;
        }
    };
    info!(
        event = event_names::AGENT_STARTED,
        stage = %Stage::Init,
        port = config.port,
        plugins = manager.registry().count(),
        policy = %config.policy,
        plugins_dir = %config.plugins_dir.display(),
        "agent started"
    );

    let app = create_router(AppState::new(Arc::clone(&manager), tokens));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Containers keep running under their restart policy.
    info!(event = event_names::AGENT_STOPPING, stage = %Stage::Init, "agent stopping");
    let _ = shutdown_tx.send(());
    if let Err(e) = reconciler.await {
        warn!(error = %e, "reconcile task ended abnormally");
    }

    match served {
        Ok(()) => ExitCode::Ok,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::InternalError
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers, waiting for ctrl-c");
            }
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to wait for ctrl-c");
    }
}

// ============================================================================
// validate
// ============================================================================

fn run_validate(args: &ValidateArgs) -> ExitCode {
    let result = load_manifest(&args.dir);
    let exit_code = match &result {
        Ok(_) => ExitCode::Ok,
        Err(ManifestError::NotFound { .. } | ManifestError::Io { .. }) => ExitCode::FileError,
        Err(_) => ExitCode::ValidationFailed,
    };

    if args.json {
        let output = match &result {
            Ok(loaded) => serde_json::json!({
                "valid": true,
                "name": loaded.manifest.name,
                "version": loaded.manifest.version,
                "path": loaded.path.display().to_string(),
                "deprecationWarning": loaded.deprecation_warning(),
                "errors": [],
            }),
            Err(e) => {
                let errors = match e {
                    ManifestError::Invalid { errors, .. } => serde_json::to_value(errors)
                        .unwrap_or_else(|_| serde_json::json!([])),
                    other => serde_json::json!([{ "path": "", "message": other.to_string() }]),
                };
                serde_json::json!({
                    "valid": false,
                    "path": e.path().display().to_string(),
                    "errors": errors,
                    "exitCode": exit_code.code_name(),
                })
            }
        };
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("failed to render result: {}", e);
                return ExitCode::InternalError;
            }
        }
        return exit_code;
    }

    match &result {
        Ok(loaded) => {
            println!(
                "✓ {} {} ({})",
                loaded.manifest.name,
                loaded.manifest.version,
                loaded.path.display()
            );
            if let Some(warning) = loaded.deprecation_warning() {
                println!("  warning: {}", warning);
            }
        }
        Err(ManifestError::Invalid { path, errors }) => {
            eprintln!("✗ {}: {} problem(s)", path.display(), errors.len());
            for e in errors {
                eprintln!("  - {}", e);
            }
        }
        Err(e) => eprintln!("✗ {}", e),
    }
    exit_code
}

// ============================================================================
// check-version
// ============================================================================

fn run_check_version(args: &CheckVersionArgs) -> ExitCode {
    match detect_manifest_version(&args.dir) {
        Ok(version) => {
            println!("{}", version);
            ExitCode::Ok
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FileError
        }
    }
}
