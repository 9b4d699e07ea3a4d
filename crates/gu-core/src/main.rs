//! General Update Core - crash-resilient updater
//!
//! The main entry point for gu-core, handling:
//! - Update sessions (fetch, verify, backup, apply, launch)
//! - Supervision of the relaunched application
//! - The recovery agent and operator-triggered restores
//! - The restore endpoint
//! - Journal, flag and configuration inspection

use clap::{Args, Parser, Subcommand};
use gu_common::{Error, OutputFormat, SessionId, StructuredError, TargetId, STATE_SCHEMA_VERSION};
use gu_config::{load_config, validate_config, ConfigSnapshot, LoadedConfig, UpdaterConfig};
use gu_core::events::JsonlWriter;
use gu_core::exit_codes::ExitCode;
use gu_core::logging::{event_names, init_logging, LogConfig, LogFormat, LogLevel};
use gu_core::platform::{LaunchOutcome, LaunchRequest, PlatformStrategy, ProcessHandle};
use gu_core::recovery::CycleOutcome;
use gu_core::watchdog::WatchOutcome;
use gu_core::{
    source, CancelToken, FailureFlag, Journal, RecoveryAgent, SessionOutcome, StateStore,
    UpdateEngine, Watchdog,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// General Update Core - crash-resilient update and rollback
#[derive(Parser)]
#[command(name = "gu-core")]
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
    /// Path to updater.json
    #[arg(long, global = true, env = "GU_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Override the state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one update session
    Update(UpdateArgs),

    /// Supervise a running application
    Watch(WatchArgs),

    /// Run the recovery agent
    Agent(AgentArgs),

    /// Restore the previous installation now
    Restore(RestoreArgs),

    /// Serve the restore endpoint
    #[cfg(feature = "server")]
    Serve(ServeArgs),

    /// Inspect the rollback journal
    Journal(JournalArgs),

    /// Inspect or clear the failure flag
    Flag(FlagArgs),

    /// Configuration management
    Config(ConfigArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Apply without starting the application
    #[arg(long)]
    no_launch: bool,

    /// Start the application but do not supervise it
    #[arg(long)]
    no_watch: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Attach to an already running process
    #[arg(
        long,
        conflicts_with = "exec",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(i32::MAX))
    )]
    pid: Option<u32>,

    /// Start this executable and supervise it (default: the configured main executable)
    #[arg(long)]
    exec: Option<PathBuf>,

    /// Arguments passed to the started executable
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Run a single cycle over every target and exit
    #[arg(long)]
    once: bool,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Raise the flag first so a restore runs even without a recorded failure
    #[arg(long)]
    force: bool,
}

#[cfg(feature = "server")]
#[derive(Args, Debug)]
struct ServeArgs {
    /// Bind address (default: server.bind from the configuration)
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Args, Debug)]
struct JournalArgs {
    #[command(subcommand)]
    command: JournalCommands,
}

#[derive(Subcommand, Debug)]
enum JournalCommands {
    /// Show the live journal
    Show,
}

#[derive(Args, Debug)]
struct FlagArgs {
    #[command(subcommand)]
    command: FlagCommands,
}

#[derive(Subcommand, Debug)]
enum FlagCommands {
    /// Show the flag state and the failure record
    Show,
    /// Force the flag back to clear without restoring
    Clear,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate the configuration
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.global.quiet {
        LogLevel::Error
    } else {
        LogLevel::Info.more_verbose(cli.global.verbose)
    };
    let log_format = if cli.global.format.is_machine() {
        LogFormat::Jsonl
    } else {
        LogFormat::Human
    };
    init_logging(&LogConfig::from_env(Some(log_level), Some(log_format)));
    gu_core::signals::install_shutdown_handler();

    let exit_code = match cli.command {
        Commands::Update(args) => run_update(&cli.global, &args),
        Commands::Watch(args) => run_watch(&cli.global, &args),
        Commands::Agent(args) => run_agent(&cli.global, &args),
        Commands::Restore(args) => run_restore(&cli.global, &args),
        #[cfg(feature = "server")]
        Commands::Serve(args) => run_serve(&cli.global, &args),
        Commands::Journal(args) => run_journal(&cli.global, &args),
        Commands::Flag(args) => run_flag(&cli.global, &args),
        Commands::Config(args) => run_config(&cli.global, &args),
        Commands::Version => {
            print_version(&cli.global);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load(global: &GlobalOpts) -> Result<LoadedConfig, ExitCode> {
    let mut loaded = match load_config(global.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(target: event_names::CONFIG_ERROR, code = e.code(), "{}", e);
            output_error(global, &Error::Config(e.to_string()));
            return Err(ExitCode::ConfigError);
        }
    };
    if let Some(dir) = &global.state_dir {
        loaded.config.paths.state_dir = Some(dir.clone());
    }
    info!(
        target: event_names::CONFIG_LOADED,
        source = %loaded.source,
        path = ?loaded.path,
        "configuration loaded"
    );
    Ok(loaded)
}

fn load_valid(global: &GlobalOpts) -> Result<UpdaterConfig, ExitCode> {
    let loaded = load(global)?;
    if let Err(e) = validate_config(&loaded.config) {
        output_error(global, &Error::InvalidConfig(e.to_string()));
        return Err(ExitCode::ConfigError);
    }
    Ok(loaded.config)
}

fn strategy(global: &GlobalOpts) -> Result<PlatformStrategy, ExitCode> {
    PlatformStrategy::for_host().map_err(|e| {
        let err: Error = e.into();
        output_error(global, &err);
        ExitCode::for_error(&err)
    })
}

fn target_of(config: &UpdaterConfig) -> TargetId {
    TargetId::for_install(&config.app.name, &config.paths.install_dir)
}

fn fail(global: &GlobalOpts, err: impl Into<Error>) -> ExitCode {
    let err = err.into();
    output_error(global, &err);
    ExitCode::for_error(&err)
}

fn output_error(global: &GlobalOpts, err: &Error) {
    if global.format.is_machine() {
        eprintln!("{}", StructuredError::from(err).to_json());
    } else {
        eprintln!("{}", err.to_human());
    }
}

/// Print a command payload on stdout.
fn print_payload<T: Serialize>(global: &GlobalOpts, command: &str, payload: &T, human: impl FnOnce() -> String) {
    match global.format {
        OutputFormat::Human => println!("{}", human()),
        OutputFormat::Json | OutputFormat::Jsonl => {
            let response = serde_json::json!({
                "schema_version": STATE_SCHEMA_VERSION,
                "command": command,
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "result": payload,
            });
            let text = if global.format == OutputFormat::Json {
                serde_json::to_string_pretty(&response)
            } else {
                serde_json::to_string(&response)
            };
            match text {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("failed to serialize {} output: {}", command, e),
            }
        }
    }
}

fn shutdown_token() -> CancelToken {
    CancelToken::linked_to(gu_core::signals::shutdown_flag())
}

// ============================================================================
// update
// ============================================================================

fn run_update(global: &GlobalOpts, args: &UpdateArgs) -> ExitCode {
    let config = match load_valid(global) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let strategy = match strategy(global) {
        Ok(strategy) => strategy,
        Err(code) => return code,
    };

    let source = source::from_config(&config.source);
    let mut engine = UpdateEngine::new(config.clone(), strategy, source);
    if args.no_launch {
        engine = engine.without_launch();
    }
    if global.format == OutputFormat::Jsonl {
        engine.register_observer(Arc::new(JsonlWriter::new(std::io::stdout())));
    }

    let cancel = shutdown_token();
    let mut report = engine.run(&cancel);
    let process = report.process.take();

    print_payload(global, "update", &report, || match report.outcome {
        SessionOutcome::Succeeded => match &report.to_version {
            Some(to) => format!("Updated {} from {} to {}", report.target_id, report.from_version, to),
            None => format!("{} is up to date ({})", report.target_id, report.from_version),
        },
        SessionOutcome::Aborted(reason) => format!(
            "Update aborted ({}): {}",
            reason,
            report.error.as_deref().unwrap_or("unknown error")
        ),
    });

    match report.outcome {
        SessionOutcome::Aborted(gu_core::AbortReason::RecoveryPending) => {
            return ExitCode::RecoveryPending
        }
        SessionOutcome::Aborted(gu_core::AbortReason::SessionBusy) => return ExitCode::LockError,
        SessionOutcome::Aborted(_) => return ExitCode::Aborted,
        SessionOutcome::Succeeded => {}
    }

    match process {
        Some(handle) if !args.no_watch && config.watchdog.enabled => {
            let version = report
                .to_version
                .clone()
                .unwrap_or_else(|| report.from_version.clone());
            let watchdog = Watchdog::new(engine.store(), &config)
                .with_shutdown(cancel)
                .with_version(&config.app.name, &version);
            supervise(global, &watchdog, &report.target_id, handle)
        }
        _ => ExitCode::Clean,
    }
}

// ============================================================================
// watch
// ============================================================================

fn run_watch(global: &GlobalOpts, args: &WatchArgs) -> ExitCode {
    let config = match load_valid(global) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let target = target_of(&config);
    let store = StateStore::new(config.state_dir());

    let handle = match args.pid {
        Some(pid) => ProcessHandle::external(
            pid,
            config.main_executable_path(),
            config.paths.install_dir.clone(),
        ),
        None => {
            let strategy = match strategy(global) {
                Ok(strategy) => strategy,
                Err(code) => return code,
            };
            let request = LaunchRequest {
                executable: args
                    .exec
                    .clone()
                    .unwrap_or_else(|| config.main_executable_path()),
                args: if args.args.is_empty() {
                    config.app.launch_args.clone()
                } else {
                    args.args.clone()
                },
                working_dir: config.paths.install_dir.clone(),
                launch_script: config.app.launch_script.clone(),
                output_dir: Some(config.diagnostics_dir().join(target.as_str()).join("output")),
            };
            match strategy.launch(&request) {
                Ok(LaunchOutcome::Started(handle)) => handle,
                Ok(LaunchOutcome::Deferred) => {
                    info!("launch deferred to the host application; nothing to supervise");
                    return ExitCode::Clean;
                }
                Err(e) => return fail(global, e),
            }
        }
    };

    let watchdog = Watchdog::new(&store, &config).with_shutdown(shutdown_token());
    supervise(global, &watchdog, &target, handle)
}

fn supervise(global: &GlobalOpts, watchdog: &Watchdog, target: &TargetId, handle: ProcessHandle) -> ExitCode {
    match watchdog.supervise(target, handle) {
        Ok(WatchOutcome::NormalExit { code }) => {
            print_payload(
                global,
                "watch",
                &serde_json::json!({"target_id": target, "outcome": "normal_exit", "code": code}),
                || format!("{} exited normally (code {:?})", target, code),
            );
            ExitCode::Clean
        }
        Ok(WatchOutcome::Stopped) => {
            print_payload(
                global,
                "watch",
                &serde_json::json!({"target_id": target, "outcome": "stopped"}),
                || format!("stopped supervising {}", target),
            );
            ExitCode::Clean
        }
        Ok(WatchOutcome::Failed { record }) => {
            print_payload(
                global,
                "watch",
                &serde_json::json!({"target_id": target, "outcome": "failed", "record": record}),
                || format!("{} failed: {}; failure flag raised", target, record.exit_reason),
            );
            ExitCode::TargetCrashed
        }
        Err(e) => fail(global, e),
    }
}

// ============================================================================
// agent / restore
// ============================================================================

fn run_agent(global: &GlobalOpts, args: &AgentArgs) -> ExitCode {
    let config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(code) => return code,
    };
    let strategy = match strategy(global) {
        Ok(strategy) => strategy,
        Err(code) => return code,
    };
    let store = StateStore::new(config.state_dir());
    let agent = RecoveryAgent::new(&store, &strategy)
        .with_poll_interval(Duration::from_secs(config.recovery.poll_interval_secs.max(1)));

    if !args.once {
        agent.run_forever(gu_core::signals::shutdown_flag());
        return ExitCode::Clean;
    }

    match agent.run_all() {
        Ok(results) => {
            let failed = results
                .iter()
                .any(|(_, outcome)| matches!(outcome, CycleOutcome::Failed { .. }));
            let rows: Vec<serde_json::Value> = results
                .iter()
                .map(|(target, outcome)| cycle_json(target, outcome))
                .collect();
            print_payload(global, "agent", &rows, || {
                results
                    .iter()
                    .map(|(target, outcome)| format!("{}: {:?}", target, outcome))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            if failed {
                ExitCode::RestoreFailed
            } else {
                ExitCode::Clean
            }
        }
        Err(e) => fail(global, e),
    }
}

fn run_restore(global: &GlobalOpts, args: &RestoreArgs) -> ExitCode {
    let config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(code) => return code,
    };
    let strategy = match strategy(global) {
        Ok(strategy) => strategy,
        Err(code) => return code,
    };
    let store = StateStore::new(config.state_dir());
    let target = target_of(&config);
    let agent = RecoveryAgent::new(&store, &strategy);

    if args.force {
        if let Err(e) = agent.request_restore(&target) {
            return fail(global, e);
        }
    }

    match agent.run_cycle(&target) {
        Ok(outcome) => {
            print_payload(global, "restore", &cycle_json(&target, &outcome), || {
                format!("{}: {:?}", target, outcome)
            });
            match outcome {
                CycleOutcome::Idle | CycleOutcome::Restored { .. } => ExitCode::Clean,
                CycleOutcome::Busy => ExitCode::LockError,
                CycleOutcome::Failed { .. } => ExitCode::RestoreFailed,
            }
        }
        Err(e) => fail(global, e),
    }
}

fn cycle_json(target: &TargetId, outcome: &CycleOutcome) -> serde_json::Value {
    match outcome {
        CycleOutcome::Idle => serde_json::json!({"target_id": target, "outcome": "idle"}),
        CycleOutcome::Busy => serde_json::json!({"target_id": target, "outcome": "busy"}),
        CycleOutcome::Restored { batches, operations } => serde_json::json!({
            "target_id": target,
            "outcome": "restored",
            "batches": batches,
            "operations": operations,
        }),
        CycleOutcome::Failed { error, remaining } => serde_json::json!({
            "target_id": target,
            "outcome": "failed",
            "error": error,
            "remaining": remaining,
        }),
    }
}

// ============================================================================
// serve
// ============================================================================

#[cfg(feature = "server")]
fn run_serve(global: &GlobalOpts, args: &ServeArgs) -> ExitCode {
    use gu_core::server::RestoreServer;

    let config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(code) => return code,
    };
    let strategy = match strategy(global) {
        Ok(strategy) => strategy,
        Err(code) => return code,
    };
    let bind = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let store = StateStore::new(config.state_dir());

    match RestoreServer::start(&bind, store, config.backup_dir(), Arc::new(strategy)) {
        Ok(server) => {
            info!(addr = %server.addr(), "serving POST /restore until interrupted");
            server.run_until(gu_core::signals::shutdown_flag());
            ExitCode::Clean
        }
        Err(message) => {
            output_error(global, &Error::Config(message));
            ExitCode::IoError
        }
    }
}

// ============================================================================
// journal / flag
// ============================================================================

fn run_journal(global: &GlobalOpts, args: &JournalArgs) -> ExitCode {
    let config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(code) => return code,
    };
    let store = StateStore::new(config.state_dir());
    let target = target_of(&config);

    match args.command {
        JournalCommands::Show => match Journal::open(&store, &target) {
            Ok(journal) => {
                let snapshot = journal.snapshot();
                print_payload(global, "journal show", snapshot, || {
                    let mut lines = vec![format!(
                        "Journal for {} ({} batch(es))",
                        target,
                        snapshot.batches.len()
                    )];
                    for entry in snapshot.batches.iter().rev() {
                        lines.push(format!(
                            "  {} [{}] {} operation(s), committed {}",
                            entry.id,
                            entry.stage,
                            entry.operations.len(),
                            entry.committed_at.to_rfc3339()
                        ));
                    }
                    lines.join("\n")
                });
                ExitCode::Clean
            }
            Err(e) => fail(global, e),
        },
    }
}

fn run_flag(global: &GlobalOpts, args: &FlagArgs) -> ExitCode {
    let config = match load(global) {
        Ok(loaded) => loaded.config,
        Err(code) => return code,
    };
    let store = StateStore::new(config.state_dir());
    let target = target_of(&config);
    let flag = FailureFlag::new(&store, &target);

    match args.command {
        FlagCommands::Show => {
            let state = match flag.load() {
                Ok(state) => state,
                Err(e) => return fail(global, e),
            };
            let record = match flag.record() {
                Ok(record) => record,
                Err(e) => return fail(global, e),
            };
            let payload = serde_json::json!({
                "target_id": target,
                "flag": state,
                "record": record,
            });
            print_payload(global, "flag show", &payload, || match &record {
                Some(record) => format!("{}: {} ({})", target, state.name(), record.exit_reason),
                None => format!("{}: {}", target, state.name()),
            });
            ExitCode::Clean
        }
        FlagCommands::Clear => match flag.clear() {
            Ok(()) => {
                warn!(target_id = %target, "failure flag cleared without a restore");
                print_payload(
                    global,
                    "flag clear",
                    &serde_json::json!({"target_id": target, "flag": "clear"}),
                    || format!("{}: flag cleared", target),
                );
                ExitCode::Clean
            }
            Err(e) => fail(global, e),
        },
    }
}

// ============================================================================
// config / version
// ============================================================================

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    let loaded = match load(global) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    match args.command {
        ConfigCommands::Show => {
            let snapshot = ConfigSnapshot::from_loaded(&loaded);
            let payload = serde_json::json!({
                "snapshot": snapshot,
                "config": loaded.config,
            });
            print_payload(global, "config show", &payload, || {
                let s = &snapshot.summary;
                format!(
                    "Configuration ({})\n  app: {} {}\n  install_dir: {}\n  state_dir: {}\n  source: {}\n  watchdog: {}",
                    snapshot.config_source,
                    s.app_name,
                    s.current_version,
                    s.install_dir,
                    s.state_dir,
                    s.source_kind,
                    if s.watchdog_enabled { "enabled" } else { "disabled" }
                )
            });
            ExitCode::Clean
        }
        ConfigCommands::Validate => match validate_config(&loaded.config) {
            Ok(()) => {
                print_payload(
                    global,
                    "config validate",
                    &serde_json::json!({"valid": true, "path": loaded.path}),
                    || "Configuration is valid".to_string(),
                );
                ExitCode::Clean
            }
            Err(e) => {
                print_payload(
                    global,
                    "config validate",
                    &serde_json::json!({"valid": false, "code": e.code(), "error": e.to_string()}),
                    || format!("Configuration is invalid: {}", e),
                );
                ExitCode::ConfigError
            }
        },
    }
}

fn print_version(global: &GlobalOpts) {
    let payload = serde_json::json!({
        "version": gu_core::VERSION,
        "session_id": SessionId::new(),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    });
    print_payload(global, "version", &payload, || {
        format!("gu-core {}", gu_core::VERSION)
    });
}
