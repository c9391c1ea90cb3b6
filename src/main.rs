use std::{backtrace::Backtrace, fs, os::unix::io::RawFd, path::PathBuf, process::ExitCode};

use anyhow::Context;
use calloop::{
    EventLoop,
    signals::{Signal, Signals},
};
use clap::{Parser, Subcommand};
use perch::{
    PerchError,
    backend::wayland,
    config,
    ipc::{self, Request},
    state::Perch,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "perch", version)]
#[command(about = "Applies output profiles when displays are plugged or unplugged")]
struct Cli {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve control requests on an already listening socket instead of
    /// binding one
    #[arg(short, long, value_name = "FD")]
    listen_fd: Option<RawFd>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Make the running daemon re-read its config and re-apply
    Reload,
    /// Apply a profile by name on the running daemon
    Switch {
        /// Profile name
        profile: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return run_client(command);
    }

    init_backtrace_defaults();
    init_logging()?;
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("panic: {panic_info}\n{backtrace}");
        eprintln!("panic: {panic_info}\n{backtrace}");
    }));

    run_daemon(cli.config, cli.listen_fd)?;
    Ok(ExitCode::SUCCESS)
}

fn run_client(command: Command) -> anyhow::Result<ExitCode> {
    let request = match command {
        Command::Reload => Request::Reload,
        Command::Switch { profile } => Request::Switch(profile),
    };

    match ipc::run_ipc_command(&request)? {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_daemon(config_arg: Option<PathBuf>, listen_fd: Option<RawFd>) -> anyhow::Result<()> {
    let loaded = config::load_or_create_default(config_arg.as_deref())?;
    tracing::info!(
        path = %loaded.path.display(),
        profiles = loaded.store.len(),
        "loaded config"
    );

    let mut event_loop: EventLoop<Perch> =
        EventLoop::try_new().map_err(|err| PerchError::EventLoop(err.to_string()))?;

    let (connection, queue) = wayland::connect()?;
    let mut state = Perch::new(
        loaded.store,
        loaded.path,
        connection,
        queue.handle(),
        event_loop.get_signal(),
    );

    wayland::init_wayland(&event_loop.handle(), queue, &mut state)?;

    match ipc::init_ipc_listener(&event_loop.handle(), listen_fd) {
        Ok(Some(path)) => {
            tracing::info!(path = %path.display(), "ipc listener initialized");
            state.ipc_socket_path = Some(path);
        }
        Ok(None) => tracing::info!(fd = ?listen_fd, "ipc listener adopted"),
        // A socket handed over by a service manager is expected to work.
        Err(err) if listen_fd.is_some() => {
            return Err(err).context("failed to use --listen-fd");
        }
        Err(err) => tracing::warn!("failed to initialize ipc listener: {err}"),
    }

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP])
        .map_err(|err| PerchError::EventLoop(format!("failed to install signal handler: {err}")))?;
    event_loop
        .handle()
        .insert_source(signals, |event, _, state| match event.signal() {
            Signal::SIGHUP => state.reload_config(None),
            signal => {
                tracing::info!(?signal, "shutting down");
                state.loop_signal.stop();
            }
        })
        .map_err(|err| PerchError::EventLoop(format!("failed to insert signal source: {err}")))?;

    // Push whatever the initial match submitted before blocking in the loop.
    state.after_dispatch();

    event_loop
        .run(None, &mut state, |state| state.after_dispatch())
        .map_err(|err| PerchError::EventLoop(err.to_string()))?;

    if let Some(path) = state.ipc_socket_path.take()
        && let Err(err) = fs::remove_file(&path)
    {
        tracing::warn!(path = %path.display(), "failed to remove ipc socket: {err}");
    }

    Ok(())
}

fn init_backtrace_defaults() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }
}

const DEFAULT_LOG_FILTER: &str = "perch=info";

fn log_dir() -> anyhow::Result<PathBuf> {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME")
        && !state.is_empty()
    {
        return Ok(PathBuf::from(state).join("perch"));
    }
    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .context("unable to resolve log directory: HOME and XDG_STATE_HOME are unset")?;
    Ok(PathBuf::from(home).join(".local").join("state").join("perch"))
}

fn init_logging() -> anyhow::Result<()> {
    let log_dir = log_dir()?;
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "perch.log");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();

    let log_file = log_dir.join("perch.log");
    tracing::info!(path = %log_file.display(), "logging initialized");

    Ok(())
}
