// src/bin/serviced.rs
//
// Daemon entrypoint: parses the `-s SOCKET` override, loads layered
// configuration, wires up the process-event source, `Supervisor`,
// `DependencyGraph`, `ControlRPC`, and `DispatcherClient`, and runs until
// interrupted. CLI surface intentionally stays this minimal — argument
// parsing beyond the socket override is out of scope.

use clap::Parser;
use serviced::config::AppConfig;
use serviced::control_rpc;
use serviced::dependency_graph::DependencyGraph;
use serviced::dispatcher_client::{self, NullDispatcherTransport};
use serviced::log;
use serviced::logger::{self, LogLevel};
use serviced::process_events;
use serviced::supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "serviced", about = "Process supervisor daemon")]
struct Cli {
    /// Override the control socket path (default from config/Settings.toml).
    #[arg(short = 's', long = "socket")]
    socket: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = AppConfig::new().unwrap_or_else(|err| {
        eprintln!("failed to load configuration, using defaults: {}", err);
        AppConfig::dummy()
    });
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {}", err);
        std::process::exit(1);
    }

    logger::set_log_level(if config.debug_mode {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });
    logger::set_log_file(&config.log_path);

    log!(LogLevel::Info, "serviced starting up");

    let event_handle = spawn_event_source(&config);
    let supervisor = Supervisor::new(config.clone(), event_handle.source);
    let deps = DependencyGraph::new(supervisor.clone());

    let event_loop = tokio::spawn(
        supervisor
            .clone()
            .run_event_loop(event_handle.events, deps.clone()),
    );
    let sweep = tokio::spawn(supervisor.clone().run_unsatisfied_requires_sweep());

    let (dispatcher_state_tx, _dispatcher_state_rx) = watch::channel(
        serviced::dispatcher_client::ConnectionState::Disconnected,
    );
    let dispatcher = tokio::spawn(dispatcher_client::run(
        Arc::new(NullDispatcherTransport),
        dispatcher_state_tx,
    ));

    let rpc_result = tokio::select! {
        result = control_rpc::serve(supervisor.clone(), &config.socket_path, config.socket_permissions) => result,
        _ = tokio::signal::ctrl_c() => {
            log!(LogLevel::Info, "received interrupt, shutting down");
            Ok(())
        }
    };

    event_loop.abort();
    sweep.abort();
    dispatcher.abort();

    if let Err(err) = rpc_result {
        log!(LogLevel::Error, "control RPC server exited: {}", err);
        std::process::exit(1);
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn spawn_event_source(_config: &AppConfig) -> process_events::EventSourceHandle {
    process_events::spawn_native().unwrap_or_else(|err| {
        log!(
            LogLevel::Warn,
            "kqueue process-event source unavailable ({}); falling back to polling",
            err
        );
        process_events::spawn_poll(std::time::Duration::from_millis(250))
    })
}

#[cfg(not(any(
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn spawn_event_source(config: &AppConfig) -> process_events::EventSourceHandle {
    process_events::spawn_poll(std::time::Duration::from_millis(config.poll_interval_ms))
}
