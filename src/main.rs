#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ltbroker
//!
//! Reverse-tunnel broker: exposes services on private networks under public
//! subdomains without inbound firewall rules.
//!
//! A tunnel client asks for a tunnel (`GET /?new` or `GET /<name>`), receives
//! a dedicated TCP port, and keeps a pool of outbound connections open to it.
//! Public requests for `<id>.<domain>` are forwarded over those pooled
//! connections, WebSocket upgrades included.
//!
//! ## Subcommands
//!
//! - `ltbroker serve` (default): run the broker
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap, tracing init, graceful shutdown
//! lib.rs             router assembly
//! router.rs          Host resolution, auth gate, dispatch to tunnels
//! auth.rs            Basic auth, constant-time comparison, password generation
//! config.rs          TOML + env-var configuration
//! ids.rs             subdomain validation, random ids
//! routes/
//!   tunnels.rs       tunnel creation, landing page
//!   status.rs        GET /api/status, GET /api/tunnels/{id}/status
//! tunnel/
//!   agent.rs         per-tunnel connection pool (actor)
//!   client.rs        request/upgrade proxy, grace-period state machine
//!   upgrade.rs       raw upgrade head formatting/parsing, splice
//!   manager.rs       id → tunnel registry
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use ltbroker::{app, AppState, Config};

/// Reverse-tunnel broker.
#[derive(Parser)]
#[command(name = "ltbroker", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve(ServeArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Public HTTP port.
    #[arg(long)]
    port: Option<u16>,
    /// Address the public HTTP listener binds to.
    #[arg(long)]
    address: Option<String>,
    /// Base domain tunnels are served under.
    #[arg(long)]
    domain: Option<String>,
    /// Hand out https URLs and set X-Forwarded-Proto (TLS terminated upstream).
    #[arg(long)]
    secure: bool,
    /// Maximum pooled sockets per tunnel client.
    #[arg(long)]
    max_sockets: Option<usize>,
}

impl ServeArgs {
    /// Command-line flags win over file and environment.
    fn apply(&self, config: &mut Config) {
        if self.port.is_some() || self.address.is_some() {
            let (current_host, current_port) = config
                .server
                .listen
                .rsplit_once(':')
                .map_or(("0.0.0.0", "80"), |(h, p)| (h, p));
            let host = self.address.as_deref().unwrap_or(current_host);
            let port = self
                .port
                .map_or_else(|| current_port.to_string(), |p| p.to_string());
            config.server.listen = format!("{host}:{port}");
        }
        if let Some(domain) = &self.domain {
            config.server.domain = Some(domain.clone()).filter(|d| !d.is_empty());
        }
        if self.secure {
            config.server.secure = true;
        }
        if let Some(max) = self.max_sockets {
            config.tunnel.max_sockets = max;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Serve(args)) => args,
        None => cli.serve,
    };

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ltbroker: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("ltbroker: {e}");
        return ExitCode::FAILURE;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run_server(config).await {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> std::io::Result<()> {
    info!("ltbroker v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        listen = %config.server.listen,
        domain = config.server.domain.as_deref().unwrap_or("<from Host header>"),
        secure = config.server.secure,
        max_sockets = config.tunnel.max_sockets,
        "configuration loaded"
    );

    let listener = TcpListener::bind(&config.server.listen).await?;
    let state = AppState::new(config);
    let router = app(state.clone());

    info!("Server ready");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cleanup
    info!("Shutting down...");
    let closed = state.manager.close_all().await;
    info!(tunnels = closed, "Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_listen_port_only() {
        let mut config = Config::default();
        let args = ServeArgs {
            port: Some(8080),
            ..ServeArgs::default()
        };
        args.apply(&mut config);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_cli_overrides_all() {
        let mut config = Config::default();
        let args = ServeArgs {
            config: None,
            port: Some(3000),
            address: Some("127.0.0.1".to_string()),
            domain: Some("tunnel.example.org".to_string()),
            secure: true,
            max_sockets: Some(4),
        };
        args.apply(&mut config);
        assert_eq!(config.server.listen, "127.0.0.1:3000");
        assert_eq!(config.server.domain.as_deref(), Some("tunnel.example.org"));
        assert!(config.server.secure);
        assert_eq!(config.tunnel.max_sockets, 4);
    }

    #[test]
    fn test_cli_flag_repairs_lower_layer() {
        let mut config = Config::default();
        config.tunnel.max_sockets = 0;
        let args = ServeArgs {
            max_sockets: Some(5),
            ..ServeArgs::default()
        };
        args.apply(&mut config);
        assert!(config.validate().is_ok());
        assert_eq!(config.tunnel.max_sockets, 5);
    }

    #[test]
    fn test_cli_parses_without_subcommand() {
        let cli = Cli::try_parse_from(["ltbroker", "--port", "9000", "--secure"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, Some(9000));
        assert!(cli.serve.secure);

        let cli = Cli::try_parse_from(["ltbroker", "serve", "--domain", "example.com"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Serve(ServeArgs { ref domain, .. })) if domain.as_deref() == Some("example.com")
        ));
    }
}
