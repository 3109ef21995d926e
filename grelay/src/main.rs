//! # Grelay Entry Point
//!
//! The main executable of the Grelay proxy. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and installs the
//!    `tracing` subscriber.
//! 2. **Configuration**: Loads the YAML boot file and builds one proxy rule per gRPC entry.
//! 3. **Serving**: Runs one `tonic` server per entry, with the proxy installed as the fallback
//!    of its route table.
//! 4. **Shutdown**: Stops every server gracefully on Ctrl-C.

mod cli;
mod config;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands};
use config::{Config, GrpcEntryConfig};
use grelay_core::director::RuleDirector;
use grelay_core::proxy::ProxyEntry;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_DIRECTIVE: &str = "grelay=info,grelay_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    init_tracing(args.log_level.as_deref());

    let config = Config::load(&args.config)?;

    match args.command {
        Some(Commands::Validate) => validate(&config),
        None => serve(config, args.listen_host).await,
    }
}

fn init_tracing(directive: Option<&str>) {
    let env_filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE)),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn validate(config: &Config) -> anyhow::Result<()> {
    for entry in &config.grpc {
        println!("{} (port {})", entry.name, entry.port);

        let Some(rule) = entry.rule()? else {
            println!("  proxy: disabled");
            continue;
        };

        for (index, pattern) in rule.ip_patterns().iter().enumerate() {
            let cidrs: Vec<String> = pattern.cidrs().iter().map(ToString::to_string).collect();
            println!(
                "  ip #{index}: [{}] -> [{}]",
                cidrs.join(", "),
                pattern.destinations().join(", ")
            );
        }

        for (index, pattern) in rule.path_patterns().iter().enumerate() {
            let paths: Vec<&str> = pattern.paths().collect();
            println!(
                "  path #{index}: [{}] -> [{}]",
                paths.join(", "),
                pattern.destinations().join(", ")
            );
        }

        for (index, pattern) in rule.header_patterns().iter().enumerate() {
            let headers: Vec<String> = pattern
                .headers()
                .iter()
                .map(|(key, value)| format!("{key}:{value}"))
                .collect();
            println!(
                "  header #{index}: [{}] -> [{}]",
                headers.join(", "),
                pattern.destinations().join(", ")
            );
        }

        if rule.is_empty() {
            println!("  proxy: enabled, no rules (every call is unimplemented)");
        }
    }

    Ok(())
}

fn proxy_entry(entry: &GrpcEntryConfig) -> anyhow::Result<Option<ProxyEntry>> {
    let Some(rule) = entry.rule()? else {
        return Ok(None);
    };

    let director = RuleDirector::new(rule).with_dial_options(entry.dial_options());
    Ok(Some(ProxyEntry::with_director(&entry.name, director)))
}

async fn serve(config: Config, listen_host: IpAddr) -> anyhow::Result<()> {
    if config.grpc.is_empty() {
        bail!("No gRPC entry configured");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();

    for entry in &config.grpc {
        let addr = SocketAddr::new(listen_host, entry.port);
        let proxy = proxy_entry(entry)?;

        let routes = match &proxy {
            Some(proxy) => {
                proxy.bootstrap();
                proxy.install(Routes::default())
            }
            None => {
                warn!(entry = %entry.name, "Proxy disabled, every call will be unimplemented");
                Routes::default()
            }
        };

        info!(entry = %entry.name, %addr, "Serving gRPC entry");

        let name = entry.name.clone();
        let mut shutdown = shutdown_rx.clone();

        servers.spawn(async move {
            let result = Server::builder()
                .add_routes(routes)
                .serve_with_shutdown(addr, async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;

            if let Some(proxy) = &proxy {
                proxy.interrupt();
            }

            result.with_context(|| format!("gRPC entry '{name}' stopped with an error"))
        });
    }

    let mut outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            signal.context("Failed to listen for Ctrl-C")
        }
        Some(result) = servers.join_next() => flatten(result),
    };

    let _ = shutdown_tx.send(true);

    while let Some(result) = servers.join_next().await {
        let result = flatten(result);
        if outcome.is_ok() {
            outcome = result;
        }
    }

    outcome
}

fn flatten(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    result.context("gRPC server task panicked")?
}
