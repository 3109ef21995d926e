//! # CLI
//!
//! This module defines the command-line interface of `grelay` using `clap`.
//!
//! Without a subcommand `grelay` serves every gRPC entry of its config file until Ctrl-C.
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grelay", version, about = "Transparent, rule-driven gRPC proxy")]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true, default_value = "grelay.yaml")]
    pub config: PathBuf,

    /// Log filter directive (e.g. `grelay_core=debug`). Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Address every gRPC entry listens on
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse the config file and print the proxy rules of every entry, without serving
    Validate,
}
