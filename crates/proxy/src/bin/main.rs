// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Switcheroo JSON-RPC switch
//!
//! Serves `/dial/{name}` for the configured sources and switches each of them
//! to its target through the configured effects.

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};
use switcheroo_common::init_logging;
use switcheroo_proxy::{Config, ServerBuilder};
use tracing::{info, warn};

/// Switcheroo JSON-RPC switch
#[derive(Parser, Debug)]
#[command(name = "switcheroo")]
#[command(about = "Bidirectional JSON-RPC switch with fault injection")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the switch
    Serve(ServeArgs),
    /// Load and validate a configuration file
    Check(CheckArgs),
}

/// Serve mode arguments
#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind to
    /// Example: --listen-addr 0.0.0.0
    #[arg(long, default_value = "127.0.0.1")]
    listen_addr: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    listen_port: u16,

    /// Configuration file (YAML, or TOML with a .toml extension)
    #[arg(long)]
    config: PathBuf,

    /// Also write logs to a daily rotated file
    #[arg(long)]
    log_file: bool,
}

/// Check mode arguments
#[derive(Parser, Debug)]
struct CheckArgs {
    /// Configuration file to check
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Check(check_args) => run_check(check_args),
    }
}

/// Run the switch until ctrl-c
async fn run_server(args: ServeArgs) -> Result<()> {
    init_logging("switcheroo", args.log_file)?;

    let config = Config::load(&args.config)?;
    let ip = IpAddr::from_str(&args.listen_addr)
        .wrap_err_with(|| format!("invalid listen address {}", args.listen_addr))?;
    let server = ServerBuilder::new()
        .listen_addr(SocketAddr::from((ip, args.listen_port)))
        .config(config)
        .build()?;

    let address = server.start().await?;
    info!("Dial ws://{}/dial/<source> to connect", address);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Err(errors) = server.close().await {
        for error in errors.errors() {
            warn!("Shutdown failure: {:#}", error);
        }
        return Err(eyre::Report::new(errors).wrap_err("shutdown was not clean"));
    }
    Ok(())
}

/// Print a summary of a valid configuration
fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    println!("{} is valid", args.config.display());
    for (name, target) in &config.targets {
        println!(
            "target {name}: {} ({} effects{})",
            target.endpoint,
            target.effects.len(),
            if target.keep_alive { ", keep-alive" } else { "" }
        );
    }
    for (name, source) in &config.sources {
        let target = config.target_for(name)?;
        println!("source {name} -> {target} ({} effects)", source.effects.len());
    }
    Ok(())
}
