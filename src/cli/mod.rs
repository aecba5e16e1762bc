//! Command-line interface definitions for the `volback` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `volback` binary.
#[derive(Debug, Parser)]
#[command(
    name = "volback",
    about = "Orchestrate point-in-time backups of network-attached block volumes",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the backup executor service for the configured host.
    #[command(name = "serve", about = "Run the backup executor service")]
    Serve(ServeCommand),
    /// Load and validate the configuration, then print the effective values.
    #[command(
        name = "check-config",
        about = "Validate configuration and print the effective values"
    )]
    CheckConfig(CheckConfigCommand),
}

/// Arguments for the `volback serve` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ServeCommand {
    /// Override the host name this executor serves.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: Option<String>,
    /// Override the availability zone announced to the registry.
    #[arg(long, value_name = "ZONE")]
    pub(crate) availability_zone: Option<String>,
}

/// Arguments for the `volback check-config` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckConfigCommand {
    /// Validate only, without printing the effective configuration.
    #[arg(long)]
    pub(crate) quiet: bool,
}
