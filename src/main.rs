//! Binary entry point for the volback service.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};

use volback::driver::sim::{SimDriver, SimVolumeDriver};
use volback::{
    BackupExecutor, ConfigError, ExecutorConfig, ExecutorService, InProcessBus, QuotaLedger,
    RecordStore, ServiceConfig, ServiceRegistry,
};

mod cli;

use cli::{CheckConfigCommand, Cli, ServeCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Serve(command) => serve(command).await,
        Cli::CheckConfig(command) => check_config(&command),
    }
}

async fn serve(args: ServeCommand) -> Result<i32, CliError> {
    let mut config = ServiceConfig::load_without_cli_args()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(zone) = args.availability_zone {
        config.availability_zone = zone;
    }
    config.validate()?;

    let store = Arc::new(RecordStore::new());
    let quotas = Arc::new(QuotaLedger::new(config.quota_limits()));
    let registry = Arc::new(ServiceRegistry::new());
    let bus = Arc::new(InProcessBus::new());
    let mailbox = bus.register(config.host.clone()).await;

    let backup_driver = Arc::new(SimDriver::new(config.backup_driver.clone()));
    let volume_driver = Arc::new(SimVolumeDriver::new(
        store.clone(),
        config.host.clone(),
        config.availability_zone.clone(),
    ));

    let executor = Arc::new(BackupExecutor::new(
        ExecutorConfig {
            host: config.host.clone(),
            availability_zone: config.availability_zone.clone(),
        },
        store,
        quotas,
        volume_driver,
        backup_driver,
        bus,
    ));
    let service = ExecutorService::new(executor, registry, config.max_concurrent_operations);

    info!(
        host = %config.host,
        availability_zone = %config.availability_zone,
        driver = %config.backup_driver,
        "backup executor starting"
    );

    tokio::select! {
        () = service.serve(mailbox) => {
            info!("mailbox closed, shutting down");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(%err, "failed to listen for shutdown signal");
                return Ok(1);
            }
            info!("shutdown signal received");
        }
    }

    Ok(0)
}

fn check_config(args: &CheckConfigCommand) -> Result<i32, CliError> {
    let config = ServiceConfig::load_without_cli_args()?;
    config.validate()?;

    if !args.quiet {
        write_effective_config(io::stdout(), &config);
    }

    Ok(0)
}

fn write_effective_config(mut target: impl Write, config: &ServiceConfig) {
    writeln!(target, "host = {}", config.host).ok();
    writeln!(target, "availability_zone = {}", config.availability_zone).ok();
    writeln!(target, "backup_driver = {}", config.backup_driver).ok();
    writeln!(
        target,
        "max_concurrent_operations = {}",
        config.max_concurrent_operations
    )
    .ok();
    writeln!(
        target,
        "group_poll_interval_secs = {}",
        config.group_poll_interval_secs
    )
    .ok();
    writeln!(
        target,
        "group_poll_max_attempts = {}",
        config.group_poll_max_attempts
    )
    .ok();
    writeln!(
        target,
        "volume_poll_interval_secs = {}",
        config.volume_poll_interval_secs
    )
    .ok();
    writeln!(
        target,
        "thaw_retry_delay_secs = {}",
        config.thaw_retry_delay_secs
    )
    .ok();
    let backup_limit = config
        .default_backup_limit
        .map_or_else(|| String::from("unlimited"), |limit| limit.to_string());
    writeln!(target, "default_backup_limit = {backup_limit}").ok();
    let gigabyte_limit = config
        .default_backup_gigabytes
        .map_or_else(|| String::from("unlimited"), |limit| limit.to_string());
    writeln!(target, "default_backup_gigabytes = {gigabyte_limit}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig {
            host: "host-1".to_owned(),
            availability_zone: "zone-a".to_owned(),
            backup_driver: "sim".to_owned(),
            max_concurrent_operations: 16,
            group_poll_interval_secs: 5,
            group_poll_max_attempts: 720,
            volume_poll_interval_secs: 1,
            thaw_retry_delay_secs: 20,
            default_backup_limit: Some(7),
            default_backup_gigabytes: None,
        }
    }

    #[test]
    fn write_effective_config_lists_every_knob() {
        let mut buf = Vec::new();
        write_effective_config(&mut buf, &config());
        let rendered = String::from_utf8(buf).expect("utf8");

        assert!(rendered.contains("host = host-1"), "rendered: {rendered}");
        assert!(rendered.contains("default_backup_limit = 7"));
        assert!(rendered.contains("default_backup_gigabytes = unlimited"));
        assert!(rendered.contains("group_poll_max_attempts = 720"));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Config(ConfigError::InvalidValue(String::from(
            "VOLBACK_GROUP_POLL_INTERVAL_SECS must be greater than zero",
        )));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("configuration error"),
            "rendered: {rendered}"
        );
        assert!(rendered.contains("greater than zero"));
    }
}
