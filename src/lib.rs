use std::env;
use std::sync::Arc;
use log::{info, LevelFilter};
use tokio::time::timeout;

use crate::cli::{execute, Cli, Command};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::driver::BleRpcDriver;
use crate::error::AppRunError;
use crate::transport::btle::BtleTransport;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod transport;

pub fn init_logging(level: LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}

async fn load_config(config_io: &ConfigIO) -> Result<Config, AppRunError> {
    match config_io.read().await {
        Ok(config) => Ok(config),
        // this is probably the first start
        Err(err) if err.is_file_not_found_error() => Ok(Config::default()),
        Err(err) => Err(err.into()),
    }
}

pub async fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new(cli.config.clone())?;
    let config = load_config(&config_io).await?;

    init_logging(cli.log_level.unwrap_or(config.log_level_filter()))?;
    info!(concat!("blerpc-driver ", env!("CARGO_PKG_VERSION")));
    info!("Using config file {}", config_io.path().to_string_lossy());

    if let Command::InitConfig = cli.command {
        config_io.save(&config).await?;
        return Ok(());
    }

    let (transport, device) = BtleTransport::discover(&config).await?;
    let transport = Arc::new(transport);
    let driver = BleRpcDriver::with_transport(transport.clone(), device);

    let result = match timeout(cli.timeout, execute(&driver, &cli.command)).await {
        Ok(result) => result,
        // subscriptions listen for the whole window, running out of time is how they end
        Err(_) if matches!(cli.command, Command::Subscribe { .. }) => Ok(()),
        Err(_) => Err(AppRunError::Timeout(cli.timeout)),
    };

    driver.disconnect();
    transport.shutdown().await?;
    result
}
