use std::path::PathBuf;
use std::time::Duration;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use log::{info, LevelFilter};

use crate::device::driver::BleRpcDriver;
use crate::error::AppRunError;

#[derive(Debug, Parser)]
#[command(name = "blerpc-driver", version, about = "Issue RPC reads, writes and subscriptions to a BLE peripheral")]
pub struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// How long a request may take, e.g. "10s" or "1m 30s". Subscriptions listen this long.
    #[arg(long, global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Overrides the log level from the config file
    #[arg(long, global = true, value_parser = parse_level)]
    pub log_level: Option<LevelFilter>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Service UUID, full or 16/32 bit short form
    #[arg(long)]
    pub service: String,

    /// Characteristic UUID, full or 16/32 bit short form
    #[arg(long)]
    pub characteristic: String,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Read the current value of a characteristic
    Read {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Write a hex encoded payload to a characteristic
    Write {
        #[command(flatten)]
        target: TargetArgs,
        payload: String,
    },
    /// Print value updates of a characteristic
    Subscribe {
        #[command(flatten)]
        target: TargetArgs,
        /// Stop after this many updates
        #[arg(long)]
        count: Option<usize>,
    },
    /// Write the current (or default) configuration to the config file
    InitConfig,
}

fn parse_level(level: &str) -> Result<LevelFilter, String> {
    level.parse().map_err(|_| format!("unknown log level {:?}", level))
}

pub fn parse_hex(payload: &str) -> Result<Vec<u8>, AppRunError> {
    let digits: String = payload
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    hex::decode(digits).map_err(|err| AppRunError::InvalidPayload(format!("{:?}: {}", payload, err)))
}

pub fn to_hex(payload: &[u8]) -> String {
    hex::encode(payload)
}

pub async fn execute(driver: &BleRpcDriver, command: &Command) -> Result<(), AppRunError> {
    match command {
        Command::Read { target } => {
            let value = driver.read(&[], &target.service, &target.characteristic).await?;
            println!("{}", to_hex(&value));
        },
        Command::Write { target, payload } => {
            let payload = parse_hex(payload)?;
            driver.write(&payload, &target.service, &target.characteristic).await?;
            info!("Wrote {} bytes", payload.len());
        },
        Command::Subscribe { target, count } => {
            let updates = driver.subscribe(&[], &target.service, &target.characteristic);
            let mut updates = match count {
                Some(count) => updates.take(*count).boxed(),
                None => updates,
            };

            while let Some(value) = updates.next().await {
                println!("{}", to_hex(&value?));
            }
        },
        Command::InitConfig => {},
    }

    Ok(())
}
