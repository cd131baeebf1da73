use clap::Parser;
use log::error;
use blerpc_driver::cli::Cli;
use blerpc_driver::error::AppRunError;
use blerpc_driver::run;

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();

    match run(cli).await {
        Err(err) => {
            error!("{}", err);
            eprintln!("blerpc-driver {}: {}", env!("CARGO_PKG_VERSION"), err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
