use clap::Parser;
use emf::error::{EmfError, Result};
use emf::{Chief, MemoryRatingStore, NativeKernel};
use log::Level;
use std::sync::Arc;

/// Joins a `lord` as a cluster node. The ratings file must be the one the
/// `lord` trains on.
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// The IP:Port at which the lord accepts cluster nodes
    #[clap(short = 's', long = "lord_addr", default_value = "127.0.0.1:7101")]
    lord_address: String,
    /// The IP other nodes reach this one at
    #[clap(short = 'm', long = "host", default_value = "127.0.0.1")]
    host: String,
    /// The port other nodes reach this one at, any free port if not given
    #[clap(short = 'p', long = "port")]
    port: Option<u16>,
    /// A headerless `user,item,rating` CSV file
    #[clap(short = 'r', long = "ratings")]
    ratings: String,
    #[clap(short = 'l', long = "log_level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let level: Level = opts
        .log_level
        .parse()
        .map_err(|_| EmfError::InvalidOptions(opts.log_level.clone()))?;
    simple_logger::init_with_level(level)
        .map_err(|e| EmfError::InvalidOptions(e.to_string()))?;

    let store = MemoryRatingStore::from_csv(&opts.ratings)?;
    let chief = Chief::connect(
        &opts.lord_address,
        &opts.host,
        opts.port,
        Arc::new(store),
        Arc::new(NativeKernel),
    )
    .await?;
    chief.run().await
}
