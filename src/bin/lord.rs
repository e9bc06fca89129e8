use clap::Parser;
use emf::error::{EmfError, Result};
use emf::{Lord, MemoryRatingStore, NativeKernel, TrainingOptions};
use log::{info, Level};
use std::sync::Arc;

/// Trains user and item factors of a ratings file, optionally spreading the
/// work over cluster nodes
#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// A JSON file of training options, missing fields take their defaults
    #[clap(short = 'o', long = "options")]
    options: Option<String>,
    /// A headerless `user,item,rating` CSV file
    #[clap(short = 'r', long = "ratings")]
    ratings: String,
    /// Where factors and the calc info are saved
    #[clap(short = 'd', long = "out_dir", default_value = "emf-out")]
    out_dir: String,
    /// Wait for this many cluster nodes before training, enables clustering
    #[clap(short = 'n', long = "nodes", default_value = "0")]
    nodes: usize,
    /// Overrides the cluster port of the options file
    #[clap(short = 'p', long = "port")]
    port: Option<u16>,
    /// Reassign every rating to the train/validate/test sets
    #[clap(long = "force_resplit")]
    force_resplit: bool,
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

    let mut options = match &opts.options {
        Some(path) => TrainingOptions::from_file(path)?,
        None => TrainingOptions::default(),
    };
    if opts.nodes > 0 {
        options.use_clustering = true;
    }
    if let Some(port) = opts.port {
        options.cluster_server_port = port;
    }

    let store = MemoryRatingStore::from_csv(&opts.ratings)?
        .with_seed(options.seed)
        .with_output_dir(&opts.out_dir)?;
    let mut lord =
        Lord::spawn(options, Arc::new(store), Arc::new(NativeKernel)).await?;
    if opts.nodes > 0 {
        info!("Waiting for {} cluster nodes", opts.nodes);
        lord.wait_for_nodes(opts.nodes).await?;
    }
    let result = lord.train_with(opts.force_resplit).await;
    lord.shutdown().await;
    let calc = result?;
    println!("{}", serde_json::to_string_pretty(&calc)?);
    Ok(())
}
