//! # Broker demo binary
//!
//! A thin shim: parse [`cli::Args`], build a [`BrokerConfig`], construct a
//! [`Broker`], and run it until Ctrl-C. All behavior lives in the library.

use anyhow::Result;
use clap::Parser;
use procbroker::{cli::Args, config::BrokerConfig, Broker};
use tracing::info;

mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.quiet, args.verbose, args.log_dir.as_deref());

    let config: BrokerConfig = (&args).into();
    info!(
        transport = ?config.child_transport_kind,
        uds_base_path = %config.uds_base_path.display(),
        "starting broker"
    );

    let broker = Broker::new(config);

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    broker.shutdown().await;

    info!("broker shut down cleanly, {} processes at exit", broker.process_count().await);
    Ok(())
}
