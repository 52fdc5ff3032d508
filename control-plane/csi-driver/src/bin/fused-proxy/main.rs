//! The fcfsfused mount proxy.
//!
//! Runs the fcfs_fused daemons on behalf of the node plugin, so that they outlive node plugin
//! restarts and upgrades.

use clap::Arg;
use csi_driver::{
    engine::{HostCommand, MountProxySvc},
    logging::{init_tracing, FmtStyle},
    shutdown::Shutdown,
    transport::bind_incoming,
    DEFAULT_FUSED_PROXY_ENDPOINT,
};
use rpc::fcfsfused::mount_service_server::MountServiceServer;
use std::str::FromStr;
use tonic::transport::Server;
use tracing::{error, info};

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let args = clap::Command::new(env!("CARGO_PKG_DESCRIPTION"))
        .about("Mount proxy running the fcfs_fused daemons of the node plugin")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("endpoint")
                .long("fcfsfused-proxy-endpoint")
                .short('e')
                .env("FCFSFUSED_PROXY_ENDPOINT")
                .default_value(DEFAULT_FUSED_PROXY_ENDPOINT)
                .help("Unix socket the proxy listens on"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .env("LOG_FORMAT")
                .value_parser(["compact", "pretty", "json"])
                .default_value("pretty")
                .help("Log output format"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("Sets the verbosity level"),
        )
        .get_matches();

    let style = args
        .get_one::<String>("log-format")
        .map(|style| FmtStyle::from_str(style))
        .transpose()?
        .unwrap_or(FmtStyle::Pretty);
    init_tracing("fcfsfused-proxy", style, args.get_count("v"));

    let endpoint = args
        .get_one::<String>("endpoint")
        .expect("endpoint must be specified");
    let incoming = bind_incoming(endpoint).map_err(|error| anyhow::anyhow!(error))?;
    info!("fcfsfused proxy listening on {}", endpoint);

    Server::builder()
        .add_service(MountServiceServer::new(MountProxySvc::new(HostCommand)))
        .serve_with_incoming_shutdown(incoming, Shutdown::wait())
        .await
        .map_err(|error| {
            error!(%error, "fcfsfused proxy failed");
            error.into()
        })
}
