use tracing::info;

use clap::{Arg, ArgMatches};
use csi_driver::{
    cluster::DEFAULT_CLUSTER_CONFIG,
    logging::{init_tracing, FmtStyle},
    DEFAULT_DRIVER_NAME,
};
use std::str::FromStr;

mod config;
mod controller;
mod server;

use config::CsiControllerConfig;

const CSI_SOCKET: &str = "unix:///var/tmp/csi.sock";

/// Initialize all components before starting the CSI controller.
fn initialize_controller(args: &ArgMatches) -> anyhow::Result<()> {
    CsiControllerConfig::initialize(args)?;
    Ok(())
}

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let args = clap::Command::new(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("socket")
                .long("csi-socket")
                .short('c')
                .env("CSI_ENDPOINT")
                .default_value(CSI_SOCKET)
                .help("CSI socket path, optionally prefixed with unix://"),
        )
        .arg(
            Arg::new("driver-name")
                .long("driver-name")
                .env("DRIVER_NAME")
                .default_value(DEFAULT_DRIVER_NAME)
                .help("Name the driver registers with"),
        )
        .arg(
            Arg::new("cluster-config")
                .long("cluster-config")
                .env("CLUSTER_CONFIG")
                .default_value(DEFAULT_CLUSTER_CONFIG)
                .help("JSON file listing the FastCFS clusters and their configuration URLs"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("io-timeout")
                .env("IO_TIMEOUT")
                .default_value("60s")
                .help("Timeout of a single CSI call"),
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
            Arg::new("verbose")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("Increase the log verbosity, may be repeated"),
        )
        .get_matches();

    let style = args
        .get_one::<String>("log-format")
        .map(|style| FmtStyle::from_str(style))
        .transpose()?
        .unwrap_or(FmtStyle::Pretty);
    init_tracing(
        "csi-controller",
        style,
        args.get_count("verbose"),
    );

    initialize_controller(&args)?;

    info!(
        "Starting FastCFS CSI Controller, driver = {}",
        CsiControllerConfig::get_config().driver_name()
    );

    let result = server::CsiServer::run(
        args.get_one::<String>("socket")
            .expect("CSI socket must be specified")
            .clone(),
    )
    .await;
    result.map_err(|error| anyhow::anyhow!("error: {}", error))
}
