//! FastCFS CSI node plugin.
//!
//! Implementation of the node gRPC methods from the CSI spec: fuse mounts of FastCFS volumes
//! on their staging paths, bind mounts into the pods, and the rebuild of those mounts when
//! the plugin restarts.

use crate::{
    config::{FuseMode, NodeConfig},
    node::Node,
};
use clap::Arg;
use csi_driver::{
    csi::{identity_server::IdentityServer, node_server::NodeServer},
    engine::{DirectFuseMounter, FuseMounter, ProxyFuseMounter},
    identity::CsiIdentitySvc,
    limiter::VolumeLocks,
    logging::{init_tracing, FmtStyle},
    metadata::{KubeMetadata, MetadataService},
    mount::{Mounter, NodeMounter},
    recovery::{KubeletPaths, MountRecovery, KUBELET_DIR},
    shutdown::Shutdown,
    topology::node_topology,
    transport::bind_incoming,
    DEFAULT_DRIVER_NAME, DEFAULT_FUSED_PROXY_ENDPOINT,
};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tonic::transport::Server;
use tracing::{error, info};

const CSI_SOCKET: &str = "unix:///csi/csi.sock";

/// The node plugin command line.
pub(crate) fn command() -> clap::Command {
    clap::Command::new(env!("CARGO_PKG_DESCRIPTION"))
        .about("k8s node plugin mounting FastCFS volumes")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("csi-socket")
                .short('c')
                .long("csi-socket")
                .env("CSI_ENDPOINT")
                .value_name("PATH")
                .default_value(CSI_SOCKET)
                .help("CSI gRPC listen socket, optionally prefixed with unix://")
        )
        .arg(
            Arg::new("node-name")
                .short('n')
                .long("node-name")
                .env("KUBE_NODE_NAME")
                .value_name("NAME")
                .help("Unique node name where this instance runs")
                .required(true)
        )
        .arg(
            Arg::new("driver-name")
                .long("driver-name")
                .env("DRIVER_NAME")
                .default_value(DEFAULT_DRIVER_NAME)
                .help("Name the driver registers with")
        )
        .arg(
            Arg::new("cluster-config")
                .long("cluster-config")
                .env("CLUSTER_CONFIG")
                .default_value(csi_driver::cluster::DEFAULT_CLUSTER_CONFIG)
                .help("JSON file listing the FastCFS clusters and their configuration URLs")
        )
        .arg(
            Arg::new("domain-labels")
                .long("domain-labels")
                .env("DOMAIN_LABELS")
                .value_name("LABELS")
                .help("Comma separated node labels reported as the node topology, e.g. topology.kubernetes.io/zone")
        )
        .arg(
            Arg::new("max-volumes-per-node")
                .long("max-volumes-per-node")
                .value_name("NUMBER")
                .allow_hyphen_values(true)
                .default_value("0")
                .help("Maximum number of volumes which can be published on this node, 0 for no limit")
        )
        .arg(
            Arg::new("kubelet-dir")
                .long("kubelet-dir")
                .env("KUBELET_DIR")
                .value_name("PATH")
                .default_value(KUBELET_DIR)
                .help("Kubelet root directory")
        )
        .arg(
            Arg::new("enable-fcfsfused-proxy")
                .long("enable-fcfsfused-proxy")
                .action(clap::ArgAction::SetTrue)
                .help("Run the fuse daemons through the fcfsfused-proxy sidecar")
        )
        .arg(
            Arg::new("fcfsfused-proxy-endpoint")
                .long("fcfsfused-proxy-endpoint")
                .value_name("ENDPOINT")
                .default_value(DEFAULT_FUSED_PROXY_ENDPOINT)
                .help("Unix socket of the fcfsfused-proxy sidecar")
        )
        .arg(
            Arg::new("fcfsfused-proxy-conn-timeout")
                .long("fcfsfused-proxy-conn-timeout")
                .value_name("SECONDS")
                .default_value("5")
                .help("Timeout of the connection to the fcfsfused-proxy sidecar")
        )
        .arg(
            Arg::new("skip-recovery")
                .long("skip-recovery")
                .action(clap::ArgAction::SetTrue)
                .help("Don't remount the volumes attached to this node at startup")
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .env("LOG_FORMAT")
                .value_parser(["compact", "pretty", "json"])
                .default_value("pretty")
                .help("Log output format")
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("Sets the verbosity level")
        )
}

pub(super) async fn main() -> anyhow::Result<()> {
    let matches = command().get_matches();

    let style = matches
        .get_one::<String>("log-format")
        .map(|style| FmtStyle::from_str(style))
        .transpose()?
        .unwrap_or(FmtStyle::Pretty);
    init_tracing("csi-node", style, matches.get_count("v"));

    let config = NodeConfig::try_from(&matches)?;
    let csi_socket = matches
        .get_one::<String>("csi-socket")
        .map(|s| s.as_str())
        .unwrap_or(CSI_SOCKET);

    let metadata: Option<Arc<dyn MetadataService>> =
        if !config.domain_labels().is_empty() || config.recovery() {
            Some(Arc::new(KubeMetadata::try_default().await?))
        } else {
            None
        };

    let topology = match &metadata {
        Some(metadata) if !config.domain_labels().is_empty() => {
            let labels = metadata.node_labels(config.node_name()).await?;
            node_topology(
                config.domain_labels(),
                config.driver_name(),
                config.node_name(),
                &labels,
            )?
        }
        _ => HashMap::new(),
    };

    let fuse: Arc<dyn FuseMounter> = match config.fuse_mode() {
        FuseMode::Direct => Arc::new(DirectFuseMounter::default()),
        FuseMode::Proxy {
            endpoint,
            connect_timeout,
        } => {
            info!(%endpoint, "Mounting volumes through the fcfsfused proxy");
            Arc::new(ProxyFuseMounter::new(endpoint, *connect_timeout))
        }
    };
    let mounter: Arc<dyn Mounter> = Arc::new(NodeMounter::default());
    let locks = VolumeLocks::new();

    if let Some(metadata) = metadata.filter(|_| config.recovery()) {
        let recovery = Arc::new(MountRecovery::new(
            config.node_name(),
            config.driver_name(),
            KubeletPaths::new(config.kubelet_dir()),
            metadata,
            fuse.clone(),
            mounter.clone(),
            config.clusters(),
            locks.clone(),
        ));
        tokio::spawn(async move {
            if let Err(error) = recovery.run().await {
                error!(%error, "Mount recovery failed");
            }
        });
    }

    let incoming = bind_incoming(csi_socket).map_err(|error| anyhow::anyhow!(error))?;
    info!("CSI plugin bound to {}", csi_socket);

    let identity = CsiIdentitySvc::new(config.driver_name());
    let node = Node::new(&config, topology, locks, mounter, fuse);
    Server::builder()
        .add_service(NodeServer::new(node))
        .add_service(IdentityServer::new(identity))
        .serve_with_incoming_shutdown(incoming, Shutdown::wait())
        .await
        .map_err(|error| {
            error!(%error, "CsiServer failed");
            error.into()
        })
}
