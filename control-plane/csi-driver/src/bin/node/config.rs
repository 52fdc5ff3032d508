use anyhow::Context;
use clap::ArgMatches;
use csi_driver::cluster::ClusterConfig;
use std::{path::PathBuf, sync::Arc, time::Duration};

/// Where the fcfs_fused daemons are run from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FuseMode {
    /// Spawned by the node plugin itself.
    Direct,
    /// Spawned by the fcfsfused-proxy sidecar, listening on `endpoint`.
    Proxy {
        endpoint: String,
        connect_timeout: Duration,
    },
}

/// Node plugin configuration parameters.
#[derive(Debug)]
pub(crate) struct NodeConfig {
    node_name: String,
    driver_name: String,
    clusters: Arc<ClusterConfig>,
    domain_labels: String,
    max_volumes_per_node: i64,
    kubelet_dir: PathBuf,
    fuse_mode: FuseMode,
    recovery: bool,
}

impl NodeConfig {
    /// Unique name of the node this instance runs on.
    pub(crate) fn node_name(&self) -> &str {
        &self.node_name
    }
    /// Name the driver registers with.
    pub(crate) fn driver_name(&self) -> &str {
        &self.driver_name
    }
    /// FastCFS clusters volumes can be mounted from.
    pub(crate) fn clusters(&self) -> Arc<ClusterConfig> {
        self.clusters.clone()
    }
    /// Comma separated node labels reported as topology.
    pub(crate) fn domain_labels(&self) -> &str {
        &self.domain_labels
    }
    /// Maximum number of volumes the node accepts, 0 for no limit.
    pub(crate) fn max_volumes_per_node(&self) -> i64 {
        self.max_volumes_per_node
    }
    /// Kubelet root directory.
    pub(crate) fn kubelet_dir(&self) -> &PathBuf {
        &self.kubelet_dir
    }
    /// How fuse daemons are run.
    pub(crate) fn fuse_mode(&self) -> &FuseMode {
        &self.fuse_mode
    }
    /// Whether the mounts of attached volumes are rebuilt at startup.
    pub(crate) fn recovery(&self) -> bool {
        self.recovery
    }
}

impl TryFrom<&ArgMatches> for NodeConfig {
    type Error = anyhow::Error;
    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let arg = |name: &str| {
            matches
                .get_one::<String>(name)
                .with_context(|| format!("{name} must be specified"))
        };

        let node_name = arg("node-name")?.clone();
        if node_name.is_empty() {
            anyhow::bail!("node-name must not be empty");
        }

        let cluster_config = arg("cluster-config")?;
        let clusters = ClusterConfig::load(cluster_config)
            .with_context(|| format!("Failed to load the cluster configuration {cluster_config}"))?;

        let max_volumes_per_node = arg("max-volumes-per-node")?
            .parse::<i64>()
            .map_err(|error| anyhow::anyhow!("Invalid value for max-volumes-per-node: {error}"))?;
        if max_volumes_per_node < 0 {
            anyhow::bail!("max-volumes-per-node must not be negative");
        }

        let fuse_mode = if matches.get_flag("enable-fcfsfused-proxy") {
            let connect_timeout = arg("fcfsfused-proxy-conn-timeout")?
                .parse::<u64>()
                .map_err(|error| {
                    anyhow::anyhow!("Invalid value for fcfsfused-proxy-conn-timeout: {error}")
                })?;
            FuseMode::Proxy {
                endpoint: arg("fcfsfused-proxy-endpoint")?.clone(),
                connect_timeout: Duration::from_secs(connect_timeout),
            }
        } else {
            FuseMode::Direct
        };

        Ok(Self {
            node_name,
            driver_name: arg("driver-name")?.clone(),
            clusters: Arc::new(clusters),
            domain_labels: matches
                .get_one::<String>("domain-labels")
                .cloned()
                .unwrap_or_default(),
            max_volumes_per_node,
            kubelet_dir: PathBuf::from(arg("kubelet-dir")?),
            fuse_mode,
            recovery: !matches.get_flag("skip-recovery"),
        })
    }
}
