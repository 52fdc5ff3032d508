//! FastCFS cluster configuration.
//!
//! The plugin is deployed with a json file listing every FastCFS cluster it may provision from,
//! each with the base URL under which the cluster's client configuration files are served:
//!
//! ```json
//! [
//!   { "clusterID": "fcfs-1", "configURL": "http://fcfs-config.fastcfs.svc:8088" }
//! ]
//! ```
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Default location of the cluster configuration file.
pub const DEFAULT_CLUSTER_CONFIG: &str = "/etc/fcfs-csi-config/config.json";
/// Pool client configuration, relative to the cluster's config URL.
pub const POOL_CONFIG_FILE: &str = "/fastcfs/auth/client.conf";
/// Fuse client configuration, relative to the cluster's config URL.
pub const FUSE_CLIENT_CONFIG_FILE: &str = "/fastcfs/fcfs/fuse.conf";

/// Cluster configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to read cluster config {}: {}", path.display(), source))]
    Read {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Failed to parse cluster config: {}", source))]
    Parse { source: serde_json::Error },
    #[snafu(display("Cluster '{}' is defined more than once", cluster_id))]
    DuplicateCluster { cluster_id: String },
    #[snafu(display("Cluster '{}' is not configured", cluster_id))]
    UnknownCluster { cluster_id: String },
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    #[serde(rename = "configURL")]
    config_url: String,
}

/// The clusters known to this plugin, keyed by cluster id.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    clusters: HashMap<String, String>,
}

impl ClusterConfig {
    /// Load the configuration file. A missing file yields an empty configuration, as the
    /// node plugin may only ever serve statically provisioned volumes.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Cluster config not found");
                Ok(Self::default())
            }
            Err(error) => Err(error).context(Read { path }),
        }
    }

    /// Parse the json configuration.
    pub fn from_json(contents: &str) -> Result<Self, Error> {
        let entries: Vec<ClusterEntry> = serde_json::from_str(contents).context(Parse)?;
        Self::from_entries(entries.into_iter().map(|e| (e.cluster_id, e.config_url)))
    }

    /// Build the configuration from `(cluster id, config url)` pairs.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, Error> {
        let mut clusters = HashMap::new();
        for (cluster_id, config_url) in entries {
            let config_url = config_url.trim_end_matches('/').to_string();
            if clusters.insert(cluster_id.clone(), config_url).is_some() {
                return DuplicateCluster { cluster_id }.fail();
            }
        }
        Ok(Self { clusters })
    }

    /// Base configuration URL of the given cluster.
    pub fn config_url(&self, cluster_id: &str) -> Result<&str, Error> {
        self.clusters
            .get(cluster_id)
            .map(String::as_str)
            .context(UnknownCluster { cluster_id })
    }

    /// Number of configured clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether no cluster is configured.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}
