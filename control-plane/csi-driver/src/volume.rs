//! Volume options.
//!
//! Everything needed to drive the storage engine for a single volume, built either from a
//! `CreateVolume` request, from one of our compound volume handles, or from the volume context
//! of a statically provisioned volume.
use crate::{
    cluster::{self, ClusterConfig, FUSE_CLIENT_CONFIG_FILE, POOL_CONFIG_FILE},
    volume_id::{self, VolumeIdentifier},
};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;

pub const KIB: i64 = 1024;
pub const MIB: i64 = KIB * 1024;
pub const GIB: i64 = MIB * 1024;
pub const TIB: i64 = GIB * 1024;

/// Prefix of the pool volume name of dynamically provisioned volumes.
pub const CSI_VOL_NAMING_PREFIX: &str = "csi-vol-";
/// Parameter and volume context entry naming the FastCFS cluster.
pub const CLUSTER_ID_PARAM: &str = "clusterID";
/// Volume context entry flagging a statically provisioned volume.
pub const STATIC_VOLUME_PARAM: &str = "static";

/// Volume option errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("{} must be set", CLUSTER_ID_PARAM))]
    MissingClusterId {},
    #[snafu(display("Invalid volume id '{}': {}", volume_id, source))]
    InvalidVolumeId {
        source: volume_id::Error,
        volume_id: String,
    },
    #[snafu(display("Failed to compose the volume id of '{}': {}", name, source))]
    ComposeVolumeId {
        source: volume_id::Error,
        name: String,
    },
    #[snafu(display("Volume '{}' is not statically provisioned", volume_id))]
    NonStaticVolume { volume_id: String },
    #[snafu(display("Failed to parse the '{}' flag '{}'", STATIC_VOLUME_PARAM, value))]
    InvalidStaticFlag { value: String },
    #[snafu(display("{}", source))]
    Cluster { source: cluster::Error },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Cluster { .. } => tonic::Status::failed_precondition(error.to_string()),
            _ => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// Round up to whole GiB's, with a minimum of 1GiB.
pub fn round_off_bytes(bytes: i64) -> i64 {
    if bytes < GIB {
        return GIB;
    }
    round_up_gib(bytes).saturating_mul(GIB)
}

/// Number of GiB's needed to hold `bytes`.
pub fn round_up_gib(bytes: i64) -> i64 {
    let bytes = bytes.max(0);
    bytes / GIB + i64::from(bytes % GIB != 0)
}

/// Storage engine view of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeOptions {
    /// The CSI volume handle.
    pub volume_id: String,
    /// The pool volume name.
    pub volume_name: String,
    pub cluster_id: String,
    /// Base URL of the cluster's client configuration files.
    pub base_config_url: String,
    pub capacity_bytes: i64,
    /// The volume was created outside of the plugin and is mounted as its own user.
    pub pre_provisioned: bool,
}

impl VolumeOptions {
    /// Options of a volume about to be created on behalf of `owner`.
    pub fn from_create_request(
        request_name: &str,
        parameters: &HashMap<String, String>,
        required_bytes: i64,
        owner: &str,
        clusters: &ClusterConfig,
    ) -> Result<Self, Error> {
        let cluster_id = match parameters.get(CLUSTER_ID_PARAM) {
            Some(cluster_id) if !cluster_id.is_empty() => cluster_id,
            _ => return MissingClusterId {}.fail(),
        };
        let volume_name = format!("{CSI_VOL_NAMING_PREFIX}{request_name}");
        let volume_id = VolumeIdentifier::new(cluster_id, owner, &volume_name)
            .compose()
            .context(ComposeVolumeId { name: request_name })?;
        let base_config_url = clusters.config_url(cluster_id).context(Cluster)?;

        Ok(Self {
            volume_id,
            volume_name,
            cluster_id: cluster_id.clone(),
            base_config_url: base_config_url.to_string(),
            capacity_bytes: round_off_bytes(required_bytes),
            pre_provisioned: false,
        })
    }

    /// Options of a dynamically provisioned volume, from its handle.
    pub fn from_volume_id(
        volume_id: &str,
        required_bytes: Option<i64>,
        clusters: &ClusterConfig,
    ) -> Result<Self, Error> {
        let cid = VolumeIdentifier::decompose(volume_id).context(InvalidVolumeId { volume_id })?;
        let base_config_url = clusters.config_url(cid.cluster_id()).context(Cluster)?;
        Ok(Self {
            volume_id: volume_id.to_string(),
            volume_name: cid.volume_name().to_string(),
            cluster_id: cid.cluster_id().to_string(),
            base_config_url: base_config_url.to_string(),
            capacity_bytes: required_bytes.unwrap_or_default(),
            pre_provisioned: false,
        })
    }

    /// Options of a statically provisioned volume, whose handle is the pool volume name.
    pub fn from_static(
        volume_id: &str,
        volume_context: &HashMap<String, String>,
        clusters: &ClusterConfig,
    ) -> Result<Self, Error> {
        let is_static = match volume_context.get(STATIC_VOLUME_PARAM) {
            None => false,
            Some(value) => parse_bool(value).ok_or_else(|| Error::InvalidStaticFlag {
                value: value.clone(),
            })?,
        };
        if !is_static {
            return NonStaticVolume { volume_id }.fail();
        }
        let cluster_id = match volume_context.get(CLUSTER_ID_PARAM) {
            Some(cluster_id) if !cluster_id.is_empty() => cluster_id,
            _ => return MissingClusterId {}.fail(),
        };
        let base_config_url = clusters.config_url(cluster_id).context(Cluster)?;
        Ok(Self {
            volume_id: volume_id.to_string(),
            volume_name: volume_id.to_string(),
            cluster_id: cluster_id.clone(),
            base_config_url: base_config_url.to_string(),
            capacity_bytes: 0,
            pre_provisioned: true,
        })
    }

    /// Options of a volume which is about to be mounted.
    /// Handles which don't decode are looked up as statically provisioned volumes.
    pub fn resolve(
        volume_id: &str,
        volume_context: &HashMap<String, String>,
        clusters: &ClusterConfig,
    ) -> Result<Self, Error> {
        match Self::from_volume_id(volume_id, None, clusters) {
            Err(Error::InvalidVolumeId { .. }) => {
                Self::from_static(volume_id, volume_context, clusters)
            }
            result => result,
        }
    }

    /// Pool client configuration URL.
    pub fn pool_config_url(&self) -> String {
        format!("{}{POOL_CONFIG_FILE}", self.base_config_url)
    }
    /// Fuse client configuration URL.
    pub fn fuse_config_url(&self) -> String {
        format!("{}{FUSE_CLIENT_CONFIG_FILE}", self.base_config_url)
    }
}

/// Boolean parsing accepting the same spellings as the CO's own tooling.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Union of `base` and the capability mount flags, without duplicates, keeping order.
pub fn construct_mount_options(base: &[&str], mount_flags: &[String]) -> Vec<String> {
    let mut options: Vec<String> = Vec::with_capacity(base.len() + mount_flags.len());
    for option in base
        .iter()
        .map(|o| o.to_string())
        .chain(mount_flags.iter().cloned())
    {
        if !options.contains(&option) {
            options.push(option);
        }
    }
    options
}
