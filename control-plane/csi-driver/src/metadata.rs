//! Cluster metadata needed by the node plugin: its own labels for topology, and the volumes,
//! pods, claims, storage classes and secrets needed to rebuild mounts after a restart.
use crate::secret::{ClaimInfo, SecretRef};
use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod, Secret},
    storage::v1::{StorageClass, VolumeAttachment},
};
use kube::{api::ListParams, Api, Client};
use snafu::{ResultExt, Snafu};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Metadata errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to get {}: {}", resource, source))]
    Kube {
        source: kube::Error,
        resource: String,
    },
    #[snafu(display("Node '{}' not found", node))]
    NodeNotFound { node: String },
    #[snafu(display("Secret '{}' not found", secret))]
    SecretNotFound { secret: SecretRef },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Kube { .. } => tonic::Status::unavailable(error.to_string()),
            _ => tonic::Status::not_found(error.to_string()),
        }
    }
}

/// Read access to the orchestrator's objects.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Labels of the named node.
    async fn node_labels(&self, node_name: &str) -> Result<BTreeMap<String, String>, Error>;
    /// Persistent volumes of `driver_name` attached to the named node.
    async fn attached_volumes(
        &self,
        node_name: &str,
        driver_name: &str,
    ) -> Result<Vec<PersistentVolume>, Error>;
    /// Pods scheduled on the named node.
    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error>;
    /// Storage classes provisioned by `driver_name`.
    async fn storage_classes(&self, driver_name: &str) -> Result<Vec<StorageClass>, Error>;
    /// The named claim, if it exists.
    async fn claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, Error>;
    /// Decoded data of the referenced secret.
    async fn secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, Error>;
}

/// Metadata from the Kubernetes API server.
#[derive(Clone)]
pub struct KubeMetadata {
    client: Client,
}

impl KubeMetadata {
    /// New metadata service using `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
    /// New metadata service using the in-cluster or kubeconfig credentials.
    pub async fn try_default() -> Result<Self, Error> {
        let client = Client::try_default().await.context(Kube {
            resource: "kubernetes client",
        })?;
        Ok(Self::new(client))
    }
}

/// Secret values: `stringData` entries override `data` entries of the same key.
pub(crate) fn secret_data(secret: Secret) -> HashMap<String, String> {
    let mut values = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, String::from_utf8_lossy(&value.0).into_owned()))
        .collect::<HashMap<_, _>>();
    values.extend(secret.string_data.unwrap_or_default());
    values
}

/// Names of the volumes attached by `driver_name` to `node_name`.
pub(crate) fn attached_volume_names(
    attachments: &[VolumeAttachment],
    node_name: &str,
    driver_name: &str,
) -> HashSet<String> {
    attachments
        .iter()
        .filter(|va| va.spec.node_name == node_name && va.spec.attacher == driver_name)
        .filter(|va| va.status.as_ref().map_or(false, |status| status.attached))
        .filter_map(|va| va.spec.source.persistent_volume_name.clone())
        .collect()
}

#[async_trait]
impl MetadataService for KubeMetadata {
    async fn node_labels(&self, node_name: &str) -> Result<BTreeMap<String, String>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get_opt(node_name)
            .await
            .context(Kube {
                resource: format!("node {node_name}"),
            })?
            .ok_or_else(|| Error::NodeNotFound {
                node: node_name.to_string(),
            })?;
        Ok(node.metadata.labels.unwrap_or_default())
    }

    async fn attached_volumes(
        &self,
        node_name: &str,
        driver_name: &str,
    ) -> Result<Vec<PersistentVolume>, Error> {
        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        let attachments = attachments
            .list(&ListParams::default())
            .await
            .context(Kube {
                resource: "volume attachments",
            })?;
        let names = attached_volume_names(&attachments.items, node_name, driver_name);
        trace!(?names, "Attached volumes");
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = volumes
            .list(&ListParams::default())
            .await
            .context(Kube {
                resource: "persistent volumes",
            })?;
        Ok(volumes
            .items
            .into_iter()
            .filter(|pv| pv.metadata.name.as_ref().map_or(false, |n| names.contains(n)))
            .filter(|pv| {
                pv.spec
                    .as_ref()
                    .and_then(|spec| spec.csi.as_ref())
                    .map_or(false, |csi| csi.driver == driver_name)
            })
            .collect())
    }

    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = pods.list(&params).await.context(Kube {
            resource: format!("pods of node {node_name}"),
        })?;
        Ok(pods.items)
    }

    async fn storage_classes(&self, driver_name: &str) -> Result<Vec<StorageClass>, Error> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let classes = classes
            .list(&ListParams::default())
            .await
            .context(Kube {
                resource: "storage classes",
            })?;
        Ok(classes
            .items
            .into_iter()
            .filter(|class| class.provisioner == driver_name)
            .collect())
    }

    async fn claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, Error> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claim = claims.get_opt(name).await.context(Kube {
            resource: format!("claim {namespace}/{name}"),
        })?;
        Ok(claim.map(|claim| ClaimInfo {
            name: name.to_string(),
            namespace: namespace.to_string(),
            annotations: claim.metadata.annotations.unwrap_or_default(),
        }))
    }

    async fn secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        match secrets.get_opt(&secret.name).await.context(Kube {
            resource: format!("secret {secret}"),
        })? {
            Some(found) => Ok(secret_data(found)),
            None => SecretNotFound {
                secret: secret.clone(),
            }
            .fail(),
        }
    }
}
