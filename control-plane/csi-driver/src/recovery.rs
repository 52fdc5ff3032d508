//! Remount of fuse volumes after a node plugin restart.
//!
//! Fuse daemons started by the node plugin die with its container, leaving every global mount
//! and every pod bind mount of their volumes disconnected. On startup the node plugin finds the
//! volumes attached to its node, remounts their global paths and restores the bind mounts of
//! the pods using them, including their sub-path mounts. Each volume is recovered in its own
//! task and a failure only affects the volume, pod or sub-path it happened on.
use crate::{
    cluster::ClusterConfig,
    engine::{self, FuseMounter},
    limiter::VolumeLocks,
    metadata::{self, MetadataService},
    mount::Mounter,
    mount_point::{self, ensure_mount_point},
    secret::{self, node_stage_secret_ref, SecretRef},
    volume::{self, construct_mount_options, VolumeOptions},
};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use snafu::{ResultExt, Snafu};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

/// Default kubelet root directory.
pub const KUBELET_DIR: &str = "/var/lib/kubelet";
/// Options every pod bind mount is made with.
pub const BIND_MOUNT_OPTIONS: [&str; 2] = ["bind", "_netdev"];

/// Recovery errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("{}", source))]
    Metadata { source: metadata::Error },
    #[snafu(display("Persistent volume '{}' has no CSI source", pv))]
    MissingCsiSource { pv: String },
    #[snafu(display("Secret reference of persistent volume '{}': {}", pv, source))]
    SecretRefTemplate { source: secret::Error, pv: String },
    #[snafu(display("Secret '{}' is not available", secret))]
    SecretUnavailable { secret: SecretRef },
    #[snafu(display("{}", source))]
    Volume { source: volume::Error },
    #[snafu(display("{}", source))]
    MountPoint { source: mount_point::Error },
    #[snafu(display("{}", source))]
    BindMount { source: crate::mount::Error },
    #[snafu(display("{}", source))]
    Engine { source: engine::Error },
    #[snafu(display("Mount task failed: {}", source))]
    MountTask { source: tokio::task::JoinError },
}

/// Kubelet directory layout of CSI volumes.
#[derive(Debug, Clone)]
pub struct KubeletPaths {
    root: PathBuf,
}

impl Default for KubeletPaths {
    fn default() -> Self {
        Self::new(KUBELET_DIR)
    }
}

impl KubeletPaths {
    /// Layout under the given kubelet root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
    /// Staging path of a persistent volume.
    pub fn global_mount(&self, pv_name: &str) -> PathBuf {
        self.root
            .join("plugins/kubernetes.io/csi/pv")
            .join(pv_name)
            .join("globalmount")
    }
    /// Publish path of a persistent volume for a pod.
    pub fn pod_volume(&self, pod_uid: &str, pv_name: &str) -> PathBuf {
        self.root
            .join("pods")
            .join(pod_uid)
            .join("volumes/kubernetes.io~csi")
            .join(pv_name)
            .join("mount")
    }
    /// Path of the `index`th volume mount of a container, which mounts a sub-path of the
    /// pod volume `volume_name`.
    pub fn sub_path(
        &self,
        pod_uid: &str,
        volume_name: &str,
        container: &str,
        index: usize,
    ) -> PathBuf {
        self.root
            .join("pods")
            .join(pod_uid)
            .join("volume-subpaths")
            .join(volume_name)
            .join(container)
            .join(index.to_string())
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Volumes whose global mount is healthy again.
    pub recovered: usize,
    /// Volumes which could not be remounted.
    pub failed: usize,
    /// Volumes without pods, without a secret or busy with another operation.
    pub skipped: usize,
}

/// A sub-path mount of a pod volume.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubPathMount {
    container: String,
    index: usize,
    sub_path: String,
}

/// A pod using a persistent volume.
#[derive(Debug, Clone)]
struct PodMount {
    uid: String,
    /// Name of the volume in the pod spec.
    volume_name: String,
    read_only: bool,
    sub_paths: Vec<SubPathMount>,
}

/// Everything needed to remount one persistent volume.
struct VolumePlan {
    pv_name: String,
    volume: VolumeOptions,
    secrets: Arc<HashMap<String, String>>,
    mount_flags: Vec<String>,
    pods: Vec<PodMount>,
}

/// Pods on this node indexed by the claims they use, `(namespace, claim)`, deduplicated by UID.
fn pods_by_claim(pods: &[Pod]) -> HashMap<(String, String), BTreeMap<String, PodMount>> {
    let mut index: HashMap<(String, String), BTreeMap<String, PodMount>> = HashMap::new();
    for pod in pods {
        let (Some(uid), Some(spec)) = (pod.metadata.uid.as_ref(), pod.spec.as_ref()) else {
            continue;
        };
        let terminated = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map_or(false, |phase| matches!(phase, "Succeeded" | "Failed"));
        if terminated {
            continue;
        }
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();

        for volume in spec.volumes.iter().flatten() {
            let Some(claim) = volume.persistent_volume_claim.as_ref() else {
                continue;
            };
            let sub_paths = spec
                .init_containers
                .iter()
                .flatten()
                .chain(&spec.containers)
                .flat_map(|container| {
                    container
                        .volume_mounts
                        .iter()
                        .flatten()
                        .enumerate()
                        .filter(|(_, mount)| mount.name == volume.name)
                        .filter_map(|(index, mount)| {
                            let sub_path = mount.sub_path.as_deref().filter(|p| !p.is_empty())?;
                            Some(SubPathMount {
                                container: container.name.clone(),
                                index,
                                sub_path: sub_path.to_string(),
                            })
                        })
                })
                .collect();

            index
                .entry((namespace.clone(), claim.claim_name.clone()))
                .or_default()
                .entry(uid.clone())
                .or_insert(PodMount {
                    uid: uid.clone(),
                    volume_name: volume.name.clone(),
                    read_only: claim.read_only.unwrap_or_default(),
                    sub_paths,
                });
        }
    }
    index
}

/// Rebuilds the fuse mounts of the volumes attached to this node.
pub struct MountRecovery {
    node_name: String,
    driver_name: String,
    paths: KubeletPaths,
    metadata: Arc<dyn MetadataService>,
    fuse: Arc<dyn FuseMounter>,
    mounter: Arc<dyn Mounter>,
    clusters: Arc<ClusterConfig>,
    locks: VolumeLocks,
}

impl MountRecovery {
    /// New recovery for the volumes of `driver_name` on `node_name`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        driver_name: impl Into<String>,
        paths: KubeletPaths,
        metadata: Arc<dyn MetadataService>,
        fuse: Arc<dyn FuseMounter>,
        mounter: Arc<dyn Mounter>,
        clusters: Arc<ClusterConfig>,
        locks: VolumeLocks,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            driver_name: driver_name.into(),
            paths,
            metadata,
            fuse,
            mounter,
            clusters,
            locks,
        }
    }

    /// Run a recovery pass. Only failures to list the volumes and pods of the node abort
    /// the whole pass. Each volume is recovered in a task of its own.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn run(self: &Arc<Self>) -> Result<RecoveryReport, Error> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        let volumes = self
            .metadata
            .attached_volumes(&self.node_name, &self.driver_name)
            .await
            .context(Metadata)?;
        if volumes.is_empty() {
            info!("No attached volumes to recover");
            return Ok(report);
        }
        let classes = self
            .metadata
            .storage_classes(&self.driver_name)
            .await
            .context(Metadata)?
            .into_iter()
            .filter_map(|class| Some((class.metadata.name?, class.parameters.unwrap_or_default())))
            .collect::<HashMap<_, _>>();
        let pods = self
            .metadata
            .pods_on_node(&self.node_name)
            .await
            .context(Metadata)?;
        let mut pods = pods_by_claim(&pods);

        let mut secrets = HashMap::<SecretRef, Option<Arc<HashMap<String, String>>>>::new();
        let mut plans = Vec::with_capacity(volumes.len());
        for pv in volumes {
            let pv_name = pv.metadata.name.clone().unwrap_or_default();
            match self.plan(pv, &mut pods, &classes, &mut secrets).await {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => report.skipped += 1,
                Err(error) => {
                    error!(pv = %pv_name, %error, "Failed to prepare volume recovery");
                    report.failed += 1;
                }
            }
        }

        let (pv_names, tasks): (Vec<_>, Vec<_>) = plans
            .into_iter()
            .map(|plan| {
                let recovery = self.clone();
                (
                    plan.pv_name.clone(),
                    tokio::spawn(recovery.recover_volume(plan).in_current_span()),
                )
            })
            .unzip();
        for (pv_name, result) in pv_names.iter().zip(join_all(tasks).await) {
            match result.context(MountTask).and_then(|result| result) {
                Ok(true) => report.recovered += 1,
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    error!(pv = %pv_name, %error, "Failed to recover volume");
                    report.failed += 1;
                }
            }
        }

        info!(
            ?report,
            elapsed = %humantime::format_duration(started.elapsed()),
            "Mount recovery completed"
        );
        Ok(report)
    }

    /// Plan the recovery of a volume, None if it has nothing to recover or no secret.
    async fn plan(
        &self,
        pv: PersistentVolume,
        pods: &mut HashMap<(String, String), BTreeMap<String, PodMount>>,
        classes: &HashMap<String, BTreeMap<String, String>>,
        secrets: &mut HashMap<SecretRef, Option<Arc<HashMap<String, String>>>>,
    ) -> Result<Option<VolumePlan>, Error> {
        let pv_name = pv.metadata.name.unwrap_or_default();
        let spec = pv.spec.unwrap_or_default();
        let Some(csi) = spec.csi else {
            return MissingCsiSource { pv: pv_name }.fail();
        };

        let claim_ref = spec
            .claim_ref
            .as_ref()
            .and_then(|claim| Some((claim.namespace.clone()?, claim.name.clone()?)));
        let volume_pods = claim_ref
            .as_ref()
            .and_then(|claim| pods.remove(claim))
            .unwrap_or_default();
        if volume_pods.is_empty() {
            debug!(pv = %pv_name, "No pods on this node use the volume");
            return Ok(None);
        }

        let secret_ref = match csi.node_stage_secret_ref.as_ref() {
            Some(reference) => reference
                .name
                .as_ref()
                .map(|name| SecretRef::new(reference.namespace.clone().unwrap_or_default(), name)),
            None => {
                let parameters = spec
                    .storage_class_name
                    .as_ref()
                    .and_then(|class| classes.get(class));
                match parameters {
                    None => None,
                    Some(parameters) => {
                        let claim = match &claim_ref {
                            Some((namespace, name)) => self
                                .metadata
                                .claim(namespace, name)
                                .await
                                .context(Metadata)?,
                            None => None,
                        };
                        node_stage_secret_ref(parameters, &pv_name, claim.as_ref())
                            .context(SecretRefTemplate { pv: &pv_name })?
                    }
                }
            }
        };
        let Some(secret_ref) = secret_ref else {
            warn!(pv = %pv_name, "No node stage secret, skipping");
            return Ok(None);
        };

        let secret = match secrets.get(&secret_ref) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = match self.metadata.secret(&secret_ref).await {
                    Ok(values) => Some(Arc::new(values)),
                    Err(error) => {
                        error!(secret = %secret_ref, %error, "Failed to get secret");
                        None
                    }
                };
                secrets.insert(secret_ref.clone(), fetched.clone());
                fetched
            }
        };
        let Some(secrets) = secret else {
            return SecretUnavailable { secret: secret_ref }.fail();
        };

        let attributes = csi
            .volume_attributes
            .unwrap_or_default()
            .into_iter()
            .collect::<HashMap<_, _>>();
        let volume = VolumeOptions::resolve(&csi.volume_handle, &attributes, &self.clusters)
            .context(Volume)?;

        Ok(Some(VolumePlan {
            pv_name,
            volume,
            secrets,
            mount_flags: spec.mount_options.unwrap_or_default(),
            pods: volume_pods.into_values().collect(),
        }))
    }

    /// Remount the global path of the volume and restore its pod mounts.
    /// False if another operation on the volume is in progress.
    #[instrument(skip_all, fields(pv = %plan.pv_name, volume.id = %plan.volume.volume_id))]
    async fn recover_volume(self: Arc<Self>, plan: VolumePlan) -> Result<bool, Error> {
        let Ok(_guard) = self.locks.guard(&plan.volume.volume_id) else {
            warn!("Volume is busy, skipping");
            return Ok(false);
        };

        let global = self.paths.global_mount(&plan.pv_name);
        let mounter = self.mounter.clone();
        let path = global.clone();
        let healthy = blocking(move || {
            ensure_mount_point(mounter.as_ref(), &path).context(MountPoint)
        })
        .await?;
        if healthy {
            debug!(path = %global.display(), "Global mount is healthy");
        } else {
            info!(path = %global.display(), "Remounting global mount");
            self.fuse
                .mount(&plan.volume, &global, &plan.secrets)
                .await
                .context(Engine)?;
        }

        let recovery = self.clone();
        blocking(move || {
            for pod in &plan.pods {
                if let Err(error) = recovery.recover_pod(&plan, &global, pod) {
                    error!(pod.uid = %pod.uid, %error, "Failed to recover pod mount");
                }
            }
            Ok(())
        })
        .await?;
        Ok(true)
    }

    fn recover_pod(&self, plan: &VolumePlan, global: &Path, pod: &PodMount) -> Result<(), Error> {
        let mounter = self.mounter.as_ref();
        let target = self.paths.pod_volume(&pod.uid, &plan.pv_name);
        if !ensure_mount_point(mounter, &target).context(MountPoint)? {
            let mut options = construct_mount_options(&BIND_MOUNT_OPTIONS, &plan.mount_flags);
            if pod.read_only {
                options.push("ro".to_string());
            }
            mounter
                .bind_mount(global, &target, &options)
                .context(BindMount)?;
            info!(pod.uid = %pod.uid, path = %target.display(), "Restored pod mount");
        }

        for sub_path in &pod.sub_paths {
            let sub_target =
                self.paths
                    .sub_path(&pod.uid, &pod.volume_name, &sub_path.container, sub_path.index);
            let result = ensure_mount_point(mounter, &sub_target)
                .context(MountPoint)
                .and_then(|mounted| match mounted {
                    true => Ok(()),
                    false => mounter
                        .bind_mount(
                            &target.join(&sub_path.sub_path),
                            &sub_target,
                            &["bind".to_string()],
                        )
                        .context(BindMount),
                });
            match result {
                Ok(()) => debug!(path = %sub_target.display(), "Sub-path mount is healthy"),
                Err(error) => error!(
                    pod.uid = %pod.uid,
                    container = %sub_path.container,
                    %error,
                    "Failed to recover sub-path mount"
                ),
            }
        }
        Ok(())
    }
}

/// Run the mount table calls of `f` on the blocking pool, within the current span.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Result<T, Error> {
    let span = Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .context(MountTask)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::{ADMIN_NAME, ADMIN_SECRET_KEY},
        mount_point::testing::{FakeMount, FakeMounter},
        secret::ClaimInfo,
        volume_id::VolumeIdentifier,
    };
    use async_trait::async_trait;
    use k8s_openapi::{
        api::{
            core::v1::{
                CSIPersistentVolumeSource, Container, ObjectReference,
                PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, SecretReference,
                Volume as PodVolume, VolumeMount,
            },
            storage::v1::StorageClass,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use std::{
        collections::HashSet,
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Condvar, Mutex,
        },
        time::Duration,
    };

    const DRIVER: &str = "fcfs.csi.vazmin.github.io";

    #[derive(Default)]
    struct FakeMetadata {
        volumes: Vec<PersistentVolume>,
        pods: Vec<Pod>,
        classes: Vec<StorageClass>,
        secrets: HashMap<SecretRef, HashMap<String, String>>,
        secret_lookups: Mutex<Vec<SecretRef>>,
    }

    #[async_trait]
    impl MetadataService for FakeMetadata {
        async fn node_labels(&self, _: &str) -> Result<BTreeMap<String, String>, metadata::Error> {
            Ok(BTreeMap::new())
        }
        async fn attached_volumes(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<PersistentVolume>, metadata::Error> {
            Ok(self.volumes.clone())
        }
        async fn pods_on_node(&self, _: &str) -> Result<Vec<Pod>, metadata::Error> {
            Ok(self.pods.clone())
        }
        async fn storage_classes(&self, _: &str) -> Result<Vec<StorageClass>, metadata::Error> {
            Ok(self.classes.clone())
        }
        async fn claim(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ClaimInfo>, metadata::Error> {
            Ok(Some(ClaimInfo {
                name: name.to_string(),
                namespace: namespace.to_string(),
                annotations: BTreeMap::new(),
            }))
        }
        async fn secret(
            &self,
            secret: &SecretRef,
        ) -> Result<HashMap<String, String>, metadata::Error> {
            self.secret_lookups.lock().unwrap().push(secret.clone());
            self.secrets
                .get(secret)
                .cloned()
                .ok_or_else(|| metadata::Error::SecretNotFound {
                    secret: secret.clone(),
                })
        }
    }

    /// Fuse mounts which succeed by marking the target healthy in the mount table,
    /// except for the volumes listed in `failing`.
    struct FakeFuse {
        mounter: Arc<FakeMounter>,
        mounted: Mutex<Vec<(String, PathBuf)>>,
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl FuseMounter for FakeFuse {
        async fn mount(
            &self,
            volume: &VolumeOptions,
            target: &Path,
            secrets: &HashMap<String, String>,
        ) -> Result<(), engine::Error> {
            assert!(secrets.contains_key(ADMIN_NAME));
            if self.failing.lock().unwrap().contains(&volume.volume_name) {
                return Err(engine::Error::Failed {
                    operation: engine::Operation::Restart,
                    volume: volume.volume_name.clone(),
                    exit_code: Some(1),
                    output: "connection refused".to_string(),
                });
            }
            self.mounted
                .lock()
                .unwrap()
                .push((volume.volume_name.clone(), target.to_path_buf()));
            self.mounter.set_mount(target, FakeMount::Healthy);
            Ok(())
        }
    }

    fn admin_secret() -> HashMap<String, String> {
        HashMap::from([
            (ADMIN_NAME.to_string(), "admin".to_string()),
            (ADMIN_SECRET_KEY.to_string(), "key".to_string()),
        ])
    }

    fn handle(name: &str) -> String {
        VolumeIdentifier::new("1", "admin", &format!("csi-vol-{name}"))
            .compose()
            .unwrap()
    }

    fn pv(name: &str, claim: &str, secret: Option<&str>, class: Option<&str>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: DRIVER.to_string(),
                    volume_handle: handle(name),
                    node_stage_secret_ref: secret.map(|secret| SecretReference {
                        name: Some(secret.to_string()),
                        namespace: Some("fcfs".to_string()),
                    }),
                    ..Default::default()
                }),
                claim_ref: Some(ObjectReference {
                    name: Some(claim.to_string()),
                    namespace: Some("default".to_string()),
                    ..Default::default()
                }),
                storage_class_name: class.map(ToString::to_string),
                mount_options: Some(vec!["noatime".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(uid: &str, claims: &[&str], sub_path: Option<&str>) -> Pod {
        let volumes = claims
            .iter()
            .map(|claim| PodVolume {
                name: format!("vol-{claim}"),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let volume_mounts = sub_path.map(|sub_path| {
            vec![
                VolumeMount {
                    name: "config".to_string(),
                    mount_path: "/etc/app".to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: format!("vol-{}", claims[0]),
                    mount_path: "/data".to_string(),
                    sub_path: Some(sub_path.to_string()),
                    ..Default::default()
                },
            ]
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{uid}")),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    volume_mounts,
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct Fixture {
        recovery: Arc<MountRecovery>,
        mounter: Arc<FakeMounter>,
        fuse: Arc<FakeFuse>,
        metadata: Arc<FakeMetadata>,
        locks: VolumeLocks,
        paths: KubeletPaths,
    }

    fn fixture(metadata: FakeMetadata, mounter: FakeMounter) -> Fixture {
        let mounter = Arc::new(mounter);
        fixture_with(metadata, mounter.clone(), mounter)
    }

    /// Fixture whose recovery goes through `host` for the mount table, while fuse mounts
    /// are recorded in `mounter`.
    fn fixture_with(
        metadata: FakeMetadata,
        mounter: Arc<FakeMounter>,
        host: Arc<dyn Mounter>,
    ) -> Fixture {
        let metadata = Arc::new(metadata);
        let fuse = Arc::new(FakeFuse {
            mounter: mounter.clone(),
            mounted: Default::default(),
            failing: Default::default(),
        });
        let clusters =
            ClusterConfig::from_entries([("1".to_string(), "http://fcfs".to_string())]).unwrap();
        let paths = KubeletPaths::new("/kubelet");
        let locks = VolumeLocks::new();
        let recovery = Arc::new(MountRecovery::new(
            "node-1",
            DRIVER,
            paths.clone(),
            metadata.clone(),
            fuse.clone(),
            host,
            Arc::new(clusters),
            locks.clone(),
        ));
        Fixture {
            recovery,
            mounter,
            fuse,
            metadata,
            locks,
            paths,
        }
    }

    #[test]
    fn kubelet_paths() {
        let paths = KubeletPaths::default();
        assert_eq!(
            paths.global_mount("pv-1"),
            Path::new("/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pv-1/globalmount")
        );
        assert_eq!(
            paths.pod_volume("uid-1", "pv-1"),
            Path::new("/var/lib/kubelet/pods/uid-1/volumes/kubernetes.io~csi/pv-1/mount")
        );
        assert_eq!(
            paths.sub_path("uid-1", "data", "app", 1),
            Path::new("/var/lib/kubelet/pods/uid-1/volume-subpaths/data/app/1")
        );
    }

    #[test]
    fn pods_deduplicated_by_uid() {
        let pods = [
            pod("uid-1", &["claim-a", "claim-b"], None),
            pod("uid-1", &["claim-a"], None),
            pod("uid-2", &["claim-a"], Some("logs")),
        ];
        let index = pods_by_claim(&pods);
        let users = &index[&("default".to_string(), "claim-a".to_string())];
        assert_eq!(
            users.keys().cloned().collect::<HashSet<_>>(),
            HashSet::from(["uid-1".to_string(), "uid-2".to_string()])
        );
        assert_eq!(
            users["uid-2"].sub_paths,
            vec![SubPathMount {
                container: "app".to_string(),
                index: 1,
                sub_path: "logs".to_string(),
            }]
        );
        assert_eq!(index[&("default".to_string(), "claim-b".to_string())].len(), 1);
    }

    #[test]
    fn init_container_sub_paths() {
        let mut pod = pod("uid-1", &["claim-a"], Some("logs"));
        if let Some(spec) = pod.spec.as_mut() {
            spec.init_containers = Some(vec![Container {
                name: "init".to_string(),
                volume_mounts: Some(vec![VolumeMount {
                    name: "vol-claim-a".to_string(),
                    mount_path: "/seed".to_string(),
                    sub_path: Some("seed".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }]);
        }
        let index = pods_by_claim(&[pod]);
        let users = &index[&("default".to_string(), "claim-a".to_string())];
        assert_eq!(
            users["uid-1"].sub_paths,
            vec![
                SubPathMount {
                    container: "init".to_string(),
                    index: 0,
                    sub_path: "seed".to_string(),
                },
                SubPathMount {
                    container: "app".to_string(),
                    index: 1,
                    sub_path: "logs".to_string(),
                },
            ]
        );
    }

    fn good_volumes(count: usize) -> FakeMetadata {
        FakeMetadata {
            volumes: (1..=count)
                .map(|i| pv(&format!("pv-{i}"), &format!("claim-{i}"), Some("good"), None))
                .collect(),
            pods: (1..=count)
                .map(|i| pod(&format!("uid-{i}"), &[format!("claim-{i}").as_str()], None))
                .collect(),
            secrets: HashMap::from([(SecretRef::new("fcfs", "good"), admin_secret())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn remount_failure_is_isolated() {
        let f = fixture(good_volumes(3), FakeMounter::default());
        f.fuse
            .failing
            .lock()
            .unwrap()
            .insert("csi-vol-pv-2".to_string());

        let report = f.recovery.run().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered: 2,
                failed: 1,
                skipped: 0
            }
        );
        let targets = f
            .mounter
            .binds()
            .into_iter()
            .map(|(_, target, _)| target)
            .collect::<HashSet<_>>();
        assert_eq!(
            targets,
            HashSet::from([
                f.paths.pod_volume("uid-1", "pv-1"),
                f.paths.pod_volume("uid-3", "pv-3"),
            ])
        );
        assert!(!f.locks.is_locked(&handle("pv-2")));
    }

    /// Holds each global mount check until `expected` of them are in progress at once.
    struct Rendezvous {
        inner: Arc<FakeMounter>,
        expected: usize,
        arrived: Mutex<usize>,
        all_arrived: Condvar,
        timed_out: AtomicBool,
    }

    impl Mounter for Rendezvous {
        fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
            if path.ends_with("globalmount") {
                let mut arrived = self.arrived.lock().unwrap();
                *arrived += 1;
                self.all_arrived.notify_all();
                let (_arrived, wait) = self
                    .all_arrived
                    .wait_timeout_while(arrived, Duration::from_secs(5), |arrived| {
                        *arrived < self.expected
                    })
                    .unwrap();
                if wait.timed_out() {
                    self.timed_out.store(true, Ordering::SeqCst);
                }
            }
            self.inner.is_mount_point(path)
        }
        fn probe(&self, path: &Path) -> io::Result<()> {
            self.inner.probe(path)
        }
        fn make_dir(&self, path: &Path) -> io::Result<()> {
            self.inner.make_dir(path)
        }
        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            options: &[String],
        ) -> Result<(), crate::mount::Error> {
            self.inner.bind_mount(source, target, options)
        }
        fn unmount(&self, target: &Path) -> Result<(), crate::mount::Error> {
            self.inner.unmount(target)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn volumes_recover_concurrently() {
        let mounter = Arc::new(FakeMounter::default());
        let host = Arc::new(Rendezvous {
            inner: mounter.clone(),
            expected: 3,
            arrived: Mutex::new(0),
            all_arrived: Condvar::new(),
            timed_out: AtomicBool::new(false),
        });
        let f = fixture_with(good_volumes(3), mounter, host.clone());

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.recovered, 3);
        assert!(!host.timed_out.load(Ordering::SeqCst));
        assert_eq!(f.fuse.mounted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let metadata = FakeMetadata {
            volumes: vec![
                pv("pv-1", "claim-1", Some("good"), None),
                pv("pv-2", "claim-2", Some("missing"), None),
                pv("pv-3", "claim-3", Some("good"), None),
            ],
            pods: vec![
                pod("uid-1", &["claim-1", "claim-2"], None),
                pod("uid-2", &["claim-3"], None),
            ],
            secrets: HashMap::from([(SecretRef::new("fcfs", "good"), admin_secret())]),
            ..Default::default()
        };
        let f = fixture(metadata, FakeMounter::default());

        let report = f.recovery.run().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered: 2,
                failed: 1,
                skipped: 0
            }
        );
        // Each distinct secret is only fetched once.
        assert_eq!(f.metadata.secret_lookups.lock().unwrap().len(), 2);

        let mounted = f.fuse.mounted.lock().unwrap().clone();
        assert_eq!(mounted.len(), 2);
        let binds = f.mounter.binds();
        assert_eq!(binds.len(), 2);
        for (source, target, options) in binds {
            assert!(source.ends_with("globalmount"));
            assert!(target.ends_with("mount"));
            assert_eq!(options, ["bind", "_netdev", "noatime"]);
        }
        assert!(!f.locks.is_locked(&handle("pv-1")));
    }

    #[tokio::test]
    async fn corrupted_mounts_are_remounted() {
        let metadata = FakeMetadata {
            volumes: vec![pv("pv-1", "claim-1", Some("good"), None)],
            pods: vec![pod("uid-1", &["claim-1"], Some("logs"))],
            secrets: HashMap::from([(SecretRef::new("fcfs", "good"), admin_secret())]),
            ..Default::default()
        };
        let paths = KubeletPaths::new("/kubelet");
        let global = paths.global_mount("pv-1");
        let target = paths.pod_volume("uid-1", "pv-1");
        let sub_target = paths.sub_path("uid-1", "vol-claim-1", "app", 1);
        let mounter = FakeMounter::default()
            .with_mount(&global, FakeMount::Disconnected)
            .with_mount(&target, FakeMount::Disconnected)
            .with_mount(&sub_target, FakeMount::Unreadable);
        let f = fixture(metadata, mounter);

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(
            f.mounter.unmounts(),
            vec![global.clone(), target.clone(), sub_target.clone()]
        );
        assert_eq!(f.mounter.mount(&global), Some(FakeMount::Healthy));
        assert_eq!(
            f.mounter.binds(),
            vec![
                (
                    global.clone(),
                    target.clone(),
                    vec!["bind".into(), "_netdev".into(), "noatime".into()]
                ),
                (target.join("logs"), sub_target.clone(), vec!["bind".into()]),
            ]
        );
        assert_eq!(f.paths.global_mount("pv-1"), global);
    }

    #[tokio::test]
    async fn healthy_mounts_are_left_alone() {
        let metadata = FakeMetadata {
            volumes: vec![pv("pv-1", "claim-1", Some("good"), None)],
            pods: vec![pod("uid-1", &["claim-1"], None)],
            secrets: HashMap::from([(SecretRef::new("fcfs", "good"), admin_secret())]),
            ..Default::default()
        };
        let paths = KubeletPaths::new("/kubelet");
        let mounter = FakeMounter::default()
            .with_mount(paths.global_mount("pv-1"), FakeMount::Healthy)
            .with_mount(paths.pod_volume("uid-1", "pv-1"), FakeMount::Healthy);
        let f = fixture(metadata, mounter);

        let report = f.recovery.run().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert!(f.fuse.mounted.lock().unwrap().is_empty());
        assert!(f.mounter.binds().is_empty());
        assert!(f.mounter.unmounts().is_empty());
    }

    #[tokio::test]
    async fn skips_unused_busy_and_secretless_volumes() {
        let mut class = StorageClass {
            metadata: ObjectMeta {
                name: Some("fcfs".to_string()),
                ..Default::default()
            },
            provisioner: DRIVER.to_string(),
            ..Default::default()
        };
        class.parameters = Some(BTreeMap::from([
            (
                "csi.storage.k8s.io/node-stage-secret-name".to_string(),
                "${pvc.name}-secret".to_string(),
            ),
            (
                "csi.storage.k8s.io/node-stage-secret-namespace".to_string(),
                "${pvc.namespace}".to_string(),
            ),
        ]));
        let metadata = FakeMetadata {
            volumes: vec![
                pv("pv-unused", "claim-unused", Some("good"), None),
                pv("pv-nosecret", "claim-1", None, None),
                pv("pv-busy", "claim-2", Some("good"), None),
                pv("pv-class", "claim-3", None, Some("fcfs")),
            ],
            pods: vec![pod("uid-1", &["claim-1", "claim-2", "claim-3"], None)],
            classes: vec![class],
            secrets: HashMap::from([
                (SecretRef::new("fcfs", "good"), admin_secret()),
                (SecretRef::new("default", "claim-3-secret"), admin_secret()),
            ]),
            ..Default::default()
        };
        let f = fixture(metadata, FakeMounter::default());
        let _busy = f.locks.guard(&handle("pv-busy")).unwrap();

        let report = f.recovery.run().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                recovered: 1,
                failed: 0,
                skipped: 3
            }
        );
        let mounted = f.fuse.mounted.lock().unwrap().clone();
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0].0, "csi-vol-pv-class");
    }
}
