use crate::config::NodeConfig;
use csi_driver::{
    cluster::ClusterConfig,
    csi::volume_capability::AccessType,
    engine::FuseMounter,
    limiter::VolumeLocks,
    mount::Mounter,
    mount_point::{cleanup_mount_point, ensure_mount_point, MountPointState},
    plugin_capabilities::node_capabilities,
    recovery::BIND_MOUNT_OPTIONS,
    volume::{construct_mount_options, VolumeOptions},
};
use rpc::{
    csi,
    csi::{
        node_server, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
        NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
        NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
        NodePublishVolumeRequest, NodePublishVolumeResponse, NodeStageVolumeRequest,
        NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
        NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeCapability,
    },
};

use nix::{errno::Errno, sys};
use std::{collections::HashMap, io::ErrorKind, path::Path, sync::Arc};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, instrument, trace, warn};

macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

/// The Csi Node implementation.
pub(crate) struct Node {
    node_name: String,
    max_volumes_per_node: i64,
    topology: HashMap<String, String>,
    clusters: Arc<ClusterConfig>,
    locks: VolumeLocks,
    mounter: Arc<dyn Mounter>,
    fuse: Arc<dyn FuseMounter>,
}

impl Node {
    /// Creates new node.
    pub(crate) fn new(
        config: &NodeConfig,
        topology: HashMap<String, String>,
        locks: VolumeLocks,
        mounter: Arc<dyn Mounter>,
        fuse: Arc<dyn FuseMounter>,
    ) -> Node {
        info!("Node topology segments: {:?}", topology);
        Self {
            node_name: config.node_name().to_string(),
            max_volumes_per_node: config.max_volumes_per_node(),
            topology,
            clusters: config.clusters(),
            locks,
            mounter,
            fuse,
        }
    }
}

/// Check the volume capability is present and describes a filesystem.
fn check_volume_capability(
    volume_capability: &Option<VolumeCapability>,
) -> Result<&VolumeCapability, String> {
    match volume_capability {
        Some(capability) => match &capability.access_type {
            Some(AccessType::Block(_)) => {
                Err(String::from("FastCFS doesn't support block access type"))
            }
            _ => Ok(capability),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Mount flags of the capability, if any.
fn mount_flags(capability: &VolumeCapability) -> &[String] {
    match &capability.access_type {
        Some(AccessType::Mount(mount)) => &mount.mount_flags,
        _ => &[],
    }
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let node_id = self.node_name.clone();

        debug!(node.id = node_id, "NodeGetInfo request");

        Ok(Response::new(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: (!self.topology.is_empty()).then(|| Topology {
                segments: self.topology.clone(),
            }),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let capabilities = node_capabilities();
        debug!("NodeGetCapabilities request: {:?}", capabilities);

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    /// Mounts the FastCFS volume on its staging path through a fuse daemon. A healthy mount
    /// left by an earlier call is reused, a mount whose daemon is gone is replaced.
    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!(staging_target_path = %msg.staging_target_path, context = ?msg.volume_context);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        if let Err(error) = check_volume_capability(&msg.volume_capability) {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: {}",
                &msg.volume_id,
                error
            ));
        }

        let _guard = self.locks.guard(&msg.volume_id)?;

        let staging_path = Path::new(&msg.staging_target_path);
        if ensure_mount_point(self.mounter.as_ref(), staging_path)? {
            debug!(
                "Volume {} is already mounted on {}",
                msg.volume_id, msg.staging_target_path
            );
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        let volume = VolumeOptions::resolve(&msg.volume_id, &msg.volume_context, &self.clusters)?;
        self.fuse
            .mount(&volume, staging_path, &msg.secrets)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to stage volume {}: fuse mount failed: {}",
                    &msg.volume_id,
                    error
                )
            })?;

        info!(
            "Volume {} staged on {}",
            msg.volume_id, msg.staging_target_path
        );
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// Unmounts the staging path. Paths which aren't mounted have nothing to unstage.
    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        let _guard = self.locks.guard(&msg.volume_id)?;

        let staging_path = Path::new(&msg.staging_target_path);
        match MountPointState::inspect(self.mounter.as_ref(), staging_path)? {
            MountPointState::Absent | MountPointState::Empty => {
                debug!("Staging path {} is not mounted", msg.staging_target_path);
            }
            MountPointState::Mounted | MountPointState::Corrupted => {
                cleanup_mount_point(self.mounter.as_ref(), staging_path)?;
                info!(
                    "Volume {} unstaged from {}",
                    msg.volume_id, msg.staging_target_path
                );
            }
        }
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    /// Bind mounts the staging path on the pod's target path.
    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!(target_path = %msg.target_path, readonly = msg.readonly);

        let capability = match check_volume_capability(&msg.volume_capability) {
            Ok(capability) => capability,
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to publish volume {}: {}",
                    &msg.volume_id,
                    error
                ))
            }
        };
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume: missing volume id"
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing target path",
                &msg.volume_id
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        let _guard = self.locks.guard(&msg.volume_id)?;

        let target_path = Path::new(&msg.target_path);
        if ensure_mount_point(self.mounter.as_ref(), target_path)? {
            debug!(
                "Volume {} is already published on {}",
                msg.volume_id, msg.target_path
            );
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        let mut options = construct_mount_options(&BIND_MOUNT_OPTIONS, mount_flags(capability));
        if msg.readonly && !options.iter().any(|option| option == "ro") {
            options.push("ro".to_string());
        }

        if let Err(error) =
            self.mounter
                .bind_mount(Path::new(&msg.staging_target_path), target_path, &options)
        {
            if let Err(remove) = std::fs::remove_dir(target_path) {
                if remove.kind() != ErrorKind::NotFound {
                    return Err(failure!(
                        Code::Internal,
                        "Failed to publish volume {}: could not remove mount target {}: {}",
                        &msg.volume_id,
                        &msg.target_path,
                        remove
                    ));
                }
            }
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: {}",
                &msg.volume_id,
                error
            ));
        }

        info!(
            "Volume {} published on {} with {:?}",
            msg.volume_id, msg.target_path, options
        );
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    /// Unmounts the pod's target path and removes it.
    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume: missing volume id"
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume {}: missing target path",
                &msg.volume_id
            ));
        }

        let _guard = self.locks.guard(&msg.volume_id)?;

        cleanup_mount_point(self.mounter.as_ref(), Path::new(&msg.target_path))?;
        info!(
            "Volume {} unpublished from {}",
            msg.volume_id, msg.target_path
        );
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Get volume stats method evaluates and returns capacity metrics.
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_get_volume_stats {:?}", msg);
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume path"
            ));
        }
        let _guard = self.locks.guard(&msg.volume_id)?;

        let volume_path = Path::new(&msg.volume_path);
        match MountPointState::inspect(self.mounter.as_ref(), volume_path)? {
            MountPointState::Absent => {
                return Err(Status::new(
                    Code::NotFound,
                    format!("volume path {} doesn't exist", msg.volume_path),
                ))
            }
            MountPointState::Empty => {
                return Err(Status::new(
                    Code::InvalidArgument,
                    format!("volume path {} is not mounted", msg.volume_path),
                ))
            }
            MountPointState::Corrupted => {
                warn!("Volume {} mount {} is corrupted", msg.volume_id, msg.volume_path);
                return Ok(Response::new(NodeGetVolumeStatsResponse {
                    usage: vec![],
                    volume_condition: Some(csi::VolumeCondition {
                        abnormal: true,
                        message: format!(
                            "the fuse daemon serving {} is not responding",
                            msg.volume_path
                        ),
                    }),
                }));
            }
            MountPointState::Mounted => {}
        }

        trace!("Getting statfs metrics for : {:?}", volume_path);
        match sys::statfs::statfs(volume_path) {
            Ok(info) => {
                let block_size = info.block_size() as i64;
                Ok(Response::new(NodeGetVolumeStatsResponse {
                    usage: vec![
                        csi::VolumeUsage {
                            total: info.blocks() as i64 * block_size,
                            unit: csi::volume_usage::Unit::Bytes as i32,
                            available: info.blocks_available() as i64 * block_size,
                            used: (info.blocks() - info.blocks_free()) as i64 * block_size,
                        },
                        csi::VolumeUsage {
                            total: info.files() as i64,
                            unit: csi::volume_usage::Unit::Inodes as i32,
                            available: info.files_free() as i64,
                            used: (info.files() - info.files_free()) as i64,
                        },
                    ],
                    volume_condition: Some(csi::VolumeCondition {
                        abnormal: false,
                        message: "".to_string(),
                    }),
                }))
            }
            Err(err) => match err {
                Errno::ENOENT => Err(Status::new(Code::NotFound, err.to_string())),
                Errno::EIO => Err(Status::new(Code::Internal, err.to_string())),
                Errno::ENOSYS => Err(Status::new(Code::Unavailable, err.to_string())),
                Errno::ENOTDIR => Err(Status::new(Code::Internal, err.to_string())),
                _ => Err(Status::new(Code::InvalidArgument, err.to_string())),
            },
        }
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        // Quotas apply as soon as the controller sets them.
        Err(Status::unimplemented("Not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi_driver::{csi::node_server::Node as _, engine::Error as EngineError};
    use std::{
        collections::HashSet,
        io,
        path::PathBuf,
        sync::Mutex,
    };

    const VOLUME_ID: &str = "0001-1-0005-admin-000d-csi-vol-pvc-1";

    /// Mount table where a mounted path is either healthy or has lost its daemon.
    #[derive(Default)]
    struct Mounts {
        dirs: Mutex<HashSet<PathBuf>>,
        mounted: Mutex<HashMap<PathBuf, bool>>,
        binds: Mutex<Vec<(PathBuf, PathBuf, Vec<String>)>>,
        unmounts: Mutex<Vec<PathBuf>>,
    }
    impl Mounts {
        fn with(self, path: &str, healthy: bool) -> Self {
            self.dirs.lock().unwrap().insert(path.into());
            self.mounted.lock().unwrap().insert(path.into(), healthy);
            self
        }
        fn with_dir(self, path: &str) -> Self {
            self.dirs.lock().unwrap().insert(path.into());
            self
        }
    }
    impl Mounter for Mounts {
        fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
            match self.mounted.lock().unwrap().get(path) {
                Some(false) => Err(io::Error::from_raw_os_error(Errno::ENOTCONN as i32)),
                Some(true) => Ok(true),
                None if self.dirs.lock().unwrap().contains(path) => Ok(false),
                None => Err(ErrorKind::NotFound.into()),
            }
        }
        fn probe(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }
        fn make_dir(&self, path: &Path) -> io::Result<()> {
            self.dirs.lock().unwrap().insert(path.into());
            Ok(())
        }
        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            options: &[String],
        ) -> Result<(), csi_driver::mount::Error> {
            self.binds
                .lock()
                .unwrap()
                .push((source.into(), target.into(), options.to_vec()));
            self.mounted.lock().unwrap().insert(target.into(), true);
            Ok(())
        }
        fn unmount(&self, target: &Path) -> Result<(), csi_driver::mount::Error> {
            self.unmounts.lock().unwrap().push(target.into());
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Fuse {
        mounts: Mutex<Vec<(VolumeOptions, PathBuf)>>,
    }
    #[tonic::async_trait]
    impl FuseMounter for Fuse {
        async fn mount(
            &self,
            volume: &VolumeOptions,
            target: &Path,
            _secrets: &HashMap<String, String>,
        ) -> Result<(), EngineError> {
            self.mounts
                .lock()
                .unwrap()
                .push((volume.clone(), target.into()));
            Ok(())
        }
    }

    fn plugin(mounts: Mounts) -> (Node, Arc<Mounts>, Arc<Fuse>) {
        let mounts = Arc::new(mounts);
        let fuse = Arc::new(Fuse::default());
        let node = Node {
            node_name: "node-1".to_string(),
            max_volumes_per_node: 0,
            topology: HashMap::new(),
            clusters: Arc::new(
                ClusterConfig::from_entries([(
                    "1".to_string(),
                    "http://fastcfs.local:8080".to_string(),
                )])
                .unwrap(),
            ),
            locks: VolumeLocks::new(),
            mounter: mounts.clone(),
            fuse: fuse.clone(),
        };
        (node, mounts, fuse)
    }

    fn mount_capability(flags: &[&str]) -> Option<VolumeCapability> {
        Some(VolumeCapability {
            access_type: Some(AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "".to_string(),
                mount_flags: flags.iter().map(|flag| flag.to_string()).collect(),
            })),
            access_mode: None,
        })
    }

    fn stage_request(volume_id: &str) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: volume_id.to_string(),
            staging_target_path: "/staging".to_string(),
            volume_capability: mount_capability(&[]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stage_volume() {
        let (node, _, fuse) = plugin(Mounts::default());
        node.node_stage_volume(Request::new(stage_request(VOLUME_ID)))
            .await
            .unwrap();
        let mounts = fuse.mounts.lock().unwrap().clone();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].0.volume_name, "csi-vol-pvc-1");
        assert!(!mounts[0].0.pre_provisioned);
        assert_eq!(mounts[0].1, PathBuf::from("/staging"));
    }

    #[tokio::test]
    async fn stage_static_volume() {
        let (node, _, fuse) = plugin(Mounts::default());
        let mut request = stage_request("shared-data");
        request.volume_context = HashMap::from([
            ("static".to_string(), "true".to_string()),
            ("clusterID".to_string(), "1".to_string()),
        ]);
        node.node_stage_volume(Request::new(request)).await.unwrap();
        let mounts = fuse.mounts.lock().unwrap().clone();
        assert_eq!(mounts[0].0.volume_name, "shared-data");
        assert!(mounts[0].0.pre_provisioned);

        let status = node
            .node_stage_volume(Request::new(stage_request("not-ours")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn restage_is_idempotent() {
        let (node, mounts, fuse) = plugin(Mounts::default().with("/staging", true));
        node.node_stage_volume(Request::new(stage_request(VOLUME_ID)))
            .await
            .unwrap();
        assert!(fuse.mounts.lock().unwrap().is_empty());
        assert!(mounts.unmounts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restage_corrupted_mount() {
        let (node, mounts, fuse) = plugin(Mounts::default().with("/staging", false));
        node.node_stage_volume(Request::new(stage_request(VOLUME_ID)))
            .await
            .unwrap();
        assert_eq!(
            *mounts.unmounts.lock().unwrap(),
            vec![PathBuf::from("/staging")]
        );
        assert_eq!(fuse.mounts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stage_validation() {
        let (node, _, fuse) = plugin(Mounts::default());
        let mut block = stage_request(VOLUME_ID);
        block.volume_capability = Some(VolumeCapability {
            access_type: Some(AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        });
        let mut no_path = stage_request(VOLUME_ID);
        no_path.staging_target_path.clear();
        for request in [stage_request(""), block, no_path] {
            let status = node
                .node_stage_volume(Request::new(request))
                .await
                .unwrap_err();
            assert_eq!(status.code(), Code::InvalidArgument);
        }

        let _guard = node.locks.guard(VOLUME_ID).unwrap();
        let status = node
            .node_stage_volume(Request::new(stage_request(VOLUME_ID)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Aborted);
        assert!(fuse.mounts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_volume() {
        let (node, mounts, _) = plugin(Mounts::default().with("/staging", true));
        node.node_publish_volume(Request::new(NodePublishVolumeRequest {
            volume_id: VOLUME_ID.to_string(),
            staging_target_path: "/staging".to_string(),
            target_path: "/pod/mount".to_string(),
            volume_capability: mount_capability(&["noatime", "bind"]),
            readonly: true,
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(
            *mounts.binds.lock().unwrap(),
            vec![(
                PathBuf::from("/staging"),
                PathBuf::from("/pod/mount"),
                vec![
                    "bind".to_string(),
                    "_netdev".to_string(),
                    "noatime".to_string(),
                    "ro".to_string()
                ]
            )]
        );
    }

    #[tokio::test]
    async fn unstage_and_unpublish() {
        let (node, mounts, _) = plugin(Mounts::default().with_dir("/empty"));
        node.node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: VOLUME_ID.to_string(),
            staging_target_path: "/empty".to_string(),
        }))
        .await
        .unwrap();
        node.node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: VOLUME_ID.to_string(),
            target_path: "/missing".to_string(),
        }))
        .await
        .unwrap();
        assert!(mounts.unmounts.lock().unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mount");
        std::fs::create_dir(&target).unwrap();
        let (node, mounts, _) = plugin(Mounts::default().with(&target.to_string_lossy(), false));
        node.node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: VOLUME_ID.to_string(),
            target_path: target.to_string_lossy().into_owned(),
        }))
        .await
        .unwrap();
        assert_eq!(*mounts.unmounts.lock().unwrap(), vec![target.clone()]);
        assert!(!target.exists());
    }

    async fn stats(node: &Node, volume_path: &str) -> Result<NodeGetVolumeStatsResponse, Status> {
        node.node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: VOLUME_ID.to_string(),
            volume_path: volume_path.to_string(),
            staging_target_path: "".to_string(),
        }))
        .await
        .map(Response::into_inner)
    }

    #[tokio::test]
    async fn volume_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();

        let (mounted, _, _) = plugin(Mounts::default().with(&path, true));
        let response = stats(&mounted, &path).await.unwrap();
        assert_eq!(response.usage.len(), 2);
        assert!(response.usage[0].total > 0);
        assert_eq!(response.volume_condition.map(|c| c.abnormal), Some(false));

        let (corrupted, _, _) = plugin(Mounts::default().with(&path, false));
        let response = stats(&corrupted, &path).await.unwrap();
        assert!(response.usage.is_empty());
        assert_eq!(response.volume_condition.map(|c| c.abnormal), Some(true));

        let (empty, _, _) = plugin(Mounts::default().with_dir(&path));
        let status = stats(&empty, &path).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        let status = stats(&empty, "/missing").await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn node_info() {
        let (mut node, _, _) = plugin(Mounts::default());
        node.topology = HashMap::from([(
            "topology.fcfs.csi.vazmin.github.io/zone".to_string(),
            "zone-a".to_string(),
        )]);
        let info = node
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-1");
        assert_eq!(
            info.accessible_topology.unwrap().segments,
            node.topology
        );
    }
}
