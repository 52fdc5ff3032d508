use super::{
    fused::create_dir, CommandRunner, Error, FuseMounter, HostCommand, ProxyConnect, ProxyMount,
    CLIENT_BASE_PATH, FUSE_CLIENT_CMD,
};
use crate::{credentials::Credentials, transport::connect_uds, volume::VolumeOptions};
use async_trait::async_trait;
use rpc::fcfsfused::{
    mount_service_client::MountServiceClient, mount_service_server::MountService,
    MountFcfsFusedRequest, MountFcfsFusedResponse,
};
use snafu::ResultExt;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument};

/// Forwards fuse mounts to the `fcfsfused-proxy` sidecar.
#[derive(Debug, Clone)]
pub struct ProxyFuseMounter {
    endpoint: String,
    connect_timeout: Duration,
    base_path: PathBuf,
}

impl ProxyFuseMounter {
    /// New mounter for the proxy listening on the unix socket `endpoint`.
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            base_path: PathBuf::from(CLIENT_BASE_PATH),
        }
    }
    /// Directory under which the proxy keeps the fuse daemons' pid and log files.
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }
}

#[async_trait]
impl FuseMounter for ProxyFuseMounter {
    async fn mount(
        &self,
        volume: &VolumeOptions,
        target: &Path,
        secrets: &HashMap<String, String>,
    ) -> Result<(), Error> {
        debug!(volume.id = %volume.volume_id, target = %target.display(), "Fuse client proxy mount");
        create_dir(target)?;

        let channel = connect_uds(&self.endpoint, self.connect_timeout)
            .await
            .context(ProxyConnect {
                endpoint: &self.endpoint,
            })?;
        let request = MountFcfsFusedRequest {
            base_path: self
                .base_path
                .join(&volume.volume_name)
                .to_string_lossy()
                .into_owned(),
            mount_args: super::fused_mount_args(volume, target).join(" "),
            secrets: secrets.clone(),
            pre_provisioned: volume.pre_provisioned,
        };
        let response = MountServiceClient::new(channel)
            .mount_fcfs_fused(request)
            .await
            .context(ProxyMount)?;
        debug!(
            volume.id = %volume.volume_id,
            "fcfsfused proxy output: {}", response.get_ref().output.trim()
        );
        Ok(())
    }
}

/// The mount service run by the `fcfsfused-proxy` sidecar.
/// Mounts are serialized, one `fcfs_fused` invocation at a time.
#[derive(Debug, Default)]
pub struct MountProxySvc<R = HostCommand> {
    runner: R,
    serial: tokio::sync::Mutex<()>,
}

impl<R: CommandRunner> MountProxySvc<R> {
    /// New service running `fcfs_fused` through `runner`.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            serial: Default::default(),
        }
    }
}

#[tonic::async_trait]
impl<R: CommandRunner + 'static> MountService for MountProxySvc<R> {
    #[instrument(err, skip_all)]
    async fn mount_fcfs_fused(
        &self,
        request: Request<MountFcfsFusedRequest>,
    ) -> Result<Response<MountFcfsFusedResponse>, Status> {
        let args = request.into_inner();
        let _serial = self.serial.lock().await;
        info!(mount_args = %args.mount_args, "Received mount request");

        let credentials = Credentials::for_volume(args.pre_provisioned, &args.secrets)
            .map_err(|error| {
                error!(%error, "Failed to retrieve mount credentials");
                Status::from(error)
            })?;
        let mut argv = credentials.args();
        if !args.base_path.is_empty() {
            create_dir(Path::new(&args.base_path))?;
            argv.extend(["-b".to_string(), args.base_path.clone()]);
        }
        argv.extend(args.mount_args.split_whitespace().map(ToString::to_string));

        let output = self.runner.run(FUSE_CLIENT_CMD, &argv).await?;
        if !output.success() {
            return Err(Status::internal(format!(
                "fcfs_fused mount failed with exit code {:?}: {}",
                output.exit_code,
                output.output.trim()
            )));
        }
        info!("Successfully mounted");
        Ok(Response::new(MountFcfsFusedResponse {
            output: output.output,
        }))
    }
}
