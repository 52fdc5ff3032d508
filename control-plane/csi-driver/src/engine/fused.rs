use super::{
    CommandRunner, Credentials as CredentialsCtx, Directory, Error, Failed, HostCommand,
    Operation, CLIENT_BASE_PATH, FUSE_CLIENT_CMD,
};
use crate::{credentials::Credentials, volume::VolumeOptions};
use async_trait::async_trait;
use snafu::ResultExt;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Mounts a FastCFS volume through a fuse daemon.
#[async_trait]
pub trait FuseMounter: Send + Sync {
    /// Mount `volume` on `target`, creating it if needed, as the user found in `secrets`.
    async fn mount(
        &self,
        volume: &VolumeOptions,
        target: &Path,
        secrets: &HashMap<String, String>,
    ) -> Result<(), Error>;
}

/// The `fcfs_fused` arguments naming the volume, the mount point and the client configuration.
pub fn fused_mount_args(volume: &VolumeOptions, target: &Path) -> Vec<String> {
    vec![
        "-n".to_string(),
        volume.volume_name.clone(),
        "-m".to_string(),
        target.to_string_lossy().into_owned(),
        volume.fuse_config_url(),
        Operation::Restart.to_string(),
    ]
}

pub(crate) fn create_dir(path: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(path).context(Directory { path })
}

/// Runs `fcfs_fused` directly from the node plugin.
#[derive(Debug, Clone)]
pub struct DirectFuseMounter<R = HostCommand> {
    runner: R,
    base_path: PathBuf,
}

impl Default for DirectFuseMounter<HostCommand> {
    fn default() -> Self {
        Self::new(HostCommand)
    }
}

impl<R: CommandRunner> DirectFuseMounter<R> {
    /// New mounter running `fcfs_fused` through `runner`.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            base_path: PathBuf::from(CLIENT_BASE_PATH),
        }
    }
    /// Keep the daemon files under `base_path` rather than the default location.
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }
}

#[async_trait]
impl<R: CommandRunner> FuseMounter for DirectFuseMounter<R> {
    async fn mount(
        &self,
        volume: &VolumeOptions,
        target: &Path,
        secrets: &HashMap<String, String>,
    ) -> Result<(), Error> {
        debug!(volume.id = %volume.volume_id, target = %target.display(), "Fuse client mount");
        create_dir(target)?;
        let base_path = self.base_path.join(&volume.volume_name);
        create_dir(&base_path)?;

        let credentials =
            Credentials::for_volume(volume.pre_provisioned, secrets).context(CredentialsCtx)?;
        let mut args = credentials.args();
        args.extend(["-b".to_string(), base_path.to_string_lossy().into_owned()]);
        args.extend(fused_mount_args(volume, target));

        let output = self.runner.run(FUSE_CLIENT_CMD, &args).await?;
        if !output.success() {
            warn!(
                volume.id = %volume.volume_id,
                "[FastCFS] failed to mount, output <= {}", output.output.trim()
            );
            return Failed {
                operation: Operation::Restart,
                volume: &volume.volume_name,
                exit_code: output.exit_code,
                output: output.output,
            }
            .fail();
        }
        debug!(volume.id = %volume.volume_id, "[FastCFS] Fuse client mounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::{ADMIN_NAME, ADMIN_SECRET_KEY, USER_NAME, USER_SECRET_KEY},
        engine::{testing::FakeRunner, EngineOutput},
    };

    fn volume(pre_provisioned: bool) -> VolumeOptions {
        VolumeOptions {
            volume_id: "vol-static".to_string(),
            volume_name: "vol-static".to_string(),
            cluster_id: "1".to_string(),
            base_config_url: "http://fcfs".to_string(),
            capacity_bytes: 0,
            pre_provisioned,
        }
    }

    fn secrets() -> HashMap<String, String> {
        HashMap::from([
            (ADMIN_NAME.to_string(), "admin".to_string()),
            (ADMIN_SECRET_KEY.to_string(), "admin-key".to_string()),
            (USER_NAME.to_string(), "alice".to_string()),
            (USER_SECRET_KEY.to_string(), "alice-key".to_string()),
        ])
    }

    #[test]
    fn mount_args() {
        let args = fused_mount_args(&volume(false), Path::new("/mnt/global"));
        assert_eq!(
            args,
            [
                "-n",
                "vol-static",
                "-m",
                "/mnt/global",
                "http://fcfs/fastcfs/fcfs/fuse.conf",
                "restart"
            ]
        );
        assert_eq!(
            DirectFuseMounter::default().base_path,
            Path::new("/opt/fastcfs")
        );
    }

    #[tokio::test]
    async fn direct_mount() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("globalmount");
        let mounter =
            DirectFuseMounter::new(FakeRunner::default()).with_base_path(dir.path().join("base"));

        mounter.mount(&volume(true), &target, &secrets()).await.unwrap();
        assert!(target.is_dir());
        assert!(dir.path().join("base/vol-static").is_dir());

        let calls = mounter.runner.calls();
        let (program, args) = &calls[0];
        assert_eq!(program, FUSE_CLIENT_CMD);
        assert_eq!(args[0..2], ["-u", "alice"]);
        assert_eq!(args[4], "-b");
        assert_eq!(args[6..], fused_mount_args(&volume(true), &target)[..]);
    }

    #[tokio::test]
    async fn direct_mount_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = DirectFuseMounter::new(FakeRunner::replying([EngineOutput::new(
            Some(1),
            "connect to server fail",
        )]))
        .with_base_path(dir.path());
        let error = mounter
            .mount(&volume(false), &dir.path().join("m"), &secrets())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("connect to server fail"));

        let error = mounter
            .mount(&volume(false), &dir.path().join("m"), &HashMap::new())
            .await
            .unwrap_err();
        let status: tonic::Status = error.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
