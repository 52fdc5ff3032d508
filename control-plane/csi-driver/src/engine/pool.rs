use super::{CommandRunner, EngineOutput, Error, Failed, HostCommand, Operation, POOL_CMD};
use crate::{
    credentials::Credentials,
    volume::{round_off_bytes, round_up_gib, VolumeOptions},
};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Output of FastCFS releases which report a missing volume with a zero exit code.
fn legacy_not_exist(volume_name: &str) -> String {
    format!("{volume_name} not exist")
}
const NO_SUCH_FILE: &str = "No such file or directory";

/// Pool volume management.
#[async_trait]
pub trait VolumeEngine: Send + Sync {
    /// Create the pool volume with the requested capacity.
    async fn create_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<(), Error>;
    /// Check whether the pool volume exists.
    async fn volume_exists(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<bool, Error>;
    /// Delete the pool volume. Deleting a volume which doesn't exist succeeds.
    async fn delete_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<(), Error>;
    /// Set the quota of the pool volume, returning the new capacity.
    async fn resize_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<i64, Error>;
}

/// `fcfs_pool` backed volume engine.
#[derive(Debug, Clone)]
pub struct FcfsPool<R = HostCommand> {
    runner: R,
    program: String,
}

impl Default for FcfsPool<HostCommand> {
    fn default() -> Self {
        Self::new(HostCommand)
    }
}

impl<R: CommandRunner> FcfsPool<R> {
    /// New engine running `fcfs_pool` through `runner`.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: POOL_CMD.to_string(),
        }
    }

    async fn pool(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
        operation: Operation,
        operands: &[String],
    ) -> Result<EngineOutput, Error> {
        let mut args = credentials.args();
        args.extend(["-c".to_string(), volume.pool_config_url()]);
        args.push(operation.to_string());
        args.extend_from_slice(operands);
        debug!(volume.id = %volume.volume_id, %operation, "Running {}", self.program);
        self.runner.run(&self.program, &args).await
    }

    fn failed(volume: &VolumeOptions, operation: Operation, output: EngineOutput) -> Error {
        warn!(
            volume.id = %volume.volume_id,
            %operation,
            exit_code = ?output.exit_code,
            "[FastCFS] {}", output.output.trim()
        );
        Failed {
            operation,
            volume: &volume.volume_name,
            exit_code: output.exit_code,
            output: output.output,
        }
        .build()
    }
}

fn quota_arg(capacity_bytes: i64) -> String {
    format!("{}g", round_up_gib(capacity_bytes))
}

#[async_trait]
impl<R: CommandRunner> VolumeEngine for FcfsPool<R> {
    async fn create_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        let operands = [volume.volume_name.clone(), quota_arg(volume.capacity_bytes)];
        let output = self
            .pool(volume, credentials, Operation::Create, &operands)
            .await?;
        if !output.success() {
            return Err(Self::failed(volume, Operation::Create, output));
        }
        debug!(volume.id = %volume.volume_id, "[FastCFS] Created volume");
        Ok(())
    }

    async fn volume_exists(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<bool, Error> {
        let operands = [
            credentials.user_name().to_string(),
            volume.volume_name.clone(),
        ];
        let output = self
            .pool(volume, credentials, Operation::Plist, &operands)
            .await?;
        match output {
            output if output.not_found() => Ok(false),
            output if !output.success() => Err(Self::failed(volume, Operation::Plist, output)),
            output => Ok(!output
                .output
                .contains(&legacy_not_exist(&volume.volume_name))),
        }
    }

    async fn delete_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<(), Error> {
        let operands = [volume.volume_name.clone()];
        let output = self
            .pool(volume, credentials, Operation::Delete, &operands)
            .await?;
        if output.success() || output.not_found() || output.output.contains(NO_SUCH_FILE) {
            debug!(volume.id = %volume.volume_id, "[FastCFS] Deleted volume");
            return Ok(());
        }
        Err(Self::failed(volume, Operation::Delete, output))
    }

    async fn resize_volume(
        &self,
        volume: &VolumeOptions,
        credentials: &Credentials,
    ) -> Result<i64, Error> {
        let operands = [volume.volume_name.clone(), quota_arg(volume.capacity_bytes)];
        let output = self
            .pool(volume, credentials, Operation::Quota, &operands)
            .await?;
        if !output.success() {
            return Err(Self::failed(volume, Operation::Quota, output));
        }
        debug!(volume.id = %volume.volume_id, "[FastCFS] Resized volume");
        Ok(round_off_bytes(volume.capacity_bytes))
    }
}
