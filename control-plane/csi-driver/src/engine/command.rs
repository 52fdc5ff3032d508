use super::{EngineOutput, Error, Spawn};
use async_trait::async_trait;
use snafu::ResultExt;
use tokio::process::Command;
use tracing::trace;

/// Runs an external program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning its exit code and combined output.
    /// Only a failure to execute the program is an error.
    async fn run(&self, program: &str, args: &[String]) -> Result<EngineOutput, Error>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<T> {
    async fn run(&self, program: &str, args: &[String]) -> Result<EngineOutput, Error> {
        (**self).run(program, args).await
    }
}

/// Runs programs on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCommand;

#[async_trait]
impl CommandRunner for HostCommand {
    async fn run(&self, program: &str, args: &[String]) -> Result<EngineOutput, Error> {
        trace!(program, ?args, "Executing");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context(Spawn { program })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!(program, status = ?output.status, output = %combined.trim(), "Executed");
        Ok(EngineOutput::new(output.status.code(), combined))
    }
}
