//! External storage engine invocation.
//!
//! FastCFS is driven through two executables: `fcfs_pool` manages pool volumes and their
//! quotas, `fcfs_fused` mounts a volume through fuse. Both take the credentials of a FastCFS
//! user, the configuration URL of the cluster and a verb. Fuse mounts may instead be forwarded
//! to the `fcfsfused-proxy` sidecar, which owns the daemons so that they outlive node plugin
//! restarts.
use crate::credentials;
use snafu::Snafu;
use std::path::PathBuf;

mod command;
mod fused;
mod pool;
mod proxy;

pub use command::{CommandRunner, HostCommand};
pub use fused::{fused_mount_args, DirectFuseMounter, FuseMounter};
pub use pool::{FcfsPool, VolumeEngine};
pub use proxy::{MountProxySvc, ProxyFuseMounter};

/// The pool management tool.
pub const POOL_CMD: &str = "/usr/bin/fcfs_pool";
/// The fuse client daemon.
pub const FUSE_CLIENT_CMD: &str = "/usr/bin/fcfs_fused";
/// Each fuse daemon keeps its pid and log files under `<CLIENT_BASE_PATH>/<volume name>`.
pub const CLIENT_BASE_PATH: &str = "/opt/fastcfs";
/// Exit code of the FastCFS tools when the named volume does not exist (ENOENT).
pub const NOT_FOUND_EXIT_CODE: i32 = 2;

/// Verbs understood by the FastCFS tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Create,
    Delete,
    Quota,
    Plist,
    Restart,
}

/// Outcome of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    /// None if the command was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl EngineOutput {
    /// New output from an exit code and the combined output.
    pub fn new(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }
    /// The command exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
    /// The command reported that the named resource does not exist.
    pub fn not_found(&self) -> bool {
        self.exit_code == Some(NOT_FOUND_EXIT_CODE)
    }
}

/// Storage engine errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to execute {}: {}", program, source))]
    Spawn {
        source: std::io::Error,
        program: String,
    },
    #[snafu(display(
        "{} of volume {} failed with exit code {:?}: {}",
        operation,
        volume,
        exit_code,
        output.trim()
    ))]
    Failed {
        operation: Operation,
        volume: String,
        exit_code: Option<i32>,
        output: String,
    },
    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    Directory {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("{}", source))]
    Credentials { source: credentials::Error },
    #[snafu(display("Failed to connect to the fcfsfused proxy at {}: {}", endpoint, source))]
    ProxyConnect {
        source: crate::transport::ConnectError,
        endpoint: String,
    },
    #[snafu(display("fcfsfused proxy mount failed: {}", source))]
    ProxyMount { source: tonic::Status },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Credentials { source } => source.into(),
            Error::ProxyMount { source } => {
                tonic::Status::new(source.code(), format!("fcfsfused proxy: {}", source.message()))
            }
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}
