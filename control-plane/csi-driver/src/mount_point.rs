//! Mount point state.
//!
//! Every stage, publish and recovery step starts by bringing its target path into a known
//! state: a healthy mount is reused, a mount whose fuse daemon went away is torn down, and
//! a missing directory is created.
use crate::mount::{self, is_corrupted_mount, Mounter};
use snafu::{ResultExt, Snafu};
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Mount point errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to check mount point {}: {}", path.display(), source))]
    Inspect { source: io::Error, path: PathBuf },
    #[snafu(display("Failed to create mount point {}: {}", path.display(), source))]
    MakeDir { source: io::Error, path: PathBuf },
    #[snafu(display("Failed to remove mount point {}: {}", path.display(), source))]
    Remove { source: io::Error, path: PathBuf },
    #[snafu(display("{}", source))]
    Mount { source: mount::Error },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::internal(error.to_string())
    }
}

/// Observed state of a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MountPointState {
    /// The path does not exist.
    Absent,
    /// The path exists and nothing is mounted on it.
    Empty,
    /// A responsive filesystem is mounted on the path.
    Mounted,
    /// Something is mounted on the path but its filesystem no longer answers.
    Corrupted,
}

impl MountPointState {
    /// Classify `path`.
    pub fn inspect(mounter: &dyn Mounter, path: &Path) -> Result<Self, Error> {
        match mounter.is_mount_point(path) {
            Ok(false) => Ok(Self::Empty),
            Ok(true) => match mounter.probe(path) {
                Ok(()) => Ok(Self::Mounted),
                Err(error) => {
                    warn!(path = %path.display(), %error, "Mount point is not responsive");
                    Ok(Self::Corrupted)
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::Absent),
            Err(error) if is_corrupted_mount(&error) => Ok(Self::Corrupted),
            Err(source) => Err(Error::Inspect {
                source,
                path: path.to_path_buf(),
            }),
        }
    }
}

/// Prepare `path` to be mounted on. Returns true if a healthy mount is already in place,
/// in which case nothing needs to be mounted.
/// Corrupted mounts are unmounted and missing paths created as directories.
pub fn ensure_mount_point(mounter: &dyn Mounter, path: &Path) -> Result<bool, Error> {
    let state = MountPointState::inspect(mounter, path)?;
    debug!(path = %path.display(), %state, "Mount point");
    match state {
        MountPointState::Mounted => Ok(true),
        MountPointState::Corrupted => {
            info!(path = %path.display(), "Unmounting corrupted mount point");
            mounter.unmount(path).context(Mount)?;
            Ok(false)
        }
        MountPointState::Absent => {
            mounter.make_dir(path).context(MakeDir { path })?;
            Ok(false)
        }
        MountPointState::Empty => Ok(false),
    }
}

/// Unmount whatever is mounted on `path`, healthy or not, and remove the directory.
pub fn cleanup_mount_point(mounter: &dyn Mounter, path: &Path) -> Result<(), Error> {
    match MountPointState::inspect(mounter, path)? {
        MountPointState::Absent => return Ok(()),
        MountPointState::Mounted | MountPointState::Corrupted => {
            mounter.unmount(path).context(Mount)?;
        }
        MountPointState::Empty => {}
    }
    match std::fs::remove_dir(path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => {
            Err(error).context(Remove { path })
        }
        _ => Ok(()),
    }
}
