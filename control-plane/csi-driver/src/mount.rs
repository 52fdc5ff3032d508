//! Host mount table operations.
use snafu::Snafu;
use std::{io, path::Path, path::PathBuf};

#[cfg(target_os = "linux")]
pub use linux::NodeMounter;

/// Mount errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to bind mount {} on {}: {}", source_path.display(), target.display(), source))]
    BindMount {
        source: io::Error,
        source_path: PathBuf,
        target: PathBuf,
    },
    #[snafu(display("Failed to remount {} with {:?}: {}", target.display(), options, source))]
    Remount {
        source: io::Error,
        target: PathBuf,
        options: Vec<String>,
    },
    #[snafu(display("Failed to unmount {}: {}", target.display(), source))]
    Unmount { source: io::Error, target: PathBuf },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::internal(error.to_string())
    }
}

/// Mount table access. Filesystem errors are returned as they are, so that callers can
/// tell a missing path from a corrupted mount.
pub trait Mounter: Send + Sync {
    /// Whether `path` is the root of a mount.
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;
    /// Read the entries of `path`, failing if the filesystem mounted there is not responsive.
    fn probe(&self, path: &Path) -> io::Result<()>;
    /// Create `path` and its missing parents.
    fn make_dir(&self, path: &Path) -> io::Result<()>;
    /// Bind mount `source` on `target`, applying the mount `options`.
    fn bind_mount(&self, source: &Path, target: &Path, options: &[String]) -> Result<(), Error>;
    /// Unmount `target`. Paths which are not mounted, or don't exist, are ignored.
    fn unmount(&self, target: &Path) -> Result<(), Error>;
}

/// Errors returned by the kernel when the filesystem behind a mount is gone, typically a
/// fuse daemon which exited.
pub fn is_corrupted_mount(error: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        error.raw_os_error().map(Errno::from_i32),
        Some(Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EACCES | Errno::EHOSTDOWN)
    )
}

/// Octal escapes used by the kernel in the mount table, e.g. `\040` for a space.
fn unescape_mount_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut unescaped = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|digit| (b'0'..=b'7').contains(digit)) {
                let value = digits
                    .iter()
                    .fold(0u16, |value, digit| value * 8 + u16::from(digit - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    unescaped.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        unescaped.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&unescaped).into_owned()
}

/// Mount points listed in a `/proc/self/mountinfo` table.
fn mountinfo_targets(mountinfo: &str) -> impl Iterator<Item = String> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_mount_path)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{mountinfo_targets, BindMount, Error, Mounter, Remount, Unmount};
    use snafu::ResultExt;
    use std::{
        io,
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
    };
    use sys_mount::{unmount, Mount, MountFlags, UnmountFlags};
    use tracing::{debug, warn};

    const MOUNTINFO: &str = "/proc/self/mountinfo";

    /// Mounts on the local host.
    #[derive(Debug, Clone, Default)]
    pub struct NodeMounter {}

    impl NodeMounter {
        /// Flags for the options a bind mount can be remounted with.
        fn remount_flags(options: &[String]) -> MountFlags {
            options
                .iter()
                .fold(MountFlags::empty(), |flags, option| match option.as_str() {
                    "ro" => flags | MountFlags::RDONLY,
                    "noatime" => flags | MountFlags::NOATIME,
                    "nodiratime" => flags | MountFlags::NODIRATIME,
                    "relatime" => flags | MountFlags::RELATIME,
                    "nodev" => flags | MountFlags::NODEV,
                    "nosuid" => flags | MountFlags::NOSUID,
                    "noexec" => flags | MountFlags::NOEXEC,
                    "bind" | "rw" | "defaults" => flags,
                    other => {
                        debug!(option = other, "Ignoring mount option");
                        flags
                    }
                })
        }

        fn listed_in_mountinfo(path: &Path) -> io::Result<bool> {
            let path = std::fs::canonicalize(path)?;
            let mountinfo = std::fs::read_to_string(MOUNTINFO)?;
            let listed = mountinfo_targets(&mountinfo).any(|target| Path::new(&target) == path);
            Ok(listed)
        }
    }

    impl Mounter for NodeMounter {
        fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
            let metadata = std::fs::metadata(path)?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => return Ok(true),
            };
            if metadata.dev() != std::fs::metadata(parent)?.dev() {
                return Ok(true);
            }
            // Bind mounts within the same filesystem keep the device of their parent.
            Self::listed_in_mountinfo(path)
        }

        fn probe(&self, path: &Path) -> io::Result<()> {
            let mut entries = std::fs::read_dir(path)?;
            if let Some(entry) = entries.next() {
                entry?;
            }
            Ok(())
        }

        fn make_dir(&self, path: &Path) -> io::Result<()> {
            std::fs::create_dir_all(path)
        }

        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            options: &[String],
        ) -> Result<(), Error> {
            debug!(source = %source.display(), target = %target.display(), ?options, "Bind mounting");
            Mount::builder()
                .fstype("none")
                .flags(MountFlags::BIND)
                .mount(source, target)
                .context(BindMount {
                    source_path: source,
                    target,
                })?;

            // Options of a bind mount only apply on remount.
            let flags = Self::remount_flags(options);
            if !flags.is_empty() {
                if let Err(error) = Mount::builder()
                    .fstype("none")
                    .flags(MountFlags::BIND | MountFlags::REMOUNT | flags)
                    .mount(source, target)
                {
                    if let Err(error) = unmount(target, UnmountFlags::empty()) {
                        warn!(%error, target = %target.display(), "Failed to undo bind mount");
                    }
                    return Err(error).context(Remount {
                        target,
                        options: options.to_vec(),
                    });
                }
            }
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<(), Error> {
            use nix::errno::Errno;
            let target_path = PathBuf::from(target);
            match unmount(target, UnmountFlags::empty()) {
                Ok(()) => {
                    debug!(target = %target.display(), "Unmounted");
                    Ok(())
                }
                Err(error)
                    if matches!(
                        error.raw_os_error().map(Errno::from_i32),
                        Some(Errno::EINVAL | Errno::ENOENT)
                    ) =>
                {
                    debug!(target = %target.display(), %error, "Not mounted");
                    Ok(())
                }
                Err(error) => {
                    warn!(%error, target = %target.display(), "Unmount failed, detaching");
                    unmount(target, UnmountFlags::DETACH).context(Unmount {
                        target: target_path,
                    })
                }
            }
        }
    }
}
