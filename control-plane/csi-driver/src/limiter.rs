//! Volume Concurrency Limiter Module
//!
//! In general the Cluster Orchestrator (CO) is responsible for ensuring that there is no more
//! than one call “in-flight” per volume at a given time. However, in some circumstances, the
//! CO MAY lose state (for example when the CO crashes and restarts), and MAY issue multiple
//! calls simultaneously for the same volume. The plugin SHOULD handle this as gracefully as
//! possible. The error code ABORTED MAY be returned by the plugin in this case (see the Error
//! Scheme section for details).
//!
//! Reservations are keyed by name: the request name for `CreateVolume` and the volume handle
//! for every other call. A `VolumeLocks` instance is created by each service at startup and
//! shared with its handlers.
use snafu::Snafu;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("An operation with the given volume {} already exists", id))]
    OperationInProgress { id: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress { .. } => tonic::Status::aborted(error.to_string()),
        }
    }
}

/// Set of names which currently have an operation in-flight.
#[derive(Debug, Clone, Default)]
pub struct VolumeLocks {
    inventory: Arc<Mutex<HashSet<String>>>,
}

impl VolumeLocks {
    /// Create a new, empty, set of locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name`, returning false without waiting if it's already reserved.
    pub fn try_acquire(&self, name: &str) -> bool {
        let mut inventory = self.inventory();
        if inventory.contains(name) {
            trace!(volume.id = %name, "Operation already exists for volume");
            return false;
        }
        inventory.insert(name.to_string());
        trace!(volume.id = %name, "New reservation");
        true
    }

    /// Return the reservation for `name`. Releasing a name which isn't reserved is a no-op.
    pub fn release(&self, name: &str) {
        if self.inventory().remove(name) {
            trace!(volume.id = %name, "Reservation returned");
        }
    }

    /// Reserve `name` for the lifetime of the returned guard.
    pub fn guard(&self, name: &str) -> Result<VolumeOpGuard, Error> {
        match self.try_acquire(name) {
            true => Ok(VolumeOpGuard {
                locks: self.clone(),
                name: name.to_string(),
            }),
            false => Err(Error::OperationInProgress {
                id: name.to_string(),
            }),
        }
    }

    /// Check if `name` is currently reserved.
    pub fn is_locked(&self, name: &str) -> bool {
        self.inventory().contains(name)
    }

    fn inventory(&self) -> MutexGuard<'_, HashSet<String>> {
        // Critical sections never leave the set half updated.
        self.inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// This Operation guard is used to ensure there is no more than 1 in-flight operation
/// for a given volume by taking a reservation for the volume's name.
/// When this is dropped the reservation is returned and a new operation can be accepted.
#[derive(Debug)]
pub struct VolumeOpGuard {
    locks: VolumeLocks,
    name: String,
}

impl VolumeOpGuard {
    /// The reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        self.locks.release(&self.name);
    }
}
