extern crate prost;
extern crate prost_derive;
extern crate tonic;

/// Container Storage Interface v1 messages and services.
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod csi {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.rs"));
}

/// The fcfs_fused mount proxy served by the sidecar.
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod fcfsfused {
    include!(concat!(env!("OUT_DIR"), "/fcfsfused.v1.rs"));
}
