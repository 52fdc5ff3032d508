//! FastCFS CSI driver.
//!
//! Shared components of the `csi-controller` and `csi-node` plugins and of the
//! `fcfsfused-proxy` sidecar.

/// The default name the driver registers with.
pub const DEFAULT_DRIVER_NAME: &str = "fcfs.csi.vazmin.github.io";
/// The default endpoint of the `fcfsfused-proxy` sidecar.
pub const DEFAULT_FUSED_PROXY_ENDPOINT: &str = "unix:///tmp/fcfsfused-proxy.sock";

/// The csi driver components.
pub use rpc::csi;

/// FastCFS cluster configuration.
pub mod cluster;
/// FastCFS user credentials staged for the engine tools.
pub mod credentials;
/// External storage engine invocation.
pub mod engine;
/// The CSI identity service.
pub mod identity;
/// Volume concurrency limiter.
pub mod limiter;
/// Tracing setup.
pub mod logging;
/// Orchestrator metadata.
pub mod metadata;
/// Host mounts.
pub mod mount;
/// Mount point state.
pub mod mount_point;
/// Contains tools to advertise the same set of capabilities across different
/// CSI microservices.
pub mod plugin_capabilities;
/// Remount of corrupted fuse mounts on node plugin startup.
pub mod recovery;
/// Secret references from storage class templates.
pub mod secret;
/// Shutdown signal handling.
pub mod shutdown;
/// Topology segments.
pub mod topology;
/// Unix domain socket transport.
pub mod transport;
/// Volume parameters.
pub mod volume;
/// Volume identifier codec.
pub mod volume_id;
