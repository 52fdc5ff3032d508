use anyhow::Context;
use clap::ArgMatches;
use csi_driver::cluster::ClusterConfig;
use once_cell::sync::OnceCell;
use std::{sync::Arc, time::Duration};

static CONFIG: OnceCell<CsiControllerConfig> = OnceCell::new();

// Global CSI Controller config.
pub(crate) struct CsiControllerConfig {
    /// Name the driver registers with.
    driver_name: String,
    /// FastCFS clusters volumes can be provisioned on.
    clusters: Arc<ClusterConfig>,
    /// Timeout for a single gRPC call, including the engine invocations.
    io_timeout: Duration,
}

impl CsiControllerConfig {
    /// Initialize global instance of the CSI config. Must be called prior to using the config.
    pub(crate) fn initialize(args: &ArgMatches) -> anyhow::Result<()> {
        assert!(
            CONFIG.get().is_none(),
            "CSI Controller config already initialized"
        );

        let driver_name = args
            .get_one::<String>("driver-name")
            .context("driver name must be specified")?;

        let cluster_config = args
            .get_one::<String>("cluster-config")
            .context("cluster configuration must be specified")?;
        let clusters = ClusterConfig::load(cluster_config)
            .with_context(|| format!("Failed to load the cluster configuration {cluster_config}"))?;

        let io_timeout = args
            .get_one::<String>("timeout")
            .context("I/O timeout must be specified")?
            .parse::<humantime::Duration>()?;

        CONFIG.get_or_init(|| Self {
            driver_name: driver_name.clone(),
            clusters: Arc::new(clusters),
            io_timeout: io_timeout.into(),
        });
        Ok(())
    }

    /// Get global instance of CSI controller config.
    pub(crate) fn get_config() -> &'static CsiControllerConfig {
        CONFIG
            .get()
            .expect("CSI Controller config is not initialized")
    }

    /// Get the driver name.
    pub(crate) fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Get the configured clusters.
    pub(crate) fn clusters(&self) -> Arc<ClusterConfig> {
        self.clusters.clone()
    }

    /// Get I/O timeout for a single gRPC call.
    pub(crate) fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}
