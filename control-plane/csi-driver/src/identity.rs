use crate::plugin_capabilities::plugin_capabilities;
use rpc::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, ProbeRequest, ProbeResponse,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The identity service shared by the controller and node plugins.
#[derive(Debug, Clone)]
pub struct CsiIdentitySvc {
    driver_name: String,
    ready: Arc<AtomicBool>,
}

impl CsiIdentitySvc {
    /// New identity service of the named driver, ready to serve.
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }
    /// Readiness reported by probe requests, shared with the plugin.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }
}

#[tonic::async_trait]
impl rpc::csi::identity_server::Identity for CsiIdentitySvc {
    #[instrument(skip(self))]
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!(
            "Request to get CSI plugin info, plugin: {}:{}",
            self.driver_name, CSI_PLUGIN_VERSION,
        );
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: CSI_PLUGIN_VERSION.to_string(),
            // Optional manifest is empty.
            manifest: HashMap::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        debug!("GetPluginCapabilities request: {:?}", request);

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities(),
        }))
    }

    #[instrument(skip(self))]
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        // Not ready is not an error: the CO keeps the plugin running and asks again.
        let ready = self.ready.load(Ordering::Relaxed);
        debug!("CSI plugin ready: {}", ready);
        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::csi::identity_server::Identity;

    #[tokio::test]
    async fn identity() {
        let svc = CsiIdentitySvc::new("fcfs.csi.vazmin.github.io");
        let info = svc
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "fcfs.csi.vazmin.github.io");
        assert_eq!(info.vendor_version, CSI_PLUGIN_VERSION);

        let probe = || svc.probe(Request::new(ProbeRequest {}));
        assert_eq!(probe().await.unwrap().into_inner().ready, Some(true));
        svc.readiness().store(false, Ordering::Relaxed);
        assert_eq!(probe().await.unwrap().into_inner().ready, Some(false));
    }
}
