use crate::{controller::CsiControllerSvc, CsiControllerConfig};

use csi_driver::{identity::CsiIdentitySvc, shutdown::Shutdown, transport::bind_incoming};
use rpc::csi::{controller_server::ControllerServer, identity_server::IdentityServer};
use std::ops::Add;
use tonic::transport::Server;
use tracing::info;

pub(crate) struct CsiServer {}

impl CsiServer {
    pub(crate) async fn run(csi_socket: String) -> Result<(), String> {
        let incoming = bind_incoming(&csi_socket)?;

        let cfg = CsiControllerConfig::get_config();
        info!(
            "CSI controller {} serving {} FastCFS cluster(s) on {}",
            cfg.driver_name(),
            cfg.clusters().len(),
            csi_socket
        );

        Server::builder()
            .timeout(cfg.io_timeout().add(std::time::Duration::from_secs(3)))
            .add_service(IdentityServer::new(CsiIdentitySvc::new(cfg.driver_name())))
            .add_service(ControllerServer::new(CsiControllerSvc::new(cfg)))
            .serve_with_incoming_shutdown(incoming, Shutdown::wait())
            .await
            .map_err(|error| format!("Failed to start gRPC server: {error}"))?;
        Ok(())
    }
}
