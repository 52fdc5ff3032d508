use crate::CsiControllerConfig;

use csi_driver::{
    cluster::ClusterConfig,
    credentials::Credentials,
    engine::{FcfsPool, VolumeEngine},
    limiter::VolumeLocks,
    plugin_capabilities::{controller_capabilities, SUPPORTED_ACCESS_MODES},
    topology::topology_from_params,
    volume::{self, round_off_bytes, VolumeOptions, CLUSTER_ID_PARAM},
};
use rpc::csi::{Topology as CsiTopology, *};

use std::sync::Arc;
use tonic::{Response, Status};
use tracing::{debug, info, instrument};

pub(crate) struct CsiControllerSvc {
    locks: VolumeLocks,
    clusters: Arc<ClusterConfig>,
    engine: Arc<dyn VolumeEngine>,
}
impl CsiControllerSvc {
    pub(crate) fn new(cfg: &CsiControllerConfig) -> Self {
        Self::with_engine(cfg.clusters(), Arc::new(FcfsPool::default()))
    }
    pub(crate) fn with_engine(clusters: Arc<ClusterConfig>, engine: Arc<dyn VolumeEngine>) -> Self {
        Self {
            locks: VolumeLocks::new(),
            clusters,
            engine,
        }
    }
}

/// Check whether target volume capabilities are valid. FastCFS volumes are filesystems which
/// can be shared between nodes.
fn check_volume_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    for c in capabilities {
        if let Some(volume_capability::AccessType::Block(_)) = c.access_type {
            return Err(Status::invalid_argument(
                "FastCFS doesn't support block access type",
            ));
        }
        if let Some(access_mode) = c.access_mode.as_ref() {
            if !SUPPORTED_ACCESS_MODES
                .iter()
                .any(|mode| *mode as i32 == access_mode.mode)
            {
                return Err(Status::invalid_argument(format!(
                    "Invalid volume access mode: {:?}",
                    access_mode.mode
                )));
            }
        }
    }
    Ok(())
}

#[tonic::async_trait]
impl rpc::csi::controller_server::Controller for CsiControllerSvc {
    #[instrument(
        err,
        fields(volume.name = %request.get_ref().name, volume.id = tracing::field::Empty),
        skip(self, request)
    )]
    async fn create_volume(
        &self,
        request: tonic::Request<CreateVolumeRequest>,
    ) -> Result<tonic::Response<CreateVolumeResponse>, tonic::Status> {
        let args = request.into_inner();
        tracing::trace!(request.name = %args.name, parameters = ?args.parameters);

        if args.name.is_empty() {
            return Err(Status::invalid_argument("Name missing in request"));
        }
        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "Volume Capabilities missing in request",
            ));
        }
        check_volume_capabilities(&args.volume_capabilities)?;
        if args.volume_content_source.is_some() {
            return Err(Status::invalid_argument(
                "Creating volumes from a content source is not supported",
            ));
        }

        let credentials = Credentials::admin(&args.secrets)?;
        let _guard = self.locks.guard(&args.name)?;

        let required_bytes = args
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or_default();
        let volume = VolumeOptions::from_create_request(
            &args.name,
            &args.parameters,
            required_bytes,
            credentials.user_name(),
            &self.clusters,
        )?;
        tracing::Span::current().record("volume.id", volume.volume_id.as_str());

        // A retried request finds the volume already created.
        if self.engine.volume_exists(&volume, &credentials).await? {
            debug!(volume.id = %volume.volume_id, "Volume already exists");
        } else {
            self.engine.create_volume(&volume, &credentials).await?;
            info!(
                volume.id = %volume.volume_id,
                volume.name = %volume.volume_name,
                "Volume successfully created"
            );
        }

        let mut volume_context = args.parameters.clone();
        volume_context.insert(CLUSTER_ID_PARAM.to_string(), volume.cluster_id.clone());

        let accessible_topology = topology_from_params(
            &args.parameters,
            args.accessibility_requirements.as_ref(),
        )
        .map(|segments| vec![CsiTopology { segments }])
        .unwrap_or_default();

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(rpc::csi::Volume {
                capacity_bytes: round_off_bytes(required_bytes),
                volume_id: volume.volume_id,
                volume_context,
                content_source: None,
                accessible_topology,
            }),
        }))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn delete_volume(
        &self,
        request: tonic::Request<DeleteVolumeRequest>,
    ) -> Result<tonic::Response<DeleteVolumeResponse>, tonic::Status> {
        let args = request.into_inner();
        tracing::trace!(volume.id = %args.volume_id);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }

        let credentials = Credentials::admin(&args.secrets)?;
        let _guard = self.locks.guard(&args.volume_id)?;

        let volume = match VolumeOptions::from_volume_id(&args.volume_id, None, &self.clusters) {
            Ok(volume) => volume,
            // Statically provisioned volumes are owned by whoever created them.
            Err(volume::Error::InvalidVolumeId { .. }) => {
                info!(
                    volume.id = %args.volume_id,
                    "Not a provisioned volume id, leaving the volume in place"
                );
                return Ok(Response::new(DeleteVolumeResponse {}));
            }
            Err(error) => return Err(error.into()),
        };

        self.engine.delete_volume(&volume, &credentials).await?;
        info!(volume.id = %args.volume_id, "Volume successfully deleted");

        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn controller_publish_volume(
        &self,
        request: tonic::Request<ControllerPublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerPublishVolumeResponse>, tonic::Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn controller_unpublish_volume(
        &self,
        request: tonic::Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<tonic::Response<ControllerUnpublishVolumeResponse>, tonic::Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: tonic::Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<tonic::Response<ValidateVolumeCapabilitiesResponse>, tonic::Status> {
        let args = request.into_inner();
        tracing::trace!(volume.id = %args.volume_id, capabilities = ?args.volume_capabilities);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID cannot be empty"));
        }
        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(format!(
                "Volume {} Capabilities cannot be empty",
                args.volume_id
            )));
        }

        let response = match check_volume_capabilities(&args.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: args.volume_context,
                    volume_capabilities: args.volume_capabilities,
                    parameters: args.parameters,
                }),
                message: "".to_string(),
            },
            Err(status) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: status.message().to_string(),
            },
        };
        Ok(Response::new(response))
    }

    #[instrument(err, skip_all)]
    async fn list_volumes(
        &self,
        _request: tonic::Request<ListVolumesRequest>,
    ) -> Result<tonic::Response<ListVolumesResponse>, tonic::Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    #[instrument(err, skip_all)]
    async fn get_capacity(
        &self,
        _request: tonic::Request<GetCapacityRequest>,
    ) -> Result<tonic::Response<GetCapacityResponse>, tonic::Status> {
        Err(Status::unimplemented("Not implemented"))
    }

    #[instrument(err, skip_all)]
    async fn controller_get_capabilities(
        &self,
        _request: tonic::Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<tonic::Response<ControllerGetCapabilitiesResponse>, tonic::Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: controller_capabilities(),
        }))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: tonic::Request<ControllerExpandVolumeRequest>,
    ) -> Result<tonic::Response<ControllerExpandVolumeResponse>, tonic::Status> {
        let args = request.into_inner();
        tracing::trace!(volume.id = %args.volume_id, capacity = ?args.capacity_range);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID missing in request"));
        }
        let required_bytes = match args.capacity_range {
            Some(range) if range.required_bytes > 0 => range.required_bytes,
            _ => {
                return Err(Status::invalid_argument(
                    "Volume capacity range is not provided",
                ))
            }
        };

        let _guard = self.locks.guard(&args.volume_id)?;
        let credentials = Credentials::admin(&args.secrets)?;

        let volume =
            VolumeOptions::from_volume_id(&args.volume_id, Some(required_bytes), &self.clusters)?;
        let capacity_bytes = self.engine.resize_volume(&volume, &credentials).await?;
        info!(volume.id = %args.volume_id, capacity_bytes, "Volume successfully expanded");

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: false,
        }))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self, request))]
    async fn controller_get_volume(
        &self,
        request: tonic::Request<ControllerGetVolumeRequest>,
    ) -> Result<tonic::Response<ControllerGetVolumeResponse>, tonic::Status> {
        Err(Status::unimplemented("Not implemented"))
    }
}
