use rpc::csi::{
    controller_service_capability::{self, rpc::Type as ControllerRpcType},
    node_service_capability::{self, rpc::Type as NodeRpcType},
    plugin_capability::{
        service::Type as PluginServiceType,
        volume_expansion::Type as PluginVolExpansionType,
        Service,
        Type::{Service as ServiceCapability, VolumeExpansion as VolExpansionCapability},
        VolumeExpansion,
    },
    volume_capability::access_mode::Mode,
    ControllerServiceCapability, NodeServiceCapability, PluginCapability,
};

/// This returns the exhaustive set of capabilities for this CSI driver.
pub fn plugin_capabilities() -> Vec<PluginCapability> {
    let service_capabilities = &[
        PluginServiceType::ControllerService,
        PluginServiceType::VolumeAccessibilityConstraints,
    ];

    // Quota changes apply to mounted volumes, there's nothing to do on the node.
    let expansion_capabilities = &[PluginVolExpansionType::Online];

    let mut capabilities: Vec<PluginCapability> = Vec::new();
    capabilities.extend(service_capabilities.iter().map(|c| PluginCapability {
        r#type: Some(ServiceCapability(Service { r#type: *c as i32 })),
    }));
    capabilities.extend(expansion_capabilities.iter().map(|c| PluginCapability {
        r#type: Some(VolExpansionCapability(VolumeExpansion {
            r#type: *c as i32,
        })),
    }));

    capabilities
}

/// The controller rpc's which are implemented.
pub fn controller_capabilities() -> Vec<ControllerServiceCapability> {
    [
        ControllerRpcType::CreateDeleteVolume,
        ControllerRpcType::ExpandVolume,
    ]
    .iter()
    .map(|c| ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(
            controller_service_capability::Rpc { r#type: *c as i32 },
        )),
    })
    .collect()
}

/// The node rpc's which are implemented.
pub fn node_capabilities() -> Vec<NodeServiceCapability> {
    [
        NodeRpcType::StageUnstageVolume,
        NodeRpcType::GetVolumeStats,
        NodeRpcType::VolumeCondition,
    ]
    .iter()
    .map(|c| NodeServiceCapability {
        r#type: Some(node_service_capability::Type::Rpc(
            node_service_capability::Rpc { r#type: *c as i32 },
        )),
    })
    .collect()
}

/// Access modes a FastCFS volume can be published with.
pub const SUPPORTED_ACCESS_MODES: [Mode; 2] = [Mode::SingleNodeWriter, Mode::MultiNodeMultiWriter];
