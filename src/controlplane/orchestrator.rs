//! Main Orchestrator
//!
//! Routes controller calls to the provisioner of the right protocol:
//! - Create: the `storage_protocol` storage class parameter
//! - Everything else: an explicit protocol, or the shape of the volume ID
//!
//! Every routed call is counted in `nfs_provisioner_operations_total`.

use crate::controlplane::params::{self, ProvisionerConfig};
use crate::controlplane::provisioners::ProvisionerFactory;
use crate::controlplane::volume_id::TREEQ_ID_DELIMITER;
use crate::domain::ports::{
    BackendGatewayRef, ControllerCapability, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest, ExpandVolumeRequest,
    ExpandVolumeResponse, GetCapacityResponse, ListVolumesResponse, PublishVolumeRequest,
    PublishVolumeResponse, StorageProtocol, ValidateVolumeCapabilitiesResponse,
    VolumeControllerRef,
};
use crate::error::{Error, Result};
use prometheus::{IntCounterVec, Opts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Settings shared by every provisioner
    pub provisioner: ProvisionerConfig,
    /// Protocols to serve
    pub protocols: Vec<StorageProtocol>,
    /// Protocol used when a create request names none
    pub default_protocol: StorageProtocol,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provisioner: ProvisionerConfig::default(),
            protocols: vec![StorageProtocol::Nfs, StorageProtocol::NfsTreeq],
            default_protocol: StorageProtocol::Nfs,
        }
    }
}

// =============================================================================
// Metrics
// =============================================================================

fn operations_counter() -> Option<&'static IntCounterVec> {
    static COUNTER: OnceLock<Option<IntCounterVec>> = OnceLock::new();
    COUNTER
        .get_or_init(|| {
            let counter = IntCounterVec::new(
                Opts::new(
                    "nfs_provisioner_operations_total",
                    "Controller operations by protocol and result",
                ),
                &["protocol", "operation", "result"],
            )
            .ok()?;
            let _ = prometheus::register(Box::new(counter.clone()));
            Some(counter)
        })
        .as_ref()
}

fn record<T>(protocol: StorageProtocol, operation: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.code().as_str(),
    };
    if let Some(counter) = operations_counter() {
        let protocol = protocol.to_string();
        counter
            .with_label_values(&[protocol.as_str(), operation, outcome])
            .inc();
    }
}

/// Guess the protocol from the shape of a volume ID
///
/// Treeq IDs always carry the field delimiter; exclusive IDs never do.
pub fn protocol_for_volume_id(volume_id: &str) -> StorageProtocol {
    if volume_id.contains(TREEQ_ID_DELIMITER) {
        StorageProtocol::NfsTreeq
    } else {
        StorageProtocol::Nfs
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Routes controller calls to protocol provisioners
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend_name: String,
    /// Provisioners by protocol
    controllers: BTreeMap<StorageProtocol, VolumeControllerRef>,
}

impl Orchestrator {
    /// Create a new orchestrator serving the configured protocols
    pub fn new(config: OrchestratorConfig, gateway: BackendGatewayRef) -> Arc<Self> {
        if operations_counter().is_none() {
            warn!("Operation metrics unavailable");
        }

        let controllers = config
            .protocols
            .iter()
            .map(|protocol| {
                info!("Registering {} provisioner", protocol);
                (
                    *protocol,
                    ProvisionerFactory::create(
                        *protocol,
                        gateway.clone(),
                        config.provisioner.clone(),
                    ),
                )
            })
            .collect();

        Arc::new(Self {
            backend_name: gateway.backend_name().to_string(),
            config,
            controllers,
        })
    }

    /// Provisioner for a protocol
    pub fn controller(&self, protocol: StorageProtocol) -> Result<VolumeControllerRef> {
        self.controllers
            .get(&protocol)
            .cloned()
            .ok_or_else(|| Error::UnsupportedProtocol(protocol.to_string()))
    }

    fn resolve(&self, protocol: Option<StorageProtocol>, volume_id: &str) -> StorageProtocol {
        protocol.unwrap_or_else(|| protocol_for_volume_id(volume_id))
    }

    /// Create a volume with the protocol named by its parameters
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let protocol = match params::param(&request.parameters, params::STORAGE_PROTOCOL) {
            Some(value) => value.parse()?,
            None => self.config.default_protocol,
        };
        debug!("Routing create of {} to {}", request.name, protocol);

        let result = match self.controller(protocol) {
            Ok(controller) => controller.create_volume(request).await,
            Err(e) => Err(e),
        };
        record(protocol, "create_volume", &result);
        result
    }

    /// Delete a volume
    pub async fn delete_volume(
        &self,
        request: DeleteVolumeRequest,
        protocol: Option<StorageProtocol>,
    ) -> Result<()> {
        let protocol = self.resolve(protocol, &request.volume_id);
        debug!("Routing delete of {} to {}", request.volume_id, protocol);

        let result = match self.controller(protocol) {
            Ok(controller) => controller.delete_volume(request).await,
            Err(e) => Err(e),
        };
        record(protocol, "delete_volume", &result);
        result
    }

    /// Expand a volume
    pub async fn expand_volume(
        &self,
        request: ExpandVolumeRequest,
        protocol: Option<StorageProtocol>,
    ) -> Result<ExpandVolumeResponse> {
        let protocol = self.resolve(protocol, &request.volume_id);
        debug!("Routing expand of {} to {}", request.volume_id, protocol);

        let result = match self.controller(protocol) {
            Ok(controller) => controller.expand_volume(request).await,
            Err(e) => Err(e),
        };
        record(protocol, "expand_volume", &result);
        result
    }

    pub async fn controller_publish_volume(
        &self,
        request: PublishVolumeRequest,
        protocol: Option<StorageProtocol>,
    ) -> Result<PublishVolumeResponse> {
        let protocol = self.resolve(protocol, &request.volume_id);
        let result = self.controller(protocol)?.controller_publish_volume(request).await;
        record(protocol, "controller_publish_volume", &result);
        result
    }

    pub async fn controller_unpublish_volume(
        &self,
        request: PublishVolumeRequest,
        protocol: Option<StorageProtocol>,
    ) -> Result<()> {
        let protocol = self.resolve(protocol, &request.volume_id);
        let result = self
            .controller(protocol)?
            .controller_unpublish_volume(request)
            .await;
        record(protocol, "controller_unpublish_volume", &result);
        result
    }

    pub async fn validate_volume_capabilities(
        &self,
        volume_id: &str,
        protocol: Option<StorageProtocol>,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        let protocol = self.resolve(protocol, volume_id);
        self.controller(protocol)?
            .validate_volume_capabilities(volume_id)
            .await
    }

    pub async fn list_volumes(&self, protocol: Option<StorageProtocol>) -> Result<ListVolumesResponse> {
        let protocol = protocol.unwrap_or(self.config.default_protocol);
        self.controller(protocol)?.list_volumes().await
    }

    pub async fn get_capacity(&self, protocol: Option<StorageProtocol>) -> Result<GetCapacityResponse> {
        let protocol = protocol.unwrap_or(self.config.default_protocol);
        self.controller(protocol)?.get_capacity().await
    }

    /// Capabilities advertised for a protocol
    pub fn capabilities(&self, protocol: Option<StorageProtocol>) -> Result<Vec<ControllerCapability>> {
        let protocol = protocol.unwrap_or(self.config.default_protocol);
        Ok(self.controller(protocol)?.controller_get_capabilities())
    }

    pub async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
        protocol: Option<StorageProtocol>,
    ) -> Result<CreateSnapshotResponse> {
        let protocol = self.resolve(protocol, &request.source_volume_id);
        let result = self.controller(protocol)?.create_snapshot(request).await;
        record(protocol, "create_snapshot", &result);
        result
    }

    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        protocol: Option<StorageProtocol>,
    ) -> Result<()> {
        let protocol = protocol.unwrap_or(self.config.default_protocol);
        let result = self.controller(protocol)?.delete_snapshot(snapshot_id).await;
        record(protocol, "delete_snapshot", &result);
        result
    }

    /// Get overall orchestrator status
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            healthy: !self.controllers.is_empty(),
            backend: self.backend_name.clone(),
            protocols: self.controllers.keys().copied().collect(),
            default_protocol: self.config.default_protocol,
        }
    }
}

/// Orchestrator status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub healthy: bool,
    pub backend: String,
    pub protocols: Vec<StorageProtocol>,
    pub default_protocol: StorageProtocol,
}
