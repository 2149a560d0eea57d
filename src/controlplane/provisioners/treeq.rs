//! Treeq Quota Provisioner
//!
//! Volumes are quota-bounded directories (treeqs) inside filesystems shared
//! by many volumes. The array gateway picks or creates the shared filesystem;
//! this provisioner only decides the sizes and encodes the result into a
//! [`TreeqVolumeId`].

use crate::controlplane::params::{
    self, bool_param, count_param, param, parse_capacity, validate_required, ProvisionerConfig,
};
use crate::controlplane::rollback::CompensationChain;
use crate::controlplane::volume_id::TreeqVolumeId;
use crate::domain::ports::{
    BackendGateway, BackendGatewayRef, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest, ExpandVolumeRequest,
    ExpandVolumeResponse, ExportPermission, StorageProtocol, TreeqSpec, Volume,
    VolumeController,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Provisioner carving volumes out of shared filesystems
pub struct TreeqProvisioner {
    gateway: BackendGatewayRef,
    config: ProvisionerConfig,
}

impl TreeqProvisioner {
    /// Create a new provisioner
    pub fn new(gateway: BackendGatewayRef, config: ProvisionerConfig) -> Self {
        Self { gateway, config }
    }

    fn gateway(&self) -> &dyn BackendGateway {
        self.gateway.as_ref()
    }

    fn treeq_spec(&self, request: &CreateVolumeRequest, size_bytes: u64) -> Result<TreeqSpec> {
        let parameters = &request.parameters;

        let max_filesystem_size = param(parameters, params::MAX_FILESYSTEM_SIZE)
            .map(parse_capacity)
            .transpose()
            .map_err(|e| Error::InvalidArgument(format!("max_filesystem_size: {}", e)))?
            .unwrap_or_default();

        Ok(TreeqSpec {
            name: request.name.clone(),
            pool_name: param(parameters, params::POOL_NAME)
                .unwrap_or_default()
                .to_string(),
            network_space: param(parameters, params::NETWORK_SPACE)
                .unwrap_or_default()
                .to_string(),
            size_bytes,
            max_filesystem_size,
            max_treeqs_per_filesystem: count_param(parameters, params::MAX_TREEQS_PER_FILESYSTEM)?,
            max_filesystems: count_param(parameters, params::MAX_FILESYSTEMS)?,
            ssd_enabled: bool_param(parameters, params::SSD_ENABLED, false),
            provtype: param(parameters, params::PROVISION_TYPE)
                .unwrap_or(&self.config.default_provtype)
                .to_uppercase(),
            permissions: vec![ExportPermission {
                access: param(parameters, params::NFS_EXPORT_PERMISSIONS)
                    .unwrap_or(&self.config.default_export_permissions)
                    .to_string(),
                client: "*".to_string(),
                no_root_squash: bool_param(
                    parameters,
                    params::NO_ROOT_SQUASH,
                    self.config.default_no_root_squash,
                ),
            }],
        })
    }
}

#[async_trait]
impl VolumeController for TreeqProvisioner {
    fn protocol(&self) -> StorageProtocol {
        StorageProtocol::NfsTreeq
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("Volume name missing in request".into()));
        }
        validate_required("nfs_treeq", &request.parameters, params::TREEQ_REQUIRED)?;

        let capacity_bytes = self.config.normalize_capacity(request.required_bytes());
        let spec = self.treeq_spec(&request, capacity_bytes)?;
        info!(
            "Creating treeq volume {} ({} bytes) in pool {}",
            spec.name, capacity_bytes, spec.pool_name
        );

        // Nothing to compensate here; the chain only guards each step
        let mut chain = CompensationChain::new(self.gateway(), self.config.unwind_policy);
        let existing = chain
            .step(
                "find_treeq",
                self.gateway()
                    .find_treeq(&spec.pool_name, &spec.network_space, &spec.name),
            )
            .await?;

        let treeq = match existing {
            Some(treeq) => {
                info!(
                    "Treeq {} already exists in filesystem {}, reusing it",
                    treeq.treeq_id, treeq.filesystem_id
                );
                treeq
            }
            None => {
                chain
                    .step("create_treeq", self.gateway().create_treeq(&spec))
                    .await?
            }
        };
        chain.commit();

        let volume_id = TreeqVolumeId {
            filesystem_id: treeq.filesystem_id,
            treeq_id: treeq.treeq_id,
            max_filesystem_size: spec.max_filesystem_size,
        }
        .to_string();

        info!("Created treeq volume {} -> {}", spec.name, volume_id);

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes,
                volume_context: treeq.volume_context(),
            },
        })
    }

    async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        let id: TreeqVolumeId = request
            .volume_id
            .parse()
            .map_err(|e: Error| Error::InvalidArgument(e.to_string()))?;

        match self
            .gateway()
            .delete_treeq(id.filesystem_id, id.treeq_id)
            .await
        {
            Ok(()) => {
                info!("Deleted treeq volume {}", request.volume_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Treeq volume {} already deleted: {}", request.volume_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn expand_volume(&self, request: ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        let id: TreeqVolumeId = request
            .volume_id
            .parse()
            .map_err(|e: Error| Error::InvalidArgument(e.to_string()))?;
        let range = request
            .capacity_range
            .ok_or_else(|| Error::InvalidArgument("CapacityRange cannot be empty".into()))?;

        let capacity_bytes = self.config.normalize_capacity(range.required_bytes);
        info!(
            "Expanding treeq volume {} to {} bytes",
            request.volume_id, capacity_bytes
        );

        match self
            .gateway()
            .resize_treeq(
                id.filesystem_id,
                id.treeq_id,
                capacity_bytes,
                id.max_filesystem_size,
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Treeq volume {} no longer exists: {}", request.volume_id, e);
            }
            Err(e) => return Err(e),
        }

        Ok(ExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: false,
        })
    }

    async fn create_snapshot(
        &self,
        _request: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        Err(Error::Unimplemented("Unsupported operation for treeq".into()))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<()> {
        Err(Error::Unimplemented("Unsupported operation for treeq".into()))
    }
}
