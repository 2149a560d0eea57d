//! Exclusive Filesystem Provisioner
//!
//! Every volume gets its own filesystem and export on the array. Creation
//! runs five dependent steps through a [`CompensationChain`]:
//!
//! 1. validate the network spaces
//! 2. create the filesystem (after the filesystem count check)
//! 3. export it (failure deletes the filesystem)
//! 4. resolve the network space IP (failure deletes the export)
//! 5. tag the filesystem with metadata (failure deletes the export)

use crate::controlplane::params::{
    self, bool_param, param, validate_required, volume_name_with_prefix, ProvisionerConfig,
};
use crate::controlplane::rollback::{Compensation, CompensationChain};
use crate::controlplane::volume_id::ExclusiveVolumeId;
use crate::domain::ports::{
    BackendGateway, BackendGatewayRef, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse, ExportPermission,
    ExportRecord, ExportSpec, FilesystemRecord, FilesystemSpec, ObjectId, StorageProtocol,
    Volume, VolumeController,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Metadata key tagging a filesystem with its volume name
pub const PV_NAME_METADATA_KEY: &str = "host.k8s.pvname";

/// What a successful create produced on the array
#[derive(Debug, Clone)]
struct ProvisionedFilesystem {
    filesystem: FilesystemRecord,
    export: ExportRecord,
    ip_address: String,
}

/// Provisioner backing each volume with a dedicated filesystem
pub struct ExclusiveFilesystemProvisioner {
    gateway: BackendGatewayRef,
    config: ProvisionerConfig,
}

impl ExclusiveFilesystemProvisioner {
    /// Create a new provisioner
    pub fn new(gateway: BackendGatewayRef, config: ProvisionerConfig) -> Self {
        Self { gateway, config }
    }

    fn gateway(&self) -> &dyn BackendGateway {
        self.gateway.as_ref()
    }

    /// Run the create steps, unwinding on failure
    async fn provision(
        &self,
        name: &str,
        capacity_bytes: u64,
        params: &mut BTreeMap<String, String>,
    ) -> Result<ProvisionedFilesystem> {
        let pool_name = param(params, params::POOL_NAME).unwrap_or_default().to_string();
        let requested_spaces = param(params, params::NFS_NETWORKSPACE)
            .unwrap_or_default()
            .to_string();

        let mut chain = CompensationChain::new(self.gateway(), self.config.unwind_policy);

        let network_spaces = chain
            .step(
                "validate_network_spaces",
                self.gateway()
                    .validate_network_spaces(&pool_name, &requested_spaces),
            )
            .await?;
        params.insert(params::NFS_NETWORKSPACE.to_string(), network_spaces.clone());
        debug!("Network spaces validated: {}", network_spaces);

        let filesystem = chain
            .step(
                "create_filesystem",
                self.create_filesystem(name, capacity_bytes, &pool_name, params),
            )
            .await?;
        chain.on_failure(Compensation::DeleteFilesystem(filesystem.id));
        info!("Created filesystem {} for {}", filesystem.id, name);

        let export_path = format!("{}/{}", self.config.export_root.trim_end_matches('/'), name);
        let export = chain
            .step(
                "create_export",
                self.create_export(filesystem.id, &export_path, params),
            )
            .await?;
        chain.on_failure(Compensation::DeleteExport(export.id));
        debug!("Created export {} at {}", export.id, export.export_path);

        let primary_space = network_spaces
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let ip_address = chain
            .step(
                "resolve_network_space_ip",
                self.gateway().network_space_ip(&primary_space),
            )
            .await?;

        let mut metadata = BTreeMap::new();
        metadata.insert(PV_NAME_METADATA_KEY.to_string(), name.to_string());
        metadata.insert("filesystem_type".to_string(), String::new());
        chain
            .step(
                "attach_metadata",
                self.gateway().attach_metadata(filesystem.id, &metadata),
            )
            .await?;

        chain.commit();

        Ok(ProvisionedFilesystem {
            filesystem,
            export,
            ip_address,
        })
    }

    /// Check the filesystem ceiling, resolve the pool and create the filesystem
    async fn create_filesystem(
        &self,
        name: &str,
        capacity_bytes: u64,
        pool_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<FilesystemRecord> {
        let count = self.gateway().filesystem_count().await?;
        debug!(
            "Filesystems on array: {} (max {})",
            count, self.config.max_filesystems
        );
        if count >= self.config.max_filesystems {
            return Err(Error::FilesystemLimitReached {
                count,
                max: self.config.max_filesystems,
            });
        }

        let pool_id = self.gateway().pool_id_by_name(pool_name).await?;
        let spec = FilesystemSpec {
            pool_id,
            name: name.to_string(),
            size_bytes: capacity_bytes,
            ssd_enabled: bool_param(params, params::SSD_ENABLED, false),
            provtype: param(params, params::PROVISION_TYPE)
                .unwrap_or(&self.config.default_provtype)
                .to_uppercase(),
        };

        self.gateway().create_filesystem(&spec).await
    }

    async fn create_export(
        &self,
        filesystem_id: ObjectId,
        export_path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<ExportRecord> {
        let access = param(params, params::NFS_EXPORT_PERMISSIONS)
            .unwrap_or(&self.config.default_export_permissions)
            .to_string();
        let no_root_squash = bool_param(
            params,
            params::NO_ROOT_SQUASH,
            self.config.default_no_root_squash,
        );

        // Clients are narrowed when the volume is published
        let spec = ExportSpec {
            filesystem_id,
            export_path: export_path.to_string(),
            transport_protocols: "TCP".to_string(),
            privileged_port: true,
            permissions: vec![ExportPermission {
                access,
                client: "*".to_string(),
                no_root_squash,
            }],
        };

        self.gateway().create_export(&spec).await
    }

    /// Remove exports, metadata and the filesystem, in that order
    async fn destroy(&self, filesystem_id: ObjectId) -> Result<()> {
        let mut chain = CompensationChain::new(self.gateway(), self.config.unwind_policy);

        let exports = match chain
            .step(
                "list_exports",
                self.gateway().exports_by_filesystem(filesystem_id),
            )
            .await
        {
            Ok(exports) => exports,
            Err(e) if e.is_not_found() => {
                info!("Filesystem {} already deleted", filesystem_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for export in exports {
            chain
                .step(
                    "delete_export",
                    absent_ok(self.gateway().delete_export(export.id)),
                )
                .await?;
        }
        debug!("Exports of filesystem {} deleted", filesystem_id);

        chain
            .step(
                "detach_metadata",
                absent_ok(self.gateway().detach_metadata(filesystem_id)),
            )
            .await?;
        chain
            .step(
                "delete_filesystem",
                absent_ok(self.gateway().delete_filesystem(filesystem_id)),
            )
            .await?;
        chain.commit();
        Ok(())
    }
}

/// Treat "already gone" as success
async fn absent_ok<F>(call: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match call.await {
        Err(e) if e.is_not_found() => {
            debug!("Ignoring already-absent object: {}", e);
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl VolumeController for ExclusiveFilesystemProvisioner {
    fn protocol(&self) -> StorageProtocol {
        StorageProtocol::Nfs
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let mut params = request.parameters.clone();
        let name = volume_name_with_prefix(&request.name, param(&params, params::VOL_PREFIX));
        if name.is_empty() {
            return Err(Error::InvalidArgument("Volume name missing in request".into()));
        }

        validate_required("nfs", &params, params::NFS_REQUIRED)?;
        let capacity_bytes = self.config.normalize_capacity(request.required_bytes());
        info!(
            "Creating nfs volume {} ({} bytes, access {:?})",
            name, capacity_bytes, request.access_types
        );

        let provisioned = self.provision(&name, capacity_bytes, &mut params).await?;
        let volume_id = ExclusiveVolumeId(provisioned.filesystem.id).to_string();

        params.insert("ipAddress".into(), provisioned.ip_address.clone());
        params.insert("volPathd".into(), provisioned.export.export_path.clone());
        params.insert("volID".into(), volume_id.clone());
        params.insert("volSize".into(), capacity_bytes.to_string());
        params.insert("exportID".into(), provisioned.export.id.to_string());
        params.insert("fileSystemID".into(), provisioned.filesystem.id.to_string());
        params.insert("exportBlock".into(), provisioned.export.export_path.clone());

        info!("Created nfs volume {} -> {}", name, volume_id);

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes,
                volume_context: params,
            },
        })
    }

    async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("Volume ID missing in request".into()));
        }

        // Exclusive IDs that do not decode name nothing this provisioner created
        let id = match request.volume_id.parse::<ExclusiveVolumeId>() {
            Ok(id) => id,
            Err(e) => {
                warn!("{}; nothing to delete", e);
                return Ok(());
            }
        };

        self.destroy(id.filesystem_id()).await?;
        info!("Deleted nfs volume {}", request.volume_id);
        Ok(())
    }

    async fn expand_volume(&self, request: ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("Volume ID missing in request".into()));
        }
        let range = request
            .capacity_range
            .ok_or_else(|| Error::InvalidArgument("CapacityRange cannot be empty".into()))?;

        let id: ExclusiveVolumeId = request.volume_id.parse()?;
        let capacity_bytes = self.config.normalize_capacity(range.required_bytes);
        info!(
            "Expanding nfs volume {} to {} bytes",
            request.volume_id, capacity_bytes
        );

        match self
            .gateway()
            .resize_filesystem(id.filesystem_id(), capacity_bytes)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Filesystem {} no longer exists: {}", id, e);
            }
            Err(e) => return Err(e),
        }

        Ok(ExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{GatewayOp, MemoryGateway};
    use crate::controlplane::params::{UnwindPolicy, GIB};
    use crate::domain::ports::CapacityRange;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn gateway() -> Arc<MemoryGateway> {
        Arc::new(
            MemoryGateway::new()
                .with_pool("p1")
                .with_network_space("ns1", &["10.0.0.1"]),
        )
    }

    fn provisioner(gateway: &Arc<MemoryGateway>) -> ExclusiveFilesystemProvisioner {
        ExclusiveFilesystemProvisioner::new(gateway.clone(), ProvisionerConfig::default())
    }

    fn create_request(name: &str, bytes: u64) -> CreateVolumeRequest {
        let mut parameters = BTreeMap::new();
        parameters.insert("pool_name".to_string(), "p1".to_string());
        parameters.insert("nfs_networkspace".to_string(), "ns1".to_string());
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            }),
            parameters,
            access_types: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_volume_raises_capacity_to_floor() {
        let gw = gateway();
        let p = provisioner(&gw);

        let response = p
            .create_volume(create_request("pvc-1", 500 * 1024 * 1024))
            .await
            .unwrap();

        let volume = response.volume;
        assert_eq!(volume.capacity_bytes, 1073741824);
        let fs_id: u64 = volume.volume_id.parse().unwrap();
        assert_eq!(gw.filesystem(fs_id).await.unwrap().size_bytes, GIB);
        assert_eq!(gw.export_count().await, 1);
        assert_eq!(volume.volume_context["ipAddress"], "10.0.0.1");
        assert_eq!(volume.volume_context["volPathd"], "/fs/pvc-1");
        assert_eq!(volume.volume_context["fileSystemID"], volume.volume_id);
        assert_eq!(
            gw.metadata(fs_id).await.unwrap()[PV_NAME_METADATA_KEY],
            "pvc-1"
        );
    }

    #[tokio::test]
    async fn test_create_volume_reports_missing_parameters() {
        let gw = gateway();
        let p = provisioner(&gw);

        let mut request = create_request("pvc-1", GIB);
        request.parameters.clear();

        let err = p.create_volume(request).await.unwrap_err();
        assert_matches!(err, Error::MissingParameters { ref missing, .. } => {
            assert_eq!(missing.len(), 2);
        });
        assert!(gw.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_applies_prefix_and_flags() {
        let gw = gateway();
        let p = provisioner(&gw);

        let mut request = create_request("pvc-abcd", 2 * GIB);
        request.parameters.insert("vol_prefix".into(), "csi-".into());
        request.parameters.insert("ssd_enabled".into(), "true".into());
        request.parameters.insert("provision_type".into(), "thick".into());
        request.parameters.insert("nfs_export_permissions".into(), "RO".into());

        let volume = p.create_volume(request).await.unwrap().volume;
        let fs = gw.filesystem(volume.volume_id.parse().unwrap()).await.unwrap();
        assert_eq!(fs.name, "csi-abcd");
        assert!(fs.ssd_enabled);
        assert_eq!(fs.provtype, "THICK");
        assert_eq!(fs.size_bytes, 2 * GIB);
        assert_eq!(volume.volume_context["exportBlock"], "/fs/csi-abcd");
    }

    #[tokio::test]
    async fn test_filesystem_limit_blocks_creation() {
        let gw = Arc::new(
            MemoryGateway::new()
                .with_pool("p1")
                .with_network_space("ns1", &["10.0.0.1"])
                .with_foreign_filesystems(4000),
        );
        let p = provisioner(&gw);

        let err = p.create_volume(create_request("pvc-1", GIB)).await.unwrap_err();
        assert_matches!(err, Error::FilesystemLimitReached { count: 4000, max: 4000 });
        assert_eq!(gw.calls(GatewayOp::CreateFilesystem), 0);
    }

    #[tokio::test]
    async fn test_export_failure_deletes_filesystem_once() {
        let gw = gateway();
        gw.fail_on(GatewayOp::CreateExport);
        let p = provisioner(&gw);

        let err = p.create_volume(create_request("pvc-1", GIB)).await.unwrap_err();

        assert_matches!(err, Error::BackendOperationFailed { ref operation, .. }
            if operation == "CreateExport");
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 1);
        assert!(gw.filesystem_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_export_failure_surfaces_original_error_when_undo_fails() {
        let gw = gateway();
        gw.fail_on(GatewayOp::CreateExport);
        gw.fail_on(GatewayOp::DeleteFilesystem);
        let p = provisioner(&gw);

        let err = p.create_volume(create_request("pvc-1", GIB)).await.unwrap_err();

        assert_matches!(err, Error::BackendOperationFailed { ref operation, .. }
            if operation == "CreateExport");
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 1);
        // Orphaned filesystem left for out-of-band cleanup
        assert_eq!(gw.filesystem_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ip_failure_deletes_export_only() {
        let gw = gateway();
        gw.fail_on(GatewayOp::NetworkSpaceIp);
        let p = provisioner(&gw);

        assert!(p.create_volume(create_request("pvc-1", GIB)).await.is_err());

        assert_eq!(gw.calls(GatewayOp::DeleteExport), 1);
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 0);
        assert_eq!(gw.export_count().await, 0);
        assert_eq!(gw.filesystem_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ip_failure_with_full_unwind_removes_everything() {
        let gw = gateway();
        gw.fail_on(GatewayOp::NetworkSpaceIp);
        let config = ProvisionerConfig {
            unwind_policy: UnwindPolicy::Full,
            ..Default::default()
        };
        let p = ExclusiveFilesystemProvisioner::new(gw.clone(), config);

        assert!(p.create_volume(create_request("pvc-1", GIB)).await.is_err());

        assert_eq!(gw.calls(GatewayOp::DeleteExport), 1);
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 1);
        assert!(gw.filesystem_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_panic_is_reported_and_unwound() {
        let gw = gateway();
        gw.panic_on(GatewayOp::AttachMetadata);
        let p = provisioner(&gw);

        let err = p.create_volume(create_request("pvc-1", GIB)).await.unwrap_err();

        assert_matches!(err, Error::BackendOperationFailed { ref operation, .. }
            if operation == "attach_metadata");
        assert_eq!(gw.calls(GatewayOp::DeleteExport), 1);
        assert_eq!(gw.export_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_network_space_creates_nothing() {
        let gw = gateway();
        let p = provisioner(&gw);

        let mut request = create_request("pvc-1", GIB);
        request
            .parameters
            .insert("nfs_networkspace".into(), "missing".into());

        assert_matches!(
            p.create_volume(request).await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_eq!(gw.calls(GatewayOp::CreateFilesystem), 0);
    }

    #[tokio::test]
    async fn test_delete_volume_removes_everything() {
        let gw = gateway();
        let p = provisioner(&gw);
        let volume = p
            .create_volume(create_request("pvc-1", GIB))
            .await
            .unwrap()
            .volume;

        p.delete_volume(DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
        })
        .await
        .unwrap();

        assert!(gw.filesystem_ids().await.is_empty());
        assert_eq!(gw.export_count().await, 0);
        let fs_id: u64 = volume.volume_id.parse().unwrap();
        assert!(gw.metadata(fs_id).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_absent_filesystem_succeeds() {
        let gw = gateway();
        let p = provisioner(&gw);

        p.delete_volume(DeleteVolumeRequest {
            volume_id: "777".into(),
        })
        .await
        .unwrap();
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 0);
    }

    #[tokio::test]
    async fn test_delete_malformed_id_is_a_no_op() {
        let gw = gateway();
        let p = provisioner(&gw);

        p.delete_volume(DeleteVolumeRequest {
            volume_id: "42#7#100".into(),
        })
        .await
        .unwrap();
        assert!(gw.call_log().is_empty());

        assert_matches!(
            p.delete_volume(DeleteVolumeRequest::default()).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_delete_stops_at_first_failure() {
        let gw = gateway();
        let p = provisioner(&gw);
        let volume = p
            .create_volume(create_request("pvc-1", GIB))
            .await
            .unwrap()
            .volume;
        gw.fail_on(GatewayOp::DetachMetadata);

        assert!(p
            .delete_volume(DeleteVolumeRequest {
                volume_id: volume.volume_id,
            })
            .await
            .is_err());
        assert_eq!(gw.calls(GatewayOp::DeleteFilesystem), 0);
        assert_eq!(gw.export_count().await, 0);
    }

    #[tokio::test]
    async fn test_expand_volume() {
        let gw = gateway();
        let p = provisioner(&gw);
        let volume = p
            .create_volume(create_request("pvc-1", GIB))
            .await
            .unwrap()
            .volume;

        let response = p
            .expand_volume(ExpandVolumeRequest {
                volume_id: volume.volume_id.clone(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 5 * GIB,
                    limit_bytes: 0,
                }),
            })
            .await
            .unwrap();

        assert_eq!(response.capacity_bytes, 5 * GIB);
        assert!(!response.node_expansion_required);
        let fs_id: u64 = volume.volume_id.parse().unwrap();
        assert_eq!(gw.filesystem(fs_id).await.unwrap().size_bytes, 5 * GIB);
        assert_eq!(gw.calls(GatewayOp::ResizeFilesystem), 1);
    }

    #[tokio::test]
    async fn test_expand_validates_request() {
        let gw = gateway();
        let p = provisioner(&gw);

        assert_matches!(
            p.expand_volume(ExpandVolumeRequest {
                volume_id: "5".into(),
                capacity_range: None,
            })
            .await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            p.expand_volume(ExpandVolumeRequest {
                volume_id: "5$$nfs".into(),
                capacity_range: Some(CapacityRange::default()),
            })
            .await,
            Err(Error::MalformedVolumeId { .. })
        );
    }

    #[tokio::test]
    async fn test_expand_absent_filesystem_reports_requested_size() {
        let gw = gateway();
        let p = provisioner(&gw);

        let response = p
            .expand_volume(ExpandVolumeRequest {
                volume_id: "99".into(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 10,
                    limit_bytes: 0,
                }),
            })
            .await
            .unwrap();
        assert_eq!(response.capacity_bytes, GIB);
    }

    #[tokio::test]
    async fn test_unimplemented_surface_returns_empty() {
        let gw = gateway();
        let p = provisioner(&gw);

        assert!(p.list_volumes().await.unwrap().entries.is_empty());
        assert_eq!(p.get_capacity().await.unwrap().available_capacity, 0);
        assert!(p
            .create_snapshot(Default::default())
            .await
            .unwrap()
            .snapshot_id
            .is_none());
        assert!(p.controller_unpublish_volume(Default::default()).await.is_ok());
    }
}
