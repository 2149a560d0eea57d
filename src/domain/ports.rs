//! Domain Ports - Core trait definitions for the volume provisioner
//!
//! These traits define the boundaries between the domain logic and external systems.
//! The transport drives a [`VolumeController`]; controllers drive a [`BackendGateway`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Storage Protocols
// =============================================================================

/// Provisioning strategies selectable from the storage class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProtocol {
    /// One filesystem and one export per volume
    Nfs,
    /// Volumes as treeqs inside shared filesystems
    NfsTreeq,
}

impl std::fmt::Display for StorageProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProtocol::Nfs => write!(f, "nfs"),
            StorageProtocol::NfsTreeq => write!(f, "nfs_treeq"),
        }
    }
}

impl std::str::FromStr for StorageProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "nfs" => Ok(StorageProtocol::Nfs),
            "nfs_treeq" | "treeq" => Ok(StorageProtocol::NfsTreeq),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Requested volume access type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Mount,
    Block,
}

// =============================================================================
// Controller Requests/Responses
// =============================================================================

/// Requested capacity bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    /// Minimum size in bytes
    pub required_bytes: u64,
    /// Maximum size in bytes (0 for unbounded)
    #[serde(default)]
    pub limit_bytes: u64,
}

/// Request to create a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Volume name chosen by the orchestrator
    pub name: String,
    /// Capacity bounds; absent means the smallest allowed size
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Storage class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Requested access types
    #[serde(default)]
    pub access_types: Vec<AccessType>,
}

impl CreateVolumeRequest {
    /// Requested size in bytes, zero when no range was given
    pub fn required_bytes(&self) -> u64 {
        self.capacity_range.map(|r| r.required_bytes).unwrap_or(0)
    }
}

/// A provisioned volume as reported to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Opaque identifier; the only persisted state
    pub volume_id: String,
    /// Provisioned capacity in bytes
    pub capacity_bytes: u64,
    /// Context handed back on node calls
    pub volume_context: BTreeMap<String, String>,
}

/// Response from volume creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

/// Request to delete a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

/// Request to expand a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

/// Response from volume expansion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

/// Request to publish or unpublish a volume to a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
}

/// Response from controller publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

/// Response from capability validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeCapabilitiesResponse {
    pub confirmed: Vec<AccessType>,
    pub message: String,
}

/// Response from volume listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    pub next_token: String,
}

/// Response from capacity query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCapacityResponse {
    pub available_capacity: u64,
}

/// Controller capabilities advertised to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    ExpandVolume,
}

/// Request to create a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
}

/// Response from snapshot creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotResponse {
    pub snapshot_id: Option<String>,
}

// =============================================================================
// Volume Controller Port
// =============================================================================

/// Lifecycle contract shared by every provisioning strategy
///
/// Only create, delete and expand carry behavior. The remaining methods
/// exist to cover the full controller surface and answer with empty
/// responses unless a strategy overrides them.
#[async_trait]
pub trait VolumeController: Send + Sync {
    /// Strategy implemented by this controller
    fn protocol(&self) -> StorageProtocol;

    /// Create a volume
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse>;

    /// Delete a volume
    async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()>;

    /// Expand a volume
    async fn expand_volume(&self, request: ExpandVolumeRequest) -> Result<ExpandVolumeResponse>;

    async fn controller_publish_volume(
        &self,
        _request: PublishVolumeRequest,
    ) -> Result<PublishVolumeResponse> {
        Ok(PublishVolumeResponse::default())
    }

    async fn controller_unpublish_volume(&self, _request: PublishVolumeRequest) -> Result<()> {
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        _volume_id: &str,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        Ok(ValidateVolumeCapabilitiesResponse::default())
    }

    async fn list_volumes(&self) -> Result<ListVolumesResponse> {
        Ok(ListVolumesResponse::default())
    }

    async fn get_capacity(&self) -> Result<GetCapacityResponse> {
        Ok(GetCapacityResponse::default())
    }

    fn controller_get_capabilities(&self) -> Vec<ControllerCapability> {
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::ExpandVolume,
        ]
    }

    async fn create_snapshot(
        &self,
        _request: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        Ok(CreateSnapshotResponse::default())
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Storage Array Records
// =============================================================================

/// Identifier assigned by the storage array
pub type ObjectId = u64;

/// Filesystem creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    pub pool_id: ObjectId,
    pub name: String,
    pub size_bytes: u64,
    pub ssd_enabled: bool,
    /// THIN or THICK
    pub provtype: String,
}

/// Filesystem as stored on the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRecord {
    pub id: ObjectId,
    pub name: String,
    pub pool_id: ObjectId,
    pub size_bytes: u64,
    pub ssd_enabled: bool,
    pub provtype: String,
}

/// One access rule on an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPermission {
    /// RW or RO
    pub access: String,
    /// Client filter; `*` matches every host
    pub client: String,
    pub no_root_squash: bool,
}

/// Export creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub filesystem_id: ObjectId,
    pub export_path: String,
    pub transport_protocols: String,
    pub privileged_port: bool,
    pub permissions: Vec<ExportPermission>,
}

/// Export as stored on the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: ObjectId,
    pub filesystem_id: ObjectId,
    pub export_path: String,
    pub permissions: Vec<ExportPermission>,
}

/// Treeq creation parameters, handed to the array as one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeqSpec {
    pub name: String,
    pub pool_name: String,
    pub network_space: String,
    pub size_bytes: u64,
    /// Size ceiling of a shared filesystem
    pub max_filesystem_size: u64,
    pub max_treeqs_per_filesystem: Option<u64>,
    pub max_filesystems: Option<u64>,
    pub ssd_enabled: bool,
    pub provtype: String,
    pub permissions: Vec<ExportPermission>,
}

/// A treeq together with the context needed to mount it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeqVolume {
    pub filesystem_id: ObjectId,
    pub treeq_id: ObjectId,
    pub name: String,
    pub size_bytes: u64,
    /// Path of the treeq inside its filesystem
    pub path: String,
    pub export_path: String,
    pub ip_address: String,
}

impl TreeqVolume {
    /// Volume context map returned to the orchestrator
    pub fn volume_context(&self) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        context.insert("ID".to_string(), self.filesystem_id.to_string());
        context.insert("TREEQID".to_string(), self.treeq_id.to_string());
        context.insert("treeqName".to_string(), self.name.clone());
        context.insert("treeqpath".to_string(), self.path.clone());
        context.insert("volumePath".to_string(), self.export_path.clone());
        context.insert("ipAddress".to_string(), self.ip_address.clone());
        context
    }
}

// =============================================================================
// Backend Gateway Port
// =============================================================================

/// Capability surface of the storage array management API
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Check pool and network spaces, returning the normalized network space list
    async fn validate_network_spaces(&self, pool_name: &str, network_spaces: &str)
        -> Result<String>;

    /// Number of filesystems currently on the array
    async fn filesystem_count(&self) -> Result<u64>;

    /// Resolve a pool name to its id
    async fn pool_id_by_name(&self, pool_name: &str) -> Result<ObjectId>;

    async fn create_filesystem(&self, spec: &FilesystemSpec) -> Result<FilesystemRecord>;

    async fn delete_filesystem(&self, filesystem_id: ObjectId) -> Result<()>;

    async fn resize_filesystem(&self, filesystem_id: ObjectId, size_bytes: u64) -> Result<()>;

    async fn create_export(&self, spec: &ExportSpec) -> Result<ExportRecord>;

    async fn delete_export(&self, export_id: ObjectId) -> Result<()>;

    async fn exports_by_filesystem(&self, filesystem_id: ObjectId) -> Result<Vec<ExportRecord>>;

    /// First usable IP address of a network space
    async fn network_space_ip(&self, network_space: &str) -> Result<String>;

    async fn attach_metadata(
        &self,
        object_id: ObjectId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn detach_metadata(&self, object_id: ObjectId) -> Result<()>;

    /// Find an existing treeq by name under a pool and network space
    async fn find_treeq(
        &self,
        pool_name: &str,
        network_space: &str,
        name: &str,
    ) -> Result<Option<TreeqVolume>>;

    /// Create a treeq, selecting or creating its shared filesystem
    async fn create_treeq(&self, spec: &TreeqSpec) -> Result<TreeqVolume>;

    async fn delete_treeq(&self, filesystem_id: ObjectId, treeq_id: ObjectId) -> Result<()>;

    /// Resize a treeq, validated against its filesystem ceiling
    async fn resize_treeq(
        &self,
        filesystem_id: ObjectId,
        treeq_id: ObjectId,
        size_bytes: u64,
        max_filesystem_size: u64,
    ) -> Result<()>;

    /// Gateway name, for logs
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeControllerRef = Arc<dyn VolumeController>;
pub type BackendGatewayRef = Arc<dyn BackendGateway>;
