//! In-Memory Storage Array
//!
//! Simulates the storage array management API in process. Used in
//! standalone mode and by the test suite, which relies on its call log and
//! fault injection to exercise partial-failure paths.

use crate::domain::ports::{
    BackendGateway, ExportRecord, ExportSpec, FilesystemRecord, FilesystemSpec, ObjectId,
    TreeqSpec, TreeqVolume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Treeqs per shared filesystem when the storage class sets no limit
const DEFAULT_MAX_TREEQS_PER_FILESYSTEM: u64 = 4000;

/// Shared filesystems per pool when the storage class sets no limit
const DEFAULT_MAX_TREEQ_FILESYSTEMS: u64 = 100;

// =============================================================================
// Configuration
// =============================================================================

/// Initial inventory of the simulated array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGatewayConfig {
    /// Storage pool names
    pub pools: Vec<String>,
    /// Network space name to its IP addresses
    pub network_spaces: BTreeMap<String, Vec<String>>,
}

impl Default for MemoryGatewayConfig {
    fn default() -> Self {
        let mut network_spaces = BTreeMap::new();
        network_spaces.insert("nas1".to_string(), vec!["127.0.0.1".to_string()]);
        Self {
            pools: vec!["pool1".to_string()],
            network_spaces,
        }
    }
}

// =============================================================================
// Call Tracking
// =============================================================================

/// Gateway operations, for call accounting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GatewayOp {
    ValidateNetworkSpaces,
    FilesystemCount,
    PoolIdByName,
    CreateFilesystem,
    DeleteFilesystem,
    ResizeFilesystem,
    CreateExport,
    DeleteExport,
    ExportsByFilesystem,
    NetworkSpaceIp,
    AttachMetadata,
    DetachMetadata,
    FindTreeq,
    CreateTreeq,
    DeleteTreeq,
    ResizeTreeq,
}

/// Arguments of one `resize_treeq` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeqResize {
    pub filesystem_id: ObjectId,
    pub treeq_id: ObjectId,
    pub size_bytes: u64,
    pub max_filesystem_size: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail: BTreeSet<GatewayOp>,
    panic: BTreeSet<GatewayOp>,
}

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone)]
struct FilesystemState {
    record: FilesystemRecord,
    /// Set for filesystems that host treeqs
    treeq_host: Option<TreeqHost>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
struct TreeqHost {
    pool_name: String,
    network_space: String,
    export_path: String,
}

#[derive(Debug, Clone)]
struct TreeqState {
    filesystem_id: ObjectId,
    name: String,
    path: String,
    size_bytes: u64,
}

#[derive(Debug, Default)]
struct ArrayState {
    next_id: ObjectId,
    pools: BTreeMap<String, ObjectId>,
    network_spaces: BTreeMap<String, Vec<String>>,
    filesystems: BTreeMap<ObjectId, FilesystemState>,
    exports: BTreeMap<ObjectId, ExportRecord>,
    metadata: BTreeMap<ObjectId, BTreeMap<String, String>>,
    treeqs: BTreeMap<ObjectId, TreeqState>,
    /// Filesystems owned by other tenants of the array
    foreign_filesystems: u64,
}

impl ArrayState {
    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        self.next_id
    }

    fn filesystem(&self, id: ObjectId) -> Result<&FilesystemState> {
        self.filesystems.get(&id).ok_or_else(|| not_found("filesystem", id))
    }

    fn first_ip(&self, network_space: &str) -> Result<String> {
        let ips = self
            .network_spaces
            .get(network_space)
            .ok_or_else(|| not_found("network_space", network_space))?;
        ips.first().cloned().ok_or_else(|| Error::BackendOperationFailed {
            operation: "network_space_ip".into(),
            reason: format!("network space {} has no IP addresses", network_space),
        })
    }

    fn treeq_volume(&self, treeq_id: ObjectId, treeq: &TreeqState) -> Result<TreeqVolume> {
        let fs = self.filesystem(treeq.filesystem_id)?;
        let host = fs.treeq_host.as_ref().ok_or_else(|| Error::Internal(format!(
            "filesystem {} does not host treeqs",
            treeq.filesystem_id
        )))?;
        Ok(TreeqVolume {
            filesystem_id: treeq.filesystem_id,
            treeq_id,
            name: treeq.name.clone(),
            size_bytes: treeq.size_bytes,
            path: treeq.path.clone(),
            export_path: host.export_path.clone(),
            ip_address: self.first_ip(&host.network_space)?,
        })
    }

    fn treeqs_in(&self, filesystem_id: ObjectId) -> impl Iterator<Item = &TreeqState> {
        self.treeqs
            .values()
            .filter(move |t| t.filesystem_id == filesystem_id)
    }

    /// Pick a shared filesystem with room for the treeq, creating one if needed
    fn select_treeq_filesystem(&mut self, spec: &TreeqSpec) -> Result<ObjectId> {
        let max_treeqs = spec
            .max_treeqs_per_filesystem
            .unwrap_or(DEFAULT_MAX_TREEQS_PER_FILESYSTEM);

        let candidates: Vec<ObjectId> = self
            .filesystems
            .values()
            .filter(|fs| {
                fs.treeq_host.as_ref().map_or(false, |h| {
                    h.pool_name == spec.pool_name && h.network_space == spec.network_space
                })
            })
            .map(|fs| fs.record.id)
            .collect();

        for fs_id in &candidates {
            let count = self.treeqs_in(*fs_id).count() as u64;
            let used: u64 = self.treeqs_in(*fs_id).map(|t| t.size_bytes).sum();
            if count < max_treeqs && used + spec.size_bytes <= spec.max_filesystem_size {
                return Ok(*fs_id);
            }
        }

        let max_filesystems = spec.max_filesystems.unwrap_or(DEFAULT_MAX_TREEQ_FILESYSTEMS);
        if candidates.len() as u64 >= max_filesystems {
            return Err(Error::BackendOperationFailed {
                operation: "create_treeq".into(),
                reason: format!(
                    "all {} shared filesystems in pool {} are full",
                    candidates.len(),
                    spec.pool_name
                ),
            });
        }
        if spec.size_bytes > spec.max_filesystem_size {
            return Err(Error::BackendOperationFailed {
                operation: "create_treeq".into(),
                reason: format!(
                    "treeq size {} exceeds max filesystem size {}",
                    spec.size_bytes, spec.max_filesystem_size
                ),
            });
        }

        let pool_id = *self
            .pools
            .get(&spec.pool_name)
            .ok_or_else(|| not_found("pool", &spec.pool_name))?;
        let fs_id = self.allocate_id();
        let name = format!("csit_{}", fs_id);
        let export_path = format!("/{}", name);

        let export_id = self.allocate_id();
        self.exports.insert(
            export_id,
            ExportRecord {
                id: export_id,
                filesystem_id: fs_id,
                export_path: export_path.clone(),
                permissions: spec.permissions.clone(),
            },
        );
        self.filesystems.insert(
            fs_id,
            FilesystemState {
                record: FilesystemRecord {
                    id: fs_id,
                    name,
                    pool_id,
                    size_bytes: spec.max_filesystem_size,
                    ssd_enabled: spec.ssd_enabled,
                    provtype: spec.provtype.clone(),
                },
                treeq_host: Some(TreeqHost {
                    pool_name: spec.pool_name.clone(),
                    network_space: spec.network_space.clone(),
                    export_path,
                }),
                created_at: chrono::Utc::now(),
            },
        );
        info!("Created shared filesystem {} for treeqs", fs_id);
        Ok(fs_id)
    }
}

fn not_found(kind: &str, name: impl ToString) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

// =============================================================================
// Memory Gateway
// =============================================================================

/// Storage array simulated in memory
pub struct MemoryGateway {
    state: RwLock<ArrayState>,
    faults: Mutex<Faults>,
    call_log: Mutex<Vec<GatewayOp>>,
    treeq_resizes: Mutex<Vec<TreeqResize>>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self {
            state: RwLock::new(ArrayState::default()),
            faults: Mutex::new(Faults::default()),
            call_log: Mutex::new(Vec::new()),
            treeq_resizes: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryGateway {
    /// Create an empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an array with the configured pools and network spaces
    pub fn with_config(config: MemoryGatewayConfig) -> Self {
        let mut gateway = Self::new();
        for pool in &config.pools {
            gateway = gateway.with_pool(pool);
        }
        for (name, ips) in &config.network_spaces {
            let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
            gateway = gateway.with_network_space(name, &ips);
        }
        gateway
    }

    pub fn with_pool(mut self, name: &str) -> Self {
        let state = self.state.get_mut();
        let id = state.allocate_id();
        state.pools.insert(name.to_string(), id);
        self
    }

    pub fn with_network_space(mut self, name: &str, ips: &[&str]) -> Self {
        self.state.get_mut().network_spaces.insert(
            name.to_string(),
            ips.iter().map(|ip| ip.to_string()).collect(),
        );
        self
    }

    /// Count filesystems that exist on the array outside this provisioner
    pub fn with_foreign_filesystems(mut self, count: u64) -> Self {
        self.state.get_mut().foreign_filesystems = count;
        self
    }

    /// Make every later call of `op` fail
    pub fn fail_on(&self, op: GatewayOp) {
        self.faults.lock().fail.insert(op);
    }

    /// Make every later call of `op` panic
    pub fn panic_on(&self, op: GatewayOp) {
        self.faults.lock().panic.insert(op);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.fail.clear();
        faults.panic.clear();
    }

    /// Number of calls made to `op`
    pub fn calls(&self, op: GatewayOp) -> usize {
        self.call_log.lock().iter().filter(|o| **o == op).count()
    }

    /// Every call made so far, in order
    pub fn call_log(&self) -> Vec<GatewayOp> {
        self.call_log.lock().clone()
    }

    /// Arguments of every `resize_treeq` call, including failed ones
    pub fn treeq_resizes(&self) -> Vec<TreeqResize> {
        self.treeq_resizes.lock().clone()
    }

    pub async fn treeq_size(&self, treeq_id: ObjectId) -> Option<u64> {
        self.state
            .read()
            .await
            .treeqs
            .get(&treeq_id)
            .map(|t| t.size_bytes)
    }

    pub async fn filesystem(&self, id: ObjectId) -> Option<FilesystemRecord> {
        self.state
            .read()
            .await
            .filesystems
            .get(&id)
            .map(|fs| fs.record.clone())
    }

    pub async fn filesystem_ids(&self) -> Vec<ObjectId> {
        self.state.read().await.filesystems.keys().copied().collect()
    }

    pub async fn export_count(&self) -> usize {
        self.state.read().await.exports.len()
    }

    pub async fn treeq_count(&self) -> usize {
        self.state.read().await.treeqs.len()
    }

    pub async fn metadata(&self, object_id: ObjectId) -> Option<BTreeMap<String, String>> {
        self.state.read().await.metadata.get(&object_id).cloned()
    }

    /// Record the call and apply injected faults
    fn enter(&self, op: GatewayOp) -> Result<()> {
        self.call_log.lock().push(op);
        let faults = self.faults.lock();
        if faults.panic.contains(&op) {
            drop(faults);
            panic!("injected panic in {:?}", op);
        }
        if faults.fail.contains(&op) {
            return Err(Error::BackendOperationFailed {
                operation: format!("{:?}", op),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BackendGateway for MemoryGateway {
    async fn validate_network_spaces(
        &self,
        pool_name: &str,
        network_spaces: &str,
    ) -> Result<String> {
        self.enter(GatewayOp::ValidateNetworkSpaces)?;
        let state = self.state.read().await;

        if !state.pools.contains_key(pool_name) {
            return Err(not_found("pool", pool_name));
        }

        let mut valid = Vec::new();
        for name in network_spaces.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !state.network_spaces.contains_key(name) {
                return Err(not_found("network_space", name));
            }
            valid.push(name);
        }
        if valid.is_empty() {
            return Err(Error::InvalidArgument("no network space given".into()));
        }
        Ok(valid.join(","))
    }

    async fn filesystem_count(&self) -> Result<u64> {
        self.enter(GatewayOp::FilesystemCount)?;
        let state = self.state.read().await;
        Ok(state.filesystems.len() as u64 + state.foreign_filesystems)
    }

    async fn pool_id_by_name(&self, pool_name: &str) -> Result<ObjectId> {
        self.enter(GatewayOp::PoolIdByName)?;
        self.state
            .read()
            .await
            .pools
            .get(pool_name)
            .copied()
            .ok_or_else(|| not_found("pool", pool_name))
    }

    async fn create_filesystem(&self, spec: &FilesystemSpec) -> Result<FilesystemRecord> {
        self.enter(GatewayOp::CreateFilesystem)?;
        let mut state = self.state.write().await;

        if !state.pools.values().any(|id| *id == spec.pool_id) {
            return Err(not_found("pool", spec.pool_id));
        }
        if state.filesystems.values().any(|fs| fs.record.name == spec.name) {
            return Err(Error::BackendOperationFailed {
                operation: "create_filesystem".into(),
                reason: format!("filesystem name {} already exists", spec.name),
            });
        }

        let id = state.allocate_id();
        let record = FilesystemRecord {
            id,
            name: spec.name.clone(),
            pool_id: spec.pool_id,
            size_bytes: spec.size_bytes,
            ssd_enabled: spec.ssd_enabled,
            provtype: spec.provtype.clone(),
        };
        state.filesystems.insert(
            id,
            FilesystemState {
                record: record.clone(),
                treeq_host: None,
                created_at: chrono::Utc::now(),
            },
        );
        debug!("Created filesystem {} ({})", id, spec.name);
        Ok(record)
    }

    async fn delete_filesystem(&self, filesystem_id: ObjectId) -> Result<()> {
        self.enter(GatewayOp::DeleteFilesystem)?;
        let mut state = self.state.write().await;

        state.filesystem(filesystem_id)?;
        if state.exports.values().any(|e| e.filesystem_id == filesystem_id) {
            return Err(Error::BackendOperationFailed {
                operation: "delete_filesystem".into(),
                reason: format!("filesystem {} still has exports", filesystem_id),
            });
        }
        if let Some(fs) = state.filesystems.remove(&filesystem_id) {
            debug!(
                "Deleted filesystem {} created at {}",
                filesystem_id, fs.created_at
            );
        }
        state.metadata.remove(&filesystem_id);
        Ok(())
    }

    async fn resize_filesystem(&self, filesystem_id: ObjectId, size_bytes: u64) -> Result<()> {
        self.enter(GatewayOp::ResizeFilesystem)?;
        let mut state = self.state.write().await;
        let fs = state
            .filesystems
            .get_mut(&filesystem_id)
            .ok_or_else(|| not_found("filesystem", filesystem_id))?;
        fs.record.size_bytes = size_bytes;
        Ok(())
    }

    async fn create_export(&self, spec: &ExportSpec) -> Result<ExportRecord> {
        self.enter(GatewayOp::CreateExport)?;
        let mut state = self.state.write().await;

        state.filesystem(spec.filesystem_id)?;
        if state.exports.values().any(|e| e.export_path == spec.export_path) {
            return Err(Error::BackendOperationFailed {
                operation: "create_export".into(),
                reason: format!("export path {} already exists", spec.export_path),
            });
        }

        let id = state.allocate_id();
        let record = ExportRecord {
            id,
            filesystem_id: spec.filesystem_id,
            export_path: spec.export_path.clone(),
            permissions: spec.permissions.clone(),
        };
        state.exports.insert(id, record.clone());
        Ok(record)
    }

    async fn delete_export(&self, export_id: ObjectId) -> Result<()> {
        self.enter(GatewayOp::DeleteExport)?;
        self.state
            .write()
            .await
            .exports
            .remove(&export_id)
            .map(|_| ())
            .ok_or_else(|| not_found("export", export_id))
    }

    async fn exports_by_filesystem(&self, filesystem_id: ObjectId) -> Result<Vec<ExportRecord>> {
        self.enter(GatewayOp::ExportsByFilesystem)?;
        let state = self.state.read().await;
        state.filesystem(filesystem_id)?;
        Ok(state
            .exports
            .values()
            .filter(|e| e.filesystem_id == filesystem_id)
            .cloned()
            .collect())
    }

    async fn network_space_ip(&self, network_space: &str) -> Result<String> {
        self.enter(GatewayOp::NetworkSpaceIp)?;
        self.state.read().await.first_ip(network_space)
    }

    async fn attach_metadata(
        &self,
        object_id: ObjectId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.enter(GatewayOp::AttachMetadata)?;
        let mut state = self.state.write().await;
        state.filesystem(object_id)?;
        state
            .metadata
            .entry(object_id)
            .or_default()
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn detach_metadata(&self, object_id: ObjectId) -> Result<()> {
        self.enter(GatewayOp::DetachMetadata)?;
        let mut state = self.state.write().await;
        state.filesystem(object_id)?;
        state.metadata.remove(&object_id);
        Ok(())
    }

    async fn find_treeq(
        &self,
        pool_name: &str,
        network_space: &str,
        name: &str,
    ) -> Result<Option<TreeqVolume>> {
        self.enter(GatewayOp::FindTreeq)?;
        let state = self.state.read().await;

        let found = state.treeqs.iter().find(|(_, treeq)| {
            treeq.name == name
                && state
                    .filesystems
                    .get(&treeq.filesystem_id)
                    .and_then(|fs| fs.treeq_host.as_ref())
                    .map_or(false, |h| {
                        h.pool_name == pool_name && h.network_space == network_space
                    })
        });

        found
            .map(|(id, treeq)| state.treeq_volume(*id, treeq))
            .transpose()
    }

    async fn create_treeq(&self, spec: &TreeqSpec) -> Result<TreeqVolume> {
        self.enter(GatewayOp::CreateTreeq)?;
        let mut state = self.state.write().await;

        if !state.network_spaces.contains_key(&spec.network_space) {
            return Err(not_found("network_space", &spec.network_space));
        }

        let filesystem_id = state.select_treeq_filesystem(spec)?;
        let treeq_id = state.allocate_id();
        let treeq = TreeqState {
            filesystem_id,
            name: spec.name.clone(),
            path: format!("/{}", spec.name),
            size_bytes: spec.size_bytes,
        };
        let volume = state.treeq_volume(treeq_id, &treeq)?;
        state.treeqs.insert(treeq_id, treeq);

        info!(
            "Created treeq {} ({}) in filesystem {}",
            treeq_id, spec.name, filesystem_id
        );
        Ok(volume)
    }

    async fn delete_treeq(&self, filesystem_id: ObjectId, treeq_id: ObjectId) -> Result<()> {
        self.enter(GatewayOp::DeleteTreeq)?;
        let mut state = self.state.write().await;

        state.filesystem(filesystem_id)?;
        match state.treeqs.get(&treeq_id) {
            Some(treeq) if treeq.filesystem_id == filesystem_id => {}
            _ => return Err(not_found("treeq", treeq_id)),
        }
        state.treeqs.remove(&treeq_id);

        // The last treeq takes its shared filesystem with it
        if state.treeqs_in(filesystem_id).next().is_none() {
            state.exports.retain(|_, e| e.filesystem_id != filesystem_id);
            state.metadata.remove(&filesystem_id);
            state.filesystems.remove(&filesystem_id);
            info!("Removed empty shared filesystem {}", filesystem_id);
        }
        Ok(())
    }

    async fn resize_treeq(
        &self,
        filesystem_id: ObjectId,
        treeq_id: ObjectId,
        size_bytes: u64,
        max_filesystem_size: u64,
    ) -> Result<()> {
        self.treeq_resizes.lock().push(TreeqResize {
            filesystem_id,
            treeq_id,
            size_bytes,
            max_filesystem_size,
        });
        self.enter(GatewayOp::ResizeTreeq)?;
        let mut state = self.state.write().await;

        state.filesystem(filesystem_id)?;
        match state.treeqs.get(&treeq_id) {
            Some(treeq) if treeq.filesystem_id == filesystem_id => {}
            _ => return Err(not_found("treeq", treeq_id)),
        }

        let others: u64 = state
            .treeqs
            .iter()
            .filter(|(id, t)| t.filesystem_id == filesystem_id && **id != treeq_id)
            .map(|(_, t)| t.size_bytes)
            .sum();
        if others + size_bytes > max_filesystem_size {
            return Err(Error::BackendOperationFailed {
                operation: "resize_treeq".into(),
                reason: format!(
                    "treeqs in filesystem {} would use {} bytes, above the {} byte ceiling",
                    filesystem_id,
                    others + size_bytes,
                    max_filesystem_size
                ),
            });
        }

        if let Some(treeq) = state.treeqs.get_mut(&treeq_id) {
            treeq.size_bytes = size_bytes;
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
