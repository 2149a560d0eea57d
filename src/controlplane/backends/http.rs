//! Storage Array REST Gateway
//!
//! Talks to the array's JSON management API under `/api/rest`. Every
//! response is wrapped in a `{result, error, metadata}` envelope; errors
//! whose code ends in `NOT_FOUND` (or HTTP 404) become
//! [`Error::ResourceNotFound`] so callers can treat them as already gone.

use crate::controlplane::params::UnwindPolicy;
use crate::controlplane::rollback::{Compensation, CompensationChain};
use crate::domain::ports::{
    BackendGateway, ExportPermission, ExportRecord, ExportSpec, FilesystemRecord, FilesystemSpec,
    ObjectId, TreeqSpec, TreeqVolume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Name prefix of filesystems that host treeqs
const TREEQ_FILESYSTEM_PREFIX: &str = "csit_";

/// Metadata key recording the network space of a treeq filesystem
const TREEQ_NETWORK_SPACE_KEY: &str = "host.csi.treeq_network_space";

const DEFAULT_MAX_TREEQS_PER_FILESYSTEM: u64 = 4000;
const DEFAULT_MAX_TREEQ_FILESYSTEMS: u64 = 100;
const PAGE_SIZE: u32 = 1000;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the REST gateway
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Management endpoint, e.g. `https://array.example.com`
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://storage-array".to_string(),
            username: None,
            password: None,
            request_timeout_secs: 60,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<ApiError>,
    metadata: Option<PageMetadata>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct PageMetadata {
    number_of_objects: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: ObjectId,
}

#[derive(Debug, Deserialize)]
struct FilesystemDto {
    id: ObjectId,
    name: String,
    pool_id: ObjectId,
    size: u64,
    #[serde(default)]
    ssd_enabled: bool,
    #[serde(default)]
    provtype: String,
}

impl From<FilesystemDto> for FilesystemRecord {
    fn from(dto: FilesystemDto) -> Self {
        FilesystemRecord {
            id: dto.id,
            name: dto.name,
            pool_id: dto.pool_id,
            size_bytes: dto.size,
            ssd_enabled: dto.ssd_enabled,
            provtype: dto.provtype,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PermissionDto {
    access: String,
    client: String,
    no_root_squash: bool,
}

#[derive(Debug, Deserialize)]
struct ExportDto {
    id: ObjectId,
    filesystem_id: ObjectId,
    export_path: String,
    #[serde(default)]
    permissions: Vec<PermissionDto>,
}

impl From<ExportDto> for ExportRecord {
    fn from(dto: ExportDto) -> Self {
        ExportRecord {
            id: dto.id,
            filesystem_id: dto.filesystem_id,
            export_path: dto.export_path,
            permissions: dto
                .permissions
                .into_iter()
                .map(|p| ExportPermission {
                    access: p.access,
                    client: p.client,
                    no_root_squash: p.no_root_squash,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NetworkSpaceDto {
    name: String,
    #[serde(default)]
    ips: Vec<IpDto>,
}

#[derive(Debug, Deserialize)]
struct IpDto {
    ip_address: String,
    #[serde(default = "enabled_default")]
    enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct TreeqDto {
    id: ObjectId,
    name: String,
    path: String,
    #[serde(default)]
    hard_capacity: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MetadataDto {
    key: String,
    value: String,
}

// =============================================================================
// HTTP Gateway
// =============================================================================

/// Gateway to a storage array over its REST management API
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: Client,
}

impl HttpGateway {
    /// Create a new REST gateway
    pub fn new(config: HttpGatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/rest/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Issue a request and unwrap the response envelope
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope<T>> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        // 204 and friends carry no envelope at all
        if status.is_success() && text.trim().is_empty() {
            return Ok(Envelope {
                result: None,
                error: None,
                metadata: None,
            });
        }

        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if status == StatusCode::NOT_FOUND => {
                return Err(Error::ResourceNotFound {
                    kind: "object".into(),
                    name: path.to_string(),
                })
            }
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(Error::ArrayApi {
                    status: status.as_u16(),
                    code: "HTTP".into(),
                    message: text,
                })
            }
        };

        if let Some(error) = &envelope.error {
            if status == StatusCode::NOT_FOUND || error.code.ends_with("NOT_FOUND") {
                return Err(Error::ResourceNotFound {
                    kind: error.code.trim_end_matches("_NOT_FOUND").to_lowercase(),
                    name: error.message.clone(),
                });
            }
            return Err(Error::ArrayApi {
                status: status.as_u16(),
                code: error.code.clone(),
                message: error.message.clone(),
            });
        }
        if !status.is_success() {
            return Err(Error::ArrayApi {
                status: status.as_u16(),
                code: "HTTP".into(),
                message: text,
            });
        }

        Ok(envelope)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        required(path, self.call(Method::GET, path, None).await?)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        required(path, self.call(Method::POST, path, Some(body)).await?)
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.call::<serde_json::Value>(Method::PUT, path, Some(body))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call::<serde_json::Value>(Method::DELETE, path, None)
            .await
            .map(|_| ())
    }

    async fn network_space(&self, name: &str) -> Result<NetworkSpaceDto> {
        let spaces: Vec<NetworkSpaceDto> = self
            .get(&format!("network_spaces?name={}", urlencoding::encode(name)))
            .await?;
        spaces.into_iter().next().ok_or_else(|| Error::ResourceNotFound {
            kind: "network_space".into(),
            name: name.to_string(),
        })
    }

    async fn metadata_of(&self, object_id: ObjectId) -> Result<BTreeMap<String, String>> {
        let entries: Vec<MetadataDto> = self.get(&format!("metadata/{}", object_id)).await?;
        Ok(entries.into_iter().map(|m| (m.key, m.value)).collect())
    }

    /// Treeq filesystems of a pool serving a network space
    async fn treeq_filesystems(
        &self,
        pool_name: &str,
        network_space: &str,
    ) -> Result<Vec<FilesystemDto>> {
        let pool_id = self.pool_id_by_name(pool_name).await?;
        let filesystems: Vec<FilesystemDto> = self
            .get(&format!(
                "filesystems?pool_id={}&name=like:{}&page_size={}",
                pool_id, TREEQ_FILESYSTEM_PREFIX, PAGE_SIZE
            ))
            .await?;

        let mut matching = Vec::new();
        for fs in filesystems {
            let metadata = self.metadata_of(fs.id).await?;
            if metadata.get(TREEQ_NETWORK_SPACE_KEY).map(String::as_str) == Some(network_space) {
                matching.push(fs);
            }
        }
        Ok(matching)
    }

    async fn treeqs_of(&self, filesystem_id: ObjectId) -> Result<Vec<TreeqDto>> {
        self.get(&format!(
            "filesystems/{}/treeqs?page_size={}",
            filesystem_id, PAGE_SIZE
        ))
        .await
    }

    async fn treeq_volume(
        &self,
        filesystem_id: ObjectId,
        treeq: TreeqDto,
        network_space: &str,
    ) -> Result<TreeqVolume> {
        let export_path = self
            .exports_by_filesystem(filesystem_id)
            .await?
            .into_iter()
            .next()
            .map(|e| e.export_path)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "export".into(),
                name: format!("filesystem {}", filesystem_id),
            })?;

        Ok(TreeqVolume {
            filesystem_id,
            treeq_id: treeq.id,
            name: treeq.name,
            size_bytes: treeq.hard_capacity.unwrap_or_default(),
            path: treeq.path,
            export_path,
            ip_address: self.network_space_ip(network_space).await?,
        })
    }

    /// Create and export a new shared filesystem for treeqs
    async fn create_treeq_filesystem(&self, spec: &TreeqSpec) -> Result<SharedFilesystem> {
        let name = format!(
            "{}{}",
            TREEQ_FILESYSTEM_PREFIX,
            chrono::Utc::now().format("%Y%m%d%H%M%S%f")
        );
        let mut chain = CompensationChain::new(self, UnwindPolicy::Full);

        let pool_id = chain
            .step("resolve_pool", self.pool_id_by_name(&spec.pool_name))
            .await?;
        let fs = chain
            .step(
                "create_filesystem",
                self.create_filesystem(&FilesystemSpec {
                    pool_id,
                    name: name.clone(),
                    size_bytes: spec.max_filesystem_size,
                    ssd_enabled: spec.ssd_enabled,
                    provtype: spec.provtype.clone(),
                }),
            )
            .await?;
        chain.on_failure(Compensation::DeleteFilesystem(fs.id));

        let export = chain
            .step(
                "create_export",
                self.create_export(&ExportSpec {
                    filesystem_id: fs.id,
                    export_path: format!("/{}", name),
                    transport_protocols: "TCP".into(),
                    privileged_port: true,
                    permissions: spec.permissions.clone(),
                }),
            )
            .await?;
        chain.on_failure(Compensation::DeleteExport(export.id));

        let mut metadata = BTreeMap::new();
        metadata.insert(TREEQ_NETWORK_SPACE_KEY.to_string(), spec.network_space.clone());
        chain
            .step("attach_metadata", self.attach_metadata(fs.id, &metadata))
            .await?;
        chain.commit();

        info!("Created shared filesystem {} ({}) for treeqs", fs.id, name);
        Ok(SharedFilesystem {
            filesystem_id: fs.id,
            export_id: export.id,
        })
    }
}

/// Array objects backing a freshly created shared filesystem
struct SharedFilesystem {
    filesystem_id: ObjectId,
    export_id: ObjectId,
}

fn required<T>(path: &str, envelope: Envelope<T>) -> Result<T> {
    envelope.result.ok_or_else(|| Error::BackendOperationFailed {
        operation: path.to_string(),
        reason: "response carried no result".into(),
    })
}

fn permissions_json(permissions: &[ExportPermission]) -> Vec<PermissionDto> {
    permissions
        .iter()
        .map(|p| PermissionDto {
            access: p.access.clone(),
            client: p.client.clone(),
            no_root_squash: p.no_root_squash,
        })
        .collect()
}

#[async_trait]
impl BackendGateway for HttpGateway {
    async fn validate_network_spaces(
        &self,
        pool_name: &str,
        network_spaces: &str,
    ) -> Result<String> {
        self.pool_id_by_name(pool_name).await?;

        let mut valid = Vec::new();
        for name in network_spaces.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            valid.push(self.network_space(name).await?.name);
        }
        if valid.is_empty() {
            return Err(Error::InvalidArgument("no network space given".into()));
        }
        Ok(valid.join(","))
    }

    async fn filesystem_count(&self) -> Result<u64> {
        let envelope: Envelope<Vec<serde_json::Value>> = self
            .call(Method::GET, "filesystems?page_size=1", None)
            .await?;
        envelope
            .metadata
            .and_then(|m| m.number_of_objects)
            .ok_or_else(|| Error::BackendOperationFailed {
                operation: "filesystem_count".into(),
                reason: "response carried no object count".into(),
            })
    }

    async fn pool_id_by_name(&self, pool_name: &str) -> Result<ObjectId> {
        let pools: Vec<IdOnly> = self
            .get(&format!("pools?name={}", urlencoding::encode(pool_name)))
            .await?;
        pools
            .first()
            .map(|p| p.id)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "pool".into(),
                name: pool_name.to_string(),
            })
    }

    async fn create_filesystem(&self, spec: &FilesystemSpec) -> Result<FilesystemRecord> {
        let fs: FilesystemDto = self
            .post(
                "filesystems",
                json!({
                    "pool_id": spec.pool_id,
                    "name": spec.name,
                    "size": spec.size_bytes,
                    "ssd_enabled": spec.ssd_enabled,
                    "provtype": spec.provtype,
                }),
            )
            .await?;
        Ok(fs.into())
    }

    async fn delete_filesystem(&self, filesystem_id: ObjectId) -> Result<()> {
        self.delete(&format!("filesystems/{}?approved=true", filesystem_id))
            .await
    }

    async fn resize_filesystem(&self, filesystem_id: ObjectId, size_bytes: u64) -> Result<()> {
        self.put(
            &format!("filesystems/{}?approved=true", filesystem_id),
            json!({ "size": size_bytes }),
        )
        .await
    }

    async fn create_export(&self, spec: &ExportSpec) -> Result<ExportRecord> {
        let export: ExportDto = self
            .post(
                "exports",
                json!({
                    "filesystem_id": spec.filesystem_id,
                    "export_path": spec.export_path,
                    "transport_protocols": spec.transport_protocols,
                    "privileged_port": spec.privileged_port,
                    "permissions": permissions_json(&spec.permissions),
                }),
            )
            .await?;
        Ok(export.into())
    }

    async fn delete_export(&self, export_id: ObjectId) -> Result<()> {
        self.delete(&format!("exports/{}?approved=true", export_id))
            .await
    }

    async fn exports_by_filesystem(&self, filesystem_id: ObjectId) -> Result<Vec<ExportRecord>> {
        let exports: Vec<ExportDto> = self
            .get(&format!("exports?filesystem_id={}", filesystem_id))
            .await?;
        Ok(exports.into_iter().map(Into::into).collect())
    }

    async fn network_space_ip(&self, network_space: &str) -> Result<String> {
        let space = self.network_space(network_space).await?;
        space
            .ips
            .into_iter()
            .find(|ip| ip.enabled)
            .map(|ip| ip.ip_address)
            .ok_or_else(|| Error::BackendOperationFailed {
                operation: "network_space_ip".into(),
                reason: format!("network space {} has no enabled IP address", network_space),
            })
    }

    async fn attach_metadata(
        &self,
        object_id: ObjectId,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.put(&format!("metadata/{}", object_id), json!(metadata))
            .await
    }

    async fn detach_metadata(&self, object_id: ObjectId) -> Result<()> {
        self.delete(&format!("metadata/{}?approved=true", object_id))
            .await
    }

    async fn find_treeq(
        &self,
        pool_name: &str,
        network_space: &str,
        name: &str,
    ) -> Result<Option<TreeqVolume>> {
        for fs in self.treeq_filesystems(pool_name, network_space).await? {
            let treeqs: Vec<TreeqDto> = self
                .get(&format!(
                    "filesystems/{}/treeqs?name={}",
                    fs.id,
                    urlencoding::encode(name)
                ))
                .await?;
            if let Some(treeq) = treeqs.into_iter().next() {
                return self
                    .treeq_volume(fs.id, treeq, network_space)
                    .await
                    .map(Some);
            }
        }
        Ok(None)
    }

    async fn create_treeq(&self, spec: &TreeqSpec) -> Result<TreeqVolume> {
        let max_treeqs = spec
            .max_treeqs_per_filesystem
            .unwrap_or(DEFAULT_MAX_TREEQS_PER_FILESYSTEM);
        let candidates = self
            .treeq_filesystems(&spec.pool_name, &spec.network_space)
            .await?;

        let mut selected = None;
        for fs in &candidates {
            let treeqs = self.treeqs_of(fs.id).await?;
            let used: u64 = treeqs.iter().filter_map(|t| t.hard_capacity).sum();
            if (treeqs.len() as u64) < max_treeqs
                && used + spec.size_bytes <= spec.max_filesystem_size
            {
                selected = Some(fs.id);
                break;
            }
        }

        // Only a filesystem created for this treeq is undone if the treeq fails
        let mut chain = CompensationChain::new(self, UnwindPolicy::Full);
        let filesystem_id = match selected {
            Some(id) => id,
            None => {
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
                let shared = self.create_treeq_filesystem(spec).await?;
                chain.on_failure(Compensation::DeleteFilesystem(shared.filesystem_id));
                chain.on_failure(Compensation::DetachMetadata(shared.filesystem_id));
                chain.on_failure(Compensation::DeleteExport(shared.export_id));
                shared.filesystem_id
            }
        };

        let treeq: TreeqDto = chain
            .step(
                "create_treeq",
                self.post(
                    &format!("filesystems/{}/treeqs", filesystem_id),
                    json!({
                        "name": spec.name,
                        "path": format!("/{}", spec.name),
                        "hard_capacity": spec.size_bytes,
                    }),
                ),
            )
            .await?;
        chain.commit();
        info!(
            "Created treeq {} ({}) in filesystem {}",
            treeq.id, spec.name, filesystem_id
        );

        self.treeq_volume(filesystem_id, treeq, &spec.network_space)
            .await
    }

    async fn delete_treeq(&self, filesystem_id: ObjectId, treeq_id: ObjectId) -> Result<()> {
        self.delete(&format!(
            "filesystems/{}/treeqs/{}?approved=true",
            filesystem_id, treeq_id
        ))
        .await?;

        // The last treeq takes its shared filesystem with it
        if self.treeqs_of(filesystem_id).await?.is_empty() {
            for export in self.exports_by_filesystem(filesystem_id).await? {
                self.delete_export(export.id).await?;
            }
            self.detach_metadata(filesystem_id).await?;
            self.delete_filesystem(filesystem_id).await?;
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
        let others: u64 = self
            .treeqs_of(filesystem_id)
            .await?
            .iter()
            .filter(|t| t.id != treeq_id)
            .filter_map(|t| t.hard_capacity)
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

        self.put(
            &format!("filesystems/{}/treeqs/{}", filesystem_id, treeq_id),
            json!({ "hard_capacity": size_bytes }),
        )
        .await
    }

    fn backend_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::params::GIB;
    use crate::controlplane::provisioners::ExclusiveFilesystemProvisioner;
    use crate::controlplane::ProvisionerConfig;
    use crate::domain::ports::{DeleteVolumeRequest, VolumeController};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_url_joins_api_prefix() {
        let gateway = HttpGateway::new(HttpGatewayConfig {
            endpoint: "https://array.example.com/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            gateway.url("/filesystems/7"),
            "https://array.example.com/api/rest/filesystems/7"
        );
    }

    #[test]
    fn test_envelope_parsing() {
        let envelope: Envelope<Vec<FilesystemDto>> = serde_json::from_str(
            r#"{"result":[{"id":5,"name":"pvc-1","pool_id":2,"size":1073741824,"ssd_enabled":true,"provtype":"THIN"}],
                "error":null,"metadata":{"number_of_objects":1}}"#,
        )
        .unwrap();
        let fs: FilesystemRecord = envelope.result.unwrap().remove(0).into();
        assert_eq!(fs.id, 5);
        assert!(fs.ssd_enabled);
        assert_eq!(envelope.metadata.unwrap().number_of_objects, Some(1));
    }

    #[test]
    fn test_error_envelope_parsing() {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"result":null,"error":{"code":"FILESYSTEM_NOT_FOUND","message":"no such filesystem"},"metadata":null}"#,
        )
        .unwrap();
        let error = envelope.error.unwrap();
        assert_eq!(error.code, "FILESYSTEM_NOT_FOUND");
        assert_eq!(error.message, "no such filesystem");
    }

    #[test]
    fn test_export_dto_conversion() {
        let dto: ExportDto = serde_json::from_value(json!({
            "id": 9,
            "filesystem_id": 5,
            "export_path": "/fs/pvc-1",
            "permissions": [{"access": "RW", "client": "*", "no_root_squash": true}]
        }))
        .unwrap();
        let export: ExportRecord = dto.into();
        assert_eq!(export.permissions.len(), 1);
        assert_eq!(export.permissions[0].client, "*");
    }

    /// Storage array REST API served by an in-process axum router
    mod mock_array {
        use axum::extract::{Path, Query, State};
        use axum::http::StatusCode;
        use axum::response::{IntoResponse, Response};
        use axum::routing::{delete, get};
        use axum::{Json, Router};
        use parking_lot::Mutex;
        use serde_json::{json, Value};
        use std::collections::{BTreeMap, HashMap};
        use std::sync::Arc;

        pub type Shared = Arc<Mutex<ArrayState>>;
        type Params = Query<HashMap<String, String>>;

        pub struct ArrayState {
            pub next_id: u64,
            pub pools: BTreeMap<String, u64>,
            pub network_spaces: BTreeMap<String, String>,
            pub filesystems: BTreeMap<u64, Value>,
            pub exports: BTreeMap<u64, Value>,
            pub metadata: BTreeMap<u64, BTreeMap<String, String>>,
            pub treeqs: BTreeMap<u64, (u64, Value)>,
            pub fail_treeq_create: bool,
        }

        impl Default for ArrayState {
            fn default() -> Self {
                let mut pools = BTreeMap::new();
                pools.insert("p1".to_string(), 1);
                let mut network_spaces = BTreeMap::new();
                network_spaces.insert("ns1".to_string(), "10.0.0.5".to_string());
                Self {
                    next_id: 100,
                    pools,
                    network_spaces,
                    filesystems: BTreeMap::new(),
                    exports: BTreeMap::new(),
                    metadata: BTreeMap::new(),
                    treeqs: BTreeMap::new(),
                    fail_treeq_create: false,
                }
            }
        }

        impl ArrayState {
            fn allocate_id(&mut self) -> u64 {
                self.next_id += 1;
                self.next_id
            }

            pub fn add_filesystem(&mut self, id: u64, name: &str) {
                self.filesystems.insert(
                    id,
                    json!({ "id": id, "name": name, "pool_id": 1, "size": 1u64 << 30 }),
                );
            }

            pub fn add_export(&mut self, id: u64, filesystem_id: u64, path: &str) {
                self.exports.insert(
                    id,
                    json!({ "id": id, "filesystem_id": filesystem_id, "export_path": path }),
                );
            }
        }

        fn ok(result: Value) -> Response {
            Json(json!({ "result": result, "error": null, "metadata": null })).into_response()
        }

        fn page(mut items: Vec<Value>, params: &HashMap<String, String>) -> Response {
            let total = items.len();
            if let Some(size) = params.get("page_size").and_then(|s| s.parse().ok()) {
                items.truncate(size);
            }
            Json(json!({
                "result": items,
                "error": null,
                "metadata": { "number_of_objects": total },
            }))
            .into_response()
        }

        fn error(status: StatusCode, code: &str, message: String) -> Response {
            (
                status,
                Json(json!({
                    "result": null,
                    "error": { "code": code, "message": message },
                    "metadata": null,
                })),
            )
                .into_response()
        }

        fn filesystem_not_found(id: u64) -> Response {
            error(
                StatusCode::NOT_FOUND,
                "FILESYSTEM_NOT_FOUND",
                format!("filesystem {} not found", id),
            )
        }

        async fn list_pools(State(array): State<Shared>, Query(params): Params) -> Response {
            let array = array.lock();
            let pools = params
                .get("name")
                .and_then(|name| array.pools.get(name))
                .map(|id| vec![json!({ "id": id })])
                .unwrap_or_default();
            ok(json!(pools))
        }

        async fn list_network_spaces(
            State(array): State<Shared>,
            Query(params): Params,
        ) -> Response {
            let array = array.lock();
            let spaces = params
                .get("name")
                .and_then(|name| array.network_spaces.get_key_value(name))
                .map(|(name, ip)| {
                    vec![json!({ "name": name, "ips": [{ "ip_address": ip, "enabled": true }] })]
                })
                .unwrap_or_default();
            ok(json!(spaces))
        }

        async fn list_filesystems(State(array): State<Shared>, Query(params): Params) -> Response {
            let array = array.lock();
            let pool_id: Option<u64> = params.get("pool_id").and_then(|p| p.parse().ok());
            let like = params.get("name").and_then(|n| n.strip_prefix("like:"));
            let items = array
                .filesystems
                .values()
                .filter(|fs| pool_id.map_or(true, |p| fs["pool_id"] == p))
                .filter(|fs| {
                    like.map_or(true, |l| fs["name"].as_str().unwrap_or("").contains(l))
                })
                .cloned()
                .collect();
            page(items, &params)
        }

        async fn create_filesystem(State(array): State<Shared>, Json(body): Json<Value>) -> Response {
            let mut array = array.lock();
            let id = array.allocate_id();
            let mut fs = body;
            fs["id"] = json!(id);
            array.filesystems.insert(id, fs.clone());
            ok(fs)
        }

        async fn delete_filesystem(State(array): State<Shared>, Path(id): Path<u64>) -> Response {
            let mut array = array.lock();
            if array.exports.values().any(|e| e["filesystem_id"] == id) {
                return error(
                    StatusCode::CONFLICT,
                    "FILESYSTEM_HAS_EXPORTS",
                    format!("filesystem {} is exported", id),
                );
            }
            match array.filesystems.remove(&id) {
                Some(_) => ok(Value::Null),
                None => filesystem_not_found(id),
            }
        }

        async fn list_exports(State(array): State<Shared>, Query(params): Params) -> Response {
            let array = array.lock();
            let filesystem_id: Option<u64> =
                params.get("filesystem_id").and_then(|p| p.parse().ok());
            let items = array
                .exports
                .values()
                .filter(|e| filesystem_id.map_or(true, |id| e["filesystem_id"] == id))
                .cloned()
                .collect();
            page(items, &params)
        }

        async fn create_export(State(array): State<Shared>, Json(body): Json<Value>) -> Response {
            let mut array = array.lock();
            let id = array.allocate_id();
            let mut export = body;
            export["id"] = json!(id);
            array.exports.insert(id, export.clone());
            ok(export)
        }

        async fn delete_export(State(array): State<Shared>, Path(id): Path<u64>) -> Response {
            match array.lock().exports.remove(&id) {
                Some(_) => StatusCode::NO_CONTENT.into_response(),
                None => error(
                    StatusCode::NOT_FOUND,
                    "EXPORT_NOT_FOUND",
                    format!("export {} not found", id),
                ),
            }
        }

        async fn get_metadata(State(array): State<Shared>, Path(id): Path<u64>) -> Response {
            let array = array.lock();
            let entries: Vec<Value> = array
                .metadata
                .get(&id)
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| json!({ "key": k, "value": v }))
                        .collect()
                })
                .unwrap_or_default();
            ok(json!(entries))
        }

        async fn put_metadata(
            State(array): State<Shared>,
            Path(id): Path<u64>,
            Json(body): Json<BTreeMap<String, String>>,
        ) -> Response {
            let mut array = array.lock();
            if !array.filesystems.contains_key(&id) {
                return filesystem_not_found(id);
            }
            array.metadata.entry(id).or_default().extend(body);
            ok(Value::Null)
        }

        async fn delete_metadata(State(array): State<Shared>, Path(id): Path<u64>) -> Response {
            let mut array = array.lock();
            if !array.filesystems.contains_key(&id) {
                return filesystem_not_found(id);
            }
            array.metadata.remove(&id);
            ok(Value::Null)
        }

        async fn list_treeqs(
            State(array): State<Shared>,
            Path(filesystem_id): Path<u64>,
            Query(params): Params,
        ) -> Response {
            let array = array.lock();
            if !array.filesystems.contains_key(&filesystem_id) {
                return filesystem_not_found(filesystem_id);
            }
            let items = array
                .treeqs
                .values()
                .filter(|(fs, _)| *fs == filesystem_id)
                .map(|(_, treeq)| treeq)
                .filter(|t| params.get("name").map_or(true, |n| t["name"] == n.as_str()))
                .cloned()
                .collect();
            page(items, &params)
        }

        async fn create_treeq(
            State(array): State<Shared>,
            Path(filesystem_id): Path<u64>,
            Json(body): Json<Value>,
        ) -> Response {
            let mut array = array.lock();
            if array.fail_treeq_create {
                return error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TREEQ_CREATE_FAILED",
                    "quota service unavailable".to_string(),
                );
            }
            if !array.filesystems.contains_key(&filesystem_id) {
                return filesystem_not_found(filesystem_id);
            }
            let id = array.allocate_id();
            let mut treeq = body;
            treeq["id"] = json!(id);
            array.treeqs.insert(id, (filesystem_id, treeq.clone()));
            ok(treeq)
        }

        async fn delete_treeq(
            State(array): State<Shared>,
            Path((filesystem_id, treeq_id)): Path<(u64, u64)>,
        ) -> Response {
            let mut array = array.lock();
            let owned = array
                .treeqs
                .get(&treeq_id)
                .map_or(false, |(fs, _)| *fs == filesystem_id);
            if !owned {
                return error(
                    StatusCode::NOT_FOUND,
                    "TREEQ_NOT_FOUND",
                    format!("treeq {} not found", treeq_id),
                );
            }
            array.treeqs.remove(&treeq_id);
            ok(Value::Null)
        }

        async fn update_treeq(
            State(array): State<Shared>,
            Path((filesystem_id, treeq_id)): Path<(u64, u64)>,
            Json(body): Json<Value>,
        ) -> Response {
            let mut array = array.lock();
            match array.treeqs.get_mut(&treeq_id) {
                Some((fs, treeq)) if *fs == filesystem_id => {
                    treeq["hard_capacity"] = body["hard_capacity"].clone();
                    ok(treeq.clone())
                }
                _ => error(
                    StatusCode::NOT_FOUND,
                    "TREEQ_NOT_FOUND",
                    format!("treeq {} not found", treeq_id),
                ),
            }
        }

        fn router(array: Shared) -> Router {
            Router::new()
                .route("/api/rest/pools", get(list_pools))
                .route("/api/rest/network_spaces", get(list_network_spaces))
                .route(
                    "/api/rest/filesystems",
                    get(list_filesystems).post(create_filesystem),
                )
                .route("/api/rest/filesystems/:id", delete(delete_filesystem))
                .route(
                    "/api/rest/filesystems/:id/treeqs",
                    get(list_treeqs).post(create_treeq),
                )
                .route(
                    "/api/rest/filesystems/:id/treeqs/:treeq_id",
                    delete(delete_treeq).put(update_treeq),
                )
                .route("/api/rest/exports", get(list_exports).post(create_export))
                .route("/api/rest/exports/:id", delete(delete_export))
                .route(
                    "/api/rest/metadata/:id",
                    get(get_metadata).put(put_metadata).delete(delete_metadata),
                )
                .with_state(array)
        }

        /// Serve the array on an ephemeral port and return its endpoint
        pub async fn start(state: ArrayState) -> (String, Shared) {
            let array = Arc::new(Mutex::new(state));
            let app = router(array.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{}", addr), array)
        }
    }

    async fn array_gateway(state: mock_array::ArrayState) -> (HttpGateway, mock_array::Shared) {
        let (endpoint, array) = mock_array::start(state).await;
        let gateway = HttpGateway::new(HttpGatewayConfig {
            endpoint,
            ..Default::default()
        })
        .unwrap();
        (gateway, array)
    }

    fn shared_treeq_spec(name: &str) -> TreeqSpec {
        TreeqSpec {
            name: name.into(),
            pool_name: "p1".into(),
            network_space: "ns1".into(),
            size_bytes: GIB,
            max_filesystem_size: 4 * GIB,
            max_treeqs_per_filesystem: Some(2),
            max_filesystems: Some(1),
            ssd_enabled: false,
            provtype: "THIN".into(),
            permissions: vec![ExportPermission {
                access: "RW".into(),
                client: "*".into(),
                no_root_squash: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_not_found_codes_map_to_resource_not_found() {
        let (gateway, _array) = array_gateway(Default::default()).await;

        assert_matches!(
            gateway.delete_filesystem(42).await,
            Err(Error::ResourceNotFound { ref kind, .. }) if kind == "filesystem"
        );
        assert_matches!(
            gateway.detach_metadata(42).await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            gateway.pool_id_by_name("p9").await,
            Err(Error::ResourceNotFound { ref kind, .. }) if kind == "pool"
        );

        // Plain 404 without an envelope
        assert_matches!(
            gateway
                .call::<serde_json::Value>(Method::GET, "no/such/route", None)
                .await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_exclusive_delete_of_absent_filesystem_succeeds() {
        let (gateway, _array) = array_gateway(Default::default()).await;
        let provisioner =
            ExclusiveFilesystemProvisioner::new(Arc::new(gateway), ProvisionerConfig::default());

        provisioner
            .delete_volume(DeleteVolumeRequest {
                volume_id: "42".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_count_reads_object_count() {
        let mut state = mock_array::ArrayState::default();
        for id in 1..=3 {
            state.add_filesystem(id, &format!("pvc-{}", id));
        }
        let (gateway, _array) = array_gateway(state).await;

        assert_eq!(gateway.filesystem_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_success_body_is_accepted() {
        let mut state = mock_array::ArrayState::default();
        state.add_filesystem(4, "pvc-4");
        state.add_export(5, 4, "/k8s/pvc-4");
        let (gateway, array) = array_gateway(state).await;

        // The array answers 204 No Content
        gateway.delete_export(5).await.unwrap();
        assert!(array.lock().exports.is_empty());
    }

    #[tokio::test]
    async fn test_treeqs_share_filesystem_up_to_ceilings() {
        let (gateway, array) = array_gateway(Default::default()).await;

        let a = gateway.create_treeq(&shared_treeq_spec("a")).await.unwrap();
        let b = gateway.create_treeq(&shared_treeq_spec("b")).await.unwrap();
        assert_eq!(a.filesystem_id, b.filesystem_id);
        assert_ne!(a.treeq_id, b.treeq_id);
        assert_eq!(a.ip_address, "10.0.0.5");
        assert!(a.export_path.starts_with("/csit_"));
        assert_eq!(
            array.lock().metadata[&a.filesystem_id][TREEQ_NETWORK_SPACE_KEY],
            "ns1"
        );

        let found = gateway.find_treeq("p1", "ns1", "b").await.unwrap();
        assert_eq!(found.map(|t| t.treeq_id), Some(b.treeq_id));

        // Two treeqs per filesystem and a single filesystem allowed
        assert_matches!(
            gateway.create_treeq(&shared_treeq_spec("c")).await,
            Err(Error::BackendOperationFailed { ref reason, .. }) if reason.contains("are full")
        );
        assert_eq!(array.lock().filesystems.len(), 1);
    }

    #[tokio::test]
    async fn test_last_treeq_removes_shared_filesystem() {
        let (gateway, array) = array_gateway(Default::default()).await;
        let a = gateway.create_treeq(&shared_treeq_spec("a")).await.unwrap();
        let b = gateway.create_treeq(&shared_treeq_spec("b")).await.unwrap();

        gateway.delete_treeq(a.filesystem_id, a.treeq_id).await.unwrap();
        assert!(array.lock().filesystems.contains_key(&a.filesystem_id));

        gateway.delete_treeq(b.filesystem_id, b.treeq_id).await.unwrap();
        let array = array.lock();
        assert!(array.filesystems.is_empty());
        assert!(array.exports.is_empty());
        assert!(array.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_failed_treeq_removes_new_shared_filesystem() {
        let state = mock_array::ArrayState {
            fail_treeq_create: true,
            ..Default::default()
        };
        let (gateway, array) = array_gateway(state).await;

        assert_matches!(
            gateway.create_treeq(&shared_treeq_spec("a")).await,
            Err(Error::ArrayApi { ref code, .. }) if code == "TREEQ_CREATE_FAILED"
        );
        let array = array.lock();
        assert!(array.filesystems.is_empty());
        assert!(array.exports.is_empty());
        assert!(array.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_resize_treeq_respects_ceiling() {
        let (gateway, array) = array_gateway(Default::default()).await;
        let a = gateway.create_treeq(&shared_treeq_spec("a")).await.unwrap();
        gateway.create_treeq(&shared_treeq_spec("b")).await.unwrap();

        gateway
            .resize_treeq(a.filesystem_id, a.treeq_id, 3 * GIB, 4 * GIB)
            .await
            .unwrap();
        assert_eq!(array.lock().treeqs[&a.treeq_id].1["hard_capacity"], 3 * GIB);

        assert_matches!(
            gateway
                .resize_treeq(a.filesystem_id, a.treeq_id, 3 * GIB + 1, 4 * GIB)
                .await,
            Err(Error::BackendOperationFailed { .. })
        );
    }
}
