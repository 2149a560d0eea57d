//! NFS Volume Provisioner - Controller Plane
//!
//! Provisions NFS-backed volumes on a storage array for a container
//! orchestrator. Two strategies are served side by side:
//!
//! - **nfs**: every volume gets its own filesystem and export
//! - **nfs_treeq**: volumes are quota-bounded directories (treeqs) inside
//!   shared filesystems
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                REST API (axum) / health / metrics            │
//! ├──────────────────────────────────────────────────────────────┤
//! │          Orchestrator (routes by protocol / ID shape)        │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │  ExclusiveFilesystem (nfs)    │     Treeq (nfs_treeq)        │
//! │  CompensationChain rollback   │     find-or-create treeq     │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │            BackendGateway (memory | array REST API)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: provisioners, rollback, ID codec, orchestrator and API
//! - [`domain`]: core domain types and traits
//! - [`error`]: error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BackendConfig, BackendFactory, Compensation, CompensationChain,
    ExclusiveFilesystemProvisioner, ExclusiveVolumeId, Orchestrator, OrchestratorConfig,
    OrchestratorStatus, ProvisionerConfig, ProvisionerFactory, RestRouter, TreeqProvisioner,
    TreeqVolumeId, UnwindPolicy,
};

pub use domain::ports::{
    BackendGateway, CapacityRange, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse, StorageProtocol, Volume,
    VolumeController,
};

pub use error::{Code, Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
