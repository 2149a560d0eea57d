//! Volume Provisioners
//!
//! Provides the two NFS provisioning strategies:
//! - Nfs: one filesystem and export per volume
//! - NfsTreeq: quota directories inside shared filesystems

pub mod nfs;
pub mod treeq;

pub use nfs::*;
pub use treeq::*;

use crate::controlplane::params::ProvisionerConfig;
use crate::domain::ports::{BackendGatewayRef, StorageProtocol, VolumeControllerRef};
use std::sync::Arc;

/// Factory for creating provisioners
pub struct ProvisionerFactory;

impl ProvisionerFactory {
    /// Create the provisioner for a protocol
    pub fn create(
        protocol: StorageProtocol,
        gateway: BackendGatewayRef,
        config: ProvisionerConfig,
    ) -> VolumeControllerRef {
        match protocol {
            StorageProtocol::Nfs => Arc::new(ExclusiveFilesystemProvisioner::new(gateway, config)),
            StorageProtocol::NfsTreeq => Arc::new(TreeqProvisioner::new(gateway, config)),
        }
    }
}
