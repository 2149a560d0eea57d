//! Storage class parameters and provisioner thresholds
//!
//! Validation of the storage class parameter map, capacity normalization
//! and the configuration injected into each provisioner.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

// =============================================================================
// Parameter Keys
// =============================================================================

pub const POOL_NAME: &str = "pool_name";
pub const NFS_NETWORKSPACE: &str = "nfs_networkspace";
pub const NETWORK_SPACE: &str = "network_space";
pub const NFS_EXPORT_PERMISSIONS: &str = "nfs_export_permissions";
pub const NO_ROOT_SQUASH: &str = "no_root_squash";
pub const SSD_ENABLED: &str = "ssd_enabled";
pub const PROVISION_TYPE: &str = "provision_type";
pub const VOL_PREFIX: &str = "vol_prefix";
pub const MAX_FILESYSTEM_SIZE: &str = "max_filesystem_size";
pub const MAX_TREEQS_PER_FILESYSTEM: &str = "max_treeqs_per_filesystem";
pub const MAX_FILESYSTEMS: &str = "max_filesystems";
pub const STORAGE_PROTOCOL: &str = "storage_protocol";

/// Required keys for exclusive filesystem volumes
pub const NFS_REQUIRED: &[&str] = &[POOL_NAME, NFS_NETWORKSPACE];

/// Required keys for treeq volumes
pub const TREEQ_REQUIRED: &[&str] = &[
    POOL_NAME,
    NETWORK_SPACE,
    NFS_EXPORT_PERMISSIONS,
    MAX_FILESYSTEM_SIZE,
];

pub const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Provisioner Configuration
// =============================================================================

/// How far a failed create walks back through completed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindPolicy {
    /// Undo only the most recently created resource
    #[default]
    ImmediatePredecessor,
    /// Undo every created resource, newest first
    Full,
}

/// Thresholds and defaults shared by the provisioners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Smallest capacity ever sent to the array
    pub capacity_floor_bytes: u64,
    /// Filesystem count at which new filesystems are refused
    pub max_filesystems: u64,
    /// Export access level when the storage class sets none
    pub default_export_permissions: String,
    /// Root squash policy when the storage class sets none
    pub default_no_root_squash: bool,
    /// Provisioning type when the storage class sets none
    pub default_provtype: String,
    /// Mount point prefix of exclusive exports
    pub export_root: String,
    pub unwind_policy: UnwindPolicy,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            capacity_floor_bytes: GIB,
            max_filesystems: 4000,
            default_export_permissions: "RW".to_string(),
            default_no_root_squash: true,
            default_provtype: "THIN".to_string(),
            export_root: "/fs".to_string(),
            unwind_policy: UnwindPolicy::ImmediatePredecessor,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds the provisioners cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.capacity_floor_bytes == 0 {
            return Err(Error::Configuration(
                "capacity_floor_bytes must be greater than zero".into(),
            ));
        }
        if self.max_filesystems == 0 {
            return Err(Error::Configuration(
                "max_filesystems must be greater than zero".into(),
            ));
        }
        if !self.export_root.starts_with('/') {
            return Err(Error::Configuration(format!(
                "export_root must be absolute: {}",
                self.export_root
            )));
        }
        Ok(())
    }

    /// Raise a requested capacity to the floor
    pub fn normalize_capacity(&self, requested_bytes: u64) -> u64 {
        if requested_bytes < self.capacity_floor_bytes {
            warn!(
                "Requested capacity {} bytes is below the minimum, using {} bytes",
                requested_bytes, self.capacity_floor_bytes
            );
            self.capacity_floor_bytes
        } else {
            requested_bytes
        }
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

/// Fail with every required key that is absent or empty
pub fn validate_required(
    protocol: &str,
    params: &BTreeMap<String, String>,
    required: &[&str],
) -> Result<()> {
    let missing: Vec<String> = required
        .iter()
        .filter(|key| params.get(**key).map_or(true, |v| v.trim().is_empty()))
        .map(|key| key.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingParameters {
            protocol: protocol.to_string(),
            missing,
        })
    }
}

/// Non-empty parameter value, trimmed
pub fn param<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Boolean parameter; absent or unparseable values use the default
pub fn bool_param(params: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match param(params, key) {
        Some(value) => value.parse::<bool>().unwrap_or_else(|_| {
            warn!("Ignoring non-boolean value {:?} for {}", value, key);
            default
        }),
        None => default,
    }
}

/// Optional count parameter
pub fn count_param(params: &BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    param(params, key)
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                Error::InvalidArgument(format!("{} must be a whole number, got {:?}", key, value))
            })
        })
        .transpose()
}

/// Apply the storage class volume prefix to an orchestrator-chosen name
///
/// `pvc-1234` with prefix `csi-` becomes `csi-1234`. Names already carrying
/// the prefix, or without a dash, are kept.
pub fn volume_name_with_prefix(name: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if !name.starts_with(prefix) => match name.split('-').nth(1) {
            Some(suffix) => format!("{}{}", prefix, suffix),
            None => name.to_string(),
        },
        _ => name.to_string(),
    }
}

/// Parse capacity string (e.g., "100Gi", "1TiB", "2147483648") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => GIB,
        "T" | "TB" | "TI" | "TIB" => GIB * 1024,
        "P" | "PB" | "PI" | "PIB" => GIB * 1024 * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    if let Ok(whole) = num_str.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| Error::CapacityParse(format!("capacity too large: {}", s)));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    Ok((num * multiplier as f64) as u64)
}
