//! Volume identifier codec
//!
//! The volume ID handed to the orchestrator is the only state that survives
//! between calls, so it has to carry every array identifier needed later.
//!
//! - Exclusive filesystem volumes: the filesystem id, e.g. `42`
//! - Treeq volumes: `filesystemID#treeqID#maxFilesystemSize`, e.g. `42#7#2147483648`
//!
//! IDs are always written with the ceiling in bytes. Older IDs carry the
//! storage-class capacity string instead (`42#7#4TiB`) and still decode.

use crate::controlplane::params::parse_capacity;
use crate::domain::ports::ObjectId;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Field delimiter of treeq volume IDs
pub const TREEQ_ID_DELIMITER: char = '#';

const TREEQ_ID_FIELDS: usize = 3;

/// ID of a volume backed by its own filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExclusiveVolumeId(pub ObjectId);

impl ExclusiveVolumeId {
    pub fn filesystem_id(&self) -> ObjectId {
        self.0
    }
}

impl fmt::Display for ExclusiveVolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExclusiveVolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<ObjectId>()
            .map(ExclusiveVolumeId)
            .map_err(|e| Error::MalformedVolumeId {
                volume_id: s.to_string(),
                reason: format!("filesystem id: {}", e),
            })
    }
}

/// ID of a volume backed by a treeq inside a shared filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeqVolumeId {
    pub filesystem_id: ObjectId,
    pub treeq_id: ObjectId,
    /// Ceiling of the parent filesystem; the array cannot report it back
    pub max_filesystem_size: u64,
}

impl fmt::Display for TreeqVolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}",
            self.filesystem_id,
            self.treeq_id,
            self.max_filesystem_size,
            d = TREEQ_ID_DELIMITER
        )
    }
}

impl FromStr for TreeqVolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(TREEQ_ID_DELIMITER).collect();
        if fields.len() != TREEQ_ID_FIELDS {
            return Err(Error::MalformedVolumeId {
                volume_id: s.to_string(),
                reason: format!(
                    "expected {} fields separated by '{}', found {}",
                    TREEQ_ID_FIELDS,
                    TREEQ_ID_DELIMITER,
                    fields.len()
                ),
            });
        }

        let field = |index: usize, name: &str| -> Result<u64> {
            fields[index].parse::<u64>().map_err(|e| Error::MalformedVolumeId {
                volume_id: s.to_string(),
                reason: format!("{}: {}", name, e),
            })
        };

        let max_filesystem_size =
            parse_capacity(fields[2]).map_err(|e| Error::MalformedVolumeId {
                volume_id: s.to_string(),
                reason: format!("max filesystem size: {}", e),
            })?;

        Ok(TreeqVolumeId {
            filesystem_id: field(0, "filesystem id")?,
            treeq_id: field(1, "treeq id")?,
            max_filesystem_size,
        })
    }
}
