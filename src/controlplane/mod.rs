//! Control Plane Module
//!
//! Controller-side provisioning of NFS volumes on a storage array:
//! parameter handling, volume ID encoding, compensating rollback,
//! the two provisioning strategies and the routing/API layers on top.

pub mod api;
pub mod backends;
pub mod orchestrator;
pub mod params;
pub mod provisioners;
pub mod rollback;
pub mod volume_id;

pub use api::*;
pub use backends::*;
pub use orchestrator::*;
pub use params::{ProvisionerConfig, UnwindPolicy};
pub use provisioners::*;
pub use rollback::{Compensation, CompensationChain};
pub use volume_id::{ExclusiveVolumeId, TreeqVolumeId};
