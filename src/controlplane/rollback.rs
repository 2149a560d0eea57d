//! Compensation chain for multi-step volume creation
//!
//! Each step runs through [`CompensationChain::step`]. Resources created by a
//! completed step register their undo action with
//! [`CompensationChain::on_failure`]. When a later step fails (or panics),
//! registered undo actions run according to the [`UnwindPolicy`] and the
//! original error is returned. Undo failures are logged and collected but
//! never replace the original error; anything left behind must be
//! reconciled outside the provisioner.

use crate::controlplane::params::UnwindPolicy;
use crate::domain::ports::{BackendGateway, ObjectId};
use crate::error::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Undo action for a resource created on the array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    DeleteFilesystem(ObjectId),
    DeleteExport(ObjectId),
    DetachMetadata(ObjectId),
}

impl Compensation {
    async fn apply(&self, gateway: &dyn BackendGateway) -> Result<()> {
        match *self {
            Compensation::DeleteFilesystem(id) => gateway.delete_filesystem(id).await,
            Compensation::DeleteExport(id) => gateway.delete_export(id).await,
            Compensation::DetachMetadata(id) => gateway.detach_metadata(id).await,
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteFilesystem(id) => write!(f, "delete filesystem {}", id),
            Compensation::DeleteExport(id) => write!(f, "delete export {}", id),
            Compensation::DetachMetadata(id) => write!(f, "detach metadata of {}", id),
        }
    }
}

/// Ordered record of completed steps and how to undo them
pub struct CompensationChain<'g> {
    gateway: &'g dyn BackendGateway,
    policy: UnwindPolicy,
    pending: Vec<Compensation>,
    failures: Vec<(Compensation, Error)>,
}

impl<'g> CompensationChain<'g> {
    pub fn new(gateway: &'g dyn BackendGateway, policy: UnwindPolicy) -> Self {
        Self {
            gateway,
            policy,
            pending: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Run one step; on failure unwind and return the step's error
    ///
    /// A panic inside the step is converted into a backend failure for
    /// that step so the unwind still happens.
    pub async fn step<T, F>(&mut self, name: &str, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        debug!("Running step {}", name);

        let result = match AssertUnwindSafe(action).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::BackendOperationFailed {
                operation: name.to_string(),
                reason: format!("internal fault: {}", panic_message(panic.as_ref())),
            }),
        };

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                error!("Step {} failed: {}", name, err);
                self.unwind().await;
                Err(err)
            }
        }
    }

    /// Register the undo action for the resource a completed step created
    pub fn on_failure(&mut self, compensation: Compensation) {
        self.pending.push(compensation);
    }

    /// Run pending undo actions according to the policy
    pub async fn unwind(&mut self) {
        let to_run: Vec<Compensation> = match self.policy {
            UnwindPolicy::ImmediatePredecessor => self.pending.pop().into_iter().collect(),
            UnwindPolicy::Full => self.pending.drain(..).rev().collect(),
        };

        for compensation in to_run {
            info!("Reverting: {}", compensation);
            if let Err(err) = compensation.apply(self.gateway).await {
                warn!(
                    "Failed to {}: {}; resource must be cleaned up manually",
                    compensation, err
                );
                self.failures.push((compensation, err));
            }
        }
    }

    /// Undo actions that were attempted and failed
    pub fn failures(&self) -> &[(Compensation, Error)] {
        &self.failures
    }

    /// Finish successfully; registered undo actions are dropped
    pub fn commit(self) {
        debug!("Committed after {} undoable steps", self.pending.len());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{GatewayOp, MemoryGateway};
    use assert_matches::assert_matches;

    fn failing() -> Error {
        Error::BackendOperationFailed {
            operation: "test".into(),
            reason: "boom".into(),
        }
    }

    #[tokio::test]
    async fn test_immediate_predecessor_undoes_last_only() {
        let gateway = MemoryGateway::new();
        let mut chain = CompensationChain::new(&gateway, UnwindPolicy::ImmediatePredecessor);

        chain.on_failure(Compensation::DeleteFilesystem(1));
        chain.on_failure(Compensation::DeleteExport(2));

        let result: Result<()> = chain.step("fail", async { Err(failing()) }).await;
        assert_matches!(result, Err(Error::BackendOperationFailed { ref reason, .. }) if reason == "boom");

        assert_eq!(gateway.calls(GatewayOp::DeleteExport), 1);
        assert_eq!(gateway.calls(GatewayOp::DeleteFilesystem), 0);
    }

    #[tokio::test]
    async fn test_full_policy_undoes_newest_first() {
        let gateway = MemoryGateway::new();
        let mut chain = CompensationChain::new(&gateway, UnwindPolicy::Full);

        chain.on_failure(Compensation::DeleteFilesystem(1));
        chain.on_failure(Compensation::DeleteExport(2));

        let result: Result<()> = chain.step("fail", async { Err(failing()) }).await;
        assert!(result.is_err());

        assert_eq!(gateway.calls(GatewayOp::DeleteExport), 1);
        assert_eq!(gateway.calls(GatewayOp::DeleteFilesystem), 1);
        assert_eq!(
            gateway.call_log(),
            vec![GatewayOp::DeleteExport, GatewayOp::DeleteFilesystem]
        );
    }

    #[tokio::test]
    async fn test_undo_failure_keeps_original_error() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::DeleteFilesystem);
        let mut chain = CompensationChain::new(&gateway, UnwindPolicy::ImmediatePredecessor);
        chain.on_failure(Compensation::DeleteFilesystem(9));

        let result: Result<()> = chain
            .step("create_export", async {
                Err(Error::InvalidArgument("original".into()))
            })
            .await;

        assert_matches!(result, Err(Error::InvalidArgument(ref m)) if m == "original");
        assert_eq!(chain.failures().len(), 1);
        assert_eq!(chain.failures()[0].0, Compensation::DeleteFilesystem(9));
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_backend_failure() {
        let gateway = MemoryGateway::new();
        let mut chain = CompensationChain::new(&gateway, UnwindPolicy::ImmediatePredecessor);
        chain.on_failure(Compensation::DeleteFilesystem(3));

        let result: Result<u64> = chain
            .step("attach_metadata", async {
                if true {
                    panic!("metadata exploded");
                }
                Ok(0u64)
            })
            .await;

        assert_matches!(result, Err(Error::BackendOperationFailed { ref operation, ref reason })
            if operation == "attach_metadata" && reason.contains("metadata exploded"));
        assert_eq!(gateway.calls(GatewayOp::DeleteFilesystem), 1);
    }

    #[tokio::test]
    async fn test_successful_steps_run_no_undo() {
        let gateway = MemoryGateway::new();
        let mut chain = CompensationChain::new(&gateway, UnwindPolicy::Full);

        let id = chain.step("first", async { Ok(5u64) }).await.unwrap();
        chain.on_failure(Compensation::DeleteFilesystem(id));
        chain.step("second", async { Ok(()) }).await.unwrap();
        chain.commit();

        assert!(gateway.call_log().is_empty());
    }
}
