//! Storage Array Gateways
//!
//! Provides implementations of the backend gateway port:
//! - Memory: in-process simulated array (standalone mode, tests)
//! - Http: the array's REST management API

pub mod http;
pub mod memory;

pub use http::*;
pub use memory::*;

use crate::domain::ports::BackendGateway;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating backend gateways
pub struct BackendFactory;

impl BackendFactory {
    /// Create a gateway by name
    pub fn create(name: &str, config: BackendConfig) -> Result<Arc<dyn BackendGateway>> {
        match name.to_lowercase().as_str() {
            "memory" | "standalone" => Ok(Arc::new(MemoryGateway::with_config(config.memory))),
            "http" | "rest" => Ok(Arc::new(HttpGateway::new(config.http)?)),
            _ => Err(Error::Configuration(format!("unknown backend: {}", name))),
        }
    }
}

/// Combined gateway configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub memory: MemoryGatewayConfig,
    pub http: HttpGatewayConfig,
}
