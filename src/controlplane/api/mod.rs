//! API Module
//!
//! Provides the REST transport for the controller operations.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
