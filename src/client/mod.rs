//! Management API Adapters
//!
//! Provides implementations of the management API port:
//! - REST: HTTPS client for a live appliance
//! - Memory: in-process appliance for tests and simulation

pub mod memory;
pub mod rest;

pub use memory::{InMemoryAppliance, SeedFile, SeedObject};
pub use rest::RestClient;

use crate::config::ConnectionConfig;
use crate::domain::ManagementApiRef;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Factory for management API adapters
pub struct ApiFactory;

impl ApiFactory {
    /// Connect to a live appliance
    pub fn connect(config: &ConnectionConfig) -> Result<ManagementApiRef> {
        info!("Using management API at {}", config.base_url());
        Ok(Arc::new(RestClient::new(config)?))
    }

    /// Simulated appliance seeded from a YAML file
    pub fn simulate(seed: impl AsRef<Path>) -> Result<ManagementApiRef> {
        info!("Simulating appliance from {}", seed.as_ref().display());
        Ok(Arc::new(InMemoryAppliance::from_seed(SeedFile::load(seed)?)))
    }
}
