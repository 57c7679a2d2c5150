//! Filestore Backends
//!
//! Provides implementations of the [`FilestoreService`] port:
//! - FilestoreClient: REST client for the cloud API
//! - FakeFilestore: in-memory backend for tests and standalone mode

pub mod fake;
pub mod filestore;

pub use fake::*;
pub use filestore::*;

use crate::config::FilestoreConfig;
use crate::domain::ports::FilestoreServiceRef;
use crate::error::Result;
use std::sync::Arc;

/// Factory for the Filestore backend
pub struct BackendFactory;

impl BackendFactory {
    /// In-memory backend when `standalone`, otherwise the REST client
    pub fn create(config: &FilestoreConfig, standalone: bool) -> Result<FilestoreServiceRef> {
        if standalone {
            return Ok(Arc::new(FakeFilestore::new()));
        }
        Ok(Arc::new(FilestoreClient::new(config)?))
    }
}
