//! Lookup table from source kind to endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Endpoint, PackageIdentifier, SourceKind};
use crate::error::EndpointError;

/// Registry of the endpoints available to a run.
#[derive(Default, Clone)]
pub struct EndpointRegistry {
    endpoints: HashMap<SourceKind, Arc<dyn Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under its own kind, replacing any previous one.
    pub fn register(&mut self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.kind(), endpoint);
    }

    pub fn with(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.register(endpoint);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Arc<dyn Endpoint>> {
        self.endpoints.get(&kind)
    }

    pub fn has(&self, kind: SourceKind) -> bool {
        self.endpoints.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoint responsible for `id`.
    pub fn resolve(&self, id: &PackageIdentifier) -> Result<&Arc<dyn Endpoint>, EndpointError> {
        self.endpoints.get(&id.kind).ok_or_else(|| {
            EndpointError::NotFound(format!("no endpoint registered for {} sources", id.kind))
        })
    }
}
