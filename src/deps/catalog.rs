//! Service catalog query: all registered instances of a named service.

use crate::error::ConfigError;

/// Declarative query for the catalog entries of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCatalogQuery {
    name: String,
    id: String,
}

impl ServiceCatalogQuery {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::MissingField {
                stanza: "service",
                field: "query",
            });
        }
        let id = format!("catalog.service({name})");
        Ok(Self { name, id })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identity keying the snapshot and the service-config table.
    pub fn identity(&self) -> &str {
        &self.id
    }
}

/// One decoded catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogService {
    pub service_id: String,
    pub service_name: String,
    pub service_address: String,
    pub service_tags: Vec<String>,
    pub service_port: u16,
}
