//! # Dependencies: declarative queries against the external stores.
//!
//! A [`Dependency`] is a tagged variant over the three query kinds — the
//! builder's per-variant logic is distinct and not extensible at runtime, so
//! a closed enum with explicit matches is used instead of open polymorphism.
//!
//! Each variant exposes a stable, content-derived identity string, unique per
//! distinct logical query. Identities key the data snapshot and the two
//! lookup tables linking back from a dependency to its originating spec.

mod catalog;
mod kv;
mod vault;

pub use catalog::{CatalogService, ServiceCatalogQuery};
pub use kv::{KvListQuery, KvPair};
pub use vault::{Secret, VaultReadQuery};

/// A declarative query against a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Ordered key/value pairs under a KV path.
    KvList(KvListQuery),
    /// A single secret object.
    VaultRead(VaultReadQuery),
    /// Catalog entries of a named service.
    CatalogService(ServiceCatalogQuery),
}

impl Dependency {
    /// The stable identity string for this query.
    pub fn identity(&self) -> &str {
        match self {
            Dependency::KvList(q) => q.identity(),
            Dependency::VaultRead(q) => q.identity(),
            Dependency::CatalogService(q) => q.identity(),
        }
    }

    /// Short kind tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Dependency::KvList(_) => "kv.list",
            Dependency::VaultRead(_) => "vault.read",
            Dependency::CatalogService(_) => "catalog.service",
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identity())
    }
}

/// The decoded result of one dependency poll.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyData {
    KvPairs(Vec<KvPair>),
    Secret(Secret),
    Services(Vec<CatalogService>),
}

impl DependencyData {
    /// Short shape tag for decode-mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            DependencyData::KvPairs(_) => "kv pairs",
            DependencyData::Secret(_) => "secret",
            DependencyData::Services(_) => "services",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_distinct_across_kinds() {
        let kv = Dependency::KvList(KvListQuery::new("app").unwrap());
        let secret = Dependency::VaultRead(VaultReadQuery::new("app").unwrap());
        let svc = Dependency::CatalogService(ServiceCatalogQuery::new("app").unwrap());
        assert_ne!(kv.identity(), secret.identity());
        assert_ne!(kv.identity(), svc.identity());
        assert_ne!(secret.identity(), svc.identity());
    }
}
