//! # Multi-Tenant Store Router
//!
//! Resolves a tenant identifier to one of several underlying message
//! stores. Three cardinalities: a single store for everyone, a fixed
//! configuration-time mapping, or a dynamic mapping refreshed at runtime
//! from a [`TenantSource`]. The mapping is explicit state owned by the
//! router, not an ambient global, and every subsystem that iterates "all
//! active stores" observes added or removed tenants on its next pass over
//! [`TenantStoreRouter::active_stores`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::TenancyConfig;
use crate::durability::loops::DurabilityDuty;
use crate::error::{CourierError, Result};
use crate::storage::MessageStore;

/// Supplies the current tenant mapping for dynamic-multiple deployments.
/// Typically backed by a control-plane table or service.
#[async_trait]
pub trait TenantSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, Arc<dyn MessageStore>>>;
}

/// Tenant-to-store resolution with a cached mapping.
pub struct TenantStoreRouter {
    config: TenancyConfig,
    default_store: Arc<dyn MessageStore>,
    stores: DashMap<String, Arc<dyn MessageStore>>,
    source: Option<Arc<dyn TenantSource>>,
}

impl TenantStoreRouter {
    /// One store for every tenant.
    pub fn single(config: TenancyConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config,
            default_store: store,
            stores: DashMap::new(),
            source: None,
        }
    }

    /// A fixed, configuration-time tenant mapping plus a default store.
    pub fn static_multiple(
        config: TenancyConfig,
        default_store: Arc<dyn MessageStore>,
        mappings: HashMap<String, Arc<dyn MessageStore>>,
    ) -> Self {
        let stores = DashMap::new();
        for (tenant, store) in mappings {
            stores.insert(tenant, store);
        }
        Self {
            config,
            default_store,
            stores,
            source: None,
        }
    }

    /// A runtime-refreshable mapping; call [`refresh`](Self::refresh) (or
    /// drive [`TenantRefresh`] as a background duty) to pick up changes.
    pub fn dynamic_multiple(
        config: TenancyConfig,
        default_store: Arc<dyn MessageStore>,
        source: Arc<dyn TenantSource>,
    ) -> Self {
        Self {
            config,
            default_store,
            stores: DashMap::new(),
            source: Some(source),
        }
    }

    /// Resolve a tenant to its store. Unknown tenants fall back to the
    /// default store unless `strict` is configured, in which case they are
    /// a configuration error.
    pub fn resolve(&self, tenant: &str) -> Result<Arc<dyn MessageStore>> {
        if tenant == self.config.default_tenant {
            return Ok(Arc::clone(&self.default_store));
        }
        if let Some(store) = self.stores.get(tenant) {
            return Ok(Arc::clone(store.value()));
        }
        if self.config.strict {
            return Err(CourierError::configuration(format!(
                "unknown tenant {tenant:?} and strict tenancy is enabled"
            )));
        }
        Ok(Arc::clone(&self.default_store))
    }

    pub fn add_tenant(&self, tenant: impl Into<String>, store: Arc<dyn MessageStore>) {
        let tenant = tenant.into();
        debug!(tenant = %tenant, "tenant mapping added");
        self.stores.insert(tenant, store);
    }

    pub fn remove_tenant(&self, tenant: &str) -> bool {
        let removed = self.stores.remove(tenant).is_some();
        if removed {
            debug!(tenant = %tenant, "tenant mapping removed");
        }
        removed
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.stores.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of every distinct active store, default included. The
    /// durability agent and queue listeners iterate this each cycle, so
    /// mapping changes take effect on their next pass.
    pub fn active_stores(&self) -> Vec<Arc<dyn MessageStore>> {
        let mut stores: Vec<Arc<dyn MessageStore>> = vec![Arc::clone(&self.default_store)];
        for entry in self.stores.iter() {
            let store = entry.value();
            if !stores.iter().any(|s| Arc::ptr_eq(s, store)) {
                stores.push(Arc::clone(store));
            }
        }
        stores
    }

    /// Re-read the mapping from the source, adding new tenants and
    /// dropping ones no longer present. A no-op for single/static routers.
    pub async fn refresh(&self) -> Result<u64> {
        let Some(source) = &self.source else {
            return Ok(0);
        };
        let latest = source.load().await?;
        let mut changes = 0;

        let stale: Vec<String> = self
            .stores
            .iter()
            .filter(|entry| !latest.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for tenant in stale {
            self.stores.remove(&tenant);
            changes += 1;
        }
        for (tenant, store) in latest {
            let replaced = match self.stores.get(&tenant) {
                Some(existing) => !Arc::ptr_eq(existing.value(), &store),
                None => true,
            };
            if replaced {
                self.stores.insert(tenant, store);
                changes += 1;
            }
        }

        if changes > 0 {
            info!(changes, "tenant mapping refreshed");
        }
        Ok(changes)
    }
}

/// Background duty that keeps a dynamic router's mapping fresh.
pub struct TenantRefresh {
    pub router: Arc<TenantStoreRouter>,
}

#[async_trait]
impl DurabilityDuty for TenantRefresh {
    fn name(&self) -> &'static str {
        "tenant_refresh"
    }

    async fn tick(&self) -> Result<u64> {
        self.router.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryMessageStore;
    use parking_lot::Mutex;

    fn store() -> Arc<dyn MessageStore> {
        Arc::new(InMemoryMessageStore::new())
    }

    #[test]
    fn single_router_serves_everyone_the_same_store() {
        let default = store();
        let router = TenantStoreRouter::single(TenancyConfig::default(), Arc::clone(&default));
        assert!(Arc::ptr_eq(&router.resolve("default").unwrap(), &default));
        assert!(Arc::ptr_eq(&router.resolve("anyone").unwrap(), &default));
        assert_eq!(router.active_stores().len(), 1);
    }

    #[test]
    fn static_router_maps_and_falls_back() {
        let default = store();
        let tenant_a = store();
        let mut mappings: HashMap<String, Arc<dyn MessageStore>> = HashMap::new();
        mappings.insert("a".to_string(), Arc::clone(&tenant_a));

        let router = TenantStoreRouter::static_multiple(
            TenancyConfig::default(),
            Arc::clone(&default),
            mappings,
        );
        assert!(Arc::ptr_eq(&router.resolve("a").unwrap(), &tenant_a));
        assert!(Arc::ptr_eq(&router.resolve("unknown").unwrap(), &default));
        assert_eq!(router.active_stores().len(), 2);
    }

    #[test]
    fn strict_router_rejects_unknown_tenants() {
        let router = TenantStoreRouter::single(
            TenancyConfig {
                strict: true,
                ..TenancyConfig::default()
            },
            store(),
        );
        assert!(router.resolve("default").is_ok());
        assert!(router.resolve("unknown").is_err());
    }

    #[test]
    fn runtime_add_and_remove_show_up_in_active_stores() {
        let router = TenantStoreRouter::single(TenancyConfig::default(), store());
        let tenant_b = store();
        router.add_tenant("b", Arc::clone(&tenant_b));
        assert_eq!(router.active_stores().len(), 2);
        assert!(Arc::ptr_eq(&router.resolve("b").unwrap(), &tenant_b));

        assert!(router.remove_tenant("b"));
        assert_eq!(router.active_stores().len(), 1);
        assert!(!router.remove_tenant("b"));
    }

    struct MapSource {
        mapping: Mutex<HashMap<String, Arc<dyn MessageStore>>>,
    }

    #[async_trait]
    impl TenantSource for MapSource {
        async fn load(&self) -> Result<HashMap<String, Arc<dyn MessageStore>>> {
            Ok(self.mapping.lock().clone())
        }
    }

    #[tokio::test]
    async fn dynamic_router_observes_source_changes_on_refresh() {
        let default = store();
        let tenant_a = store();
        let source = Arc::new(MapSource {
            mapping: Mutex::new(HashMap::new()),
        });
        let router = TenantStoreRouter::dynamic_multiple(
            TenancyConfig::default(),
            Arc::clone(&default),
            source.clone(),
        );

        assert!(Arc::ptr_eq(&router.resolve("a").unwrap(), &default));

        source
            .mapping
            .lock()
            .insert("a".to_string(), Arc::clone(&tenant_a));
        assert_eq!(router.refresh().await.unwrap(), 1);
        assert!(Arc::ptr_eq(&router.resolve("a").unwrap(), &tenant_a));

        source.mapping.lock().clear();
        assert_eq!(router.refresh().await.unwrap(), 1);
        assert!(Arc::ptr_eq(&router.resolve("a").unwrap(), &default));

        // unchanged source is a no-op
        assert_eq!(router.refresh().await.unwrap(), 0);
    }
}
