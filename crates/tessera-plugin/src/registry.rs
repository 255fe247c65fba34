//! Plugin registry — the per-tenant catalog of installed plugins.
//!
//! Single source of truth for which plugins exist, whether they are
//! enabled, and which extension points, widget areas, and component slots
//! they declare. The catalog is an immutable snapshot swapped atomically on
//! `initialize`/`refresh`; readers (one resolver per extension point on
//! screen) never observe a partially updated catalog and never contend for
//! a lock beyond the snapshot pointer read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::error::PluginError;
use crate::record::{validate_configuration, PluginRecord};
use crate::store::MetadataStore;
use tessera_plugin_api::PluginConfig;

// ─── Catalog snapshot ───────────────────────────────────────────────────

/// One immutable catalog snapshot with its slot indexes.
///
/// Indexes are built once per swap, never recomputed per query. All three
/// declared-slot namespaces share the same index shape.
struct Catalog {
    records: Vec<Arc<PluginRecord>>,
    by_id: HashMap<String, usize>,
    by_extension_point: HashMap<String, Vec<usize>>,
    by_widget: HashMap<String, Vec<usize>>,
    by_component: HashMap<String, Vec<usize>>,
    /// False when the metadata store could not be reached; the catalog is
    /// then empty and resolution degrades to "no plugins".
    available: bool,
}

impl Catalog {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            by_id: HashMap::new(),
            by_extension_point: HashMap::new(),
            by_widget: HashMap::new(),
            by_component: HashMap::new(),
            available: true,
        }
    }

    fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::empty()
        }
    }

    /// Build a snapshot from store records.
    ///
    /// Records that fail validation and duplicate ids are skipped with a
    /// warning — one malformed row never takes the catalog down.
    fn build(mut records: Vec<PluginRecord>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut catalog = Self::empty();
        for record in records {
            if let Err(e) = record.validate() {
                warn!(plugin_id = %record.id, "skipping invalid plugin record: {e}");
                continue;
            }
            if catalog.by_id.contains_key(&record.id) {
                warn!(plugin_id = %record.id, "skipping duplicate plugin record");
                continue;
            }

            let idx = catalog.records.len();
            catalog.by_id.insert(record.id.clone(), idx);
            for point in &record.declared_extension_points {
                catalog
                    .by_extension_point
                    .entry(point.clone())
                    .or_default()
                    .push(idx);
            }
            for area in &record.declared_widgets {
                catalog.by_widget.entry(area.clone()).or_default().push(idx);
            }
            for slot in &record.declared_components {
                catalog
                    .by_component
                    .entry(slot.clone())
                    .or_default()
                    .push(idx);
            }
            catalog.records.push(Arc::new(record));
        }
        catalog
    }

    /// Copy of this snapshot with one record updated in place.
    ///
    /// Enable/configuration changes never touch the declared-slot sets, so
    /// the indexes carry over unchanged.
    fn with_record_updated(
        &self,
        plugin_id: &str,
        update: impl FnOnce(&mut PluginRecord),
    ) -> Option<Catalog> {
        let idx = *self.by_id.get(plugin_id)?;
        let mut records = self.records.clone();
        let mut record = (*records[idx]).clone();
        update(&mut record);
        records[idx] = Arc::new(record);
        Some(Catalog {
            records,
            by_id: self.by_id.clone(),
            by_extension_point: self.by_extension_point.clone(),
            by_widget: self.by_widget.clone(),
            by_component: self.by_component.clone(),
            available: self.available,
        })
    }

    fn select(&self, index: &HashMap<String, Vec<usize>>, name: &str) -> Vec<Arc<PluginRecord>> {
        index
            .get(name)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&idx| Arc::clone(&self.records[idx]))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Per-tenant plugin catalog with an explicit initialize/refresh lifecycle.
pub struct PluginRegistry {
    store: Arc<dyn MetadataStore>,
    tenant_id: String,
    /// Guards the one-time initial fetch; concurrent initializers share it.
    init: OnceCell<()>,
    catalog: RwLock<Arc<Catalog>>,
    /// Serializes catalog writers (`refresh`, `set_enabled`,
    /// `update_configuration`); readers are unaffected.
    mutation: Mutex<()>,
}

impl PluginRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, tenant_id: impl Into<String>) -> Self {
        Self {
            store,
            tenant_id: tenant_id.into(),
            init: OnceCell::new(),
            catalog: RwLock::new(Arc::new(Catalog::empty())),
            mutation: Mutex::new(()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(
            &self
                .catalog
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn swap_snapshot(&self, catalog: Arc<Catalog>) {
        *self
            .catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = catalog;
    }

    /// Fetch the catalog from the metadata store, exactly once per process
    /// unless `refresh` is called. Idempotent; concurrent callers share one
    /// in-flight fetch.
    ///
    /// Fails soft: if the store is unreachable the catalog stays empty and
    /// is marked unavailable, and resolution proceeds as if no plugins
    /// exist rather than failing every extension point on screen.
    pub async fn initialize(&self) {
        self.init
            .get_or_init(|| async {
                match self.store.list_plugins(&self.tenant_id).await {
                    Ok(records) => {
                        let catalog = Catalog::build(records);
                        info!(
                            tenant_id = %self.tenant_id,
                            plugins = catalog.records.len(),
                            "plugin catalog initialized"
                        );
                        self.swap_snapshot(Arc::new(catalog));
                    }
                    Err(e) => {
                        warn!(
                            tenant_id = %self.tenant_id,
                            "metadata store unavailable, continuing with empty plugin catalog: {e}"
                        );
                        self.swap_snapshot(Arc::new(Catalog::unavailable()));
                    }
                }
            })
            .await;
    }

    /// Re-fetch from the metadata store and atomically replace the catalog.
    ///
    /// In-flight resolutions keep the snapshot they started with; new
    /// passes see the replacement. Unlike `initialize` this surfaces store
    /// errors, leaving the current catalog in place.
    pub async fn refresh(&self) -> Result<(), PluginError> {
        let _guard = self.mutation.lock().await;
        let records = self.store.list_plugins(&self.tenant_id).await?;
        let catalog = Catalog::build(records);
        info!(
            tenant_id = %self.tenant_id,
            plugins = catalog.records.len(),
            "plugin catalog refreshed"
        );
        self.swap_snapshot(Arc::new(catalog));
        // A refresh satisfies the initial fetch.
        let _ = self.init.set(());
        Ok(())
    }

    /// Whether the last catalog fetch reached the metadata store.
    pub fn is_available(&self) -> bool {
        self.snapshot().available
    }

    pub fn len(&self) -> usize {
        self.snapshot().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().records.is_empty()
    }

    /// One record by id, from the current snapshot.
    pub fn plugin(&self, plugin_id: &str) -> Option<Arc<PluginRecord>> {
        let snapshot = self.snapshot();
        snapshot
            .by_id
            .get(plugin_id)
            .map(|&idx| Arc::clone(&snapshot.records[idx]))
    }

    /// All records in the current snapshot, id order.
    pub fn all_plugins(&self) -> Vec<Arc<PluginRecord>> {
        self.snapshot().records.clone()
    }

    /// All records declaring an extension point, enabled or not — callers
    /// filter on `enabled`.
    pub fn plugins_for_extension_point(&self, name: &str) -> Vec<Arc<PluginRecord>> {
        let snapshot = self.snapshot();
        snapshot.select(&snapshot.by_extension_point, name)
    }

    /// All records declaring a dashboard widget area.
    pub fn plugins_with_widget(&self, area: &str) -> Vec<Arc<PluginRecord>> {
        let snapshot = self.snapshot();
        snapshot.select(&snapshot.by_widget, area)
    }

    /// All records declaring an admin component slot.
    pub fn plugins_with_component(&self, slot: &str) -> Vec<Arc<PluginRecord>> {
        let snapshot = self.snapshot();
        snapshot.select(&snapshot.by_component, slot)
    }

    /// Enable or disable a plugin, in memory and in the metadata store.
    ///
    /// The snapshot change applies immediately (no refresh needed for it to
    /// take effect in resolution); if the store write fails the change is
    /// rolled back and the error surfaced.
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PluginError> {
        let _guard = self.mutation.lock().await;
        let previous = self.snapshot();
        if !previous.available {
            return Err(PluginError::StoreUnavailable(
                "plugin catalog unavailable".into(),
            ));
        }

        let updated = previous
            .with_record_updated(plugin_id, |record| record.enabled = enabled)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        self.swap_snapshot(Arc::new(updated));

        if let Err(e) = self.store.set_enabled(plugin_id, enabled).await {
            self.swap_snapshot(previous);
            return Err(e);
        }

        info!(plugin_id = %plugin_id, enabled, "plugin enabled state changed");
        Ok(())
    }

    /// Replace a plugin's tenant-scoped configuration, in memory and in the
    /// metadata store, with the same rollback semantics as `set_enabled`.
    pub async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: PluginConfig,
    ) -> Result<(), PluginError> {
        validate_configuration(&configuration)?;

        let _guard = self.mutation.lock().await;
        let previous = self.snapshot();
        if !previous.available {
            return Err(PluginError::StoreUnavailable(
                "plugin catalog unavailable".into(),
            ));
        }

        let updated = previous
            .with_record_updated(plugin_id, |record| {
                record.configuration = configuration.clone()
            })
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        self.swap_snapshot(Arc::new(updated));

        if let Err(e) = self.store.update_configuration(plugin_id, &configuration).await {
            self.swap_snapshot(previous);
            return Err(e);
        }

        info!(plugin_id = %plugin_id, "plugin configuration updated");
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_record, MemoryStore};

    fn registry_with(records: Vec<PluginRecord>) -> (Arc<MemoryStore>, PluginRegistry) {
        let store = Arc::new(MemoryStore::with_records(records));
        let registry = PluginRegistry::new(Arc::clone(&store) as Arc<dyn MetadataStore>, "t1");
        (store, registry)
    }

    // ── Initialization ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_initialize_builds_catalog() {
        let (_, registry) = registry_with(vec![sample_record("plg_a"), sample_record("plg_b")]);
        registry.initialize().await;

        assert!(registry.is_available());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.plugins_for_extension_point("payment-methods").len(),
            2
        );
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        registry.initialize().await;
        registry.initialize().await;
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initializers_share_one_fetch() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        store.set_list_delay_ms(50);
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.initialize().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.list_calls(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_fails_soft_when_store_down() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        store.fail_lists(true);

        registry.initialize().await;

        assert!(!registry.is_available());
        assert!(registry.is_empty());
        assert!(registry.plugins_for_extension_point("payment-methods").is_empty());

        // Still marked initialized; no retry storm against a dead store.
        registry.initialize().await;
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_skips_invalid_and_duplicate_records() {
        let mut invalid = sample_record("plg_bad");
        invalid.version = "not-semver".into();
        let records = vec![
            sample_record("plg_a"),
            invalid,
            sample_record("plg_a"), // duplicate id
        ];
        let (_, registry) = registry_with(records);
        registry.initialize().await;

        assert_eq!(registry.len(), 1);
        assert!(registry.plugin("plg_a").is_some());
        assert!(registry.plugin("plg_bad").is_none());
    }

    // ── Refresh ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_refresh_replaces_catalog() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        assert_eq!(registry.len(), 1);

        store.replace_records(vec![sample_record("plg_a"), sample_record("plg_b")]);
        registry.refresh().await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_recovers_from_unavailable() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        store.fail_lists(true);
        registry.initialize().await;
        assert!(!registry.is_available());

        store.fail_lists(false);
        registry.refresh().await.unwrap();
        assert!(registry.is_available());
        assert_eq!(registry.len(), 1);

        // Refresh satisfied the one-time initial fetch.
        registry.initialize().await;
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_error_keeps_current_catalog() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;

        store.fail_lists(true);
        let err = registry.refresh().await.unwrap_err();
        assert!(matches!(err, PluginError::StoreUnavailable(_)));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_available());
    }

    #[tokio::test]
    async fn test_snapshot_survives_refresh() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        let before = registry.plugins_for_extension_point("payment-methods");

        store.replace_records(vec![]);
        registry.refresh().await.unwrap();

        // The pre-refresh snapshot is untouched; new queries see the swap.
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, "plg_a");
        assert!(registry.plugins_for_extension_point("payment-methods").is_empty());
    }

    // ── Queries ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_queries_cover_all_three_namespaces() {
        let mut record = sample_record("plg_a");
        record.declared_widgets = vec!["dashboard-main".into()];
        record.declared_components = vec!["admin-settings".into()];
        let (_, registry) = registry_with(vec![record]);
        registry.initialize().await;

        assert_eq!(registry.plugins_for_extension_point("payment-methods").len(), 1);
        assert_eq!(registry.plugins_with_widget("dashboard-main").len(), 1);
        assert_eq!(registry.plugins_with_component("admin-settings").len(), 1);
        assert!(registry.plugins_with_widget("reports-overview").is_empty());
    }

    #[tokio::test]
    async fn test_queries_return_disabled_records() {
        let mut record = sample_record("plg_a");
        record.enabled = false;
        let (_, registry) = registry_with(vec![record]);
        registry.initialize().await;

        // Callers filter on `enabled`; the registry reports declarations.
        let matches = registry.plugins_for_extension_point("payment-methods");
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].enabled);
    }

    // ── Mutations ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_set_enabled_takes_effect_without_refresh() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        assert!(registry.plugin("plg_a").unwrap().enabled);

        registry.set_enabled("plg_a", false).await.unwrap();

        let record = registry.plugin("plg_a").unwrap();
        assert!(!record.enabled);
        // Persisted, and with no extra list fetch.
        assert!(!store.record("plg_a").unwrap().enabled);
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_set_enabled_unknown_plugin() {
        let (_, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        let err = registry.set_enabled("plg_missing", false).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_enabled_rolls_back_on_store_failure() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        store.fail_mutations(true);

        let err = registry.set_enabled("plg_a", false).await.unwrap_err();
        assert!(matches!(err, PluginError::StoreUnavailable(_)));
        // In-memory change rolled back.
        assert!(registry.plugin("plg_a").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_update_configuration_applies_and_persists() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;

        let mut config = PluginConfig::new();
        config.insert("api_key".into(), serde_json::json!("sk_live"));
        registry
            .update_configuration("plg_a", config.clone())
            .await
            .unwrap();

        assert_eq!(
            registry.plugin("plg_a").unwrap().configuration["api_key"],
            "sk_live"
        );
        assert_eq!(store.record("plg_a").unwrap().configuration["api_key"], "sk_live");
    }

    #[tokio::test]
    async fn test_update_configuration_rejects_malformed() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;

        let mut config = PluginConfig::new();
        config.insert("Bad Key".into(), serde_json::json!(1));
        let err = registry
            .update_configuration("plg_a", config)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Validation(_)));
        // Store never called with a malformed payload.
        assert!(store.record("plg_a").unwrap().configuration.is_empty());
    }

    #[tokio::test]
    async fn test_update_configuration_rolls_back_on_store_failure() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        registry.initialize().await;
        store.fail_mutations(true);

        let mut config = PluginConfig::new();
        config.insert("api_key".into(), serde_json::json!("sk_live"));
        let err = registry
            .update_configuration("plg_a", config)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(registry.plugin("plg_a").unwrap().configuration.is_empty());
    }

    #[tokio::test]
    async fn test_mutations_fail_when_catalog_unavailable() {
        let (store, registry) = registry_with(vec![sample_record("plg_a")]);
        store.fail_lists(true);
        registry.initialize().await;

        let err = registry.set_enabled("plg_a", false).await.unwrap_err();
        assert!(matches!(err, PluginError::StoreUnavailable(_)));
    }
}
