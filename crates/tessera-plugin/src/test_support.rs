//! Shared fixtures for the crate's tests: an in-memory metadata store and
//! a scriptable module runtime, so registry/loader/resolver behavior is
//! exercised without network or WASM artifacts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PluginError;
use crate::loader::{ComponentMap, ModuleRuntime};
use crate::record::PluginRecord;
use crate::store::MetadataStore;
use tessera_plugin_api::{
    Component, ComponentError, ComponentHandle, ComponentInvocation, PluginConfig,
    RenderedFragment,
};

pub(crate) fn sample_record(id: &str) -> PluginRecord {
    PluginRecord {
        id: id.to_string(),
        name: "stripe-checkout".into(),
        version: "1.2.3".into(),
        bundle_location: format!("https://bundles.example.com/{id}/1.2.3/plugin.wasm"),
        declared_extension_points: vec!["payment-methods".into()],
        declared_widgets: vec![],
        declared_components: vec![],
        enabled: true,
        configuration: PluginConfig::new(),
        priority: 0,
        updated_at: None,
    }
}

// ─── In-memory metadata store ───────────────────────────────────────────

pub(crate) struct MemoryStore {
    records: Mutex<Vec<PluginRecord>>,
    fail_lists: AtomicBool,
    fail_mutations: AtomicBool,
    list_calls: AtomicUsize,
    list_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn with_records(records: Vec<PluginRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            fail_lists: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            list_delay_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn replace_records(&self, records: Vec<PluginRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub(crate) fn record(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == plugin_id)
            .cloned()
    }

    pub(crate) fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_list_delay_ms(&self, ms: u64) {
        self.list_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn list_plugins(&self, _tenant_id: &str) -> Result<Vec<PluginRecord>, PluginError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(PluginError::StoreUnavailable("store offline".into()));
        }

        Ok(self.records.lock().unwrap().clone())
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError> {
        self.record(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))
    }

    async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PluginError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(PluginError::StoreUnavailable("store offline".into()));
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        record.enabled = enabled;
        Ok(())
    }

    async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: &PluginConfig,
    ) -> Result<(), PluginError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(PluginError::StoreUnavailable("store offline".into()));
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        record.configuration = configuration.clone();
        Ok(())
    }
}

// ─── Test components ────────────────────────────────────────────────────

/// Renders a fixed body.
pub(crate) struct StaticComponent(pub(crate) String);

impl Component for StaticComponent {
    fn render(&self, _invocation: &ComponentInvocation) -> Result<RenderedFragment, ComponentError> {
        Ok(RenderedFragment::new(self.0.clone()))
    }
}

/// Always fails, standing in for a component that throws at render time.
pub(crate) struct FailingComponent(pub(crate) String);

impl Component for FailingComponent {
    fn render(&self, _invocation: &ComponentInvocation) -> Result<RenderedFragment, ComponentError> {
        Err(ComponentError::Execution(self.0.clone()))
    }
}

/// Echoes the whole invocation back as JSON, to assert the contract
/// plumbing end to end.
pub(crate) struct EchoComponent;

impl Component for EchoComponent {
    fn render(&self, invocation: &ComponentInvocation) -> Result<RenderedFragment, ComponentError> {
        serde_json::to_string(invocation)
            .map(RenderedFragment::new)
            .map_err(|e| ComponentError::Execution(e.to_string()))
    }
}

// ─── Scriptable module runtime ──────────────────────────────────────────

#[derive(Clone)]
enum ComponentSpec {
    Static(String),
    Failing(String),
    Echo,
}

#[derive(Clone)]
enum StubBehavior {
    Succeed {
        components: Vec<(String, ComponentSpec)>,
        delay_ms: u64,
    },
    Fail {
        message: String,
        delay_ms: u64,
    },
}

/// A [`ModuleRuntime`] scripted per plugin id, counting instantiations.
pub(crate) struct StubRuntime {
    behaviors: Mutex<HashMap<String, StubBehavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StubRuntime {
    pub(crate) fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn succeed_after_ms(&self, plugin_id: &str, points: &[(&str, &str)], delay_ms: u64) {
        let components = points
            .iter()
            .map(|(point, body)| (point.to_string(), ComponentSpec::Static(body.to_string())))
            .collect();
        self.behaviors.lock().unwrap().insert(
            plugin_id.to_string(),
            StubBehavior::Succeed {
                components,
                delay_ms,
            },
        );
    }

    pub(crate) fn succeed_failing_component(&self, plugin_id: &str, point: &str, message: &str) {
        self.behaviors.lock().unwrap().insert(
            plugin_id.to_string(),
            StubBehavior::Succeed {
                components: vec![(point.to_string(), ComponentSpec::Failing(message.into()))],
                delay_ms: 0,
            },
        );
    }

    pub(crate) fn succeed_echo(&self, plugin_id: &str, point: &str) {
        self.behaviors.lock().unwrap().insert(
            plugin_id.to_string(),
            StubBehavior::Succeed {
                components: vec![(point.to_string(), ComponentSpec::Echo)],
                delay_ms: 0,
            },
        );
    }

    pub(crate) fn fail_after_ms(&self, plugin_id: &str, message: &str, delay_ms: u64) {
        self.behaviors.lock().unwrap().insert(
            plugin_id.to_string(),
            StubBehavior::Fail {
                message: message.to_string(),
                delay_ms,
            },
        );
    }

    pub(crate) fn call_count(&self, plugin_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(plugin_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

fn build_handle(spec: &ComponentSpec) -> ComponentHandle {
    match spec {
        ComponentSpec::Static(body) => std::sync::Arc::new(StaticComponent(body.clone())),
        ComponentSpec::Failing(message) => std::sync::Arc::new(FailingComponent(message.clone())),
        ComponentSpec::Echo => std::sync::Arc::new(EchoComponent),
    }
}

#[async_trait]
impl ModuleRuntime for StubRuntime {
    async fn instantiate(&self, record: &PluginRecord) -> Result<ComponentMap, PluginError> {
        let behavior = self.behaviors.lock().unwrap().get(&record.id).cloned();
        *self
            .calls
            .lock()
            .unwrap()
            .entry(record.id.clone())
            .or_insert(0) += 1;

        match behavior {
            Some(StubBehavior::Succeed {
                components,
                delay_ms,
            }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(components
                    .iter()
                    .map(|(point, spec)| (point.clone(), build_handle(spec)))
                    .collect())
            }
            Some(StubBehavior::Fail { message, delay_ms }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(PluginError::BundleLoad {
                    plugin_id: record.id.clone(),
                    message,
                })
            }
            None => Err(PluginError::BundleLoad {
                plugin_id: record.id.clone(),
                message: "no stub behavior registered".into(),
            }),
        }
    }
}
