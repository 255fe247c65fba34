//! Bundle loader — fetch, validate, instantiate, cache.
//!
//! Turns a plugin record's `bundle_location` into a live component map
//! exactly once per `(plugin id, version)`. Concurrent requesters for the
//! same key join the in-flight load; resolved results — success or terminal
//! failure — are cached until explicitly invalidated, so an unreachable
//! artifact host is hit once, not once per render.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use url::Url;

use crate::error::PluginError;
use crate::record::{ModuleKey, PluginRecord};
use crate::sandbox::{PluginSandbox, SandboxConfig, WasmComponent};
use tessera_plugin_api::{export_name, ComponentHandle};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Default max bundle size: 50 MB.
const DEFAULT_MAX_BUNDLE_SIZE_MB: u64 = 50;

/// Default artifact fetch timeout in seconds.
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// Default overall load timeout (fetch + instantiate) in seconds.
const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 30;

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1
    "wasi_unstable",          // Legacy WASI
];

// ─── Configuration ──────────────────────────────────────────────────────

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Timeout for the artifact fetch alone.
    pub fetch_timeout: Duration,
    /// Timeout for one whole load (fetch + validate + instantiate). A load
    /// that exceeds it resolves to a terminal failure, so one hung artifact
    /// host never blocks other plugins or future passes.
    pub load_timeout: Duration,
    /// Maximum bundle size in bytes.
    pub max_bundle_bytes: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            load_timeout: Duration::from_secs(DEFAULT_LOAD_TIMEOUT_SECS),
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_SIZE_MB * 1024 * 1024,
        }
    }
}

impl LoaderConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fetch_timeout: std::env::var("PLUGIN_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            load_timeout: std::env::var("PLUGIN_LOAD_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.load_timeout),
            max_bundle_bytes: std::env::var("PLUGIN_BUNDLE_MAX_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_bundle_bytes),
        }
    }
}

// ─── Loaded module ──────────────────────────────────────────────────────

/// Live components of one loaded bundle, keyed by extension point name.
pub type ComponentMap = HashMap<String, ComponentHandle>;

/// Why a load failed, for logging and admin surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureKind {
    Fetch,
    Validation,
    Instantiate,
    ContractMismatch,
    Timeout,
}

/// A terminal load failure. Cached like a success; retried only through
/// `invalidate` or a catalog refresh.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub kind: LoadFailureKind,
    pub message: String,
}

impl LoadFailure {
    fn from_error(err: &PluginError) -> Self {
        let kind = match err {
            PluginError::ContractMismatch { .. } => LoadFailureKind::ContractMismatch,
            PluginError::WasmValidation(_)
            | PluginError::Validation(_)
            | PluginError::BundleLocation(_) => LoadFailureKind::Validation,
            PluginError::Sandbox(_)
            | PluginError::FuelExhausted(_)
            | PluginError::MemoryExceeded(_) => LoadFailureKind::Instantiate,
            _ => LoadFailureKind::Fetch,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            kind: LoadFailureKind::Timeout,
            message: format!("load did not settle within {}s", after.as_secs()),
        }
    }
}

/// The materialized result of loading one plugin's bundle: either a
/// component map or a terminal failure.
pub struct LoadedModule {
    key: ModuleKey,
    outcome: Result<ComponentMap, LoadFailure>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("key", &self.key)
            .field("loaded", &self.outcome.is_ok())
            .finish_non_exhaustive()
    }
}

impl LoadedModule {
    pub(crate) fn loaded(key: ModuleKey, components: ComponentMap) -> Self {
        Self {
            key,
            outcome: Ok(components),
        }
    }

    pub(crate) fn failed(key: ModuleKey, failure: LoadFailure) -> Self {
        Self {
            key,
            outcome: Err(failure),
        }
    }

    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&LoadFailure> {
        self.outcome.as_ref().err()
    }

    /// The component this module contributes for one extension point, if
    /// the module actually implements it.
    pub fn component_for(&self, point: &str) -> Option<ComponentHandle> {
        self.outcome
            .as_ref()
            .ok()
            .and_then(|components| components.get(point).cloned())
    }

    /// Extension points the module actually implements.
    pub fn implemented_points(&self) -> Vec<&str> {
        match &self.outcome {
            Ok(components) => components.keys().map(String::as_str).collect(),
            Err(_) => Vec::new(),
        }
    }
}

// ─── Module runtime ─────────────────────────────────────────────────────

/// The remote-module-loading primitive: fetch one record's bundle and
/// produce its live component map. This is the only seam touching the
/// external artifact store.
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    async fn instantiate(&self, record: &PluginRecord) -> Result<ComponentMap, PluginError>;
}

/// Production runtime: HTTPS fetch, WASM validation, extism instantiation.
pub struct WasmModuleRuntime {
    http: reqwest::Client,
    sandbox_config: SandboxConfig,
    max_bundle_bytes: u64,
}

impl WasmModuleRuntime {
    pub fn new(sandbox_config: SandboxConfig, config: &LoaderConfig) -> Result<Self, PluginError> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| PluginError::BundleLocation(format!("http client: {e}")))?;

        Ok(Self {
            http,
            sandbox_config,
            max_bundle_bytes: config.max_bundle_bytes,
        })
    }

    async fn fetch_bundle(&self, url: Url, plugin_id: &str) -> Result<Vec<u8>, PluginError> {
        let bundle_error = |message: String| PluginError::BundleLoad {
            plugin_id: plugin_id.to_string(),
            message,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| bundle_error(format!("fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(bundle_error(format!("artifact host returned {status}")));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bundle_bytes {
                return Err(bundle_error(format!(
                    "bundle is {length} bytes (max {})",
                    self.max_bundle_bytes
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| bundle_error(format!("fetch failed: {e}")))?;

        if bytes.len() as u64 > self.max_bundle_bytes {
            return Err(bundle_error(format!(
                "bundle is {} bytes (max {})",
                bytes.len(),
                self.max_bundle_bytes
            )));
        }

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ModuleRuntime for WasmModuleRuntime {
    async fn instantiate(&self, record: &PluginRecord) -> Result<ComponentMap, PluginError> {
        let url = validate_bundle_location(&record.bundle_location)?;
        let bytes = self.fetch_bundle(url, &record.id).await?;
        validate_wasm(&bytes)?;
        let sandbox = PluginSandbox::from_bytes(bytes, self.sandbox_config.clone(), &record.name)?;
        build_component_map(sandbox, record)
    }
}

// ─── Validation helpers ─────────────────────────────────────────────────

/// Validate a bundle location for fetching.
///
/// Only HTTPS URLs are allowed; loopback, private, link-local, and cloud
/// metadata hosts are blocked to prevent SSRF through a hostile record.
fn validate_bundle_location(location: &str) -> Result<Url, PluginError> {
    let parsed = Url::parse(location)
        .map_err(|_| PluginError::BundleLocation(format!("not a URL: '{location}'")))?;

    if parsed.scheme() != "https" {
        return Err(PluginError::BundleLocation(format!(
            "only HTTPS bundle locations are allowed, got scheme '{}' in '{location}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| PluginError::BundleLocation(format!("no host in '{location}'")))?;

    let blocked_hosts = [
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "[::1]",
        "169.254.169.254",          // AWS/GCP metadata
        "metadata.google.internal", // GCP metadata
    ];
    if blocked_hosts.contains(&host) {
        return Err(PluginError::BundleLocation(format!(
            "host '{host}' is blocked (private/reserved address)"
        )));
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let is_private = match ip {
            std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            std::net::IpAddr::V6(v6) => v6.is_loopback(),
        };
        if is_private {
            return Err(PluginError::BundleLocation(format!(
                "host resolves to private IP: '{host}'"
            )));
        }
    }

    Ok(parsed)
}

/// Validate fetched bundle bytes before instantiation.
///
/// Checks the `\0asm` magic and that every import comes from an allowed
/// namespace, so a bundle expecting host capabilities we do not provide
/// fails at load time instead of trapping mid-render.
fn validate_wasm(wasm_bytes: &[u8]) -> Result<(), PluginError> {
    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(PluginError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    use wasmparser::{Parser, Payload};

    let parser = Parser::new(0);

    for payload in parser.parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| PluginError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    PluginError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                let module = import.module;
                if !ALLOWED_IMPORT_NAMESPACES.contains(&module) {
                    return Err(PluginError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Split a record's declared extension points into those the module
/// actually exports and those it is missing.
fn partition_declared_points<'a>(
    declared: &'a [String],
    has_export: impl Fn(&str) -> bool,
) -> (Vec<&'a String>, Vec<&'a String>) {
    declared
        .iter()
        .partition(|point| has_export(&export_name(point)))
}

/// Build the component map from a record's declarations and the sandbox's
/// actual exports.
///
/// A module exporting none of its declared points has the wrong shape
/// entirely and fails as a contract mismatch; a partial implementation
/// loads, and each missing point surfaces as a skip at resolution time.
fn build_component_map(
    sandbox: PluginSandbox,
    record: &PluginRecord,
) -> Result<ComponentMap, PluginError> {
    let (implemented, missing) =
        partition_declared_points(&record.declared_extension_points, |export| {
            sandbox.has_function(export)
        });

    if implemented.is_empty() && !record.declared_extension_points.is_empty() {
        return Err(PluginError::ContractMismatch {
            plugin_id: record.id.clone(),
            message: format!(
                "module exports none of its declared extension points ({})",
                record.declared_extension_points.join(", ")
            ),
        });
    }

    if !missing.is_empty() {
        tracing::warn!(
            plugin_id = %record.id,
            missing = ?missing,
            "module does not export all declared extension points"
        );
    }

    let sandbox = Arc::new(StdMutex::new(sandbox));
    let components = implemented
        .into_iter()
        .map(|point| {
            let handle: ComponentHandle = Arc::new(WasmComponent::new(Arc::clone(&sandbox), point));
            (point.clone(), handle)
        })
        .collect();

    Ok(components)
}

// ─── Loader ─────────────────────────────────────────────────────────────

/// Process-wide module cache with per-key request coalescing.
pub struct BundleLoader {
    runtime: Arc<dyn ModuleRuntime>,
    config: LoaderConfig,
    cells: StdMutex<HashMap<ModuleKey, Arc<OnceCell<Arc<LoadedModule>>>>>,
}

impl BundleLoader {
    pub fn new(runtime: Arc<dyn ModuleRuntime>, config: LoaderConfig) -> Self {
        Self {
            runtime,
            config,
            cells: StdMutex::new(HashMap::new()),
        }
    }

    /// Loader with the production WASM runtime.
    pub fn wasm(sandbox_config: SandboxConfig, config: LoaderConfig) -> Result<Self, PluginError> {
        let runtime = WasmModuleRuntime::new(sandbox_config, &config)?;
        Ok(Self::new(Arc::new(runtime), config))
    }

    /// Load a plugin's bundle, joining any in-flight load for the same
    /// `(plugin id, version)` and returning the cached result if one
    /// exists. Never fails — failures are terminal [`LoadedModule`]s.
    pub async fn load(&self, record: &PluginRecord) -> Arc<LoadedModule> {
        let key = record.module_key();
        let cell = {
            let mut cells = self
                .cells
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(cells.entry(key).or_default())
        };

        if let Some(module) = cell.get() {
            return Arc::clone(module);
        }

        let module = cell
            .get_or_init(|| {
                let runtime = Arc::clone(&self.runtime);
                let record = record.clone();
                let load_timeout = self.config.load_timeout;
                async move {
                    let key = record.module_key();
                    // Detached task: an abandoned render pass still
                    // populates the cache for future passes.
                    let task = tokio::spawn(async move {
                        let key = record.module_key();
                        match tokio::time::timeout(load_timeout, runtime.instantiate(&record))
                            .await
                        {
                            Ok(Ok(components)) => LoadedModule::loaded(key, components),
                            Ok(Err(err)) => {
                                LoadedModule::failed(key, LoadFailure::from_error(&err))
                            }
                            Err(_) => {
                                LoadedModule::failed(key, LoadFailure::timed_out(load_timeout))
                            }
                        }
                    });

                    let module = match task.await {
                        Ok(module) => module,
                        Err(join_err) => LoadedModule::failed(
                            key,
                            LoadFailure {
                                kind: LoadFailureKind::Instantiate,
                                message: format!("load task failed: {join_err}"),
                            },
                        ),
                    };

                    match module.failure() {
                        Some(failure) => tracing::warn!(
                            plugin_id = %module.key().plugin_id,
                            version = %module.key().version,
                            kind = ?failure.kind,
                            "bundle load failed: {}",
                            failure.message
                        ),
                        None => tracing::info!(
                            plugin_id = %module.key().plugin_id,
                            version = %module.key().version,
                            points = ?module.implemented_points(),
                            "bundle loaded"
                        ),
                    }

                    Arc::new(module)
                }
            })
            .await;

        Arc::clone(module)
    }

    /// Evict cached entries for a plugin — one version, or all versions if
    /// `version` is `None`. The next `load` for an evicted key fetches
    /// fresh. Returns the number of entries evicted.
    pub fn invalidate(&self, plugin_id: &str, version: Option<&str>) -> usize {
        let mut cells = self
            .cells
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = cells.len();
        cells.retain(|key, _| {
            let matches = key.plugin_id == plugin_id
                && version.map_or(true, |v| key.version == v);
            !matches
        });
        let evicted = before - cells.len();
        if evicted > 0 {
            tracing::info!(plugin_id = %plugin_id, ?version, evicted, "module cache invalidated");
        }
        evicted
    }

    /// Number of module cache entries (pending or resolved).
    pub fn cached_modules(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
