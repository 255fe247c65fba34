//! WASM plugin sandbox using Extism (wasmtime).
//!
//! Each loaded bundle runs in its own isolated sandbox with a memory cap
//! and a fuel-based execution budget, so a runaway component becomes a
//! contained error instead of stalling the host.

use std::sync::{Arc, Mutex};

use crate::error::PluginError;
use tessera_plugin_api::{
    export_name, Component, ComponentError, ComponentInvocation, RenderedFragment,
};

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per invocation (default: 1_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    /// When false, components cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A loaded WASM bundle in a sandboxed environment.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    plugin_name: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_name", &self.plugin_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Instantiate a fetched bundle into a sandbox.
    ///
    /// Configures the memory cap (in 64 KB pages) and the per-call fuel
    /// budget via the `PluginBuilder`.
    pub fn from_bytes(
        wasm_bytes: Vec<u8>,
        config: SandboxConfig,
        name: &str,
    ) -> Result<Self, PluginError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32);

        let builder = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit);

        if config.wasi_enabled {
            tracing::warn!(
                plugin = %name,
                "WASI enabled for plugin — plugin can access environment variables. \
                 Avoid running with sensitive env vars exposed."
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| PluginError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            plugin_name: name.to_string(),
        })
    }

    /// Call a WASM export by name with raw byte input/output.
    ///
    /// Each call gets a fresh fuel budget. Errors are classified into fuel
    /// exhaustion, memory exceeded, or general sandbox errors.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        let output = self
            .plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    PluginError::FuelExhausted(self.plugin_name.clone())
                } else if msg.contains("memory") {
                    PluginError::MemoryExceeded(self.plugin_name.clone())
                } else {
                    PluginError::Sandbox(msg)
                }
            })?;

        Ok(output)
    }

    /// Check if the bundle exports a function with the given name.
    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.plugin_name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

// ─── Component adapter ──────────────────────────────────────────────────

/// A component backed by one export of a sandboxed bundle.
///
/// All components of one bundle share the sandbox; calls serialize through
/// the mutex (extism plugin calls take `&mut self`).
pub struct WasmComponent {
    sandbox: Arc<Mutex<PluginSandbox>>,
    export: String,
}

impl WasmComponent {
    pub fn new(sandbox: Arc<Mutex<PluginSandbox>>, point: &str) -> Self {
        Self {
            sandbox,
            export: export_name(point),
        }
    }
}

impl Component for WasmComponent {
    fn render(&self, invocation: &ComponentInvocation) -> Result<RenderedFragment, ComponentError> {
        let input = serde_json::to_vec(invocation)
            .map_err(|e| ComponentError::Execution(format!("invocation encoding: {e}")))?;

        let mut sandbox = self
            .sandbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let output = sandbox
            .call(&self.export, &input)
            .map_err(|e| ComponentError::Execution(e.to_string()))?;

        let body = String::from_utf8(output)
            .map_err(|_| ComponentError::InvalidOutput("fragment is not UTF-8".into()))?;

        Ok(RenderedFragment::new(body))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 32 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 1_000_000);
        assert!(!config.wasi_enabled);
    }

    #[test]
    fn test_sandbox_config_memory_pages() {
        // 32 MB cap translates to 512 wasm pages of 64 KB
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit / 65536, 512);
    }

    #[test]
    fn test_component_export_name() {
        // WasmComponent derives its export from the contract's naming rule
        assert_eq!(export_name("payment-methods"), "render_payment_methods");
    }
}
