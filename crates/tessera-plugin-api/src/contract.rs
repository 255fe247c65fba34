//! Component contract types — the shape every loaded plugin module must
//! satisfy.
//!
//! A plugin bundle maps extension-point names to renderable components. On
//! the wire a component is a WASM export named after the point (see
//! [`export_name`]); it receives a JSON-serialized [`ComponentInvocation`]
//! and returns a UTF-8 fragment. On the host side a live component is a
//! [`ComponentHandle`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tenant-scoped plugin settings passed to components at render time.
pub type PluginConfig = serde_json::Map<String, serde_json::Value>;

/// Read-only identity and display metadata of the contributing plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// The exactly-three inputs a component receives.
///
/// `context` is caller-defined and extension-point-specific (see the typed
/// payloads in [`crate::points`]), `configuration` is the plugin's current
/// tenant-scoped settings, and `plugin` identifies the contributor. No
/// other inputs exist; the narrowness is what keeps host and plugin
/// independently upgradable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInvocation {
    pub context: serde_json::Value,
    pub configuration: PluginConfig,
    pub plugin: PluginIdentity,
}

/// A rendered unit of UI contributed by one plugin for one extension point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFragment {
    pub body: String,
}

impl RenderedFragment {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Local placeholder shown in place of a component that failed while
    /// rendering. Sibling contributions are unaffected.
    pub fn failure_placeholder(plugin_name: &str) -> Self {
        Self {
            body: format!(
                "<div class=\"plugin-error\" role=\"alert\">{plugin_name} failed to render</div>"
            ),
        }
    }
}

impl From<String> for RenderedFragment {
    fn from(body: String) -> Self {
        Self { body }
    }
}

/// Failure raised by a component's own execution.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component execution failed: {0}")]
    Execution(String),

    #[error("component produced invalid output: {0}")]
    InvalidOutput(String),
}

/// A live, invokable component.
///
/// Implementations wrap whatever actually executes the plugin code (the
/// host wraps a WASM export). `render` is synchronous; the runtime treats
/// any `Err` as that binding's failure and replaces it with a placeholder.
pub trait Component: Send + Sync {
    fn render(&self, invocation: &ComponentInvocation) -> Result<RenderedFragment, ComponentError>;
}

/// Shared handle to a live component; cheap to clone across render passes.
pub type ComponentHandle = Arc<dyn Component>;

/// WASM export name for an extension point.
///
/// Point names use `-` separators (`payment-methods`); exports use the
/// `render_` prefix with underscores (`render_payment_methods`). Both sides
/// of the contract derive the name with this function.
pub fn export_name(point: &str) -> String {
    format!("render_{}", point.replace('-', "_"))
}

// ─── Tests ──────────────────────────────────────────────────────────────
