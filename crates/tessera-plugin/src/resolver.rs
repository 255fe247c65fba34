//! Extension point resolver — composes the live UI for one named point
//! from zero or more plugins.
//!
//! One `resolve` call is one pass: it reads a single catalog snapshot,
//! loads every enabled candidate concurrently, waits for all of them to
//! settle, then orders and renders the survivors. Ordering depends only on
//! the plugin set (priority descending, id ascending), never on network
//! completion order. Every binding renders inside its own failure boundary;
//! one broken plugin degrades to a local placeholder and its siblings are
//! unaffected.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::loader::BundleLoader;
use crate::record::PluginRecord;
use crate::registry::PluginRegistry;
use tessera_plugin_api::{
    ComponentHandle, ComponentInvocation, PluginIdentity, RenderedFragment,
};

/// The association, for one pass, between a plugin and the component it
/// contributes to the resolved point.
struct ExtensionBinding {
    record: Arc<PluginRecord>,
    handle: ComponentHandle,
}

/// Outcome of rendering one binding.
#[derive(Debug)]
pub enum BindingOutcome {
    Rendered(RenderedFragment),
    /// The component itself failed; only this binding degrades.
    Failed {
        message: String,
        placeholder: RenderedFragment,
    },
}

/// One rendered contribution, in final composition order.
#[derive(Debug)]
pub struct ResolvedBinding {
    pub plugin: PluginIdentity,
    pub priority: i32,
    pub outcome: BindingOutcome,
}

impl ResolvedBinding {
    /// The fragment to compose: the rendered body, or the failure
    /// placeholder.
    pub fn fragment(&self) -> &RenderedFragment {
        match &self.outcome {
            BindingOutcome::Rendered(fragment) => fragment,
            BindingOutcome::Failed { placeholder, .. } => placeholder,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, BindingOutcome::Failed { .. })
    }
}

/// Result of resolving one extension point.
#[derive(Debug)]
pub enum Resolution {
    /// No surviving contributor; the caller's fallback (if any) renders.
    Empty { fallback: Option<RenderedFragment> },
    /// At least one contributor survived; bindings are in composition
    /// order and include per-binding failures.
    Rendered { bindings: Vec<ResolvedBinding> },
}

impl Resolution {
    /// The final fragments to compose, in order — the fallback for an
    /// empty resolution, otherwise every binding's fragment (placeholders
    /// included).
    pub fn fragments(&self) -> Vec<&RenderedFragment> {
        match self {
            Resolution::Empty { fallback } => fallback.iter().collect(),
            Resolution::Rendered { bindings } => {
                bindings.iter().map(ResolvedBinding::fragment).collect()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Resolution::Empty { .. })
    }
}

/// Composes plugin contributions for named extension points.
///
/// Stateless per pass: re-invoke `resolve` when the invocation context or
/// point changes. Module results land in the loader's cache, so an
/// abandoned pass costs nothing beyond the fetch it already started.
pub struct ExtensionResolver {
    registry: Arc<PluginRegistry>,
    loader: Arc<BundleLoader>,
}

impl ExtensionResolver {
    pub fn new(registry: Arc<PluginRegistry>, loader: Arc<BundleLoader>) -> Self {
        Self { registry, loader }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Arc<BundleLoader> {
        &self.loader
    }

    /// Resolve one extension point against the current catalog.
    ///
    /// `context` is the point-specific payload handed to every component;
    /// `fallback` renders when no contributor survives. With zero enabled
    /// candidates no bundle is fetched at all.
    pub async fn resolve(
        &self,
        point: &str,
        context: serde_json::Value,
        fallback: Option<RenderedFragment>,
    ) -> Resolution {
        self.registry.initialize().await;

        let candidates: Vec<Arc<PluginRecord>> = self
            .registry
            .plugins_for_extension_point(point)
            .into_iter()
            .filter(|record| record.enabled)
            .collect();

        if candidates.is_empty() {
            debug!(point = %point, "no enabled plugins for extension point");
            return Resolution::Empty { fallback };
        }

        // Let every candidate settle before ordering, so a slow
        // high-priority plugin still lands above a fast low-priority one.
        let modules =
            futures::future::join_all(candidates.iter().map(|record| self.loader.load(record)))
                .await;

        let mut bindings: Vec<ExtensionBinding> = Vec::with_capacity(candidates.len());
        for (record, module) in candidates.into_iter().zip(modules) {
            if let Some(failure) = module.failure() {
                // Already logged by the loader when the load settled.
                debug!(
                    plugin_id = %record.id,
                    point = %point,
                    kind = ?failure.kind,
                    "excluding plugin with failed bundle from resolution"
                );
                continue;
            }
            match module.component_for(point) {
                Some(handle) => bindings.push(ExtensionBinding { record, handle }),
                None => {
                    warn!(
                        plugin_id = %record.id,
                        point = %point,
                        "loaded module does not implement declared point, skipping"
                    );
                }
            }
        }

        bindings.sort_by(|a, b| {
            b.record
                .priority
                .cmp(&a.record.priority)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        if bindings.is_empty() {
            debug!(point = %point, "no surviving contributors, rendering fallback");
            return Resolution::Empty { fallback };
        }

        let rendered = bindings
            .into_iter()
            .map(|binding| self.render_binding(binding, point, &context))
            .collect();

        Resolution::Rendered { bindings: rendered }
    }

    /// Render one binding inside its own failure boundary.
    fn render_binding(
        &self,
        binding: ExtensionBinding,
        point: &str,
        context: &serde_json::Value,
    ) -> ResolvedBinding {
        let record = binding.record;
        let invocation = ComponentInvocation {
            context: context.clone(),
            configuration: record.configuration.clone(),
            plugin: record.identity(),
        };

        let outcome = match binding.handle.render(&invocation) {
            Ok(fragment) => BindingOutcome::Rendered(fragment),
            Err(e) => {
                error!(
                    plugin_id = %record.id,
                    point = %point,
                    "component failed during render: {e}"
                );
                BindingOutcome::Failed {
                    message: e.to_string(),
                    placeholder: RenderedFragment::failure_placeholder(&record.name),
                }
            }
        };

        ResolvedBinding {
            plugin: record.identity(),
            priority: record.priority,
            outcome,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
