//! Plugin runtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("bundle load failed for plugin {plugin_id}: {message}")]
    BundleLoad { plugin_id: String, message: String },

    #[error("invalid bundle location: {0}")]
    BundleLocation(String),

    #[error("contract mismatch for plugin {plugin_id}: {message}")]
    ContractMismatch { plugin_id: String, message: String },

    #[error("plugin runtime error in {plugin_id}: {message}")]
    Runtime { plugin_id: String, message: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl PluginError {
    /// Whether the caller may meaningfully retry the failed operation.
    ///
    /// Only transient store outages are retryable; every other kind is
    /// terminal for that operation (bundle failures are retried solely
    /// through explicit invalidation, never automatically).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_store_unavailable() {
        let err = PluginError::StoreUnavailable("connection refused".into());
        assert_eq!(
            err.to_string(),
            "metadata store unavailable: connection refused"
        );
    }

    #[test]
    fn test_display_not_found() {
        let err = PluginError::NotFound("stripe-checkout".into());
        assert_eq!(err.to_string(), "plugin not found: stripe-checkout");
    }

    #[test]
    fn test_display_validation() {
        let err = PluginError::Validation("configuration key too long".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: configuration key too long"
        );
    }

    #[test]
    fn test_display_bundle_load() {
        let err = PluginError::BundleLoad {
            plugin_id: "p1".into(),
            message: "artifact missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "bundle load failed for plugin p1: artifact missing"
        );
    }

    #[test]
    fn test_display_contract_mismatch() {
        let err = PluginError::ContractMismatch {
            plugin_id: "p1".into(),
            message: "implements none of its declared points".into(),
        };
        assert!(err.to_string().contains("contract mismatch"));
        assert!(err.to_string().contains("p1"));
    }

    #[test]
    fn test_display_fuel_exhausted() {
        let err = PluginError::FuelExhausted("slow-plugin".into());
        assert_eq!(
            err.to_string(),
            "execution timeout: plugin slow-plugin exceeded fuel limit"
        );
    }

    #[test]
    fn test_display_wasm_validation() {
        let err = PluginError::WasmValidation("magic bytes mismatch".into());
        assert_eq!(err.to_string(), "WASM validation error: magic bytes mismatch");
    }

    // ── Retryability ──────────────────────────────────────────────────

    #[test]
    fn test_only_store_unavailable_is_retryable() {
        assert!(PluginError::StoreUnavailable("down".into()).is_retryable());
        assert!(!PluginError::NotFound("x".into()).is_retryable());
        assert!(!PluginError::Validation("x".into()).is_retryable());
        assert!(!PluginError::BundleLoad {
            plugin_id: "p".into(),
            message: "m".into()
        }
        .is_retryable());
        assert!(!PluginError::Sandbox("trap".into()).is_retryable());
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("bad json{{{").unwrap_err();
        let err: PluginError = json_err.into();
        assert!(matches!(err, PluginError::Serialization(_)));
    }

    #[test]
    fn test_from_semver_error() {
        let sv_err = "not.a.version".parse::<semver::Version>().unwrap_err();
        let err: PluginError = sv_err.into();
        assert!(matches!(err, PluginError::Semver(_)));
    }

    // ── Error trait source chain ──────────────────────────────────────

    #[test]
    fn test_error_source_serialization() {
        use std::error::Error;
        let json_err = serde_json::from_str::<String>("{").unwrap_err();
        let err: PluginError = json_err.into();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_source_string_variants() {
        use std::error::Error;
        let err = PluginError::Sandbox("trap".into());
        assert!(err.source().is_none());
    }
}
