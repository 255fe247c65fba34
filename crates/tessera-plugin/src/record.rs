//! Plugin records and cache keys.
//!
//! A [`PluginRecord`] is the identity-and-policy row for one installed
//! plugin in one tenant, as served by the metadata store (camelCase JSON
//! from the admin backend). Records are owned by the registry; everything
//! else reads immutable snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use tessera_plugin_api::{validate_slot_name, PluginConfig, PluginIdentity};

/// Upper bound on configuration entries per plugin.
const MAX_CONFIG_ENTRIES: usize = 128;

/// Upper bound on a configuration's serialized size: 16 KiB.
const MAX_CONFIG_SERIALIZED_BYTES: usize = 16 * 1024;

/// Identity and policy for one installed plugin, scoped to a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Stable identifier, unique within the tenant.
    pub id: String,
    pub name: String,
    /// Semver version; participates in the module cache key.
    pub version: String,
    /// Opaque locator the bundle loader resolves to executable code.
    pub bundle_location: String,
    /// Extension points this plugin claims to implement.
    #[serde(default)]
    pub declared_extension_points: Vec<String>,
    /// Dashboard widget areas this plugin contributes to.
    #[serde(default)]
    pub declared_widgets: Vec<String>,
    /// Admin component slots this plugin contributes to.
    #[serde(default)]
    pub declared_components: Vec<String>,
    /// Disabled plugins stay in the catalog but never resolve.
    #[serde(default)]
    pub enabled: bool,
    /// Tenant-scoped settings passed to the plugin's components.
    #[serde(default)]
    pub configuration: PluginConfig,
    /// Higher priority renders first; ties break by id ascending.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Module cache key: one loaded module per plugin id and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub plugin_id: String,
    pub version: String,
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.plugin_id, self.version)
    }
}

impl PluginRecord {
    pub fn module_key(&self) -> ModuleKey {
        ModuleKey {
            plugin_id: self.id.clone(),
            version: self.version.clone(),
        }
    }

    /// Read-only identity passed to components at render time.
    pub fn identity(&self) -> PluginIdentity {
        PluginIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// Validate a record as served by the metadata store.
    ///
    /// The catalog skips (and logs) records that fail here rather than
    /// refusing the whole fetch.
    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_id(&self.id)?;

        validate_slot_name(&self.name)
            .map_err(|e| PluginError::Validation(format!("plugin name '{}': {e}", self.name)))?;

        semver::Version::parse(&self.version).map_err(|_| {
            PluginError::Validation(format!(
                "plugin '{}' version is not valid semver: '{}'",
                self.id, self.version
            ))
        })?;

        if self.bundle_location.is_empty() {
            return Err(PluginError::Validation(format!(
                "plugin '{}' has an empty bundle location",
                self.id
            )));
        }

        for declared in self
            .declared_extension_points
            .iter()
            .chain(&self.declared_widgets)
            .chain(&self.declared_components)
        {
            validate_slot_name(declared).map_err(|e| {
                PluginError::Validation(format!(
                    "plugin '{}' declares slot '{declared}': {e}",
                    self.id
                ))
            })?;
        }

        validate_configuration(&self.configuration)
    }
}

/// Validate a plugin id: non-empty, no whitespace, at most 128 characters.
///
/// Ids are minted by the metadata store and treated as opaque beyond these
/// bounds (they key cache entries and sort orders).
pub fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    if id.is_empty() || id.len() > 128 {
        return Err(PluginError::Validation(format!(
            "plugin id must be 1-128 characters, got {}",
            id.len()
        )));
    }
    if id.chars().any(|c| c.is_whitespace()) {
        return Err(PluginError::Validation(format!(
            "plugin id must not contain whitespace: '{id}'"
        )));
    }
    Ok(())
}

/// Validate a tenant-scoped configuration object.
///
/// Keys are `[a-z0-9_-]`, 1-64 characters; the whole object caps at
/// [`MAX_CONFIG_ENTRIES`] entries and [`MAX_CONFIG_SERIALIZED_BYTES`]
/// serialized.
pub fn validate_configuration(configuration: &PluginConfig) -> Result<(), PluginError> {
    if configuration.len() > MAX_CONFIG_ENTRIES {
        return Err(PluginError::Validation(format!(
            "configuration has {} entries (max {MAX_CONFIG_ENTRIES})",
            configuration.len()
        )));
    }

    for key in configuration.keys() {
        let len = key.len();
        if !(1..=64).contains(&len) {
            return Err(PluginError::Validation(format!(
                "configuration key must be 1-64 characters, got {len}"
            )));
        }
        for ch in key.chars() {
            if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '_' && ch != '-' {
                return Err(PluginError::Validation(format!(
                    "configuration key '{key}' contains invalid character '{ch}'"
                )));
            }
        }
    }

    let serialized = serde_json::to_vec(configuration)?;
    if serialized.len() > MAX_CONFIG_SERIALIZED_BYTES {
        return Err(PluginError::Validation(format!(
            "configuration is {} bytes serialized (max {MAX_CONFIG_SERIALIZED_BYTES})",
            serialized.len()
        )));
    }

    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_record;

    // ── Wire format ───────────────────────────────────────────────────

    #[test]
    fn test_deserialize_camel_case_wire_record() {
        let json = r#"{
            "id": "plg_7f3a",
            "name": "stripe-checkout",
            "version": "2.0.0",
            "bundleLocation": "https://bundles.example.com/stripe/2.0.0/plugin.wasm",
            "declaredExtensionPoints": ["payment-methods", "checkout-summary"],
            "enabled": true,
            "configuration": {"publishable_key": "pk_live"},
            "priority": 10
        }"#;

        let record: PluginRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "plg_7f3a");
        assert_eq!(
            record.declared_extension_points,
            vec!["payment-methods", "checkout-summary"]
        );
        assert!(record.declared_widgets.is_empty());
        assert_eq!(record.priority, 10);
        assert_eq!(record.configuration["publishable_key"], "pk_live");
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "id": "plg_1",
            "name": "mailer",
            "version": "0.1.0",
            "bundleLocation": "https://bundles.example.com/mailer.wasm"
        }"#;

        let record: PluginRecord = serde_json::from_str(json).unwrap();
        assert!(!record.enabled);
        assert_eq!(record.priority, 0);
        assert!(record.configuration.is_empty());
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn test_serialize_is_camel_case() {
        let record = sample_record("plg_1");
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("bundleLocation").is_some());
        assert!(value.get("declaredExtensionPoints").is_some());
        assert!(value.get("bundle_location").is_none());
    }

    // ── Keys and identity ─────────────────────────────────────────────

    #[test]
    fn test_module_key_display() {
        let key = sample_record("plg_1").module_key();
        assert_eq!(key.to_string(), "plg_1@1.2.3");
    }

    #[test]
    fn test_module_key_distinguishes_versions() {
        let mut a = sample_record("plg_1");
        let mut b = sample_record("plg_1");
        a.version = "1.0.0".into();
        b.version = "2.0.0".into();
        assert_ne!(a.module_key(), b.module_key());
    }

    #[test]
    fn test_identity_fields() {
        let identity = sample_record("plg_1").identity();
        assert_eq!(identity.id, "plg_1");
        assert_eq!(identity.name, "stripe-checkout");
        assert_eq!(identity.version, "1.2.3");
    }

    // ── Record validation ─────────────────────────────────────────────

    #[test]
    fn test_validate_sample_record() {
        assert!(sample_record("plg_1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut record = sample_record("plg_1");
        record.version = "latest".into();
        let err = record.validate().unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
        assert!(err.to_string().contains("semver"));
    }

    #[test]
    fn test_validate_rejects_empty_bundle_location() {
        let mut record = sample_record("plg_1");
        record.bundle_location = String::new();
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("bundle location"));
    }

    #[test]
    fn test_validate_rejects_bad_declared_slot() {
        let mut record = sample_record("plg_1");
        record.declared_widgets = vec!["Dashboard Main".into()];
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("Dashboard Main"));
    }

    #[test]
    fn test_validate_rejects_bad_name() {
        let mut record = sample_record("plg_1");
        record.name = "Stripe!".into();
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_validate_plugin_id_bounds() {
        assert!(validate_plugin_id("plg_1").is_ok());
        assert!(validate_plugin_id("").is_err());
        assert!(validate_plugin_id(&"x".repeat(129)).is_err());
        assert!(validate_plugin_id("has space").is_err());
    }

    // ── Configuration validation ──────────────────────────────────────

    #[test]
    fn test_validate_configuration_ok() {
        let mut config = PluginConfig::new();
        config.insert("api_key".into(), serde_json::json!("sk_test"));
        config.insert("retries-max".into(), serde_json::json!(3));
        assert!(validate_configuration(&config).is_ok());
    }

    #[test]
    fn test_validate_configuration_rejects_bad_key() {
        let mut config = PluginConfig::new();
        config.insert("Api Key".into(), serde_json::json!("x"));
        let err = validate_configuration(&config).unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
    }

    #[test]
    fn test_validate_configuration_rejects_empty_key() {
        let mut config = PluginConfig::new();
        config.insert("".into(), serde_json::json!("x"));
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn test_validate_configuration_rejects_too_many_entries() {
        let mut config = PluginConfig::new();
        for i in 0..129 {
            config.insert(format!("key_{i}"), serde_json::json!(i));
        }
        let err = validate_configuration(&config).unwrap_err();
        assert!(err.to_string().contains("entries"));
    }

    #[test]
    fn test_validate_configuration_rejects_oversized_value() {
        let mut config = PluginConfig::new();
        config.insert("blob".into(), serde_json::json!("x".repeat(17 * 1024)));
        let err = validate_configuration(&config).unwrap_err();
        assert!(err.to_string().contains("bytes"));
    }
}
