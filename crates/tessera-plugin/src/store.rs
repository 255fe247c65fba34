//! Metadata store client.
//!
//! Plugin records are persisted by the admin backend; this runtime only
//! consumes them. [`MetadataStore`] is the seam, [`HttpMetadataStore`] the
//! production adapter against the backend's REST surface.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::error::PluginError;
use crate::record::PluginRecord;
use tessera_plugin_api::PluginConfig;

/// Default request timeout against the metadata store, in seconds.
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// The four operations the runtime needs from the metadata store.
///
/// `StoreUnavailable` is the only retryable failure; `NotFound` and
/// `Validation` are terminal for the operation that raised them.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// All plugin records installed for one tenant.
    async fn list_plugins(&self, tenant_id: &str) -> Result<Vec<PluginRecord>, PluginError>;

    /// One plugin record by id.
    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError>;

    /// Persist the enabled flag.
    async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PluginError>;

    /// Persist a full replacement of the tenant-scoped configuration.
    async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: &PluginConfig,
    ) -> Result<(), PluginError>;
}

// ─── HTTP adapter ───────────────────────────────────────────────────────

/// Reqwest-backed adapter for the admin backend's plugin endpoints.
pub struct HttpMetadataStore {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpMetadataStore {
    /// Build an adapter for the given base URL.
    ///
    /// The request timeout comes from `TESSERA_STORE_TIMEOUT_SECS`
    /// (default 10).
    pub fn new(base_url: &str) -> Result<Self, PluginError> {
        let timeout_secs = std::env::var("TESSERA_STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_STORE_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PluginError::StoreUnavailable(format!("http client: {e}")))?;

        Self::with_client(http, base_url)
    }

    /// Build an adapter reusing an existing client (shared pools).
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, PluginError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PluginError::StoreUnavailable(format!("invalid store URL: {e}")))?;
        Ok(Self { http, base_url })
    }

    /// Read the base URL from `TESSERA_STORE_URL`.
    pub fn from_env() -> Result<Self, PluginError> {
        let base_url = std::env::var("TESSERA_STORE_URL").map_err(|_| {
            PluginError::StoreUnavailable("TESSERA_STORE_URL is not set".into())
        })?;
        Self::new(&base_url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PluginError> {
        self.base_url
            .join(path)
            .map_err(|e| PluginError::StoreUnavailable(format!("invalid store path: {e}")))
    }

    async fn check_status(
        response: reqwest::Response,
        plugin_id: &str,
    ) -> Result<reqwest::Response, PluginError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_error_status(status, plugin_id, &body))
    }
}

/// Map a non-success store status to the error taxonomy.
///
/// 404 means the plugin id is unknown; 400/422 mean the payload was
/// rejected; everything else (including 5xx) is a transient store fault.
fn map_error_status(status: StatusCode, plugin_id: &str, body: &str) -> PluginError {
    match status {
        StatusCode::NOT_FOUND => PluginError::NotFound(plugin_id.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PluginError::Validation(if body.is_empty() {
                format!("store rejected request for plugin '{plugin_id}'")
            } else {
                body.to_string()
            })
        }
        other => PluginError::StoreUnavailable(format!("store returned {other}")),
    }
}

fn map_transport(err: reqwest::Error) -> PluginError {
    PluginError::StoreUnavailable(err.to_string())
}

#[async_trait]
impl MetadataStore for HttpMetadataStore {
    async fn list_plugins(&self, tenant_id: &str) -> Result<Vec<PluginRecord>, PluginError> {
        let url = self.endpoint(&format!("api/tenants/{tenant_id}/plugins"))?;
        let response = self.http.get(url).send().await.map_err(map_transport)?;
        let response = Self::check_status(response, "").await?;
        response
            .json::<Vec<PluginRecord>>()
            .await
            .map_err(|e| PluginError::StoreUnavailable(format!("malformed plugin list: {e}")))
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginRecord, PluginError> {
        let url = self.endpoint(&format!("api/plugins/{plugin_id}"))?;
        let response = self.http.get(url).send().await.map_err(map_transport)?;
        let response = Self::check_status(response, plugin_id).await?;
        response
            .json::<PluginRecord>()
            .await
            .map_err(|e| PluginError::StoreUnavailable(format!("malformed plugin record: {e}")))
    }

    async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PluginError> {
        let url = self.endpoint(&format!("api/plugins/{plugin_id}/enabled"))?;
        let response = self
            .http
            .patch(url)
            .json(&serde_json::json!({ "enabled": enabled }))
            .send()
            .await
            .map_err(map_transport)?;
        Self::check_status(response, plugin_id).await?;
        Ok(())
    }

    async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: &PluginConfig,
    ) -> Result<(), PluginError> {
        let url = self.endpoint(&format!("api/plugins/{plugin_id}/configuration"))?;
        let response = self
            .http
            .put(url)
            .json(configuration)
            .send()
            .await
            .map_err(map_transport)?;
        Self::check_status(response, plugin_id).await?;
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_status_not_found() {
        let err = map_error_status(StatusCode::NOT_FOUND, "plg_1", "");
        assert!(matches!(err, PluginError::NotFound(id) if id == "plg_1"));
    }

    #[test]
    fn test_map_error_status_validation() {
        let err = map_error_status(StatusCode::UNPROCESSABLE_ENTITY, "plg_1", "bad key");
        assert!(matches!(err, PluginError::Validation(msg) if msg == "bad key"));

        let err = map_error_status(StatusCode::BAD_REQUEST, "plg_1", "");
        assert!(matches!(err, PluginError::Validation(msg) if msg.contains("plg_1")));
    }

    #[test]
    fn test_map_error_status_server_fault_is_retryable() {
        let err = map_error_status(StatusCode::INTERNAL_SERVER_ERROR, "plg_1", "boom");
        assert!(matches!(err, PluginError::StoreUnavailable(_)));
        assert!(err.is_retryable());

        let err = map_error_status(StatusCode::BAD_GATEWAY, "plg_1", "");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let store =
            HttpMetadataStore::with_client(reqwest::Client::new(), "https://admin.example.com/")
                .unwrap();
        let url = store.endpoint("api/tenants/t1/plugins").unwrap();
        assert_eq!(
            url.as_str(),
            "https://admin.example.com/api/tenants/t1/plugins"
        );
    }

    #[test]
    fn test_with_client_rejects_invalid_base() {
        let result = HttpMetadataStore::with_client(reqwest::Client::new(), "not a url");
        assert!(matches!(result, Err(PluginError::StoreUnavailable(_))));
    }
}
