use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::settings::{GenerationConfig, OptionKeys, ServiceSettings};
use crate::service::MetadataTransport;
use crate::store::ConfigStore;

pub const TRIAL_LIMIT: u64 = 10;
const CHECK_USAGE_PATH: &str = "/subscriber/v1/check-usage";
const CHECK_USAGE_TIMEOUT: Duration = Duration::from_secs(5);
const USAGE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Image quota as last reported by the licensing service, or the local trial counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageSummary {
    /// `true` only when the figures came from the licensing service.
    pub success: bool,
    pub used_count: u64,
    pub usage_limit: u64,
    pub addon_count: u64,
    pub remaining_count: u64,
}

impl UsageSummary {
    pub fn trial(trial_usage: u64) -> Self {
        Self {
            success: false,
            used_count: trial_usage,
            usage_limit: TRIAL_LIMIT,
            addon_count: 0,
            remaining_count: TRIAL_LIMIT.saturating_sub(trial_usage),
        }
    }

    fn adopt_remote(&self, body: &Value) -> Self {
        Self {
            success: true,
            used_count: count(body, "used_count").unwrap_or(self.used_count),
            usage_limit: count(body, "usage_limit").unwrap_or(self.usage_limit),
            addon_count: count(body, "addon_count").unwrap_or(0),
            remaining_count: count(body, "remaining_count").unwrap_or(self.remaining_count),
        }
    }
}

fn count(body: &Value, key: &str) -> Option<u64> {
    let value = body.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
}

pub struct UsageReporter {
    transport: Arc<dyn MetadataTransport>,
    store: Arc<dyn ConfigStore>,
    settings: ServiceSettings,
    keys: OptionKeys,
}

impl UsageReporter {
    pub fn new(transport: Arc<dyn MetadataTransport>, store: Arc<dyn ConfigStore>, settings: ServiceSettings) -> Self {
        let keys = settings.option_keys();
        Self {
            transport,
            store,
            settings,
            keys,
        }
    }

    /// Returns the cached summary, refreshing it at most once an hour.
    pub async fn usage(&self, config: &GenerationConfig) -> Result<UsageSummary> {
        let cache_key = self.keys.usage_data();
        if let Some(cached) = self.store.get_transient(&cache_key).await? {
            if let Ok(summary) = serde_json::from_value::<UsageSummary>(cached) {
                debug!("usage summary served from cache");
                return Ok(summary);
            }
        }

        let trial_usage = self
            .store
            .get_or(&self.keys.trial_usage(), json!(0))
            .await?
            .as_u64()
            .unwrap_or(0);
        let mut summary = UsageSummary::trial(trial_usage);

        if config.has_license_key() {
            match self.check_remote(config).await {
                Ok(body) if body.get("success").is_some_and(is_truthy) => {
                    summary = summary.adopt_remote(&body);
                    self.store.delete(&self.keys.trial_expired()).await?;
                }
                Ok(_) => debug!("licensing service reported no usage data"),
                Err(err) => warn!("usage check failed, reporting trial figures: {err:#}"),
            }
        }

        self.store
            .set_transient(&cache_key, serde_json::to_value(&summary)?, USAGE_CACHE_TTL)
            .await?;
        Ok(summary)
    }

    /// Drops the cached summary so the next call asks the service again.
    pub async fn invalidate(&self) -> Result<()> {
        self.store.delete_transient(&self.keys.usage_data()).await
    }

    async fn check_remote(&self, config: &GenerationConfig) -> Result<Value> {
        let url = format!("{}{CHECK_USAGE_PATH}", self.settings.api_base);
        let body = json!({
            "license_key": config.license_key.trim(),
            "origin_url": self.settings.origin_url,
            "product_slug": self.settings.product_slug,
        });
        let headers = [("Content-Type".to_string(), "application/json".to_string())];
        let response = self
            .transport
            .post_json(&url, &headers, &body, CHECK_USAGE_TIMEOUT)
            .await?;
        if !(200..300).contains(&response.status) {
            return Err(anyhow!("check-usage returned HTTP {}", response.status));
        }
        Ok(serde_json::from_str(&response.body)?)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty() && text != "0",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::TransportResponse;
    use crate::store::FileConfigStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedTransport {
        reply: Result<TransportResponse, String>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl CannedTransport {
        fn new(reply: Result<TransportResponse, String>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetadataTransport for CannedTransport {
        async fn post_json(
            &self,
            url: &str,
            _headers: &[(String, String)],
            body: &Value,
            _timeout: Duration,
        ) -> Result<TransportResponse> {
            self.calls.lock().unwrap().push((url.to_string(), body.clone()));
            self.reply.clone().map_err(|err| anyhow!(err))
        }
    }

    fn ok_body(body: Value) -> Result<TransportResponse, String> {
        Ok(TransportResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn licensed() -> GenerationConfig {
        GenerationConfig {
            license_key: "lic-1".to_string(),
            ..GenerationConfig::default()
        }
    }

    fn reporter(transport: Arc<CannedTransport>) -> (UsageReporter, Arc<FileConfigStore>) {
        let store = Arc::new(FileConfigStore::in_memory());
        let settings = ServiceSettings {
            origin_url: "https://example.com".to_string(),
            ..ServiceSettings::default()
        };
        (UsageReporter::new(transport, store.clone(), settings), store)
    }

    #[tokio::test]
    async fn trial_sites_report_local_counter_without_calling_out() {
        let transport = CannedTransport::new(Err("unused".to_string()));
        let (reporter, store) = reporter(transport.clone());
        store.set("occidg_trial_usage", json!(4)).await.unwrap();

        let summary = reporter.usage(&GenerationConfig::default()).await.unwrap();

        assert_eq!(summary, UsageSummary::trial(4));
        assert_eq!(summary.remaining_count, 6);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn licensed_sites_adopt_remote_counts_and_cache_them() {
        let transport = CannedTransport::new(ok_body(json!({
            "success": true,
            "used_count": 12,
            "usage_limit": "100",
            "addon_count": 5,
            "remaining_count": 93
        })));
        let (reporter, store) = reporter(transport.clone());
        store.set("occidg_trial_expired", json!(true)).await.unwrap();

        let first = reporter.usage(&licensed()).await.unwrap();
        let second = reporter.usage(&licensed()).await.unwrap();

        assert_eq!(
            first,
            UsageSummary {
                success: true,
                used_count: 12,
                usage_limit: 100,
                addon_count: 5,
                remaining_count: 93,
            }
        );
        assert_eq!(first, second);
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "https://oneclickcontent.com/wp-json/subscriber/v1/check-usage");
        assert_eq!(calls[0].1["license_key"], "lic-1");
        assert_eq!(store.get("occidg_trial_expired").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failures_fall_back_to_trial_figures() {
        for reply in [
            Err("timed out".to_string()),
            ok_body(json!({"success": false, "error": "Invalid license"})),
            Ok(TransportResponse {
                status: 500,
                body: "oops".to_string(),
            }),
        ] {
            let (reporter, store) = reporter(CannedTransport::new(reply));
            store.set("occidg_trial_expired", json!(true)).await.unwrap();

            let summary = reporter.usage(&licensed()).await.unwrap();

            assert_eq!(summary, UsageSummary::trial(0));
            assert_eq!(store.get("occidg_trial_expired").await.unwrap(), Some(json!(true)));
        }
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_check() {
        let transport = CannedTransport::new(ok_body(json!({"success": 1, "used_count": 3})));
        let (reporter, _) = reporter(transport.clone());

        reporter.usage(&licensed()).await.unwrap();
        reporter.invalidate().await.unwrap();
        let summary = reporter.usage(&licensed()).await.unwrap();

        assert_eq!(transport.calls().len(), 2);
        assert_eq!(summary.used_count, 3);
        assert_eq!(summary.usage_limit, TRIAL_LIMIT);
    }
}
