use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{GenerationError, ServiceErrorPayload};
use crate::response::GeneratedMetadata;
use crate::settings::{Backend, GenerationConfig, OptionKeys};
use crate::store::ConfigStore;

const IMAGE_ERROR_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

/// Licensing and trial state, persisted between generations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageState {
    pub license_status: LicenseStatus,
    pub trial_expired: bool,
    pub trial_usage: u64,
}

#[derive(Debug)]
pub enum Preflight {
    Allowed,
    Denied(GenerationError),
}

/// Decides locally whether a generation may be attempted. The service still has the final say.
pub fn preflight(backend: Backend, config: &GenerationConfig, usage: &UsageState) -> Preflight {
    if config.has_license_key() {
        return Preflight::Allowed;
    }
    match backend {
        Backend::OpenAi => Preflight::Denied(GenerationError::MissingApiKey),
        Backend::OneClickContent if usage.trial_expired => Preflight::Denied(GenerationError::TrialExpired),
        Backend::OneClickContent => Preflight::Allowed,
    }
}

/// Last usage-limit error from a background generation, shown on a later page load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageErrorNotice {
    pub message: String,
    pub ad_url: String,
}

pub struct UsageGate {
    store: Arc<dyn ConfigStore>,
    keys: OptionKeys,
    backend: Backend,
}

impl UsageGate {
    pub fn new(store: Arc<dyn ConfigStore>, keys: OptionKeys, backend: Backend) -> Self {
        Self { store, keys, backend }
    }

    pub async fn usage_state(&self) -> Result<UsageState> {
        let store = self.store.as_ref();
        let license_status = store
            .get(&self.keys.license_status())
            .await?
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let trial_expired = store
            .get_or(&self.keys.trial_expired(), json!(false))
            .await?
            .as_bool()
            .unwrap_or(false);
        let trial_usage = store
            .get_or(&self.keys.trial_usage(), json!(0))
            .await?
            .as_u64()
            .unwrap_or(0);
        Ok(UsageState {
            license_status,
            trial_expired,
            trial_usage,
        })
    }

    pub async fn preflight(&self, config: &GenerationConfig) -> Result<Preflight> {
        let usage = self.usage_state().await?;
        Ok(preflight(self.backend, config, &usage))
    }

    /// Applies the authoritative signals carried by a finished generation.
    pub async fn record_outcome(
        &self,
        config: &GenerationConfig,
        outcome: &Result<GeneratedMetadata, GenerationError>,
    ) -> Result<()> {
        let keyed = config.has_license_key();
        match outcome {
            Ok(_) if !keyed && self.backend == Backend::OneClickContent => {
                let usage = self.usage_state().await?;
                self.store
                    .set(&self.keys.trial_usage(), json!(usage.trial_usage + 1))
                    .await?;
            }
            Err(GenerationError::ServiceError(payload)) if !keyed && payload.is_trial_limit() => {
                info!("free trial limit reached, marking trial expired");
                self.store.set(&self.keys.trial_expired(), json!(true)).await?;
            }
            Err(GenerationError::ServiceError(payload)) if keyed && payload.is_license_rejection() => {
                warn!(error = %payload.error, "license rejected by metadata service");
                self.store
                    .set(
                        &self.keys.license_status(),
                        serde_json::to_value(LicenseStatus::Inactive)?,
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// A new key has not been judged by the service yet.
    pub async fn reset_license_status(&self) -> Result<()> {
        self.store
            .set(
                &self.keys.license_status(),
                serde_json::to_value(LicenseStatus::Unknown)?,
            )
            .await
    }

    /// Keeps a usage-limit error around for five minutes so a later request can show it.
    pub async fn remember_usage_limit(&self, payload: &ServiceErrorPayload) -> Result<bool> {
        if !payload.is_usage_limit() {
            return Ok(false);
        }
        let notice = ImageErrorNotice {
            message: payload.message.clone().unwrap_or_default(),
            ad_url: payload.ad_url.clone().unwrap_or_default(),
        };
        self.store
            .set_transient(&self.keys.image_error(), serde_json::to_value(notice)?, IMAGE_ERROR_TTL)
            .await?;
        Ok(true)
    }

    pub async fn image_error(&self) -> Result<Option<ImageErrorNotice>> {
        Ok(self
            .store
            .get_transient(&self.keys.image_error())
            .await?
            .and_then(|value: Value| serde_json::from_value(value).ok()))
    }

    pub async fn clear_image_error(&self) -> Result<()> {
        self.store.delete_transient(&self.keys.image_error()).await
    }
}
