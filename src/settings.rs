use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::fields::MetadataFieldSet;
use crate::store::ConfigStore;

const DEFAULT_API_BASE: &str = "https://oneclickcontent.com/wp-json";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_PRODUCT_SLUG: &str = "oneclickcontent-image-meta-generator";
const DEFAULT_HMAC_SALT: &str = "default-salt";
const DEFAULT_SITE_URL: &str = "http://localhost";
const DEFAULT_OPTION_PREFIX: &str = "occidg";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const TIMEOUT_RANGE_SECS: RangeInclusive<u64> = 1..=120;

/// Which remote service the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Licensing proxy with a free-trial endpoint.
    OneClickContent,
    /// Chat completions called directly with the configured key.
    OpenAi,
}

/// Deployment parameters: endpoints, salts and option naming.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub backend: Backend,
    pub api_base: String,
    pub openai_api_base: String,
    pub openai_model: String,
    pub product_slug: String,
    pub hmac_salt: String,
    pub origin_url: String,
    pub timeout: Duration,
    pub option_prefix: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            backend: Backend::OneClickContent,
            api_base: DEFAULT_API_BASE.to_string(),
            openai_api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            product_slug: DEFAULT_PRODUCT_SLUG.to_string(),
            hmac_salt: DEFAULT_HMAC_SALT.to_string(),
            origin_url: DEFAULT_SITE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            option_prefix: DEFAULT_OPTION_PREFIX.to_string(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_timeout(raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow!("REQUEST_TIMEOUT_SECS must be a number of seconds"))?;
    if !TIMEOUT_RANGE_SECS.contains(&secs) {
        return Err(anyhow!(
            "REQUEST_TIMEOUT_SECS must be between {} and {} seconds, got {secs}",
            TIMEOUT_RANGE_SECS.start(),
            TIMEOUT_RANGE_SECS.end()
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn validate_http_url(name: &str, raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).map_err(|err| anyhow!("{name} is not a valid URL: {err}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.trim_end_matches('/').to_string()),
        scheme => Err(anyhow!("{name} must use http or https, got {scheme}")),
    }
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let backend = match env_value("METADATA_BACKEND").as_deref() {
            None | Some("oneclickcontent") => Backend::OneClickContent,
            Some("openai") => Backend::OpenAi,
            Some(other) => return Err(anyhow!("unknown METADATA_BACKEND: {other}")),
        };
        let timeout = match env_value("REQUEST_TIMEOUT_SECS") {
            Some(raw) => parse_timeout(&raw)?,
            None => defaults.timeout,
        };
        let api_base = env_value("METADATA_API_BASE").unwrap_or(defaults.api_base);
        let openai_api_base = env_value("OPENAI_API_BASE").unwrap_or(defaults.openai_api_base);
        let origin_url = env_value("SITE_URL").unwrap_or(defaults.origin_url);

        Ok(Self {
            backend,
            api_base: validate_http_url("METADATA_API_BASE", &api_base)?,
            openai_api_base: validate_http_url("OPENAI_API_BASE", &openai_api_base)?,
            openai_model: env_value("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            product_slug: env_value("PRODUCT_SLUG").unwrap_or(defaults.product_slug),
            hmac_salt: env_value("HMAC_SALT").unwrap_or(defaults.hmac_salt),
            origin_url: validate_http_url("SITE_URL", &origin_url)?,
            timeout,
            option_prefix: env_value("OPTION_PREFIX").unwrap_or(defaults.option_prefix),
        })
    }

    pub fn option_keys(&self) -> OptionKeys {
        OptionKeys::new(&self.option_prefix)
    }
}

/// Option names, all derived from one per-product prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionKeys {
    prefix: String,
}

impl OptionKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    pub fn license_key(&self) -> String {
        self.key("license_key")
    }

    pub fn metadata_fields(&self) -> String {
        self.key("metadata_fields")
    }

    pub fn override_metadata(&self) -> String {
        self.key("override_metadata")
    }

    pub fn language(&self) -> String {
        self.key("language")
    }

    pub fn auto_add_details(&self) -> String {
        self.key("auto_add_details")
    }

    pub fn license_status(&self) -> String {
        self.key("license_status")
    }

    pub fn trial_expired(&self) -> String {
        self.key("trial_expired")
    }

    pub fn trial_usage(&self) -> String {
        self.key("trial_usage")
    }

    pub fn image_error(&self) -> String {
        self.key("image_error")
    }

    pub fn usage_data(&self) -> String {
        self.key("usage_data")
    }
}

impl Default for OptionKeys {
    fn default() -> Self {
        Self::new(DEFAULT_OPTION_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
    Fr,
    De,
    It,
    Zh,
    Ja,
}

impl Language {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "en" => Some(Language::En),
            "es" => Some(Language::Es),
            "fr" => Some(Language::Fr),
            "de" => Some(Language::De),
            "it" => Some(Language::It),
            "zh" => Some(Language::Zh),
            "ja" => Some(Language::Ja),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
            Language::Fr => "fr",
            Language::De => "de",
            Language::It => "it",
            Language::Zh => "zh",
            Language::Ja => "ja",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::En => "English",
            Language::Es => "Spanish",
            Language::Fr => "French",
            Language::De => "German",
            Language::It => "Italian",
            Language::Zh => "Chinese",
            Language::Ja => "Japanese",
        }
    }
}

/// Persisted generation options, read at the start of every generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub license_key: String,
    pub metadata_fields: MetadataFieldSet,
    pub override_metadata: bool,
    pub language: Language,
    pub auto_add_details: bool,
}

async fn read_bool(store: &dyn ConfigStore, key: &str) -> Result<bool> {
    Ok(store.get_or(key, json!(false)).await?.as_bool().unwrap_or(false))
}

impl GenerationConfig {
    pub fn has_license_key(&self) -> bool {
        !self.license_key.trim().is_empty()
    }

    pub async fn load(store: &dyn ConfigStore, keys: &OptionKeys) -> Result<Self> {
        let license_key = store
            .get(&keys.license_key())
            .await?
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        let metadata_fields = store
            .get(&keys.metadata_fields())
            .await?
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let language = store
            .get(&keys.language())
            .await?
            .and_then(|value| value.as_str().and_then(Language::from_code))
            .unwrap_or_default();

        Ok(Self {
            license_key,
            metadata_fields,
            override_metadata: read_bool(store, &keys.override_metadata()).await?,
            language,
            auto_add_details: read_bool(store, &keys.auto_add_details()).await?,
        })
    }

    pub async fn save(&self, store: &dyn ConfigStore, keys: &OptionKeys) -> Result<()> {
        store
            .set(&keys.license_key(), Value::String(self.license_key.trim().to_string()))
            .await?;
        store
            .set(&keys.metadata_fields(), serde_json::to_value(self.metadata_fields)?)
            .await?;
        store
            .set(&keys.override_metadata(), Value::Bool(self.override_metadata))
            .await?;
        store
            .set(&keys.language(), Value::String(self.language.code().to_string()))
            .await?;
        store
            .set(&keys.auto_add_details(), Value::Bool(self.auto_add_details))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::MetadataField;
    use crate::store::FileConfigStore;

    #[tokio::test]
    async fn missing_options_fall_back_to_install_defaults() {
        let store = FileConfigStore::in_memory();
        let config = GenerationConfig::load(&store, &OptionKeys::default()).await.unwrap();
        assert_eq!(config, GenerationConfig::default());
        assert!(!config.has_license_key());
        assert!(config.metadata_fields.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = FileConfigStore::in_memory();
        let keys = OptionKeys::new("oneclick_images");
        let config = GenerationConfig {
            license_key: " abc-123 ".to_string(),
            metadata_fields: MetadataFieldSet::of(&[MetadataField::AltText, MetadataField::Caption]),
            override_metadata: true,
            language: Language::Ja,
            auto_add_details: true,
        };

        config.save(&store, &keys).await.unwrap();
        let loaded = GenerationConfig::load(&store, &keys).await.unwrap();

        assert_eq!(loaded.license_key, "abc-123");
        assert_eq!(loaded.metadata_fields, config.metadata_fields);
        assert!(loaded.override_metadata && loaded.auto_add_details);
        assert_eq!(loaded.language, Language::Ja);
        assert_eq!(
            store.get("oneclick_images_override_metadata").await.unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn string_flags_are_not_booleans() {
        let store = FileConfigStore::in_memory();
        let keys = OptionKeys::default();
        store.set(&keys.override_metadata(), json!("1")).await.unwrap();
        store.set(&keys.language(), json!("xx")).await.unwrap();

        let config = GenerationConfig::load(&store, &keys).await.unwrap();
        assert!(!config.override_metadata);
        assert_eq!(config.language, Language::En);
    }

    #[test]
    fn languages_map_codes_to_labels() {
        assert_eq!(Language::from_code("de").map(Language::label), Some("German"));
        assert_eq!(Language::from_code("pt"), None);
        assert_eq!(Language::Zh.code(), "zh");
    }

    #[test]
    fn request_timeout_stays_within_seconds() {
        assert_eq!(parse_timeout("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_timeout(" 120 ").unwrap(), Duration::from_secs(120));
        for raw in ["0", "121", "3600", "-5", "ten"] {
            assert!(parse_timeout(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn option_keys_share_prefix() {
        let keys = OptionKeys::new("occ_images");
        assert_eq!(keys.trial_expired(), "occ_images_trial_expired");
        assert_eq!(keys.image_error(), "occ_images_image_error");
    }
}
