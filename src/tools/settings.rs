use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::JsonSchema,
};
use serde::{Deserialize, Serialize};

use crate::{
    app::AppState,
    fields::MetadataFieldSet,
    settings::{Backend, GenerationConfig, Language},
    tools::{internal_error, json_result},
};

#[derive(Debug, Serialize, JsonSchema)]
pub struct SettingsView {
    pub backend: &'static str,
    pub license_key_set: bool,
    /// Last four characters only.
    pub license_key: String,
    pub metadata_fields: MetadataFieldSet,
    pub override_metadata: bool,
    pub language: Language,
    pub auto_add_details: bool,
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    let visible = chars.len().min(4).min(chars.len() / 2);
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - visible))
}

impl SettingsView {
    fn new(backend: Backend, config: &GenerationConfig) -> Self {
        Self {
            backend: match backend {
                Backend::OneClickContent => "oneclickcontent",
                Backend::OpenAi => "openai",
            },
            license_key_set: config.has_license_key(),
            license_key: mask_key(config.license_key.trim()),
            metadata_fields: config.metadata_fields,
            override_metadata: config.override_metadata,
            language: config.language,
            auto_add_details: config.auto_add_details,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateSettingsRequest {
    #[schemars(description = "License key (or API key for the direct OpenAI backend); empty string clears it")]
    pub license_key: Option<String>,
    #[schemars(description = "Which fields to manage: title, description, alt_text, caption")]
    pub metadata_fields: Option<MetadataFieldSet>,
    #[schemars(description = "Regenerate fields that already have a value")]
    pub override_metadata: Option<bool>,
    #[schemars(description = "Language code: en, es, fr, de, it, zh or ja")]
    pub language: Option<String>,
    #[schemars(description = "Generate metadata automatically for new uploads")]
    pub auto_add_details: Option<bool>,
}

pub async fn get_settings(state: &AppState) -> Result<CallToolResult, McpError> {
    let config = state
        .pipeline
        .load_config()
        .await
        .map_err(|err| internal_error("load settings failed", err))?;
    json_result(&SettingsView::new(state.pipeline.settings().backend, &config))
}

pub async fn update_settings(
    state: &AppState,
    Parameters(request): Parameters<UpdateSettingsRequest>,
) -> Result<CallToolResult, McpError> {
    let language = match request.language.as_deref() {
        Some(code) => Some(Language::from_code(code.trim()).ok_or_else(|| {
            McpError::invalid_params(
                "unsupported language",
                Some(serde_json::Value::String(code.to_string())),
            )
        })?),
        None => None,
    };

    let mut config = state
        .pipeline
        .load_config()
        .await
        .map_err(|err| internal_error("load settings failed", err))?;
    let key_changed = request
        .license_key
        .as_deref()
        .is_some_and(|key| key.trim() != config.license_key.trim());

    if let Some(key) = request.license_key {
        config.license_key = key;
    }
    if let Some(fields) = request.metadata_fields {
        config.metadata_fields = fields;
    }
    if let Some(flag) = request.override_metadata {
        config.override_metadata = flag;
    }
    if let Some(language) = language {
        config.language = language;
    }
    if let Some(flag) = request.auto_add_details {
        config.auto_add_details = flag;
    }

    config
        .save(state.config_store.as_ref(), state.pipeline.option_keys())
        .await
        .map_err(|err| internal_error("save settings failed", err))?;
    if key_changed {
        state
            .pipeline
            .gate()
            .reset_license_status()
            .await
            .map_err(|err| internal_error("reset license status failed", err))?;
        state
            .usage
            .invalidate()
            .await
            .map_err(|err| internal_error("reset usage cache failed", err))?;
    }

    let saved = GenerationConfig {
        license_key: config.license_key.trim().to_string(),
        ..config
    };
    json_result(&SettingsView::new(state.pipeline.settings().backend, &saved))
}
