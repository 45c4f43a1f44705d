use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fields::MetadataField;
use crate::store::AttachmentId;

/// Error body returned by the metadata service, forwarded to callers as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_url: Option<String>,
}

impl ServiceErrorPayload {
    pub fn is_trial_limit(&self) -> bool {
        self.error.contains("Free trial limit reached")
    }

    pub fn is_usage_limit(&self) -> bool {
        self.error.contains("Usage limit reached")
    }

    pub fn is_license_rejection(&self) -> bool {
        let error = self.error.to_lowercase();
        error.contains("license")
            && ["invalid", "expired", "inactive"]
                .iter()
                .any(|word| error.contains(word))
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No metadata fields require generation, and \"Override Metadata\" is disabled.")]
    NoFieldsNeeded,

    #[error("No image file found for attachment {attachment_id}.")]
    ImageNotFound { attachment_id: AttachmentId },

    #[error("Your free trial has expired. Please activate your license to continue using this feature.")]
    TrialExpired,

    #[error("An API key is required to generate metadata.")]
    MissingApiKey,

    #[error("Failed to communicate with the metadata service.")]
    Transport { details: String },

    #[error("Invalid response from metadata service.")]
    InvalidResponse { details: String },

    #[error("{}", .0.error)]
    ServiceError(ServiceErrorPayload),

    #[error("Metadata processing failed.")]
    MalformedPayload { details: String },

    #[error("Attachment storage failed.")]
    Storage { details: String },
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::NoFieldsNeeded => ErrorKind::NoFieldsNeeded,
            GenerationError::ImageNotFound { .. } => ErrorKind::ImageNotFound,
            GenerationError::TrialExpired => ErrorKind::TrialExpired,
            GenerationError::MissingApiKey => ErrorKind::MissingApiKey,
            GenerationError::Transport { .. } => ErrorKind::Transport,
            GenerationError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            GenerationError::ServiceError(_) => ErrorKind::ServiceError,
            GenerationError::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            GenerationError::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn missing_field(field: MetadataField) -> Self {
        GenerationError::MalformedPayload {
            details: format!("arguments missing string field `{}`", field.key()),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        GenerationError::Storage {
            details: err.to_string(),
        }
    }

    /// Outcomes the user can act on (upgrade, license) rather than retry.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            GenerationError::TrialExpired
                | GenerationError::MissingApiKey
                | GenerationError::ServiceError(_)
                | GenerationError::NoFieldsNeeded
        )
    }

    /// Whether a bulk run should stop after this failure.
    pub fn halts_bulk_run(&self) -> bool {
        match self {
            GenerationError::TrialExpired | GenerationError::MissingApiKey => true,
            GenerationError::ServiceError(payload) => {
                payload.is_trial_limit() || payload.is_usage_limit()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoFieldsNeeded,
    ImageNotFound,
    TrialExpired,
    MissingApiKey,
    Transport,
    InvalidResponse,
    ServiceError,
    MalformedPayload,
    Storage,
}
