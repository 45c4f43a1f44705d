use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use rmcp::schemars::JsonSchema;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, GenerationError};
use crate::fields::resolve_fields_to_generate;
use crate::gate::{Preflight, UsageGate};
use crate::image_processing::{ImageCodec, resolve_image};
use crate::prompt::{DEFAULT_INSTRUCTION_TEMPLATE, build_request};
use crate::response::{GeneratedMetadata, Sanitizer, TextFieldSanitizer, process_response};
use crate::service::{MetadataTransport, RemoteInvoker};
use crate::settings::{GenerationConfig, OptionKeys, ServiceSettings};
use crate::store::{AttachmentId, AttachmentStore, ConfigStore};

/// Generates metadata for one attachment and writes the requested fields back.
pub struct MetadataPipeline {
    attachments: Arc<dyn AttachmentStore>,
    config_store: Arc<dyn ConfigStore>,
    codec: Arc<dyn ImageCodec>,
    invoker: RemoteInvoker,
    gate: UsageGate,
    sanitizer: Arc<dyn Sanitizer>,
    keys: OptionKeys,
    instruction_template: String,
}

impl MetadataPipeline {
    pub fn new(
        attachments: Arc<dyn AttachmentStore>,
        config_store: Arc<dyn ConfigStore>,
        codec: Arc<dyn ImageCodec>,
        transport: Arc<dyn MetadataTransport>,
        settings: ServiceSettings,
    ) -> Self {
        let keys = settings.option_keys();
        let gate = UsageGate::new(config_store.clone(), keys.clone(), settings.backend);
        Self {
            attachments,
            config_store,
            codec,
            invoker: RemoteInvoker::new(transport, settings),
            gate,
            sanitizer: Arc::new(TextFieldSanitizer),
            keys,
            instruction_template: DEFAULT_INSTRUCTION_TEMPLATE.to_string(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// `{language}` in the template is replaced by the configured language label.
    pub fn with_instruction_template(mut self, template: impl Into<String>) -> Self {
        self.instruction_template = template.into();
        self
    }

    pub fn gate(&self) -> &UsageGate {
        &self.gate
    }

    pub fn option_keys(&self) -> &OptionKeys {
        &self.keys
    }

    pub fn settings(&self) -> &ServiceSettings {
        self.invoker.settings()
    }

    pub async fn load_config(&self) -> Result<GenerationConfig, GenerationError> {
        GenerationConfig::load(self.config_store.as_ref(), &self.keys)
            .await
            .map_err(GenerationError::storage)
    }

    /// Runs the pipeline with the persisted configuration.
    pub async fn generate(&self, attachment_id: AttachmentId) -> Result<GeneratedMetadata, GenerationError> {
        let config = self.load_config().await?;
        self.generate_with(attachment_id, &config).await
    }

    /// Runs the pipeline, then applies the outcome to the stored usage state.
    pub async fn generate_and_record(
        &self,
        attachment_id: AttachmentId,
    ) -> Result<GeneratedMetadata, GenerationError> {
        let config = self.load_config().await?;
        let outcome = self.generate_with(attachment_id, &config).await;
        match &outcome {
            Err(err) if err.is_user_actionable() => info!(attachment_id, kind = ?err.kind(), "generation declined: {err}"),
            Err(err) => warn!(attachment_id, kind = ?err.kind(), "generation failed: {err}"),
            Ok(_) => {}
        }
        if let Err(err) = self.gate.record_outcome(&config, &outcome).await {
            warn!(attachment_id, "failed to record usage state: {err:#}");
        }
        outcome
    }

    pub async fn generate_with(
        &self,
        attachment_id: AttachmentId,
        config: &GenerationConfig,
    ) -> Result<GeneratedMetadata, GenerationError> {
        let current = self
            .attachments
            .field_values(attachment_id, config.metadata_fields)
            .await
            .map_err(GenerationError::storage)?;
        let needs = resolve_fields_to_generate(config.metadata_fields, config.override_metadata, &current);
        if needs.is_empty() {
            debug!(attachment_id, "no metadata fields need generation");
            return Err(GenerationError::NoFieldsNeeded);
        }
        debug!(attachment_id, fields = ?needs, "metadata fields need generation");

        let image = resolve_image(self.attachments.as_ref(), self.codec.clone(), attachment_id).await?;
        let request = build_request(
            &image.bytes,
            &image.mime_type,
            config.language,
            &self.instruction_template,
        );

        let preflight = self
            .gate
            .preflight(config)
            .await
            .map_err(GenerationError::storage)?;
        if let Preflight::Denied(err) = preflight {
            info!(attachment_id, "generation denied before sending: {err}");
            return Err(err);
        }

        let envelope = self.invoker.invoke(&request, config).await?;
        let metadata = process_response(&envelope, needs, self.sanitizer.as_ref())?;

        for (field, value) in metadata.fields() {
            self.attachments
                .set_field(attachment_id, field, value)
                .await
                .map_err(GenerationError::storage)?;
        }
        info!(attachment_id, fields = metadata.fields().count(), "image metadata saved");
        Ok(metadata)
    }
}

/// Caller-facing shape of one generation: the metadata, or the error code and upgrade hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct GenerationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<GeneratedMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Upgrade prompt text sent by the licensing service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_url: Option<String>,
}

impl From<&Result<GeneratedMetadata, GenerationError>> for GenerationOutcome {
    fn from(result: &Result<GeneratedMetadata, GenerationError>) -> Self {
        match result {
            Ok(metadata) => Self {
                success: true,
                metadata: Some(metadata.clone()),
                error: None,
                message: None,
                service_message: None,
                limit: None,
                ad_url: None,
            },
            Err(err) => {
                let payload = match err {
                    GenerationError::ServiceError(payload) => Some(payload),
                    _ => None,
                };
                Self {
                    success: false,
                    metadata: None,
                    error: Some(err.kind()),
                    message: Some(err.to_string()),
                    service_message: payload.and_then(|payload| payload.message.clone()),
                    limit: payload.and_then(|payload| payload.limit),
                    ad_url: payload.and_then(|payload| payload.ad_url.clone()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BulkItemOutcome {
    pub attachment_id: AttachmentId,
    #[serde(flatten)]
    pub outcome: GenerationOutcome,
}

#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
pub struct BulkReport {
    pub items: Vec<BulkItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    /// Attachments never attempted because the run stopped or halted.
    pub not_attempted: usize,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<ErrorKind>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sequential driver over many attachments with a cooperative stop flag.
pub struct BulkGenerator {
    pipeline: Arc<MetadataPipeline>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl BulkGenerator {
    pub fn new(pipeline: Arc<MetadataPipeline>) -> Self {
        Self {
            pipeline,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Takes effect before the next attachment; the one in flight finishes.
    pub fn request_stop(&self) -> bool {
        let running = self.is_running();
        if running {
            self.stop_requested.store(true, Ordering::SeqCst);
        }
        running
    }

    pub async fn run(&self, ids: &[AttachmentId]) -> Result<BulkReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("a bulk generation run is already in progress");
        }
        let _guard = RunningGuard(&self.running);
        self.stop_requested.store(false, Ordering::SeqCst);
        info!(total = ids.len(), "bulk generation started");

        let mut report = BulkReport::default();
        for (index, &attachment_id) in ids.iter().enumerate() {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!(processed = index, "bulk generation stopped on request");
                report.stopped = true;
                report.not_attempted = ids.len() - index;
                break;
            }

            let result = self.pipeline.generate_and_record(attachment_id).await;
            match &result {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
            let halt = result.as_ref().err().filter(|err| err.halts_bulk_run()).map(GenerationError::kind);
            report.items.push(BulkItemOutcome {
                attachment_id,
                outcome: GenerationOutcome::from(&result),
            });
            if let Some(kind) = halt {
                info!(?kind, "bulk generation halted by usage limit");
                report.halted_by = Some(kind);
                report.not_attempted = ids.len() - index - 1;
                break;
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            not_attempted = report.not_attempted,
            "bulk generation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceErrorPayload;

    #[test]
    fn outcome_carries_upgrade_hints() {
        let result: Result<GeneratedMetadata, GenerationError> =
            Err(GenerationError::ServiceError(ServiceErrorPayload {
                error: "Usage limit reached".to_string(),
                limit: Some(100),
                message: Some("Upgrade your plan".to_string()),
                ad_url: Some("https://oneclickcontent.com/pricing".to_string()),
            }));

        let outcome = GenerationOutcome::from(&result);
        let json = serde_json::to_value(&outcome).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "service_error");
        assert_eq!(json["message"], "Usage limit reached");
        assert_eq!(json["service_message"], "Upgrade your plan");
        assert_eq!(json["limit"], 100);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn transport_details_stay_out_of_outcome() {
        let result: Result<GeneratedMetadata, GenerationError> = Err(GenerationError::Transport {
            details: "dns error: secret-host.internal".to_string(),
        });

        let json = serde_json::to_string(&GenerationOutcome::from(&result)).unwrap();

        assert!(json.contains("\"error\":\"transport\""));
        assert!(!json.contains("secret-host"));
    }

    #[test]
    fn success_outcome_lists_only_generated_fields() {
        let result = Ok(GeneratedMetadata {
            alt_text: Some("A dog".to_string()),
            ..Default::default()
        });

        let json = serde_json::to_value(GenerationOutcome::from(&result)).unwrap();

        assert_eq!(json, serde_json::json!({"success": true, "metadata": {"alt_text": "A dog"}}));
    }
}
