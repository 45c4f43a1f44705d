use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use serde_json::{Value, json};
use tempfile::TempDir;

use image_meta_rmcp::error::{ErrorKind, GenerationError};
use image_meta_rmcp::fields::{FieldValues, MetadataField, MetadataFieldSet};
use image_meta_rmcp::image_processing::{ImageCodec, JpegRenditionCodec};
use image_meta_rmcp::pipeline::{BulkGenerator, MetadataPipeline};
use image_meta_rmcp::response::Sanitizer;
use image_meta_rmcp::service::{MetadataTransport, TransportResponse};
use image_meta_rmcp::settings::{GenerationConfig, Language, OptionKeys, ServiceSettings};
use image_meta_rmcp::store::{AttachmentId, AttachmentStore, ConfigStore, FileConfigStore};

struct MockAttachments {
    files: HashMap<AttachmentId, PathBuf>,
    values: Mutex<HashMap<AttachmentId, FieldValues>>,
    file_path_calls: AtomicUsize,
    writes: Mutex<Vec<(AttachmentId, MetadataField, String)>>,
}

impl MockAttachments {
    fn writes(&self) -> Vec<(AttachmentId, MetadataField, String)> {
        self.writes.lock().unwrap().clone()
    }

    fn preset(&self, id: AttachmentId, field: MetadataField, value: &str) {
        self.values
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .set(field, Some(value.to_string()));
    }
}

#[async_trait]
impl AttachmentStore for MockAttachments {
    async fn file_path(&self, id: AttachmentId) -> Result<Option<PathBuf>> {
        self.file_path_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.get(&id).cloned())
    }

    async fn existing_field(&self, id: AttachmentId, field: MetadataField) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|values| values.get(field).map(str::to_string)))
    }

    async fn set_field(&self, id: AttachmentId, field: MetadataField, value: &str) -> Result<()> {
        self.writes.lock().unwrap().push((id, field, value.to_string()));
        self.values
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .set(field, Some(value.to_string()));
        Ok(())
    }
}

struct MockCodec {
    fail: bool,
    calls: AtomicUsize,
}

impl ImageCodec for MockCodec {
    fn resize_reencode(&self, src: &Path, max_width: u32, max_height: u32, crop: bool, quality: u8) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("unsupported image format"));
        }
        JpegRenditionCodec.resize_reencode(src, max_width, max_height, crop, quality)
    }
}

#[derive(Clone)]
enum Reply {
    Json(u16, Value),
    Raw(u16, &'static str),
    Fail(&'static str),
}

struct Recorded {
    url: String,
    headers: Vec<(String, String)>,
    body: Value,
}

struct MockTransport {
    replies: Mutex<Vec<Reply>>,
    requests: Mutex<Vec<Recorded>>,
    stop_on_first_call: Mutex<Option<Weak<BulkGenerator>>>,
}

impl MockTransport {
    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl MetadataTransport for MockTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        _timeout: Duration,
    ) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(Recorded {
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.clone(),
        });
        if let Some(bulk) = self.stop_on_first_call.lock().unwrap().take() {
            if let Some(bulk) = bulk.upgrade() {
                bulk.request_stop();
            }
        }
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() }
        };
        match reply {
            Reply::Json(status, body) => Ok(TransportResponse {
                status,
                body: body.to_string(),
            }),
            Reply::Raw(status, body) => Ok(TransportResponse {
                status,
                body: body.to_string(),
            }),
            Reply::Fail(message) => Err(anyhow!(message)),
        }
    }
}

const FULL_ARGUMENTS: &str = r#"{"title":"Red Barn","description":"A red barn in a <b>green</b> field.","alt_text":"Red barn","caption":"Harvest season"}"#;

fn success(arguments: &str) -> Reply {
    Reply::Json(
        200,
        json!({"choices": [{"message": {"function_call": {"name": "generate_image_metadata", "arguments": arguments}}}]}),
    )
}

fn usage_limit() -> Reply {
    Reply::Json(
        403,
        json!({"error": "Usage limit reached", "limit": 100, "message": "Upgrade", "ad_url": "https://oneclickcontent.com/pricing"}),
    )
}

struct Harness {
    _dir: TempDir,
    attachments: Arc<MockAttachments>,
    codec: Arc<MockCodec>,
    transport: Arc<MockTransport>,
    store: Arc<FileConfigStore>,
    pipeline: Arc<MetadataPipeline>,
}

impl Harness {
    async fn new(replies: Vec<Reply>, codec_fails: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut files = HashMap::new();
        for id in 1..=3 {
            let path = dir.path().join(format!("photo-{id}.png"));
            RgbImage::from_pixel(800, 600, image::Rgb([180, 30, 30]))
                .save_with_format(&path, ImageFormat::Png)
                .unwrap();
            files.insert(id, path);
        }
        let attachments = Arc::new(MockAttachments {
            files,
            values: Mutex::new(HashMap::new()),
            file_path_calls: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        });
        let codec = Arc::new(MockCodec {
            fail: codec_fails,
            calls: AtomicUsize::new(0),
        });
        let transport = Arc::new(MockTransport {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            stop_on_first_call: Mutex::new(None),
        });
        let store = Arc::new(FileConfigStore::in_memory());
        let settings = ServiceSettings {
            origin_url: "https://example.com".to_string(),
            ..ServiceSettings::default()
        };
        let pipeline = Arc::new(MetadataPipeline::new(
            attachments.clone(),
            store.clone(),
            codec.clone(),
            transport.clone(),
            settings,
        ));
        Self {
            _dir: dir,
            attachments,
            codec,
            transport,
            store,
            pipeline,
        }
    }

    async fn configure(&self, config: GenerationConfig) {
        config.save(self.store.as_ref(), &OptionKeys::default()).await.unwrap();
    }

    async fn set_option(&self, key: &str, value: Value) {
        self.store.set(key, value).await.unwrap();
    }
}

fn all_fields() -> GenerationConfig {
    GenerationConfig {
        metadata_fields: MetadataFieldSet::all(),
        ..GenerationConfig::default()
    }
}

#[tokio::test]
async fn nothing_selected_short_circuits_before_any_io() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoFieldsNeeded);
    assert_eq!(harness.attachments.file_path_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.codec.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn filled_fields_without_override_short_circuit() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness
        .configure(GenerationConfig {
            metadata_fields: MetadataFieldSet::of(&[MetadataField::Title, MetadataField::Caption]),
            ..GenerationConfig::default()
        })
        .await;
    harness.attachments.preset(1, MetadataField::Title, "Existing");
    harness.attachments.preset(1, MetadataField::Caption, "Existing caption");

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert!(matches!(err, GenerationError::NoFieldsNeeded));
    assert_eq!(harness.codec.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn only_the_blank_field_is_written() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness.configure(all_fields()).await;
    for field in [MetadataField::Title, MetadataField::Description, MetadataField::Caption] {
        harness.attachments.preset(1, field, "kept");
    }

    let metadata = harness.pipeline.generate(1).await.unwrap();

    assert_eq!(metadata.alt_text.as_deref(), Some("Red barn"));
    assert_eq!(metadata.title, None);
    assert_eq!(
        harness.attachments.writes(),
        vec![(1, MetadataField::AltText, "Red barn".to_string())]
    );
}

#[tokio::test]
async fn override_rewrites_every_selected_field_sanitised() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness
        .configure(GenerationConfig {
            override_metadata: true,
            ..all_fields()
        })
        .await;
    harness.attachments.preset(2, MetadataField::Description, "old");

    let metadata = harness.pipeline.generate(2).await.unwrap();

    assert_eq!(metadata.description.as_deref(), Some("A red barn in a green field."));
    let written: Vec<MetadataField> = harness.attachments.writes().into_iter().map(|(_, field, _)| field).collect();
    assert_eq!(written, MetadataField::ALL.to_vec());
}

#[tokio::test]
async fn usage_limit_error_is_forwarded_without_writes() {
    let harness = Harness::new(vec![usage_limit()], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    match err {
        GenerationError::ServiceError(payload) => {
            assert_eq!(payload.error, "Usage limit reached");
            assert_eq!(payload.limit, Some(100));
            assert_eq!(payload.ad_url.as_deref(), Some("https://oneclickcontent.com/pricing"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn transport_failure_leaves_attachment_untouched() {
    let harness = Harness::new(vec![Reply::Fail("connection timed out")], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(!err.to_string().contains("timed out"));
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn expired_trial_never_reaches_the_network() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness.configure(all_fields()).await;
    harness.set_option("occidg_trial_expired", json!(true)).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert!(matches!(err, GenerationError::TrialExpired));
    assert_eq!(harness.transport.calls(), 0);
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn expired_trial_is_ignored_once_a_key_is_set() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness
        .configure(GenerationConfig {
            license_key: "lic-77".to_string(),
            ..all_fields()
        })
        .await;
    harness.set_option("occidg_trial_expired", json!(true)).await;

    harness.pipeline.generate(1).await.unwrap();

    let requests = harness.transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.ends_with("/subscriber/v1/generate-meta"));
    assert!(requests[0].headers.contains(&("api-key".to_string(), "lic-77".to_string())));
    assert_eq!(requests[0].body["license_key"], "lic-77");
}

#[tokio::test]
async fn malformed_arguments_are_reported_without_writes() {
    let harness = Harness::new(vec![success("{\"title\": \"Red")], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn non_json_reply_is_an_invalid_response() {
    let harness = Harness::new(vec![Reply::Raw(200, "<html><body>Bad gateway</body></html>")], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn gateway_error_status_is_an_invalid_response() {
    let harness = Harness::new(vec![Reply::Json(502, json!({"detail": "upstream down"}))], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
}

#[tokio::test]
async fn reply_without_completion_envelope_is_an_invalid_response() {
    let harness = Harness::new(vec![Reply::Json(200, json!({}))], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(1).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    assert!(harness.attachments.writes().is_empty());
}

#[tokio::test]
async fn rendition_is_created_once_and_sent_as_jpeg() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness
        .configure(GenerationConfig {
            override_metadata: true,
            ..all_fields()
        })
        .await;

    harness.pipeline.generate(1).await.unwrap();
    harness.pipeline.generate(1).await.unwrap();

    assert_eq!(harness.codec.calls.load(Ordering::SeqCst), 1);
    let requests = harness.transport.requests.lock().unwrap();
    let image_url = requests[1].body["messages"][0]["content"][1]["image_url"]["url"]
        .as_str()
        .unwrap();
    assert!(image_url.starts_with("data:image/jpeg;base64,"));
    assert!(harness.attachments.files[&1].with_file_name("photo-1-500x500.jpg").exists());
}

#[tokio::test]
async fn failed_rendition_falls_back_to_original() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], true).await;
    harness.configure(all_fields()).await;

    harness.pipeline.generate(1).await.unwrap();

    assert_eq!(harness.codec.calls.load(Ordering::SeqCst), 1);
    let requests = harness.transport.requests.lock().unwrap();
    let image_url = requests[0].body["messages"][0]["content"][1]["image_url"]["url"]
        .as_str()
        .unwrap();
    assert!(image_url.starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn unknown_attachment_is_image_not_found() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness.configure(all_fields()).await;

    let err = harness.pipeline.generate(42).await.unwrap_err();

    assert!(matches!(err, GenerationError::ImageNotFound { attachment_id: 42 }));
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn trial_limit_reply_expires_the_trial() {
    let harness = Harness::new(
        vec![
            success(FULL_ARGUMENTS),
            Reply::Json(403, json!({"error": "Free trial limit reached.", "limit": 10})),
        ],
        false,
    )
    .await;
    harness.configure(all_fields()).await;

    harness.pipeline.generate_and_record(1).await.unwrap();
    let err = harness.pipeline.generate_and_record(2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceError);

    let state = harness.pipeline.gate().usage_state().await.unwrap();
    assert_eq!(state.trial_usage, 1);
    assert!(state.trial_expired);

    let err = harness.pipeline.generate_and_record(3).await.unwrap_err();
    assert!(matches!(err, GenerationError::TrialExpired));
    assert_eq!(harness.transport.calls(), 2);
}

#[tokio::test]
async fn bulk_run_halts_on_usage_limit() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS), usage_limit()], false).await;
    harness.configure(all_fields()).await;
    let bulk = BulkGenerator::new(harness.pipeline.clone());

    let report = bulk.run(&[1, 2, 3]).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.not_attempted, 1);
    assert_eq!(report.halted_by, Some(ErrorKind::ServiceError));
    assert_eq!(report.items[1].outcome.limit, Some(100));
    assert_eq!(harness.transport.calls(), 2);
    assert!(!bulk.is_running());
}

#[tokio::test]
async fn bulk_run_moves_past_ordinary_failures() {
    let harness = Harness::new(
        vec![Reply::Fail("connection reset"), success(FULL_ARGUMENTS)],
        false,
    )
    .await;
    harness.configure(all_fields()).await;
    let bulk = BulkGenerator::new(harness.pipeline.clone());

    let report = bulk.run(&[1, 42, 2, 3]).await.unwrap();

    let kinds: Vec<Option<ErrorKind>> = report.items.iter().map(|item| item.outcome.error).collect();
    assert_eq!(
        kinds,
        vec![Some(ErrorKind::Transport), Some(ErrorKind::ImageNotFound), None, None]
    );
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.halted_by, None);
    assert!(!report.stopped);
}

#[tokio::test]
async fn stop_request_takes_effect_between_items() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness.configure(all_fields()).await;
    let bulk = Arc::new(BulkGenerator::new(harness.pipeline.clone()));
    *harness.transport.stop_on_first_call.lock().unwrap() = Some(Arc::downgrade(&bulk));

    let report = bulk.run(&[1, 2, 3]).await.unwrap();

    assert!(report.stopped);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.not_attempted, 2);
    assert_eq!(harness.transport.calls(), 1);
    assert!(!bulk.request_stop());
}

struct UppercaseSanitizer;

impl Sanitizer for UppercaseSanitizer {
    fn sanitize(&self, value: &str) -> String {
        value.trim().to_uppercase()
    }
}

#[tokio::test]
async fn custom_template_and_sanitizer_are_applied() {
    let harness = Harness::new(vec![success(FULL_ARGUMENTS)], false).await;
    harness
        .configure(GenerationConfig {
            metadata_fields: MetadataFieldSet::of(&[MetadataField::Caption]),
            language: Language::De,
            ..GenerationConfig::default()
        })
        .await;
    let pipeline = MetadataPipeline::new(
        harness.attachments.clone(),
        harness.store.clone(),
        harness.codec.clone(),
        harness.transport.clone(),
        ServiceSettings::default(),
    )
    .with_instruction_template("Describe this product photo in {language}.")
    .with_sanitizer(Arc::new(UppercaseSanitizer));

    let metadata = pipeline.generate(3).await.unwrap();

    assert_eq!(metadata.caption.as_deref(), Some("HARVEST SEASON"));
    let requests = harness.transport.requests.lock().unwrap();
    assert_eq!(
        requests[0].body["messages"][0]["content"][0]["text"],
        "Describe this product photo in German."
    );
}
