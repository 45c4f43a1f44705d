use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{AttachmentId, AttachmentStore, LocalFileStorage, upload_hash};
use crate::fields::MetadataField;

const ATTACHMENT_DIR: &str = "attachments";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentRecord {
    pub id: AttachmentId,
    pub file_key: String,
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub alt_text: String,
    #[serde(default)]
    pub caption: String,
    pub created_at: String,
}

impl AttachmentRecord {
    pub fn field(&self, field: MetadataField) -> &str {
        match field {
            MetadataField::Title => &self.title,
            MetadataField::Description => &self.description,
            MetadataField::AltText => &self.alt_text,
            MetadataField::Caption => &self.caption,
        }
    }

    fn field_mut(&mut self, field: MetadataField) -> &mut String {
        match field {
            MetadataField::Title => &mut self.title,
            MetadataField::Description => &mut self.description,
            MetadataField::AltText => &mut self.alt_text,
            MetadataField::Caption => &mut self.caption,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Media library kept as JSON records next to the uploaded files.
pub struct LocalAttachmentStore {
    storage: LocalFileStorage,
    write_lock: Mutex<()>,
}

impl LocalAttachmentStore {
    pub fn new(storage: LocalFileStorage) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self, id: AttachmentId) -> Result<Option<AttachmentRecord>> {
        let key = LocalFileStorage::get_attachment_key(id);
        let Some(bytes) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse attachment record {key}"))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &AttachmentRecord) -> Result<()> {
        let key = LocalFileStorage::get_attachment_key(record.id);
        let payload = serde_json::to_vec_pretty(record)?;
        self.storage.put(&key, &payload).await
    }

    /// Stores the upload and creates its record. The title defaults to the file stem.
    pub async fn create(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<AttachmentRecord> {
        let _guard = self.write_lock.lock().await;
        let id = self.list_ids().await?.last().copied().unwrap_or(0) + 1;
        let ext = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "bin".to_string());
        let now = Utc::now();
        let hash = upload_hash(file_name, bytes, now.timestamp_nanos_opt().unwrap_or_default());
        let file_key = LocalFileStorage::get_upload_key(&hash, &ext);
        self.storage.put(&file_key, bytes).await?;

        let title = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let record = AttachmentRecord {
            id,
            file_key,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            title,
            description: String::new(),
            alt_text: String::new(),
            caption: String::new(),
            created_at: now.to_rfc3339(),
        };
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn list_ids(&self) -> Result<Vec<AttachmentId>> {
        let mut ids: Vec<AttachmentId> = self
            .storage
            .list(ATTACHMENT_DIR)
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn image_ids(&self) -> Result<Vec<AttachmentId>> {
        let mut ids = Vec::new();
        for id in self.list_ids().await? {
            if let Some(record) = self.load(id).await? {
                if record.is_image() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    pub fn public_url(&self, record: &AttachmentRecord) -> String {
        self.storage.get_public_url(&record.file_key)
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn file_path(&self, id: AttachmentId) -> Result<Option<PathBuf>> {
        Ok(self
            .load(id)
            .await?
            .map(|record| self.storage.resolve_path(&record.file_key)))
    }

    async fn existing_field(&self, id: AttachmentId, field: MetadataField) -> Result<Option<String>> {
        Ok(self
            .load(id)
            .await?
            .map(|record| record.field(field).to_string())
            .filter(|value| !value.is_empty()))
    }

    async fn set_field(&self, id: AttachmentId, field: MetadataField, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(id)
            .await?
            .ok_or_else(|| anyhow!("attachment {id} not found"))?;
        *record.field_mut(field) = value.to_string();
        self.save(&record).await
    }
}
