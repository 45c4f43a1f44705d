//! Collaborator seams used by the generation pipeline, plus the local
//! file-backed implementations the server runs on.

pub mod attachments;
pub mod hash;
pub mod options;
pub mod storage;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::fields::{FieldValues, MetadataField, MetadataFieldSet};

pub use attachments::{AttachmentRecord, LocalAttachmentStore};
pub use hash::upload_hash;
pub use options::FileConfigStore;
pub use storage::LocalFileStorage;

pub type AttachmentId = u64;

/// The media library: where attachment files live and where their fields are written.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Absolute path of the original upload, if the attachment exists.
    async fn file_path(&self, id: AttachmentId) -> Result<Option<PathBuf>>;

    async fn existing_field(&self, id: AttachmentId, field: MetadataField) -> Result<Option<String>>;

    async fn set_field(&self, id: AttachmentId, field: MetadataField, value: &str) -> Result<()>;

    /// Reads the current values of the given fields; others stay `None`.
    async fn field_values(&self, id: AttachmentId, fields: MetadataFieldSet) -> Result<FieldValues> {
        let mut values = FieldValues::default();
        for field in fields.iter() {
            values.set(field, self.existing_field(id, field).await?);
        }
        Ok(values)
    }
}

/// Process-wide option store with short-lived transient entries.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns the transient value, or `None` once it has expired.
    async fn get_transient(&self, key: &str) -> Result<Option<Value>>;

    async fn set_transient(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    async fn delete_transient(&self, key: &str) -> Result<()>;

    async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}
