use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::image_processing::JpegRenditionCodec;
use crate::pipeline::{BulkGenerator, MetadataPipeline};
use crate::service::{MetadataTransport, ReqwestTransport};
use crate::settings::ServiceSettings;
use crate::store::{ConfigStore, FileConfigStore, LocalAttachmentStore, LocalFileStorage};
use crate::usage::UsageReporter;

const OPTIONS_FILE: &str = "options.json";

/// Everything the MCP tools and the upload route share.
#[derive(Clone)]
pub struct AppState {
    pub attachments: Arc<LocalAttachmentStore>,
    pub config_store: Arc<dyn ConfigStore>,
    pub pipeline: Arc<MetadataPipeline>,
    pub bulk: Arc<BulkGenerator>,
    pub usage: Arc<UsageReporter>,
}

impl AppState {
    /// Opens the file-backed stores under `data_dir` and wires the pipeline to them.
    pub async fn open(data_dir: PathBuf, media_url: String, settings: ServiceSettings) -> Result<Self> {
        let transport: Arc<dyn MetadataTransport> = Arc::new(ReqwestTransport::new()?);
        let config_store: Arc<dyn ConfigStore> =
            Arc::new(FileConfigStore::open(data_dir.join(OPTIONS_FILE)).await?);
        let storage = LocalFileStorage::new(data_dir, media_url);
        Ok(Self::with_parts(
            Arc::new(LocalAttachmentStore::new(storage)),
            config_store,
            transport,
            settings,
        ))
    }

    pub fn with_parts(
        attachments: Arc<LocalAttachmentStore>,
        config_store: Arc<dyn ConfigStore>,
        transport: Arc<dyn MetadataTransport>,
        settings: ServiceSettings,
    ) -> Self {
        let usage = Arc::new(UsageReporter::new(
            transport.clone(),
            config_store.clone(),
            settings.clone(),
        ));
        let pipeline = Arc::new(MetadataPipeline::new(
            attachments.clone(),
            config_store.clone(),
            Arc::new(JpegRenditionCodec),
            transport,
            settings,
        ));
        Self {
            attachments,
            config_store,
            bulk: Arc::new(BulkGenerator::new(pipeline.clone())),
            pipeline,
            usage,
        }
    }
}
