use rmcp::{ErrorData as McpError, model::CallToolResult, schemars::JsonSchema};
use serde::Serialize;

use crate::{
    app::AppState,
    store::AttachmentId,
    tools::{internal_error, json_result},
};

#[derive(Debug, Serialize, JsonSchema)]
pub struct ImageSummary {
    pub id: AttachmentId,
    pub url: String,
    pub title: String,
    pub alt_text: String,
}

pub async fn list_image_ids(state: &AppState) -> Result<CallToolResult, McpError> {
    let attachments = &state.attachments;
    let ids = attachments
        .image_ids()
        .await
        .map_err(|err| internal_error("list attachments failed", err))?;
    let mut images = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(record) = attachments
            .load(id)
            .await
            .map_err(|err| internal_error("load attachment failed", err))?
        else {
            continue;
        };
        images.push(ImageSummary {
            id,
            url: attachments.public_url(&record),
            title: record.title,
            alt_text: record.alt_text,
        });
    }
    json_result(&images)
}
