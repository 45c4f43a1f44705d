use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::JsonSchema,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    app::AppState,
    store::AttachmentId,
    tools::{internal_error, json_result},
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BulkGenerateRequest {
    #[schemars(description = "Attachments to process in order; every image attachment when omitted")]
    #[serde(default)]
    pub attachment_ids: Option<Vec<AttachmentId>>,
}

pub async fn bulk_generate(
    state: &AppState,
    Parameters(request): Parameters<BulkGenerateRequest>,
) -> Result<CallToolResult, McpError> {
    let ids = match request.attachment_ids {
        Some(ids) => ids,
        None => state
            .attachments
            .image_ids()
            .await
            .map_err(|err| internal_error("list attachments failed", err))?,
    };
    let report = state
        .bulk
        .run(&ids)
        .await
        .map_err(|err| McpError::invalid_request(err.to_string(), None))?;
    json_result(&report)
}

pub async fn stop_bulk_generation(state: &AppState) -> Result<CallToolResult, McpError> {
    let stopping = state.bulk.request_stop();
    json_result(&json!({ "stopping": stopping }))
}
