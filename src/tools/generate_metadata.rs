use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::JsonSchema,
};
use serde::Deserialize;

use crate::{
    app::AppState,
    pipeline::GenerationOutcome,
    store::AttachmentId,
    tools::json_result,
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateMetadataRequest {
    #[schemars(description = "Attachment id, as returned by the upload endpoint or list_image_ids")]
    pub attachment_id: AttachmentId,
}

pub async fn generate_metadata(
    state: &AppState,
    Parameters(request): Parameters<GenerateMetadataRequest>,
) -> Result<CallToolResult, McpError> {
    let result = state.pipeline.generate_and_record(request.attachment_id).await;
    json_result(&GenerationOutcome::from(&result))
}
