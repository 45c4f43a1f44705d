use rmcp::{ErrorData as McpError, model::CallToolResult};
use serde_json::json;

use crate::{
    app::AppState,
    tools::{internal_error, json_result},
};

/// Reports the usage-limit error left behind by an upload, if it has not expired.
pub async fn check_image_error(state: &AppState) -> Result<CallToolResult, McpError> {
    let notice = state
        .pipeline
        .gate()
        .image_error()
        .await
        .map_err(|err| internal_error("read image error failed", err))?;
    match notice {
        Some(notice) => json_result(&json!({
            "error": true,
            "message": notice.message,
            "ad_url": notice.ad_url,
        })),
        None => json_result(&json!({ "error": false })),
    }
}

pub async fn clear_image_error(state: &AppState) -> Result<CallToolResult, McpError> {
    state
        .pipeline
        .gate()
        .clear_image_error()
        .await
        .map_err(|err| internal_error("clear image error failed", err))?;
    json_result(&json!({ "success": true }))
}
