use rmcp::{ErrorData as McpError, model::CallToolResult, schemars::JsonSchema};
use serde::Serialize;

use crate::{
    app::AppState,
    gate::UsageState,
    tools::{internal_error, json_result},
    usage::UsageSummary,
};

#[derive(Debug, Serialize, JsonSchema)]
pub struct UsageReport {
    pub usage: UsageSummary,
    pub state: UsageState,
}

pub async fn get_usage(state: &AppState) -> Result<CallToolResult, McpError> {
    let config = state
        .pipeline
        .load_config()
        .await
        .map_err(|err| internal_error("load settings failed", err))?;
    let usage = state
        .usage
        .usage(&config)
        .await
        .map_err(|err| internal_error("check usage failed", err))?;
    let usage_state = state
        .pipeline
        .gate()
        .usage_state()
        .await
        .map_err(|err| internal_error("load usage state failed", err))?;
    json_result(&UsageReport {
        usage,
        state: usage_state,
    })
}
