pub mod bulk_generate;
pub mod generate_metadata;
pub mod image_error;
pub mod list_image_ids;
pub mod settings;
pub mod usage;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

pub use bulk_generate::{BulkGenerateRequest, bulk_generate, stop_bulk_generation};
pub use generate_metadata::{GenerateMetadataRequest, generate_metadata};
pub use image_error::{check_image_error, clear_image_error};
pub use list_image_ids::list_image_ids;
pub use settings::{UpdateSettingsRequest, get_settings, update_settings};
pub use usage::get_usage;

pub(crate) fn internal_error(message: &'static str, err: impl std::fmt::Display) -> McpError {
    McpError::internal_error(message, Some(serde_json::Value::String(err.to_string())))
}

pub(crate) fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string(value)
        .map_err(|err| internal_error("serialize tool response failed", err))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
