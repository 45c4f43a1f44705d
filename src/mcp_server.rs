use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};

use crate::app::AppState;
use crate::tools::{BulkGenerateRequest, GenerateMetadataRequest, UpdateSettingsRequest};

#[derive(Clone)]
pub struct MetadataServer {
    tool_router: ToolRouter<Self>,
    state: AppState,
}

impl MetadataServer {
    pub fn new(state: AppState) -> Self {
        Self {
            tool_router: Self::tool_router(),
            state,
        }
    }
}

#[tool_router]
impl MetadataServer {
    #[tool(
        description = "Generate title, description, alt text and caption for one image attachment using the configured fields, language and override setting. Returns the saved metadata, or an error code with upgrade hints (message, limit, ad_url) to show the user"
    )]
    async fn generate_metadata(
        &self,
        Parameters(request): Parameters<GenerateMetadataRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::generate_metadata(&self.state, Parameters(request)).await
    }

    #[tool(
        description = "Generate metadata for many image attachments one after another. Stops early when the trial or usage limit is reached. Warn the user that this can take a while"
    )]
    async fn bulk_generate(
        &self,
        Parameters(request): Parameters<BulkGenerateRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::bulk_generate(&self.state, Parameters(request)).await
    }

    #[tool(description = "Stop a running bulk generation after the image currently being processed")]
    async fn stop_bulk_generation(&self) -> Result<CallToolResult, McpError> {
        crate::tools::stop_bulk_generation(&self.state).await
    }

    #[tool(description = "List image attachments with their ids, URLs, titles and alt text")]
    async fn list_image_ids(&self) -> Result<CallToolResult, McpError> {
        crate::tools::list_image_ids(&self.state).await
    }

    #[tool(description = "Show the current generation settings. The license key is masked")]
    async fn get_settings(&self) -> Result<CallToolResult, McpError> {
        crate::tools::get_settings(&self.state).await
    }

    #[tool(description = "Change generation settings. Only the provided values are updated")]
    async fn update_settings(
        &self,
        Parameters(request): Parameters<UpdateSettingsRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::update_settings(&self.state, Parameters(request)).await
    }

    #[tool(description = "Show how many images have been generated and how many remain on the trial or license")]
    async fn get_usage(&self) -> Result<CallToolResult, McpError> {
        crate::tools::get_usage(&self.state).await
    }

    #[tool(description = "Check whether a recent upload hit the usage limit while generating metadata")]
    async fn check_image_error(&self) -> Result<CallToolResult, McpError> {
        crate::tools::check_image_error(&self.state).await
    }

    #[tool(description = "Dismiss the usage-limit notice left by a recent upload")]
    async fn clear_image_error(&self) -> Result<CallToolResult, McpError> {
        crate::tools::clear_image_error(&self.state).await
    }
}

#[tool_handler]
impl ServerHandler for MetadataServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Generates image metadata for uploaded media. Upload images through the upload endpoint, then call generate_metadata or bulk_generate."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}
