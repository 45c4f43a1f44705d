use std::path::Path;

use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::AppState;
use crate::error::GenerationError;
use crate::image_processing::{detect_mime_type, mime_from_extension};
use crate::pipeline::GenerationOutcome;
use crate::store::AttachmentId;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct UploadResponse {
    id: AttachmentId,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<GenerationOutcome>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { error: message.to_string() })).into_response()
}

/// Stores an uploaded image as a new attachment and, when enabled, generates its metadata.
pub async fn handle_image_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().unwrap_or("").to_string();
                match field.bytes().await {
                    Ok(data) => upload = Some((file_name, content_type, data)),
                    Err(err) => {
                        return json_error(StatusCode::BAD_REQUEST, &format!("failed to read file: {err}"));
                    }
                }
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("failed to read form: {err}"));
            }
        }
    }

    let Some((file_name, content_type, bytes)) = upload else {
        return json_error(StatusCode::BAD_REQUEST, "no file uploaded");
    };
    if bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "uploaded file is empty");
    }
    let mime_type = detect_mime_type(&bytes)
        .or_else(|| mime_from_extension(Path::new(&file_name)))
        .map(str::to_string)
        .or(content_type);
    let Some(mime_type) = mime_type.filter(|mime| mime.starts_with("image/")) else {
        return json_error(StatusCode::BAD_REQUEST, "only image uploads are supported");
    };
    let file_name = if file_name.trim().is_empty() {
        "upload".to_string()
    } else {
        file_name
    };

    let record = match state.attachments.create(&file_name, &mime_type, &bytes).await {
        Ok(record) => record,
        Err(err) => {
            warn!("saving upload failed: {err:#}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to save file");
        }
    };
    info!(attachment_id = record.id, mime_type = %record.mime_type, "attachment uploaded");

    let generation = match auto_generate(&state, record.id).await {
        Ok(generation) => generation,
        Err(err) => {
            warn!(attachment_id = record.id, "auto-generate skipped: {err}");
            None
        }
    };
    let url = state.attachments.public_url(&record);
    (
        StatusCode::OK,
        Json(UploadResponse {
            id: record.id,
            url,
            generation,
        }),
    )
        .into_response()
}

async fn auto_generate(
    state: &AppState,
    attachment_id: AttachmentId,
) -> Result<Option<GenerationOutcome>, GenerationError> {
    let config = state.pipeline.load_config().await?;
    if !config.auto_add_details {
        return Ok(None);
    }
    let result = state.pipeline.generate_and_record(attachment_id).await;
    if let Err(GenerationError::ServiceError(payload)) = &result {
        if let Err(err) = state.pipeline.gate().remember_usage_limit(payload).await {
            warn!(attachment_id, "failed to store usage-limit notice: {err:#}");
        }
    }
    Ok(Some(GenerationOutcome::from(&result)))
}
