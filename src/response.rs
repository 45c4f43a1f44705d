use std::sync::LazyLock;

use regex::Regex;
use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenerationError;
use crate::fields::{MetadataField, MetadataFieldSet};

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid")
});
static WHITESPACE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Cleans one generated value before it is stored.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, value: &str) -> String;
}

/// Plain-text field cleaning: no markup, no control characters, single spaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFieldSanitizer;

impl Sanitizer for TextFieldSanitizer {
    fn sanitize(&self, value: &str) -> String {
        let without_tags = TAG_PATTERN.replace_all(value, "");
        let printable: String = without_tags
            .chars()
            .map(|ch| if ch.is_control() { ' ' } else { ch })
            .collect();
        WHITESPACE_PATTERN
            .replace_all(printable.trim(), " ")
            .into_owned()
    }
}

/// Generated values, holding only the fields that were asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl GeneratedMetadata {
    pub fn get(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::Title => self.title.as_deref(),
            MetadataField::Description => self.description.as_deref(),
            MetadataField::AltText => self.alt_text.as_deref(),
            MetadataField::Caption => self.caption.as_deref(),
        }
    }

    fn set(&mut self, field: MetadataField, value: String) {
        let slot = match field {
            MetadataField::Title => &mut self.title,
            MetadataField::Description => &mut self.description,
            MetadataField::AltText => &mut self.alt_text,
            MetadataField::Caption => &mut self.caption,
        };
        *slot = Some(value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (MetadataField, &str)> + '_ {
        MetadataField::ALL
            .into_iter()
            .filter_map(move |field| self.get(field).map(|value| (field, value)))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    function_call: Option<FunctionCall>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    arguments: Option<String>,
}

fn malformed(details: impl Into<String>) -> GenerationError {
    GenerationError::MalformedPayload {
        details: details.into(),
    }
}

fn invalid_envelope(details: impl Into<String>) -> GenerationError {
    GenerationError::InvalidResponse {
        details: details.into(),
    }
}

/// A reply that is not a completion envelope is an invalid response; a completion
/// without usable arguments is a malformed payload.
fn function_arguments(envelope: &Value) -> Result<String, GenerationError> {
    let payload: ChatCompletionResponse = serde_json::from_value(envelope.clone())
        .map_err(|err| invalid_envelope(format!("unexpected completion envelope: {err}")))?;
    let message = payload
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.message)
        .ok_or_else(|| invalid_envelope("completion has no message"))?;
    let from_tool_call = || {
        message
            .tool_calls
            .as_ref()
            .and_then(|calls| calls.first())
            .and_then(|call| call.function.as_ref())
            .and_then(|function| function.arguments.clone())
    };
    message
        .function_call
        .as_ref()
        .and_then(|call| call.arguments.clone())
        .or_else(from_tool_call)
        .ok_or_else(|| malformed("completion has no function call arguments"))
}

/// Extracts, sanitises and filters the function-call arguments of a completion.
pub fn process_response(
    envelope: &Value,
    needs_generation: MetadataFieldSet,
    sanitizer: &dyn Sanitizer,
) -> Result<GeneratedMetadata, GenerationError> {
    let arguments = function_arguments(envelope)?;
    let values: Map<String, Value> = serde_json::from_str(&arguments)
        .map_err(|err| malformed(format!("arguments are not a JSON object: {err}")))?;

    let mut metadata = GeneratedMetadata::default();
    for field in needs_generation.iter() {
        let raw = values
            .get(field.key())
            .and_then(Value::as_str)
            .ok_or_else(|| GenerationError::missing_field(field))?;
        metadata.set(field, sanitizer.sanitize(raw));
    }
    Ok(metadata)
}
