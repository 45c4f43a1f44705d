use base64::Engine;
use serde_json::{Value, json};

use crate::settings::Language;

pub const FUNCTION_NAME: &str = "generate_image_metadata";
pub const MAX_TOKENS: u32 = 500;
pub const DEFAULT_INSTRUCTION_TEMPLATE: &str = "Generate image metadata including title, description, alt text, and caption for the provided image in {language}.";

/// One multimodal prompt: the instruction text and the embedded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub instruction: String,
    pub image_data_uri: String,
}

impl GenerationRequest {
    pub fn messages(&self) -> Value {
        json!([
            {
                "role": "user",
                "content": [
                    {"type": "text", "text": self.instruction},
                    {"type": "image_url", "image_url": {"url": self.image_data_uri}}
                ]
            }
        ])
    }
}

/// `{language}` in the template is replaced with the language label.
pub fn build_request(
    image_bytes: &[u8],
    mime_type: &str,
    language: Language,
    instruction_template: &str,
) -> GenerationRequest {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
    GenerationRequest {
        instruction: instruction_template.replace("{language}", language.label()),
        image_data_uri: format!("data:{mime_type};base64,{encoded}"),
    }
}

/// The fixed function schema the model must fill in.
pub fn metadata_function() -> Value {
    json!({
        "name": FUNCTION_NAME,
        "description": "Generate image metadata including title, description, alt text, and caption.",
        "parameters": {
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "A concise and descriptive title for the image."
                },
                "description": {
                    "type": "string",
                    "description": "A detailed description of the image content."
                },
                "alt_text": {
                    "type": "string",
                    "description": "Alt text for accessibility."
                },
                "caption": {
                    "type": "string",
                    "description": "A caption to display alongside the image."
                }
            },
            "required": ["title", "description", "alt_text", "caption"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_names_language_by_label() {
        let request = build_request(b"abc", "image/jpeg", Language::Fr, DEFAULT_INSTRUCTION_TEMPLATE);
        assert_eq!(
            request.instruction,
            "Generate image metadata including title, description, alt text, and caption for the provided image in French."
        );
        assert_eq!(request.image_data_uri, "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn messages_carry_text_then_image() {
        let request = build_request(&[0xFF, 0xD8], "image/png", Language::En, "Describe in {language}");
        let messages = request.messages();
        let content = &messages[0]["content"];
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(content[0]["text"], "Describe in English");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,/9g=");
    }

    #[test]
    fn schema_requires_all_four_string_fields() {
        let function = metadata_function();
        assert_eq!(function["name"], FUNCTION_NAME);
        let required: Vec<&str> = function["parameters"]["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(required, vec!["title", "description", "alt_text", "caption"]);
        for key in required {
            assert_eq!(function["parameters"]["properties"][key]["type"], "string");
        }
    }
}
