use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::{GenerationError, ServiceErrorPayload};
use crate::prompt::{FUNCTION_NAME, GenerationRequest, MAX_TOKENS, metadata_function};
use crate::settings::{Backend, GenerationConfig, ServiceSettings};

const FREE_TRIAL_PATH: &str = "/free-trial/v1/generate-meta";
const SUBSCRIBER_PATH: &str = "/subscriber/v1/generate-meta";
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

type HmacSha256 = Hmac<Sha256>;

/// Raw HTTP reply: the status and the undecoded body.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// JSON POST seam. Errors are transport failures only (DNS, TLS, timeout, reset).
#[async_trait]
pub trait MetadataTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }
}

#[async_trait]
impl MetadataTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let mut request = self.client.post(url).timeout(timeout).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    FreeTrial,
    Subscriber,
    OpenAi,
}

/// A fully assembled request, ready for the transport.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub endpoint: Endpoint,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl PreparedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HMAC-SHA256 of `origin_url || timestamp` under the shared salt, hex encoded.
pub fn trial_signature(origin_url: &str, timestamp: i64, salt: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC can take any key size");
    mac.update(origin_url.as_bytes());
    mac.update(timestamp.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct RemoteInvoker {
    transport: Arc<dyn MetadataTransport>,
    settings: ServiceSettings,
}

impl RemoteInvoker {
    pub fn new(transport: Arc<dyn MetadataTransport>, settings: ServiceSettings) -> Self {
        Self { transport, settings }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn endpoint_for(&self, config: &GenerationConfig) -> Endpoint {
        match self.settings.backend {
            Backend::OpenAi => Endpoint::OpenAi,
            Backend::OneClickContent if config.has_license_key() => Endpoint::Subscriber,
            Backend::OneClickContent => Endpoint::FreeTrial,
        }
    }

    pub fn prepare(&self, request: &GenerationRequest, config: &GenerationConfig, timestamp: i64) -> PreparedCall {
        let settings = &self.settings;
        let endpoint = self.endpoint_for(config);
        let license_key = config.license_key.trim();
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let mut body = json!({
            "messages": request.messages(),
            "functions": [metadata_function()],
            "function_call": {"name": FUNCTION_NAME},
            "max_tokens": MAX_TOKENS,
        });

        let url = match endpoint {
            Endpoint::OpenAi => {
                headers.push(("Authorization".to_string(), format!("Bearer {license_key}")));
                body["model"] = json!(settings.openai_model);
                format!("{}{CHAT_COMPLETIONS_PATH}", settings.openai_api_base)
            }
            Endpoint::Subscriber => {
                headers.push(("api-key".to_string(), license_key.to_string()));
                body["origin_url"] = json!(settings.origin_url);
                body["license_key"] = json!(license_key);
                body["product_slug"] = json!(settings.product_slug);
                format!("{}{SUBSCRIBER_PATH}", settings.api_base)
            }
            Endpoint::FreeTrial => {
                let signature = trial_signature(&settings.origin_url, timestamp, &settings.hmac_salt);
                headers.push(("X-Free-Trial-Hash".to_string(), signature));
                headers.push(("X-Timestamp".to_string(), timestamp.to_string()));
                body["origin_url"] = json!(settings.origin_url);
                body["license_key"] = json!("");
                body["product_slug"] = json!(settings.product_slug);
                format!("{}{FREE_TRIAL_PATH}", settings.api_base)
            }
        };

        PreparedCall {
            endpoint,
            url,
            headers,
            body,
        }
    }

    /// Sends the request and returns the decoded completion envelope.
    pub async fn invoke(&self, request: &GenerationRequest, config: &GenerationConfig) -> Result<Value, GenerationError> {
        let call = self.prepare(request, config, Utc::now().timestamp());
        info!(endpoint = ?call.endpoint, "requesting image metadata");
        let response = self
            .transport
            .post_json(&call.url, &call.headers, &call.body, self.settings.timeout)
            .await
            .map_err(|err| {
                warn!(endpoint = ?call.endpoint, "metadata service unreachable: {err:#}");
                GenerationError::Transport {
                    details: format!("{err:#}"),
                }
            })?;
        classify_response(response.status, &response.body)
    }
}

/// Maps a raw reply onto the envelope, a service error, or an invalid response.
pub fn classify_response(status: u16, body: &str) -> Result<Value, GenerationError> {
    let value: Value = serde_json::from_str(body).map_err(|err| {
        warn!(status, "metadata service returned non-JSON body: {err}");
        GenerationError::InvalidResponse {
            details: err.to_string(),
        }
    })?;
    if let Some(payload) = service_error(&value) {
        warn!(status, error = %payload.error, "metadata service rejected the request");
        return Err(GenerationError::ServiceError(payload));
    }
    if !(200..300).contains(&status) {
        return Err(GenerationError::InvalidResponse {
            details: format!("HTTP {status}"),
        });
    }
    Ok(value)
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn service_error(value: &Value) -> Option<ServiceErrorPayload> {
    let error = match value.get("error")? {
        Value::Null => return None,
        Value::String(text) => text.clone(),
        Value::Object(details) => non_empty_string(details.get("message"))
            .unwrap_or_else(|| "Unknown error".to_string()),
        other => other.to_string(),
    };
    let limit = value.get("limit").and_then(|limit| {
        limit
            .as_u64()
            .or_else(|| limit.as_str().and_then(|raw| raw.trim().parse().ok()))
    });
    Some(ServiceErrorPayload {
        error,
        limit,
        message: non_empty_string(value.get("message")),
        ad_url: non_empty_string(value.get("ad_url")),
    })
}
