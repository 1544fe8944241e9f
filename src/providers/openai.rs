use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::Path;

use super::retry::{is_rate_limited, retry_after, RateLimited};
use super::{Message, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage, ToolSpec};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";
const TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Public {
        base_url: String,
    },
    Azure {
        base_url: String,
        deployment: String,
        api_version: String,
    },
}

/// Chat-completions client for OpenAI and Azure OpenAI deployments.
#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    endpoint: Endpoint,
    client: reqwest::Client,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
    pub fn new(key: impl Into<String>, endpoint: Endpoint) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            endpoint,
            client: reqwest::Client::builder()
                .build()
                .with_context(|| "failed to build HTTP client")?,
            messages: Vec::new(),
            tools: Vec::new(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    /// Trusts an extra PEM root certificate, for corporate proxies.
    pub fn with_ca_cert(mut self, path: &Path) -> Result<Self> {
        let pem = fs::read(path)
            .with_context(|| format!("failed to read CA certificate: {}", path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("invalid PEM certificate: {}", path.display()))?;
        self.client = reqwest::Client::builder()
            .add_root_certificate(cert)
            .build()
            .with_context(|| "failed to build HTTP client")?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn url(&self) -> String {
        match &self.endpoint {
            Endpoint::Public { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
            Endpoint::Azure {
                base_url,
                deployment,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base_url.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }
}

impl Provider for OpenAI {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self.find_tool(&tool_name)?.clone();
            call_with_chat_completions(self, tool, &tool_name).await
        })
    }
}

fn request_body(provider: &OpenAI, tool: &ToolSpec) -> serde_json::Value {
    let messages = provider
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
            };
            json!({"role": role, "content": message.content})
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "messages": messages,
        "temperature": TEMPERATURE,
        "tools": [
            {
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            }
        ],
        "tool_choice": {"type": "function", "function": {"name": tool.name}}
    });
    if matches!(provider.endpoint, Endpoint::Public { .. }) {
        body["model"] = json!(provider.model);
    }
    body
}

async fn call_with_chat_completions(
    provider: OpenAI,
    tool: ToolSpec,
    tool_name: &str,
) -> Result<ProviderResponse> {
    let body = request_body(&provider, &tool);
    let request = provider.client.post(provider.url()).json(&body);
    let request = match provider.endpoint {
        Endpoint::Public { .. } => request.bearer_auth(&provider.key),
        Endpoint::Azure { .. } => request.header("api-key", &provider.key),
    };
    let response = request
        .send()
        .await
        .with_context(|| "failed to reach the translation backend")?;

    let status = response.status();
    let retry_after = retry_after(response.headers());
    let text = response.text().await.unwrap_or_default();
    if status.is_success() {
        return extract_tool_response(&text, tool_name, &provider.model);
    }
    let message = extract_openai_error(&text).unwrap_or(text.clone());
    if is_rate_limited(status, &text) {
        return Err(RateLimited {
            status,
            retry_after,
            message,
        }
        .into());
    }
    Err(anyhow!("OpenAI API error ({}): {}", status, message))
}

pub(crate) fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: OpenAIResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let tool_call = payload
        .choices
        .first()
        .and_then(|choice| choice.message.tool_calls.first())
        .ok_or_else(|| anyhow!("no tool call returned from OpenAI"))?;

    if tool_call.function.name != tool_name {
        return Err(anyhow!(
            "unexpected tool name '{}' from OpenAI",
            tool_call.function.name
        ));
    }

    let args: serde_json::Value = serde_json::from_str(&tool_call.function.arguments)
        .with_context(|| "failed to parse OpenAI tool arguments")?;
    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let parts = [
        error.message,
        error.kind.map(|kind| format!("type: {}", kind)),
        error.code.map(|code| format!("code: {}", code)),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.trim().is_empty())
    .collect::<Vec<_>>();
    if parts.is_empty() {
        Some("unknown error".to_string())
    } else {
        Some(parts.join(" | "))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;

    #[test]
    fn openai_extract_tool_args_snapshot() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_tool_response.json"
        ));
        let response =
            extract_tool_response(payload, "deliver_translation", "gpt-4o-mini").unwrap();
        assert_json_snapshot!(response, @r#"
        {
          "args": {
            "translation": "copago"
          },
          "model": "gpt-4o-mini-2024-07-18",
          "usage": {
            "prompt_tokens": 182,
            "completion_tokens": 9,
            "total_tokens": 191
          }
        }
        "#);
    }

    #[test]
    fn wrong_tool_name_is_an_error() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_tool_response.json"
        ));
        let err = extract_tool_response(payload, "other_tool", "gpt-4o-mini").unwrap_err();
        assert!(err.to_string().contains("deliver_translation"));
    }

    #[test]
    fn error_bodies_are_summarized() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(
            extract_openai_error(body).as_deref(),
            Some("Invalid API key | type: invalid_request_error | code: invalid_api_key")
        );
        assert_eq!(extract_openai_error("not json"), None);
    }

    #[test]
    fn azure_body_omits_the_model() {
        let endpoint = Endpoint::Azure {
            base_url: "https://example.openai.azure.com/".to_string(),
            deployment: "translate".to_string(),
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
        };
        let tool = ToolSpec {
            name: "deliver_translation".to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        };
        let provider = OpenAI::new("key", endpoint)
            .expect("client")
            .append_system_input("system".to_string())
            .append_user_input("Copay".to_string());
        let body = request_body(&provider, &tool);
        assert!(body.get("model").is_none());
        assert_eq!(body["messages"][1]["content"], "Copay");
        assert_eq!(body["tool_choice"]["function"]["name"], "deliver_translation");
    }
}
