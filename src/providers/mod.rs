use anyhow::{anyhow, Result};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

mod openai;
pub mod retry;

pub use openai::{Endpoint, OpenAI};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Azure,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Azure => "azure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            content,
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            content,
        }
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;

/// A chat backend built up message by message, then asked to call one tool.
pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
}

/// Everything needed to reach a backend, resolved from flags, settings and env.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub key: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,
    pub ca_cert: Option<PathBuf>,
}

pub fn build_provider(config: &ProviderConfig) -> Result<OpenAI> {
    let endpoint = match config.kind {
        ProviderKind::OpenAI => Endpoint::Public {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string()),
        },
        ProviderKind::Azure => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| anyhow!("AZURE_OPENAI_ENDPOINT is required for Azure"))?;
            let deployment = config
                .azure_deployment
                .clone()
                .or_else(|| config.model.clone())
                .ok_or_else(|| anyhow!("an Azure deployment name is required"))?;
            Endpoint::Azure {
                base_url,
                deployment,
                api_version: config
                    .azure_api_version
                    .clone()
                    .unwrap_or_else(|| openai::DEFAULT_AZURE_API_VERSION.to_string()),
            }
        }
    };

    let mut provider = OpenAI::new(config.key.clone(), endpoint)?;
    if let Some(path) = &config.ca_cert {
        provider = provider.with_ca_cert(path)?;
    }
    if let Some(model) = &config.model {
        provider = provider.with_model(model.clone());
    }
    Ok(provider)
}

/// Picks the backend from the environment: Azure when its endpoint is set, else OpenAI.
pub fn resolve_provider_config(
    model: Option<&str>,
    override_key: Option<&str>,
    ca_cert: Option<PathBuf>,
) -> Result<ProviderConfig> {
    let ca_cert = ca_cert.or_else(|| get_env("TRANSLATOR_CA_CERT").map(PathBuf::from));
    let model = model
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if let Some(endpoint) = get_env("AZURE_OPENAI_ENDPOINT") {
        let key = resolve_key(ProviderKind::Azure, override_key)?;
        return Ok(ProviderConfig {
            kind: ProviderKind::Azure,
            key,
            model,
            base_url: Some(endpoint),
            azure_deployment: get_env("AZURE_OPENAI_DEPLOYMENT"),
            azure_api_version: get_env("AZURE_OPENAI_API_VERSION"),
            ca_cert,
        });
    }

    let key = resolve_key(ProviderKind::OpenAI, override_key)?;
    Ok(ProviderConfig {
        kind: ProviderKind::OpenAI,
        key,
        model,
        base_url: get_env("OPENAI_BASE_URL"),
        azure_deployment: None,
        azure_api_version: None,
        ca_cert,
    })
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key.filter(|key| !key.trim().is_empty()) {
        return Ok(key.to_string());
    }

    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Azure => get_env("AZURE_OPENAI_KEY"),
    }
    .ok_or_else(|| {
        anyhow!(
            "API key not found for {} (checked OPENAI_API_KEY, AZURE_OPENAI_KEY)",
            provider.as_str()
        )
    })
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
