use crate::error::{ChatError, Result};
use crate::models::{AuthScheme, ModelInfo, ProviderConfig, WireFormat};

/**
 * \brief 已知 Provider 目录，仅做查找。
 */
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self { providers }
    }

    /**
     * \brief 内置 Provider 目录。
     */
    pub fn builtin() -> Self {
        Self::new(vec![
            provider(
                "openai",
                "OpenAI",
                WireFormat::OpenAiCompatible,
                "https://api.openai.com/v1",
                AuthScheme::Bearer,
                Some("gpt-4o-mini"),
                "OpenAI GPT-4o, GPT-4o mini and more.",
            ),
            provider(
                "openrouter",
                "OpenRouter",
                WireFormat::OpenAiCompatible,
                "https://openrouter.ai/api/v1",
                AuthScheme::Bearer,
                Some("openai/gpt-4o-mini"),
                "Unified gateway for many hosted models.",
            ),
            provider(
                "groq",
                "Groq",
                WireFormat::OpenAiCompatible,
                "https://api.groq.com/openai/v1",
                AuthScheme::Bearer,
                Some("llama-3.1-70b-versatile"),
                "Low-latency inference for LLaMA models.",
            ),
            provider(
                "anthropic",
                "Anthropic",
                WireFormat::Anthropic,
                "https://api.anthropic.com/v1",
                AuthScheme::ApiKeyHeader,
                Some("claude-3-5-sonnet-latest"),
                "Claude 3.x family.",
            ),
            provider(
                "ollama",
                "Local (Ollama)",
                WireFormat::Ollama,
                "http://localhost:11434",
                AuthScheme::None,
                Some("llama3.1"),
                "Local models via Ollama.",
            ),
            provider(
                "cursor",
                "Cursor AI",
                WireFormat::Unsupported,
                "",
                AuthScheme::Bearer,
                Some("claude-3-5-sonnet-latest"),
                "Listed for model selection only; chat is not available.",
            ),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /**
     * \brief 查找 Provider，不存在时返回配置错误。
     */
    pub fn resolve(&self, id: &str) -> Result<&ProviderConfig> {
        self.get(id)
            .ok_or_else(|| ChatError::UnknownProvider(id.to_string()))
    }

    pub fn all(&self) -> &[ProviderConfig] {
        &self.providers
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn provider(
    id: &str,
    name: &str,
    wire_format: WireFormat,
    base_url: &str,
    auth: AuthScheme,
    default_model: Option<&str>,
    description: &str,
) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        name: name.to_string(),
        wire_format,
        base_url: base_url.to_string(),
        auth,
        default_model: default_model.map(str::to_string),
        description: description.to_string(),
    }
}

/**
 * \brief 不提供模型列表接口的 Provider 使用的静态模型表。
 */
pub(crate) fn static_models(format: WireFormat) -> Vec<ModelInfo> {
    match format {
        WireFormat::Anthropic | WireFormat::Unsupported => vec![
            ModelInfo::new("claude-3-5-sonnet-latest", "Claude 3.5 Sonnet"),
            ModelInfo::new("claude-3-5-haiku-latest", "Claude 3.5 Haiku"),
        ],
        WireFormat::OpenAiCompatible | WireFormat::Ollama => Vec::new(),
    }
}
