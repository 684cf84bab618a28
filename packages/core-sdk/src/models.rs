use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/**
 * \brief 流式响应的线格式族，每个变体自带请求构建与分片解析逻辑。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /** \brief `data: {...}` 形式的 SSE，OpenAI/Groq/OpenRouter 等兼容服务。 */
    OpenAiCompatible,
    /** \brief 带 `type` 判别字段的 SSE（Anthropic Messages）。 */
    Anthropic,
    /** \brief 无 SSE 包装的逐行 JSON（Ollama）。 */
    Ollama,
    /** \brief 仅用于展示，不支持对话。 */
    Unsupported,
}

/**
 * \brief 鉴权头形态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /** \brief `Authorization: Bearer <key>` */
    Bearer,
    /** \brief `x-api-key: <key>` + `anthropic-version` */
    ApiKeyHeader,
    /** \brief 无需凭据（本地服务）。 */
    None,
}

/**
 * \brief Provider 静态配置，启动时构建后不可变。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /** \brief 唯一键，如 "openai" */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    pub wire_format: WireFormat,
    /** \brief API 基地址（不含结尾斜杠） */
    pub base_url: String,
    pub auth: AuthScheme,
    pub default_model: Option<String>,
    pub description: String,
}

impl ProviderConfig {
    pub fn requires_api_key(&self) -> bool {
        self.auth != AuthScheme::None
    }
}

/**
 * \brief 生成参数。流式与非流式共用同一组默认值。
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            stream: true,
        }
    }
}

/**
 * \brief 单轮对话请求。`api_key` 不会出现在 Debug 输出中。
 */
#[derive(Clone)]
pub struct ChatRequest {
    pub provider_id: String,
    pub api_key: Option<String>,
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("provider_id", &self.provider_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("prompt_len", &self.prompt.len())
            .field("system_prompt", &self.system_prompt.is_some())
            .field("params", &self.params)
            .finish()
    }
}

/**
 * \brief Token 计数，各字段均可缺省。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /**
     * \brief 合并分段上报的计数：新值缺省时保留旧值，两端计数齐全时重算总数。
     */
    pub fn merge(&mut self, other: TokenUsage) {
        self.prompt_tokens = other.prompt_tokens.or(self.prompt_tokens);
        self.completion_tokens = other.completion_tokens.or(self.completion_tokens);
        self.total_tokens = match (self.prompt_tokens, self.completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => other.total_tokens.or(self.total_tokens),
        };
    }
}

/**
 * \brief 与线格式无关的统一流事件。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Content { text: String },
    Usage(TokenUsage),
    Done { finish_reason: Option<String> },
    Error { message: String },
}

impl NormalizedEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn done(finish_reason: Option<&str>) -> Self {
        Self::Done {
            finish_reason: finish_reason.map(str::to_string),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /** \brief `Done` 与 `Error` 为终止事件。 */
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/**
 * \brief 消息状态；除 `Streaming` 外均为冻结态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Streaming => "streaming",
            MessageStatus::Complete => "complete",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(MessageStatus::Streaming),
            "complete" => Some(MessageStatus::Complete),
            "failed" => Some(MessageStatus::Failed),
            "cancelled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

/**
 * \brief 会话消息，由 ConversationStore 独占持有。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief UUID v4 字符串 */
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    /** \brief 创建时间（Unix 毫秒） */
    pub created_at: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            status: MessageStatus::Complete,
            created_at: now_millis(),
        }
    }

    /** \brief 助手占位消息：空内容，处于接收状态。 */
    pub fn assistant_placeholder() -> Self {
        Self {
            status: MessageStatus::Streaming,
            ..Self::new(Role::Assistant, "")
        }
    }
}

/**
 * \brief 模型选择器条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
