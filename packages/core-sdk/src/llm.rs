use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use anyhow::anyhow;
use futures_util::{Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    StatusCode,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::models::{
    AuthScheme, ChatRequest, ModelInfo, NormalizedEvent, ProviderConfig, WireFormat,
};
use crate::parser::parse_chunk;
use crate::providers::{static_models, ProviderRegistry};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const EVENT_BUFFER: usize = 64;
const ERROR_BODY_EXCERPT: usize = 200;

/**
 * \brief 已构建好的 Provider 请求（流式与非流式共用）。
 */
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/**
 * \brief 按线格式构建请求；每种格式仅此一处，两条路径只在 `stream` 标志上不同。
 */
pub fn build_request(
    provider: &ProviderConfig,
    request: &ChatRequest,
    stream: bool,
) -> Result<PreparedRequest> {
    if provider.wire_format == WireFormat::Unsupported {
        return Err(ChatError::UnsupportedProvider(provider.id.clone()));
    }

    let base = provider.base_url.trim_end_matches('/');
    let params = &request.params;
    let system = request
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_auth(&mut headers, provider, request.api_key.as_deref())?;

    let (url, body) = match provider.wire_format {
        WireFormat::OpenAiCompatible => {
            if stream {
                headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            }
            let mut messages = Vec::new();
            if let Some(sys) = system {
                messages.push(json!({"role": "system", "content": sys}));
            }
            messages.push(json!({"role": "user", "content": request.prompt}));
            (
                format!("{}/chat/completions", base),
                json!({
                    "model": request.model,
                    "messages": messages,
                    "temperature": params.temperature,
                    "max_tokens": params.max_tokens,
                    "stream": stream,
                }),
            )
        }
        WireFormat::Anthropic => {
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
            if stream {
                headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            }
            let mut body = json!({
                "model": request.model,
                "messages": [{"role": "user", "content": request.prompt}],
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "stream": stream,
            });
            if let Some(sys) = system {
                body["system"] = json!(sys);
            }
            (format!("{}/messages", base), body)
        }
        WireFormat::Ollama => {
            let mut body = json!({
                "model": request.model,
                "prompt": request.prompt,
                "stream": stream,
                "options": {
                    "temperature": params.temperature,
                    "num_predict": params.max_tokens,
                },
            });
            if let Some(sys) = system {
                body["system"] = json!(sys);
            }
            (format!("{}/api/generate", base), body)
        }
        WireFormat::Unsupported => {
            return Err(ChatError::UnsupportedProvider(provider.id.clone()));
        }
    };

    Ok(PreparedRequest { url, headers, body })
}

fn apply_auth(
    headers: &mut HeaderMap,
    provider: &ProviderConfig,
    api_key: Option<&str>,
) -> Result<()> {
    match provider.auth {
        AuthScheme::None => {}
        AuthScheme::Bearer => {
            let key = require_key(provider, api_key)?;
            headers.insert(
                AUTHORIZATION,
                header_value(provider, &format!("Bearer {}", key))?,
            );
        }
        AuthScheme::ApiKeyHeader => {
            let key = require_key(provider, api_key)?;
            headers.insert("x-api-key", header_value(provider, key)?);
        }
    }
    Ok(())
}

fn require_key<'a>(provider: &ProviderConfig, api_key: Option<&'a str>) -> Result<&'a str> {
    api_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ChatError::MissingCredential(provider.id.clone()))
}

fn header_value(provider: &ProviderConfig, value: &str) -> Result<HeaderValue> {
    let mut v = HeaderValue::from_str(value)
        .map_err(|_| ChatError::InvalidCredential(provider.id.clone()))?;
    v.set_sensitive(true);
    Ok(v)
}

fn http_error(status: StatusCode, body: &str) -> ChatError {
    let reason = status.canonical_reason().unwrap_or("request failed");
    let excerpt: String = body.trim().chars().take(ERROR_BODY_EXCERPT).collect();
    let message = if excerpt.is_empty() {
        reason.to_string()
    } else {
        format!("{} - {}", reason, excerpt)
    };
    ChatError::Http {
        status: status.as_u16(),
        message,
    }
}

/**
 * \brief 流式引擎：为每次请求产生一个单向、可取消的统一事件序列。
 * \details 引擎本身只持有 HTTP 客户端与 Provider 目录，不跨调用保存任何状态。
 */
#[derive(Clone)]
pub struct StreamingEngine {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
}

impl StreamingEngine {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self::with_client(reqwest::Client::new(), Arc::new(registry))
    }

    pub fn with_client(client: reqwest::Client, registry: Arc<ProviderRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /**
     * \brief 发起流式请求。
     * \details 未知或不支持的 Provider 立即得到唯一的 `Error` 事件，不发出任何请求。
     *          必须在 tokio 运行时内调用。
     */
    pub fn stream(&self, request: &ChatRequest) -> ChatStream {
        let prepared = self
            .registry
            .resolve(&request.provider_id)
            .and_then(|p| Ok((p.wire_format, build_request(p, request, true)?)));
        let (format, prepared) = match prepared {
            Ok(v) => v,
            Err(e) => {
                warn!(provider = %request.provider_id, error = %e, "stream rejected before send");
                return ChatStream::failed(e.to_string());
            }
        };

        debug!(
            provider = %request.provider_id,
            model = %request.model,
            url = %prepared.url,
            "opening provider stream"
        );

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump(
            self.client.clone(),
            prepared,
            format,
            token.clone(),
            tx,
        ));
        ChatStream {
            rx,
            token,
            finished: false,
        }
    }

    /**
     * \brief 非流式调用，返回完整回复。
     */
    pub async fn chat_once(&self, request: &ChatRequest) -> Result<String> {
        let provider = self.registry.resolve(&request.provider_id)?;
        let prepared = build_request(provider, request, false)?;
        debug!(
            provider = %provider.id,
            model = %request.model,
            url = %prepared.url,
            "sending single-shot request"
        );

        let resp = self
            .client
            .post(&prepared.url)
            .headers(prepared.headers)
            .json(&prepared.body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(http_error(status, &text));
        }
        let text = resp.text().await?;
        let v: Value = serde_json::from_str(&text).map_err(|e| ChatError::Decode(e.to_string()))?;
        Ok(extract_full_response(provider.wire_format, &v))
    }

    /**
     * \brief 列出模型；任何失败都退化为空列表。
     */
    pub async fn list_models(&self, provider_id: &str, api_key: Option<&str>) -> Vec<ModelInfo> {
        let Some(provider) = self.registry.get(provider_id) else {
            warn!(provider = %provider_id, "list models for unknown provider");
            return Vec::new();
        };
        match self.fetch_models(provider, api_key).await {
            Ok(models) => models,
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "list models failed");
                Vec::new()
            }
        }
    }

    async fn fetch_models(
        &self,
        provider: &ProviderConfig,
        api_key: Option<&str>,
    ) -> anyhow::Result<Vec<ModelInfo>> {
        let base = provider.base_url.trim_end_matches('/');
        match provider.wire_format {
            WireFormat::OpenAiCompatible => {
                let mut req = self.client.get(format!("{}/models", base));
                if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
                    req = req.header(AUTHORIZATION, format!("Bearer {}", key.trim()));
                }
                let resp = req.send().await?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("list models failed: {} -> {}", status, text));
                }
                parse_model_list(resp.json().await?)
            }
            WireFormat::Ollama => {
                let resp = self.client.get(format!("{}/api/tags", base)).send().await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("ollama list models failed: {}", resp.status()));
                }
                parse_ollama_tags(resp.json().await?)
            }
            WireFormat::Anthropic | WireFormat::Unsupported => {
                Ok(static_models(provider.wire_format))
            }
        }
    }
}

/**
 * \brief 后台任务：发送请求并把规范化事件推入通道，遇到取消立即丢弃响应体。
 */
async fn pump(
    client: reqwest::Client,
    prepared: PreparedRequest,
    format: WireFormat,
    token: CancellationToken,
    tx: mpsc::Sender<NormalizedEvent>,
) {
    let send = client
        .post(&prepared.url)
        .headers(prepared.headers)
        .json(&prepared.body)
        .send();
    let resp = tokio::select! {
        _ = token.cancelled() => return,
        r = send => r,
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(NormalizedEvent::error(format!("request failed: {}", e)))
                .await;
            return;
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let text = tokio::select! {
            _ = token.cancelled() => return,
            t = resp.text() => t.unwrap_or_default(),
        };
        let err = http_error(status, &text);
        warn!(status = status.as_u16(), "provider rejected stream request");
        let _ = tx.send(NormalizedEvent::error(err.to_string())).await;
        return;
    }

    let events = normalize_byte_stream(format, resp.bytes_stream(), token.clone());
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        let sent = tokio::select! {
            _ = token.cancelled() => false,
            r = tx.send(event) => r.is_ok(),
        };
        if !sent || terminal {
            break;
        }
    }
}

/**
 * \brief 传输循环：增量 UTF-8 解码 → 行缓冲 → 分片解析。
 * \details 对任意切分方式产出相同的事件序列；读错误转为单个 `Error` 事件；取消后不再产出。
 */
pub fn normalize_byte_stream<S, B, E>(
    format: WireFormat,
    bytes: S,
    token: CancellationToken,
) -> impl Stream<Item = NormalizedEvent> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut decoder = Utf8Decoder::default();
        let mut lines = LineBuffer::default();

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => None,
                item = bytes.next() => Some(item),
            };
            let item = match next {
                None => return,
                Some(None) => break,
                Some(Some(item)) => item,
            };
            let text = match item {
                Ok(chunk) => decoder.decode(chunk.as_ref()),
                Err(e) => {
                    yield NormalizedEvent::error(format!("stream read failed: {}", e));
                    return;
                }
            };
            for line in lines.push(&text) {
                for event in parse_chunk(format, &line) {
                    yield event;
                }
            }
        }

        let tail = decoder.finish();
        let mut trailing = lines.push(&tail);
        trailing.extend(lines.finish());
        for line in trailing {
            for event in parse_chunk(format, &line) {
                yield event;
            }
        }
    }
}

/**
 * \brief 单次请求的事件流。
 * \details 第一个终止事件之后自动结束；`cancel` 之后不再产出任何事件。丢弃即取消。
 */
pub struct ChatStream {
    rx: mpsc::Receiver<NormalizedEvent>,
    token: CancellationToken,
    finished: bool,
}

impl ChatStream {
    fn failed(message: String) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(NormalizedEvent::error(message));
        Self {
            rx,
            token: CancellationToken::new(),
            finished: false,
        }
    }

    /** \brief 取消流；可重复调用，流已结束时为空操作。 */
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /** \brief 可跨任务传递的取消句柄。 */
    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller {
            token: self.token.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Stream for ChatStream {
    type Item = NormalizedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished || this.token.is_cancelled() {
            this.finished = true;
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/**
 * \brief `ChatStream` 的取消句柄。
 */
#[derive(Debug, Clone)]
pub struct StreamCanceller {
    token: CancellationToken,
}

impl StreamCanceller {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/**
 * \brief 增量 UTF-8 解码器，跨读取边界保留不完整的多字节序列。
 */
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, input: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(input);

        let mut out = String::with_capacity(buf.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&buf[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = buf.len();
                    break;
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&buf[start..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid + len;
                        }
                        None => {
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = buf[start..].to_vec();
        out
    }

    /** \brief 流结束时残留的不完整序列记为一个替换字符。 */
    pub(crate) fn finish(&mut self) -> String {
        if std::mem::take(&mut self.pending).is_empty() {
            String::new()
        } else {
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/**
 * \brief 行缓冲：按 `\n` 切分，保留最后一段不完整内容。
 */
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim_end_matches('\r');
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

fn extract_full_response(format: WireFormat, v: &Value) -> String {
    match format {
        WireFormat::OpenAiCompatible => extract_openai_content(v),
        WireFormat::Anthropic => extract_anthropic_content(v),
        WireFormat::Ollama => v
            .get("response")
            .and_then(Value::as_str)
            .or_else(|| {
                v.get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("")
            .to_string(),
        WireFormat::Unsupported => String::new(),
    }
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_anthropic_content(v: &Value) -> String {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn parse_model_list(v: Value) -> anyhow::Result<Vec<ModelInfo>> {
    let arr = v
        .get("data")
        .and_then(|x| x.as_array())
        .or_else(|| v.as_array())
        .ok_or_else(|| anyhow!("unexpected models payload: {}", v))?;
    Ok(arr
        .iter()
        .filter_map(|item| {
            let id = item
                .get("id")
                .and_then(|s| s.as_str())
                .or_else(|| item.as_str())?;
            let name = item.get("name").and_then(|s| s.as_str()).unwrap_or(id);
            Some(ModelInfo::new(id, name))
        })
        .collect())
}

fn parse_ollama_tags(v: Value) -> anyhow::Result<Vec<ModelInfo>> {
    let arr = v
        .get("models")
        .and_then(|x| x.as_array())
        .ok_or_else(|| anyhow!("unexpected ollama tags payload: {}", v))?;
    Ok(arr
        .iter()
        .filter_map(|item| item.get("name").and_then(|s| s.as_str()))
        .map(|name| ModelInfo::new(name, name))
        .collect())
}
