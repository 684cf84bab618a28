use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::error::{ChatError, Result};
use crate::llm::StreamingEngine;
use crate::models::{
    ChatRequest, GenerationParams, Message, MessageStatus, NormalizedEvent, Role, TokenUsage,
    WireFormat,
};
use crate::store::ConversationStore;
use crate::telemetry;

const EVENT_CAPACITY: usize = 256;

/**
 * \brief 单轮对话配置，通常由 `Settings::turn_config` 生成。
 * \details `api_key` 优先于凭据存储中的值。
 */
#[derive(Clone, Default)]
pub struct TurnConfig {
    pub provider_id: String,
    pub model: Option<String>,
    pub params: GenerationParams,
    pub system_prompt: Option<String>,
    pub api_key: Option<String>,
}

impl fmt::Debug for TurnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnConfig")
            .field("provider_id", &self.provider_id)
            .field("model", &self.model)
            .field("params", &self.params)
            .field("system_prompt", &self.system_prompt.is_some())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Streaming,
    NonStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Complete,
    Failed,
    Cancelled,
}

impl Settlement {
    fn status(self) -> MessageStatus {
        match self {
            Settlement::Complete => MessageStatus::Complete,
            Settlement::Failed => MessageStatus::Failed,
            Settlement::Cancelled => MessageStatus::Cancelled,
        }
    }
}

/**
 * \brief 对话轮次状态机。
 * \details Idle → Validating → AwaitingResponse → Applying → Settled；校验失败直接进入 Settled(Failed)。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "detail", rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Validating,
    AwaitingResponse(ResponseMode),
    Applying,
    Settled(Settlement),
}

/**
 * \brief 推送给界面的会话通知。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageAppended {
        message: Message,
    },
    MessageUpdated {
        id: String,
        content: String,
        status: MessageStatus,
    },
    StateChanged {
        state: TurnState,
    },
    Usage {
        usage: TokenUsage,
    },
    Error {
        message: String,
    },
}

/**
 * \brief 一轮对话的结果。失败与取消同样以 `Ok` 返回，错误信息在 `error` 中。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub settlement: Settlement,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

struct Applied {
    settlement: Settlement,
    content: String,
    usage: Option<TokenUsage>,
    error: Option<String>,
}

impl Applied {
    fn new() -> Self {
        Self {
            settlement: Settlement::Complete,
            content: String::new(),
            usage: None,
            error: None,
        }
    }
}

struct SessionInner {
    engine: StreamingEngine,
    credentials: Arc<dyn CredentialStore>,
    store: Mutex<ConversationStore>,
    state: Mutex<TurnState>,
    busy: AtomicBool,
    active: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<SessionEvent>,
}

/**
 * \brief 对话会话控制器：同一时刻最多一轮进行中。
 * \details 克隆开销很小，各克隆共享同一会话。
 */
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        engine: StreamingEngine,
        store: ConversationStore,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                engine,
                credentials,
                store: Mutex::new(store),
                state: Mutex::new(TurnState::Idle),
                busy: AtomicBool::new(false),
                active: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn engine(&self) -> &StreamingEngine {
        &self.inner.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        *lock(&self.inner.state)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /** \brief 当前消息快照（插入顺序）。 */
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.store).messages().to_vec()
    }

    /**
     * \brief 载入持久化的历史消息。
     */
    pub fn load_history(&self) -> Result<usize> {
        let _guard = self.inner.begin()?;
        let count = lock(&self.inner.store).load_persisted()?;
        Ok(count)
    }

    /**
     * \brief 清空会话；进行中的轮次会使其返回 `Busy`。
     */
    pub fn clear(&self) -> Result<()> {
        let _guard = self.inner.begin()?;
        lock(&self.inner.store).clear();
        self.inner.set_state(TurnState::Idle);
        telemetry::log_event("session.clear", "conversation cleared");
        Ok(())
    }

    /**
     * \brief 取消进行中的轮次；没有进行中的轮次时返回 false。
     */
    pub fn cancel(&self) -> bool {
        match lock(&self.inner.active).as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                info!("turn cancellation requested");
                true
            }
            _ => false,
        }
    }

    /**
     * \brief 发送一条用户消息并驱动本轮直至结束。
     * \details 空输入返回 `EmptyInput` 且不写入任何消息；配置错误会保留用户消息、发布错误并返回该错误。
     */
    pub async fn send(&self, input: &str, config: &TurnConfig) -> Result<TurnOutcome> {
        let inner = &*self.inner;
        let mut guard = inner.begin()?;
        inner.set_state(TurnState::Validating);

        if input.trim().is_empty() {
            inner.set_state(TurnState::Settled(Settlement::Failed));
            return Err(ChatError::EmptyInput);
        }

        let user = Message::new(Role::User, input);
        let user_message_id = user.id.clone();
        let request = match inner.validate(input, config) {
            Ok(request) => request,
            Err(e) => {
                inner.append(user);
                error!(provider = %config.provider_id, error = %e, "turn rejected during validation");
                telemetry::log_error(
                    "session.turn",
                    &format!("provider={} rejected: {}", config.provider_id, e),
                );
                inner.publish(SessionEvent::Error {
                    message: e.to_string(),
                });
                inner.set_state(TurnState::Settled(Settlement::Failed));
                return Err(e);
            }
        };

        inner.append(user);
        let placeholder = Message::assistant_placeholder();
        let assistant_message_id = placeholder.id.clone();
        inner.append(placeholder);
        guard.assistant_id = Some(assistant_message_id.clone());

        let token = CancellationToken::new();
        *lock(&inner.active) = Some(token.clone());

        let mode = if request.params.stream {
            ResponseMode::Streaming
        } else {
            ResponseMode::NonStreaming
        };
        info!(
            provider = %request.provider_id,
            model = %request.model,
            ?mode,
            prompt_len = request.prompt.len(),
            "turn started"
        );
        inner.set_state(TurnState::AwaitingResponse(mode));

        let applied = match mode {
            ResponseMode::Streaming => {
                inner
                    .run_streaming(&request, &assistant_message_id, &token)
                    .await
            }
            ResponseMode::NonStreaming => {
                inner
                    .run_single(&request, &assistant_message_id, &token)
                    .await
            }
        };

        inner.settle(&assistant_message_id, applied.settlement);
        match applied.settlement {
            Settlement::Failed => telemetry::log_error(
                "session.turn",
                &format!(
                    "provider={} model={} failed: {}",
                    request.provider_id,
                    request.model,
                    applied.error.as_deref().unwrap_or("unknown")
                ),
            ),
            settlement => telemetry::log_event(
                "session.turn",
                &format!(
                    "provider={} model={} settled={:?} chars={}",
                    request.provider_id,
                    request.model,
                    settlement,
                    applied.content.chars().count()
                ),
            ),
        }
        info!(settlement = ?applied.settlement, chars = applied.content.len(), "turn settled");

        Ok(TurnOutcome {
            settlement: applied.settlement,
            user_message_id,
            assistant_message_id,
            content: applied.content,
            usage: applied.usage,
            error: applied.error,
        })
    }
}

impl SessionInner {
    fn begin(&self) -> Result<TurnGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::Busy)?;
        Ok(TurnGuard {
            inner: self,
            assistant_id: None,
        })
    }

    fn validate(&self, input: &str, config: &TurnConfig) -> Result<ChatRequest> {
        let provider = self.engine.registry().resolve(&config.provider_id)?;
        if provider.wire_format == WireFormat::Unsupported {
            return Err(ChatError::UnsupportedProvider(provider.id.clone()));
        }
        let api_key = config
            .api_key
            .clone()
            .or_else(|| self.credentials.api_key(&provider.id))
            .filter(|k| !k.trim().is_empty());
        if provider.requires_api_key() && api_key.is_none() {
            return Err(ChatError::MissingCredential(provider.id.clone()));
        }
        let model = config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| provider.default_model.clone())
            .ok_or_else(|| ChatError::MissingModel(provider.id.clone()))?;
        Ok(ChatRequest {
            provider_id: provider.id.clone(),
            api_key,
            model,
            prompt: input.to_string(),
            system_prompt: config.system_prompt.clone(),
            params: config.params,
        })
    }

    async fn run_streaming(
        &self,
        request: &ChatRequest,
        assistant_id: &str,
        token: &CancellationToken,
    ) -> Applied {
        let mut stream = self.engine.stream(request);
        let mut applied = Applied::new();
        let mut applying = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    applied.settlement = Settlement::Cancelled;
                    break;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            if !applying {
                applying = true;
                self.set_state(TurnState::Applying);
            }
            match event {
                NormalizedEvent::Content { text } => {
                    applied.content.push_str(&text);
                    self.write_content(assistant_id, &applied.content);
                }
                NormalizedEvent::Usage(usage) => {
                    let merged = applied.usage.get_or_insert_with(TokenUsage::default);
                    merged.merge(usage);
                    let usage = *merged;
                    self.publish(SessionEvent::Usage { usage });
                }
                NormalizedEvent::Done { finish_reason } => {
                    debug!(?finish_reason, "stream finished");
                    break;
                }
                NormalizedEvent::Error { message } => {
                    warn!(provider = %request.provider_id, error = %message, "stream failed");
                    self.publish(SessionEvent::Error {
                        message: message.clone(),
                    });
                    applied.settlement = Settlement::Failed;
                    applied.error = Some(message);
                    break;
                }
            }
        }
        stream.cancel();
        applied
    }

    async fn run_single(
        &self,
        request: &ChatRequest,
        assistant_id: &str,
        token: &CancellationToken,
    ) -> Applied {
        let mut applied = Applied::new();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.engine.chat_once(request) => Some(result),
        };
        match result {
            None => applied.settlement = Settlement::Cancelled,
            Some(Ok(text)) => {
                self.set_state(TurnState::Applying);
                self.write_content(assistant_id, &text);
                applied.content = text;
            }
            Some(Err(e)) => {
                warn!(provider = %request.provider_id, error = %e, "single-shot request failed");
                let message = e.to_string();
                self.publish(SessionEvent::Error {
                    message: message.clone(),
                });
                applied.settlement = Settlement::Failed;
                applied.error = Some(message);
            }
        }
        applied
    }

    fn append(&self, message: Message) {
        let event = SessionEvent::MessageAppended {
            message: message.clone(),
        };
        if let Err(e) = lock(&self.store).append(message) {
            warn!(error = %e, "failed to append message");
            return;
        }
        self.publish(event);
    }

    fn write_content(&self, id: &str, content: &str) {
        if let Err(e) = lock(&self.store).update_content(id, content) {
            warn!(message_id = %id, error = %e, "failed to apply content");
            return;
        }
        self.publish(SessionEvent::MessageUpdated {
            id: id.to_string(),
            content: content.to_string(),
            status: MessageStatus::Streaming,
        });
    }

    fn settle(&self, id: &str, settlement: Settlement) {
        let status = settlement.status();
        let content = {
            let mut store = lock(&self.store);
            if let Err(e) = store.set_status(id, status) {
                warn!(message_id = %id, error = %e, "failed to finalize message");
            }
            store.get(id).map(|m| m.content.clone()).unwrap_or_default()
        };
        self.publish(SessionEvent::MessageUpdated {
            id: id.to_string(),
            content,
            status,
        });
        self.set_state(TurnState::Settled(settlement));
    }

    fn set_state(&self, state: TurnState) {
        *lock(&self.state) = state;
        debug!(?state, "turn state changed");
        self.publish(SessionEvent::StateChanged { state });
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/**
 * \brief 轮次守卫：无论以何种方式结束都会清除忙标志；若轮次被中途丢弃，占位消息记为取消。
 */
struct TurnGuard<'a> {
    inner: &'a SessionInner,
    assistant_id: Option<String>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.assistant_id.take() {
            let open = lock(&self.inner.store)
                .get(&id)
                .map(|m| !m.status.is_frozen())
                .unwrap_or(false);
            if open {
                warn!(message_id = %id, "turn dropped before settling");
                self.inner.settle(&id, Settlement::Cancelled);
            }
        }
        if let Some(token) = lock(&self.inner.active).take() {
            token.cancel();
        }
        self.inner.busy.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::credentials::MemoryCredentials;
    use crate::models::{AuthScheme, ProviderConfig};
    use crate::providers::ProviderRegistry;
    use crate::test_support::{Canned, FakeProvider};

    fn session_for(fake: &FakeProvider, creds: MemoryCredentials) -> ChatSession {
        ChatSession::new(
            StreamingEngine::new(fake.registry()),
            ConversationStore::in_memory(),
            Arc::new(creds),
        )
    }

    fn config(provider_id: &str) -> TurnConfig {
        TurnConfig {
            provider_id: provider_id.to_string(),
            ..TurnConfig::default()
        }
    }

    fn keyed() -> MemoryCredentials {
        MemoryCredentials::new().with_key("fake-openai", "sk-test")
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[SessionEvent]) -> Vec<TurnState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_content(rx: &mut broadcast::Receiver<SessionEvent>, expected: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::MessageUpdated { content, .. }) if content == expected => {
                        return
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("content update");
    }

    #[tokio::test]
    async fn test_streaming_turn_openai() {
        let fake = FakeProvider::start(Canned::ok(
            "data: {\"choices\":[{\"delta\":{\"content\":\"4\"}}]}\n\ndata: [DONE]\n\n",
        ))
        .await;
        let session = session_for(&fake, keyed());
        let mut rx = session.subscribe();

        let outcome = session.send("2+2?", &config("fake-openai")).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Complete);
        assert_eq!(outcome.content, "4");
        assert!(outcome.error.is_none());

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "2+2?");
        assert_eq!(messages[1].id, outcome.assistant_message_id);
        assert_eq!(messages[1].content, "4");
        assert_eq!(messages[1].status, MessageStatus::Complete);

        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                TurnState::Validating,
                TurnState::AwaitingResponse(ResponseMode::Streaming),
                TurnState::Applying,
                TurnState::Settled(Settlement::Complete),
            ]
        );
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_streaming_turn_ollama_accumulates() {
        let fake = FakeProvider::start(Canned::chunked(&[
            "{\"response\":\"Hi\"}\n",
            "{\"response\":\" there\"}\n{\"done\":true,\"done_reason\":\"stop\",",
            "\"prompt_eval_count\":3,\"eval_count\":2}\n",
        ]))
        .await;
        let session = session_for(&fake, MemoryCredentials::new());
        let mut rx = session.subscribe();

        let outcome = session.send("hello", &config("fake-ollama")).await.unwrap();
        assert_eq!(outcome.content, "Hi there");
        assert_eq!(
            outcome.usage,
            Some(TokenUsage {
                prompt_tokens: Some(3),
                completion_tokens: Some(2),
                total_tokens: Some(5),
            })
        );

        let updates: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::MessageUpdated {
                    content,
                    status: MessageStatus::Streaming,
                    ..
                } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec!["Hi".to_string(), "Hi there".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_request() {
        let fake = FakeProvider::start(Canned::ok("data: [DONE]\n")).await;
        let session = session_for(&fake, MemoryCredentials::new());
        let mut rx = session.subscribe();

        let err = session
            .send("2+2?", &config("fake-openai"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential(_)));
        assert!(err.to_string().contains("credential missing"));

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(session.state(), TurnState::Settled(Settlement::Failed));
        assert_eq!(fake.hits(), 0);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { message } if message.contains("credential missing"))));
        assert_eq!(
            states(&events),
            vec![
                TurnState::Validating,
                TurnState::Settled(Settlement::Failed)
            ]
        );
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_http_error_keeps_empty_placeholder_and_allows_retry() {
        let fake = FakeProvider::start(Canned::status(429, "rate limited")).await;
        let session = session_for(&fake, keyed());

        let outcome = session.send("2+2?", &config("fake-openai")).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Failed);
        assert!(outcome.error.as_deref().unwrap_or("").contains("429"));

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "");
        assert_eq!(messages[1].status, MessageStatus::Failed);

        let retry = session.send("2+2?", &config("fake-openai")).await.unwrap();
        assert_eq!(retry.settlement, Settlement::Failed);
        assert_eq!(fake.hits(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_stores_nothing() {
        let fake = FakeProvider::start(Canned::ok("data: [DONE]\n")).await;
        let session = session_for(&fake, keyed());
        let err = session
            .send("   \n", &config("fake-openai"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyInput));
        assert!(session.messages().is_empty());
        assert_eq!(session.state(), TurnState::Settled(Settlement::Failed));
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_anthropic_usage_is_merged_across_events() {
        let fake = FakeProvider::start(Canned::chunked(&[
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]))
        .await;
        let creds = MemoryCredentials::new().with_key("fake-anthropic", "sk-ant-test");
        let session = session_for(&fake, creds);
        let mut rx = session.subscribe();

        let outcome = session.send("hello", &config("fake-anthropic")).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Complete);
        assert_eq!(outcome.content, "Hi");
        let expected = TokenUsage {
            prompt_tokens: Some(12),
            completion_tokens: Some(2),
            total_tokens: Some(14),
        };
        assert_eq!(outcome.usage, Some(expected));

        let last_usage = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Usage { usage } => Some(usage),
                _ => None,
            })
            .last();
        assert_eq!(last_usage, Some(expected));
    }

    #[tokio::test]
    async fn test_unknown_provider_and_missing_model() {
        let fake = FakeProvider::start(Canned::ok("data: [DONE]\n")).await;
        let session = session_for(&fake, keyed());
        let err = session.send("hi", &config("nope")).await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownProvider(_)));
        assert_eq!(session.messages().len(), 1);

        let bare = ProviderRegistry::new(vec![ProviderConfig {
            id: "bare".into(),
            name: "Bare".into(),
            wire_format: WireFormat::Ollama,
            base_url: fake.base_url.clone(),
            auth: AuthScheme::None,
            default_model: None,
            description: String::new(),
        }]);
        let session = ChatSession::new(
            StreamingEngine::new(bare),
            ConversationStore::in_memory(),
            Arc::new(MemoryCredentials::new()),
        );
        let err = session.send("hi", &config("bare")).await.unwrap_err();
        assert!(matches!(err, ChatError::MissingModel(_)));
        assert_eq!(fake.hits(), 0);
    }

    #[tokio::test]
    async fn test_busy_then_cancel_keeps_partial_content() {
        let fake = FakeProvider::start(
            Canned::ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n").hanging(),
        )
        .await;
        let session = session_for(&fake, keyed());
        let mut rx = session.subscribe();
        assert!(!session.cancel());

        let running = session.clone();
        let turn =
            tokio::spawn(async move { running.send("greet", &config("fake-openai")).await });
        wait_for_content(&mut rx, "Hel").await;

        let err = session.send("again", &config("fake-openai")).await.unwrap_err();
        assert!(matches!(err, ChatError::Busy));
        assert!(matches!(session.clear(), Err(ChatError::Busy)));

        assert!(session.cancel());
        let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
            .await
            .expect("turn settles")
            .expect("join")
            .expect("outcome");
        assert_eq!(outcome.settlement, Settlement::Cancelled);
        assert_eq!(outcome.content, "Hel");

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hel");
        assert_eq!(messages[1].status, MessageStatus::Cancelled);
        assert!(!session.cancel());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_dropped_turn_releases_session() {
        let fake = FakeProvider::start(
            Canned::ok("data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n").hanging(),
        )
        .await;
        let session = session_for(&fake, keyed());
        let mut rx = session.subscribe();

        let running = session.clone();
        let turn =
            tokio::spawn(async move { running.send("greet", &config("fake-openai")).await });
        wait_for_content(&mut rx, "par").await;
        turn.abort();
        assert!(turn.await.unwrap_err().is_cancelled());

        assert!(!session.is_busy());
        assert_eq!(session.state(), TurnState::Settled(Settlement::Cancelled));
        assert_eq!(session.messages()[1].status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_completes() {
        let fake = FakeProvider::start(Canned::ok("{\"response\":\"partial\"}\n")).await;
        let session = session_for(&fake, MemoryCredentials::new());
        let outcome = session.send("hi", &config("fake-ollama")).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Complete);
        assert_eq!(outcome.content, "partial");
    }

    #[tokio::test]
    async fn test_non_streaming_turn_sets_content_once() {
        let fake = FakeProvider::start(Canned::ok(
            r#"{"choices":[{"message":{"role":"assistant","content":"The answer is 4."}}]}"#,
        ))
        .await;
        let session = session_for(&fake, MemoryCredentials::new());
        let mut rx = session.subscribe();
        let mut cfg = config("fake-openai");
        cfg.api_key = Some("sk-inline".into());
        cfg.params.stream = false;

        let outcome = session.send("2+2?", &cfg).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Complete);
        assert_eq!(outcome.content, "The answer is 4.");

        let recorded = fake.last_request().unwrap();
        assert_eq!(recorded.body["stream"], false);
        assert_eq!(recorded.headers["authorization"], "Bearer sk-inline");

        let events = drain(&mut rx);
        let streaming_updates = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::MessageUpdated {
                        status: MessageStatus::Streaming,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(streaming_updates, 1);
        assert!(states(&events)
            .contains(&TurnState::AwaitingResponse(ResponseMode::NonStreaming)));
    }

    #[tokio::test]
    async fn test_clear_resets_conversation() {
        let fake = FakeProvider::start(Canned::ok("{\"response\":\"ok\",\"done\":true}\n")).await;
        let session = session_for(&fake, MemoryCredentials::new());
        session.send("hi", &config("fake-ollama")).await.unwrap();
        assert_eq!(session.messages().len(), 2);
        session.clear().unwrap();
        assert!(session.messages().is_empty());
        assert_eq!(session.state(), TurnState::Idle);
    }

    #[test]
    fn test_turn_config_debug_redacts_key() {
        let mut cfg = config("openai");
        cfg.api_key = Some("sk-secret".into());
        let dbg = format!("{:?}", cfg);
        assert!(!dbg.contains("sk-secret"));
    }
}
