use std::{
    convert::Infallible,
    path::{Path as FsPath, PathBuf},
    sync::{Arc, RwLock},
};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::credentials::{CredentialStore, EnvCredentials};
use crate::error::ChatError;
use crate::llm::StreamingEngine;
use crate::models::{GenerationParams, Message, ModelInfo, WireFormat};
use crate::providers::ProviderRegistry;
use crate::session::{ChatSession, SessionEvent, TurnOutcome};
use crate::settings::Settings;
use crate::store::ConversationStore;
use crate::workspace::{FileStore, LocalFileStore};
use crate::{db, telemetry};

type ApiError = (StatusCode, String);

/**
 * \brief 各处理器共享的服务状态。
 */
#[derive(Clone)]
pub struct AppState {
    session: ChatSession,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<RwLock<Settings>>,
    db_path: Option<PathBuf>,
    files: Arc<dyn FileStore>,
}

impl AppState {
    pub fn new(
        session: ChatSession,
        credentials: Arc<dyn CredentialStore>,
        settings: Settings,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            session,
            credentials,
            settings: Arc::new(RwLock::new(settings)),
            db_path: None,
            files,
        }
    }

    /**
     * \brief 设置修改后写回的数据库文件。
     */
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /**
     * \brief 按默认组件装配：数据库中的设置与历史、环境变量凭据、本地工作区。
     */
    pub fn open(db_path: &FsPath, workspace_root: &FsPath) -> Result<Self> {
        let conn = db::open_db(db_path)?;
        db::migrate(&conn)?;
        let settings = Settings::load(&conn)?;
        telemetry::set_enabled(settings.telemetry_enabled);

        let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentials);
        let engine = StreamingEngine::new(ProviderRegistry::builtin());
        let store = ConversationStore::with_connection(db::open_db(db_path)?)?;
        let session = ChatSession::new(engine, store, credentials.clone());
        let loaded = session.load_history()?;
        info!(messages = loaded, db = %db_path.display(), "conversation restored");

        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(workspace_root)?);
        Ok(Self::new(session, credentials, settings, files).with_db_path(db_path))
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn registry(&self) -> &ProviderRegistry {
        self.session.engine().registry()
    }
}

/**
 * \brief 构建 API 路由（不含静态资源）。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/models", get(list_models))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/messages", get(get_messages).delete(clear_messages))
        .route("/api/chat/sse", get(chat_sse))
        .route("/api/chat/cancel", post(cancel_chat))
        .route("/api/files", get(list_files))
        .route("/api/files/{*path}", get(read_file).put(write_file))
        .route("/api/health", get(health_check))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let ui_root = std::env::var("CODEDECK_UI_DIR").unwrap_or_else(|_| "ui/dist".to_string());
    let static_handler = if FsPath::new(&ui_root).exists() {
        ServeDir::new(ui_root)
    } else {
        ServeDir::new("web")
    }
    .append_index_html_on_directories(true);

    let app = router(state).fallback_service(get_service(static_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize, Debug)]
struct ProviderItem {
    id: String,
    name: String,
    wire_format: WireFormat,
    default_model: Option<String>,
    description: String,
    requires_api_key: bool,
    has_credential: bool,
    chat_supported: bool,
}

#[derive(Serialize, Debug)]
struct ProvidersResponse {
    providers: Vec<ProviderItem>,
    selected: String,
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    provider_id: Option<String>,
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    provider_id: String,
    models: Vec<ModelInfo>,
}

#[derive(Deserialize, Debug, Default)]
struct SettingsPatch {
    provider_id: Option<String>,
    /** \brief 空字符串表示清除模型选择。 */
    model: Option<String>,
    params: Option<GenerationParams>,
    system_prompt: Option<String>,
    telemetry_enabled: Option<bool>,
}

#[derive(Serialize, Debug)]
struct MessagesResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize, Debug)]
struct ChatQuery {
    /** \brief 用户发送的消息 */
    prompt: String,
    /** \brief 覆盖设置中的 Provider（可选） */
    provider_id: Option<String>,
    /** \brief 覆盖设置中的模型（可选） */
    model: Option<String>,
    /** \brief 是否以流式请求上游（默认取设置） */
    stream: Option<bool>,
}

#[derive(Serialize, Debug)]
struct EndPayload {
    outcome: Option<TurnOutcome>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FileBody {
    content: String,
}

/**
 * \brief 获取 Provider 目录与当前选择。
 */
async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    let providers = state
        .registry()
        .all()
        .iter()
        .map(|p| ProviderItem {
            id: p.id.clone(),
            name: p.name.clone(),
            wire_format: p.wire_format,
            default_model: p.default_model.clone(),
            description: p.description.clone(),
            requires_api_key: p.requires_api_key(),
            has_credential: state.credentials.api_key(&p.id).is_some(),
            chat_supported: p.wire_format != WireFormat::Unsupported,
        })
        .collect();
    Json(ProvidersResponse {
        providers,
        selected: state.settings().provider_id,
    })
}

/**
 * \brief 列出模型；上游失败时返回空列表。
 */
async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let provider_id = q
        .provider_id
        .unwrap_or_else(|| state.settings().provider_id);
    state
        .registry()
        .resolve(&provider_id)
        .map_err(chat_err)?;
    let key = state.credentials.api_key(&provider_id);
    let models = state
        .session
        .engine()
        .list_models(&provider_id, key.as_deref())
        .await;
    Ok(Json(ModelsResponse {
        provider_id,
        models,
    }))
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings())
}

/**
 * \brief 合并更新设置并写回数据库。
 */
async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Settings>, ApiError> {
    let mut next = state.settings();
    if let Some(provider_id) = patch.provider_id {
        state
            .registry()
            .resolve(&provider_id)
            .map_err(chat_err)?;
        next.provider_id = provider_id;
    }
    if let Some(model) = patch.model {
        next.model = Some(model.trim().to_string()).filter(|m| !m.is_empty());
    }
    if let Some(params) = patch.params {
        if !(0.0..=2.0).contains(&params.temperature) || params.max_tokens == 0 {
            return Err(bad_request("temperature must be within 0.0..=2.0 and max_tokens > 0"));
        }
        next.params = params;
    }
    if let Some(prompt) = patch.system_prompt {
        next.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
    }
    if let Some(enabled) = patch.telemetry_enabled {
        next.telemetry_enabled = enabled;
    }

    if let Some(path) = state.db_path.as_ref() {
        let conn = db::open_db(path).map_err(internal_err)?;
        next.save(&conn).map_err(internal_err)?;
    }
    telemetry::set_enabled(next.telemetry_enabled);
    telemetry::log_event(
        "server.settings",
        &format!("provider={} model={:?}", next.provider_id, next.model),
    );
    if let Ok(mut guard) = state.settings.write() {
        *guard = next.clone();
    }
    Ok(Json(next))
}

async fn get_messages(State(state): State<AppState>) -> Json<MessagesResponse> {
    Json(MessagesResponse {
        messages: state.session.messages(),
    })
}

async fn clear_messages(
    State(state): State<AppState>,
) -> Result<Json<MessagesResponse>, ApiError> {
    state.session.clear().map_err(chat_err)?;
    Ok(Json(MessagesResponse {
        messages: Vec::new(),
    }))
}

/**
 * \brief 聊天 SSE 流接口：GET /api/chat/sse?prompt=...
 * \details 会话通知依次以 message/update/state/usage/error 事件转发，最后发送 end 事件。
 */
async fn chat_sse(
    State(state): State<AppState>,
    Query(q): Query<ChatQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if q.prompt.trim().is_empty() {
        return Err(chat_err(ChatError::EmptyInput));
    }
    if state.session.is_busy() {
        return Err(chat_err(ChatError::Busy));
    }

    let mut config = state.settings().turn_config();
    if let Some(provider_id) = q.provider_id {
        config.provider_id = provider_id;
    }
    if let Some(model) = q.model {
        config.model = Some(model);
    }
    if let Some(stream) = q.stream {
        config.params.stream = stream;
    }

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let session = state.session.clone();
    let mut events = session.subscribe();
    let prompt = q.prompt;

    tokio::spawn(async move {
        let turn = session.send(&prompt, &config);
        tokio::pin!(turn);
        let result = loop {
            tokio::select! {
                result = &mut turn => break Some(result),
                _ = tx.closed() => break None,
                event = events.recv() => match event {
                    Ok(event) => {
                        if tx.send(Ok(sse_event(&event))).is_err() {
                            break None;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sse subscriber lagged behind session events");
                    }
                    Err(RecvError::Closed) => {}
                },
            }
        };
        // 客户端断开时丢弃本轮，由会话的守卫取消上游请求并把占位消息标为 cancelled。
        let Some(result) = result else {
            info!("sse client disconnected, abandoning turn");
            return;
        };
        while let Ok(event) = events.try_recv() {
            let _ = tx.send(Ok(sse_event(&event)));
        }

        let payload = match result {
            Ok(outcome) => EndPayload {
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => {
                if matches!(e, ChatError::Busy | ChatError::EmptyInput) {
                    let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                }
                EndPayload {
                    outcome: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        let _ = tx.send(Ok(Event::default().event("end").data(data)));
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

fn sse_event(event: &SessionEvent) -> Event {
    let name = match event {
        SessionEvent::MessageAppended { .. } => "message",
        SessionEvent::MessageUpdated { .. } => "update",
        SessionEvent::StateChanged { .. } => "state",
        SessionEvent::Usage { .. } => "usage",
        SessionEvent::Error { .. } => "error",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

async fn cancel_chat(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.session.cancel();
    telemetry::log_event("server.chat", &format!("cancel requested={}", cancelled));
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn list_files(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state.files.list_files().map_err(internal_err)?;
    Ok(Json(serde_json::json!({ "files": files })))
}

async fn read_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = state.files.get_file(&path).map_err(|e| {
        (StatusCode::NOT_FOUND, e.to_string())
    })?;
    Ok(Json(serde_json::json!({ "path": path, "content": content })))
}

async fn write_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(body): Json<FileBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .files
        .update_file(&path, &body.content)
        .map_err(|e| bad_request(e.to_string()))?;
    telemetry::log_event(
        "server.files",
        &format!("write path={} bytes={}", path, body.content.len()),
    );
    Ok(Json(serde_json::json!({ "path": path, "ok": true })))
}

/**
 * \brief 健康检查。
 */
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "busy": state.session.is_busy(),
        "state": state.session.state(),
        "provider_id": state.settings().provider_id,
    }))
}

fn chat_err(e: ChatError) -> ApiError {
    let status = match &e {
        ChatError::Busy => StatusCode::CONFLICT,
        ChatError::EmptyInput => StatusCode::BAD_REQUEST,
        ChatError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
