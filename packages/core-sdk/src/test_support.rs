use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::Response,
    Router,
};
use futures_util::StreamExt;

use crate::models::{AuthScheme, ProviderConfig, WireFormat};
use crate::providers::ProviderRegistry;

/**
 * \brief 预置响应：状态码、按顺序发送的分片，以及发送完毕后是否挂起连接。
 */
#[derive(Clone)]
pub(crate) struct Canned {
    pub status: u16,
    pub chunks: Vec<Vec<u8>>,
    pub hang: bool,
}

impl Canned {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            chunks: vec![body.as_bytes().to_vec()],
            hang: false,
        }
    }

    pub fn chunked(chunks: &[&str]) -> Self {
        Self {
            status: 200,
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            hang: false,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            ..Self::ok(body)
        }
    }

    pub fn hanging(self) -> Self {
        Self { hang: true, ..self }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct FakeState {
    canned: Canned,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/**
 * \brief 本地假 Provider：回放预置的流式响应并统计请求次数。
 */
pub(crate) struct FakeProvider {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeProvider {
    pub async fn start(canned: Canned) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            canned,
            hits: hits.clone(),
            requests: requests.clone(),
        };
        let app = Router::new().fallback(replay).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake provider");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{}", addr),
            hits,
            requests,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().expect("requests lock").last().cloned()
    }

    /** \brief 指向本服务的四类 Provider。 */
    pub fn registry(&self) -> ProviderRegistry {
        let make = |id: &str, wire_format, auth| ProviderConfig {
            id: id.to_string(),
            name: id.to_string(),
            wire_format,
            base_url: self.base_url.clone(),
            auth,
            default_model: Some("test-model".to_string()),
            description: String::new(),
        };
        ProviderRegistry::new(vec![
            make("fake-openai", WireFormat::OpenAiCompatible, AuthScheme::Bearer),
            make("fake-anthropic", WireFormat::Anthropic, AuthScheme::ApiKeyHeader),
            make("fake-ollama", WireFormat::Ollama, AuthScheme::None),
            make("fake-unsupported", WireFormat::Unsupported, AuthScheme::Bearer),
        ])
    }
}

async fn replay(
    State(state): State<FakeState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(RecordedRequest {
            path: uri.path().to_string(),
            headers,
            body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
        });

    let chunks = futures_util::stream::iter(
        state
            .canned
            .chunks
            .clone()
            .into_iter()
            .map(Ok::<_, std::io::Error>),
    );
    let body = if state.canned.hang {
        Body::from_stream(chunks.chain(futures_util::stream::pending()))
    } else {
        Body::from_stream(chunks)
    };
    Response::builder()
        .status(StatusCode::from_u16(state.canned.status).expect("status"))
        .body(body)
        .expect("response")
}
