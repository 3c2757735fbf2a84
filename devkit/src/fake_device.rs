/*!
Fake Shelly device for tests

Serves every GET on a local port with the configured status code, body and
delay. Tests change the response between requests to simulate outages,
missing probes or garbage bodies, and read back how many requests arrived.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Reply {
    status: u16,
    body: String,
    delay: Duration,
}

#[derive(Default)]
struct Seen {
    last_path: Option<String>,
    last_authorization: Option<String>,
}

#[derive(Clone)]
struct Shared {
    reply: Arc<Mutex<Reply>>,
    seen: Arc<Mutex<Seen>>,
    hits: Arc<AtomicUsize>,
}

pub struct FakeShelly {
    addr: SocketAddr,
    shared: Shared,
    server: JoinHandle<()>,
}

impl FakeShelly {
    /// Bind on an ephemeral localhost port; answers `200 {}` until told otherwise
    pub async fn start() -> Result<Self> {
        env_logger::try_init().ok();

        let shared = Shared {
            reply: Arc::new(Mutex::new(Reply {
                status: 200,
                body: "{}".to_string(),
                delay: Duration::ZERO,
            })),
            seen: Arc::new(Mutex::new(Seen::default())),
            hits: Arc::new(AtomicUsize::new(0)),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(answer).with_state(shared.clone());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("fake device on {} stopped: {}", addr, e);
            }
        });
        log::info!("fake Shelly listening on {}", addr);

        Ok(Self { addr, shared, server })
    }

    /// `host:port`, as written in an `on_premise.host` setting
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn set_json(&self, document: Value) {
        self.shared.reply.lock().body = document.to_string();
    }

    pub fn set_raw_body(&self, body: &str) {
        self.shared.reply.lock().body = body.to_string();
    }

    pub fn set_status(&self, status: u16) {
        self.shared.reply.lock().status = status;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.shared.reply.lock().delay = delay;
    }

    /// Requests received so far
    pub fn hits(&self) -> usize {
        self.shared.hits.load(Ordering::SeqCst)
    }

    pub fn last_path(&self) -> Option<String> {
        self.shared.seen.lock().last_path.clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.shared.seen.lock().last_authorization.clone()
    }
}

impl Drop for FakeShelly {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn answer(State(shared): State<Shared>, uri: Uri, headers: HeaderMap) -> Response {
    shared.hits.fetch_add(1, Ordering::SeqCst);
    {
        let mut seen = shared.seen.lock();
        seen.last_path = Some(uri.path().to_string());
        seen.last_authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let reply = shared.reply.lock().clone();
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], reply.body).into_response()
}
