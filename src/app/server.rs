//! HTTP / WebSocket listener
//!
//! Responsibilities:
//! - Accept plain HTTP and route it to the pages and `/metrics`
//! - Intercept every `Upgrade: websocket` request, on any path, and hand the
//!   upgraded socket to a new [`Session`]
//! - Stop accepting on shutdown and wait (bounded) for live sessions

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Request, State},
    http::{
        header::{CONTENT_TYPE, HOST},
        HeaderMap, StatusCode,
    },
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::common::Result;
use crate::identity::parse_identifier;
use crate::session::{Session, SessionContext};

use super::metrics::{init_metrics, render};
use super::pages::{self, PublicHost};

/// How long shutdown waits for sessions to release their sockets
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Live-session bookkeeping for numbering and drain
#[derive(Default)]
struct SessionTracker {
    next_id: AtomicU64,
    live: AtomicUsize,
    drained: Notify,
}

impl SessionTracker {
    fn enter(self: &Arc<Self>) -> (u64, LiveSession) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.fetch_add(1, Ordering::AcqRel);
        (id, LiveSession(Arc::clone(self)))
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.live() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a running session, releases its slot on drop
struct LiveSession(Arc<SessionTracker>);

impl Drop for LiveSession {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    ctx: SessionContext,
    shutdown: broadcast::Sender<()>,
    sessions: Arc<SessionTracker>,
    max_message_size: usize,
}

impl AppState {
    pub fn new(
        ctx: SessionContext,
        shutdown: broadcast::Sender<()>,
        max_message_size: usize,
    ) -> Self {
        Self {
            ctx,
            shutdown,
            sessions: Arc::new(SessionTracker::default()),
            max_message_size,
        }
    }

    /// Number of sessions currently running
    pub fn live_sessions(&self) -> usize {
        self.sessions.live()
    }
}

/// Build the router: pages, metrics, and the upgrade interceptor
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/index.html", get(landing))
        .route("/metrics", get(metrics))
        .route("/:id", get(client_config))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), intercept_upgrade))
        .with_state(state)
}

/// Route upgrades to a tunnel session before path routing
async fn intercept_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    upgrade: Option<WebSocketUpgrade>,
    request: Request,
    next: Next,
) -> Response {
    let Some(upgrade) = upgrade else {
        return next.run(request).await;
    };

    let (id, live) = state.sessions.enter();
    let tag = format!("session #{}", id);
    let shutdown = state.shutdown.subscribe();
    let ctx = state.ctx.clone();
    info!("[{}] Accepted from {} on {}", tag, peer, request.uri().path());

    upgrade
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(|e| debug!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            let (tx, rx) = socket.split();
            Session::new(tag, ctx, tx, rx, shutdown).run().await;
            drop(live);
        })
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(pages::landing(&state.ctx.identity))
}

async fn client_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = &state.ctx.identity;
    if parse_identifier(&id) != Some(identity.id()) {
        return not_found().await.into_response();
    }

    let public = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(PublicHost::parse);
    match public {
        Some(public) => Html(pages::config_page(identity, &public)).into_response(),
        None => (StatusCode::BAD_REQUEST, "400 Bad Request").into_response(),
    }
}

async fn metrics() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(),
    )
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

/// Bound listener, ready to serve
pub struct Server {
    listener: TcpListener,
    state: AppState,
}

impl Server {
    /// Bind the listening socket; failing here is fatal for the process
    pub async fn bind(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        init_metrics();
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal, then drain live sessions
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        let state = self.state.clone();
        let mut shutdown_rx = state.shutdown.subscribe();
        let app = build_router(self.state);

        info!(
            "Listening on http://{} (protocol: {})",
            addr,
            state.ctx.identity.framing()
        );

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Listener shutting down");
        })
        .await?;

        let live = state.live_sessions();
        if live > 0 {
            info!("Waiting for {} session(s) to close", live);
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, state.sessions.wait_drained())
            .await
            .is_err()
        {
            warn!(
                "{} session(s) still open after {:?}",
                state.live_sessions(),
                DRAIN_TIMEOUT
            );
        }
        Ok(())
    }
}
