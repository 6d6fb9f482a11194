//! Axum + Askama control panel for daywall: force/exit buttons and recent
//! notifications, served on localhost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use daywall_core::{Notification, Notifier, UiEvent};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "daywall-web";

pub const FEED_CAPACITY: usize = 20;

/// Bounded in-memory history of outcome notifications, newest first.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    entries: Mutex<VecDeque<Notification>>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: Notification) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_front(notification);
        entries.truncate(FEED_CAPACITY);
    }

    pub fn recent(&self) -> Vec<Notification> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl Notifier for NotificationFeed {
    fn notify(&self, title: &str, message: &str) {
        info!(title, message, "notification");
        self.push(Notification::now(title, message));
    }
}

#[derive(Clone)]
pub struct AppState {
    pub events: mpsc::UnboundedSender<UiEvent>,
    pub feed: Arc<NotificationFeed>,
    pub trigger_at: String,
}

impl AppState {
    pub fn new(
        events: mpsc::UnboundedSender<UiEvent>,
        feed: Arc<NotificationFeed>,
        trigger_at: impl Into<String>,
    ) -> Self {
        Self {
            events,
            feed,
            trigger_at: trigger_at.into(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    trigger_at: String,
    notifications: Vec<Notification>,
}

#[derive(Template)]
#[template(path = "exiting.html")]
struct ExitingTemplate {
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/force", post(force_handler))
        .route("/exit", post(exit_handler))
        .route("/notifications", get(notifications_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serve the control panel until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control panel listening");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(IndexTemplate {
        trigger_at: state.trigger_at.clone(),
        notifications: state.feed.recent(),
    })
}

async fn force_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.events.send(UiEvent::ForceRequested) {
        Ok(()) => Redirect::to("/").into_response(),
        Err(_) => bridge_gone(),
    }
}

async fn exit_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.events.send(UiEvent::ExitRequested) {
        Ok(()) => render_html(ExitingTemplate { service: "daywall" }),
        Err(_) => bridge_gone(),
    }
}

async fn notifications_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.feed.recent()).into_response()
}

async fn health_handler() -> Response {
    Json(HealthBody {
        status: "ok",
        service: "daywall",
    })
    .into_response()
}

fn bridge_gone() -> Response {
    warn!("ui event received after the bridge stopped");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "daywall is shutting down",
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
