use crate::tm::asyncutil::tasks;
use crate::tm::logger::tm_event;
use crate::tm::manager::{JobManager, StatusEntry};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DASHBOARD_HTML: &str = include_str!("../../templates/dashboard.html");

/// Read-only status server. Runs as a background worker so shell
/// interaction is never blocked by HTTP traffic; a failed bind is logged
/// and supervision continues without the dashboard.
pub fn start_status_server(
    mgr: Arc<JobManager>,
    bind: SocketAddr,
    shutting_down: Arc<AtomicBool>,
) {
    tasks().spawn(async move {
        let app = Router::new()
            .route("/", get(dashboard))
            .route("/api/status", get(api_status))
            .fallback(not_found)
            .with_state(mgr);

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                tm_event("web", None, format!("status_server disabled: bind {bind} failed: {e}"));
                return;
            }
        };
        tm_event("web", None, format!("status_server listening bind={bind}"));

        let shutdown = async move {
            while !shutting_down.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tm_event("web", None, format!("status_server stopped: {e}"));
        }
    });
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn api_status(State(mgr): State<Arc<JobManager>>) -> Json<Vec<StatusEntry>> {
    Json(mgr.status())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
