use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::events::JobEvent;
use crate::job::{JobAction, JobDescriptor};
use crate::sandbox::SandboxManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SandboxManager>,
    /// Parent of every job's cancellation token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl JobEvent {
    /// Render for the SSE feed.
    fn to_sse_event(&self) -> Event {
        match self {
            JobEvent::Log(line) => Event::default().event("log").data(line.replace('\r', "")),
            JobEvent::Progress(update) => Event::default().event("image").data(&update.image),
            JobEvent::Result(result) => Event::default()
                .event("result")
                .data(json!(result).to_string()),
            JobEvent::StreamError(message) => Event::default()
                .event("stream_error")
                .data(json!({ "message": message }).to_string()),
        }
    }
}

#[derive(Deserialize)]
struct ExecuteParams {
    action: JobAction,
    url: String,
    #[serde(default)]
    target: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/execute", get(execute_handler))
        .route("/api/v1/jobs", post(create_job_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled. In-flight jobs are cancelled with it.
pub async fn serve(
    addr: SocketAddr,
    manager: Arc<SandboxManager>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web UI running at http://{}", listener.local_addr()?);

    let state = AppState {
        manager,
        shutdown: shutdown.clone(),
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn execute_handler(
    State(state): State<AppState>,
    Query(params): Query<ExecuteParams>,
) -> Response {
    let descriptor = JobDescriptor::new(params.action, params.url, params.target);
    stream_job(state, descriptor).await
}

async fn create_job_handler(
    State(state): State<AppState>,
    Json(descriptor): Json<JobDescriptor>,
) -> Response {
    stream_job(state, descriptor).await
}

async fn stream_job(state: AppState, descriptor: JobDescriptor) -> Response {
    info!(action = %descriptor.action, url = %descriptor.url, "launching job");

    let cancel = state.shutdown.child_token();
    let feed = match state.manager.launch_job(&descriptor, cancel).await {
        Ok(feed) => feed,
        Err(e) => {
            error!(error = %e, "failed to run job");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to run job: {e}"),
            )
                .into_response();
        }
    };

    // A client that disconnects drops this stream and with it the feed, which
    // hands the sandbox to its supervisor for removal.
    let stream = feed.map(|event| Ok::<_, Infallible>(event.to_sse_event()));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Sandboxed Browser Jobs</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    min-height: 100vh;
  }
  header {
    padding: 24px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  header .dot.busy { background: #f59e0b; }
  .main {
    max-width: 900px;
    margin: 0 auto;
    padding: 24px 32px;
    display: flex;
    flex-direction: column;
    gap: 16px;
  }
  form { display: flex; gap: 8px; flex-wrap: wrap; }
  select, input, button {
    background: #111118;
    color: #e0e0e0;
    border: 1px solid #2a2a3e;
    border-radius: 8px;
    padding: 10px 12px;
    font-size: 14px;
  }
  input[name=url] { flex: 1; min-width: 240px; }
  input[name=target] { flex-basis: 100%; }
  button { background: #6366f1; border: none; color: #fff; cursor: pointer; }
  button:disabled { opacity: 0.5; cursor: default; }
  #log {
    font-family: ui-monospace, monospace;
    font-size: 12px;
    color: #9ca3af;
    background: #111118;
    border-radius: 8px;
    padding: 12px;
    max-height: 320px;
    overflow-y: auto;
    white-space: pre-wrap;
  }
  #live, #shot { max-width: 100%; border-radius: 8px; }
  #result { white-space: pre-wrap; line-height: 1.5; }
  .error { color: #ef4444; }
</style>
</head>
<body>
<header><div class="dot" id="dot"></div><h1>Sandboxed Browser Jobs</h1></header>
<div class="main">
  <form id="job">
    <select name="action">
      <option value="scrape">Scrape</option>
      <option value="describe">Describe</option>
      <option value="agent_act">Agent</option>
    </select>
    <input name="url" type="url" placeholder="https://example.com" required>
    <button type="submit" id="run">Run</button>
    <input name="target" placeholder="Instruction (optional)">
  </form>
  <img id="live" hidden>
  <div id="log"></div>
  <div id="result"></div>
  <img id="shot" hidden>
</div>
<script>
  const form = document.getElementById('job');
  const log = document.getElementById('log');
  const live = document.getElementById('live');
  const result = document.getElementById('result');
  const shot = document.getElementById('shot');
  const dot = document.getElementById('dot');
  const run = document.getElementById('run');

  function busy(on) { dot.classList.toggle('busy', on); run.disabled = on; }
  function append(text) {
    log.textContent += text + '\n';
    log.scrollTop = log.scrollHeight;
  }

  form.addEventListener('submit', (e) => {
    e.preventDefault();
    log.textContent = '';
    result.textContent = '';
    result.className = '';
    live.hidden = true;
    shot.hidden = true;
    busy(true);

    const params = new URLSearchParams(new FormData(form));
    const source = new EventSource('/execute?' + params.toString());
    const done = () => { source.close(); busy(false); };

    source.addEventListener('log', (ev) => append(ev.data));
    source.addEventListener('image', (ev) => {
      live.src = 'data:image/jpeg;base64,' + ev.data;
      live.hidden = false;
    });
    source.addEventListener('result', (ev) => {
      const r = JSON.parse(ev.data);
      live.hidden = true;
      if (r.success) {
        result.textContent = r.data || '';
      } else {
        result.textContent = r.error || 'Job failed';
        result.className = 'error';
      }
      if (r.image) {
        shot.src = 'data:image/jpeg;base64,' + r.image;
        shot.hidden = false;
      }
      done();
    });
    source.addEventListener('stream_error', (ev) => {
      result.textContent = 'Error reading logs: ' + JSON.parse(ev.data).message;
      result.className = 'error';
      done();
    });
    source.onerror = () => done();
  });
</script>
</body>
</html>
"##;
