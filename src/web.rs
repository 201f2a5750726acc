use crate::annotate::{
    AnnotationPhase, HoverGeometry, HoverState, Rect, RenderedKind, TooltipPosition,
    estimate_tooltip_width, place_tooltip,
};
use crate::journal::{Journal, JournalError, Submission};
use crate::session::{Entry, Notebook, SessionData, SessionSummary, StoreError};
use crate::synonyms::SynonymMap;
use askama::Template;
use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use cookie::{Cookie, SameSite};
use markdown::{Options as MarkdownOptions, to_html_with_options};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, info, warn};

type SharedState = Arc<AppState>;

pub const SESSION_COOKIE: &str = "wordsprout_session";
const PALETTE: [&str; 6] = [
    "bg-amber-100",
    "bg-sky-100",
    "bg-emerald-100",
    "bg-rose-100",
    "bg-violet-100",
    "bg-lime-100",
];

#[derive(Clone)]
pub struct AppState {
    pub journal: Arc<Journal>,
    pub base_url: String,
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn serve(config: WebConfig, journal: Arc<Journal>) -> Result<(), WebError> {
    let state = Arc::new(AppState {
        journal,
        base_url: config.base_url.clone(),
    });
    let router = build_router(state);
    info!(%config.addr, base = %config.base_url, "Binding HTTP listener");
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JournalError> for ApiError {
    fn from(err: JournalError) -> Self {
        match &err {
            JournalError::EmptyEntry => ApiError::bad_request(err.to_string()),
            JournalError::EntryNotFound(_) | JournalError::SessionNotFound(_) => {
                ApiError::not_found(err.to_string())
            }
            JournalError::Store(StoreError::InvalidId { .. }) => {
                ApiError::bad_request(err.to_string())
            }
            JournalError::Store(StoreError::NotFound { .. }) => {
                ApiError::not_found(err.to_string())
            }
            JournalError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/entries", post(submit_entry_form))
        .route("/sessions/save", post(save_session_form))
        .route("/healthz", get(health))
        .route("/api/entries", get(api_entries).post(api_submit_entry))
        .route("/api/entries/:id/annotations", get(api_annotations))
        .route("/api/entries/:id/hover", post(api_hover))
        .route("/api/entries/:id/leave", post(api_leave))
        .route("/api/synonyms", post(api_synonyms))
        .route("/api/tooltip", post(api_tooltip))
        .route("/api/sessions", get(api_list_sessions).post(api_new_session))
        .route("/api/sessions/save", post(api_save_session))
        .route(
            "/api/sessions/:id",
            get(api_read_session)
                .put(api_rename_session)
                .delete(api_delete_session),
        )
        .route("/api/sessions/:id/load", post(api_load_session))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn session_cookie(id: &str) -> String {
    Cookie::build((SESSION_COOKIE, id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
        .to_string()
}

fn session_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "wordsprout-web" }))
}

/// The journal page. A browser holding a session cookie resumes that session
/// when the server has none active yet.
async fn home(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if state.journal.active_session().is_none() {
        if let Some(id) = session_from_cookies(&headers) {
            if let Err(err) = state.journal.load_session(&id).await {
                debug!(session = %id, error = %err, "could not resume session from cookie");
            }
        }
    }
    let sessions = match state.journal.list_sessions().await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "session list unavailable for journal page");
            Vec::new()
        }
    };
    match render_journal_page(&state, sessions) {
        Ok(html) => Html(html).into_response(),
        Err(err) => error_page(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct EntryForm {
    text: String,
}

async fn submit_entry_form(
    State(state): State<SharedState>,
    Form(form): Form<EntryForm>,
) -> Response {
    match state.journal.submit_entry(&form.text).await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(err) => {
            let api = ApiError::from(err);
            error_page(api.status, api.message)
        }
    }
}

async fn save_session_form(State(state): State<SharedState>) -> Response {
    match state.journal.save_session().await {
        Ok(id) => (
            [(header::SET_COOKIE, session_cookie(&id))],
            Redirect::to("/"),
        )
            .into_response(),
        Err(err) => {
            let api = ApiError::from(err);
            error_page(api.status, api.message)
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotebookParams {
    notebook: Option<Notebook>,
}

async fn api_entries(
    State(state): State<SharedState>,
    Query(params): Query<NotebookParams>,
) -> Json<Vec<Entry>> {
    Json(
        state
            .journal
            .entries(params.notebook.unwrap_or(Notebook::Journal)),
    )
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    text: String,
}

async fn api_submit_entry(
    State(state): State<SharedState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let submission = state.journal.submit_entry(&request.text).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn api_annotations(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.journal.render_entry(&id)?))
}

#[derive(Debug, Deserialize)]
struct HoverRequest {
    key: String,
    #[serde(flatten)]
    geometry: HoverGeometry,
}

async fn api_hover(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<HoverRequest>,
) -> Result<Json<Option<HoverState>>, ApiError> {
    Ok(Json(state.journal.hover(
        &id,
        &request.key,
        &request.geometry,
    )?))
}

async fn api_leave(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.journal.leave(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SynonymRequest {
    sentence: String,
}

async fn api_synonyms(
    State(state): State<SharedState>,
    Json(request): Json<SynonymRequest>,
) -> Result<Json<SynonymMap>, ApiError> {
    if request.sentence.trim().is_empty() {
        return Err(ApiError::bad_request("`sentence` cannot be empty"));
    }
    Ok(Json(state.journal.service().lookup(&request.sentence).await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TooltipRequest {
    word: Rect,
    container: Rect,
    viewport_width: f64,
    synonyms: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TooltipResponse {
    #[serde(flatten)]
    position: TooltipPosition,
    width: f64,
}

async fn api_tooltip(Json(request): Json<TooltipRequest>) -> Json<TooltipResponse> {
    let position = place_tooltip(
        &request.word,
        &request.container,
        request.viewport_width,
        &request.synonyms,
    );
    Json(TooltipResponse {
        position,
        width: estimate_tooltip_width(&request.synonyms),
    })
}

async fn api_list_sessions(
    State(state): State<SharedState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.journal.list_sessions().await?))
}

#[derive(Debug, Default, Deserialize)]
struct SessionNameRequest {
    #[serde(default)]
    name: String,
}

async fn api_new_session(
    State(state): State<SharedState>,
    Json(request): Json<SessionNameRequest>,
) -> Result<Response, ApiError> {
    let id = state.journal.new_session(&request.name).await?;
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, session_cookie(&id))],
        Json(json!({ "id": id })),
    )
        .into_response())
}

async fn api_save_session(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let id = state.journal.save_session().await?;
    Ok((
        [(header::SET_COOKIE, session_cookie(&id))],
        Json(json!({ "id": id })),
    )
        .into_response())
}

async fn api_read_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionData>, ApiError> {
    Ok(Json(state.journal.read_session(&id).await?))
}

async fn api_rename_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<SessionNameRequest>,
) -> Result<StatusCode, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("`name` cannot be empty"));
    }
    state.journal.rename_session(&id, &request.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_delete_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.journal.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_load_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.journal.load_session(&id).await?;
    Ok((
        [(header::SET_COOKIE, session_cookie(&id))],
        Json(state.journal.snapshot()),
    )
        .into_response())
}

struct WordSpan {
    text: String,
    key: String,
    interactive: bool,
    tooltip: String,
}

struct EntryBlock {
    id: String,
    color_class: &'static str,
    created: String,
    loading: bool,
    spans: Vec<WordSpan>,
}

struct ReplyBlock {
    color_class: &'static str,
    html: String,
}

fn color_class(index: u8) -> &'static str {
    PALETTE[index as usize % PALETTE.len()]
}

fn render_journal_page(
    state: &AppState,
    sessions: Vec<SessionSummary>,
) -> Result<String, askama::Error> {
    let snapshot = state.journal.snapshot();
    let entries = snapshot
        .journal_entries
        .iter()
        .filter_map(|entry| {
            let rendered = state.journal.render_entry(&entry.id).ok()?;
            let spans = rendered
                .tokens
                .into_iter()
                .map(|token| WordSpan {
                    interactive: token.interactive && token.kind == RenderedKind::Word,
                    tooltip: token.synonyms.map(|s| s.join(", ")).unwrap_or_default(),
                    key: token.key.unwrap_or_default(),
                    text: token.text,
                })
                .collect();
            Some(EntryBlock {
                id: entry.id.clone(),
                color_class: color_class(entry.color_index),
                created: entry.created_at.format("%b %-d, %H:%M").to_string(),
                loading: rendered.phase == AnnotationPhase::Loading,
                spans,
            })
        })
        .collect::<Vec<_>>();
    let replies = snapshot
        .buddy_entries
        .iter()
        .map(|entry| ReplyBlock {
            color_class: color_class(entry.color_index),
            html: render_markdown_str(&entry.text).unwrap_or_default(),
        })
        .collect();
    let any_loading = entries.iter().any(|entry| entry.loading);
    JournalTemplate {
        session_name: &snapshot.session_name,
        active_session: snapshot.session_id.as_deref().unwrap_or_default(),
        base_url: &state.base_url,
        entries,
        replies,
        sessions,
        any_loading,
        version: env!("CARGO_PKG_VERSION"),
    }
    .render()
}

fn error_page(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    let html = ErrorTemplate { message: &message }
        .render()
        .unwrap_or_else(|_| message.clone());
    (status, Html(html)).into_response()
}

/// Buddy replies come from a model, so raw HTML in them stays escaped.
fn markdown_options() -> MarkdownOptions {
    let mut options = MarkdownOptions::gfm();
    options.compile.allow_dangerous_html = false;
    options.compile.allow_dangerous_protocol = false;
    options
}

fn render_markdown_str(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let options = markdown_options();
    let html = to_html_with_options(trimmed, &options).unwrap_or_else(|_| trimmed.to_string());
    Some(html)
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>WordSprout • {{ session_name }}</title>
    <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
    <link rel="canonical" href="{{ base_url }}/">
    <style>
      .entry-text { white-space: pre-wrap; }
      .word.interactive { text-decoration: underline dotted; cursor: help; }
      .tooltip { position: absolute; transform: translate(-50%, -100%); pointer-events: none; }
    </style>
  </head>
  <body class="bg-slate-50 text-slate-900" data-active-session="{{ active_session }}">
    <main class="min-h-screen flex flex-col items-center justify-start py-10 px-4">
      <div class="max-w-5xl w-full space-y-6">
        <header class="flex flex-wrap items-end justify-between gap-3">
          <div>
            <p class="uppercase tracking-wide text-sm text-slate-500">WordSprout v{{ version }}</p>
            <h1 class="text-4xl font-extrabold tracking-tight">{{ session_name }}</h1>
          </div>
          <form method="post" action="/sessions/save">
            <button class="inline-flex items-center rounded-md bg-slate-900 px-4 py-2 text-white font-semibold shadow hover:bg-slate-800">Save journal</button>
          </form>
        </header>

        <form method="post" action="/entries" class="space-y-2">
          <label for="text" class="text-lg text-slate-600">What happened today?</label>
          <textarea id="text" name="text" rows="4" class="w-full rounded-md border border-slate-300 p-3" required></textarea>
          <button class="inline-flex items-center rounded-md bg-emerald-700 px-4 py-2 text-white font-semibold shadow hover:bg-emerald-600">Add entry</button>
        </form>

        <div class="grid gap-6 md:grid-cols-2">
          <section id="journal" class="space-y-3">
            <h2 class="text-xl font-semibold">My journal</h2>
            {% if entries.len() == 0 %}
            <p class="text-slate-500">No entries yet. Write your first one above!</p>
            {% endif %}
            {% for entry in entries %}
            <article class="relative rounded p-4 shadow {{ entry.color_class }}" data-entry="{{ entry.id }}" data-loading="{{ entry.loading }}">
              <p class="text-xs text-slate-500 mb-1">{{ entry.created }}</p>
              <p class="entry-text">{% for span in entry.spans %}{% if span.interactive %}<span class="word interactive" data-key="{{ span.key }}" title="{{ span.tooltip }}">{{ span.text }}</span>{% else %}{{ span.text }}{% endif %}{% endfor %}</p>
              <div class="tooltip rounded bg-slate-900 px-3 py-1 text-sm text-white shadow" hidden></div>
            </article>
            {% endfor %}
          </section>

          <section id="buddy" class="space-y-3">
            <h2 class="text-xl font-semibold">Sprout says</h2>
            {% for reply in replies %}
            <article class="rounded p-4 shadow prose prose-slate max-w-none {{ reply.color_class }}">{{ reply.html|safe }}</article>
            {% endfor %}
          </section>
        </div>

        {% if sessions.len() > 0 %}
        <section id="sessions">
          <h2 class="text-xl font-semibold mb-2">Saved journals</h2>
          <ul class="space-y-1">
            {% for session in sessions %}
            <li class="flex justify-between border-b border-slate-200 py-1">
              <span>{{ session.name }} <span class="text-xs text-slate-500">({{ session.entry_count }} entries)</span></span>
              <button class="text-blue-700 hover:underline" data-session="{{ session.id }}">Open</button>
            </li>
            {% endfor %}
          </ul>
        </section>
        {% endif %}
      </div>
    </main>
    <script>
      const rectOf = (el) => {
        const r = el.getBoundingClientRect();
        return { left: r.left, top: r.top, width: r.width, height: r.height };
      };
      document.querySelectorAll("[data-entry]").forEach((container) => {
        const entryId = container.dataset.entry;
        const tip = container.querySelector(".tooltip");
        container.querySelectorAll(".word.interactive").forEach((word) => {
          word.addEventListener("mouseenter", async () => {
            const body = { key: word.dataset.key, word: rectOf(word), container: rectOf(container), viewportWidth: window.innerWidth };
            const res = await fetch(`/api/entries/${entryId}/hover`, { method: "POST", headers: { "content-type": "application/json" }, body: JSON.stringify(body) });
            const hover = res.ok ? await res.json() : null;
            if (!hover) return;
            tip.textContent = hover.activeSynonyms.join(", ");
            tip.style.left = `${hover.tooltipPosition.x}px`;
            tip.style.top = `${hover.tooltipPosition.y}px`;
            tip.hidden = false;
          });
          word.addEventListener("mouseleave", () => {
            tip.hidden = true;
            fetch(`/api/entries/${entryId}/leave`, { method: "POST" });
          });
        });
      });
      document.querySelectorAll("[data-session]").forEach((button) => {
        button.addEventListener("click", async () => {
          await fetch(`/api/sessions/${button.dataset.session}/load`, { method: "POST" });
          location.reload();
        });
      });
      {% if any_loading %}
      setTimeout(() => location.reload(), 1500);
      {% endif %}
    </script>
  </body>
</html>"#,
    ext = "html"
)]
struct JournalTemplate<'a> {
    session_name: &'a str,
    active_session: &'a str,
    base_url: &'a str,
    entries: Vec<EntryBlock>,
    replies: Vec<ReplyBlock>,
    sessions: Vec<SessionSummary>,
    any_loading: bool,
    version: &'static str,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>WordSprout • Error</title>
    <script src="https://cdn.jsdelivr.net/npm/@tailwindcss/browser@4"></script>
  </head>
  <body class="bg-slate-50 text-slate-900">
    <main class="min-h-screen flex flex-col items-center justify-start py-10 px-4">
      <div class="max-w-5xl w-full space-y-6">
        <h1 class="text-4xl font-extrabold tracking-tight">Something went wrong</h1>
        <p class="text-lg text-slate-600">{{ message }}</p>
        <a href="/" class="inline-flex items-center rounded-md bg-slate-900 px-4 py-2 text-white font-semibold shadow hover:bg-slate-800">Back to my journal</a>
      </div>
    </main>
  </body>
</html>"#,
    ext = "html"
)]
struct ErrorTemplate<'a> {
    message: &'a str,
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use crate::buddy::BuddyReplier;
    use crate::cache::SynonymService;
    use crate::llm::testing::ScriptedGenerator;
    use crate::session::MemorySessionStore;
    use crate::synonyms::SynonymProvider;
    use axum::{body, body::Body, http::Request};
    use std::time::Duration;
    use tower::ServiceExt;

    const SAD: &str = r#"{"sad": ["unhappy", "gloomy", "downhearted"]}"#;

    fn test_router() -> Router {
        let service = Arc::new(SynonymService::new(SynonymProvider::new(Arc::new(
            ScriptedGenerator::always(SAD),
        ))));
        let buddy = BuddyReplier::new(Arc::new(ScriptedGenerator::always(
            "That sounds **hard**. What happened next?",
        )));
        let journal = Journal::new(service, buddy, Arc::new(MemorySessionStore::new()));
        let state = Arc::new(AppState {
            journal: Arc::new(journal),
            base_url: "http://127.0.0.1:8080".to_string(),
        });
        build_router(state)
    }

    fn json_request(method: &str, uri: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(router: &Router, text: &str) -> serde_json::Value {
        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/entries", json!({ "text": text })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await
    }

    async fn ready_annotations(router: &Router, id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let response = router
                .clone()
                .oneshot(
                    Request::get(format!("/api/entries/{id}/annotations"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert!(response.status().is_success());
            let payload: serde_json::Value = json_body(response).await;
            if payload["phase"] == "ready" {
                return payload;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("annotations for {id} never became ready");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = test_router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let payload: serde_json::Value = json_body(response).await;
        assert_eq!(payload["status"], "ok");
    }

    #[tokio::test]
    async fn submitted_entry_gets_annotations_and_reply() {
        let router = test_router();
        let submission = submit(&router, "I was sad today.").await;
        let id = submission["entry"]["id"].as_str().unwrap().to_string();
        assert_eq!(
            submission["reply"]["text"],
            "That sounds **hard**. What happened next?"
        );

        let annotations = ready_annotations(&router, &id).await;
        let interactive: Vec<_> = annotations["tokens"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|token| token["interactive"] == true)
            .map(|token| token["text"].as_str().unwrap())
            .collect();
        assert_eq!(interactive, vec!["sad"]);

        let response = router
            .clone()
            .oneshot(
                Request::get("/api/entries?notebook=buddy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let replies: Vec<Entry> = json_body(response).await;
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn blank_entry_is_bad_request() {
        let response = test_router()
            .oneshot(json_request("POST", "/api/entries", json!({ "text": "  " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload: serde_json::Value = json_body(response).await;
        assert!(payload["error"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        let response = test_router()
            .oneshot(
                Request::get("/api/entries/missing/annotations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hover_returns_clamped_position() {
        let router = test_router();
        let submission = submit(&router, "Sad.").await;
        let id = submission["entry"]["id"].as_str().unwrap().to_string();
        let annotations = ready_annotations(&router, &id).await;
        let key = annotations["tokens"][0]["key"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/entries/{id}/hover"),
                json!({
                    "key": key,
                    "word": { "left": 0.0, "top": 100.0, "width": 30.0, "height": 18.0 },
                    "container": { "left": 0.0, "top": 40.0, "width": 400.0, "height": 200.0 },
                    "viewportWidth": 400.0
                }),
            ))
            .await
            .unwrap();
        assert!(response.status().is_success());
        let hover: serde_json::Value = json_body(response).await;
        assert_eq!(hover["activeSynonyms"][0], "unhappy");
        let synonyms: Vec<String> =
            serde_json::from_value(hover["activeSynonyms"].clone()).unwrap();
        let half = estimate_tooltip_width(&synonyms) / 2.0;
        let x = hover["tooltipPosition"]["x"].as_f64().unwrap();
        assert!((x - half - 10.0).abs() < 1e-9);

        let response = router
            .clone()
            .oneshot(
                Request::post(format!("/api/entries/{id}/leave"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let annotations = ready_annotations(&router, &id).await;
        assert_eq!(annotations["phase"], "ready");
        assert!(annotations.get("hover").is_none());
    }

    #[tokio::test]
    async fn tooltip_endpoint_centers_when_room() {
        let response = test_router()
            .oneshot(json_request(
                "POST",
                "/api/tooltip",
                json!({
                    "word": { "left": 200.0, "top": 120.0, "width": 40.0, "height": 18.0 },
                    "container": { "left": 50.0, "top": 100.0, "width": 400.0, "height": 300.0 },
                    "viewportWidth": 1024.0,
                    "synonyms": ["big"]
                }),
            ))
            .await
            .unwrap();
        let payload: TooltipResponse = json_body(response).await;
        assert_eq!(payload.position.x, 170.0);
        assert_eq!(payload.position.y, 12.0);
        assert_eq!(payload.width, 60.0 + 3.0 * 7.0 + 24.0);
    }

    #[tokio::test]
    async fn synonyms_endpoint_uses_provider() {
        let response = test_router()
            .oneshot(json_request(
                "POST",
                "/api/synonyms",
                json!({ "sentence": "I was sad" }),
            ))
            .await
            .unwrap();
        let payload: SynonymMap = json_body(response).await;
        assert_eq!(payload["sad"], vec!["unhappy", "gloomy", "downhearted"]);
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let router = test_router();
        let submission = submit(&router, "I was sad.").await;
        ready_annotations(&router, submission["entry"]["id"].as_str().unwrap()).await;

        let response = router
            .clone()
            .oneshot(Request::post("/api/sessions/save").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with(SESSION_COOKIE));
        let saved: serde_json::Value = json_body(response).await;
        let id = saved["id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(Request::get("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let sessions: Vec<SessionSummary> = json_body(response).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entry_count, 2);

        let response = router
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/sessions/{id}"),
                json!({ "name": "Rainy week" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/sessions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let data: SessionData = json_body(response).await;
        assert_eq!(data.name, "Rainy week");
        assert!(data.vocabulary_data.contains_key("i was sad"));

        let response = router
            .clone()
            .oneshot(
                Request::post(format!("/api/sessions/{id}/load"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());

        let response = router
            .clone()
            .oneshot(
                Request::delete(format!("/api/sessions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/sessions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn journal_page_marks_interactive_words() {
        let router = test_router();
        let submission = submit(&router, "I was <b>sad</b> today. Sad.").await;
        let id = submission["entry"]["id"].as_str().unwrap().to_string();
        ready_annotations(&router, &id).await;

        let response = router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains(r#"class="word interactive""#));
        assert!(html.contains("unhappy, gloomy, downhearted"));
        assert!(!html.contains("<b>sad</b>"));
        assert!(html.contains("<strong>hard</strong>"));
        assert!(html.contains(r#"data-loading="false""#));
    }

    #[tokio::test]
    async fn form_submission_redirects_home() {
        let response = test_router()
            .oneshot(
                Request::post("/entries")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("text=I+saw+a+frog."))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[test]
    fn cookie_value_is_read_back() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("theme=dark; {SESSION_COOKIE}=abc123").parse().unwrap(),
        );
        assert_eq!(session_from_cookies(&headers).as_deref(), Some("abc123"));
        assert!(session_cookie("abc123").contains("HttpOnly"));
    }

    #[test]
    fn model_html_stays_escaped() {
        let html = render_markdown_str("Nice! <script>alert(1)</script>").unwrap();
        assert!(!html.contains("<script>"));
    }
}
