//! Dev Dispatcher (C11): the per-request pipeline binding every other
//! component together — resolve, read, transform, respond — plus the HMR
//! HTTP surface from `spec.md` §6.

use crate::cas::Cas;
use crate::data::{ContentHash, ModuleId, ModuleKind, PendingModule, UpdateReason};
use crate::error::ProtocolError;
use crate::graph::GraphStore;
use crate::hash::hash_bytes;
use crate::hmr::{HmrCoordinator, HmrEvent};
use crate::path_mapper;
use crate::resolver::Resolver;
use crate::scan::extract_specifiers;
use crate::transform::TransformEngine;
use crate::watch::{ChangeKind, FsWatcher};
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::Handle;
use futures_util::stream::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

const HMR_CLIENT_JS: &str = include_str!("./hmr_client.js");

pub struct AppState {
    pub root: PathBuf,
    pub graph: Arc<GraphStore>,
    pub resolver: Arc<Resolver>,
    pub transform: Arc<TransformEngine>,
    pub cas: Arc<Cas>,
    pub hmr: Arc<HmrCoordinator>,
    pub watcher: Arc<FsWatcher>,
}

pub(crate) type ServerResult<T> = Result<T, ServerError>;

pub(crate) struct ServerError(pub anyhow::Error);

impl<E> From<E> for ServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ServerError(err.into())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "error handling request");
        let mut res = Response::new(Body::from("internal error"));
        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        res
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/__ionify_hmr", get(hmr_subscribe))
        .route("/__ionify_hmr_client.js", get(hmr_client))
        .route("/__ionify_hmr/apply", post(hmr_apply))
        .route("/__ionify_hmr/error", post(hmr_error))
        .fallback(get(serve_module))
        .with_state(state)
}

async fn hmr_client() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        HMR_CLIENT_JS,
    )
}

async fn hmr_subscribe(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (_id, rx) = state.hmr.subscribe(64);
    // The coordinator prunes a subscriber lazily on the next broadcast that
    // finds its sink closed or full, rather than on an explicit unsubscribe
    // here, so a dropped connection cleans itself up without extra wiring.
    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        let name = match &event {
            HmrEvent::Ready => "ready",
            HmrEvent::Update { .. } => "update",
            HmrEvent::Error { .. } => "error",
        };
        Ok(Event::default().event(name).data(payload))
    });
    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[derive(Deserialize)]
struct ApplyBody {
    id: String,
}

async fn hmr_apply(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> ServerResult<Response> {
    let parsed: ApplyBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            let err = ProtocolError::Malformed(e.to_string());
            return Ok((StatusCode::BAD_REQUEST, err.to_string()).into_response());
        }
    };

    let Some(pending) = state.hmr.consume(&parsed.id) else {
        let err = ProtocolError::UnknownUpdate(parsed.id);
        return Ok((StatusCode::NOT_FOUND, err.to_string()).into_response());
    };

    let mut modules = Vec::with_capacity(pending.modules.len());
    for module in &pending.modules {
        if module.reason == UpdateReason::Deleted {
            modules.push(serde_json::json!({
                "url": module.url,
                "hash": null,
                "deps": [],
                "reason": "deleted",
                "status": "deleted",
            }));
            continue;
        }

        match re_transform(&state, &module.abs_path).await {
            Ok((code, hash)) => modules.push(serde_json::json!({
                "url": module.url,
                "hash": hash.to_hex(),
                "deps": [],
                "reason": format!("{:?}", module.reason).to_lowercase(),
                "status": "ok",
                "code": code,
            })),
            Err(err) => {
                state
                    .hmr
                    .broadcast_error(Some(pending.id.clone()), err.to_string());
                modules.push(serde_json::json!({
                    "url": module.url,
                    "hash": null,
                    "deps": [],
                    "reason": format!("{:?}", module.reason).to_lowercase(),
                    "status": "error",
                }));
            }
        }
    }

    Ok(axum::Json(serde_json::json!({
        "type": "update",
        "id": pending.id,
        "timestamp": pending.created_at_ms,
        "modules": modules,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct ErrorBody {
    id: Option<String>,
    message: String,
}

async fn hmr_error(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> ServerResult<Response> {
    let parsed: ErrorBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            let err = ProtocolError::Malformed(e.to_string());
            return Ok((StatusCode::BAD_REQUEST, err.to_string()).into_response());
        }
    };
    tracing::warn!(id = ?parsed.id, "client reported HMR error: {}", parsed.message);
    state.hmr.broadcast_error(parsed.id, parsed.message);
    Ok(axum::Json(serde_json::json!({ "ok": true })).into_response())
}

async fn re_transform(state: &AppState, abs_path: &std::path::Path) -> Result<(String, ContentHash)> {
    let bytes = tokio::fs::read(abs_path)
        .await
        .with_context(|| format!("reading {}", abs_path.display()))?;
    let hash = hash_bytes(&bytes);
    let code = String::from_utf8_lossy(&bytes).into_owned();
    let output = state
        .transform
        .run(abs_path, &hash.to_hex(), code, artifact_name_for(abs_path))
        .await?;
    Ok((output.code, hash))
}

fn artifact_name_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("css") => "transformed.css",
        _ => "transformed.js",
    }
}

#[derive(Deserialize, Default)]
struct ServeQuery {
    import: Option<String>,
    inline: Option<String>,
    module: Option<String>,
}

async fn serve_module(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServeQuery>,
    uri: axum::http::Uri,
) -> ServerResult<Response> {
    let raw_path = uri.path();

    let abs_path = match path_mapper::decode(&state.root, raw_path) {
        Ok(p) => p,
        Err(_) => return Ok((StatusCode::NOT_FOUND, "not found").into_response()),
    };

    let abs_path = resolve_directory_index(&abs_path).unwrap_or(abs_path);

    let bytes = match tokio::fs::read(&abs_path).await {
        Ok(b) => b,
        Err(_) => return Ok((StatusCode::NOT_FOUND, "not found").into_response()),
    };

    let ext = abs_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let mut kind = ModuleKind::from_path(&abs_path);
    if kind == ModuleKind::Css && query.module.is_some() {
        kind = ModuleKind::CssModule;
    }
    let content_hash = hash_bytes(&bytes);
    let id = ModuleId::new(&abs_path);

    state.watcher.watch(&abs_path).ok();

    let response = match kind {
        ModuleKind::Asset if query.import.is_some() => {
            let changed = state
                .graph
                .record(id, Some(content_hash), vec![], vec![], kind)
                .unwrap_or(true);
            let url = path_mapper::public_path_for(&state.root, &abs_path);
            let js = format!("export default {url:?};");
            text_response(js, "application/javascript", cache_header(changed))
        }
        ModuleKind::Asset => {
            let changed = state
                .graph
                .record(id, Some(content_hash), vec![], vec![], kind)
                .unwrap_or(true);
            let mime = mime_guess::from_path(&abs_path).first_or_octet_stream();
            (
                [
                    (header::CONTENT_TYPE, mime.to_string()),
                    (
                        header::HeaderName::from_static("x-ionify-cache"),
                        cache_header(changed).to_string(),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        ModuleKind::Css | ModuleKind::CssModule => {
            let changed = state
                .graph
                .record(id, Some(content_hash), vec![], vec![], kind)
                .unwrap_or(true);
            let code = String::from_utf8_lossy(&bytes).into_owned();
            let output = state
                .transform
                .run(&abs_path, &content_hash.to_hex(), code, "transformed.css")
                .await?;

            if kind == ModuleKind::CssModule {
                let js = css_modules_wrapper(&output.code, &content_hash.to_hex());
                text_response(js, "application/javascript", cache_header(changed))
            } else if query.inline.is_some() {
                let js = inline_css_module(&output.code);
                text_response(js, "application/javascript", cache_header(changed))
            } else {
                text_response(output.code, "text/css", cache_header(changed))
            }
        }
        ModuleKind::Json => {
            let changed = state
                .graph
                .record(id, Some(content_hash), vec![], vec![], kind)
                .unwrap_or(true);
            text_response(
                String::from_utf8_lossy(&bytes).into_owned(),
                "application/json",
                cache_header(changed),
            )
        }
        ModuleKind::Js => {
            let code = String::from_utf8_lossy(&bytes).into_owned();
            let specifiers = extract_specifiers(&code);

            let mut static_deps = Vec::new();
            for specifier in specifiers {
                if let Some(resolved) = state.resolver.resolve(&specifier, &abs_path) {
                    state.watcher.watch(&resolved).ok();
                    static_deps.push(ModuleId::new(resolved));
                }
            }
            let changed = state
                .graph
                .record(id, Some(content_hash), static_deps, vec![], kind)
                .unwrap_or(true);

            let output = state
                .transform
                .run(&abs_path, &content_hash.to_hex(), code, "transformed.js")
                .await?;

            let body = if ext == "html" {
                inject_hmr_client(&output.code)
            } else {
                output.code
            };

            let content_type = if ext == "html" { "text/html" } else { "application/javascript" };
            text_response(body, content_type, cache_header(changed))
        }
    };

    Ok(response)
}

fn cache_header(changed: bool) -> &'static str {
    if changed {
        "MISS"
    } else {
        "HIT"
    }
}

fn resolve_directory_index(path: &std::path::Path) -> Option<PathBuf> {
    if !path.is_dir() {
        return None;
    }
    for candidate in ["index.html", "index.js", "index.ts", "index.tsx", "index.jsx"] {
        let p = path.join(candidate);
        if p.is_file() {
            return Some(p);
        }
    }
    None
}

/// `content_type`/`cache` are always one of this module's own static MIME
/// strings or `cache_header`'s `"HIT"`/`"MISS"`, never user input, so they
/// are always valid header values.
#[allow(clippy::expect_used)]
fn text_response(body: String, content_type: &str, cache: &str) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_str(content_type).expect("internal content-type is ASCII"),
            ),
            (
                header::HeaderName::from_static("x-ionify-cache"),
                HeaderValue::from_str(cache).expect("internal cache status is ASCII"),
            ),
        ],
        body,
    )
        .into_response()
}

fn inline_css_module(css: &str) -> String {
    format!(
        "const __css = {css:?};\nconst __style = document.createElement('style');\n__style.textContent = __css;\ndocument.head.appendChild(__style);\nexport default __css;\n"
    )
}

// Fixed string literal, cannot fail to parse at runtime.
#[allow(clippy::expect_used)]
static CLASS_SELECTOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([A-Za-z_-][A-Za-z0-9_-]*)").expect("static regex is valid"));

/// `spec.md` §4.11/§6: "CSS Modules with a local-name mapping export" for
/// `?module`/`*.module.css`. Class selectors are scoped with a suffix
/// derived from the module's content hash (stable across requests for the
/// same bytes, distinct across modules), and the mapping from original to
/// scoped name is exported as the module's default export alongside a
/// style-injection side effect identical to `?inline`'s.
fn css_modules_wrapper(css: &str, content_hash_hex: &str) -> String {
    let suffix = &content_hash_hex[..content_hash_hex.len().min(8)];
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let scoped_css = CLASS_SELECTOR_RE.replace_all(css, |caps: &regex::Captures| {
        let name = &caps[1];
        let scoped = mapping
            .entry(name.to_string())
            .or_insert_with(|| format!("{name}_{suffix}"))
            .clone();
        format!(".{scoped}")
    });
    let mapping_json = serde_json::to_string(&mapping).unwrap_or_else(|_| "{}".to_string());
    format!(
        "const __css = {scoped_css:?};\nconst __style = document.createElement('style');\n__style.textContent = __css;\ndocument.head.appendChild(__style);\nexport default {mapping_json};\n"
    )
}

fn inject_hmr_client(html: &str) -> String {
    let script = "<script type=\"module\" src=\"/__ionify_hmr_client.js\"></script>";
    let mut doc = crate::common::html_rewrite::Document::new(html.as_bytes().to_vec());
    if doc.append_html("body", script).is_err() {
        return format!("{html}{script}");
    }
    String::from_utf8_lossy(doc.into_inner().as_slice()).into_owned()
}

/// Collect affected modules for a watcher change event and hand a pending
/// update to the HMR coordinator.
pub async fn handle_change(state: &AppState, path: PathBuf, kind: ChangeKind) {
    let id = ModuleId::new(&path);
    let reason = match kind {
        ChangeKind::Deleted => UpdateReason::Deleted,
        _ => UpdateReason::Changed,
    };

    if matches!(kind, ChangeKind::Deleted) {
        let _ = state.graph.remove(&id);
    }

    let affected = match state.graph.collect_affected(&[id.clone()]) {
        Ok(a) => a,
        Err(err) => {
            tracing::warn!(error = ?err, "failed to collect affected modules");
            vec![id.clone()]
        }
    };

    let now_ms = now_ms();
    let mut modules = Vec::with_capacity(affected.len());
    for (i, module_id) in affected.iter().enumerate() {
        let module_reason = if i == 0 { reason } else { UpdateReason::Dependent };
        let content_hash = if module_reason == UpdateReason::Deleted {
            None
        } else {
            state.graph.get(module_id).ok().flatten().and_then(|n| n.content_hash)
        };
        modules.push(PendingModule {
            abs_path: module_id.path.clone(),
            url: path_mapper::public_path_for(&state.root, &module_id.path),
            content_hash,
            reason: module_reason,
        });
    }

    state.hmr.queue_update(modules, now_ms);
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Run the HTTP server with a 3-second graceful-shutdown timeout, as
/// `spec.md` §5 mandates.
pub async fn run_server(
    addr: SocketAddr,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let handle = Handle::new();

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        tracing::debug!("dispatcher shutting down, 3s grace period");
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(3)));
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("dev dispatcher server error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmr_client_injects_before_closing_body() {
        let html = "<html><body><h1>hi</h1></body></html>";
        let out = inject_hmr_client(html);
        assert!(out.contains("__ionify_hmr_client.js"));
        assert!(out.find("</script>").unwrap() < out.find("</body>").unwrap());
    }

    #[test]
    fn css_module_kind_detected_from_filename_and_query() {
        assert_eq!(
            ModuleKind::from_path(std::path::Path::new("button.module.css")),
            ModuleKind::CssModule
        );
        assert_eq!(
            ModuleKind::from_path(std::path::Path::new("button.css")),
            ModuleKind::Css
        );
    }

    #[test]
    fn css_modules_wrapper_exports_local_name_mapping() {
        let css = ".title { color: red; } .title.big { font-size: 2em; }";
        let js = css_modules_wrapper(css, "deadbeefcafe0000");
        assert!(js.contains("title_deadbeef"));
        assert!(js.contains("export default {"));
        assert!(js.contains("\"title\":\"title_deadbeef\""));
    }

    #[test]
    fn css_modules_wrapper_is_stable_across_repeat_class_names() {
        let css = ".a { color: red; } .a { color: blue; }";
        let js = css_modules_wrapper(css, "11112222");
        // Same source class renamed consistently every occurrence.
        assert_eq!(js.matches("a_11112222").count(), 2);
    }
}
