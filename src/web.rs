use crate::config::Config;
use crate::error::ResolveError;
use crate::request::ResolutionRequest;
use crate::resolver::Resolver;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const APP_TITLE: &str = "Lodestone";
const APP_TAGLINE: &str = "Magnet links in, torrent files out.";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub cfg: Arc<Config>,
}

fn page(title: &str, body: String) -> Html<String> {
    let full_title = if title.trim().is_empty() {
        APP_TITLE.to_string()
    } else {
        format!("{} · {}", title, APP_TITLE)
    };

    Html(format!(
        r#"<!doctype html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <meta name="viewport" content="width=device-width, initial-scale=1" />
        <title>{}</title>
        <style>
            :root {{
                --paper: #fbf6ef;
                --ink: #2a2018;
                --muted: #6f5b4b;
                --border: rgba(42, 32, 24, 0.14);
                --accent: #8b3f2f;
                --radius: 14px;
            }}
            * {{ box-sizing: border-box; }}
            body {{ margin: 0; font: 16px/1.5 ui-sans-serif, system-ui, sans-serif; background: var(--paper); color: var(--ink); }}
            .wrap {{ max-width: 860px; margin: 0 auto; padding: 28px 16px 56px; }}
            h1 {{ margin: 0; font-size: 22px; }}
            .tagline {{ color: var(--muted); margin: 2px 0 18px; }}
            .card {{ border: 1px solid var(--border); border-radius: var(--radius); padding: 18px; background: #fff; }}
            form {{ display: flex; gap: 8px; }}
            input {{ flex: 1; padding: 10px 12px; border: 1px solid var(--border); border-radius: 10px; font: inherit; }}
            button {{ padding: 10px 14px; border: 0; border-radius: 10px; background: var(--accent); color: #fff; font: inherit; cursor: pointer; }}
            code {{ font-family: ui-monospace, monospace; font-size: 13px; }}
            ul {{ padding-left: 18px; }}
        </style>
    </head>
    <body>
        <div class="wrap">
            <h1>{}</h1>
            <p class="tagline">{}</p>
            {}
        </div>
    </body>
</html>"#,
        html_escape(&full_title),
        html_escape(APP_TITLE),
        html_escape(APP_TAGLINE),
        body
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/api/resolve", get(resolve_torrent))
        .route("/api/resolve.json", get(resolve_json))
        .route("/api/active", get(active))
        .route("/api/cancel/:info_hash", post(cancel))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn home(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.resolver.active_hashes();
    let active_html = if active.is_empty() {
        "<p class=\"tagline\">Nothing in flight.</p>".to_string()
    } else {
        let items: String = active
            .iter()
            .map(|h| format!("<li><code>{}</code></li>", html_escape(h)))
            .collect();
        format!("<ul>{}</ul>", items)
    };

    page(
        "Resolve",
        format!(
            r#"<main class="card">
    <form action="/api/resolve" method="get">
        <input name="magnet" placeholder="magnet:?xt=urn:btih:…" autocomplete="off" />
        <button type="submit">Resolve</button>
    </form>
    <h3>In flight</h3>
    {}
</main>"#,
            active_html
        ),
    )
}

#[derive(Deserialize)]
struct ResolveParams {
    magnet: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Serialize)]
struct ResolvedJson {
    info_hash: String,
    networks: Vec<String>,
    torrent_base64: String,
}

#[derive(Serialize)]
struct ErrorJson {
    error: String,
}

async fn run_resolve(
    state: &AppState,
    params: ResolveParams,
) -> Result<(String, Option<crate::pipeline::ResolvedMetadata>), ResolveError> {
    let magnet = params.magnet.unwrap_or_default();
    if magnet.trim().is_empty() {
        return Err(ResolveError::InvalidReference("missing magnet parameter".into()));
    }
    let mut req = ResolutionRequest::from_magnet(&magnet)?;
    if let Some(secs) = params.timeout_secs {
        req = req.with_timeout(Some(Duration::from_secs(secs)));
    }
    let hex = req.hash.to_hex();
    let found = state.resolver.resolve(req).await?;
    Ok((hex, found))
}

async fn resolve_torrent(
    State(state): State<AppState>,
    Query(params): Query<ResolveParams>,
) -> Response {
    match run_resolve(&state, params).await {
        Ok((hex, Some(found))) => (
            [
                (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{hex}.torrent\""),
                ),
            ],
            found.torrent,
        )
            .into_response(),
        Ok((hex, None)) => not_found(&hex),
        Err(err) => error_response(err),
    }
}

async fn resolve_json(
    State(state): State<AppState>,
    Query(params): Query<ResolveParams>,
) -> Response {
    match run_resolve(&state, params).await {
        Ok((hex, Some(found))) => Json(ResolvedJson {
            info_hash: hex,
            networks: found.networks.names(),
            torrent_base64: base64::engine::general_purpose::STANDARD.encode(&found.torrent),
        })
        .into_response(),
        Ok((hex, None)) => not_found(&hex),
        Err(err) => error_response(err),
    }
}

async fn active(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.resolver.active_hashes())
}

async fn cancel(State(state): State<AppState>, Path(info_hash): Path<String>) -> StatusCode {
    if state.resolver.cancel(&info_hash) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

fn not_found(hex: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorJson {
            error: format!("no metadata found for {hex}"),
        }),
    )
        .into_response()
}

fn error_response(err: ResolveError) -> Response {
    let status = match &err {
        ResolveError::InvalidReference(_) => StatusCode::BAD_REQUEST,
        ResolveError::Cancelled => StatusCode::CONFLICT,
        ResolveError::HashMismatch { .. } | ResolveError::Transport(_) => StatusCode::BAD_GATEWAY,
        ResolveError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::warn!(%err, "web: resolution failed");
    }
    (
        status,
        Json(ErrorJson {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
