use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::projects::sanitize_project_id;
use crate::state::AppState;
use crate::supervisor::InstanceStatus;

/// `/p/<id>` without a trailing slash: relative asset URLs would resolve
/// against `/p/`, so send the browser to the slashed form.
pub async fn redirect_bare(Path(project_id): Path<String>) -> Redirect {
    Redirect::temporary(&format!("/p/{project_id}/"))
}

pub async fn proxy_root(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    req: Request,
) -> Response {
    proxy(state, project_id, "/".to_string(), req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

pub async fn proxy_tail(
    State(state): State<AppState>,
    Path((project_id, tail)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy(state, project_id, format!("/{tail}"), req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// Forward one request to the project's bundler, auto-starting it when
/// necessary, and inject the probe into HTML root responses.
async fn proxy(state: AppState, project_id: String, tail: String, req: Request) -> Result<Response> {
    let id = sanitize_project_id(&project_id)?;

    let running = state
        .supervisor
        .get_instance(&id)
        .filter(|i| i.status == InstanceStatus::Running);
    let port = match running {
        Some(instance) => instance.port,
        None => {
            debug!(project = %id, "no running instance; auto-starting");
            state.projects.start_preview(&id).await?.port
        }
    };
    state.supervisor.mark_active(&id);

    // The tagger's query endpoints are mounted at the child's root; strip
    // the public prefix for those. Everything else keeps the original path
    // because the child serves under `base = /p/<id>/`.
    let forward_path = if tail.starts_with("/__jsx-") {
        tail.clone()
    } else {
        format!("/p/{id}{tail}")
    };
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let url = format!("http://localhost:{port}{forward_path}{query}");

    let method = req.method().clone();
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| Error::BadRequest(format!("unsupported method {method}")))?;

    let mut builder = state
        .http
        .request(reqwest_method, &url)
        .header("origin", format!("http://localhost:{port}"));
    for name in [header::ACCEPT, header::ACCEPT_ENCODING] {
        if let Some(value) = req.headers().get(&name) {
            if let Ok(value) = value.to_str() {
                builder = builder.header(name.as_str(), value);
            }
        }
    }
    if method != Method::GET && method != Method::HEAD {
        if let Some(content_type) = req.headers().get(header::CONTENT_TYPE) {
            if let Ok(value) = content_type.to_str() {
                builder = builder.header("content-type", value);
            }
        }
        builder = builder.body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));
    }

    let upstream = builder.send().await.map_err(|err| {
        warn!(project = %id, url = %url, error = %err, "proxy request failed");
        Error::Upstream(err.to_string())
    })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let response_headers = relay_headers(upstream.headers());

    let is_html = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    if is_html && (tail == "/" || tail == "/index.html") {
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| Error::Upstream(err.to_string()))?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        let mut response = Response::new(Body::from(inject_probe(&html, &id)));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        return Ok(response);
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Copy upstream headers, dropping `content-encoding` and `content-length`:
/// the relay neither re-compresses nor re-measures what it may rewrite.
fn relay_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        let name = name.as_str();
        if name.eq_ignore_ascii_case("content-encoding")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

/// Insert the base tag and probe script right after the first `<head>`,
/// matched case-insensitively. Documents without a head are left alone.
pub fn inject_probe(html: &str, project_id: &str) -> String {
    let needle = b"<head>";
    let Some(pos) = html
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
    else {
        return html.to_string();
    };
    let insert_at = pos + needle.len();

    let snippet = format!(
        "\n    <base href=\"/p/{project_id}/\">\n    <script type=\"module\" src=\"/static/visual-edit-script.js\"></script>"
    );
    let mut out = String::with_capacity(html.len() + snippet.len());
    out.push_str(&html[..insert_at]);
    out.push_str(&snippet);
    out.push_str(&html[insert_at..]);
    out
}
