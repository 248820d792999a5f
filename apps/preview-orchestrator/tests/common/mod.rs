#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocketUpgrade},
    http::HeaderMap,
    response::{Html, IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use serde_json::json;

use preview_orchestrator::config::{Config, PublicEndpoint, SupervisorConfig};
use preview_orchestrator::{handlers, AppState};

pub const FAKE_HTML: &str =
    "<html><head><title>fake bundler</title></head><body>ok</body></html>";

/// A stand-in for the bundler binary: package-manager subcommands succeed
/// immediately, `run vite …` stays alive until signalled.
pub fn stub_bundler_binary(dir: &Path) -> String {
    let script = dir.join("stub-bun.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\ncase \"$1\" in\n  install|add|remove) exit 0 ;;\n  *) exec sleep 600 ;;\nesac\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    script.to_string_lossy().into_owned()
}

/// In-test bundler: answers readiness probes, serves HTML under its base,
/// echoes WebSocket frames on `/`, and exposes header-inspection routes.
pub async fn spawn_fake_bundler() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let app = Router::new()
        .route("/", any(root))
        .route("/p/:id/", get(html))
        .route("/p/:id/index.html", get(html))
        .route("/p/:id/assets/app.js", get(asset))
        .route("/p/:id/echo-headers", get(echo_headers))
        .route("/__jsx-source-map", get(source_map));

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    port
}

async fn root(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(|mut socket| async move {
                while let Some(Ok(msg)) = socket.recv().await {
                    match msg {
                        Message::Text(text) => {
                            if socket
                                .send(Message::Text(format!("echo:{text}")))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            })
            .into_response(),
        None => Html(FAKE_HTML).into_response(),
    }
}

async fn html() -> Html<&'static str> {
    Html(FAKE_HTML)
}

async fn asset() -> impl IntoResponse {
    (
        [
            ("content-type", "application/javascript"),
            ("content-encoding", "gzip"),
        ],
        "console.log(1)",
    )
}

async fn echo_headers(headers: HeaderMap) -> Json<serde_json::Value> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({ "host": get("host"), "origin": get("origin") }))
}

async fn source_map() -> Json<serde_json::Value> {
    Json(json!({}))
}

pub fn test_config(data_dir: PathBuf, bun_binary: String, base_port: u16, max: usize) -> Config {
    Config {
        port: 0,
        data_dir: data_dir.clone(),
        api_key: String::new(),
        api_secret: String::new(),
        public: PublicEndpoint {
            host: "localhost".to_string(),
            https: false,
            port: 3000,
        },
        bun_binary,
        jsx_tagger_dep: "file:/app/packages/vite-plugin-jsx-tagger".to_string(),
        prebuilt_template_dir: data_dir.join("no-prebuilt"),
        hmr_path: "/hmr".to_string(),
        supervisor: SupervisorConfig {
            base_port,
            max_instances: max,
            start_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
            readiness_interval: Duration::from_millis(50),
            ..SupervisorConfig::default()
        },
    }
}

pub async fn serve_app(state: AppState) -> SocketAddr {
    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    addr
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
