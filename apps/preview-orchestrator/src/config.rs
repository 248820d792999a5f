use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Where the public endpoint is reachable from a browser. Baked into
/// generated bundler configs so HMR sockets come back through the front
/// door.
#[derive(Debug, Clone)]
pub struct PublicEndpoint {
    pub host: String,
    pub https: bool,
    pub port: u16,
}

impl PublicEndpoint {
    /// Port a browser should dial for HMR: 443 behind TLS, the public port
    /// otherwise.
    pub fn client_port(&self) -> u16 {
        if self.https {
            443
        } else {
            self.port
        }
    }

    pub fn ws_protocol(&self) -> &'static str {
        if self.https {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Tunables for the instance supervisor. Defaults match the deployed
/// container: twenty bundler slots starting at 5200.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub base_port: u16,
    pub max_instances: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub readiness_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_port: 5200,
            max_instances: 20,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            start_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            readiness_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub api_key: String,
    pub api_secret: String,
    pub public: PublicEndpoint,
    pub bun_binary: String,
    pub jsx_tagger_dep: String,
    pub prebuilt_template_dir: PathBuf,
    pub hmr_path: String,
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let public_host = env::var("FLY_PUBLIC_HOST")
            .unwrap_or_else(|_| "omniflow-preview.fly.dev".to_string());
        let public_https = env::var("FLY_HTTPS")
            .map(|v| matches_truthy(&v))
            .unwrap_or_else(|_| public_host.ends_with(".fly.dev"));

        Self {
            port,
            data_dir: PathBuf::from(
                env::var("DATA_DIR").unwrap_or_else(|_| "/data/sites".to_string()),
            ),
            api_key: env::var("FLY_API_KEY").unwrap_or_default(),
            api_secret: env::var("FLY_API_SECRET").unwrap_or_default(),
            public: PublicEndpoint {
                host: public_host,
                https: public_https,
                port,
            },
            bun_binary: env::var("BUN_BINARY").unwrap_or_else(|_| "bun".to_string()),
            jsx_tagger_dep: env::var("JSX_TAGGER_DEP")
                .unwrap_or_else(|_| "file:/app/packages/vite-plugin-jsx-tagger".to_string()),
            prebuilt_template_dir: PathBuf::from(
                env::var("PREBUILT_TEMPLATE_DIR").unwrap_or_else(|_| "/app/template".to_string()),
            ),
            hmr_path: "/hmr".to_string(),
            supervisor: SupervisorConfig::default(),
        }
    }

    /// Empty credentials switch the control plane into unauthenticated
    /// development mode.
    pub fn auth_enabled(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    pub fn template_dir(&self) -> PathBuf {
        self.data_dir.join("_template")
    }
}

pub fn matches_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
