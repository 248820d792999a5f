//! Multi-tenant preview orchestrator.
//!
//! Each tenant is a directory of sources under the data root; the
//! orchestrator materialises it, supervises a per-project bundler child,
//! and exposes everything through one public HTTP/WebSocket endpoint as
//! `/p/<projectId>/…` behind a signed control-plane API.

pub mod auth;
pub mod config;
pub mod deps;
pub mod error;
pub mod handlers;
pub mod hmr;
pub mod middleware;
pub mod projects;
pub mod proxy;
pub mod scaffold;
pub mod state;
pub mod supervisor;
pub mod template;

pub use config::Config;
pub use error::{Error, Result};
pub use handlers::router;
pub use state::AppState;
