pub mod bootstrap;
pub mod config;
pub mod dashboard_ws;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;

pub use bootstrap::{Backends, CoreServices};
pub use config::AppConfig;
pub use error::ApiError;
pub use observability::{apply_logging_level, init_tracing};
pub use server::{AppState, ServerBuilder, WiseupServer, build_app};
