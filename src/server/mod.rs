pub mod config;
mod http_layers;
pub mod metrics;
pub mod server;

pub use config::ServerConfig;
pub use http_layers::*;
pub use server::{bind, make_app, run_server, serve};
