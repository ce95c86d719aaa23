//! Test server lifecycle management
//!
//! Spawns the liveness endpoint on a random port and stops it on drop.

use super::constants::*;
use pg_sync::server::{bind, serve, RequestsLoggingLevel, ServerConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Test server instance bound to 127.0.0.1 on a random port
///
/// When dropped, the server gracefully shuts down.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawns a new test server and waits until it answers.
    ///
    /// # Panics
    ///
    /// Panics if binding fails or the server does not become ready within
    /// [`SERVER_READY_TIMEOUT_MS`].
    pub async fn spawn() -> Self {
        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        let listener = bind(&config).await.expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            serve(listener, &config, server_shutdown)
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            port,
            shutdown,
        };

        server.wait_for_ready().await;

        server
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
