use super::{log_requests, ServerConfig};
use anyhow::{Context, Result};
use axum::{middleware, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Serialize, Debug, PartialEq, Eq)]
struct Liveness {
    sync: &'static str,
}

/// Always answers while the process is up; it says nothing about the last
/// sync outcome.
async fn home() -> impl IntoResponse {
    Json(Liveness { sync: "ok" })
}

pub fn make_app(config: &ServerConfig) -> Router {
    Router::new().route("/", get(home)).layer(middleware::from_fn_with_state(
        config.requests_logging_level.clone(),
        log_requests,
    ))
}

/// Binds the liveness listener. Failing here is fatal for the process.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let address = config.address();
    TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", address))
}

/// Serves on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = make_app(config);
    if let Ok(address) = listener.local_addr() {
        info!("Ready to serve at {}", address);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

pub async fn run_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = bind(&config).await?;
    serve(listener, &config, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RequestsLoggingLevel;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    fn test_config() -> ServerConfig {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn root_reports_sync_ok() {
        let app = make_app(&test_config());

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );
        assert_eq!(body_string(response).await, r#"{"sync":"ok"}"#);
    }

    #[tokio::test]
    async fn root_ignores_query_string() {
        let app = make_app(&test_config());

        let request = Request::builder()
            .uri("/?verbose=1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn other_routes_are_not_found() {
        for route in ["/status", "/metrics", "/v1/sync"] {
            let app = make_app(&test_config());
            let request = Request::builder().uri(route).body(Body::empty()).unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "route {}", route);
        }
    }

    fn recorded_paths() -> Vec<(String, String)> {
        use prometheus::core::Collector;

        crate::server::metrics::HTTP_REQUESTS_TOTAL
            .collect()
            .iter()
            .flat_map(|family| family.get_metric().to_vec())
            .map(|metric| {
                let label = |name: &str| {
                    metric
                        .get_label()
                        .iter()
                        .find(|pair| pair.get_name() == name)
                        .map(|pair| pair.get_value().to_string())
                        .unwrap_or_default()
                };
                (label("path"), label("status"))
            })
            .collect()
    }

    #[tokio::test]
    async fn request_metrics_are_labelled_by_route() {
        for i in 0..20 {
            let app = make_app(&test_config());
            let request = Request::builder()
                .uri(format!("/scan/{}", i))
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let app = make_app(&test_config());
        let request = Request::builder().uri("/?x=1").body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap();

        let paths = recorded_paths();
        assert!(
            paths.iter().all(|(path, _)| !path.starts_with("/scan")),
            "{:?}",
            paths
        );
        assert!(paths.contains(&("unmatched".to_string(), "404".to_string())));
        assert!(paths.contains(&("/".to_string(), "200".to_string())));
    }

    #[tokio::test]
    async fn logging_level_does_not_change_response() {
        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Headers,
            ..test_config()
        };
        let app = make_app(&config);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(body_string(response).await, r#"{"sync":"ok"}"#);
    }

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };

        let err = bind(&config).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind HTTP listener"));
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let config = test_config();
        let listener = bind(&config).await.unwrap();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve(listener, &config, shutdown).await }
        });
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
