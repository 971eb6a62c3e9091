//! HTTP request handlers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use super::AppState;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.registry.read().await.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!("encoding metrics failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedRegistry;

    #[tokio::test]
    async fn test_handle_metrics() {
        let registry = SharedRegistry::default();
        registry
            .write()
            .await
            .set("ntpmon_offset_seconds", "Mean clock offset of peers", 0.25);

        let response = handle_metrics(State(AppState { registry })).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            OPENMETRICS_CONTENT_TYPE
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("# TYPE ntpmon_offset_seconds gauge"));
        assert!(body.ends_with("# EOF\n"));
    }
}
