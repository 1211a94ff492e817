use crate::exporter::AppState;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use tracing::{debug, error};

pub async fn metrics(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );

    let Some(sink) = state.prometheus else {
        return (
            StatusCode::NOT_FOUND,
            headers,
            "metrics are not exposed by the configured sink\n".to_string(),
        );
    };

    match sink.render() {
        Ok(metrics) => {
            debug!("Successfully rendered metrics");
            (StatusCode::OK, headers, metrics)
        }
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error rendering metrics: {e}"),
            )
        }
    }
}
