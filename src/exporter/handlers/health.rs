use crate::{
    exporter::{AppState, GIT_COMMIT_HASH},
    scheduler::{RunState, Scheduler},
};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    scheduler: String,
    workers: usize,
}

fn create_health_response(scheduler: &Scheduler) -> Health {
    Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler: scheduler.state().to_string(),
        workers: scheduler.running_workers().len(),
    }
}

fn create_response_body(method: &Method, health: &Health) -> Body {
    if method == Method::GET {
        Json(health).into_response().into_body()
    } else {
        Body::empty()
    }
}

fn create_app_headers(health: &Health) -> HeaderMap {
    let short_hash = if health.commit.len() > 7 {
        health.commit.get(..7).unwrap_or_default()
    } else {
        ""
    };

    let header_value = format!("{}:{}:{}", health.name, health.version, short_hash);

    match header_value.parse::<HeaderValue>() {
        Ok(x_app_header_value) => {
            debug!("X-App header: {:?}", x_app_header_value);
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        }
        Err(err) => {
            debug!("Failed to parse X-App header: {}", err);
            HeaderMap::new()
        }
    }
}

// 200 while the scheduler reconciles, 503 before it started and once it stopped
pub async fn health(method: Method, Extension(state): Extension<AppState>) -> impl IntoResponse {
    let health = create_health_response(&state.scheduler);
    let body = create_response_body(&method, &health);
    let headers = create_app_headers(&health);

    if state.scheduler.state() == RunState::Running {
        (StatusCode::OK, headers, body)
    } else {
        debug!(state = %health.scheduler, "scheduler is not running");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(commit: &str) -> Health {
        Health {
            commit: commit.to_string(),
            name: "rds_metric_collector".to_string(),
            version: "0.4.0".to_string(),
            scheduler: "running".to_string(),
            workers: 2,
        }
    }

    #[test]
    fn test_app_header_uses_short_hash() {
        let headers = create_app_headers(&health("0123456789abcdef"));
        assert_eq!(
            headers.get("X-App").and_then(|v| v.to_str().ok()),
            Some("rds_metric_collector:0.4.0:0123456")
        );
    }

    #[test]
    fn test_app_header_without_hash() {
        let headers = create_app_headers(&health(":-("));
        assert_eq!(
            headers.get("X-App").and_then(|v| v.to_str().ok()),
            Some("rds_metric_collector:0.4.0:")
        );
    }
}
