use anyhow::Result;
use rds_metric_collector::emitter::SinkKind;
use serde_json::Value;

mod common;

#[tokio::test]
async fn test_health_endpoint_returns_ok() -> Result<()> {
    let port = common::get_available_port();
    let config = common::write_config("");
    let path = config.path().to_path_buf();

    let handle = tokio::spawn(async move {
        rds_metric_collector::exporter::new(
            port,
            Some("127.0.0.1".to_string()),
            path,
            SinkKind::Prometheus,
        )
        .await
    });

    assert!(
        common::wait_for_server(port, 50).await,
        "Server failed to start"
    );

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/health", common::get_test_url(port)))
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["scheduler"], "running");
    assert_eq!(body["workers"], 0);
    assert!(body["commit"].is_string());

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_health_endpoint_options_request() -> Result<()> {
    let port = common::get_available_port();
    let config = common::write_config("");
    let path = config.path().to_path_buf();

    let handle = tokio::spawn(async move {
        rds_metric_collector::exporter::new(
            port,
            Some("127.0.0.1".to_string()),
            path,
            SinkKind::Prometheus,
        )
        .await
    });

    assert!(common::wait_for_server(port, 50).await);

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/health", common::get_test_url(port)),
        )
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert!(response.text().await?.is_empty());

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_health_endpoint_has_x_app_header() -> Result<()> {
    let port = common::get_available_port();
    let config = common::write_config("");
    let path = config.path().to_path_buf();

    let handle = tokio::spawn(async move {
        rds_metric_collector::exporter::new(
            port,
            Some("127.0.0.1".to_string()),
            path,
            SinkKind::Stdout,
        )
        .await
    });

    assert!(common::wait_for_server(port, 50).await);

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/health", common::get_test_url(port)))
        .send()
        .await?;

    let x_app = response
        .headers()
        .get("X-App")
        .expect("X-App header should be present")
        .to_str()?;

    assert!(x_app.starts_with(&format!(
        "{}:{}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )));

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_invalid_config_fails_startup() {
    let port = common::get_available_port();
    let config = common::write_config(r#""postgres": {"collect_interval": 0}"#);

    let result = rds_metric_collector::exporter::new(
        port,
        Some("127.0.0.1".to_string()),
        config.path().to_path_buf(),
        SinkKind::Prometheus,
    )
    .await;

    assert!(result.is_err());
}
