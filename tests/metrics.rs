use anyhow::Result;
use rds_metric_collector::emitter::SinkKind;

mod common;

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() -> Result<()> {
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
        .get(format!("{}/metrics", common::get_test_url(port)))
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    let content_type = response
        .headers()
        .get("content-type")
        .expect("Content-Type header should be present");
    assert_eq!(content_type, "text/plain; version=0.0.4; charset=utf-8");

    // no instances configured, so nothing has been collected yet
    let body = response.text().await?;
    assert!(!body.contains("source="));

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_not_found_with_stdout_sink() -> Result<()> {
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
        .get(format!("{}/metrics", common::get_test_url(port)))
        .send()
        .await?;

    assert_eq!(response.status(), 404);

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_unknown_route_returns_not_found() -> Result<()> {
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
        .get(format!("{}/nope", common::get_test_url(port)))
        .send()
        .await?;

    assert_eq!(response.status(), 404);

    handle.abort();

    Ok(())
}
