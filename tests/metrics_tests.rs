//! Tests for the Prometheus metrics endpoint.


use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use ddc::api::PlacementMode;
use ddc::metrics;
use http_body_util::BodyExt;
use tower::ServiceExt;

use test_helpers::*;

async fn scrape(m: &metrics::Metrics) -> String {
    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = metrics::router(m.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&body).into_owned()
}

#[ddc::test]
async fn endpoint_serves_prometheus_text() {
    let m = metrics::init().expect("init metrics");
    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();

    let response = metrics::router(m).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .expect("content-type header");
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8_lossy(&body);
    // Unlabelled gauges are exported even before anything is recorded
    assert!(body.contains("# TYPE ddc_ports_reserved gauge"), "{body}");
}

#[ddc::test]
async fn recorded_values_show_up() {
    let m = metrics::init().expect("init metrics");
    m.record_metadata_sync("fluid", "hbase", 2 << 30, 3, 1.5);
    m.record_reconcile("setup_master", true);
    m.record_reconcile("setup_master", false);
    m.set_ports_reserved(4);
    m.record_worker_scaled_in("fluid", "hbase");

    let body = scrape(&m).await;
    assert!(body.contains(r#"ddc_dataset_ufs_total_bytes{dataset="hbase",namespace="fluid"} 2147483648"#), "{body}");
    assert!(body.contains(r#"ddc_dataset_file_num{dataset="hbase",namespace="fluid"} 3"#));
    assert!(body.contains(r#"ddc_reconcile_total{result="ok",step="setup_master"} 1"#));
    assert!(body.contains(r#"ddc_reconcile_total{result="error",step="setup_master"} 1"#));
    assert!(body.contains("ddc_ports_reserved 4"));
    assert!(body.contains(r#"ddc_workers_scaled_in_total{namespace="fluid",runtime="hbase"} 1"#));
    assert!(body.contains("ddc_metadata_sync_duration_seconds_count{namespace=\"fluid\"} 1"));
}

#[ddc::test]
async fn unknown_path_is_not_found() {
    let m = metrics::init().expect("init metrics");
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = metrics::router(m).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[ddc::test]
async fn engine_passes_are_counted() {
    let mut h = Harness::new();
    let m = metrics::init().expect("init metrics");
    h.ctx.metrics = Some(m.clone());
    h.cluster.insert_runtime(runtime("hbase", 1));
    h.cluster
        .insert_dataset(dataset("hbase", PlacementMode::Exclusive));
    let mut engine = h.engine("hbase");

    // Master is installed but not ready yet.
    engine.reconcile().await.unwrap();
    let body = scrape(&m).await;
    assert!(body.contains(r#"ddc_reconcile_total{result="ok",step="setup_master"} 1"#), "{body}");
    assert!(body.contains(r#"ddc_reconcile_total{result="ok",step="check_master_ready"} 1"#));
    assert!(body.contains("ddc_ports_reserved 2"));
}
