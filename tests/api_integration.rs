//! API Integration Tests for the exporter
//!
//! Drives a real listener with simulated devices behind it.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use kasa_exporter::collector::{DeviceRegistry, PruneRoutine, Routine, ScrapeRoutine};
use kasa_exporter::device::catalog::{simulated_catalog, simulated_dimensions};
use kasa_exporter::device::simulated::SimulatedDiscovery;
use kasa_exporter::metrics::Extractor;
use kasa_exporter::server::{AppState, create_router};
use prometheus::Registry;
use serde_json::Value;
use tokio::net::TcpListener;

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    base_url: String,
    devices: Arc<DeviceRegistry>,
    extractor: Arc<Extractor>,
    scrape: ScrapeRoutine,
}

async fn start_test_server(device_count: usize) -> Option<Harness> {
    start_test_server_with(device_count, Duration::from_secs(60)).await
}

/// Start a server over simulated devices; `None` when binding is not permitted.
async fn start_test_server_with(device_count: usize, staleness: Duration) -> Option<Harness> {
    let metrics = Registry::new();
    let devices = Arc::new(
        DeviceRegistry::new(Arc::new(SimulatedDiscovery::new(device_count)), &metrics)
            .expect("Failed to build device registry")
            .with_staleness_threshold(staleness),
    );
    let extractor = Extractor::register_all(&metrics, &simulated_catalog(), simulated_dimensions())
        .expect("Failed to register catalog");
    let extractor = Arc::new(extractor);
    let scrape = ScrapeRoutine::new(Arc::clone(&devices), Arc::clone(&extractor));

    let router = create_router(AppState {
        metrics,
        devices: Arc::clone(&devices),
    });

    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("Failed to bind random port: {e}"),
    };
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Some(Harness {
        base_url: format!("http://{}", addr),
        devices,
        extractor,
        scrape,
    })
}

async fn get_text(url: String) -> (u16, String) {
    let resp = reqwest::get(url).await.expect("Failed to send request");
    let status = resp.status().as_u16();
    (status, resp.text().await.expect("Failed to read body"))
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let Some(h) = start_test_server(0).await else { return };

    let resp = reqwest::get(format!("{}/healthz", h.base_url))
        .await
        .expect("Failed to send healthz request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("Failed to parse healthz response");
    assert_eq!(body["status"], "ok");
}

// =============================================================================
// Metrics Exposition Tests
// =============================================================================

#[tokio::test]
async fn test_metrics_after_scrape_tick() {
    let Some(h) = start_test_server(2).await else { return };
    h.scrape.tick().await.expect("Scrape tick failed");

    let (status, body) = get_text(format!("{}/metrics", h.base_url)).await;
    assert_eq!(status, 200);

    assert!(body.contains("device_registry_total_devices 2"));
    assert!(body.contains("device_registry_discovered_devices_total 2"));
    assert!(body.contains(r#"temperature{device_id="sim-0000",location="server_room"}"#));
    assert!(body.contains(r#"temperature{device_id="sim-0001",location="server_room"}"#));
    assert!(body.contains("latency_sum{"));
    assert!(body.contains("latency_count{"));
    assert!(body.contains("response_time_bucket{"));
    assert!(body.contains(r#"version_info{buildhost="localhost""#));
    // One enum series per declared state.
    for state in ["starting", "running", "stopped"] {
        assert!(body.contains(&format!(r#"status="{state}""#)), "missing state {state}");
    }
}

#[tokio::test]
async fn test_metrics_before_any_scrape() {
    let Some(h) = start_test_server(2).await else { return };

    let (status, body) = get_text(format!("{}/metrics", h.base_url)).await;
    assert_eq!(status, 200);
    assert!(body.contains("device_registry_total_devices 0"));
    assert!(!body.contains("temperature{"));
}

// =============================================================================
// Diagnostics Tests
// =============================================================================

#[tokio::test]
async fn test_debug_lists_devices() {
    let Some(h) = start_test_server(3).await else { return };
    h.scrape.tick().await.expect("Scrape tick failed");

    let resp = reqwest::get(format!("{}/debug", h.base_url))
        .await
        .expect("Failed to fetch debug");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("Failed to parse debug response");

    let devices = body["devices"].as_array().expect("devices is not an array");
    assert_eq!(devices.len(), 3);
    for device in devices {
        assert_eq!(device["model"], "SIM1");
        assert!(device["last_checkin"].is_string());
    }
}

#[tokio::test]
async fn test_stale_devices_disappear_after_prune_tick() {
    let Some(h) = start_test_server_with(2, Duration::from_millis(1)).await else { return };
    h.scrape.tick().await.expect("Scrape tick failed");
    assert_eq!(h.devices.len().await, 2);
    let (_, metrics) = get_text(format!("{}/metrics", h.base_url)).await;
    assert!(metrics.contains("temperature{"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    PruneRoutine::new(Arc::clone(&h.devices))
        .with_extractor(Arc::clone(&h.extractor))
        .tick()
        .await
        .expect("Prune tick failed");

    let (_, body) = get_text(format!("{}/debug", h.base_url)).await;
    assert_eq!(body, r#"{"devices":[]}"#);

    let (_, metrics) = get_text(format!("{}/metrics", h.base_url)).await;
    assert!(metrics.contains("device_registry_total_devices 0"));
    assert!(metrics.contains("device_registry_pruned_devices_total 2"));
    assert!(!metrics.contains("temperature{"));
    assert!(!metrics.contains("version_info{"));
}
