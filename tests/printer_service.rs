//! End-to-end behavior of the printer service against the simulated printer.

use std::sync::Arc;
use std::time::Duration;

use faro::{
    Bitmap, ConnectionManager, FaroError, PrinterSettings, Timings,
    service::{PrinterService, ServiceConfig},
    transport::sim::{Outcome, SimPrinter},
};
use pretty_assertions::assert_eq;

const ADDR: &str = "AA:BB:CC:DD:EE:FF";

fn config(dry_run: bool, keep_alive: bool) -> ServiceConfig {
    ServiceConfig {
        settings: PrinterSettings {
            address: Some(ADDR.to_string()),
            dry_run,
            keep_alive_enabled: keep_alive,
            keep_alive_interval_secs: 1,
            ..Default::default()
        },
        timings: Timings::immediate(),
        queue_capacity: 16,
    }
}

/// Poll until `done` holds, failing the test after two seconds.
async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_submit_prints_exactly_once_and_stays_connected() {
    let sim = SimPrinter::new();
    let service = PrinterService::start(sim.factory(), config(false, false))
        .await
        .unwrap();

    let bitmap = Bitmap::from_fn(32, 4, |x, y| (x + y) % 3 == 0);
    service.submit(bitmap.clone()).unwrap();
    wait_for(|| service.stats().printed == 1).await;

    assert_eq!(sim.printed(), vec![bitmap]);
    assert_eq!(sim.stats().prints, 1);
    assert!(service.is_connected());
    service.shutdown().await;
}

#[tokio::test]
async fn test_dry_run_updates_activity_without_printing() {
    let sim = SimPrinter::new();
    let service = PrinterService::start(sim.factory(), config(true, false))
        .await
        .unwrap();
    assert!(service.stats().last_activity.is_none());

    service.submit(Bitmap::test_pattern(64, 8)).unwrap();
    wait_for(|| service.stats().dry_run == 1).await;

    assert!(service.stats().last_activity.is_some());
    assert_eq!(sim.stats().prints, 0);
    service.shutdown().await;
}

#[tokio::test]
async fn test_failed_print_is_never_retried() {
    let sim = SimPrinter::new();
    sim.script_print([Outcome::fail("write failed")]);
    let service = PrinterService::start(sim.factory(), config(false, false))
        .await
        .unwrap();

    service.submit(Bitmap::test_pattern(8, 8)).unwrap();
    service.submit(Bitmap::test_pattern(16, 8)).unwrap();
    service.shutdown().await;

    let stats = service.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.printed, 1);
    assert_eq!(sim.stats().prints, 2);
    assert_eq!(sim.printed(), vec![Bitmap::test_pattern(16, 8)]);
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let sim = SimPrinter::new();
    sim.set_latency(Duration::from_millis(2));
    let service = PrinterService::start(sim.factory(), config(false, false))
        .await
        .unwrap();

    for width in 1..=5 {
        service.submit(Bitmap::test_pattern(width * 8, 2)).unwrap();
    }
    service.shutdown().await;

    let widths: Vec<usize> = sim.printed().iter().map(Bitmap::width).collect();
    assert_eq!(widths, vec![8, 16, 24, 32, 40]);
    assert_eq!(sim.stats().releases, 1);
}

// ============================================================================
// Queue capacity
// ============================================================================

#[tokio::test]
async fn test_full_queue_rejects_without_blocking() {
    let sim = SimPrinter::new();
    let service = PrinterService::start(
        sim.factory(),
        ServiceConfig {
            queue_capacity: 1,
            ..config(false, false)
        },
    )
    .await
    .unwrap();

    // Hold the device so the dispatcher cannot finish anything.
    let session = service.manager().session().await;

    let rejected = tokio::time::timeout(Duration::from_millis(200), async {
        for _ in 0..3 {
            if let Err(e) = service.submit(Bitmap::test_pattern(8, 1)) {
                return Some(e);
            }
        }
        None
    })
    .await
    .expect("submit blocked");

    assert!(matches!(rejected, Some(FaroError::QueueFull)));
    drop(session);
    service.shutdown().await;
}

// ============================================================================
// Exclusivity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submit_and_reconnect_never_overlap() {
    let sim = SimPrinter::new();
    sim.set_latency(Duration::from_millis(2));
    let service = Arc::new(
        PrinterService::start(sim.factory(), config(false, true))
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for i in 0..12 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            if i % 3 == 0 {
                service.reconnect(None).await;
            } else {
                service.submit(Bitmap::test_pattern(8, 4)).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    service.shutdown().await;

    assert_eq!(sim.stats().max_in_flight, 1);
    assert_eq!(service.stats().printed, 8);
}

// ============================================================================
// Connection manager recovery
// ============================================================================

#[tokio::test]
async fn test_already_exists_recovers_with_one_release() {
    let sim = SimPrinter::new();
    sim.script_connect([Outcome::fail("Device already exists")]);
    let manager = ConnectionManager::new(sim.factory(), Timings::immediate());

    let mut session = manager.session().await;
    let original = session.setup().await.unwrap();
    let handle = session.connect(ADDR).await.unwrap();
    drop(session);

    assert_ne!(handle, original);
    assert!(manager.is_connected());
    let stats = sim.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.releases, 1);
}

#[tokio::test]
async fn test_connect_when_connected_is_not_destructive() {
    let sim = SimPrinter::new();
    let manager = ConnectionManager::new(sim.factory(), Timings::immediate());

    let first = manager.connect_to(ADDR).await.unwrap();
    let mut session = manager.session().await;
    let second = session.connect(ADDR).await.unwrap();
    drop(session);

    assert_eq!(first, second);
    assert!(manager.is_connected());
    assert_eq!(sim.stats().releases, 0);
    assert_eq!(sim.stats().disconnects, 0);
}

#[tokio::test]
async fn test_manual_reconnect_reports_raw_transport_error() {
    let sim = SimPrinter::new();
    sim.script_connect([Outcome::fail("le-connection-abort-by-local")]);
    let service = PrinterService::start(sim.factory(), config(false, false))
        .await
        .unwrap();

    let report = service.reconnect(None).await;
    assert!(!report.success);
    assert!(!report.connected);
    assert_eq!(report.error.as_deref(), Some("le-connection-abort-by-local"));
}

#[tokio::test]
async fn test_scan_lists_matching_printers() {
    let sim = SimPrinter::new();
    sim.add_device("11:22:33:44:55:66", "MXW01");
    sim.add_device("11:22:33:44:55:77", "Headphones");
    let service = PrinterService::start(sim.factory(), config(false, false))
        .await
        .unwrap();

    let found = service.scan("MXW", Duration::from_secs(1)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.get("11:22:33:44:55:66").map(String::as_str), Some("MXW01"));
}
