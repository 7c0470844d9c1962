mod common;

use common::*;
use pg_selective_replica::capture::{wait_for_flush, wait_until_streaming, Readiness, WalCapture};
use pg_selective_replica::postgres::Lsn;
use pg_selective_replica::Error;
use std::path::Path;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(150);
const POLL: Duration = Duration::from_millis(10);

async fn warmup(probe: Probe, exits: bool) -> pg_selective_replica::Result<Readiness> {
    let log = EventLog::default();
    let mut catalog = MockCatalog::new(&log);
    catalog.probe = probe;
    let mut capture = MockCapture::new(&log);
    capture.exits = exits;
    capture.start(Path::new("/nonexistent")).await.unwrap();
    wait_until_streaming(&catalog, &mut capture, TIMEOUT, POLL).await
}

#[tokio::test]
async fn test_warmup_confirmed_when_streaming() {
    let started = Instant::now();
    let ready = warmup(Probe::Streaming(Lsn(1)), false).await.unwrap();
    assert_eq!(ready, Readiness::Confirmed);
    assert!(started.elapsed() < TIMEOUT);
}

#[tokio::test]
async fn test_warmup_times_out_to_assumed() {
    let started = Instant::now();
    let ready = warmup(Probe::NotStreaming, false).await.unwrap();
    assert_eq!(ready, Readiness::Assumed);
    assert!(started.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn test_warmup_falls_back_to_fixed_delay_without_probe() {
    let started = Instant::now();
    let ready = warmup(Probe::Unavailable, false).await.unwrap();
    assert_eq!(ready, Readiness::Assumed);
    assert!(started.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn test_warmup_fails_when_capture_exits() {
    let err = warmup(Probe::NotStreaming, true).await.unwrap_err();
    assert!(matches!(err, Error::Launch { .. }));
}

async fn drain(probe: Probe, target: Option<Lsn>) -> Readiness {
    let log = EventLog::default();
    let mut catalog = MockCatalog::new(&log);
    catalog.probe = probe;
    wait_for_flush(&catalog, "mock_capture", target, TIMEOUT, POLL).await
}

#[tokio::test]
async fn test_drain_confirmed_once_flushed_past_stop() {
    let ready = drain(Probe::Streaming(Lsn(0x0200_0138)), Some(Lsn(0x0200_0138))).await;
    assert_eq!(ready, Readiness::Confirmed);
}

#[tokio::test]
async fn test_drain_gives_up_when_receiver_lags() {
    let started = Instant::now();
    let ready = drain(Probe::Streaming(Lsn(0x0100_0000)), Some(Lsn(0x0200_0138))).await;
    assert_eq!(ready, Readiness::Assumed);
    assert!(started.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn test_drain_without_target_waits_full_delay() {
    let started = Instant::now();
    let ready = drain(Probe::Streaming(Lsn(u64::MAX)), None).await;
    assert_eq!(ready, Readiness::Assumed);
    assert!(started.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn test_drain_falls_back_without_probe() {
    let ready = drain(Probe::Unavailable, Some(Lsn(1))).await;
    assert_eq!(ready, Readiness::Assumed);
}
