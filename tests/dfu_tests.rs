//! DFU orchestrator sessions against a scripted transport.

use async_trait::async_trait;
use bluefruit_connect_lib::dfu::TransferProgress;
use bluefruit_connect_lib::error::{BootloaderIssue, FirmwareError};
use bluefruit_connect_lib::firmware::{FirmwareImage, ImageLoader};
use bluefruit_connect_lib::settings::DfuTimeouts;
use bluefruit_connect_lib::{
    ConnectionState, DeviceInfo, DfuError, DfuOrchestrator, DfuPhase, DfuTransport,
    FirmwareSource, PeripheralId, ReleaseEntry, TransportError, TransportGate,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transfer {
    Complete,
    Hang,
    Fail,
}

struct MockDfu {
    has_service: bool,
    transfer: Transfer,
    /// The device never confirms an abort.
    silent_abort: bool,
    calls: Mutex<Vec<&'static str>>,
    restores: AtomicUsize,
}

impl MockDfu {
    fn new(has_service: bool, transfer: Transfer) -> Arc<Self> {
        Arc::new(Self::build(has_service, transfer, false))
    }

    fn with_silent_abort(transfer: Transfer) -> Arc<Self> {
        Arc::new(Self::build(true, transfer, true))
    }

    fn build(has_service: bool, transfer: Transfer, silent_abort: bool) -> Self {
        Self {
            has_service,
            transfer,
            silent_abort,
            calls: Mutex::new(Vec::new()),
            restores: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DfuTransport for MockDfu {
    async fn has_dfu_service(&self, _id: &PeripheralId) -> Result<bool, TransportError> {
        self.record("has_dfu_service");
        Ok(self.has_service)
    }

    async fn claim(&self, _id: &PeripheralId) -> Result<(), TransportError> {
        self.record("claim");
        Ok(())
    }

    async fn transfer(
        &self,
        _id: &PeripheralId,
        image: &FirmwareImage,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<(), TransportError> {
        self.record("transfer");
        assert!(!image.is_empty());
        let _ = progress.send(TransferProgress::new(0.6, "Uploading firmware"));
        // Out-of-order report; must not move progress backwards.
        let _ = progress.send(TransferProgress::new(0.2, "Uploading firmware"));
        match self.transfer {
            Transfer::Complete => {
                let _ = progress.send(TransferProgress::new(1.0, "Verifying"));
                Ok(())
            }
            Transfer::Hang => std::future::pending().await,
            Transfer::Fail => Err(TransportError::Io("Remote DFU error: CRC error".to_string())),
        }
    }

    async fn await_activation(&self, _id: &PeripheralId) -> Result<(), TransportError> {
        self.record("await_activation");
        Ok(())
    }

    async fn abort(&self, _id: &PeripheralId) -> Result<(), TransportError> {
        self.record("abort");
        if self.silent_abort {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn restore_default_owner(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}

struct StaticLoader {
    image: Option<Vec<u8>>,
}

#[async_trait]
impl ImageLoader for StaticLoader {
    async fn load(&self, _source: &FirmwareSource) -> Result<FirmwareImage, FirmwareError> {
        match &self.image {
            Some(data) => FirmwareImage::new(data.clone(), Some(vec![0x01, 0x02])),
            None => Err(FirmwareError::Download {
                url: "https://example.invalid/fw.hex".to_string(),
                message: "404 Not Found".to_string(),
            }),
        }
    }
}

struct Fixture {
    dfu: DfuOrchestrator,
    transport: Arc<MockDfu>,
    gate: TransportGate,
    _connection: watch::Sender<ConnectionState>,
}

fn target() -> PeripheralId {
    PeripheralId::from("feather")
}

fn timeouts() -> DfuTimeouts {
    DfuTimeouts {
        transfer: Duration::from_secs(60),
        finalize: Duration::from_secs(30),
        cancel_grace: Duration::from_secs(2),
    }
}

fn fixture_with(
    transport: Arc<MockDfu>,
    image: Option<Vec<u8>>,
    state: ConnectionState,
    timeouts: DfuTimeouts,
) -> Fixture {
    let (connection, connection_rx) = watch::channel(state);
    let gate = TransportGate::new();
    let dfu = DfuOrchestrator::new(
        transport.clone(),
        Arc::new(StaticLoader { image }),
        connection_rx,
        gate.clone(),
        timeouts,
    );
    Fixture {
        dfu,
        transport,
        gate,
        _connection: connection,
    }
}

fn fixture(transport: Arc<MockDfu>) -> Fixture {
    fixture_with(
        transport,
        Some(vec![0xAB; 64]),
        ConnectionState::Connected(target()),
        timeouts(),
    )
}

fn device(bootloader: &str) -> DeviceInfo {
    DeviceInfo {
        model_number: Some("BLEFRIEND32".to_string()),
        software_revision: Some("0.6.7".to_string()),
        bootloader_version: bootloader.to_string(),
        ..DeviceInfo::default()
    }
}

fn local_source() -> FirmwareSource {
    FirmwareSource::Local {
        image: PathBuf::from("app.hex"),
        init: Some(PathBuf::from("app.dat")),
    }
}

fn release(min_bootloader: &str) -> FirmwareSource {
    FirmwareSource::Release(ReleaseEntry {
        version: "0.7.0".to_string(),
        is_beta: false,
        min_bootloader_version: min_bootloader.to_string(),
        board_name: "Bluefruit LE Friend 32KB".to_string(),
        image_url: "https://example.invalid/fw.hex".to_string(),
        init_url: None,
    })
}

async fn wait_for_phase(f: &Fixture, phase: DfuPhase) {
    let mut rx = f.dfu.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.phase == phase))
        .await
        .is_ok_and(|r| r.is_ok());
    assert!(reached, "phase {phase:?} never reached");
}

/// Wait until the transfer's early progress reports have been applied.
async fn wait_for_progress(f: &Fixture) {
    let mut rx = f.dfu.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.progress > 0.0))
        .await
        .is_ok_and(|r| r.is_ok());
    assert!(reached, "no progress reported");
}

// ── Successful session ──────────────────────────────────────

#[tokio::test]
async fn test_update_succeeds_and_restores_once() {
    let f = fixture(MockDfu::new(true, Transfer::Complete));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    assert_eq!(f.dfu.wait_until_finished().await, DfuPhase::Succeeded);

    assert_eq!(
        f.transport.calls(),
        vec!["has_dfu_service", "claim", "transfer", "await_activation"]
    );
    assert_eq!(f.transport.restores(), 1);
    assert!(!f.gate.is_claimed(&target()));

    let snapshot = f.dfu.snapshot();
    assert_eq!(snapshot.target, Some(target()));
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(snapshot.image_sha256.as_ref().map(String::len), Some(64));
}

#[tokio::test]
async fn test_reset_after_terminal_returns_to_idle() {
    let f = fixture(MockDfu::new(true, Transfer::Complete));
    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    f.dfu.wait_until_finished().await;

    f.dfu.reset();
    assert_eq!(f.dfu.snapshot().phase, DfuPhase::Idle);
    assert!(!f.dfu.cancel());

    // A second session may start once the first has finished.
    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    assert_eq!(f.dfu.wait_until_finished().await, DfuPhase::Succeeded);
    assert_eq!(f.transport.restores(), 2);
}

// ── Precondition failures ───────────────────────────────────

#[tokio::test]
async fn test_legacy_bootloader_fails_without_transport_io() {
    let f = fixture(MockDfu::new(true, Transfer::Complete));

    let err = f
        .dfu
        .start_update(target(), local_source(), &device("0.0"))
        .unwrap_err();
    assert_eq!(err, DfuError::IncompatibleBootloader(BootloaderIssue::Legacy));

    assert!(matches!(f.dfu.snapshot().phase, DfuPhase::Failed { .. }));
    assert!(f.transport.calls().is_empty());
    assert_eq!(f.transport.restores(), 1);
}

#[tokio::test]
async fn test_release_requiring_newer_bootloader_is_rejected() {
    let f = fixture(MockDfu::new(true, Transfer::Complete));

    let err = f
        .dfu
        .start_update(target(), release("0.5"), &device("0.2"))
        .unwrap_err();
    assert!(matches!(
        err,
        DfuError::IncompatibleBootloader(BootloaderIssue::BelowMinimum { .. })
    ));
    match f.dfu.snapshot().phase {
        DfuPhase::Failed { detail, .. } => assert_eq!(
            detail.as_deref(),
            Some("Bootloader 0.2 found, version 0.5 or later is required")
        ),
        other => panic!("unexpected phase {other:?}"),
    }
    assert!(f.transport.calls().is_empty());
}

#[tokio::test]
async fn test_not_connected_is_rejected() {
    let f = fixture_with(
        MockDfu::new(true, Transfer::Complete),
        Some(vec![0xAB; 64]),
        ConnectionState::Connecting(target()),
        timeouts(),
    );

    assert_eq!(
        f.dfu.start_update(target(), local_source(), &device("0.2")),
        Err(DfuError::NotConnected)
    );
    assert!(f.transport.calls().is_empty());
    assert_eq!(f.transport.restores(), 1);
}

#[tokio::test]
async fn test_missing_image_fails_before_service_lookup() {
    let f = fixture_with(
        MockDfu::new(true, Transfer::Complete),
        None,
        ConnectionState::Connected(target()),
        timeouts(),
    );

    f.dfu.start_update(target(), release("0.1"), &device("0.2")).unwrap();
    match f.dfu.wait_until_finished().await {
        DfuPhase::Failed { message, detail } => {
            assert_eq!(message, "Firmware image unavailable");
            assert!(detail.unwrap().contains("404 Not Found"));
        }
        other => panic!("unexpected phase {other:?}"),
    }
    assert!(f.transport.calls().is_empty());
    assert_eq!(f.transport.restores(), 1);
}

#[tokio::test]
async fn test_missing_dfu_service() {
    let f = fixture(MockDfu::new(false, Transfer::Complete));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    assert_eq!(
        f.dfu.wait_until_finished().await,
        DfuPhase::Failed {
            message: "No DFU Service found on device".to_string(),
            detail: None,
        }
    );
    assert_eq!(f.transport.calls(), vec!["has_dfu_service"]);
    assert_eq!(f.transport.restores(), 1);
}

// ── Transport failures ──────────────────────────────────────

#[tokio::test]
async fn test_transfer_error_carries_detail() {
    let f = fixture(MockDfu::new(true, Transfer::Fail));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    match f.dfu.wait_until_finished().await {
        DfuPhase::Failed { message, detail } => {
            assert_eq!(message, "Firmware update failed");
            assert_eq!(detail.as_deref(), Some("Remote DFU error: CRC error"));
        }
        other => panic!("unexpected phase {other:?}"),
    }
    assert!(!f.transport.calls().contains(&"await_activation"));
    assert_eq!(f.transport.restores(), 1);
    assert!(!f.gate.is_claimed(&target()));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_times_out() {
    let timeouts = DfuTimeouts {
        transfer: Duration::from_secs(10),
        ..timeouts()
    };
    let f = fixture_with(
        MockDfu::new(true, Transfer::Hang),
        Some(vec![0xAB; 64]),
        ConnectionState::Connected(target()),
        timeouts,
    );

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    match f.dfu.wait_until_finished().await {
        DfuPhase::Failed { detail, .. } => {
            assert_eq!(detail.as_deref(), Some("Firmware transfer timed out"))
        }
        other => panic!("unexpected phase {other:?}"),
    }
    assert_eq!(f.transport.restores(), 1);
}

// ── Cancellation and re-entrancy ────────────────────────────

#[tokio::test]
async fn test_cancel_during_transfer_aborts_and_restores() {
    let f = fixture(MockDfu::new(true, Transfer::Hang));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    wait_for_phase(&f, DfuPhase::Transferring).await;
    wait_for_progress(&f).await;
    assert!(f.gate.is_claimed(&target()));

    assert!(f.dfu.cancel());
    assert_eq!(f.dfu.wait_until_finished().await, DfuPhase::Cancelled);

    assert_eq!(f.transport.calls().last(), Some(&"abort"));
    assert_eq!(f.transport.restores(), 1);
    assert!(!f.gate.is_claimed(&target()));
    // The out-of-order 0.2 report did not move progress backwards.
    assert_eq!(f.dfu.snapshot().progress, 0.6);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_completes_after_grace_without_abort_confirmation() {
    let f = fixture(MockDfu::with_silent_abort(Transfer::Hang));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    wait_for_phase(&f, DfuPhase::Transferring).await;

    let cancelled_at = tokio::time::Instant::now();
    assert!(f.dfu.cancel());
    assert_eq!(f.dfu.wait_until_finished().await, DfuPhase::Cancelled);

    let elapsed = cancelled_at.elapsed();
    assert!(elapsed >= timeouts().cancel_grace, "finished after {elapsed:?}");
    assert!(elapsed < timeouts().cancel_grace + Duration::from_secs(1));
    assert_eq!(f.transport.calls().last(), Some(&"abort"));
    assert_eq!(f.transport.restores(), 1);
    assert!(!f.gate.is_claimed(&target()));
}

#[tokio::test]
async fn test_second_start_while_active_is_rejected() {
    let f = fixture(MockDfu::new(true, Transfer::Hang));

    f.dfu.start_update(target(), local_source(), &device("0.2")).unwrap();
    wait_for_phase(&f, DfuPhase::Transferring).await;
    let calls_before = f.transport.calls();

    assert_eq!(
        f.dfu.start_update(target(), local_source(), &device("0.2")),
        Err(DfuError::UpdateAlreadyInProgress)
    );
    assert_eq!(f.transport.calls(), calls_before);
    assert_eq!(f.dfu.snapshot().phase, DfuPhase::Transferring);
    assert_eq!(f.transport.restores(), 0);

    f.dfu.cancel();
    f.dfu.wait_until_finished().await;
    assert_eq!(f.transport.restores(), 1);
}
