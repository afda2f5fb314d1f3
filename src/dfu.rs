// DFU update orchestrator
//
// idle -> validating -> transferring -> finalizing -> succeeded | failed | cancelled
//
// One session at a time. Preconditions that need no I/O are checked inside
// `start_update` itself; image resolution, service discovery and the transfer
// run on a spawned task. Every session that reaches a terminal phase restores
// the transport's default owner exactly once, before the terminal phase is
// published.

use crate::catalog::{has_legacy_bootloader, is_compatible};
use crate::coordinator::ConnectionState;
use crate::device_info::DeviceInfo;
use crate::error::{BootloaderIssue, DfuError, TransportError};
use crate::firmware::{FirmwareImage, FirmwareSource, ImageLoader};
use crate::settings::DfuTimeouts;
use crate::transport::{PeripheralId, TransportGate};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

// ============================================================================
// Session model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DfuPhase {
    Idle,
    Validating,
    Transferring,
    Finalizing,
    Succeeded,
    Failed {
        message: String,
        detail: Option<String>,
    },
    Cancelled,
}

impl DfuPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DfuPhase::Succeeded | DfuPhase::Failed { .. } | DfuPhase::Cancelled
        )
    }

    /// Validating, transferring or finalizing.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != DfuPhase::Idle
    }

    fn failed(error: &DfuError) -> Self {
        let (message, detail) = error.user_message();
        DfuPhase::Failed { message, detail }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DfuSnapshot {
    pub target: Option<PeripheralId>,
    pub source: Option<String>,
    pub phase: DfuPhase,
    /// Last reported progress fraction in [0, 1]; never decreases within a session.
    pub progress: f64,
    pub progress_message: String,
    pub image_sha256: Option<String>,
}

impl Default for DfuSnapshot {
    fn default() -> Self {
        Self {
            target: None,
            source: None,
            phase: DfuPhase::Idle,
            progress: 0.0,
            progress_message: String::new(),
            image_sha256: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub fraction: f64,
    pub message: String,
}

impl TransferProgress {
    pub fn new(fraction: f64, message: impl Into<String>) -> Self {
        Self {
            fraction,
            message: message.into(),
        }
    }
}

/// Keep reported progress inside [0, 1] and non-decreasing.
fn clamp_progress(current: f64, reported: f64) -> f64 {
    if !reported.is_finite() {
        return current;
    }
    reported.clamp(0.0, 1.0).max(current)
}

// ============================================================================
// Transport capability
// ============================================================================

/// The vendor DFU protocol, opaque to the orchestrator.
#[async_trait]
pub trait DfuTransport: Send + Sync {
    async fn has_dfu_service(&self, id: &PeripheralId) -> Result<bool, TransportError>;

    /// Take the peripheral over for the update.
    async fn claim(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Stream the image. Returns once every byte is acknowledged.
    async fn transfer(
        &self,
        id: &PeripheralId,
        image: &FirmwareImage,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<(), TransportError>;

    /// Wait for the peripheral to commit the image and reboot.
    async fn await_activation(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Best-effort abort of an in-flight transfer.
    async fn abort(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Hand the transport back to its default (non-DFU) owner. Local, no I/O.
    fn restore_default_owner(&self);
}

/// Releases the exclusive claim and restores the default owner exactly once,
/// on the normal path via `release()` or on drop if the task dies first.
struct OwnershipGuard {
    transport: Arc<dyn DfuTransport>,
    gate: TransportGate,
    released: bool,
}

impl OwnershipGuard {
    fn new(transport: Arc<dyn DfuTransport>, gate: TransportGate) -> Self {
        Self {
            transport,
            gate,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.gate.release();
        self.transport.restore_default_owner();
    }
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        self.release();
    }
}

enum SessionEnd {
    Failed(DfuError),
    Cancelled,
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Inner {
    transport: Arc<dyn DfuTransport>,
    loader: Arc<dyn ImageLoader>,
    connection: watch::Receiver<ConnectionState>,
    gate: TransportGate,
    timeouts: DfuTimeouts,
    state: watch::Sender<DfuSnapshot>,
    /// Cancel signal for the running session, if any.
    session: Mutex<Option<watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct DfuOrchestrator {
    inner: Arc<Inner>,
}

impl DfuOrchestrator {
    pub fn new(
        transport: Arc<dyn DfuTransport>,
        loader: Arc<dyn ImageLoader>,
        connection: watch::Receiver<ConnectionState>,
        gate: TransportGate,
        timeouts: DfuTimeouts,
    ) -> Self {
        let (state, _) = watch::channel(DfuSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                loader,
                connection,
                gate,
                timeouts,
                state,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> DfuSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DfuSnapshot> {
        self.inner.state.subscribe()
    }

    /// Begin an update of `target`. Must be called from within a tokio runtime.
    ///
    /// Fails immediately, without touching the transport, if a session is
    /// already active or a precondition does not hold. In the latter case the
    /// new session ends in `failed` before this returns.
    pub fn start_update(
        &self,
        target: PeripheralId,
        source: FirmwareSource,
        device_info: &DeviceInfo,
    ) -> Result<(), DfuError> {
        let inner = &self.inner;
        let mut slot = inner.lock_session();
        if inner.state.borrow().phase.is_active() {
            return Err(DfuError::UpdateAlreadyInProgress);
        }

        tracing::info!(
            "[dfu] Starting update of {} with {}",
            target,
            source.describe()
        );
        inner.state.send_replace(DfuSnapshot {
            target: Some(target.clone()),
            source: Some(source.describe()),
            phase: DfuPhase::Validating,
            progress_message: "Validating".to_string(),
            ..DfuSnapshot::default()
        });

        let mut guard = OwnershipGuard::new(inner.transport.clone(), inner.gate.clone());
        if let Err(e) = inner.check_preconditions(&target, &source, device_info) {
            tracing::warn!("[dfu] Update of {} rejected: {}", target, e);
            guard.release();
            inner.publish_terminal(&mut slot, DfuPhase::failed(&e));
            return Err(e);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *slot = Some(cancel_tx);
        drop(slot);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_session(target, source, cancel_rx, guard).await;
        });
        Ok(())
    }

    /// Request cancellation of the running session. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match self.inner.lock_session().as_ref() {
            Some(cancel) => {
                tracing::info!("[dfu] Cancel requested");
                let _ = cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Forget a finished session (dialog dismissed). No-op while active.
    pub fn reset(&self) {
        let _slot = self.inner.lock_session();
        self.inner.state.send_if_modified(|snapshot| {
            if snapshot.phase.is_terminal() {
                *snapshot = DfuSnapshot::default();
                true
            } else {
                false
            }
        });
    }

    /// Wait until the current session reaches a terminal phase.
    pub async fn wait_until_finished(&self) -> DfuPhase {
        let mut rx = self.subscribe();
        let phase = match rx.wait_for(|snapshot| !snapshot.phase.is_active()).await {
            Ok(snapshot) => snapshot.phase.clone(),
            Err(_) => self.snapshot().phase,
        };
        phase
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_preconditions(
        &self,
        target: &PeripheralId,
        source: &FirmwareSource,
        device_info: &DeviceInfo,
    ) -> Result<(), DfuError> {
        if self.connection.borrow().connected() != Some(target) {
            return Err(DfuError::NotConnected);
        }
        if has_legacy_bootloader(device_info) {
            return Err(DfuError::IncompatibleBootloader(BootloaderIssue::Legacy));
        }
        if let Some(release) = source.release() {
            if !is_compatible(device_info, release) {
                return Err(DfuError::IncompatibleBootloader(
                    BootloaderIssue::BelowMinimum {
                        required: release.min_bootloader_version.clone(),
                        found: device_info.bootloader_version.clone(),
                    },
                ));
            }
        }
        Ok(())
    }

    async fn run_session(
        &self,
        target: PeripheralId,
        source: FirmwareSource,
        mut cancel: watch::Receiver<bool>,
        mut guard: OwnershipGuard,
    ) {
        let cancelled = async {
            if cancel.wait_for(|requested| *requested).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancelled => Err(SessionEnd::Cancelled),
            result = self.drive(&target, &source) => result.map_err(SessionEnd::Failed),
        };

        let terminal = match outcome {
            Ok(()) => {
                tracing::info!("[dfu] Update of {} succeeded", target);
                DfuPhase::Succeeded
            }
            Err(SessionEnd::Failed(e)) => {
                tracing::error!("[dfu] Update of {} failed: {}", target, e);
                DfuPhase::failed(&e)
            }
            Err(SessionEnd::Cancelled) => {
                let phase = self.state.borrow().phase.clone();
                if matches!(phase, DfuPhase::Transferring | DfuPhase::Finalizing) {
                    self.abort(&target).await;
                }
                tracing::warn!(
                    "[dfu] Update of {} cancelled; device firmware may be left incomplete",
                    target
                );
                DfuPhase::Cancelled
            }
        };

        guard.release();
        let mut slot = self.lock_session();
        self.publish_terminal(&mut slot, terminal);
    }

    async fn drive(&self, target: &PeripheralId, source: &FirmwareSource) -> Result<(), DfuError> {
        let image = self
            .loader
            .load(source)
            .await
            .map_err(|e| DfuError::MissingFirmwareImage(e.to_string()))?;
        self.state.send_modify(|snapshot| {
            snapshot.image_sha256 = Some(image.sha256.clone());
        });

        if !self.transport.has_dfu_service(target).await? {
            return Err(DfuError::DfuServiceNotFound);
        }

        self.gate.try_claim(target)?;
        self.transport.claim(target).await?;
        self.set_phase(DfuPhase::Transferring, "Uploading firmware");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let transfer = async {
            let (result, ()) = tokio::join!(
                self.transport.transfer(target, &image, progress_tx),
                async {
                    while let Some(progress) = progress_rx.recv().await {
                        self.report_progress(progress);
                    }
                }
            );
            result
        };
        tokio::time::timeout(self.timeouts.transfer, transfer)
            .await
            .map_err(|_| TransportError::Timeout("Firmware transfer"))??;

        self.set_phase(DfuPhase::Finalizing, "Activating new firmware");
        self.report_progress(TransferProgress::new(1.0, "Activating new firmware"));
        tokio::time::timeout(self.timeouts.finalize, self.transport.await_activation(target))
            .await
            .map_err(|_| TransportError::Timeout("Firmware activation"))??;
        Ok(())
    }

    async fn abort(&self, target: &PeripheralId) {
        match tokio::time::timeout(self.timeouts.cancel_grace, self.transport.abort(target)).await {
            Ok(Ok(())) => tracing::info!("[dfu] Transfer to {} aborted", target),
            Ok(Err(e)) => tracing::warn!("[dfu] Abort of {} failed: {}", target, e),
            Err(_) => tracing::warn!("[dfu] No abort confirmation from {} within grace period", target),
        }
    }

    fn set_phase(&self, phase: DfuPhase, message: &str) {
        tracing::debug!("[dfu] Phase {:?}", phase);
        self.state.send_modify(|snapshot| {
            snapshot.phase = phase;
            snapshot.progress_message = message.to_string();
        });
    }

    fn report_progress(&self, progress: TransferProgress) {
        self.state.send_modify(|snapshot| {
            snapshot.progress = clamp_progress(snapshot.progress, progress.fraction);
            snapshot.progress_message = progress.message;
        });
    }

    /// Caller holds the session lock, so a new session cannot slip in between.
    fn publish_terminal(&self, slot: &mut Option<watch::Sender<bool>>, phase: DfuPhase) {
        *slot = None;
        self.state.send_modify(|snapshot| snapshot.phase = phase);
    }
}
