// BLE manager
//
// Single owner of the peripheral registry and the connection coordinator.
// Commands from handles, radio events and transport completions are all
// funnelled into one task and applied in arrival order, so no state is ever
// touched from the transport's own threads. Domain events go out on a
// broadcast channel; the connection state is also published on a watch
// channel for components (such as the DFU orchestrator) that only need the
// latest value.

use crate::coordinator::{BleEvent, ConnectionCoordinator, ConnectionState, Effect, TransportCall};
use crate::error::{ConnectError, ScanError, TransportError};
use crate::registry::{PeripheralRegistry, PeripheralSummary};
use crate::settings::DiscoveryConfig;
use crate::transport::{AdapterState, PeripheralId, RadioEvent, RadioTransport};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

const EVENT_CAPACITY: usize = 256;
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub adapter_state: AdapterState,
    pub scanning: bool,
    pub was_scanning_before_off: bool,
}

enum Command {
    StartScan(oneshot::Sender<Result<(), ScanError>>),
    StopScan(oneshot::Sender<()>),
    Connect(PeripheralId, oneshot::Sender<Result<(), ConnectError>>),
    Disconnect(PeripheralId),
    Refresh(oneshot::Sender<()>),
    Peripherals(oneshot::Sender<Vec<PeripheralSummary>>),
    Status(oneshot::Sender<ManagerStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Connect {
        id: PeripheralId,
        attempt: u64,
        result: Result<(), TransportError>,
    },
    Disconnect {
        id: PeripheralId,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, cloneable front end to the manager task.
#[derive(Clone)]
pub struct BleHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<BleEvent>,
    connection: watch::Receiver<ConnectionState>,
}

impl BleHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn start_scan(&self) -> Result<(), ScanError> {
        self.request(Command::StartScan)
            .await
            .unwrap_or(Err(ScanError::ManagerStopped))
    }

    pub async fn stop_scan(&self) {
        let _ = self.request(Command::StopScan).await;
    }

    /// Request a connection. `Ok` means the intent was accepted; the outcome
    /// arrives as a `Connected` or `Disconnected` event.
    pub async fn connect(&self, id: &PeripheralId) -> Result<(), ConnectError> {
        self.request(|reply| Command::Connect(id.clone(), reply))
            .await
            .unwrap_or(Err(ConnectError::ManagerStopped))
    }

    /// Request a connection and wait for its outcome.
    pub async fn connect_and_wait(&self, id: &PeripheralId) -> Result<(), ConnectError> {
        let mut events = self.events.subscribe();
        self.connect(id).await?;
        await_connection(&mut events, &self.connection, id).await
    }

    pub fn disconnect(&self, id: &PeripheralId) -> Result<(), ConnectError> {
        self.commands
            .send(Command::Disconnect(id.clone()))
            .map_err(|_| ConnectError::ManagerStopped)
    }

    /// Drop every peripheral except the active one and restart the scan.
    pub async fn refresh(&self) {
        let _ = self.request(Command::Refresh).await;
    }

    /// Known peripherals, ordered by display name.
    pub async fn peripherals(&self) -> Vec<PeripheralSummary> {
        self.request(Command::Peripherals).await.unwrap_or_default()
    }

    pub async fn status(&self) -> Option<ManagerStatus> {
        self.request(Command::Status).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.events.subscribe()
    }

    /// Stop scanning, drop the active link and end the manager task.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

// ============================================================================
// Manager task
// ============================================================================

pub struct BleManager {
    transport: Arc<dyn RadioTransport>,
    config: DiscoveryConfig,
    registry: PeripheralRegistry,
    coordinator: ConnectionCoordinator,
    events: broadcast::Sender<BleEvent>,
    connection: watch::Sender<ConnectionState>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl BleManager {
    /// Start the manager task. Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn RadioTransport>, config: DiscoveryConfig) -> BleHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connection, connection_rx) = watch::channel(ConnectionState::Idle);

        let manager = BleManager {
            transport,
            config,
            registry: PeripheralRegistry::new(),
            coordinator: ConnectionCoordinator::new(),
            events: events.clone(),
            connection,
            completions: completion_tx,
        };
        tokio::spawn(manager.run(command_rx, completion_rx));

        BleHandle {
            commands: command_tx,
            events,
            connection: connection_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut radio_events = match self.transport.events().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("[manager] Radio events unavailable: {}", e);
                futures::stream::pending().boxed()
            }
        };

        let mut sweep = tokio::time::interval(self.config.check_period.max(MIN_SWEEP_PERIOD));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "[manager] Started (staleness eviction {})",
            if self.config.undiscover_enabled { "on" } else { "off" }
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion).await,
                event = radio_events.next() => match event {
                    Some(event) => self.handle_radio_event(event).await,
                    None => {
                        tracing::warn!("[manager] Radio event stream ended");
                        radio_events = futures::stream::pending().boxed();
                    }
                },
                _ = sweep.tick(), if self.config.undiscover_enabled => self.evict_stale(),
            }
        }
        tracing::info!("[manager] Stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan(reply) => {
                let effects = self.coordinator.start_scan();
                let result = self.apply(effects).await.map_err(ScanError::from);
                let _ = reply.send(result);
            }
            Command::StopScan(reply) => {
                let effects = self.coordinator.stop_scan();
                let _ = self.apply(effects).await;
                let _ = reply.send(());
            }
            Command::Connect(id, reply) => match self.coordinator.connect(&id) {
                Ok(effects) => {
                    let _ = self.apply(effects).await;
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    tracing::warn!("[manager] Connect to {} rejected: {}", id, e);
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect(id) => {
                let effects = self.coordinator.disconnect(&id);
                let _ = self.apply(effects).await;
            }
            Command::Refresh(reply) => {
                self.refresh().await;
                let _ = reply.send(());
            }
            Command::Peripherals(reply) => {
                let _ = reply.send(self.registry.summaries());
            }
            Command::Status(reply) => {
                let _ = reply.send(ManagerStatus {
                    adapter_state: self.coordinator.adapter_state(),
                    scanning: self.coordinator.is_scanning(),
                    was_scanning_before_off: self.coordinator.was_scanning_before_off(),
                });
            }
            // Handled in the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let effects = match completion {
            Completion::Connect {
                id,
                attempt,
                result: Ok(()),
            } => {
                tracing::info!("[manager] Connected to {}", id);
                self.coordinator.on_connect_succeeded(&id, attempt)
            }
            Completion::Connect {
                id,
                attempt,
                result: Err(e),
            } => {
                tracing::warn!("[manager] Connect to {} failed: {}", id, e);
                self.coordinator.on_connect_failed(&id, attempt)
            }
            Completion::Disconnect { id } => self.coordinator.on_disconnect_completed(&id),
        };
        let _ = self.apply(effects).await;
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered {
                id,
                name,
                advertisement,
                rssi,
            } => {
                let now = tokio::time::Instant::now().into_std();
                if self.registry.on_discovered(&id, name, advertisement, rssi, now) {
                    tracing::debug!("[manager] Discovered {}", id);
                }
                self.notify(BleEvent::PeripheralDiscovered(id));
            }
            RadioEvent::AdapterStateChanged(state) => {
                tracing::info!("[manager] Adapter state: {:?}", state);
                let effects = self.coordinator.on_adapter_state(state);
                if let Err(e) = self.apply(effects).await {
                    tracing::warn!("[manager] Failed to resume scan: {}", e);
                }
            }
            RadioEvent::LinkLost(id) => {
                let effects = self.coordinator.on_link_lost(&id);
                if !effects.is_empty() {
                    tracing::info!("[manager] Link to {} lost", id);
                }
                let _ = self.apply(effects).await;
            }
        }
    }

    fn evict_stale(&mut self) {
        let now = tokio::time::Instant::now().into_std();
        let protected = self.coordinator.protected_ids();
        for id in self
            .registry
            .evict_stale(now, self.config.threshold, &protected)
        {
            tracing::debug!("[manager] {} out of range", id);
            self.notify(BleEvent::PeripheralUndiscovered(id));
        }
    }

    async fn refresh(&mut self) {
        let protected = self.coordinator.protected_ids();
        for id in self.registry.refresh(&protected) {
            self.notify(BleEvent::PeripheralUndiscovered(id));
        }
        let mut effects = self.coordinator.stop_scan();
        effects.extend(self.coordinator.start_scan());
        if let Err(e) = self.apply(effects).await {
            tracing::warn!("[manager] Failed to restart scan: {}", e);
        }
    }

    /// Carry out coordinator effects in order. A failed scan start is reported
    /// back to the caller and its `ScanStarted` notification suppressed.
    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), TransportError> {
        let mut scan_error = None;
        for effect in effects {
            match effect {
                Effect::Notify(BleEvent::ScanStarted) if scan_error.is_some() => {}
                Effect::Notify(event) => self.notify(event),
                Effect::Transport(call) => {
                    if let Err(e) = self.execute(call).await {
                        scan_error = Some(e);
                    }
                }
            }
        }
        self.publish_state();
        scan_error.map_or(Ok(()), Err)
    }

    async fn execute(&mut self, call: TransportCall) -> Result<(), TransportError> {
        match call {
            TransportCall::StartScan => {
                let call = self.transport.start_scan();
                let result = tokio::time::timeout(self.config.connect_timeout, call)
                    .await
                    .unwrap_or(Err(TransportError::Timeout("Start scan")));
                if let Err(e) = result {
                    tracing::error!("[manager] Failed to start scan: {}", e);
                    let _ = self.coordinator.on_scan_failed();
                    return Err(e);
                }
            }
            TransportCall::StopScan => {
                let call = self.transport.stop_scan();
                let result = tokio::time::timeout(self.config.connect_timeout, call)
                    .await
                    .unwrap_or(Err(TransportError::Timeout("Stop scan")));
                if let Err(e) = result {
                    tracing::warn!("[manager] Failed to stop scan: {}", e);
                }
            }
            TransportCall::Connect { id, attempt } => {
                let transport = self.transport.clone();
                let completions = self.completions.clone();
                let timeout = self.config.connect_timeout;
                tokio::spawn(async move {
                    let result = match tokio::time::timeout(timeout, transport.connect(&id)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout("Connect")),
                    };
                    let _ = completions.send(Completion::Connect {
                        id,
                        attempt,
                        result,
                    });
                });
            }
            TransportCall::Disconnect { id } => {
                let transport = self.transport.clone();
                let completions = self.completions.clone();
                let timeout = self.config.connect_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, transport.disconnect(&id)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("[manager] Disconnect from {} failed: {}", id, e),
                        Err(_) => tracing::warn!("[manager] Disconnect from {} timed out", id),
                    }
                    let _ = completions.send(Completion::Disconnect { id });
                });
            }
        }
        Ok(())
    }

    fn notify(&self, event: BleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        let state = self.coordinator.state().clone();
        self.connection.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    async fn shutdown(&mut self) {
        if self.coordinator.is_scanning() {
            let _ = self.transport.stop_scan().await;
        }
        if let Some(id) = self.coordinator.state().peripheral().cloned() {
            let _ = tokio::time::timeout(self.config.connect_timeout, self.transport.disconnect(&id)).await;
        }
    }
}

/// Follow `events` until `id` connects or drops. A receiver that falls behind
/// reads the published connection state instead.
async fn await_connection(
    events: &mut broadcast::Receiver<BleEvent>,
    connection: &watch::Receiver<ConnectionState>,
    id: &PeripheralId,
) -> Result<(), ConnectError> {
    loop {
        match events.recv().await {
            Ok(BleEvent::Connected(connected)) if &connected == id => return Ok(()),
            Ok(BleEvent::Disconnected(lost)) if &lost == id => {
                return Err(ConnectError::Failed(id.clone()))
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("[manager] Event receiver skipped {} events", skipped);
                let state = connection.borrow().clone();
                if state.connected() == Some(id) {
                    return Ok(());
                }
                if state.peripheral() != Some(id) {
                    return Err(ConnectError::Failed(id.clone()));
                }
            }
            Err(broadcast::error::RecvError::Closed) => return Err(ConnectError::ManagerStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A receiver that has fallen behind by more than its capacity.
    fn flooded(capacity: usize) -> (broadcast::Sender<BleEvent>, broadcast::Receiver<BleEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        for i in 0..capacity * 2 {
            tx.send(BleEvent::PeripheralDiscovered(format!("p{i}").into()))
                .unwrap();
        }
        (tx, rx)
    }

    #[tokio::test]
    async fn test_lagged_receiver_reads_connected_state() {
        let (_tx, mut events) = flooded(4);
        let id = PeripheralId::from("a");
        let (_state, connection) = watch::channel(ConnectionState::Connected(id.clone()));
        assert_eq!(await_connection(&mut events, &connection, &id).await, Ok(()));
    }

    #[tokio::test]
    async fn test_lagged_receiver_reads_failed_attempt() {
        let (_tx, mut events) = flooded(4);
        let id = PeripheralId::from("a");
        let (_state, connection) = watch::channel(ConnectionState::Idle);
        assert_eq!(
            await_connection(&mut events, &connection, &id).await,
            Err(ConnectError::Failed(id))
        );
    }

    #[tokio::test]
    async fn test_closed_stream_reports_stopped_manager() {
        let (tx, mut events) = broadcast::channel(4);
        drop(tx);
        let id = PeripheralId::from("a");
        let (_state, connection) = watch::channel(ConnectionState::Connecting(id.clone()));
        assert_eq!(
            await_connection(&mut events, &connection, &id).await,
            Err(ConnectError::ManagerStopped)
        );
    }
}
