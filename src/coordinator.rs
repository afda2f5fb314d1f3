// Connection coordinator
//
// Single source of truth for "which peripheral is connecting / connected"
// and whether a scan is running. The coordinator performs no I/O: every
// input returns the effects (transport calls, notifications) the manager
// must carry out, in order. Transport completions come back in through the
// `on_*` methods; each connect attempt is tagged so late completions from a
// superseded attempt are recognised and dropped.

use crate::error::ConnectError;
use crate::transport::{AdapterState, PeripheralId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "peripheral", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting(PeripheralId),
    Connected(PeripheralId),
}

impl ConnectionState {
    /// The connecting or connected peripheral, if any.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::Connecting(id) | ConnectionState::Connected(id) => Some(id),
        }
    }

    pub fn connected(&self) -> Option<&PeripheralId> {
        match self {
            ConnectionState::Connected(id) => Some(id),
            _ => None,
        }
    }
}

/// Domain notifications for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BleEvent {
    AdapterStateChanged(AdapterState),
    ScanStarted,
    ScanStopped,
    PeripheralDiscovered(PeripheralId),
    PeripheralUndiscovered(PeripheralId),
    Connecting(PeripheralId),
    Connected(PeripheralId),
    Disconnecting(PeripheralId),
    Disconnected(PeripheralId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect { id: PeripheralId, attempt: u64 },
    Disconnect { id: PeripheralId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Transport(TransportCall),
    Notify(BleEvent),
}

#[derive(Debug)]
pub struct ConnectionCoordinator {
    state: ConnectionState,
    attempt: u64,
    /// Disconnect requested, completion not yet seen.
    disconnecting: Option<PeripheralId>,
    /// Connect accepted while the previous target is being torn down.
    queued: Option<PeripheralId>,
    adapter_state: AdapterState,
    scanning: bool,
    was_scanning_before_off: bool,
}

impl Default for ConnectionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCoordinator {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            disconnecting: None,
            queued: None,
            adapter_state: AdapterState::Unknown,
            scanning: false,
            was_scanning_before_off: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn was_scanning_before_off(&self) -> bool {
        self.was_scanning_before_off
    }

    /// Identifiers that must survive staleness eviction and refresh.
    pub fn protected_ids(&self) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self.state.peripheral().cloned().into_iter().collect();
        if let Some(queued) = &self.queued {
            if !ids.contains(queued) {
                ids.push(queued.clone());
            }
        }
        ids
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub fn start_scan(&mut self) -> Vec<Effect> {
        if self.adapter_state == AdapterState::PoweredOff {
            // Remember the intent; scanning resumes once power returns.
            self.was_scanning_before_off = true;
            return Vec::new();
        }
        if self.scanning {
            return Vec::new();
        }
        self.scanning = true;
        vec![
            Effect::Transport(TransportCall::StartScan),
            Effect::Notify(BleEvent::ScanStarted),
        ]
    }

    pub fn stop_scan(&mut self) -> Vec<Effect> {
        self.was_scanning_before_off = false;
        if !self.scanning {
            return Vec::new();
        }
        self.scanning = false;
        vec![
            Effect::Transport(TransportCall::StopScan),
            Effect::Notify(BleEvent::ScanStopped),
        ]
    }

    /// The transport refused to start scanning.
    pub fn on_scan_failed(&mut self) -> Vec<Effect> {
        if !self.scanning {
            return Vec::new();
        }
        self.scanning = false;
        vec![Effect::Notify(BleEvent::ScanStopped)]
    }

    // ------------------------------------------------------------------
    // Connection intents
    // ------------------------------------------------------------------

    pub fn connect(&mut self, id: &PeripheralId) -> Result<Vec<Effect>, ConnectError> {
        if self.adapter_state == AdapterState::PoweredOff {
            return Err(ConnectError::AdapterPoweredOff);
        }

        let current = match self.state.peripheral() {
            None => return Ok(self.begin_connect(id)),
            Some(current) => current.clone(),
        };

        if &current == id {
            // Reconnect to a target we are tearing down: wait for the
            // disconnect to finish, then connect again.
            if self.disconnecting.as_ref() == Some(id) {
                return match &self.queued {
                    Some(queued) if queued != id => {
                        Err(ConnectError::AlreadyConnectedElsewhere { current })
                    }
                    _ => {
                        self.queued = Some(id.clone());
                        Ok(Vec::new())
                    }
                };
            }
            return Ok(Vec::new());
        }

        if self.disconnecting.is_some() || self.queued.as_ref().is_some_and(|q| q != id) {
            return Err(ConnectError::AlreadyConnectedElsewhere { current });
        }

        self.queued = Some(id.clone());
        Ok(self.begin_disconnect(current))
    }

    pub fn disconnect(&mut self, id: &PeripheralId) -> Vec<Effect> {
        if self.queued.as_ref() == Some(id) {
            self.queued = None;
        }
        if self.state.peripheral() != Some(id) || self.disconnecting.as_ref() == Some(id) {
            return Vec::new();
        }
        self.queued = None;
        self.begin_disconnect(id.clone())
    }

    fn begin_connect(&mut self, id: &PeripheralId) -> Vec<Effect> {
        self.attempt += 1;
        self.state = ConnectionState::Connecting(id.clone());
        vec![
            Effect::Notify(BleEvent::Connecting(id.clone())),
            Effect::Transport(TransportCall::Connect {
                id: id.clone(),
                attempt: self.attempt,
            }),
        ]
    }

    fn begin_disconnect(&mut self, id: PeripheralId) -> Vec<Effect> {
        self.disconnecting = Some(id.clone());
        vec![
            Effect::Notify(BleEvent::Disconnecting(id.clone())),
            Effect::Transport(TransportCall::Disconnect { id }),
        ]
    }

    /// Move to idle and, if a connect was queued behind the teardown, start it.
    fn finish_idle(&mut self, id: &PeripheralId) -> Vec<Effect> {
        self.state = ConnectionState::Idle;
        self.attempt += 1;
        self.disconnecting = None;
        let mut effects = vec![Effect::Notify(BleEvent::Disconnected(id.clone()))];
        if let Some(next) = self.queued.take() {
            effects.extend(self.begin_connect(&next));
        }
        effects
    }

    // ------------------------------------------------------------------
    // Transport completions
    // ------------------------------------------------------------------

    pub fn on_connect_succeeded(&mut self, id: &PeripheralId, attempt: u64) -> Vec<Effect> {
        let current_attempt = attempt == self.attempt
            && self.state == ConnectionState::Connecting(id.clone());
        if !current_attempt {
            // A superseded attempt came up anyway; drop the stray link unless
            // it is the peripheral we are currently targeting.
            if self.state.peripheral() != Some(id) {
                return vec![Effect::Transport(TransportCall::Disconnect { id: id.clone() })];
            }
            return Vec::new();
        }
        if self.disconnecting.as_ref() == Some(id) {
            // Cancelled while connecting; the disconnect completion settles it.
            return Vec::new();
        }
        self.state = ConnectionState::Connected(id.clone());
        vec![Effect::Notify(BleEvent::Connected(id.clone()))]
    }

    /// Failure is not distinguished from disconnect at this layer.
    pub fn on_connect_failed(&mut self, id: &PeripheralId, attempt: u64) -> Vec<Effect> {
        if attempt != self.attempt || self.state != ConnectionState::Connecting(id.clone()) {
            return Vec::new();
        }
        self.finish_idle(id)
    }

    /// Completion of a disconnect we requested. Adapter errors are ignored:
    /// disconnection is always honoured locally.
    pub fn on_disconnect_completed(&mut self, id: &PeripheralId) -> Vec<Effect> {
        if self.disconnecting.as_ref() != Some(id) {
            return Vec::new();
        }
        if self.state.peripheral() != Some(id) {
            self.disconnecting = None;
            return Vec::new();
        }
        self.finish_idle(id)
    }

    /// The radio reported the link dropped.
    pub fn on_link_lost(&mut self, id: &PeripheralId) -> Vec<Effect> {
        if self.state.peripheral() != Some(id) {
            return Vec::new();
        }
        self.finish_idle(id)
    }

    pub fn on_adapter_state(&mut self, new_state: AdapterState) -> Vec<Effect> {
        let previous = self.adapter_state;
        self.adapter_state = new_state;
        let mut effects = vec![Effect::Notify(BleEvent::AdapterStateChanged(new_state))];

        match new_state {
            AdapterState::PoweredOff => {
                // The radio is gone, no confirmation will arrive: drop the
                // link locally right away.
                self.queued = None;
                if let Some(id) = self.state.peripheral().cloned() {
                    self.state = ConnectionState::Idle;
                    self.attempt += 1;
                    self.disconnecting = None;
                    effects.push(Effect::Transport(TransportCall::Disconnect { id: id.clone() }));
                    effects.push(Effect::Notify(BleEvent::Disconnected(id)));
                }
                if self.scanning {
                    self.scanning = false;
                    self.was_scanning_before_off = true;
                    effects.push(Effect::Notify(BleEvent::ScanStopped));
                }
            }
            AdapterState::PoweredOn => {
                if previous != AdapterState::PoweredOn && self.was_scanning_before_off {
                    self.was_scanning_before_off = false;
                    effects.extend(self.start_scan());
                }
            }
            AdapterState::Unknown => {}
        }
        effects
    }
}
