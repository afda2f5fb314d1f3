// Radio transport capability
//
// The core never talks to a BLE stack directly. It consumes this capability
// set, whose operations are all asynchronous. Unsolicited radio activity
// (advertisements, adapter power changes, dropped links) arrives on the
// event stream returned by `events()`, which may be driven from a
// platform-owned thread; the manager marshals it onto its own task before
// touching any state.

use crate::advertisement::AdvertisementData;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Stable, platform-assigned peripheral identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeripheralId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// Unsolicited activity reported by the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Discovered {
        id: PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
    },
    AdapterStateChanged(AdapterState),
    /// The link dropped without a disconnect request from us.
    LinkLost(PeripheralId),
}

#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Stream of unsolicited radio events. Called once by the manager.
    async fn events(&self) -> Result<BoxStream<'static, RadioEvent>, TransportError>;

    async fn start_scan(&self) -> Result<(), TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError>;
    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Discover services and return the UUIDs found. An empty filter means all.
    async fn discover_services(
        &self,
        id: &PeripheralId,
        filter: &[Uuid],
    ) -> Result<Vec<Uuid>, TransportError>;

    async fn read_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe to notifications; the stream yields each notified value.
    async fn subscribe_to_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;
}

/// Exclusive claim over a peripheral's transport.
///
/// The DFU orchestrator holds the claim during transferring and finalizing;
/// ordinary UART traffic checks it before every write.
#[derive(Clone, Default)]
pub struct TransportGate {
    holder: Arc<Mutex<Option<PeripheralId>>>,
}

impl TransportGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let mut holder = self
            .holder
            .lock()
            .map_err(|_| TransportError::Io("Transport gate poisoned".to_string()))?;
        match holder.as_ref() {
            Some(_) => Err(TransportError::Busy),
            None => {
                *holder = Some(id.clone());
                Ok(())
            }
        }
    }

    pub fn release(&self) {
        if let Ok(mut holder) = self.holder.lock() {
            *holder = None;
        }
    }

    pub fn is_claimed(&self, id: &PeripheralId) -> bool {
        self.holder
            .lock()
            .map(|holder| holder.as_ref() == Some(id))
            .unwrap_or(true)
    }
}
