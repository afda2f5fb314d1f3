// UART over GATT
//
// Nordic UART service: TX is written without response, RX notifies. Writes
// are refused while a firmware update holds the transport.

use crate::ble_adapter::uuid_from_fields;
use crate::error::TransportError;
use crate::transport::{PeripheralId, RadioTransport, TransportGate};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub use crate::advertisement::UART_SERVICE_UUID;
pub const UART_TX_UUID: Uuid = uuid_from_fields(0x6e400002, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);
pub const UART_RX_UUID: Uuid = uuid_from_fields(0x6e400003, 0xb5a3, 0xf393, 0xe0a9, 0xe50e24dcca9e);

/// Default ATT payload without MTU negotiation.
const MAX_WRITE_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UartDirection {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UartPacket {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub direction: UartDirection,
    pub data: Vec<u8>,
}

impl UartPacket {
    pub fn new(direction: UartDirection, data: Vec<u8>) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            direction,
            data,
        }
    }

    /// Render for display or export using the two UART preferences.
    pub fn render(&self, hex_mode: bool, display_timestamp: bool) -> String {
        let body = if hex_mode {
            hex::encode_upper(&self.data)
        } else {
            String::from_utf8_lossy(&self.data).into_owned()
        };
        if !display_timestamp {
            return body;
        }
        let stamp = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.timestamp_ms)
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S%.3f").to_string())
            .unwrap_or_default();
        format!("{stamp} {body}")
    }
}

pub struct UartChannel {
    radio: Arc<dyn RadioTransport>,
    gate: TransportGate,
    id: PeripheralId,
    hex_mode: bool,
}

impl UartChannel {
    /// Subscribe to RX on a connected peripheral. The returned stream yields
    /// every received packet.
    pub async fn open(
        radio: Arc<dyn RadioTransport>,
        gate: TransportGate,
        id: PeripheralId,
        hex_mode: bool,
    ) -> Result<(Self, BoxStream<'static, UartPacket>), TransportError> {
        let services = radio.discover_services(&id, &[UART_SERVICE_UUID]).await?;
        if !services.contains(&UART_SERVICE_UUID) {
            return Err(TransportError::ServiceNotFound(UART_SERVICE_UUID));
        }
        let rx = radio
            .subscribe_to_characteristic(&id, UART_SERVICE_UUID, UART_RX_UUID)
            .await?;
        tracing::info!("[uart] RX subscribed on {}", id);

        let packets = rx
            .map(move |data| {
                log_traffic(UartDirection::Received, &data, hex_mode);
                UartPacket::new(UartDirection::Received, data)
            })
            .boxed();

        Ok((
            Self {
                radio,
                gate,
                id,
                hex_mode,
            },
            packets,
        ))
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.id
    }

    pub async fn send(&self, data: &[u8]) -> Result<UartPacket, TransportError> {
        for chunk in data.chunks(MAX_WRITE_LEN) {
            // Checked per write so an update started mid-message is not interleaved.
            if self.gate.is_claimed(&self.id) {
                return Err(TransportError::Busy);
            }
            self.radio
                .write_characteristic(&self.id, UART_SERVICE_UUID, UART_TX_UUID, chunk, false)
                .await?;
        }
        log_traffic(UartDirection::Sent, data, self.hex_mode);
        Ok(UartPacket::new(UartDirection::Sent, data.to_vec()))
    }
}

fn log_traffic(direction: UartDirection, data: &[u8], hex_mode: bool) {
    if hex_mode {
        tracing::debug!("[uart] {:?} {}", direction, hex::encode_upper(data));
    } else {
        tracing::debug!("[uart] {:?} {:?}", direction, String::from_utf8_lossy(data));
    }
}
