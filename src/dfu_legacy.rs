// Nordic legacy DFU
//
// DFU transport for peripherals running the Nordic legacy (SDK 8-era)
// bootloader service. Control point opcodes are written with response and
// answered by notifications on the same characteristic; image bytes go to
// the packet characteristic without response, 20 bytes at a time, with a
// packet receipt notification every `prn_interval` packets.

use crate::ble_adapter::uuid_from_fields;
use crate::dfu::{DfuTransport, TransferProgress};
use crate::error::TransportError;
use crate::firmware::FirmwareImage;
use crate::transport::{PeripheralId, RadioTransport};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

pub const DFU_SERVICE_UUID: Uuid =
    uuid_from_fields(0x00001530, 0x1212, 0xefde, 0x1523, 0x785feabcd123);
const CONTROL_POINT_UUID: Uuid =
    uuid_from_fields(0x00001531, 0x1212, 0xefde, 0x1523, 0x785feabcd123);
const PACKET_UUID: Uuid = uuid_from_fields(0x00001532, 0x1212, 0xefde, 0x1523, 0x785feabcd123);

// Control point opcodes
const OP_START_DFU: u8 = 0x01;
const OP_INIT_PARAMS: u8 = 0x02;
const OP_RECEIVE_IMAGE: u8 = 0x03;
const OP_VALIDATE: u8 = 0x04;
const OP_ACTIVATE_AND_RESET: u8 = 0x05;
const OP_RESET: u8 = 0x06;
const OP_PRN_REQUEST: u8 = 0x08;
const OP_RESPONSE: u8 = 0x10;
const OP_PACKET_RECEIPT: u8 = 0x11;

const INIT_PARAMS_START: u8 = 0x00;
const INIT_PARAMS_COMPLETE: u8 = 0x01;
const IMAGE_TYPE_APPLICATION: u8 = 0x04;
const STATUS_SUCCESS: u8 = 0x01;

const PACKET_SIZE: usize = 20;
const DEFAULT_PRN_INTERVAL: u8 = 10;

fn status_name(status: u8) -> &'static str {
    match status {
        0x02 => "invalid state",
        0x03 => "not supported",
        0x04 => "data size exceeds limit",
        0x05 => "CRC error",
        0x06 => "operation failed",
        _ => "unknown status",
    }
}

fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        OP_START_DFU => "start DFU",
        OP_INIT_PARAMS => "init packet",
        OP_RECEIVE_IMAGE => "image transfer",
        OP_VALIDATE => "validation",
        _ => "request",
    }
}

/// Image sizes as the bootloader expects them: softdevice, bootloader, application.
fn image_sizes_packet(application_len: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12);
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.extend_from_slice(&application_len.to_le_bytes());
    packet
}

type Notifications = BoxStream<'static, Vec<u8>>;

pub struct LegacyDfuTransport {
    radio: Arc<dyn RadioTransport>,
    prn_interval: u8,
    control_point: Mutex<Option<Notifications>>,
}

impl LegacyDfuTransport {
    pub fn new(radio: Arc<dyn RadioTransport>) -> Self {
        Self {
            radio,
            prn_interval: DEFAULT_PRN_INTERVAL,
            control_point: Mutex::new(None),
        }
    }

    pub fn with_prn_interval(mut self, interval: u8) -> Self {
        self.prn_interval = interval.max(1);
        self
    }

    fn take_notifications(&self) -> Result<Notifications, TransportError> {
        self.control_point
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| TransportError::Io("DFU control point not subscribed".to_string()))
    }

    async fn write_control(&self, id: &PeripheralId, data: &[u8]) -> Result<(), TransportError> {
        self.radio
            .write_characteristic(id, DFU_SERVICE_UUID, CONTROL_POINT_UUID, data, true)
            .await
    }

    async fn write_packets(&self, id: &PeripheralId, data: &[u8]) -> Result<(), TransportError> {
        for chunk in data.chunks(PACKET_SIZE) {
            self.radio
                .write_characteristic(id, DFU_SERVICE_UUID, PACKET_UUID, chunk, false)
                .await?;
        }
        Ok(())
    }
}

/// Wait for the response notification to `opcode`.
async fn expect_response(notifications: &mut Notifications, opcode: u8) -> Result<(), TransportError> {
    while let Some(value) = notifications.next().await {
        match value.as_slice() {
            [OP_RESPONSE, op, STATUS_SUCCESS, ..] if *op == opcode => return Ok(()),
            [OP_RESPONSE, op, status, ..] if *op == opcode => {
                return Err(TransportError::Io(format!(
                    "DFU {} rejected: {}",
                    opcode_name(opcode),
                    status_name(*status)
                )));
            }
            [OP_PACKET_RECEIPT, ..] => continue,
            other => tracing::debug!("[dfu_legacy] Ignoring notification {}", hex::encode(other)),
        }
    }
    Err(TransportError::Io("DFU control point closed".to_string()))
}

/// Wait for the next packet receipt notification; returns the bytes received.
async fn expect_receipt(notifications: &mut Notifications) -> Result<u32, TransportError> {
    while let Some(value) = notifications.next().await {
        match value.as_slice() {
            [OP_PACKET_RECEIPT, a, b, c, d, ..] => return Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            [OP_RESPONSE, OP_RECEIVE_IMAGE, status, ..] => {
                return Err(TransportError::Io(format!(
                    "DFU image transfer rejected: {}",
                    status_name(*status)
                )));
            }
            other => tracing::debug!("[dfu_legacy] Ignoring notification {}", hex::encode(other)),
        }
    }
    Err(TransportError::Io("DFU control point closed".to_string()))
}

#[async_trait]
impl DfuTransport for LegacyDfuTransport {
    async fn has_dfu_service(&self, id: &PeripheralId) -> Result<bool, TransportError> {
        let services = self.radio.discover_services(id, &[DFU_SERVICE_UUID]).await?;
        Ok(services.contains(&DFU_SERVICE_UUID))
    }

    async fn claim(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let notifications = self
            .radio
            .subscribe_to_characteristic(id, DFU_SERVICE_UUID, CONTROL_POINT_UUID)
            .await?;
        if let Ok(mut slot) = self.control_point.lock() {
            *slot = Some(notifications);
        }
        tracing::info!("[dfu_legacy] Control point subscribed on {}", id);
        Ok(())
    }

    async fn transfer(
        &self,
        id: &PeripheralId,
        image: &FirmwareImage,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<(), TransportError> {
        let mut notifications = self.take_notifications()?;
        let total = image.len();
        let total_u32 = u32::try_from(total)
            .map_err(|_| TransportError::Io("Firmware image too large".to_string()))?;

        let _ = progress.send(TransferProgress::new(0.0, "Starting DFU"));
        self.write_control(id, &[OP_START_DFU, IMAGE_TYPE_APPLICATION]).await?;
        self.write_packets(id, &image_sizes_packet(total_u32)).await?;
        expect_response(&mut notifications, OP_START_DFU).await?;

        if let Some(init) = &image.init_data {
            self.write_control(id, &[OP_INIT_PARAMS, INIT_PARAMS_START]).await?;
            self.write_packets(id, init).await?;
            self.write_control(id, &[OP_INIT_PARAMS, INIT_PARAMS_COMPLETE]).await?;
            expect_response(&mut notifications, OP_INIT_PARAMS).await?;
        }

        self.write_control(id, &[OP_PRN_REQUEST, self.prn_interval]).await?;
        self.write_control(id, &[OP_RECEIVE_IMAGE]).await?;

        let interval = self.prn_interval as usize;
        let mut sent = 0usize;
        for (index, chunk) in image.data.chunks(PACKET_SIZE).enumerate() {
            self.radio
                .write_characteristic(id, DFU_SERVICE_UUID, PACKET_UUID, chunk, false)
                .await?;
            sent += chunk.len();
            if (index + 1) % interval == 0 && sent < total {
                let acknowledged = expect_receipt(&mut notifications).await? as usize;
                let _ = progress.send(TransferProgress::new(
                    acknowledged as f64 / total as f64,
                    "Uploading firmware",
                ));
            }
        }
        expect_response(&mut notifications, OP_RECEIVE_IMAGE).await?;
        tracing::info!("[dfu_legacy] Image transferred to {} ({} bytes)", id, total);

        let _ = progress.send(TransferProgress::new(1.0, "Verifying"));
        self.write_control(id, &[OP_VALIDATE]).await?;
        expect_response(&mut notifications, OP_VALIDATE).await?;
        Ok(())
    }

    async fn await_activation(&self, id: &PeripheralId) -> Result<(), TransportError> {
        // The bootloader resets straight away, so the write may not be
        // acknowledged.
        match self.write_control(id, &[OP_ACTIVATE_AND_RESET]).await {
            Ok(()) => {}
            Err(e) => tracing::info!("[dfu_legacy] No response to activate (device likely rebooted): {}", e),
        }
        tracing::info!("[dfu_legacy] Activate and reset sent to {}", id);
        Ok(())
    }

    async fn abort(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.write_control(id, &[OP_RESET]).await
    }

    fn restore_default_owner(&self) {
        if let Ok(mut slot) = self.control_point.lock() {
            *slot = None;
        }
    }
}
