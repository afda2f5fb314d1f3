// Device information
//
// Firmware and hardware identity of a connected peripheral, read from the
// standard Device Information Service. One snapshot per connection session.

use crate::error::TransportError;
use crate::transport::{PeripheralId, RadioTransport};
use serde::Serialize;
use uuid::Uuid;

/// Bootloader version reported when the firmware revision carries none.
pub const DEFAULT_BOOTLOADER_VERSION: &str = "0.0";

pub const DEVICE_INFO_SERVICE_UUID: Uuid = short_uuid(0x180A);
pub const MODEL_NUMBER_UUID: Uuid = short_uuid(0x2A24);
pub const FIRMWARE_REVISION_UUID: Uuid = short_uuid(0x2A26);
pub const HARDWARE_REVISION_UUID: Uuid = short_uuid(0x2A27);
pub const SOFTWARE_REVISION_UUID: Uuid = short_uuid(0x2A28);
pub const MANUFACTURER_NAME_UUID: Uuid = short_uuid(0x2A29);

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub hardware_revision: Option<String>,
    /// Raw firmware revision, e.g. `"S110 8.0.0, 0.2"`.
    pub firmware_revision: Option<String>,
    pub software_revision: Option<String>,
    pub bootloader_version: String,
}

impl DeviceInfo {
    pub fn new(
        model_number: Option<String>,
        firmware_revision: Option<String>,
        software_revision: Option<String>,
    ) -> Self {
        let bootloader_version = bootloader_from_firmware_revision(firmware_revision.as_deref());
        Self {
            manufacturer: None,
            model_number,
            hardware_revision: None,
            firmware_revision,
            software_revision,
            bootloader_version,
        }
    }

    pub fn has_default_bootloader_version(&self) -> bool {
        self.bootloader_version == DEFAULT_BOOTLOADER_VERSION
    }
}

/// The bootloader version follows `", "` in the firmware revision string.
fn bootloader_from_firmware_revision(firmware_revision: Option<&str>) -> String {
    firmware_revision
        .and_then(|rev| rev.split_once(", "))
        .map(|(_, version)| version.trim())
        .filter(|version| is_valid_version(version))
        .unwrap_or(DEFAULT_BOOTLOADER_VERSION)
        .to_string()
}

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Read the Device Information Service of a connected peripheral.
/// Characteristics the device does not expose are left as `None`.
pub async fn read_device_info(
    transport: &dyn RadioTransport,
    id: &PeripheralId,
) -> Result<DeviceInfo, TransportError> {
    let services = transport
        .discover_services(id, &[DEVICE_INFO_SERVICE_UUID])
        .await?;
    if !services.contains(&DEVICE_INFO_SERVICE_UUID) {
        return Err(TransportError::ServiceNotFound(DEVICE_INFO_SERVICE_UUID));
    }

    let mut info = DeviceInfo::new(
        read_string(transport, id, MODEL_NUMBER_UUID).await,
        read_string(transport, id, FIRMWARE_REVISION_UUID).await,
        read_string(transport, id, SOFTWARE_REVISION_UUID).await,
    );
    info.manufacturer = read_string(transport, id, MANUFACTURER_NAME_UUID).await;
    info.hardware_revision = read_string(transport, id, HARDWARE_REVISION_UUID).await;

    tracing::info!(
        "[device_info] {}: model={:?} software={:?} bootloader={}",
        id,
        info.model_number,
        info.software_revision,
        info.bootloader_version
    );
    Ok(info)
}

async fn read_string(
    transport: &dyn RadioTransport,
    id: &PeripheralId,
    characteristic: Uuid,
) -> Option<String> {
    match transport
        .read_characteristic(id, DEVICE_INFO_SERVICE_UUID, characteristic)
        .await
    {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            tracing::debug!("[device_info] {} not readable on {}: {}", characteristic, id, e);
            None
        }
    }
}
