// Error taxonomy
//
// Transport errors come up from the radio and DFU transports, precondition
// errors are raised before any transport I/O, and catalog errors are
// swallowed at the resolver boundary (they degrade to "no releases known").

use crate::transport::PeripheralId;
use thiserror::Error;

/// Failure reported by a radio or DFU transport operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Peripheral '{0}' not found")]
    NotFound(PeripheralId),
    #[error("Service {0} not found on device")]
    ServiceNotFound(uuid::Uuid),
    #[error("Characteristic {0} not found on device")]
    CharacteristicNotFound(uuid::Uuid),
    #[error("Transport is claimed by a firmware update")]
    Busy,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{0}")]
    Io(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::TimedOut(_) => TransportError::Timeout("BLE operation"),
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// Connection request failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Another connection to '{current}' is still being set up or torn down")]
    AlreadyConnectedElsewhere { current: PeripheralId },
    #[error("Bluetooth is powered off")]
    AdapterPoweredOff,
    #[error("Failed to connect to '{0}'")]
    Failed(PeripheralId),
    #[error("BLE manager is not running")]
    ManagerStopped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("Failed to start scan: {0}")]
    Transport(#[from] TransportError),
    #[error("BLE manager is not running")]
    ManagerStopped,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("No update server configured")]
    NotConfigured,
    #[error("Failed to fetch release catalog: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Update server returned status: {0}")]
    Status(reqwest::StatusCode),
    #[error("Malformed release catalog: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Failed to read firmware file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to download {url}: {message}")]
    Download { url: String, message: String },
    #[error("Invalid Intel HEX image: {0}")]
    InvalidHex(String),
    #[error("Firmware image is empty")]
    Empty,
}

/// Why a bootloader blocks an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootloaderIssue {
    /// Factory default bootloader that cannot be updated through this path.
    Legacy,
    /// The release requires a newer bootloader.
    BelowMinimum { required: String, found: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DfuError {
    #[error("A firmware update is already in progress")]
    UpdateAlreadyInProgress,
    #[error("No peripheral connected. Abort update")]
    NotConnected,
    #[error("{}", incompatible_message(.0))]
    IncompatibleBootloader(BootloaderIssue),
    #[error("Firmware image unavailable: {0}")]
    MissingFirmwareImage(String),
    #[error("No DFU Service found on device")]
    DfuServiceNotFound,
    #[error("Firmware update failed: {0}")]
    Transport(#[from] TransportError),
}

fn incompatible_message(issue: &BootloaderIssue) -> String {
    match issue {
        BootloaderIssue::Legacy => {
            "The legacy bootloader on this device is not compatible with this application"
                .to_string()
        }
        BootloaderIssue::BelowMinimum { .. } => {
            "This firmware update is not compatible with your bootloader".to_string()
        }
    }
}

impl DfuError {
    /// Split into the user-facing message and an optional diagnostic detail.
    /// The two are kept apart so the UI can render them separately.
    pub fn user_message(&self) -> (String, Option<String>) {
        match self {
            DfuError::IncompatibleBootloader(BootloaderIssue::BelowMinimum { required, found }) => (
                self.to_string(),
                Some(format!(
                    "Bootloader {found} found, version {required} or later is required"
                )),
            ),
            DfuError::MissingFirmwareImage(detail) => (
                "Firmware image unavailable".to_string(),
                Some(detail.clone()),
            ),
            DfuError::Transport(e) => ("Firmware update failed".to_string(), Some(e.to_string())),
            other => (other.to_string(), None),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("No config directory available on this platform")]
    NoConfigDir,
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_keeps_detail_separate() {
        let err = DfuError::IncompatibleBootloader(BootloaderIssue::BelowMinimum {
            required: "0.3".to_string(),
            found: "0.2".to_string(),
        });
        let (message, detail) = err.user_message();
        assert!(!message.contains("0.3"));
        assert_eq!(
            detail.as_deref(),
            Some("Bootloader 0.2 found, version 0.3 or later is required")
        );
    }

    #[test]
    fn test_legacy_message() {
        let (message, detail) =
            DfuError::IncompatibleBootloader(BootloaderIssue::Legacy).user_message();
        assert!(message.contains("legacy bootloader"));
        assert!(detail.is_none());
    }

    #[test]
    fn test_transport_error_detail() {
        let err = DfuError::from(TransportError::Timeout("Activation"));
        let (message, detail) = err.user_message();
        assert_eq!(message, "Firmware update failed");
        assert_eq!(detail.as_deref(), Some("Activation timed out"));
    }
}
