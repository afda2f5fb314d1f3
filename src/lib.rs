// Bluefruit Connect core
//
// Peripheral discovery and connection management plus DFU firmware updates
// for Bluefruit LE peripherals. UI layers drive it through `BleHandle` and
// `DfuOrchestrator` and subscribe to their event channels.

pub mod advertisement;
pub mod ble_adapter;
pub mod catalog;
pub mod coordinator;
pub mod device_info;
pub mod dfu;
pub mod dfu_legacy;
pub mod error;
pub mod firmware;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod settings;
pub mod transport;
pub mod uart;

pub use catalog::{CatalogResolver, HttpCatalogSource, ReleaseEntry, UpdateCheck};
pub use coordinator::{BleEvent, ConnectionState};
pub use device_info::{read_device_info, DeviceInfo};
pub use dfu::{DfuOrchestrator, DfuPhase, DfuSnapshot, DfuTransport};
pub use error::{ConnectError, DfuError, TransportError};
pub use firmware::{DefaultImageLoader, FirmwareSource};
pub use manager::{BleHandle, BleManager};
pub use settings::AppSettings;
pub use transport::{PeripheralId, RadioTransport, TransportGate};
