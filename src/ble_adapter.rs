// btleplug radio transport
//
// Implements the radio transport capability over the platform BLE stack.
// btleplug delivers central events on its own stream; they are converted to
// `RadioEvent`s on a forwarding task so the manager only ever sees domain
// types.

use crate::advertisement::{AdvertisementData, AdvertisementKey, AdvertisementValue};
use crate::error::TransportError;
use crate::transport::{AdapterState, PeripheralId, RadioEvent, RadioTransport};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

/// Build a 128-bit UUID from its five dash-separated groups.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

pub struct BtleplugTransport {
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first BLE adapter on the system.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(format!("BLE manager init failed: {e}")))?;
        let adapters = manager.adapters().await.map_err(|e| {
            TransportError::AdapterUnavailable(format!("Failed to list BLE adapters: {e}"))
        })?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("No BLE adapter found".to_string()))?;
        match adapter.adapter_info().await {
            Ok(info) => tracing::info!("[ble] Using adapter {}", info),
            Err(e) => tracing::debug!("[ble] Adapter info unavailable: {}", e),
        }
        Ok(Self {
            _manager: manager,
            adapter,
        })
    }

    /// Look a peripheral up by its platform id string.
    pub async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        let peripherals = self.adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| TransportError::NotFound(id.clone()))
    }

    /// Find a characteristic on a peripheral whose services are discovered.
    pub fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, TransportError> {
        if !peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(TransportError::ServiceNotFound(service));
        }
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    /// Discover services unless the platform already has them cached.
    async fn ensure_services(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        if peripheral.services().is_empty() {
            peripheral.discover_services().await?;
        }
        Ok(())
    }
}

fn advertisement_from_properties(props: &PeripheralProperties) -> AdvertisementData {
    let mut ad = AdvertisementData::new();
    if let Some(name) = &props.local_name {
        ad.insert(AdvertisementKey::LocalName, AdvertisementValue::Text(name.clone()));
    }
    if let Some(tx_power) = props.tx_power_level {
        ad.insert(
            AdvertisementKey::TxPowerLevel,
            AdvertisementValue::Integer(tx_power as i64),
        );
    }
    if !props.services.is_empty() {
        ad.insert(
            AdvertisementKey::ServiceUuids,
            AdvertisementValue::Uuids(props.services.clone()),
        );
    }
    for (uuid, data) in &props.service_data {
        ad.insert(
            AdvertisementKey::ServiceData(*uuid),
            AdvertisementValue::Bytes(data.clone()),
        );
    }
    for (company, data) in &props.manufacturer_data {
        ad.insert(
            AdvertisementKey::ManufacturerData(*company),
            AdvertisementValue::Bytes(data.clone()),
        );
    }
    ad
}

fn adapter_state_from(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        CentralState::Unknown => AdapterState::Unknown,
    }
}

async fn discovered_event(adapter: &Adapter, id: &btleplug::platform::PeripheralId) -> Option<RadioEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok().flatten()?;
    Some(RadioEvent::Discovered {
        id: PeripheralId::new(id.to_string()),
        name: props.local_name.clone(),
        advertisement: advertisement_from_properties(&props),
        rssi: props.rssi,
    })
}

#[async_trait]
impl RadioTransport for BtleplugTransport {
    async fn events(&self) -> Result<BoxStream<'static, RadioEvent>, TransportError> {
        let mut central_events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();

        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let radio_event = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        discovered_event(&adapter, &id).await
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(RadioEvent::LinkLost(PeripheralId::new(id.to_string())))
                    }
                    CentralEvent::StateUpdate(state) => {
                        Some(RadioEvent::AdapterStateChanged(adapter_state_from(state)))
                    }
                    _ => None,
                };
                if let Some(radio_event) = radio_event {
                    if tx.unbounded_send(radio_event).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("[ble] Central event stream ended");
        });

        Ok(rx.boxed())
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        // No service filter: some stacks only match UUIDs in the primary
        // advertisement, not the scan response.
        self.adapter.start_scan(ScanFilter::default()).await?;
        tracing::info!("[ble] Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        tracing::info!("[ble] Scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        tracing::info!("[ble] Connecting to {}...", id);
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await.unwrap_or(true) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        id: &PeripheralId,
        filter: &[Uuid],
    ) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|s| s.uuid)
            .filter(|uuid| filter.is_empty() || filter.contains(uuid))
            .collect())
    }

    async fn read_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        self.ensure_services(&peripheral).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        self.ensure_services(&peripheral).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn subscribe_to_characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        self.ensure_services(&peripheral).await?;
        let characteristic = Self::find_characteristic(&peripheral, service, characteristic)?;
        peripheral.subscribe(&characteristic).await?;
        let uuid = characteristic.uuid;
        let notifications = peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == uuid).then_some(n.value) })
            .boxed())
    }
}
