// Peripheral registry
//
// Tracks every peripheral seen during a scanning session, one entry per
// identifier. Pure bookkeeping: the manager feeds it discovery events and
// turns the returned changes into notifications.

use crate::advertisement::{self, AdvertisementData, RSSI_UNAVAILABLE, UART_SERVICE_UUID};
use crate::transport::PeripheralId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Peripheral {
    id: PeripheralId,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertisement: AdvertisementData,
    pub last_seen: Instant,
}

impl Peripheral {
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.advertisement.local_name())
            .unwrap_or("<Unknown>")
    }

    pub fn is_uart_capable(&self) -> bool {
        has_service(self, &UART_SERVICE_UUID)
    }

    pub fn signal_bucket(&self) -> u8 {
        advertisement::signal_bucket(self.rssi)
    }

    pub fn summary(&self) -> PeripheralSummary {
        PeripheralSummary {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            rssi: self.rssi,
            signal_bucket: self.signal_bucket(),
            uart_capable: self.is_uart_capable(),
            services: self.advertisement.service_uuids().to_vec(),
        }
    }
}

/// Serializable view of a peripheral for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralSummary {
    pub id: PeripheralId,
    pub name: String,
    pub rssi: i16,
    pub signal_bucket: u8,
    pub uart_capable: bool,
    pub services: Vec<Uuid>,
}

/// Advertised-capability test. Pure function over advertisement data.
pub fn has_service(peripheral: &Peripheral, service: &Uuid) -> bool {
    peripheral.advertisement.has_service(service)
}

#[derive(Debug, Default)]
pub struct PeripheralRegistry {
    peripherals: HashMap<PeripheralId, Peripheral>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    /// Apply a discovery event. Returns true if the identifier was new.
    pub fn on_discovered(
        &mut self,
        id: &PeripheralId,
        name: Option<String>,
        advertisement: AdvertisementData,
        rssi: Option<i16>,
        now: Instant,
    ) -> bool {
        let rssi = rssi.unwrap_or(RSSI_UNAVAILABLE);
        match self.peripherals.get_mut(id) {
            Some(existing) => {
                existing.rssi = rssi;
                existing.last_seen = now;
                if name.is_some() {
                    existing.name = name;
                }
                existing.advertisement.merge(advertisement);
                false
            }
            None => {
                self.peripherals.insert(
                    id.clone(),
                    Peripheral {
                        id: id.clone(),
                        name,
                        rssi,
                        advertisement,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Remove every entry not seen within `threshold`, except `protected`.
    /// Returns the removed identifiers.
    pub fn evict_stale(
        &mut self,
        now: Instant,
        threshold: Duration,
        protected: &[PeripheralId],
    ) -> Vec<PeripheralId> {
        let mut removed: Vec<PeripheralId> = self
            .peripherals
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > threshold)
            .filter(|p| !protected.contains(&p.id))
            .map(|p| p.id.clone())
            .collect();
        removed.sort();
        for id in &removed {
            self.peripherals.remove(id);
        }
        removed
    }

    /// Clear everything except `keep`. Returns the removed identifiers.
    pub fn refresh(&mut self, keep: &[PeripheralId]) -> Vec<PeripheralId> {
        let mut removed: Vec<PeripheralId> = self
            .peripherals
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        removed.sort();
        for id in &removed {
            self.peripherals.remove(id);
        }
        removed
    }

    /// Identifiers ordered by display name, ties broken by identifier.
    pub fn sorted_by_name(&self) -> Vec<PeripheralId> {
        let mut entries: Vec<&Peripheral> = self.peripherals.values().collect();
        entries.sort_by(|a, b| {
            a.display_name()
                .cmp(b.display_name())
                .then_with(|| a.id.cmp(&b.id))
        });
        entries.into_iter().map(|p| p.id.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<PeripheralSummary> {
        self.sorted_by_name()
            .iter()
            .filter_map(|id| self.peripherals.get(id))
            .map(Peripheral::summary)
            .collect()
    }
}
