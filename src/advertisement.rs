// Advertisement data model
//
// A single advertisement packet may omit data carried by an earlier one
// (scan responses, alternating service lists), so fields are merged per key
// rather than replaced wholesale.

use std::collections::BTreeMap;
use uuid::Uuid;

/// Platform-reserved RSSI value meaning "not available".
pub const RSSI_UNAVAILABLE: i16 = 127;

/// Nordic UART service UUID
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Keys of the free-form advertisement fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdvertisementKey {
    LocalName,
    TxPowerLevel,
    ServiceUuids,
    ServiceData(Uuid),
    ManufacturerData(u16),
    Connectable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementValue {
    Text(String),
    Integer(i64),
    Flag(bool),
    Uuids(Vec<Uuid>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    fields: BTreeMap<AdvertisementKey, AdvertisementValue>,
}

impl AdvertisementData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: AdvertisementKey, value: AdvertisementValue) -> Self {
        self.fields.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: AdvertisementKey, value: AdvertisementValue) {
        self.fields.insert(key, value);
    }

    pub fn get(&self, key: &AdvertisementKey) -> Option<&AdvertisementValue> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AdvertisementKey, &AdvertisementValue)> {
        self.fields.iter()
    }

    /// Merge a newer advertisement into this one. Keys present in `newer`
    /// overwrite, keys absent from it are retained.
    pub fn merge(&mut self, newer: AdvertisementData) {
        for (key, value) in newer.fields {
            self.fields.insert(key, value);
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        match self.fields.get(&AdvertisementKey::LocalName) {
            Some(AdvertisementValue::Text(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn service_uuids(&self) -> &[Uuid] {
        match self.fields.get(&AdvertisementKey::ServiceUuids) {
            Some(AdvertisementValue::Uuids(uuids)) => uuids,
            _ => &[],
        }
    }

    /// True when the service is advertised either in the service list or as
    /// a service-data key.
    pub fn has_service(&self, service: &Uuid) -> bool {
        self.service_uuids().contains(service)
            || self
                .fields
                .contains_key(&AdvertisementKey::ServiceData(*service))
    }
}

/// Map an RSSI reading onto a 0..=4 signal-strength bucket.
/// The unavailable sentinel lands in the lowest bucket.
pub fn signal_bucket(rssi: i16) -> u8 {
    if rssi == RSSI_UNAVAILABLE || rssi <= -84 {
        0
    } else if rssi <= -72 {
        1
    } else if rssi <= -60 {
        2
    } else if rssi <= -48 {
        3
    } else {
        4
    }
}
