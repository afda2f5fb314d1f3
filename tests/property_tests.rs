//! Property tests for the registry, the connection coordinator and the
//! catalog compatibility check.

use bluefruit_connect_lib::advertisement::{
    signal_bucket, AdvertisementData, AdvertisementKey, AdvertisementValue, RSSI_UNAVAILABLE,
};
use bluefruit_connect_lib::catalog::{is_compatible, ReleaseEntry};
use bluefruit_connect_lib::coordinator::{
    BleEvent, ConnectionCoordinator, Effect, TransportCall,
};
use bluefruit_connect_lib::registry::PeripheralRegistry;
use bluefruit_connect_lib::transport::{AdapterState, PeripheralId};
use bluefruit_connect_lib::DeviceInfo;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

// ── Advertisement merge ───────────────────────────────────────

fn arb_advertisement() -> impl Strategy<Value = Vec<(u16, i64)>> {
    proptest::collection::vec((0u16..6, any::<i64>()), 0..6)
}

fn advertisement(fields: &[(u16, i64)]) -> AdvertisementData {
    let mut ad = AdvertisementData::new();
    for (key, value) in fields {
        ad.insert(
            AdvertisementKey::ManufacturerData(*key),
            AdvertisementValue::Integer(*value),
        );
    }
    ad
}

proptest! {
    /// The final field set is the key-wise union of every event, last writer
    /// wins per key, and RSSI reflects the last event.
    #[test]
    fn merge_is_union_last_writer_wins(
        events in proptest::collection::vec((arb_advertisement(), proptest::option::of(-100i16..0)), 1..12),
    ) {
        let mut registry = PeripheralRegistry::new();
        let id = PeripheralId::from("dev");
        let start = Instant::now();
        let mut expected: BTreeMap<u16, i64> = BTreeMap::new();

        for (i, (fields, rssi)) in events.iter().enumerate() {
            for (key, value) in fields {
                expected.insert(*key, *value);
            }
            registry.on_discovered(
                &id,
                None,
                advertisement(fields),
                *rssi,
                start + Duration::from_millis(i as u64),
            );
        }

        let peripheral = registry.get(&id).unwrap();
        prop_assert_eq!(registry.len(), 1);
        prop_assert_eq!(peripheral.advertisement.len(), expected.len());
        for (key, value) in &expected {
            prop_assert_eq!(
                peripheral.advertisement.get(&AdvertisementKey::ManufacturerData(*key)),
                Some(&AdvertisementValue::Integer(*value))
            );
        }
        let (_, last_rssi) = events.last().unwrap();
        prop_assert_eq!(peripheral.rssi, last_rssi.unwrap_or(RSSI_UNAVAILABLE));
        prop_assert_eq!(peripheral.last_seen, start + Duration::from_millis(events.len() as u64 - 1));
    }

    /// Staleness eviction never removes a protected identifier.
    #[test]
    fn eviction_spares_protected(
        ages in proptest::collection::vec(0u64..10_000, 1..16),
        threshold_ms in 0u64..5_000,
        protected_mask in proptest::collection::vec(any::<bool>(), 16),
    ) {
        let mut registry = PeripheralRegistry::new();
        let now = Instant::now() + Duration::from_secs(60);
        let mut protected = Vec::new();
        for (i, age) in ages.iter().enumerate() {
            let id = PeripheralId::new(format!("p{i}"));
            registry.on_discovered(&id, None, AdvertisementData::new(), Some(-50), now - Duration::from_millis(*age));
            if protected_mask[i] {
                protected.push(id);
            }
        }

        let removed = registry.evict_stale(now, Duration::from_millis(threshold_ms), &protected);
        for id in &protected {
            prop_assert!(registry.contains(id));
            prop_assert!(!removed.contains(id));
        }
        for (i, age) in ages.iter().enumerate() {
            let id = PeripheralId::new(format!("p{i}"));
            let stale = *age > threshold_ms && !protected_mask[i];
            prop_assert_eq!(registry.contains(&id), !stale);
        }
    }

    /// A release whose minimum equals the device bootloader (in any case) is compatible.
    #[test]
    fn compatibility_is_reflexive(version in "[0-9a-zA-Z.]{0,8}") {
        let info = DeviceInfo {
            bootloader_version: version.clone(),
            ..DeviceInfo::default()
        };
        let release = ReleaseEntry {
            version: "1.0.0".to_string(),
            is_beta: false,
            min_bootloader_version: version.to_uppercase(),
            board_name: "board".to_string(),
            image_url: "image".to_string(),
            init_url: None,
        };
        prop_assert!(is_compatible(&info, &release));
    }

    #[test]
    fn signal_bucket_is_monotonic(a in -127i16..127, b in -127i16..127) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(signal_bucket(low) <= signal_bucket(high));
        prop_assert!(signal_bucket(high) <= 4);
    }
}

// ── Connection coordinator interleavings ─────────────────────

#[derive(Debug, Clone)]
enum Op {
    Connect(u8),
    Disconnect(u8),
    ConnectSucceeded(usize),
    ConnectFailed(usize),
    DisconnectCompleted(usize),
    LinkLost(u8),
    PowerOff,
    PowerOn,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Connect),
        (0u8..3).prop_map(Op::Disconnect),
        any::<usize>().prop_map(Op::ConnectSucceeded),
        any::<usize>().prop_map(Op::ConnectFailed),
        any::<usize>().prop_map(Op::DisconnectCompleted),
        (0u8..3).prop_map(Op::LinkLost),
        Just(Op::PowerOff),
        Just(Op::PowerOn),
    ]
}

fn peripheral(n: u8) -> PeripheralId {
    PeripheralId::new(format!("p{n}"))
}

/// Plays the transport side: remembers in-flight calls so completions can
/// arrive in any order, including late ones from superseded attempts.
#[derive(Default)]
struct Harness {
    pending_connects: Vec<(PeripheralId, u64)>,
    pending_disconnects: Vec<PeripheralId>,
    /// Active peripheral as seen through the notifications alone.
    observed: Option<PeripheralId>,
}

impl Harness {
    fn absorb(&mut self, effects: Vec<Effect>) -> Result<(), TestCaseError> {
        for effect in effects {
            match effect {
                Effect::Transport(TransportCall::Connect { id, attempt }) => {
                    self.pending_connects.push((id, attempt))
                }
                Effect::Transport(TransportCall::Disconnect { id }) => {
                    self.pending_disconnects.push(id)
                }
                Effect::Transport(_) => {}
                Effect::Notify(BleEvent::Connecting(id)) => {
                    prop_assert!(self.observed.is_none(), "connecting {:?} while {:?} active", id, self.observed);
                    self.observed = Some(id);
                }
                Effect::Notify(BleEvent::Connected(id)) | Effect::Notify(BleEvent::Disconnecting(id)) => {
                    prop_assert_eq!(self.observed.as_ref(), Some(&id));
                }
                Effect::Notify(BleEvent::Disconnected(id)) => {
                    prop_assert_eq!(self.observed.as_ref(), Some(&id));
                    self.observed = None;
                }
                Effect::Notify(_) => {}
            }
        }
        Ok(())
    }
}

fn take<T>(items: &mut Vec<T>, index: usize) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        let i = index % items.len();
        Some(items.remove(i))
    }
}

proptest! {
    /// Under any interleaving of intents and completions the coordinator
    /// never has two peripherals in play, and its notifications tell a
    /// consistent single-connection story.
    #[test]
    fn coordinator_single_active(ops in proptest::collection::vec(arb_op(), 1..60)) {
        let mut c = ConnectionCoordinator::new();
        let mut h = Harness::default();
        h.absorb(c.on_adapter_state(AdapterState::PoweredOn))?;

        for op in ops {
            let effects = match op {
                Op::Connect(n) => c.connect(&peripheral(n)).unwrap_or_default(),
                Op::Disconnect(n) => c.disconnect(&peripheral(n)),
                Op::ConnectSucceeded(i) => match take(&mut h.pending_connects, i) {
                    Some((id, attempt)) => c.on_connect_succeeded(&id, attempt),
                    None => Vec::new(),
                },
                Op::ConnectFailed(i) => match take(&mut h.pending_connects, i) {
                    Some((id, attempt)) => c.on_connect_failed(&id, attempt),
                    None => Vec::new(),
                },
                Op::DisconnectCompleted(i) => match take(&mut h.pending_disconnects, i) {
                    Some(id) => c.on_disconnect_completed(&id),
                    None => Vec::new(),
                },
                Op::LinkLost(n) => c.on_link_lost(&peripheral(n)),
                Op::PowerOff => c.on_adapter_state(AdapterState::PoweredOff),
                Op::PowerOn => c.on_adapter_state(AdapterState::PoweredOn),
            };
            h.absorb(effects)?;
            prop_assert_eq!(c.state().peripheral(), h.observed.as_ref());
        }
    }
}
