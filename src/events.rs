// Event bus
//
// Ordered, one-directional notifications from sessions and the OTA engine to
// consumers. Every subscriber gets its own unbounded channel, so a slow
// consumer never blocks the session task that emits. Subscribers may filter
// on a device address; session teardown drops those per-device observers.

use crate::firmware::FirmwareCatalogEntry;
use crate::types::{BusMode, ConnectionState, OtaFailureReason, OtaStatus, OtaStep, PartId};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BgxEvent {
    ScanDeviceDiscovered {
        address: String,
        name: String,
        rssi: Option<i16>,
    },
    ScanModeChanged {
        is_scanning: bool,
        failed: bool,
        error_code: Option<i32>,
    },
    ConnectionStatusChanged {
        address: String,
        state: ConnectionState,
    },
    ConnectionError {
        address: String,
        status_code: i32,
    },
    BondFailed {
        address: String,
    },
    InvalidGattHandles {
        address: String,
        name: String,
    },
    BusModeChanged {
        address: String,
        mode: BusMode,
    },
    BusModeErrorPasswordRequired {
        address: String,
    },
    DataReceived {
        address: String,
        bytes: Vec<u8>,
    },
    DeviceInfo {
        address: String,
        device_uuid: String,
        part_id: PartId,
        part_identifier: String,
        firmware_revision: String,
        bootloader_version: Option<String>,
        platform: String,
    },
    MtuChanged {
        address: String,
        mtu: u16,
    },
    FirmwareVersionsAvailable {
        part_identifier: String,
        catalog: Vec<FirmwareCatalogEntry>,
    },
    CatalogError {
        part_identifier: String,
        message: String,
    },
    OtaStatus {
        address: String,
        status: OtaStatus,
        bytes_sent: Option<u32>,
        failure: Option<OtaFailureReason>,
        /// Step the transfer was in when it failed or was refused.
        step: Option<OtaStep>,
    },
    OtaProgress {
        address: String,
        bytes_sent: u32,
        total_bytes: u32,
    },
    /// A command was refused or its transport operation failed. Outcomes
    /// reported by their own events (connect, OTA, catalog) never land here.
    CommandRejected {
        address: Option<String>,
        command: String,
        reason: String,
    },
}

impl BgxEvent {
    /// Device the event concerns, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            BgxEvent::ScanDeviceDiscovered { address, .. }
            | BgxEvent::ConnectionStatusChanged { address, .. }
            | BgxEvent::ConnectionError { address, .. }
            | BgxEvent::BondFailed { address }
            | BgxEvent::InvalidGattHandles { address, .. }
            | BgxEvent::BusModeChanged { address, .. }
            | BgxEvent::BusModeErrorPasswordRequired { address }
            | BgxEvent::DataReceived { address, .. }
            | BgxEvent::DeviceInfo { address, .. }
            | BgxEvent::MtuChanged { address, .. }
            | BgxEvent::OtaStatus { address, .. }
            | BgxEvent::OtaProgress { address, .. } => Some(address),
            BgxEvent::CommandRejected { address, .. } => address.as_deref(),
            BgxEvent::ScanModeChanged { .. }
            | BgxEvent::FirmwareVersionsAvailable { .. }
            | BgxEvent::CatalogError { .. } => None,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: Option<String>,
    tx: mpsc::UnboundedSender<BgxEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Cloneable handle to the shared subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(&self) -> Subscription {
        self.add(None)
    }

    /// Receive only events for `address`.
    pub fn subscribe_device(&self, address: &str) -> Subscription {
        self.add(Some(address.to_string()))
    }

    fn add(&self, filter: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, filter, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn emit(&self, event: BgxEvent) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Closed receivers are pruned here as well as on drop
        inner.subscribers.retain(|sub| {
            let wanted = match (&sub.filter, event.address()) {
                (None, _) => true,
                (Some(f), Some(addr)) => f == addr,
                (Some(_), None) => false,
            };
            if !wanted {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Drop every observer filtered on `address`. Called on session teardown.
    pub fn unsubscribe_device(&self, address: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .subscribers
                .retain(|sub| sub.filter.as_deref() != Some(address));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().map(|i| i.subscribers.len()).unwrap_or(0)
    }
}

/// Receiving end of a subscription. Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BgxEvent>,
    bus: std::sync::Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Next event, or `None` once the subscription has been torn down.
    pub async fn recv(&mut self) -> Option<BgxEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BgxEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.subscribers.retain(|sub| sub.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(address: &str, byte: u8) -> BgxEvent {
        BgxEvent::DataReceived {
            address: address.to_string(),
            bytes: vec![byte],
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(data("A", i));
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(data("A", i)));
        }
    }

    #[tokio::test]
    async fn test_device_filter() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_device("A");
        bus.emit(data("B", 1));
        bus.emit(BgxEvent::ScanModeChanged { is_scanning: true, failed: false, error_code: None });
        bus.emit(data("A", 2));
        assert_eq!(a.recv().await, Some(data("A", 2)));
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn test_drop_unregisters() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let _other = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_device_closes_stream() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_device("A");
        let _all = bus.subscribe();
        bus.unsubscribe_device("A");
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.recv().await, None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(BgxEvent::BondFailed { address: "A".into() }).unwrap();
        assert_eq!(json["type"], "bond_failed");
        assert_eq!(json["address"], "A");
    }
}
