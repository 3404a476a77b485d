// Transport port
//
// The session core drives the radio through these traits and never touches
// a BLE stack directly. `ble` provides the btleplug implementation; tests use
// the scripted `mock` transport below.

use crate::types::AckMode;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bond/pairing failure. Terminal for the current attempt.
pub const CODE_BOND_FAILED: i32 = 137;
/// Transient pairing state; the connect should simply be re-issued.
pub const CODE_RETRY: i32 = 133;
/// Peripheral could not be found by the central.
pub const CODE_NOT_FOUND: i32 = -1;
/// Operation did not complete within its timer.
pub const CODE_TIMEOUT: i32 = -2;
/// Characteristic or service missing from the GATT table.
pub const CODE_NO_CHARACTERISTIC: i32 = -3;
/// Operation the platform stack cannot perform.
pub const CODE_UNSUPPORTED: i32 = -4;
/// Any other stack error without a numeric status.
pub const CODE_GENERIC: i32 = -5;

// ATT error codes that mean "the peripheral wants credentials"
const ATT_WRITE_NOT_PERMITTED: i32 = 0x03;
const ATT_INSUFFICIENT_AUTHENTICATION: i32 = 0x05;
const ATT_INSUFFICIENT_AUTHORIZATION: i32 = 0x08;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_bond_failure(&self) -> bool {
        self.code == CODE_BOND_FAILED
    }

    pub fn is_retryable(&self) -> bool {
        self.code == CODE_RETRY
    }

    pub fn is_not_found(&self) -> bool {
        self.code == CODE_NOT_FOUND
    }

    pub fn is_password_rejection(&self) -> bool {
        matches!(
            self.code,
            ATT_WRITE_NOT_PERMITTED | ATT_INSUFFICIENT_AUTHENTICATION | ATT_INSUFFICIENT_AUTHORIZATION
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.code)
    }
}

impl std::error::Error for TransportError {}

/// Characteristics the session core uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BgxCharacteristic {
    /// Host to peripheral serial data.
    Rx,
    /// Peripheral to host serial data (notify).
    Tx,
    /// Bus mode (read/write/notify).
    Mode,
    OtaControl,
    OtaData,
    OtaDeviceId,
    FirmwareRevision,
}

/// Result of service discovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GattProfile {
    pub has_stream_service: bool,
    pub has_ota_service: bool,
    pub has_device_info: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Notify {
        characteristic: BgxCharacteristic,
        value: Vec<u8>,
    },
    Disconnected {
        status: i32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// One peripheral link. Completions arrive as awaited results; unsolicited
/// notifications and link loss arrive on the `events` channel.
#[async_trait]
pub trait BgxTransport: Send + Sync {
    fn address(&self) -> String;
    fn name(&self) -> String;

    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    async fn discover_services(&self) -> Result<GattProfile, TransportError>;
    async fn read(&self, characteristic: BgxCharacteristic) -> Result<Vec<u8>, TransportError>;
    async fn write(
        &self,
        characteristic: BgxCharacteristic,
        data: &[u8],
        ack: AckMode,
    ) -> Result<(), TransportError>;
    async fn subscribe(&self, characteristic: BgxCharacteristic) -> Result<(), TransportError>;

    /// Fresh event channel for the current link. Call after `connect`.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Ask for a larger ATT MTU. Returns the negotiated value.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError>;
}

/// Scanner/peripheral factory.
#[async_trait]
pub trait BgxCentral: Send + Sync {
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<ScanResult>, TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;
    async fn peripheral(&self, address: &str) -> Result<Arc<dyn BgxTransport>, TransportError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    pub const BGX13P_REVISION: &str = "BGX13P.1.2.2738.2-1495-2738";
    pub const BGX13P_DEVICE_ID: [u8; 8] = [0x4c, 0x89, 0x2a, 0x6a, 0x12, 0x34, 0x56, 0x78];

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct RecordedWrite {
        pub characteristic: BgxCharacteristic,
        pub data: Vec<u8>,
        pub ack: AckMode,
    }

    struct MockState {
        profile: GattProfile,
        reads: HashMap<BgxCharacteristic, Vec<u8>>,
        connect_results: VecDeque<Result<(), TransportError>>,
        write_failures: HashMap<BgxCharacteristic, TransportError>,
        writes: Vec<RecordedWrite>,
        subscribed: Vec<BgxCharacteristic>,
        events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
        connect_calls: u32,
        disconnect_calls: u32,
        disconnect_failure: Option<TransportError>,
        mtu: Result<u16, TransportError>,
    }

    /// Scripted peripheral.
    pub struct MockTransport {
        address: String,
        name: String,
        state: Mutex<MockState>,
        connect_gate: Mutex<Option<Arc<Semaphore>>>,
        data_gate: Mutex<Option<Arc<Semaphore>>>,
    }

    impl MockTransport {
        /// A healthy BGX13P with both services and a known firmware revision.
        pub fn bgx(address: &str) -> Arc<Self> {
            let mut reads = HashMap::new();
            reads.insert(BgxCharacteristic::FirmwareRevision, BGX13P_REVISION.as_bytes().to_vec());
            reads.insert(BgxCharacteristic::OtaDeviceId, BGX13P_DEVICE_ID.to_vec());
            reads.insert(BgxCharacteristic::Mode, vec![1]);
            Arc::new(Self {
                address: address.to_string(),
                name: format!("BGX-{}", address),
                state: Mutex::new(MockState {
                    profile: GattProfile {
                        has_stream_service: true,
                        has_ota_service: true,
                        has_device_info: true,
                    },
                    reads,
                    connect_results: VecDeque::new(),
                    write_failures: HashMap::new(),
                    writes: Vec::new(),
                    subscribed: Vec::new(),
                    events_tx: None,
                    connect_calls: 0,
                    disconnect_calls: 0,
                    disconnect_failure: None,
                    mtu: Ok(247),
                }),
                connect_gate: Mutex::new(None),
                data_gate: Mutex::new(None),
            })
        }

        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub fn set_read(&self, characteristic: BgxCharacteristic, value: &[u8]) {
            self.state().reads.insert(characteristic, value.to_vec());
        }

        pub fn set_profile(&self, profile: GattProfile) {
            self.state().profile = profile;
        }

        pub fn set_mtu(&self, mtu: Result<u16, TransportError>) {
            self.state().mtu = mtu;
        }

        /// Results for successive `connect` calls; `Ok` once exhausted.
        pub fn push_connect_result(&self, result: Result<(), TransportError>) {
            self.state().connect_results.push_back(result);
        }

        /// Every write to `characteristic` fails with `code` until cleared.
        pub fn fail_writes(&self, characteristic: BgxCharacteristic, code: i32) {
            self.state()
                .write_failures
                .insert(characteristic, TransportError::new(code, "scripted write failure"));
        }

        pub fn clear_write_failures(&self) {
            self.state().write_failures.clear();
        }

        /// `disconnect` returns `code` after dropping the link.
        pub fn fail_disconnect(&self, code: i32) {
            self.state().disconnect_failure =
                Some(TransportError::new(code, "scripted disconnect failure"));
        }

        /// Block `connect` until the returned semaphore is given a permit.
        pub fn gate_connect(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            *self.connect_gate.lock().unwrap() = Some(gate.clone());
            gate
        }

        /// Each OTA data write consumes one permit before it is accepted.
        pub fn gate_ota_data(&self) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            *self.data_gate.lock().unwrap() = Some(gate.clone());
            gate
        }

        pub fn writes(&self) -> Vec<RecordedWrite> {
            self.state().writes.clone()
        }

        pub fn writes_to(&self, characteristic: BgxCharacteristic) -> Vec<Vec<u8>> {
            self.state()
                .writes
                .iter()
                .filter(|w| w.characteristic == characteristic)
                .map(|w| w.data.clone())
                .collect()
        }

        pub fn subscribed(&self) -> Vec<BgxCharacteristic> {
            self.state().subscribed.clone()
        }

        pub fn connect_calls(&self) -> u32 {
            self.state().connect_calls
        }

        pub fn disconnect_calls(&self) -> u32 {
            self.state().disconnect_calls
        }

        pub fn notify(&self, characteristic: BgxCharacteristic, value: &[u8]) {
            if let Some(tx) = &self.state().events_tx {
                let _ = tx.send(TransportEvent::Notify {
                    characteristic,
                    value: value.to_vec(),
                });
            }
        }

        /// Simulate link loss.
        pub fn drop_link(&self, status: i32) {
            if let Some(tx) = self.state().events_tx.take() {
                let _ = tx.send(TransportEvent::Disconnected { status });
            }
        }
    }

    #[async_trait]
    impl BgxTransport for MockTransport {
        fn address(&self) -> String {
            self.address.clone()
        }

        fn name(&self) -> String {
            self.name.clone()
        }

        async fn connect(&self) -> Result<(), TransportError> {
            let gate = self.connect_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let mut state = self.state();
            state.connect_calls += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state();
            state.disconnect_calls += 1;
            if let Some(tx) = state.events_tx.take() {
                let _ = tx.send(TransportEvent::Disconnected { status: 0 });
            }
            match state.disconnect_failure.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn discover_services(&self) -> Result<GattProfile, TransportError> {
            Ok(self.state().profile)
        }

        async fn read(&self, characteristic: BgxCharacteristic) -> Result<Vec<u8>, TransportError> {
            self.state()
                .reads
                .get(&characteristic)
                .cloned()
                .ok_or_else(|| TransportError::new(CODE_NO_CHARACTERISTIC, "no scripted read"))
        }

        async fn write(
            &self,
            characteristic: BgxCharacteristic,
            data: &[u8],
            ack: AckMode,
        ) -> Result<(), TransportError> {
            if characteristic == BgxCharacteristic::OtaData {
                let gate = self.data_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
            }
            let mut state = self.state();
            if let Some(err) = state.write_failures.get(&characteristic) {
                return Err(err.clone());
            }
            state.writes.push(RecordedWrite {
                characteristic,
                data: data.to_vec(),
                ack,
            });
            Ok(())
        }

        async fn subscribe(&self, characteristic: BgxCharacteristic) -> Result<(), TransportError> {
            self.state().subscribed.push(characteristic);
            Ok(())
        }

        async fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.state().events_tx = Some(tx);
            Ok(rx)
        }

        async fn request_mtu(&self, _mtu: u16) -> Result<u16, TransportError> {
            self.state().mtu.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::new(137, "bond").is_bond_failure());
        assert!(TransportError::new(133, "gatt").is_retryable());
        assert!(TransportError::new(CODE_NOT_FOUND, "gone").is_not_found());
        for code in [0x03, 0x05, 0x08] {
            assert!(TransportError::new(code, "att").is_password_rejection());
        }
        assert!(!TransportError::new(133, "gatt").is_password_rejection());
        assert!(!TransportError::new(0x0e, "unlikely").is_password_rejection());
    }
}
