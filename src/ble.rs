// btleplug transport
//
// Implements the transport port on the host BLE stack. One `BleCentral`
// wraps the first adapter; each `BlePeripheral` wraps one BGX module.
//
// BGX GATT layout:
//   Streaming service 331a36f5-2459-45ea-9d95-6142f0c4b307
//     RX   a9da6040-0823-4995-94ec-9ce41ca28833  (write)
//     TX   a73e9a10-628f-4494-a099-12efaf72258f  (notify)
//     Mode 75a9f022-af03-4e41-b4bc-9de90a47d50b  (read/write/notify)
//   OTA service 169b52a0-b7fd-40da-998c-dd9238327e55
//     Control   902ee692-6ef9-48a8-a430-5212eeb3e5a2
//     Data      503a5d70-b443-466e-9aeb-c342802b184e
//     Device id 12e868e7-c926-4906-96c8-a7ee81d4b1b3
//   Device Information 0x180a, firmware revision 0x2a26

use crate::transport::{
    BgxCentral, BgxCharacteristic, BgxTransport, GattProfile, ScanResult, TransportError,
    TransportEvent, CODE_GENERIC, CODE_NOT_FOUND, CODE_NO_CHARACTERISTIC, CODE_TIMEOUT,
    CODE_UNSUPPORTED,
};
use crate::types::AckMode;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

/// Build a 128-bit UUID from its five dash-separated fields.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Bluetooth SIG 16-bit UUID on the base UUID.
const fn uuid16(short: u16) -> Uuid {
    uuid_from_fields(short as u32, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb)
}

pub const BGX_STREAM_SERVICE_UUID: Uuid = uuid_from_fields(0x331a36f5, 0x2459, 0x45ea, 0x9d95, 0x6142f0c4b307);
const BGX_RX_UUID: Uuid = uuid_from_fields(0xa9da6040, 0x0823, 0x4995, 0x94ec, 0x9ce41ca28833);
const BGX_TX_UUID: Uuid = uuid_from_fields(0xa73e9a10, 0x628f, 0x4494, 0xa099, 0x12efaf72258f);
const BGX_MODE_UUID: Uuid = uuid_from_fields(0x75a9f022, 0xaf03, 0x4e41, 0xb4bc, 0x9de90a47d50b);

pub const BGX_OTA_SERVICE_UUID: Uuid = uuid_from_fields(0x169b52a0, 0xb7fd, 0x40da, 0x998c, 0xdd9238327e55);
const OTA_CONTROL_UUID: Uuid = uuid_from_fields(0x902ee692, 0x6ef9, 0x48a8, 0xa430, 0x5212eeb3e5a2);
const OTA_DATA_UUID: Uuid = uuid_from_fields(0x503a5d70, 0xb443, 0x466e, 0x9aeb, 0xc342802b184e);
const OTA_DEVICE_ID_UUID: Uuid = uuid_from_fields(0x12e868e7, 0xc926, 0x4906, 0x96c8, 0xa7ee81d4b1b3);

const DEVICE_INFO_SERVICE_UUID: Uuid = uuid16(0x180a);
const FIRMWARE_REVISION_UUID: Uuid = uuid16(0x2a26);

fn characteristic_uuid(characteristic: BgxCharacteristic) -> Uuid {
    match characteristic {
        BgxCharacteristic::Rx => BGX_RX_UUID,
        BgxCharacteristic::Tx => BGX_TX_UUID,
        BgxCharacteristic::Mode => BGX_MODE_UUID,
        BgxCharacteristic::OtaControl => OTA_CONTROL_UUID,
        BgxCharacteristic::OtaData => OTA_DATA_UUID,
        BgxCharacteristic::OtaDeviceId => OTA_DEVICE_ID_UUID,
        BgxCharacteristic::FirmwareRevision => FIRMWARE_REVISION_UUID,
    }
}

fn characteristic_for_uuid(uuid: Uuid) -> Option<BgxCharacteristic> {
    [
        BgxCharacteristic::Rx,
        BgxCharacteristic::Tx,
        BgxCharacteristic::Mode,
        BgxCharacteristic::OtaControl,
        BgxCharacteristic::OtaData,
        BgxCharacteristic::OtaDeviceId,
        BgxCharacteristic::FirmwareRevision,
    ]
    .into_iter()
    .find(|c| characteristic_uuid(*c) == uuid)
}

fn map_err(context: &str, e: btleplug::Error) -> TransportError {
    let code = match &e {
        btleplug::Error::DeviceNotFound => CODE_NOT_FOUND,
        btleplug::Error::TimedOut(_) => CODE_TIMEOUT,
        btleplug::Error::NoSuchCharacteristic => CODE_NO_CHARACTERISTIC,
        btleplug::Error::NotSupported(_) => CODE_UNSUPPORTED,
        // Insufficient authentication
        btleplug::Error::PermissionDenied => 0x05,
        _ => CODE_GENERIC,
    };
    TransportError::new(code, format!("{context}: {e}"))
}

// ============================================================================
// Central
// ============================================================================

pub struct BleCentral {
    adapter: Adapter,
    scanning: Arc<AtomicBool>,
}

impl BleCentral {
    /// Open the first BLE adapter on the host.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| map_err("BLE manager init failed", e))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| map_err("Failed to list BLE adapters", e))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new(CODE_NOT_FOUND, "No BLE adapter found"))?;
        Ok(Self {
            adapter,
            scanning: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| map_err("Failed to list peripherals", e))?;
        Ok(peripherals.into_iter().find(|p| p.id().to_string() == address))
    }
}

#[async_trait]
impl BgxCentral for BleCentral {
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<ScanResult>, TransportError> {
        // Scan unfiltered: CoreBluetooth only matches UUIDs in the primary
        // advertisement, and the BGX service is often in the scan response.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| map_err("Failed to start BLE scan", e))?;
        self.scanning.store(true, Ordering::Relaxed);
        tlog!("[ble] Scan started");

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let scanning = self.scanning.clone();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while scanning.load(Ordering::Relaxed) && !tx.is_closed() {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;

                let Ok(peripherals) = adapter.peripherals().await else {
                    break;
                };
                for peripheral in peripherals {
                    let address = peripheral.id().to_string();
                    if seen.contains(&address) {
                        continue;
                    }
                    let Some(props) = peripheral.properties().await.ok().flatten() else {
                        continue;
                    };
                    let named_bgx = props
                        .local_name
                        .as_deref()
                        .map(|n| n.starts_with("BGX"))
                        .unwrap_or(false);
                    if !props.services.contains(&BGX_STREAM_SERVICE_UUID) && !named_bgx {
                        continue;
                    }
                    seen.insert(address.clone());
                    let name = props.local_name.unwrap_or_else(|| address.clone());
                    tlog!("[ble] Found {} ({}), RSSI {:?}", name, address, props.rssi);
                    let _ = tx.send(ScanResult {
                        address,
                        name,
                        rssi: props.rssi,
                    });
                }
            }
            tlog!("[ble] Scan poller finished");
        });
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if !self.scanning.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| map_err("Failed to stop BLE scan", e))
    }

    async fn peripheral(&self, address: &str) -> Result<Arc<dyn BgxTransport>, TransportError> {
        let peripheral = match self.find(address).await? {
            Some(p) => p,
            None => {
                // Not in the adapter cache (CoreBluetooth evicts after a
                // disconnect); a short rescan brings it back.
                tlog!("[ble] {} not in cache, running quick rescan...", address);
                let _ = self.adapter.start_scan(ScanFilter::default()).await;
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                let _ = self.adapter.stop_scan().await;
                self.find(address).await?.ok_or_else(|| {
                    TransportError::new(CODE_NOT_FOUND, format!("Device '{}' not found", address))
                })?
            }
        };

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| address.to_string());

        Ok(Arc::new(BlePeripheral {
            adapter: self.adapter.clone(),
            peripheral,
            address: address.to_string(),
            name,
        }))
    }
}

// ============================================================================
// Peripheral
// ============================================================================

pub struct BlePeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    address: String,
    name: String,
}

impl BlePeripheral {
    fn find_characteristic(&self, characteristic: BgxCharacteristic) -> Result<Characteristic, TransportError> {
        let uuid = characteristic_uuid(characteristic);
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                TransportError::new(
                    CODE_NO_CHARACTERISTIC,
                    format!("{:?} characteristic not found", characteristic),
                )
            })
    }
}

#[async_trait]
impl BgxTransport for BlePeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        tlog!("[ble] Connecting to {}...", self.address);
        self.peripheral
            .connect()
            .await
            .map_err(|e| map_err("Failed to connect", e))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| map_err("Failed to disconnect", e))
    }

    async fn discover_services(&self) -> Result<GattProfile, TransportError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| map_err("Failed to discover services", e))?;
        let services = self.peripheral.services();
        let has = |uuid: Uuid| services.iter().any(|s| s.uuid == uuid);
        Ok(GattProfile {
            has_stream_service: has(BGX_STREAM_SERVICE_UUID),
            has_ota_service: has(BGX_OTA_SERVICE_UUID),
            has_device_info: has(DEVICE_INFO_SERVICE_UUID),
        })
    }

    async fn read(&self, characteristic: BgxCharacteristic) -> Result<Vec<u8>, TransportError> {
        let c = self.find_characteristic(characteristic)?;
        self.peripheral
            .read(&c)
            .await
            .map_err(|e| map_err("Read failed", e))
    }

    async fn write(
        &self,
        characteristic: BgxCharacteristic,
        data: &[u8],
        ack: AckMode,
    ) -> Result<(), TransportError> {
        let c = self.find_characteristic(characteristic)?;
        let write_type = match ack {
            AckMode::Acknowledged => WriteType::WithResponse,
            AckMode::Unacknowledged => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&c, data, write_type)
            .await
            .map_err(|e| map_err("Write failed", e))
    }

    async fn subscribe(&self, characteristic: BgxCharacteristic) -> Result<(), TransportError> {
        let c = self.find_characteristic(characteristic)?;
        self.peripheral
            .subscribe(&c)
            .await
            .map_err(|e| map_err("Subscribe failed", e))
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        // notifications() is multiplexed across every subscribed characteristic
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| map_err("Failed to open notification stream", e))?;
        let mut central_events = self
            .adapter
            .events()
            .await
            .map_err(|e| map_err("Failed to open adapter event stream", e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.peripheral.id();
        let address = self.address.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = notifications.next() => match n {
                        Some(n) => {
                            let Some(characteristic) = characteristic_for_uuid(n.uuid) else {
                                continue;
                            };
                            if tx.send(TransportEvent::Notify { characteristic, value: n.value }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    ev = central_events.next() => match ev {
                        Some(CentralEvent::DeviceDisconnected(pid)) if pid == id => {
                            tlog!("[ble] {} disconnected", address);
                            let _ = tx.send(TransportEvent::Disconnected { status: 0 });
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16, TransportError> {
        // The host stack negotiates the MTU itself and btleplug does not
        // expose it; callers fall back to the default write size.
        Err(TransportError::new(CODE_UNSUPPORTED, "MTU request not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids() {
        assert_eq!(
            BGX_STREAM_SERVICE_UUID.to_string(),
            "331a36f5-2459-45ea-9d95-6142f0c4b307"
        );
        assert_eq!(OTA_DATA_UUID.to_string(), "503a5d70-b443-466e-9aeb-c342802b184e");
        assert_eq!(
            FIRMWARE_REVISION_UUID.to_string(),
            "00002a26-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_characteristic_lookup() {
        assert_eq!(characteristic_for_uuid(BGX_MODE_UUID), Some(BgxCharacteristic::Mode));
        assert_eq!(characteristic_for_uuid(OTA_DEVICE_ID_UUID), Some(BgxCharacteristic::OtaDeviceId));
        assert_eq!(characteristic_for_uuid(BGX_STREAM_SERVICE_UUID), None);
    }
}
