// Session manager
//
// Owns one `BgxSession` per device address and dispatches consumer commands
// to them. Nothing here returns an error to the consumer: a refused command
// becomes a `CommandRejected` event, everything else is reported by the
// session and OTA events themselves.

use crate::config::BgxConfig;
use crate::credentials::CredentialGate;
use crate::error::BgxError;
use crate::events::{BgxEvent, EventBus, Subscription};
use crate::firmware::FirmwareCatalog;
use crate::ota::OtaRequest;
use crate::session::BgxSession;
use crate::transport::BgxCentral;
use crate::types::{AckMode, BusMode, OtaFailureReason, OtaStatus};
use crate::version::FirmwareVersion;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Consumer commands.
#[derive(Clone)]
pub enum Command {
    StartScan,
    StopScan,
    Connect {
        address: String,
    },
    CancelConnect {
        address: String,
    },
    Disconnect {
        address: String,
    },
    ReadBusMode {
        address: String,
    },
    WriteBusMode {
        address: String,
        mode: BusMode,
        password: Option<String>,
    },
    WriteMessage {
        address: String,
        text: String,
    },
    WriteBytes {
        address: String,
        bytes: Vec<u8>,
    },
    SetWriteAckMode {
        address: String,
        ack_mode: AckMode,
    },
    GetFirmwareVersions {
        part_identifier: String,
        platform: Option<String>,
    },
    StartOta {
        address: String,
        request: OtaRequest,
    },
    /// Download `version` from the catalog, then start the OTA with it.
    StartOtaFromCatalog {
        address: String,
        version: FirmwareVersion,
        ack_mode: AckMode,
        password: Option<String>,
    },
    CancelOta {
        address: String,
    },
    GetDeviceInfo {
        address: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartScan => "StartScan",
            Command::StopScan => "StopScan",
            Command::Connect { .. } => "Connect",
            Command::CancelConnect { .. } => "CancelConnect",
            Command::Disconnect { .. } => "Disconnect",
            Command::ReadBusMode { .. } => "ReadBusMode",
            Command::WriteBusMode { .. } => "WriteBusMode",
            Command::WriteMessage { .. } => "WriteMessage",
            Command::WriteBytes { .. } => "WriteBytes",
            Command::SetWriteAckMode { .. } => "SetWriteAckMode",
            Command::GetFirmwareVersions { .. } => "GetFirmwareVersions",
            Command::StartOta { .. } => "StartOta",
            Command::StartOtaFromCatalog { .. } => "StartOtaFromCatalog",
            Command::CancelOta { .. } => "CancelOta",
            Command::GetDeviceInfo { .. } => "GetDeviceInfo",
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Command::StartScan | Command::StopScan | Command::GetFirmwareVersions { .. } => None,
            Command::Connect { address }
            | Command::CancelConnect { address }
            | Command::Disconnect { address }
            | Command::ReadBusMode { address }
            | Command::WriteBusMode { address, .. }
            | Command::WriteMessage { address, .. }
            | Command::WriteBytes { address, .. }
            | Command::SetWriteAckMode { address, .. }
            | Command::StartOta { address, .. }
            | Command::StartOtaFromCatalog { address, .. }
            | Command::CancelOta { address }
            | Command::GetDeviceInfo { address } => Some(address),
        }
    }
}

pub struct BgxManager {
    central: Arc<dyn BgxCentral>,
    catalog: Arc<dyn FirmwareCatalog>,
    credentials: Arc<dyn CredentialGate>,
    events: EventBus,
    config: BgxConfig,
    sessions: tokio::sync::Mutex<HashMap<String, BgxSession>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BgxManager {
    pub fn new(
        central: Arc<dyn BgxCentral>,
        catalog: Arc<dyn FirmwareCatalog>,
        credentials: Arc<dyn CredentialGate>,
        config: BgxConfig,
    ) -> Result<Self, BgxError> {
        config.validate()?;
        Ok(Self {
            central,
            catalog,
            credentials,
            events: EventBus::new(),
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            scan_task: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Session for `address`, if one exists.
    pub async fn session(&self, address: &str) -> Option<BgxSession> {
        self.sessions.lock().await.get(address).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Execute one command. Refusals are reported as `CommandRejected`.
    pub async fn handle(&self, command: Command) {
        let name = command.name();
        let address = command.address().map(str::to_string);
        if let Err(e) = self.dispatch(command).await {
            tlog!("[manager] {} rejected: {}", name, e);
            self.events.emit(BgxEvent::CommandRejected {
                address,
                command: name.to_string(),
                reason: e.to_string(),
            });
        }
    }

    async fn dispatch(&self, command: Command) -> Result<(), BgxError> {
        match command {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => self.stop_scan().await,
            Command::Connect { address } => self.session_or_create(&address).await?.connect(),
            Command::CancelConnect { address } => self.existing(&address).await?.cancel_connect().await,
            Command::Disconnect { address } => {
                let session = self
                    .sessions
                    .lock()
                    .await
                    .remove(&address)
                    .ok_or(BgxError::UnknownDevice(address))?;
                session.teardown().await
            }
            Command::ReadBusMode { address } => {
                self.existing(&address).await?.read_bus_mode().await.map(|_| ())
            }
            Command::WriteBusMode {
                address,
                mode,
                password,
            } => self.existing(&address).await?.write_bus_mode(mode, password).await,
            Command::WriteMessage { address, text } => {
                self.existing(&address).await?.write_message(&text).await
            }
            Command::WriteBytes { address, bytes } => {
                self.existing(&address).await?.write_bytes(&bytes).await
            }
            Command::SetWriteAckMode { address, ack_mode } => {
                self.existing(&address).await?.set_write_ack_mode(ack_mode);
                Ok(())
            }
            Command::GetFirmwareVersions {
                part_identifier,
                platform,
            } => {
                self.fetch_versions(&part_identifier, platform).await;
                Ok(())
            }
            Command::StartOta { address, request } => self.existing(&address).await?.start_ota(request),
            Command::StartOtaFromCatalog {
                address,
                version,
                ack_mode,
                password,
            } => {
                self.ota_from_catalog(&address, version, ack_mode, password)
                    .await
            }
            Command::CancelOta { address } => self.existing(&address).await?.cancel_ota().await,
            Command::GetDeviceInfo { address } => self.existing(&address).await?.emit_device_info(),
        }
    }

    async fn existing(&self, address: &str) -> Result<BgxSession, BgxError> {
        self.session(address)
            .await
            .ok_or_else(|| BgxError::UnknownDevice(address.to_string()))
    }

    async fn session_or_create(&self, address: &str) -> Result<BgxSession, BgxError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(address) {
            return Ok(session.clone());
        }
        let transport = self.central.peripheral(address).await.map_err(|e| {
            if e.is_not_found() {
                BgxError::UnknownDevice(address.to_string())
            } else {
                e.into()
            }
        })?;
        let session = BgxSession::new(
            transport,
            self.events.clone(),
            self.credentials.clone(),
            self.config.clone(),
        )?;
        tlog!("[manager] New session for {}", address);
        sessions.insert(address.to_string(), session.clone());
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    async fn start_scan(&self) -> Result<(), BgxError> {
        if self
            .scan_task
            .lock()
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
        {
            return Ok(());
        }

        let mut results = match self.central.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                tlog!("[manager] Scan failed to start: {}", e);
                self.events.emit(BgxEvent::ScanModeChanged {
                    is_scanning: false,
                    failed: true,
                    error_code: Some(e.code),
                });
                return Ok(());
            }
        };

        self.events.emit(BgxEvent::ScanModeChanged {
            is_scanning: true,
            failed: false,
            error_code: None,
        });

        let central = self.central.clone();
        let events = self.events.clone();
        let duration = Duration::from_secs(self.config.scan_duration_secs);
        let handle = tokio::spawn(async move {
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    found = results.recv() => match found {
                        Some(device) => events.emit(BgxEvent::ScanDeviceDiscovered {
                            address: device.address,
                            name: device.name,
                            rssi: device.rssi,
                        }),
                        None => break,
                    },
                }
            }
            if let Err(e) = central.stop_scan().await {
                tlog!("[manager] Failed to stop scan: {}", e);
            }
            tlog!("[manager] Scan finished");
            events.emit(BgxEvent::ScanModeChanged {
                is_scanning: false,
                failed: false,
                error_code: None,
            });
        });

        if let Ok(mut task) = self.scan_task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BgxError> {
        let task = self.scan_task.lock().ok().and_then(|mut t| t.take());
        let Some(task) = task.filter(|t| !t.is_finished()) else {
            return Ok(());
        };
        task.abort();
        self.central.stop_scan().await?;
        self.events.emit(BgxEvent::ScanModeChanged {
            is_scanning: false,
            failed: false,
            error_code: None,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Firmware catalog
    // ------------------------------------------------------------------------

    /// Platform reported by a connected device with this part identifier.
    async fn platform_for(&self, part_identifier: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.values().find_map(|s| {
            s.get_device_info()
                .ok()
                .filter(|(identity, _)| identity.part_identifier == part_identifier)
                .map(|(_, firmware)| firmware.platform)
        })
    }

    async fn fetch_versions(&self, part_identifier: &str, platform: Option<String>) {
        let platform = match platform {
            Some(p) => Some(p),
            None => self.platform_for(part_identifier).await,
        };
        match self.catalog.versions(part_identifier, platform.as_deref()).await {
            Ok(catalog) => self.events.emit(BgxEvent::FirmwareVersionsAvailable {
                part_identifier: part_identifier.to_string(),
                catalog,
            }),
            Err(e) => {
                tlog!("[manager] Catalog lookup for {} failed: {}", part_identifier, e);
                self.events.emit(BgxEvent::CatalogError {
                    part_identifier: part_identifier.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    async fn ota_from_catalog(
        &self,
        address: &str,
        version: FirmwareVersion,
        ack_mode: AckMode,
        password: Option<String>,
    ) -> Result<(), BgxError> {
        let session = self.existing(address).await?;
        session.require_connected()?;
        if session.ota_session().is_some() {
            return Err(BgxError::Busy);
        }
        let (identity, firmware) = session.get_device_info()?;

        self.events.emit(BgxEvent::OtaStatus {
            address: address.to_string(),
            status: OtaStatus::Downloading,
            bytes_sent: None,
            failure: None,
            step: None,
        });

        let image = match self
            .catalog
            .download(&identity.part_identifier, Some(&firmware.platform), &version)
            .await
        {
            Ok(image) => image,
            Err(e) => {
                tlog!("[manager] Download of {} failed: {}", version, e);
                self.events.emit(BgxEvent::OtaStatus {
                    address: address.to_string(),
                    status: OtaStatus::Failed,
                    bytes_sent: None,
                    failure: Some(OtaFailureReason::Image(e.to_string())),
                    step: None,
                });
                return Ok(());
            }
        };

        session.start_ota(OtaRequest {
            image,
            ack_mode,
            password,
            version: Some(version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialGate;
    use crate::firmware::{parse_catalog, FirmwareCatalogEntry};
    use crate::session::test_support::{test_config, wait_for, wait_state};
    use crate::transport::mock::MockTransport;
    use crate::transport::{
        BgxCharacteristic, BgxTransport, ScanResult, TransportError, CODE_NOT_FOUND,
    };
    use crate::types::{ConnectionState, ImageRef};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct MockCentral {
        peripherals: HashMap<String, Arc<MockTransport>>,
        scan_results: Vec<ScanResult>,
    }

    #[async_trait]
    impl BgxCentral for MockCentral {
        async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<ScanResult>, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            for result in &self.scan_results {
                let _ = tx.send(result.clone());
            }
            Ok(rx)
        }

        async fn stop_scan(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn peripheral(&self, address: &str) -> Result<Arc<dyn BgxTransport>, TransportError> {
            match self.peripherals.get(address) {
                Some(p) => Ok(p.clone() as Arc<dyn BgxTransport>),
                None => Err(TransportError::new(CODE_NOT_FOUND, "not found")),
            }
        }
    }

    struct MockCatalog;

    #[async_trait]
    impl FirmwareCatalog for MockCatalog {
        async fn versions(
            &self,
            part_identifier: &str,
            _platform: Option<&str>,
        ) -> Result<Vec<FirmwareCatalogEntry>, BgxError> {
            if part_identifier == "BAD1DEAD" {
                return Err(BgxError::Catalog("no such part".into()));
            }
            parse_catalog(
                r#"[{"version": "1.0.0.0", "description": "a", "size": 10},
                    {"version": "1.2.0.0", "description": "b", "size": 20}]"#,
            )
        }

        async fn download(
            &self,
            _part_identifier: &str,
            _platform: Option<&str>,
            version: &FirmwareVersion,
        ) -> Result<ImageRef, BgxError> {
            Ok(ImageRef::Memory {
                name: version.to_string(),
                bytes: Arc::new(vec![0xaa; 488]),
            })
        }
    }

    fn manager_with(devices: &[&Arc<MockTransport>]) -> BgxManager {
        let peripherals = devices
            .iter()
            .map(|d| (d.address(), Arc::clone(*d)))
            .collect();
        let central = MockCentral {
            peripherals,
            scan_results: vec![
                ScanResult { address: "dev-a".into(), name: "BGX-A".into(), rssi: Some(-40) },
                ScanResult { address: "dev-b".into(), name: "BGX-B".into(), rssi: None },
            ],
        };
        BgxManager::new(
            Arc::new(central),
            Arc::new(MockCatalog),
            Arc::new(MemoryCredentialGate::new()),
            test_config(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = BgxManager::new(
            Arc::new(MockCentral {
                peripherals: HashMap::new(),
                scan_results: Vec::new(),
            }),
            Arc::new(MockCatalog),
            Arc::new(MemoryCredentialGate::new()),
            BgxConfig {
                ota_chunk_size: 0,
                ..test_config()
            },
        );
        assert!(matches!(result, Err(BgxError::Config(_))));
    }

    fn connect(address: &str) -> Command {
        Command::Connect { address: address.into() }
    }

    #[tokio::test]
    async fn test_connect_unknown_device_is_rejected() {
        let manager = manager_with(&[]);
        let mut sub = manager.subscribe();
        manager.handle(connect("nowhere")).await;
        let event = wait_for(&mut sub, |e| matches!(e, BgxEvent::CommandRejected { .. })).await;
        match event {
            BgxEvent::CommandRejected { address, command, .. } => {
                assert_eq!(address.as_deref(), Some("nowhere"));
                assert_eq!(command, "Connect");
            }
            _ => unreachable!(),
        }
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_command_for_unknown_session_is_rejected() {
        let manager = manager_with(&[]);
        let mut sub = manager.subscribe();
        manager
            .handle(Command::ReadBusMode { address: "dev-a".into() })
            .await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::CommandRejected { .. })).await;
    }

    #[tokio::test]
    async fn test_session_lifecycle_through_commands() {
        let a = MockTransport::bgx("dev-a");
        let manager = manager_with(&[&a]);
        let mut sub = manager.subscribe();

        manager.handle(connect("dev-a")).await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::MtuChanged { .. })).await;

        manager
            .handle(Command::WriteBusMode {
                address: "dev-a".into(),
                mode: BusMode::LocalCommand,
                password: None,
            })
            .await;
        wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::BusModeChanged { mode: BusMode::LocalCommand, .. })
        })
        .await;

        manager
            .handle(Command::WriteMessage { address: "dev-a".into(), text: "hi".into() })
            .await;
        assert_eq!(a.writes_to(BgxCharacteristic::Rx), vec![b"hi".to_vec()]);

        manager.handle(Command::GetDeviceInfo { address: "dev-a".into() }).await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::DeviceInfo { .. })).await;

        manager.handle(Command::Disconnect { address: "dev-a".into() }).await;
        wait_state(&mut sub, ConnectionState::Disconnected).await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_ota_is_rejected_busy() {
        let a = MockTransport::bgx("dev-a");
        let gate = a.gate_ota_data();
        let manager = manager_with(&[&a]);
        let mut sub = manager.subscribe();
        manager.handle(connect("dev-a")).await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::MtuChanged { .. })).await;

        let image = ImageRef::Memory { name: "fw".into(), bytes: Arc::new(vec![1; 100]) };
        let request = OtaRequest::new(image, AckMode::Acknowledged);
        manager
            .handle(Command::StartOta { address: "dev-a".into(), request: request.clone() })
            .await;
        manager
            .handle(Command::StartOta { address: "dev-a".into(), request })
            .await;
        let event = wait_for(&mut sub, |e| matches!(e, BgxEvent::CommandRejected { .. })).await;
        assert!(matches!(event, BgxEvent::CommandRejected { ref command, .. } if command == "StartOta"));

        gate.add_permits(1);
        wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::OtaStatus { status: OtaStatus::Finished, .. })
        })
        .await;
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let a = MockTransport::bgx("dev-a");
        let b = MockTransport::bgx("dev-b");
        let _gate = a.gate_ota_data();
        let manager = manager_with(&[&a, &b]);
        let mut sub = manager.subscribe();

        for addr in ["dev-a", "dev-b"] {
            manager.handle(connect(addr)).await;
            wait_for(&mut sub, |e| {
                matches!(e, BgxEvent::MtuChanged { address, .. } if address == addr)
            })
            .await;
        }

        let image = ImageRef::Memory { name: "fw".into(), bytes: Arc::new(vec![1; 100]) };
        manager
            .handle(Command::StartOta {
                address: "dev-a".into(),
                request: OtaRequest::new(image.clone(), AckMode::Acknowledged),
            })
            .await;
        manager
            .handle(Command::StartOta {
                address: "dev-b".into(),
                request: OtaRequest::new(image, AckMode::Acknowledged),
            })
            .await;

        let event = wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::OtaStatus { status: OtaStatus::Finished, .. })
        })
        .await;
        assert_eq!(event.address(), Some("dev-b"));
        assert!(manager.session("dev-a").await.unwrap().ota_session().is_some());

        manager.handle(Command::CancelOta { address: "dev-a".into() }).await;
        let event = wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::OtaStatus { status: OtaStatus::UserCanceled, .. })
        })
        .await;
        assert_eq!(event.address(), Some("dev-a"));
    }

    #[tokio::test]
    async fn test_firmware_versions() {
        let manager = manager_with(&[]);
        let mut sub = manager.subscribe();

        manager
            .handle(Command::GetFirmwareVersions {
                part_identifier: "4C892A6A".into(),
                platform: None,
            })
            .await;
        match wait_for(&mut sub, |e| matches!(e, BgxEvent::FirmwareVersionsAvailable { .. })).await {
            BgxEvent::FirmwareVersionsAvailable { catalog, .. } => {
                assert_eq!(catalog[0].version, FirmwareVersion::new(1, 2, 0, 0));
                assert_eq!(catalog.len(), 2);
            }
            _ => unreachable!(),
        }

        manager
            .handle(Command::GetFirmwareVersions {
                part_identifier: "BAD1DEAD".into(),
                platform: None,
            })
            .await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::CatalogError { .. })).await;
    }

    #[tokio::test]
    async fn test_ota_from_catalog() {
        let a = MockTransport::bgx("dev-a");
        let manager = manager_with(&[&a]);
        let mut sub = manager.subscribe();
        manager.handle(connect("dev-a")).await;
        wait_for(&mut sub, |e| matches!(e, BgxEvent::MtuChanged { .. })).await;

        manager
            .handle(Command::StartOtaFromCatalog {
                address: "dev-a".into(),
                version: FirmwareVersion::new(1, 2, 0, 0),
                ack_mode: AckMode::Acknowledged,
                password: None,
            })
            .await;
        wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::OtaStatus { status: OtaStatus::Downloading, .. })
        })
        .await;
        let event = wait_for(&mut sub, |e| {
            matches!(e, BgxEvent::OtaStatus { status: OtaStatus::Finished, .. })
        })
        .await;
        assert!(matches!(event, BgxEvent::OtaStatus { bytes_sent: Some(488), .. }));
        assert_eq!(a.writes_to(BgxCharacteristic::OtaData).len(), 2);
    }

    #[tokio::test]
    async fn test_scan_reports_devices() {
        let manager = manager_with(&[]);
        let mut sub = manager.subscribe();
        manager.handle(Command::StartScan).await;

        wait_for(&mut sub, |e| matches!(e, BgxEvent::ScanModeChanged { is_scanning: true, .. })).await;
        let first = wait_for(&mut sub, |e| matches!(e, BgxEvent::ScanDeviceDiscovered { .. })).await;
        assert_eq!(first.address(), Some("dev-a"));
        let second = wait_for(&mut sub, |e| matches!(e, BgxEvent::ScanDeviceDiscovered { .. })).await;
        assert_eq!(second.address(), Some("dev-b"));
        // Mock result channel closes after the scripted devices
        wait_for(&mut sub, |e| matches!(e, BgxEvent::ScanModeChanged { is_scanning: false, .. })).await;
    }
}
