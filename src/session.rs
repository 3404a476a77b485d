// Session state machine
//
// One `BgxSession` per peripheral. It owns the connection lifecycle
// (connect, interrogate, connected, disconnect), the serial data path and the
// state shared with the bus-mode negotiator (bus_mode.rs) and the OTA engine
// (ota.rs).
//
// Only one transport operation is in flight at a time: every radio round
// trip goes through `Shared::op`, which queues on `op_gate` and applies the
// per-operation timer. Connection attempts carry an epoch; cancel, disconnect
// and link loss bump it so a completion that was already queued is ignored.

use crate::config::BgxConfig;
use crate::credentials::CredentialGate;
use crate::error::BgxError;
use crate::events::BgxEvent;
use crate::events::EventBus;
use crate::ota::OtaSlot;
use crate::transport::{
    BgxCharacteristic, BgxTransport, TransportError, TransportEvent, CODE_GENERIC,
    CODE_NO_CHARACTERISTIC, CODE_TIMEOUT,
};
use crate::types::{AckMode, BusMode, ConnectionState, DeviceIdentity, FirmwareRevision, OtaSession};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct SessionState {
    pub(crate) connection: ConnectionState,
    pub(crate) bus_mode: BusMode,
    identity: Option<DeviceIdentity>,
    firmware: Option<FirmwareRevision>,
    mtu: Option<u16>,
    write_ack_mode: AckMode,
    epoch: u64,
    connect_task: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) address: String,
    pub(crate) transport: Arc<dyn BgxTransport>,
    pub(crate) events: EventBus,
    pub(crate) credentials: Arc<dyn CredentialGate>,
    pub(crate) config: BgxConfig,
    op_gate: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    pub(crate) ota: Mutex<Option<OtaSlot>>,
    last_ota: Mutex<Option<OtaSession>>,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn lock_ota(&self) -> MutexGuard<'_, Option<OtaSlot>> {
        match self.ota.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn lock_last_ota(&self) -> MutexGuard<'_, Option<OtaSession>> {
        match self.last_ota.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn emit(&self, event: BgxEvent) {
        self.events.emit(event);
    }

    fn emit_state(&self, state: ConnectionState) {
        self.emit(BgxEvent::ConnectionStatusChanged {
            address: self.address.clone(),
            state,
        });
    }

    pub(crate) fn connection(&self) -> ConnectionState {
        self.lock_state().connection
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.lock_state().epoch != epoch
    }

    /// Move to `next` if the attempt identified by `epoch` is still current.
    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        let mut st = self.lock_state();
        if st.epoch != epoch {
            return false;
        }
        st.connection = next;
        self.emit_state(next);
        true
    }

    fn reset_to_disconnected(&self) {
        let mut st = self.lock_state();
        st.connection = ConnectionState::Disconnected;
        st.bus_mode = BusMode::Unknown;
        st.mtu = None;
        st.connect_task = None;
        if let Some(listener) = st.listener.take() {
            listener.abort();
        }
        self.emit_state(ConnectionState::Disconnected);
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }

    /// Run one transport operation under the single in-flight gate and the
    /// per-operation timer.
    pub(crate) async fn op<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let _gate = self.op_gate.lock().await;
        match tokio::time::timeout(self.operation_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => {
                tlog!("[session] {} {} timed out", self.address, what);
                Err(TransportError::new(CODE_TIMEOUT, format!("{} timed out", what)))
            }
        }
    }

    /// Write chunk size for serial data: MTU minus the ATT header once
    /// negotiated, otherwise the configured default.
    fn write_chunk_size(&self) -> usize {
        self.lock_state()
            .mtu
            .map(|mtu| (mtu as usize).saturating_sub(3))
            .filter(|size| *size > 0)
            .unwrap_or(self.config.default_write_chunk_size)
    }

    pub(crate) fn set_bus_mode(&self, mode: BusMode, announce: bool) {
        let mut st = self.lock_state();
        st.bus_mode = mode;
        if announce {
            self.emit(BgxEvent::BusModeChanged {
                address: self.address.clone(),
                mode,
            });
        }
    }

    pub(crate) fn running_firmware(&self) -> Option<FirmwareRevision> {
        self.lock_state().firmware.clone()
    }
}

fn device_info_event(address: &str, identity: &DeviceIdentity, firmware: &FirmwareRevision) -> BgxEvent {
    BgxEvent::DeviceInfo {
        address: address.to_string(),
        device_uuid: identity.device_uuid.clone(),
        part_id: identity.part_id,
        part_identifier: identity.part_identifier.clone(),
        firmware_revision: firmware.revision.clone(),
        bootloader_version: firmware.bootloader_version.clone(),
        platform: firmware.platform.clone(),
    }
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to one peripheral session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BgxSession {
    pub(crate) shared: Arc<Shared>,
}

impl BgxSession {
    /// Fails with `BgxError::Config` when `config` does not validate.
    pub fn new(
        transport: Arc<dyn BgxTransport>,
        events: EventBus,
        credentials: Arc<dyn CredentialGate>,
        config: BgxConfig,
    ) -> Result<Self, BgxError> {
        config.validate()?;
        let shared = Shared {
            address: transport.address(),
            transport,
            events,
            credentials,
            config,
            op_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                connection: ConnectionState::Disconnected,
                bus_mode: BusMode::Unknown,
                identity: None,
                firmware: None,
                mtu: None,
                write_ack_mode: AckMode::default(),
                epoch: 0,
                connect_task: None,
                listener: None,
            }),
            ota: Mutex::new(None),
            last_ota: Mutex::new(None),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn name(&self) -> String {
        self.shared.transport.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.connection()
    }

    pub fn bus_mode(&self) -> BusMode {
        self.shared.lock_state().bus_mode
    }

    pub fn mtu(&self) -> Option<u16> {
        self.shared.lock_state().mtu
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.shared.lock_state().identity.clone()
    }

    pub fn write_ack_mode(&self) -> AckMode {
        self.shared.lock_state().write_ack_mode
    }

    /// Ack mode for serial data writes.
    pub fn set_write_ack_mode(&self, ack: AckMode) {
        self.shared.lock_state().write_ack_mode = ack;
    }

    pub(crate) fn require_connected(&self) -> Result<(), BgxError> {
        match self.shared.connection() {
            ConnectionState::Connected => Ok(()),
            other => Err(BgxError::NotReady(other)),
        }
    }

    /// Start connecting. Progress is reported through `ConnectionStatusChanged`
    /// events; the call returns as soon as the attempt is under way.
    pub fn connect(&self) -> Result<(), BgxError> {
        let epoch = {
            let mut st = self.shared.lock_state();
            match st.connection {
                ConnectionState::Disconnected
                | ConnectionState::Scanning
                | ConnectionState::ConnectionTimedOut => {}
                _ => return Err(BgxError::Busy),
            }
            st.epoch += 1;
            st.connection = ConnectionState::Connecting;
            self.shared.emit_state(ConnectionState::Connecting);
            st.epoch
        };

        tlog!("[session] Connecting to {}", self.shared.address);
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_connect(shared, epoch));

        let mut st = self.shared.lock_state();
        if st.epoch == epoch {
            st.connect_task = Some(handle);
        }
        Ok(())
    }

    /// Abort a connect in progress. A completion already queued for the
    /// aborted attempt is dropped.
    pub async fn cancel_connect(&self) -> Result<(), BgxError> {
        let task = {
            let mut st = self.shared.lock_state();
            match st.connection {
                ConnectionState::Connecting | ConnectionState::Interrogating => {}
                other => {
                    tlog!("[session] {} cancel_connect ignored in state {:?}", self.shared.address, other);
                    return Ok(());
                }
            }
            st.epoch += 1;
            st.connection = ConnectionState::Disconnecting;
            self.shared.emit_state(ConnectionState::Disconnecting);
            st.connect_task.take()
        };

        if let Some(task) = task {
            task.abort();
        }
        tlog!("[session] {} connect canceled", self.shared.address);
        if let Err(e) = self
            .shared
            .op("disconnect", self.shared.transport.disconnect())
            .await
        {
            tlog!("[session] {} disconnect after cancel failed: {}", self.shared.address, e);
        }
        self.shared.reset_to_disconnected();
        Ok(())
    }

    /// Disconnect, canceling any running OTA first.
    pub async fn disconnect(&self) -> Result<(), BgxError> {
        match self.shared.connection() {
            ConnectionState::Connecting | ConnectionState::Interrogating => {
                return self.cancel_connect().await;
            }
            ConnectionState::ConnectionTimedOut => {
                self.shared.reset_to_disconnected();
                return Ok(());
            }
            ConnectionState::Disconnected
            | ConnectionState::Scanning
            | ConnectionState::Disconnecting => return Ok(()),
            ConnectionState::Connected => {}
        }

        self.cancel_ota().await?;

        {
            let mut st = self.shared.lock_state();
            if st.connection != ConnectionState::Connected {
                return Ok(());
            }
            st.epoch += 1;
            st.connection = ConnectionState::Disconnecting;
            self.shared.emit_state(ConnectionState::Disconnecting);
            if let Some(listener) = st.listener.take() {
                listener.abort();
            }
        }

        tlog!("[session] Disconnecting from {}", self.shared.address);
        if let Err(e) = self
            .shared
            .op("disconnect", self.shared.transport.disconnect())
            .await
        {
            tlog!("[session] {} disconnect failed: {}", self.shared.address, e);
        }
        self.shared.reset_to_disconnected();
        Ok(())
    }

    /// Disconnect and drop every observer registered for this device.
    pub async fn teardown(&self) -> Result<(), BgxError> {
        self.disconnect().await?;
        self.shared.events.unsubscribe_device(&self.shared.address);
        Ok(())
    }

    pub async fn write_message(&self, text: &str) -> Result<(), BgxError> {
        self.write_bytes(text.as_bytes()).await
    }

    /// Send serial data on the RX characteristic, chunked to the link MTU.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<(), BgxError> {
        self.require_connected()?;
        let chunk_size = self.shared.write_chunk_size();
        let ack = self.write_ack_mode();
        for chunk in data.chunks(chunk_size) {
            self.shared
                .op(
                    "serial write",
                    self.shared.transport.write(BgxCharacteristic::Rx, chunk, ack),
                )
                .await?;
        }
        Ok(())
    }

    /// Identity and firmware revision read during interrogation.
    pub fn get_device_info(&self) -> Result<(DeviceIdentity, FirmwareRevision), BgxError> {
        let st = self.shared.lock_state();
        match (&st.identity, &st.firmware) {
            (Some(identity), Some(firmware)) => Ok((identity.clone(), firmware.clone())),
            _ => Err(BgxError::NotReady(st.connection)),
        }
    }

    /// Re-emit the `DeviceInfo` event for the interrogated peripheral.
    pub fn emit_device_info(&self) -> Result<(), BgxError> {
        let (identity, firmware) = self.get_device_info()?;
        self.shared
            .emit(device_info_event(&self.shared.address, &identity, &firmware));
        Ok(())
    }
}

// ============================================================================
// Connect / interrogate
// ============================================================================

async fn run_connect(shared: Arc<Shared>, epoch: u64) {
    let limit = shared.config.connect_retry_limit.max(1);
    let timeout = Duration::from_millis(shared.config.connect_timeout_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = {
            let _gate = shared.op_gate.lock().await;
            tokio::time::timeout(timeout, shared.transport.connect()).await
        };

        if shared.is_stale(epoch) {
            tlog!("[session] {} ignoring stale connect completion", shared.address);
            return;
        }

        match result {
            Ok(Ok(())) => break,
            Ok(Err(e)) if e.is_retryable() && attempt < limit => {
                tlog!(
                    "[session] {} connect attempt {}/{} needs retry: {}",
                    shared.address,
                    attempt,
                    limit,
                    e
                );
            }
            Ok(Err(e)) => {
                tlog!("[session] {} connect failed: {}", shared.address, e);
                if e.is_bond_failure() {
                    shared.emit(BgxEvent::BondFailed {
                        address: shared.address.clone(),
                    });
                } else {
                    shared.emit(BgxEvent::ConnectionError {
                        address: shared.address.clone(),
                        status_code: e.code,
                    });
                }
                shared.transition(epoch, ConnectionState::Disconnected);
                return;
            }
            Err(_) => {
                tlog!("[session] {} connect timed out after {:?}", shared.address, timeout);
                if let Err(e) = shared.op("disconnect", shared.transport.disconnect()).await {
                    tlog!("[session] {} disconnect after timeout failed: {}", shared.address, e);
                }
                shared.transition(epoch, ConnectionState::ConnectionTimedOut);
                return;
            }
        }
    }

    interrogate(shared, epoch).await;
}

struct Interrogated {
    identity: DeviceIdentity,
    firmware: FirmwareRevision,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

async fn read_identity(shared: &Shared) -> Result<Interrogated, BgxError> {
    // Take the event channel first so no notification after subscribe is lost
    let events = shared.transport.events().await?;

    let profile = shared
        .op("discover services", shared.transport.discover_services())
        .await?;
    if !profile.has_stream_service || !profile.has_ota_service {
        return Err(BgxError::Transport {
            code: CODE_NO_CHARACTERISTIC,
            message: "BGX services not found".to_string(),
        });
    }
    if !profile.has_device_info {
        tlog!("[session] {} has no Device Information service", shared.address);
    }

    shared
        .op("subscribe mode", shared.transport.subscribe(BgxCharacteristic::Mode))
        .await?;
    shared
        .op("subscribe tx", shared.transport.subscribe(BgxCharacteristic::Tx))
        .await?;

    let raw = shared
        .op(
            "read firmware revision",
            shared.transport.read(BgxCharacteristic::FirmwareRevision),
        )
        .await?;
    let firmware = FirmwareRevision::parse(&String::from_utf8_lossy(&raw))?;

    let device_id = shared
        .op("read device id", shared.transport.read(BgxCharacteristic::OtaDeviceId))
        .await?;
    let identity = DeviceIdentity::from_device_id(&shared.address, &shared.transport.name(), &device_id);

    Ok(Interrogated {
        identity,
        firmware,
        events,
    })
}

async fn interrogate(shared: Arc<Shared>, epoch: u64) {
    if !shared.transition(epoch, ConnectionState::Interrogating) {
        return;
    }

    let result = read_identity(&shared).await;
    if shared.is_stale(epoch) {
        return;
    }

    let done = match result {
        Ok(done) => done,
        Err(e) => {
            tlog!("[session] {} interrogation failed: {}", shared.address, e);
            match e {
                BgxError::InvalidGattHandles => shared.emit(BgxEvent::InvalidGattHandles {
                    address: shared.address.clone(),
                    name: shared.transport.name(),
                }),
                BgxError::Transport { code, .. } => shared.emit(BgxEvent::ConnectionError {
                    address: shared.address.clone(),
                    status_code: code,
                }),
                _ => shared.emit(BgxEvent::ConnectionError {
                    address: shared.address.clone(),
                    status_code: CODE_GENERIC,
                }),
            }
            if let Err(e) = shared.op("disconnect", shared.transport.disconnect()).await {
                tlog!("[session] {} disconnect after failed interrogation failed: {}", shared.address, e);
            }
            shared.transition(epoch, ConnectionState::Disconnected);
            return;
        }
    };

    tlog!(
        "[session] {} is {} ({:?}) running {}",
        shared.address,
        done.identity.part_identifier,
        done.identity.part_id,
        done.firmware.raw
    );

    {
        let mut st = shared.lock_state();
        if st.epoch != epoch {
            return;
        }
        shared.emit(device_info_event(&shared.address, &done.identity, &done.firmware));
        st.identity = Some(done.identity);
        st.firmware = Some(done.firmware);
        st.connection = ConnectionState::Connected;
        shared.emit_state(ConnectionState::Connected);
        st.connect_task = None;
        st.listener = Some(tokio::spawn(listen(shared.clone(), epoch, done.events)));
    }

    negotiate_mtu(&shared, epoch).await;
}

async fn negotiate_mtu(shared: &Shared, epoch: u64) {
    let requested = shared.config.requested_mtu;
    match shared
        .op("request mtu", shared.transport.request_mtu(requested))
        .await
    {
        Ok(mtu) => {
            let mut st = shared.lock_state();
            if st.epoch != epoch {
                return;
            }
            st.mtu = Some(mtu);
            tlog!("[session] {} MTU {}", shared.address, mtu);
            shared.emit(BgxEvent::MtuChanged {
                address: shared.address.clone(),
                mtu,
            });
        }
        Err(e) => {
            tlog!(
                "[session] {} MTU request failed ({}), using {} byte writes",
                shared.address,
                e,
                shared.config.default_write_chunk_size
            );
        }
    }
}

// ============================================================================
// Notifications and link loss
// ============================================================================

async fn listen(
    shared: Arc<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        if shared.is_stale(epoch) {
            break;
        }
        match event {
            TransportEvent::Notify {
                characteristic: BgxCharacteristic::Mode,
                value,
            } => crate::bus_mode::apply_mode_report(&shared, &value),
            TransportEvent::Notify {
                characteristic: BgxCharacteristic::Tx,
                value,
            } => shared.emit(BgxEvent::DataReceived {
                address: shared.address.clone(),
                bytes: value,
            }),
            TransportEvent::Notify { characteristic, .. } => {
                tlog!("[session] {} ignoring notify on {:?}", shared.address, characteristic);
            }
            TransportEvent::Disconnected { status } => {
                on_link_lost(&shared, epoch, status).await;
                break;
            }
        }
    }
}

async fn on_link_lost(shared: &Shared, epoch: u64, status: i32) {
    {
        let mut st = shared.lock_state();
        if st.epoch != epoch || st.connection != ConnectionState::Connected {
            return;
        }
        st.epoch += 1;
        // This task is the listener; it must not abort itself
        st.listener = None;
    }
    tlog!("[session] {} link lost (status {})", shared.address, status);
    crate::ota::fail_on_link_loss(shared).await;
    shared.reset_to_disconnected();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::credentials::MemoryCredentialGate;
    use crate::events::Subscription;
    use crate::transport::mock::MockTransport;

    pub(crate) fn test_config() -> BgxConfig {
        BgxConfig {
            ota_finish_settle_ms: 0,
            ..Default::default()
        }
    }

    pub(crate) fn new_session(
        mock: &Arc<MockTransport>,
        config: BgxConfig,
    ) -> (BgxSession, Subscription, Arc<MemoryCredentialGate>) {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let gate = Arc::new(MemoryCredentialGate::new());
        let session = BgxSession::new(mock.clone(), bus, gate.clone(), config).unwrap();
        (session, sub, gate)
    }

    /// Next event matching `pred`, skipping others. Panics after 5 s.
    pub(crate) async fn wait_for(
        sub: &mut Subscription,
        pred: impl Fn(&BgxEvent) -> bool,
    ) -> BgxEvent {
        let fut = async {
            loop {
                match sub.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event bus closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out waiting for event")
    }

    pub(crate) async fn wait_state(sub: &mut Subscription, state: ConnectionState) {
        wait_for(sub, |e| {
            matches!(e, BgxEvent::ConnectionStatusChanged { state: s, .. } if *s == state)
        })
        .await;
    }

    /// Connected session with the MTU already negotiated.
    pub(crate) async fn connected(
        mock: &Arc<MockTransport>,
        config: BgxConfig,
    ) -> (BgxSession, Subscription, Arc<MemoryCredentialGate>) {
        let (session, mut sub, gate) = new_session(mock, config);
        session.connect().unwrap();
        wait_for(&mut sub, |e| matches!(e, BgxEvent::MtuChanged { .. })).await;
        (session, sub, gate)
    }
}
