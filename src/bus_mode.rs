// Bus mode negotiation
//
// The mode characteristic holds one byte. Writing remote command mode may
// carry a password: `[mode, password bytes..., 0x00]`. The peripheral answers
// a refused write with a non-success status; the mode is then forced to
// Stream locally (the one mode that never needs credentials) and only
// `BusModeErrorPasswordRequired` is emitted.

use crate::error::BgxError;
use crate::events::BgxEvent;
use crate::session::{BgxSession, Shared};
use crate::transport::BgxCharacteristic;
use crate::types::{AckMode, BusMode, CredentialPurpose};

/// Payload for a mode write.
pub fn encode_mode_write(mode: BusMode, password: Option<&str>) -> Result<Vec<u8>, BgxError> {
    let byte = match mode {
        BusMode::Stream | BusMode::LocalCommand | BusMode::RemoteCommand => mode.to_byte(),
        BusMode::Unknown | BusMode::Unsupported => None,
    }
    .ok_or_else(|| BgxError::Parse(format!("Bus mode {:?} cannot be written", mode)))?;

    let mut payload = vec![byte];
    if mode == BusMode::RemoteCommand {
        if let Some(pw) = password.filter(|pw| !pw.is_empty()) {
            payload.extend_from_slice(pw.as_bytes());
            payload.push(0);
        }
    }
    Ok(payload)
}

/// Apply a read response or mode notification.
pub(crate) fn apply_mode_report(shared: &Shared, value: &[u8]) {
    match value.first() {
        Some(byte) => {
            let mode = BusMode::from_byte(*byte);
            tlog!("[bus_mode] {} reports {:?}", shared.address, mode);
            shared.set_bus_mode(mode, true);
        }
        None => tlog!("[bus_mode] {} sent an empty mode report", shared.address),
    }
}

impl BgxSession {
    pub async fn read_bus_mode(&self) -> Result<BusMode, BgxError> {
        self.require_connected()?;
        let value = self
            .shared
            .op("read bus mode", self.shared.transport.read(BgxCharacteristic::Mode))
            .await?;
        if value.is_empty() {
            return Err(BgxError::Parse("Empty bus mode response".into()));
        }
        apply_mode_report(&self.shared, &value);
        Ok(self.bus_mode())
    }

    /// Request a new bus mode. Without an explicit password the stored
    /// bus-mode password for this device is used, if any. A password the
    /// peripheral accepts is stored for next time.
    pub async fn write_bus_mode(&self, mode: BusMode, password: Option<String>) -> Result<(), BgxError> {
        self.require_connected()?;

        let supplied = password.filter(|pw| !pw.is_empty());
        let from_caller = supplied.is_some();
        let password = match supplied {
            Some(pw) => Some(pw),
            None => self
                .shared
                .credentials
                .retrieve(CredentialPurpose::BusModePassword, self.address())
                .unwrap_or_else(|e| {
                    tlog!("[bus_mode] Credential lookup failed: {}", e);
                    None
                }),
        };

        let payload = encode_mode_write(mode, password.as_deref())?;
        tlog!(
            "[bus_mode] {} writing {:?} (password {})",
            self.address(),
            mode,
            if password.is_some() { "present" } else { "absent" }
        );

        let result = self
            .shared
            .op(
                "write bus mode",
                self.shared
                    .transport
                    .write(BgxCharacteristic::Mode, &payload, AckMode::Acknowledged),
            )
            .await;

        match result {
            Ok(()) => {
                self.shared.set_bus_mode(mode, true);
                if let (true, Some(pw)) = (from_caller, password.as_deref()) {
                    if let Err(e) = self.shared.credentials.store(
                        CredentialPurpose::BusModePassword,
                        self.address(),
                        pw,
                    ) {
                        tlog!("[bus_mode] Failed to store password: {}", e);
                    }
                }
                Ok(())
            }
            // Negative codes are local failures (timeout, missing
            // characteristic); any peripheral status means a refused write.
            Err(e) if e.code < 0 => Err(e.into()),
            Err(e) => {
                tlog!("[bus_mode] {} refused {:?}: {}", self.address(), mode, e);
                self.shared.set_bus_mode(BusMode::Stream, false);
                self.shared.emit(BgxEvent::BusModeErrorPasswordRequired {
                    address: self.address().to_string(),
                });
                Ok(())
            }
        }
    }
}
