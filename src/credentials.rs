//! Credential gate: passwords keyed by (purpose, device address).
//!
//! The production gate uses the native OS credential store:
//! - macOS: Keychain
//! - Windows: Credential Manager
//! - Linux: Secret Service (GNOME Keyring, KWallet)
//!
//! Lookups are exact-match and case-sensitive on both parts of the key, so a
//! password stored for one device is never handed to another.

use crate::error::BgxError;
use crate::types::CredentialPurpose;
use keyring::Entry;
use std::collections::HashMap;
use std::sync::RwLock;

const SERVICE_NAME: &str = "com.silabs.bgx-commander";

/// Builds the keyring account name for a device credential.
fn account_name(purpose: CredentialPurpose, address: &str) -> String {
    format!("{}:{}", purpose.as_str(), address)
}

pub trait CredentialGate: Send + Sync {
    /// Stored password, or `Ok(None)` when nothing is stored.
    fn retrieve(&self, purpose: CredentialPurpose, address: &str) -> Result<Option<String>, BgxError>;
    fn store(&self, purpose: CredentialPurpose, address: &str, password: &str) -> Result<(), BgxError>;
    /// Remove a stored password. Succeeds when nothing was stored.
    fn forget(&self, purpose: CredentialPurpose, address: &str) -> Result<(), BgxError>;
}

/// System keyring backed gate.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyringCredentialGate;

impl KeyringCredentialGate {
    fn entry(purpose: CredentialPurpose, address: &str) -> Result<Entry, BgxError> {
        Entry::new(SERVICE_NAME, &account_name(purpose, address))
            .map_err(|e| BgxError::Credential(format!("Failed to create keyring entry: {e}")))
    }
}

impl CredentialGate for KeyringCredentialGate {
    fn retrieve(&self, purpose: CredentialPurpose, address: &str) -> Result<Option<String>, BgxError> {
        match Self::entry(purpose, address)?.get_password() {
            Ok(pw) => Ok(Some(pw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(BgxError::Credential(format!("Failed to retrieve credential: {e}"))),
        }
    }

    fn store(&self, purpose: CredentialPurpose, address: &str, password: &str) -> Result<(), BgxError> {
        Self::entry(purpose, address)?
            .set_password(password)
            .map_err(|e| BgxError::Credential(format!("Failed to store credential: {e}")))?;
        tlog!("[credentials] Stored {} for {}", purpose.as_str(), address);
        Ok(())
    }

    fn forget(&self, purpose: CredentialPurpose, address: &str) -> Result<(), BgxError> {
        match Self::entry(purpose, address)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already gone, that's fine
            Err(e) => Err(BgxError::Credential(format!("Failed to delete credential: {e}"))),
        }
    }
}

/// Process-local gate. Used by tests and by hosts without a keyring.
#[derive(Debug, Default)]
pub struct MemoryCredentialGate {
    entries: RwLock<HashMap<(CredentialPurpose, String), String>>,
}

impl MemoryCredentialGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialGate for MemoryCredentialGate {
    fn retrieve(&self, purpose: CredentialPurpose, address: &str) -> Result<Option<String>, BgxError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| BgxError::Credential("credential map poisoned".into()))?;
        Ok(entries.get(&(purpose, address.to_string())).cloned())
    }

    fn store(&self, purpose: CredentialPurpose, address: &str, password: &str) -> Result<(), BgxError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BgxError::Credential("credential map poisoned".into()))?;
        entries.insert((purpose, address.to_string()), password.to_string());
        Ok(())
    }

    fn forget(&self, purpose: CredentialPurpose, address: &str) -> Result<(), BgxError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BgxError::Credential("credential map poisoned".into()))?;
        entries.remove(&(purpose, address.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_name() {
        assert_eq!(
            account_name(CredentialPurpose::OtaPassword, "AA:BB:CC:DD:EE:FF"),
            "ota_password:AA:BB:CC:DD:EE:FF"
        );
    }

    #[test]
    fn test_exact_match_per_device_and_purpose() {
        let gate = MemoryCredentialGate::new();
        gate.store(CredentialPurpose::OtaPassword, "dev-a", "secret").unwrap();

        assert_eq!(
            gate.retrieve(CredentialPurpose::OtaPassword, "dev-a").unwrap().as_deref(),
            Some("secret")
        );
        assert_eq!(gate.retrieve(CredentialPurpose::OtaPassword, "dev-b").unwrap(), None);
        assert_eq!(gate.retrieve(CredentialPurpose::BusModePassword, "dev-a").unwrap(), None);
        assert_eq!(gate.retrieve(CredentialPurpose::OtaPassword, "DEV-A").unwrap(), None);
    }

    #[test]
    fn test_forget_is_idempotent() {
        let gate = MemoryCredentialGate::new();
        gate.store(CredentialPurpose::BusModePassword, "dev-a", "pw").unwrap();
        gate.forget(CredentialPurpose::BusModePassword, "dev-a").unwrap();
        gate.forget(CredentialPurpose::BusModePassword, "dev-a").unwrap();
        assert_eq!(gate.retrieve(CredentialPurpose::BusModePassword, "dev-a").unwrap(), None);
    }
}
