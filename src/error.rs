// Error taxonomy for the BGX session core.
//
// Immediate rejections (NotReady, Busy, ...) are returned from the session
// API. Everything that happens after a radio round trip is reported as a
// typed event instead; see events.rs.

use crate::transport::TransportError;
use crate::types::{ConnectionState, OtaFailureReason, OtaStep};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BgxError {
    /// Radio/link failure reported by the transport.
    #[error("Transport error {code}: {message}")]
    Transport { code: i32, message: String },

    /// The peripheral's bonding state does not match the host's cached GATT
    /// handles. The pairing must be removed at the OS level before retrying.
    #[error("Invalid GATT handles, remove the device pairing and retry")]
    InvalidGattHandles,

    #[error("A password is required")]
    PasswordRequired,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Another operation is already in progress")]
    Busy,

    #[error("Session is not connected (state: {0:?})")]
    NotReady(ConnectionState),

    #[error("OTA failed during {step:?}: {reason}")]
    OtaFailed {
        step: OtaStep,
        reason: OtaFailureReason,
    },

    #[error("Canceled by user")]
    UserCanceled,

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("Firmware catalog error: {0}")]
    Catalog(String),
}

impl From<TransportError> for BgxError {
    fn from(e: TransportError) -> Self {
        BgxError::Transport {
            code: e.code,
            message: e.message,
        }
    }
}

impl From<std::io::Error> for BgxError {
    fn from(e: std::io::Error) -> Self {
        BgxError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        let err: BgxError = TransportError::new(133, "GATT_ERROR").into();
        assert_eq!(
            err,
            BgxError::Transport {
                code: 133,
                message: "GATT_ERROR".to_string()
            }
        );
        assert_eq!(err.to_string(), "Transport error 133: GATT_ERROR");
    }

    #[test]
    fn test_ota_failed_message_names_step() {
        let err = BgxError::OtaFailed {
            step: OtaStep::UploadFinish,
            reason: OtaFailureReason::Nack,
        };
        assert!(err.to_string().contains("UploadFinish"));
    }
}
