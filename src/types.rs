// Shared domain types: device identity, connection/bus-mode state and the
// OTA session bookkeeping.

use crate::error::BgxError;
use crate::version::FirmwareVersion;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Device identity
// ============================================================================

/// Known BGX module variants, identified by the first eight hex digits of
/// the OTA device-id characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BgxPart {
    Bgx13S,
    Bgx13P,
    BgxV3S,
    BgxV3P,
    Bgx220P,
    Bgx220S,
}

impl BgxPart {
    pub fn name(&self) -> &'static str {
        match self {
            BgxPart::Bgx13S => "BGX13S",
            BgxPart::Bgx13P => "BGX13P",
            BgxPart::BgxV3S => "BGXV3S",
            BgxPart::BgxV3P => "BGXV3P",
            BgxPart::Bgx220P => "BGX220P",
            BgxPart::Bgx220S => "BGX220S",
        }
    }

    /// Firmware platform family used by the catalog service.
    pub fn platform(&self) -> &'static str {
        match self {
            BgxPart::Bgx13S | BgxPart::Bgx13P | BgxPart::BgxV3S | BgxPart::BgxV3P => "bgx13",
            BgxPart::Bgx220P | BgxPart::Bgx220S => "bgx220",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "part")]
pub enum PartId {
    Known(BgxPart),
    /// The module reported the explicit "invalid" marker.
    Invalid,
    Unknown,
}

const PART_INVALID_PREFIX: &str = "BAD1DEAD";

const PART_PREFIXES: &[(&str, BgxPart)] = &[
    ("080447D0", BgxPart::Bgx13S),
    ("4C892A6A", BgxPart::Bgx13P),
    ("F65FD7F0", BgxPart::BgxV3S),
    ("76786556", BgxPart::BgxV3P),
    ("CF07449C", BgxPart::Bgx220P),
    ("9C1F257E", BgxPart::Bgx220S),
];

impl PartId {
    pub fn from_part_identifier(part_identifier: &str) -> Self {
        let ident = part_identifier.to_ascii_uppercase();
        if ident.starts_with(PART_INVALID_PREFIX) {
            return PartId::Invalid;
        }
        PART_PREFIXES
            .iter()
            .find(|(prefix, _)| ident.starts_with(prefix))
            .map(|(_, part)| PartId::Known(*part))
            .unwrap_or(PartId::Unknown)
    }
}

/// Identity of an interrogated peripheral. Built once interrogation
/// completes and not modified afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
    pub part_identifier: String,
    pub part_id: PartId,
    pub device_uuid: String,
}

impl DeviceIdentity {
    /// Build from the raw device-id characteristic value.
    pub fn from_device_id(address: &str, name: &str, raw: &[u8]) -> Self {
        let device_uuid = hex::encode_upper(raw);
        let part_identifier: String = device_uuid.chars().take(8).collect();
        let part_id = PartId::from_part_identifier(&part_identifier);
        Self {
            address: address.to_string(),
            name: name.to_string(),
            part_identifier,
            part_id,
            device_uuid,
        }
    }
}

/// Decoded firmware revision characteristic, e.g.
/// `BGX13P.1.2.2738.2-1495-2738`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FirmwareRevision {
    pub raw: String,
    /// Lowercase platform family, `bgx13` for `BGX13P`.
    pub platform: String,
    /// Everything after the platform prefix.
    pub revision: String,
    pub bootloader_version: Option<String>,
    /// Running version, when the revision carries a well-formed one.
    pub version: Option<FirmwareVersion>,
}

impl FirmwareRevision {
    /// Parse the revision string. A string that does not start with `BGX`
    /// means the host read through stale GATT handles.
    pub fn parse(raw: &str) -> Result<Self, BgxError> {
        let raw = raw.trim_end_matches('\0').trim();
        if !raw.starts_with("BGX") {
            return Err(BgxError::InvalidGattHandles);
        }

        let (prefix, revision) = raw
            .split_once('.')
            .ok_or_else(|| BgxError::Parse(format!("Firmware revision '{}' has no version", raw)))?;

        let mut platform = prefix.to_lowercase();
        platform.pop();

        let dash_pieces: Vec<&str> = raw.split('-').collect();
        let bootloader_version = if dash_pieces.len() == 3 {
            Some(dash_pieces[1].to_string())
        } else {
            None
        };

        let version = revision
            .split('-')
            .next()
            .and_then(|v| v.parse::<FirmwareVersion>().ok());

        Ok(Self {
            raw: raw.to_string(),
            platform,
            revision: revision.to_string(),
            bootloader_version,
            version,
        })
    }
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Interrogating,
    Connected,
    Disconnecting,
    ConnectionTimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum BusMode {
    Unknown,
    Stream,
    LocalCommand,
    RemoteCommand,
    Unsupported,
}

impl BusMode {
    /// Wire value of the mode characteristic. `Unsupported` has none.
    pub fn to_byte(self) -> Option<u8> {
        match self {
            BusMode::Unknown => Some(0),
            BusMode::Stream => Some(1),
            BusMode::LocalCommand => Some(2),
            BusMode::RemoteCommand => Some(3),
            BusMode::Unsupported => None,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => BusMode::Unknown,
            1 => BusMode::Stream,
            2 => BusMode::LocalCommand,
            3 => BusMode::RemoteCommand,
            _ => BusMode::Unsupported,
        }
    }
}

impl std::str::FromStr for BusMode {
    type Err = BgxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(BusMode::Stream),
            "local" | "local_command" | "command" => Ok(BusMode::LocalCommand),
            "remote" | "remote_command" => Ok(BusMode::RemoteCommand),
            _ => Err(BgxError::Parse(format!("Unknown bus mode '{}'", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum AckMode {
    Acknowledged,
    #[default]
    Unacknowledged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CredentialPurpose {
    BusModePassword,
    OtaPassword,
}

impl CredentialPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialPurpose::BusModePassword => "bus_mode_password",
            CredentialPurpose::OtaPassword => "ota_password",
        }
    }
}

// ============================================================================
// OTA
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OtaStep {
    NoOta,
    Init,
    Scan,
    Connect,
    FindServices,
    FindCharacteristics,
    UploadNoResponse,
    UploadWithResponse,
    UploadFinish,
    End,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OtaOperation {
    InProgress,
    Complete,
    NoOperationInProgress,
}

/// Coarse OTA status reported to consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OtaStatus {
    Idle,
    PasswordRequired,
    Downloading,
    Installing,
    Finishing,
    Finished,
    Failed,
    UserCanceled,
}

/// How the OTA engine obtained its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionSource {
    /// Rides on the live session link; Scan..FindCharacteristics are skipped.
    Reused,
    /// Engine bootstrapped its own transient link.
    OwnedByOta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum OtaFailureReason {
    Transport { code: i32, message: String },
    /// Peripheral refused a write at the protocol level.
    Nack,
    PasswordRejected,
    LinkLost,
    Timeout,
    Image(String),
}

impl fmt::Display for OtaFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaFailureReason::Transport { code, message } => {
                write!(f, "transport error {}: {}", code, message)
            }
            OtaFailureReason::Nack => write!(f, "write rejected by peripheral"),
            OtaFailureReason::PasswordRejected => write!(f, "password rejected"),
            OtaFailureReason::LinkLost => write!(f, "link lost"),
            OtaFailureReason::Timeout => write!(f, "timed out"),
            OtaFailureReason::Image(e) => write!(f, "image error: {}", e),
        }
    }
}

/// Firmware image to upload.
#[derive(Clone)]
pub enum ImageRef {
    File(PathBuf),
    Memory { name: String, bytes: Arc<Vec<u8>> },
}

impl ImageRef {
    pub fn load(&self) -> Result<Arc<Vec<u8>>, BgxError> {
        match self {
            ImageRef::File(path) => std::fs::read(path)
                .map(Arc::new)
                .map_err(|e| BgxError::Io(format!("Failed to read image {}: {}", path.display(), e))),
            ImageRef::Memory { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::File(path) => write!(f, "File({})", path.display()),
            ImageRef::Memory { name, bytes } => write!(f, "Memory({}, {} bytes)", name, bytes.len()),
        }
    }
}

/// Live state of one OTA transfer. At most one exists per session.
#[derive(Clone)]
pub struct OtaSession {
    pub step: OtaStep,
    pub operation: OtaOperation,
    pub bytes_sent: u32,
    pub total_bytes: u32,
    pub write_ack_mode: AckMode,
    pub image_ref: ImageRef,
    pub password: Option<String>,
    pub source: ConnectionSource,
    /// Hex SHA-256 of the image, logged for post-mortem comparison.
    pub image_sha256: String,
}

impl fmt::Debug for OtaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaSession")
            .field("step", &self.step)
            .field("operation", &self.operation)
            .field("bytes_sent", &self.bytes_sent)
            .field("total_bytes", &self.total_bytes)
            .field("write_ack_mode", &self.write_ack_mode)
            .field("image_ref", &self.image_ref)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_id_prefixes() {
        assert_eq!(PartId::from_part_identifier("4C892A6A"), PartId::Known(BgxPart::Bgx13P));
        assert_eq!(PartId::from_part_identifier("080447d0"), PartId::Known(BgxPart::Bgx13S));
        assert_eq!(PartId::from_part_identifier("CF07449C"), PartId::Known(BgxPart::Bgx220P));
        assert_eq!(PartId::from_part_identifier("BAD1DEAD"), PartId::Invalid);
        assert_eq!(PartId::from_part_identifier("01234567"), PartId::Unknown);
    }

    #[test]
    fn test_identity_from_device_id() {
        let raw = [0x4c, 0x89, 0x2a, 0x6a, 0x01, 0x02, 0x03, 0x04];
        let id = DeviceIdentity::from_device_id("AA:BB", "BGX-1234", &raw);
        assert_eq!(id.device_uuid, "4C892A6A01020304");
        assert_eq!(id.part_identifier, "4C892A6A");
        assert_eq!(id.part_id, PartId::Known(BgxPart::Bgx13P));
    }

    #[test]
    fn test_firmware_revision_full() {
        let rev = FirmwareRevision::parse("BGX13P.1.2.2738.2-1495-2738").unwrap();
        assert_eq!(rev.platform, "bgx13");
        assert_eq!(rev.revision, "1.2.2738.2-1495-2738");
        assert_eq!(rev.bootloader_version.as_deref(), Some("1495"));
        assert_eq!(rev.version, Some(FirmwareVersion::new(1, 2, 2738, 2)));
    }

    #[test]
    fn test_firmware_revision_without_bootloader() {
        let rev = FirmwareRevision::parse("BGX220S.1.2.1000.0\0").unwrap();
        assert_eq!(rev.platform, "bgx220");
        assert_eq!(rev.bootloader_version, None);
        assert_eq!(rev.version, Some(FirmwareVersion::new(1, 2, 1000, 0)));
    }

    #[test]
    fn test_firmware_revision_stale_handles() {
        assert_eq!(
            FirmwareRevision::parse("Silicon Labs"),
            Err(BgxError::InvalidGattHandles)
        );
    }

    #[test]
    fn test_bus_mode_bytes() {
        for mode in [BusMode::Unknown, BusMode::Stream, BusMode::LocalCommand, BusMode::RemoteCommand] {
            assert_eq!(BusMode::from_byte(mode.to_byte().unwrap()), mode);
        }
        assert_eq!(BusMode::from_byte(9), BusMode::Unsupported);
        assert_eq!(BusMode::Unsupported.to_byte(), None);
    }

    #[test]
    fn test_ota_session_debug_hides_password() {
        let session = OtaSession {
            step: OtaStep::Init,
            operation: OtaOperation::InProgress,
            bytes_sent: 0,
            total_bytes: 10,
            write_ack_mode: AckMode::Acknowledged,
            image_ref: ImageRef::Memory { name: "x".into(), bytes: Arc::new(vec![0; 10]) },
            password: Some("hunter2".into()),
            source: ConnectionSource::Reused,
            image_sha256: String::new(),
        };
        let dbg = format!("{:?}", session);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<set>"));
    }
}
