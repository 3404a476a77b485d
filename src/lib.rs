#[macro_use]
pub mod logging;

pub mod ble;
pub mod bus_mode;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod firmware;
pub mod manager;
pub mod ota;
pub mod session;
pub mod transport;
pub mod types;
pub mod version;

pub use ble::BleCentral;
pub use config::BgxConfig;
pub use credentials::{CredentialGate, KeyringCredentialGate, MemoryCredentialGate};
pub use error::BgxError;
pub use events::{BgxEvent, EventBus, Subscription};
pub use firmware::{DmsCatalog, FirmwareCatalog, FirmwareCatalogEntry};
pub use manager::{BgxManager, Command};
pub use ota::OtaRequest;
pub use session::BgxSession;
pub use transport::{BgxCentral, BgxTransport, TransportError};
pub use types::{
    AckMode, BusMode, ConnectionState, DeviceIdentity, FirmwareRevision, ImageRef, OtaStatus,
};
pub use version::FirmwareVersion;
