// Firmware version parsing and ordering.
//
// BGX firmware versions are four dot-separated decimal fields
// (major.minor.build.revision), e.g. "1.2.2045.0". Anything else is a
// parse error, never a silent default.

use crate::error::BgxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A four-part firmware version. Ordering is lexicographic over the fields
/// in declaration order, so `major` is most significant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    pub fn is_newer_than(&self, other: &FirmwareVersion) -> bool {
        self > other
    }
}

impl FromStr for FirmwareVersion {
    type Err = BgxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(BgxError::Parse(format!(
                "Invalid version string '{}': expected 4 fields, found {}",
                s,
                parts.len()
            )));
        }

        let mut fields = [0u32; 4];
        for (slot, part) in fields.iter_mut().zip(parts.iter()) {
            *slot = part.parse().map_err(|e| {
                BgxError::Parse(format!("Invalid version field '{}' in '{}': {}", part, s, e))
            })?;
        }

        Ok(Self::new(fields[0], fields[1], fields[2], fields[3]))
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = BgxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(value: FirmwareVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}
