// Firmware catalog (DMS) client and image cache.
//
// The catalog service lists released images per part/platform. Records that
// fail to parse are skipped individually; one bad record never discards the
// rest of the catalog.

use crate::config::BgxConfig;
use crate::error::BgxError;
use crate::types::{ImageRef, PartId};
use crate::version::FirmwareVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareCatalogEntry {
    pub version: FirmwareVersion,
    pub description: String,
    pub size_bytes: u32,
    /// Opaque image handle reported by the catalog.
    pub image_ref: String,
}

#[derive(Deserialize)]
struct DmsRecord {
    version: String,
    #[serde(default)]
    description: String,
    size: u32,
    #[serde(default)]
    file: Option<String>,
}

/// Parse a DMS versions response, newest first.
pub fn parse_catalog(json: &str) -> Result<Vec<FirmwareCatalogEntry>, BgxError> {
    let records: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| BgxError::Catalog(format!("Versions response is not a JSON array: {}", e)))?;

    let mut entries = Vec::with_capacity(records.len());
    for (index, value) in records.into_iter().enumerate() {
        match parse_record(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => tlog!("[firmware] Skipping catalog record {}: {}", index, e),
        }
    }

    sort_newest_first(&mut entries);
    Ok(entries)
}

fn parse_record(value: serde_json::Value) -> Result<FirmwareCatalogEntry, BgxError> {
    let record: DmsRecord =
        serde_json::from_value(value).map_err(|e| BgxError::Parse(format!("Malformed record: {}", e)))?;
    let version: FirmwareVersion = record.version.parse()?;
    Ok(FirmwareCatalogEntry {
        image_ref: record.file.unwrap_or_else(|| record.version.clone()),
        version,
        description: record.description,
        size_bytes: record.size,
    })
}

pub fn sort_newest_first(entries: &mut [FirmwareCatalogEntry]) {
    entries.sort_by(|a, b| b.version.cmp(&a.version));
}

/// Entries strictly newer than the running firmware.
pub fn updates_available(
    catalog: &[FirmwareCatalogEntry],
    current: &FirmwareVersion,
) -> Vec<FirmwareCatalogEntry> {
    catalog
        .iter()
        .filter(|e| e.version.is_newer_than(current))
        .cloned()
        .collect()
}

/// Platform family for a part identifier, when it names a known module.
pub fn infer_platform(part_identifier: &str) -> Option<&'static str> {
    match PartId::from_part_identifier(part_identifier) {
        PartId::Known(part) => Some(part.platform()),
        PartId::Invalid | PartId::Unknown => None,
    }
}

#[async_trait]
pub trait FirmwareCatalog: Send + Sync {
    async fn versions(
        &self,
        part_identifier: &str,
        platform: Option<&str>,
    ) -> Result<Vec<FirmwareCatalogEntry>, BgxError>;

    /// Fetch an image into local storage.
    async fn download(
        &self,
        part_identifier: &str,
        platform: Option<&str>,
        version: &FirmwareVersion,
    ) -> Result<ImageRef, BgxError>;
}

/// HTTP client for the hosted DMS catalog.
pub struct DmsCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache_dir: PathBuf,
}

impl DmsCatalog {
    pub fn new(config: &BgxConfig) -> Result<Self, BgxError> {
        let client = reqwest::Client::builder()
            .user_agent("BGX-Commander")
            .build()
            .map_err(|e| BgxError::Catalog(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.dms_base_url.trim_end_matches('/').to_string(),
            api_key: config.dms_api_key.clone(),
            cache_dir: config.firmware_cache_dir(),
        })
    }

    fn versions_url(&self, part_identifier: &str, platform: &str) -> String {
        format!(
            "{}/platforms/{}/products/{}/versions",
            self.base_url, part_identifier, platform
        )
    }

    fn resolve_platform<'a>(part_identifier: &str, platform: Option<&'a str>) -> Result<&'a str, BgxError> {
        match platform {
            Some(p) => Ok(p),
            None => infer_platform(part_identifier).ok_or_else(|| {
                BgxError::Catalog(format!("Unable to determine BGX platform for part {}", part_identifier))
            }),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, BgxError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BgxError::Catalog(format!("Request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(BgxError::Catalog(format!("DMS returned status: {}", response.status())));
        }
        Ok(response)
    }

    fn cache_path(&self, part_identifier: &str, version: &FirmwareVersion) -> PathBuf {
        self.cache_dir.join(part_identifier).join(version.to_string())
    }
}

#[async_trait]
impl FirmwareCatalog for DmsCatalog {
    async fn versions(
        &self,
        part_identifier: &str,
        platform: Option<&str>,
    ) -> Result<Vec<FirmwareCatalogEntry>, BgxError> {
        let platform = Self::resolve_platform(part_identifier, platform)?;
        let url = self.versions_url(part_identifier, platform);
        tlog!("[firmware] Fetching versions for {} ({})", part_identifier, platform);

        let body = self
            .get(&url)
            .await?
            .text()
            .await
            .map_err(|e| BgxError::Catalog(format!("Failed to read versions response: {}", e)))?;

        let catalog = parse_catalog(&body)?;
        tlog!("[firmware] {} version(s) available for {}", catalog.len(), part_identifier);
        Ok(catalog)
    }

    async fn download(
        &self,
        part_identifier: &str,
        platform: Option<&str>,
        version: &FirmwareVersion,
    ) -> Result<ImageRef, BgxError> {
        let path = self.cache_path(part_identifier, version);
        if path.exists() {
            tlog!("[firmware] Using cached image {}", path.display());
            return Ok(ImageRef::File(path));
        }

        let platform = Self::resolve_platform(part_identifier, platform)?;
        let url = format!("{}/{}", self.versions_url(part_identifier, platform), version);
        let bytes = self
            .get(&url)
            .await?
            .bytes()
            .await
            .map_err(|e| BgxError::Catalog(format!("Failed to download image: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so an interrupted download never looks cached
        let partial = path.with_file_name(format!("{}.part", version));
        std::fs::write(&partial, &bytes)?;
        std::fs::rename(&partial, &path)?;

        let digest = hex::encode(Sha256::digest(&bytes));
        tlog!(
            "[firmware] Downloaded {} ({} bytes, sha256 {})",
            path.display(),
            bytes.len(),
            digest
        );
        Ok(ImageRef::File(path))
    }
}
