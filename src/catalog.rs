// Firmware catalog resolver
//
// Looks up the releases published for a board model and answers the two
// bootloader questions asked before an update. The catalog is fetched from
// the update server; any failure there degrades to "no releases known".

use crate::device_info::{DeviceInfo, DEFAULT_BOOTLOADER_VERSION};
use crate::error::CatalogError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

// ============================================================================
// Types
// ============================================================================

/// One firmware image available for a board model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub version: String,
    #[serde(default)]
    pub is_beta: bool,
    pub min_bootloader_version: String,
    pub board_name: String,
    pub image_url: String,
    #[serde(default)]
    pub init_url: Option<String>,
}

/// Releases for one board model, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCatalog {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub firmware: Vec<ReleaseEntry>,
}

/// Board model identifier -> releases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCatalog {
    #[serde(default)]
    pub boards: HashMap<String, BoardCatalog>,
}

impl ReleaseCatalog {
    pub fn parse(json: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub update_available: bool,
    pub latest_release: Option<ReleaseEntry>,
    pub board_catalog: Option<BoardCatalog>,
}

// ============================================================================
// Catalog sources
// ============================================================================

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self) -> Result<ReleaseCatalog, CatalogError>;
}

/// Fetches the catalog JSON from the configured update server.
pub struct HttpCatalogSource {
    url: Option<String>,
    client: reqwest::Client,
}

impl HttpCatalogSource {
    pub fn new(url: Option<String>) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .user_agent("Bluefruit-Connect")
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<ReleaseCatalog, CatalogError> {
        let url = self.url.as_deref().ok_or(CatalogError::NotConfigured)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }
        let body = response.text().await?;
        ReleaseCatalog::parse(&body)
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct CatalogResolver<S: CatalogSource> {
    source: S,
    show_beta_versions: bool,
}

impl<S: CatalogSource> CatalogResolver<S> {
    pub fn new(source: S, show_beta_versions: bool) -> Self {
        Self {
            source,
            show_beta_versions,
        }
    }

    /// Look up the releases for the device's board model. The latest release
    /// is the first non-beta entry (or first entry when betas are shown).
    /// Whether it is actually newer than what the device runs is the
    /// caller's call, see [`is_newer_version`].
    pub async fn check_updates(&self, info: &DeviceInfo) -> UpdateCheck {
        let catalog = match self.source.fetch().await {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!("[catalog] No release information available: {}", e);
                return UpdateCheck::default();
            }
        };

        let board = match info
            .model_number
            .as_ref()
            .and_then(|model| catalog.boards.get(model))
        {
            Some(board) => board.clone(),
            None => {
                tracing::info!(
                    "[catalog] No releases found for board {:?}",
                    info.model_number
                );
                return UpdateCheck::default();
            }
        };

        let latest_release = board
            .firmware
            .iter()
            .find(|release| self.show_beta_versions || !release.is_beta)
            .cloned();

        UpdateCheck {
            update_available: latest_release.is_some(),
            latest_release,
            board_catalog: Some(board),
        }
    }
}

/// Compatible iff the device bootloader is at least the release minimum.
///
/// Case-insensitive lexicographic comparison, not version-aware: `"10"`
/// sorts before `"9"`.
pub fn is_compatible(info: &DeviceInfo, release: &ReleaseEntry) -> bool {
    let found = info.bootloader_version.to_lowercase();
    let required = release.min_bootloader_version.to_lowercase();
    found.cmp(&required) != Ordering::Less
}

/// Factory bootloaders cannot be updated through this path at all.
pub fn has_legacy_bootloader(info: &DeviceInfo) -> bool {
    info.bootloader_version == DEFAULT_BOOTLOADER_VERSION
}

fn parse_version(version: &str) -> Option<Vec<u32>> {
    let v = version.trim().trim_start_matches('v');
    let parts: Option<Vec<u32>> = v.split('.').map(|p| p.parse().ok()).collect();
    parts.filter(|p| !p.is_empty())
}

/// Numeric dotted comparison: true when `candidate` is newer than `current`.
/// Unparseable versions are never considered newer.
pub fn is_newer_version(current: &str, candidate: &str) -> bool {
    match (parse_version(current), parse_version(candidate)) {
        (Some(c), Some(l)) => l > c,
        _ => false,
    }
}
