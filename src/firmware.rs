// Firmware images
//
// Resolves a firmware source (catalog release or local files) into the flat
// binary the DFU transport streams. Intel HEX images are flattened first.

use crate::catalog::ReleaseEntry;
use crate::error::FirmwareError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Gap filler between HEX segments; matches erased flash.
const ERASED_BYTE: u8 = 0xFF;

/// Start of the FICR/UICR register space. Records at or above it configure
/// the chip and are never part of the application image.
const NON_FLASH_START: u32 = 0x1000_0000;

/// Largest flattened image accepted; the biggest part carries 1 MiB of flash.
pub const MAX_IMAGE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    Release(ReleaseEntry),
    Local {
        image: PathBuf,
        init: Option<PathBuf>,
    },
}

impl FirmwareSource {
    pub fn release(&self) -> Option<&ReleaseEntry> {
        match self {
            FirmwareSource::Release(release) => Some(release),
            FirmwareSource::Local { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FirmwareSource::Release(release) => {
                format!("{} {}", release.board_name, release.version)
            }
            FirmwareSource::Local { image, .. } => image.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub data: Vec<u8>,
    /// Init packet (`.dat`), when the source provides one.
    pub init_data: Option<Vec<u8>>,
    /// Lowercase hex SHA-256 of `data`.
    pub sha256: String,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>, init_data: Option<Vec<u8>>) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::Empty);
        }
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let sha256 = hex::encode(hasher.finalize());
        Ok(Self {
            data,
            init_data,
            sha256,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, source: &FirmwareSource) -> Result<FirmwareImage, FirmwareError>;
}

/// Reads local files with tokio and downloads release URLs with reqwest.
#[derive(Clone, Default)]
pub struct DefaultImageLoader {
    client: reqwest::Client,
}

impl DefaultImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FirmwareError> {
        let download_error = |message: String| FirmwareError::Download {
            url: url.to_string(),
            message,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_error(format!("status {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        tracing::debug!("[firmware] Downloaded {} ({} bytes)", url, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>, FirmwareError> {
        tokio::fs::read(path).await.map_err(|source| FirmwareError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl ImageLoader for DefaultImageLoader {
    async fn load(&self, source: &FirmwareSource) -> Result<FirmwareImage, FirmwareError> {
        let (raw, is_hex, init_data) = match source {
            FirmwareSource::Release(release) => {
                let raw = self.download(&release.image_url).await?;
                let init_data = match &release.init_url {
                    Some(url) => Some(self.download(url).await?),
                    None => None,
                };
                (raw, is_hex_name(&release.image_url), init_data)
            }
            FirmwareSource::Local { image, init } => {
                let raw = self.read_file(image).await?;
                let init_data = match init {
                    Some(path) => Some(self.read_file(path).await?),
                    None => None,
                };
                (raw, is_hex_name(&image.to_string_lossy()), init_data)
            }
        };

        let data = if is_hex {
            let text = String::from_utf8(raw)
                .map_err(|_| FirmwareError::InvalidHex("not ASCII text".to_string()))?;
            hex_to_binary(&text)?
        } else {
            raw
        };

        let image = FirmwareImage::new(data, init_data)?;
        tracing::info!(
            "[firmware] Loaded {} ({} bytes, sha256 {})",
            source.describe(),
            image.len(),
            image.sha256
        );
        Ok(image)
    }
}

fn is_hex_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".hex")
}

/// Flatten an Intel HEX image into a contiguous binary starting at its lowest
/// data address. Gaps are filled with erased flash bytes. Records in the
/// UICR/FICR space are dropped.
pub fn hex_to_binary(text: &str) -> Result<Vec<u8>, FirmwareError> {
    let mut segments: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut base: u32 = 0;

    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| FirmwareError::InvalidHex(e.to_string()))?;
        match record {
            ihex::Record::Data { offset, value } => {
                let address = base
                    .checked_add(offset as u32)
                    .filter(|a| a.checked_add(value.len() as u32).is_some())
                    .ok_or_else(|| {
                        FirmwareError::InvalidHex(format!(
                            "record at {:#x}+{:#x} runs past the address space",
                            base, offset
                        ))
                    })?;
                if address >= NON_FLASH_START {
                    tracing::debug!("[firmware] Skipping {} bytes at {:#x}", value.len(), address);
                    continue;
                }
                segments.insert(address, value);
            }
            ihex::Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            ihex::Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            ihex::Record::EndOfFile => break,
            _ => {}
        }
    }

    let (start, end) = match (segments.keys().next(), segments.iter().next_back()) {
        (Some(&start), Some((&last, data))) => (start, last as usize + data.len()),
        _ => return Err(FirmwareError::Empty),
    };

    let len = end - start as usize;
    if len > MAX_IMAGE_LEN {
        return Err(FirmwareError::InvalidHex(format!(
            "image spans {} bytes, more than the {} byte limit",
            len, MAX_IMAGE_LEN
        )));
    }

    let mut binary = vec![ERASED_BYTE; len];
    for (address, data) in segments {
        let at = (address - start) as usize;
        binary[at..at + data.len()].copy_from_slice(&data);
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_binary_contiguous() {
        let text = ":0400000001020304F2\n:00000001FF\n";
        assert_eq!(hex_to_binary(text).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_hex_to_binary_fills_gaps_and_extended_address() {
        let text = "\
:020000040001F9
:0200000011AA43
:020004002233A5
:00000001FF
";
        let binary = hex_to_binary(text).unwrap();
        assert_eq!(binary, vec![0x11, 0xAA, 0xFF, 0xFF, 0x22, 0x33]);
    }

    #[test]
    fn test_hex_to_binary_rejects_bad_checksum() {
        assert!(matches!(
            hex_to_binary(":0400000001020304F3\n"),
            Err(FirmwareError::InvalidHex(_))
        ));
        assert!(matches!(
            hex_to_binary(":00000001FF\n"),
            Err(FirmwareError::Empty)
        ));
    }

    #[test]
    fn test_hex_to_binary_rejects_address_overflow() {
        let text = "\
:02000004FFFFFC
:10FFF80000000000000000000000000000000000F9
:00000001FF
";
        assert!(matches!(
            hex_to_binary(text),
            Err(FirmwareError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_hex_to_binary_drops_uicr_records() {
        let text = "\
:0400000001020304F2
:020000041000EA
:04101400AABBCCDDCA
:00000001FF
";
        assert_eq!(hex_to_binary(text).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_hex_to_binary_caps_flattened_size() {
        let text = "\
:0400000001020304F2
:020000040FFFEC
:0400000001020304F2
:00000001FF
";
        assert!(matches!(
            hex_to_binary(text),
            Err(FirmwareError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_image_digest() {
        let image = FirmwareImage::new(b"abc".to_vec(), None).unwrap();
        assert_eq!(
            image.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(
            FirmwareImage::new(Vec::new(), None),
            Err(FirmwareError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_load_local_binary_and_missing_file() {
        let dir = std::env::temp_dir().join(format!("bluefruit-fw-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bin = dir.join("app.bin");
        std::fs::write(&bin, [9u8, 8, 7]).unwrap();

        let loader = DefaultImageLoader::new();
        let image = loader
            .load(&FirmwareSource::Local {
                image: bin.clone(),
                init: None,
            })
            .await
            .unwrap();
        assert_eq!(image.data, vec![9, 8, 7]);
        assert!(image.init_data.is_none());

        let missing = loader
            .load(&FirmwareSource::Local {
                image: dir.join("nope.hex"),
                init: None,
            })
            .await;
        assert!(matches!(missing, Err(FirmwareError::Read { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
