// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Firmware releases and flashing seams.
//!
//! Fetching the manifest and writing flash are left to implementations of
//! [`ManifestSource`] and [`FirmwareFlasher`]; this module selects usable
//! releases and lays out the images.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{ClientError, Result};

pub const BOOTLOADER_FILE: &str = "bootloader-esp32s3.bin";
pub const PARTITION_TABLE_FILE: &str = "partition-table-esp32s3.bin";
pub const FIRMWARE_FILE: &str = "firmware-esp32s3.bin";

/// Files every flashable release must ship.
pub const REQUIRED_FILES: [&str; 3] = [BOOTLOADER_FILE, PARTITION_TABLE_FILE, FIRMWARE_FILE];

pub const BOOTLOADER_OFFSET: u32 = 0x0;
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
pub const FIRMWARE_OFFSET: u32 = 0x20000;

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag: String,
    pub url: String,
    /// File name to path relative to `url`.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Release {
    /// Tagged as a version and ships every required image.
    pub fn is_flashable(&self) -> bool {
        self.tag.starts_with('v') && REQUIRED_FILES.iter().all(|f| self.files.contains_key(*f))
    }

    /// Absolute location of `file`, if the release ships it.
    pub fn file_url(&self, file: &str) -> Option<String> {
        let path = self.files.get(file)?;
        Some(format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

/// Decode a manifest and keep the flashable releases, in manifest order.
pub fn parse_manifest(json: &str) -> Result<Vec<Release>> {
    let releases: Vec<Release> = serde_json::from_str(json)
        .map_err(|e| ClientError::Protocol(format!("invalid release manifest: {}", e)))?;
    let total = releases.len();
    let usable: Vec<Release> = releases.into_iter().filter(Release::is_flashable).collect();
    debug!("{} of {} releases are flashable", usable.len(), total);
    Ok(usable)
}

/// Where the manifest JSON comes from.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Manifest stored on disk.
#[derive(Debug, Clone)]
pub struct FileManifest(pub PathBuf);

#[async_trait]
impl ManifestSource for FileManifest {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.0)
            .await
            .map_err(|e| ClientError::Firmware(format!("{}: {}", self.0.display(), e)))
    }
}

/// Fetch and filter the manifest.
pub async fn available_releases(source: &dyn ManifestSource) -> Result<Vec<Release>> {
    let json = source.fetch().await?;
    parse_manifest(&json)
}

/// One image and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    pub name: &'static str,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// The three images of a release, in flashing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPlan {
    images: Vec<FlashImage>,
}

impl FlashPlan {
    pub fn new(bootloader: Vec<u8>, partition_table: Vec<u8>, firmware: Vec<u8>) -> Result<Self> {
        let images = vec![
            FlashImage {
                name: BOOTLOADER_FILE,
                offset: BOOTLOADER_OFFSET,
                data: bootloader,
            },
            FlashImage {
                name: PARTITION_TABLE_FILE,
                offset: PARTITION_TABLE_OFFSET,
                data: partition_table,
            },
            FlashImage {
                name: FIRMWARE_FILE,
                offset: FIRMWARE_OFFSET,
                data: firmware,
            },
        ];
        if let Some(empty) = images.iter().find(|i| i.data.is_empty()) {
            return Err(ClientError::Firmware(format!("{} is empty", empty.name)));
        }
        Ok(Self { images })
    }

    /// Build a plan from `files` keyed by required file name.
    pub fn from_files(mut files: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let mut take = |name: &str| {
            files
                .remove(name)
                .ok_or_else(|| ClientError::Firmware(format!("missing {}", name)))
        };
        let bootloader = take(BOOTLOADER_FILE)?;
        let partition_table = take(PARTITION_TABLE_FILE)?;
        let firmware = take(FIRMWARE_FILE)?;
        Self::new(bootloader, partition_table, firmware)
    }

    pub fn images(&self) -> &[FlashImage] {
        &self.images
    }

    pub fn total_bytes(&self) -> usize {
        self.images.iter().map(|i| i.data.len()).sum()
    }
}

/// Per-file flashing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    /// Index of the image in the plan.
    pub index: usize,
    pub bytes_written: usize,
    pub total_bytes: usize,
}

pub type ProgressCallback<'a> = dyn FnMut(FlashProgress) + Send + 'a;

/// Writes images to the device's flash.
#[async_trait]
pub trait FirmwareFlasher: Send {
    async fn flash(&mut self, plan: &FlashPlan, progress: &mut ProgressCallback<'_>) -> Result<()>;
}

/// Flash `plan`, logging per-image completion.
pub async fn flash(flasher: &mut dyn FirmwareFlasher, plan: &FlashPlan) -> Result<()> {
    info!(
        "Flashing {} images ({} bytes)",
        plan.images().len(),
        plan.total_bytes()
    );
    let names: Vec<&'static str> = plan.images().iter().map(|i| i.name).collect();
    let mut report = |p: FlashProgress| {
        if p.bytes_written == p.total_bytes {
            info!(
                "{} written ({} bytes)",
                names.get(p.index).copied().unwrap_or("image"),
                p.total_bytes
            );
        }
    };
    flasher.flash(plan, &mut report).await?;
    info!("Flashing complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"[
        {"tag":"v1.2.0","url":"https://example.invalid/releases/v1.2.0/",
         "files":{"bootloader-esp32s3.bin":"bootloader.bin",
                  "partition-table-esp32s3.bin":"partitions.bin",
                  "firmware-esp32s3.bin":"/fw.bin"}},
        {"tag":"nightly","url":"https://example.invalid/nightly",
         "files":{"bootloader-esp32s3.bin":"b","partition-table-esp32s3.bin":"p","firmware-esp32s3.bin":"f"}},
        {"tag":"v1.1.0","url":"https://example.invalid/releases/v1.1.0",
         "files":{"firmware-esp32s3.bin":"fw.bin"}}
    ]"#;

    struct RecordingFlasher {
        offsets: Vec<u32>,
    }

    #[async_trait]
    impl FirmwareFlasher for RecordingFlasher {
        async fn flash(
            &mut self,
            plan: &FlashPlan,
            progress: &mut ProgressCallback<'_>,
        ) -> Result<()> {
            for (index, image) in plan.images().iter().enumerate() {
                self.offsets.push(image.offset);
                for written in [image.data.len() / 2, image.data.len()] {
                    progress(FlashProgress {
                        index,
                        bytes_written: written,
                        total_bytes: image.data.len(),
                    });
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_manifest_filtering() {
        let releases = parse_manifest(MANIFEST).unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].tag, "v1.2.0");
        assert_eq!(
            releases[0].file_url(FIRMWARE_FILE).as_deref(),
            Some("https://example.invalid/releases/v1.2.0/fw.bin")
        );
        assert!(parse_manifest("{}").is_err());
    }

    #[test]
    fn test_plan_offsets_and_validation() {
        let plan = FlashPlan::new(vec![1; 4], vec![2; 2], vec![3; 8]).unwrap();
        let offsets: Vec<u32> = plan.images().iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0x0, 0x8000, 0x20000]);
        assert_eq!(plan.total_bytes(), 14);

        assert!(FlashPlan::new(vec![], vec![2], vec![3]).is_err());

        let mut files = BTreeMap::new();
        files.insert(BOOTLOADER_FILE.to_string(), vec![1]);
        assert!(FlashPlan::from_files(files).is_err());
    }

    #[tokio::test]
    async fn test_flash_reports_progress() {
        let plan = FlashPlan::new(vec![1; 4], vec![2; 2], vec![3; 8]).unwrap();
        let mut flasher = RecordingFlasher { offsets: vec![] };
        flash(&mut flasher, &plan).await.unwrap();
        assert_eq!(flasher.offsets, vec![0x0, 0x8000, 0x20000]);
    }

    #[tokio::test]
    async fn test_file_manifest_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let source = FileManifest(file.path().to_path_buf());
        let releases = available_releases(&source).await.unwrap();
        assert_eq!(releases.len(), 1);
    }
}
