use crate::error::BasetiffsError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PLANETARY_COMPUTER_SEARCH: &str = "https://planetarycomputer.microsoft.com/api/stac/v1/search";
pub const PLANETARY_COMPUTER_SAS: &str = "https://planetarycomputer.microsoft.com/api/sas/v1/token";

/// How GDAL gets at the asset bytes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetAccess {
    /// Fetch whole assets to a local cache first.
    Download,
    /// Read remote assets through GDAL's virtual file systems.
    Stream,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub stac_api: String,
    pub sas_api: String,
    pub sign_assets: bool,
    pub page_size: u32,
    pub access: AssetAccess,
    pub concurrent_downloads: usize,
    pub max_retries: u32,
    pub keep_downloads: bool,
    pub request_timeout_secs: u64,
    pub s3_profile: Option<String>,
    pub s3_region: String,
    pub requester_pays: bool,
    /// Overrides the platform's cloud cover threshold (percent).
    pub max_cloud_cover: Option<f64>,
    /// Overrides the platform's output resolution (metres).
    pub target_resolution: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stac_api: PLANETARY_COMPUTER_SEARCH.to_string(),
            sas_api: PLANETARY_COMPUTER_SAS.to_string(),
            sign_assets: true,
            page_size: 100,
            access: AssetAccess::Download,
            concurrent_downloads: 4,
            max_retries: 3,
            keep_downloads: false,
            request_timeout_secs: 300,
            s3_profile: None,
            s3_region: "us-west-2".to_string(),
            requester_pays: false,
            max_cloud_cover: None,
            target_resolution: None,
        }
    }
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Unable to read settings from {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Unable to parse settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(self: &Self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(self: &Self) -> Result<(), BasetiffsError> {
        if self.page_size == 0 {
            return Err(BasetiffsError::InvalidSettings(
                "page_size must be positive".to_string(),
            ));
        }
        if self.concurrent_downloads == 0 {
            return Err(BasetiffsError::InvalidSettings(
                "concurrent_downloads must be positive".to_string(),
            ));
        }
        if let Some(cover) = self.max_cloud_cover {
            if !(0.0..=100.0).contains(&cover) {
                return Err(BasetiffsError::InvalidSettings(format!(
                    "max_cloud_cover must be within 0 and 100, got {cover}"
                )));
            }
        }
        if let Some(resolution) = self.target_resolution {
            if !(resolution > 0.0) {
                return Err(BasetiffsError::InvalidSettings(format!(
                    "target_resolution must be positive, got {resolution}"
                )));
            }
        }
        Ok(())
    }
}
