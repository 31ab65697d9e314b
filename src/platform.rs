//! The three supported platforms and the processing profile of each.
//!
//! Profiles are kept as TOML templates so they can be dumped, edited and
//! compared against what the catalogue actually serves.
use crate::config::Settings;
use crate::scene::SampleType;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum Platform {
    #[value(name = "sentinel-2")]
    #[serde(rename = "sentinel-2")]
    Sentinel2,
    #[value(name = "landsat-c2-l1")]
    #[serde(rename = "landsat-c2-l1")]
    LandsatC2L1,
    #[value(name = "landsat-c2-l2")]
    #[serde(rename = "landsat-c2-l2")]
    LandsatC2L2,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentinel2 => "sentinel-2",
            Self::LandsatC2L1 => "landsat-c2-l1",
            Self::LandsatC2L2 => "landsat-c2-l2",
        }
    }

    pub fn profile_toml(&self) -> toml::Table {
        match self {
            Self::Sentinel2 => sentinel2_toml(),
            Self::LandsatC2L1 => landsat_c2_l1_toml(),
            Self::LandsatC2L2 => landsat_c2_l2_toml(),
        }
    }

    pub fn profile(&self) -> Result<PlatformProfile> {
        PlatformProfile::from_template(&self.profile_toml())
            .with_context(|| format!("Invalid profile template for {self}"))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sentinel2_toml() -> toml::Table {
    toml::toml! {
        platform = "sentinel-2"

        collection = "sentinel-2-l2a"

        name = "Sentinel-2 Level-2A Bottom-of-Atmosphere Reflectance"

        processing_level = "Level-2A"

        product_uri_property = "s2:product_uri"

        start_date = "2017-01-01"

        cloud_cover_property = "eo:cloud_cover"
        max_cloud_cover = 80.0

        target_resolution = 10.0

        nir_band = "nir_1"

        [[bands]]
        asset = "B02"
        name = "blue"
        scale = 0.0001
        offset = 0.0
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "B03"
        name = "green"
        scale = 0.0001
        offset = 0.0
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "B04"
        name = "red"
        scale = 0.0001
        offset = 0.0
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "B08"
        name = "nir_1"
        scale = 0.0001
        offset = 0.0
        nodata = 0.0
        sample_type = "u16"

        // Scene Classification Layer. 3 = cloud shadow, 8/9 = cloud medium/high
        // probability. Cirrus (10) is masked but not counted as cloud since
        // Sen2Cor corrects it.
        [quality]
        asset = "SCL"
        kind = "scene_classification"
        mask = [1, 2, 3, 7, 8, 9, 10, 11]
        cloud = [3, 8, 9]

        // Products from baseline 04.00 on carry BOA_ADD_OFFSET = -1000.
        [baseline_offset]
        property = "s2:processing_baseline"
        since = 4.0
        offset = -0.1
    }
}

fn landsat_c2_l1_toml() -> toml::Table {
    toml::toml! {
        platform = "landsat-c2-l1"

        collection = "landsat-c2-l1"

        name = "Landsat Collection 2 Level-1 (MSS)"

        processing_level = "Level-1"

        product_uri_property = "landsat:scene_id"

        start_date = "1972-09-01"

        cloud_cover_property = "eo:cloud_cover"
        max_cloud_cover = 80.0

        target_resolution = 60.0

        nir_band = "nir08"

        [[bands]]
        asset = "green"
        name = "green"
        scale = 1.0
        offset = 0.0
        nodata = 0.0
        sample_type = "u8"

        [[bands]]
        asset = "red"
        name = "red"
        scale = 1.0
        offset = 0.0
        nodata = 0.0
        sample_type = "u8"

        [[bands]]
        asset = "nir08"
        name = "nir08"
        scale = 1.0
        offset = 0.0
        nodata = 0.0
        sample_type = "u8"

        // Only the cloud bit (3) exists for every Landsat from 1 to 9.
        [quality]
        asset = "qa_pixel"
        kind = "bit_flags"
        mask = [1, 2, 3, 4]
        cloud = [3]
    }
}

fn landsat_c2_l2_toml() -> toml::Table {
    toml::toml! {
        platform = "landsat-c2-l2"

        collection = "landsat-c2-l2"

        name = "Landsat Collection 2 Level-2 Surface Reflectance"

        processing_level = "Level-2"

        product_uri_property = "landsat:scene_id"

        start_date = "1972-09-01"

        cloud_cover_property = "eo:cloud_cover"
        max_cloud_cover = 80.0

        target_resolution = 30.0

        nir_band = "nir08"

        [[bands]]
        asset = "blue"
        name = "blue"
        scale = 0.0000275
        offset = -0.2
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "green"
        name = "green"
        scale = 0.0000275
        offset = -0.2
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "red"
        name = "red"
        scale = 0.0000275
        offset = -0.2
        nodata = 0.0
        sample_type = "u16"

        [[bands]]
        asset = "nir08"
        name = "nir08"
        scale = 0.0000275
        offset = -0.2
        nodata = 0.0
        sample_type = "u16"

        [quality]
        asset = "qa_pixel"
        kind = "bit_flags"
        mask = [1, 2, 3, 4]
        cloud = [3]
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub collection: String,
    pub name: String,
    pub processing_level: String,
    pub product_uri_property: String,
    pub start_date: NaiveDate,
    pub cloud_cover_property: String,
    pub max_cloud_cover: f64,
    pub target_resolution: f64,
    pub nir_band: String,
    pub bands: Vec<BandSpec>,
    pub quality: QualitySpec,
    #[serde(default)]
    pub baseline_offset: Option<BaselineOffset>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BandSpec {
    pub asset: String,
    pub name: String,
    pub scale: f64,
    pub offset: f64,
    pub nodata: f64,
    pub sample_type: SampleType,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityKind {
    /// Each pixel holds a class id.
    SceneClassification,
    /// Each pixel holds a bit field; bit 0 flags fill.
    BitFlags,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct QualitySpec {
    pub asset: String,
    pub kind: QualityKind,
    /// Classes (or bits) whose pixels are removed from the reflectance bands.
    pub mask: Vec<u16>,
    /// Classes (or bits) counted as cloud in the cloud mask.
    pub cloud: Vec<u16>,
}

impl QualitySpec {
    pub fn is_valid(&self, value: u16) -> bool {
        match self.kind {
            QualityKind::SceneClassification => value != 0,
            QualityKind::BitFlags => value != 0 && value & 1 == 0,
        }
    }

    pub fn is_masked(&self, value: u16) -> bool {
        self.is_valid(value) && self.matches(&self.mask, value)
    }

    pub fn is_cloud(&self, value: u16) -> bool {
        self.is_valid(value) && self.matches(&self.cloud, value)
    }

    fn matches(&self, set: &[u16], value: u16) -> bool {
        match self.kind {
            QualityKind::SceneClassification => set.contains(&value),
            QualityKind::BitFlags => set
                .iter()
                .filter(|&&bit| bit < 16)
                .any(|&bit| value & (1 << bit) != 0),
        }
    }
}

/// Reflectance offset that applies from a given processing baseline on.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BaselineOffset {
    pub property: String,
    pub since: f64,
    pub offset: f64,
}

impl BaselineOffset {
    /// Offset for an item whose baseline property reads `baseline` (e.g. "05.09").
    pub fn offset_for(&self, baseline: Option<&str>) -> Option<f64> {
        let baseline: f64 = baseline?.trim().parse().ok()?;
        (baseline >= self.since).then_some(self.offset)
    }
}

impl PlatformProfile {
    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let profile: Self = toml::from_str(&table.to_string())?;
        Ok(profile)
    }

    pub fn with_overrides(mut self, settings: &Settings) -> Self {
        if let Some(cover) = settings.max_cloud_cover {
            self.max_cloud_cover = cover;
        }
        if let Some(resolution) = settings.target_resolution {
            self.target_resolution = resolution;
        }
        self
    }

    pub fn band(&self, name: &str) -> Option<&BandSpec> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn has_rgb(&self) -> bool {
        ["red", "green", "blue"].iter().all(|n| self.band(n).is_some())
    }

    pub fn fcir_bands(&self) -> [&str; 3] {
        [self.nir_band.as_str(), "red", "green"]
    }

    /// All asset keys an item must provide, quality asset last.
    pub fn asset_keys(&self) -> Vec<&str> {
        self.bands
            .iter()
            .map(|b| b.asset.as_str())
            .chain(std::iter::once(self.quality.asset.as_str()))
            .collect()
    }
}
