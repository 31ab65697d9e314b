use crate::platform::PlatformProfile;
use crate::raster::write_cog;
use crate::scene::{Band, SampleType, Scene};
use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CLOUD_MASK_NODATA: f32 = 255.0;

#[derive(Serialize, Debug, PartialEq)]
pub struct SceneMetadata {
    pub product_uri: String,
    pub sensing_time: String,
    pub processing_level: String,
    pub version: String,
    pub platform: String,
    pub product_name: String,
    pub collection: String,
    pub target_crs: String,
    pub source_items: Vec<String>,
}

impl SceneMetadata {
    pub fn new(scene: &Scene, profile: &PlatformProfile) -> Self {
        let product_uri = scene
            .sources
            .iter()
            .map(|s| s.product_uri.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            product_uri,
            sensing_time: scene
                .sensing_time()
                .as_ref()
                .map(|t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            processing_level: profile.processing_level.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: profile.platform.as_str().to_owned(),
            product_name: profile.name.to_owned(),
            collection: profile.collection.to_owned(),
            target_crs: format!("EPSG:{}", scene.epsg),
            source_items: scene.sources.iter().map(|s| s.id.to_owned()).collect(),
        }
    }
}

fn product_path(scene_dir: &Path, scene: &Scene, suffix: &str) -> PathBuf {
    scene_dir.join(format!("{}_{}", scene.date.format("%Y-%m-%d"), suffix))
}

fn bands<'a>(scene: &'a Scene, names: &[&str]) -> Result<Vec<&'a Band>> {
    names
        .iter()
        .map(|name| {
            scene
                .band(name)
                .ok_or_else(|| anyhow!("Scene {} has no band {}", scene.date, name))
        })
        .collect()
}

/// Cloud mask and cloudy percentage come from the quality layer, so they can be
/// written before or after the reflectance bands are masked.
pub fn write_cloud_products(scene: &Scene, scene_dir: &Path) -> Result<Vec<PathBuf>> {
    let percentage = scene
        .cloudy_pixel_percentage()
        .ok_or_else(|| anyhow!("Scene {} has no valid pixels", scene.date))?;
    let percentage_path = product_path(scene_dir, scene, "cloudy_pixel_percentage.txt");
    fs::write(&percentage_path, format!("{:.1}", percentage))?;

    let mask = Band {
        name: "cloud_mask".to_string(),
        values: scene.cloud_mask(),
        nodata: CLOUD_MASK_NODATA,
        scale: 1.0,
        offset: 0.0,
        sample_type: SampleType::U8,
    };
    let mask_path = product_path(scene_dir, scene, "cloud_mask.tif");
    write_cog(&mask_path, &scene.grid, scene.epsg, &[&mask])?;
    info!("Cloudy pixel percentage of {}: {:.1}", scene.date, percentage);

    Ok(vec![percentage_path, mask_path])
}

/// RGB (when the platform has blue), false colour infrared, NDVI and the
/// metadata file.
pub fn write_reflectance_products(
    scene: &Scene,
    profile: &PlatformProfile,
    scene_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut written = vec![];

    if profile.has_rgb() {
        let path = product_path(scene_dir, scene, "rgb.tif");
        write_cog(&path, &scene.grid, scene.epsg, &bands(scene, &["red", "green", "blue"])?)?;
        written.push(path);
    }

    let path = product_path(scene_dir, scene, "fcir.tif");
    write_cog(&path, &scene.grid, scene.epsg, &bands(scene, &profile.fcir_bands())?)?;
    written.push(path);

    let ndvi = scene
        .scaled_ndvi("red", &profile.nir_band)
        .ok_or_else(|| anyhow!("Scene {} lacks red or {}", scene.date, profile.nir_band))?;
    let path = product_path(scene_dir, scene, "ndvi.tif");
    write_cog(&path, &scene.grid, scene.epsg, &[&ndvi])?;
    written.push(path);

    let path = product_path(scene_dir, scene, "metadata.yaml");
    let metadata = SceneMetadata::new(scene, profile);
    fs::write(&path, serde_yaml::to_string(&metadata)?)?;
    written.push(path);

    Ok(written)
}
