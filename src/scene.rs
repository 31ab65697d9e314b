//! A scene is every item of one sensing date resampled onto the output grid.
use crate::platform::{PlatformProfile, QualitySpec};
use crate::warp::Grid;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Scaled NDVI: `ndvi * NDVI_SCALE + NDVI_SHIFT` stored as u16.
pub const NDVI_SCALE: f32 = 10000.0;
pub const NDVI_SHIFT: f32 = 10000.0;
pub const NDVI_NODATA: f32 = 21000.0;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub values: Vec<f32>,
    pub nodata: f32,
    pub scale: f64,
    pub offset: f64,
    pub sample_type: SampleType,
}

impl Band {
    pub fn filled(
        name: &str,
        len: usize,
        nodata: f32,
        scale: f64,
        offset: f64,
        sample_type: SampleType,
    ) -> Self {
        Self {
            name: name.to_string(),
            values: vec![nodata; len],
            nodata,
            scale,
            offset,
            sample_type,
        }
    }

    pub fn is_valid(&self, i: usize) -> bool {
        let v = self.values[i];
        v != self.nodata && !v.is_nan()
    }

    /// Physical value of pixel `i`, `None` for nodata.
    pub fn physical(&self, i: usize) -> Option<f64> {
        self.is_valid(i)
            .then(|| self.values[i] as f64 * self.scale + self.offset)
    }
}

/// Provenance of one item that contributed to a scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceItem {
    pub id: String,
    pub product_uri: String,
    pub datetime: DateTime<Utc>,
}

/// One item's bands and quality layer sampled onto the grid, ready to be
/// merged into a scene. Band order follows the profile.
#[derive(Debug, Clone)]
pub struct SceneLayer {
    pub source: SourceItem,
    pub bands: Vec<Vec<f32>>,
    pub quality: Vec<f32>,
    /// Per band (scale, offset) as declared by the catalogue for this item.
    pub scaling: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub date: NaiveDate,
    pub grid: Grid,
    pub epsg: u32,
    pub bands: Vec<Band>,
    /// Raw quality values, 0 where no item contributed.
    pub quality: Vec<f32>,
    pub quality_spec: QualitySpec,
    pub sources: Vec<SourceItem>,
}

impl Scene {
    pub fn new(date: NaiveDate, grid: Grid, epsg: u32, profile: &PlatformProfile) -> Self {
        let bands = profile
            .bands
            .iter()
            .map(|spec| {
                Band::filled(
                    &spec.name,
                    grid.pixel_count(),
                    spec.nodata as f32,
                    spec.scale,
                    spec.offset,
                    spec.sample_type,
                )
            })
            .collect();
        Self {
            date,
            grid,
            epsg,
            bands,
            quality: vec![0.0; grid.pixel_count()],
            quality_spec: profile.quality.clone(),
            sources: vec![],
        }
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|b| b.name == name)
    }

    /// Earliest acquisition time among the merged items.
    pub fn sensing_time(&self) -> Option<DateTime<Utc>> {
        self.sources.iter().map(|s| s.datetime).min()
    }

    fn quality_at(&self, i: usize) -> u16 {
        let q = self.quality[i];
        if q.is_finite() && q >= 0.0 && q <= u16::MAX as f32 {
            q as u16
        } else {
            0
        }
    }

    fn is_valid(&self, i: usize) -> bool {
        self.quality_spec.is_valid(self.quality_at(i))
    }

    /// Merge an item into the mosaic. Pixels already covered keep their
    /// values; uncovered pixels take every band from `layer` where its quality
    /// layer is valid.
    pub fn merge(&mut self, layer: SceneLayer) {
        let first = self.sources.is_empty();
        for i in 0..self.grid.pixel_count() {
            if self.is_valid(i) {
                continue;
            }
            let q = layer.quality.get(i).copied().unwrap_or(0.0);
            if !(q.is_finite() && q >= 0.0 && self.quality_spec.is_valid(q as u16)) {
                continue;
            }
            self.quality[i] = q;
            for (band, values) in self.bands.iter_mut().zip(&layer.bands) {
                band.values[i] = values.get(i).copied().unwrap_or(band.nodata);
            }
        }
        // Catalogue scaling of the first item wins; tiles of one date share a
        // processing baseline.
        if first {
            for (band, &(scale, offset)) in self.bands.iter_mut().zip(&layer.scaling) {
                band.scale = scale;
                band.offset = offset;
            }
        }
        self.sources.push(layer.source);
    }

    /// Set every pixel outside `inside` to nodata.
    pub fn clip(&mut self, inside: &[bool]) {
        for (i, &keep) in inside.iter().enumerate() {
            if keep {
                continue;
            }
            self.quality[i] = 0.0;
            for band in self.bands.iter_mut() {
                band.values[i] = band.nodata;
            }
        }
    }

    pub fn valid_pixel_count(&self) -> usize {
        (0..self.grid.pixel_count()).filter(|&i| self.is_valid(i)).count()
    }

    /// Remove clouds, shadows and whatever else the quality rule masks from
    /// the reflectance bands. The quality layer itself stays untouched.
    pub fn mask_clouds_and_shadows(&mut self) {
        for i in 0..self.grid.pixel_count() {
            if self.quality_spec.is_masked(self.quality_at(i)) {
                for band in self.bands.iter_mut() {
                    band.values[i] = band.nodata;
                }
            }
        }
    }

    /// 1 for cloud or cloud shadow, 0 for clear pixels and outside the AOI.
    pub fn cloud_mask(&self) -> Vec<f32> {
        (0..self.grid.pixel_count())
            .map(|i| {
                if self.quality_spec.is_cloud(self.quality_at(i)) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Share of cloudy pixels among valid pixels in percent, `None` when the
    /// scene has no valid pixel.
    pub fn cloudy_pixel_percentage(&self) -> Option<f64> {
        let valid = self.valid_pixel_count();
        if valid == 0 {
            return None;
        }
        let cloudy = (0..self.grid.pixel_count())
            .filter(|&i| self.quality_spec.is_cloud(self.quality_at(i)))
            .count();
        Some(cloudy as f64 / valid as f64 * 100.0)
    }

    /// NDVI scaled to the u16 range, NDVI_NODATA where it is undefined.
    pub fn scaled_ndvi(&self, red: &str, nir: &str) -> Option<Band> {
        let red = self.band(red)?;
        let nir = self.band(nir)?;
        let values = (0..self.grid.pixel_count())
            .map(|i| match (red.physical(i), nir.physical(i)) {
                (Some(r), Some(n)) => scale_ndvi(ndvi(r, n)),
                _ => NDVI_NODATA,
            })
            .collect();
        Some(Band {
            name: "ndvi".to_string(),
            values,
            nodata: NDVI_NODATA,
            scale: 1.0 / NDVI_SCALE as f64,
            offset: -1.0,
            sample_type: SampleType::U16,
        })
    }
}

pub fn ndvi(red: f64, nir: f64) -> Option<f64> {
    let sum = nir + red;
    if sum.abs() < f64::EPSILON || !sum.is_finite() {
        return None;
    }
    Some(((nir - red) / sum).clamp(-1.0, 1.0))
}

pub fn scale_ndvi(ndvi: Option<f64>) -> f32 {
    match ndvi {
        Some(v) => (v as f32 * NDVI_SCALE + NDVI_SHIFT).round(),
        None => NDVI_NODATA,
    }
}
