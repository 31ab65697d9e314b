//! Area of interest: read from any OGR vector file, dissolved into one
//! geometry and kept both in WGS84 (for the catalogue) and in the target CRS
//! (for the output grid).
use crate::error::BasetiffsError;
use crate::warp::{resolution_in_crs, Bounds, Grid};
use anyhow::{anyhow, Context, Result};
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::vector::{Geometry, LayerAccess};
use gdal::Dataset;
use std::path::Path;
use tracing::{debug, warn};

const WGS84: u32 = 4326;

pub type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone)]
pub struct Aoi {
    /// Dissolved geometry as GeoJSON, lon/lat.
    pub geojson: serde_json::Value,
    pub target_epsg: u32,
    pub target_is_geographic: bool,
    pub rings: Vec<Ring>,
    pub bounds: Bounds,
}

impl Aoi {
    pub fn load(path: &Path, target_epsg: u32) -> Result<Self> {
        if !path.exists() {
            return Err(BasetiffsError::AoiNotFound(path.to_path_buf()).into());
        }
        let dataset = Dataset::open(path)
            .with_context(|| format!("Unable to open area of interest {}", path.display()))?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("No layer in {}", path.display()))?;

        let source_srs = match layer.spatial_ref() {
            Some(srs) => srs,
            None => {
                warn!("{} has no CRS, assuming EPSG:{WGS84}", path.display());
                SpatialRef::from_epsg(WGS84)?
            }
        };

        let mut dissolved: Option<Geometry> = None;
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            dissolved = Some(match dissolved {
                None => geometry.clone(),
                Some(acc) => acc
                    .union(geometry)
                    .ok_or_else(|| anyhow!("Unable to dissolve geometries of {}", path.display()))?,
            });
        }
        let dissolved =
            dissolved.ok_or_else(|| BasetiffsError::EmptyAoi(path.to_path_buf()))?;

        Self::from_geometry(&dissolved, &source_srs, target_epsg, path)
    }

    pub fn from_geometry(
        geometry: &Geometry,
        source_srs: &SpatialRef,
        target_epsg: u32,
        source: &Path,
    ) -> Result<Self> {
        let mut source_srs = source_srs.clone();
        source_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let mut wgs84 = SpatialRef::from_epsg(WGS84)?;
        wgs84.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let mut target = SpatialRef::from_epsg(target_epsg)
            .with_context(|| format!("Unknown target CRS EPSG:{target_epsg}"))?;
        target.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

        let geographic = geometry.transform(&CoordTransform::new(&source_srs, &wgs84)?)?;
        let projected = geometry.transform(&CoordTransform::new(&source_srs, &target)?)?;

        let mut rings = vec![];
        collect_rings(&projected, &mut rings);
        let bounds = Bounds::from_points(rings.iter().flatten())
            .ok_or_else(|| BasetiffsError::EmptyAoi(source.to_path_buf()))?;
        let geojson: serde_json::Value = serde_json::from_str(&geographic.json()?)?;
        debug!("Area of interest bounds in EPSG:{target_epsg}: {:?}", bounds.as_array());

        Ok(Self {
            geojson,
            target_epsg,
            target_is_geographic: target.is_geographic(),
            rings,
            bounds,
        })
    }

    /// Output grid covering the AOI at `resolution_m` metres.
    pub fn grid(&self, resolution_m: f64) -> Result<Grid> {
        let resolution = resolution_in_crs(resolution_m, self.target_is_geographic);
        Grid::covering(&self.bounds, resolution).ok_or_else(|| {
            BasetiffsError::InvalidSettings(format!("Invalid resolution {resolution_m}")).into()
        })
    }

    /// Pixels of `grid` whose centre lies inside the AOI.
    pub fn rasterize(&self, grid: &Grid) -> Vec<bool> {
        rasterize_rings(&self.rings, grid)
    }
}

/// Exterior and interior rings of every polygon in `geometry`. Points and
/// lines carry no area and are skipped.
fn collect_rings(geometry: &Geometry, out: &mut Vec<Ring>) {
    match geometry.geometry_name().as_str() {
        "POLYGON" => {
            for i in 0..geometry.geometry_count() {
                let mut points = Vec::new();
                geometry.get_geometry(i).get_points(&mut points);
                let ring: Ring = points
                    .into_iter()
                    .map(|(x, y, _)| [x, y])
                    .collect();
                if ring.len() >= 3 {
                    out.push(ring);
                }
            }
        }
        "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => {
            for i in 0..geometry.geometry_count() {
                collect_rings(&geometry.get_geometry(i), out);
            }
        }
        _ => {}
    }
}

/// Even-odd scanline fill on pixel centres. Holes are rings like any other,
/// so they flip the fill back off.
pub fn rasterize_rings(rings: &[Ring], grid: &Grid) -> Vec<bool> {
    let mut inside = vec![false; grid.pixel_count()];
    let mut crossings: Vec<f64> = vec![];
    for row in 0..grid.height {
        let (_, y) = grid.pixel_center(0, row);
        crossings.clear();
        for ring in rings {
            let n = ring.len();
            for i in 0..n {
                let [x1, y1] = ring[i];
                let [x2, y2] = ring[(i + 1) % n];
                if (y1 > y) != (y2 > y) {
                    crossings.push(x1 + (y - y1) / (y2 - y1) * (x2 - x1));
                }
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for span in crossings.chunks_exact(2) {
            let start = first_column_at_or_after(span[0], grid);
            let end = first_column_at_or_after(span[1], grid);
            for col in start..end {
                inside[row * grid.width + col] = true;
            }
        }
    }
    inside
}

fn first_column_at_or_after(x: f64, grid: &Grid) -> usize {
    let col = ((x - grid.x_min) / grid.resolution - 0.5).ceil();
    col.clamp(0.0, grid.width as f64) as usize
}
