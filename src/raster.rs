//! GDAL access: sampling assets onto the output grid and writing COGs.
use crate::config::Settings;
use crate::error::BasetiffsError;
use crate::scene::{Band, SampleType};
use crate::warp::{Grid, NearestSampler};
use anyhow::{anyhow, Context, Result};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager, Metadata};
use std::path::Path;
use tracing::debug;

fn spatial_ref(epsg: u32) -> Result<SpatialRef> {
    let mut srs = SpatialRef::from_epsg(epsg)
        .with_context(|| format!("Unknown CRS EPSG:{epsg}"))?;
    srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    Ok(srs)
}

/// Point GDAL's virtual file systems at the configured S3 credentials.
pub fn configure_streaming(settings: &Settings) -> Result<()> {
    match &settings.s3_profile {
        Some(profile) => gdal::config::set_config_option("AWS_PROFILE", profile)?,
        None => gdal::config::set_config_option("AWS_NO_SIGN_REQUEST", "YES")?,
    }
    gdal::config::set_config_option("AWS_REGION", &settings.s3_region)?;
    if settings.requester_pays {
        gdal::config::set_config_option("AWS_REQUEST_PAYER", "requester")?;
    }
    Ok(())
}

/// Transform points in place. Points the transformation cannot handle end up
/// as NaN instead of failing the whole batch.
fn transform_points(transform: &CoordTransform, xs: &mut [f64], ys: &mut [f64]) {
    let (orig_xs, orig_ys) = (xs.to_vec(), ys.to_vec());
    let mut zs = vec![0.0; xs.len()];
    if transform.transform_coords(xs, ys, &mut zs).is_ok() {
        return;
    }
    for i in 0..xs.len() {
        let mut x = [orig_xs[i]];
        let mut y = [orig_ys[i]];
        let mut z = [0.0];
        match transform.transform_coords(&mut x, &mut y, &mut z) {
            Ok(()) => (xs[i], ys[i]) = (x[0], y[0]),
            Err(_) => (xs[i], ys[i]) = (f64::NAN, f64::NAN),
        }
    }
}

/// Read band 1 of `path` onto `grid` (in EPSG:`epsg`) by nearest neighbour.
/// Pixels outside the asset and source nodata become `fill`.
pub fn sample_asset(path: &str, grid: &Grid, epsg: u32, fill: f32) -> Result<Vec<f32>> {
    let dataset =
        Dataset::open(path).with_context(|| format!("Unable to open raster {path}"))?;
    let mut source_srs = dataset.spatial_ref()?;
    source_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    let target_srs = spatial_ref(epsg)?;

    let (mut xs, mut ys) = grid.pixel_centers();
    let transform = CoordTransform::new(&target_srs, &source_srs)?;
    transform_points(&transform, &mut xs, &mut ys);

    let sampler = NearestSampler::new(&dataset.geo_transform()?, dataset.raster_size(), &xs, &ys)
        .ok_or_else(|| BasetiffsError::NoOverlap(path.to_owned()))?;
    let window = sampler.window();
    debug!(
        "Reading {:?} of {}, covering {} of {} pixels",
        window,
        path,
        sampler.coverage(),
        grid.pixel_count()
    );

    let band = dataset.rasterband(1)?;
    let buffer = band.read_as::<f32>(
        (window.col_off as isize, window.row_off as isize),
        (window.width, window.height),
        (window.width, window.height),
        None,
    )?;
    let nodata = band.no_data_value().map(|v| v as f32);
    let values = buffer
        .data()
        .iter()
        .map(|&v| match nodata {
            Some(nd) if v == nd => fill,
            _ if v.is_nan() => fill,
            _ => v,
        })
        .collect::<Vec<f32>>();

    Ok(sampler.sample(&values, fill))
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(u8::MIN as f32, u8::MAX as f32) as u8
}

fn to_u16(v: f32) -> u16 {
    v.round().clamp(u16::MIN as f32, u16::MAX as f32) as u16
}

fn fill_bands<T: GdalType + Copy>(
    dataset: &mut Dataset,
    grid: &Grid,
    bands: &[&Band],
    convert: fn(f32) -> T,
) -> Result<()> {
    for (i, band) in bands.iter().enumerate() {
        let mut raster_band = dataset.rasterband(i + 1)?;
        let data = band.values.iter().map(|&v| convert(v)).collect::<Vec<T>>();
        let mut buffer = Buffer::new((grid.width, grid.height), data);
        raster_band.write((0, 0), (grid.width, grid.height), &mut buffer)?;
        raster_band.set_no_data_value(Some(band.nodata as f64))?;
        raster_band.set_scale(band.scale)?;
        raster_band.set_offset(band.offset)?;
        raster_band.set_description(&band.name)?;
    }
    Ok(())
}

/// Write `bands` as one cloud-optimized GeoTIFF. All bands share the sample
/// type of the first one.
pub fn write_cog(path: &Path, grid: &Grid, epsg: u32, bands: &[&Band]) -> Result<()> {
    let first = bands
        .first()
        .ok_or_else(|| anyhow!("No bands to write to {}", path.display()))?;
    let (width, height, count) = (grid.width, grid.height, bands.len());

    let memory = DriverManager::get_driver_by_name("MEM")?;
    let mut dataset = match first.sample_type {
        SampleType::U8 => {
            let mut ds = memory.create_with_band_type::<u8, _>("", width, height, count)?;
            fill_bands(&mut ds, grid, bands, to_u8)?;
            ds
        }
        SampleType::U16 => {
            let mut ds = memory.create_with_band_type::<u16, _>("", width, height, count)?;
            fill_bands(&mut ds, grid, bands, to_u16)?;
            ds
        }
    };
    dataset.set_geo_transform(&grid.geo_transform())?;
    dataset.set_spatial_ref(&spatial_ref(epsg)?)?;

    let cog = DriverManager::get_driver_by_name("COG")?;
    let mut options = CslStringList::new();
    options.set_name_value("COMPRESS", "DEFLATE")?;
    options.set_name_value("BLOCKSIZE", "512")?;
    options.set_name_value("OVERVIEWS", "AUTO")?;
    options.set_name_value("RESAMPLING", "NEAREST")?;
    dataset
        .create_copy(&cog, path, &options)
        .with_context(|| format!("Unable to write {}", path.display()))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(name: &str, values: Vec<f32>, nodata: f32, sample_type: SampleType) -> Band {
        Band {
            name: name.to_string(),
            values,
            nodata,
            scale: 0.0001,
            offset: -0.1,
            sample_type,
        }
    }

    #[test]
    fn test_write_cog_with_band_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-05-29_fcir.tif");
        let grid = Grid { x_min: 2600000.0, y_max: 1200000.0, resolution: 10.0, width: 3, height: 2 };
        let nir = band("nir_1", vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0], 0.0, SampleType::U16);
        let red = band("red", vec![10.0, 20.0, 30.0, 40.0, 50.0, 0.0], 0.0, SampleType::U16);
        write_cog(&path, &grid, 2056, &[&nir, &red]).unwrap();

        let dataset = Dataset::open(&path).unwrap();
        assert_eq!(dataset.raster_size(), (3, 2));
        assert_eq!(dataset.raster_count(), 2);
        assert_eq!(dataset.geo_transform().unwrap(), grid.geo_transform());
        assert_eq!(dataset.spatial_ref().unwrap().auth_code().unwrap(), 2056);

        let red_band = dataset.rasterband(2).unwrap();
        assert_eq!(red_band.description().unwrap(), "red");
        assert_eq!(red_band.no_data_value(), Some(0.0));
        assert_eq!(red_band.scale(), Some(0.0001));
        assert_eq!(red_band.offset(), Some(-0.1));
        let values = red_band.read_as::<u16>((0, 0), (3, 2), (3, 2), None).unwrap();
        assert_eq!(values.data(), &[10, 20, 30, 40, 50, 0]);
    }

    #[test]
    fn test_sample_written_cog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scl.tif");
        let grid = Grid { x_min: 500000.0, y_max: 5200000.0, resolution: 20.0, width: 2, height: 2 };
        let scl = band("SCL", vec![4.0, 8.0, 0.0, 9.0], 0.0, SampleType::U8);
        write_cog(&path, &grid, 32632, &[&scl]).unwrap();

        // Same CRS, half the pixel size, one pixel wider than the source.
        let fine = Grid { x_min: 500000.0, y_max: 5200000.0, resolution: 10.0, width: 5, height: 4 };
        let values = sample_asset(path.to_str().unwrap(), &fine, 32632, 255.0).unwrap();
        assert_eq!(&values[0..5], &[4.0, 4.0, 8.0, 8.0, 255.0]);
        // Source nodata becomes the fill value.
        assert_eq!(&values[10..15], &[255.0, 255.0, 9.0, 9.0, 255.0]);
    }

    #[test]
    fn test_sample_without_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b04.tif");
        let grid = Grid { x_min: 0.0, y_max: 20.0, resolution: 10.0, width: 2, height: 2 };
        let b04 = band("B04", vec![1.0; 4], 0.0, SampleType::U16);
        write_cog(&path, &grid, 32632, &[&b04]).unwrap();

        let far = Grid { x_min: 10000.0, y_max: 10020.0, resolution: 10.0, width: 2, height: 2 };
        let err = sample_asset(path.to_str().unwrap(), &far, 32632, 0.0).unwrap_err();
        assert!(err.downcast_ref::<BasetiffsError>().is_some());
    }

    #[test]
    fn test_sample_type_conversion() {
        assert_eq!(to_u8(254.6), 255);
        assert_eq!(to_u8(300.0), 255);
        assert_eq!(to_u16(-3.0), 0);
        assert_eq!(to_u16(20999.6), 21000);
    }
}
