use crate::config::Settings;
use crate::platform::Platform;
use anyhow::Result;
use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Download satellite imagery for an area of interest, pre-process it and
/// store it as cloud-optimized GeoTIFFs.
#[derive(Parser, Debug)]
#[command(name = "eodal_basetiffs")]
#[command(version)]
pub struct Args {
    /// Vector file (GeoPackage, Shapefile, GeoJSON) with the area of interest
    #[arg(short = 'a', long)]
    pub area_of_interest: Option<PathBuf>,

    /// Directory the scenes are written to, created if missing
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Length of the time window queried per iteration
    #[arg(short = 't', long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..))]
    pub temporal_increment_days: u32,

    /// EPSG code of the output CRS
    #[arg(short = 'c', long, default_value_t = 2056)]
    pub target_crs: u32,

    #[arg(short = 'p', long, value_enum, default_value_t = Platform::Sentinel2)]
    pub platform: Platform,

    /// Keep querying windows until the archive reaches today
    #[arg(
        short = 'r',
        long,
        value_name = "{True,False}",
        default_value = "False",
        action = ArgAction::Set,
        value_parser = PossibleValuesParser::new(["True", "False", "true", "false"])
            .map(|s| s.eq_ignore_ascii_case("true")),
    )]
    pub run_till_complete: bool,

    /// TOML settings (catalogue, downloads, overrides)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the default settings and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    pub fn settings(self: &Self) -> Result<Settings> {
        match &self.config {
            Some(path) => Settings::read(path),
            None => Ok(Settings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_help_exits_successfully() {
        let err = Args::try_parse_from(["eodal_basetiffs", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
        assert!(err.to_string().contains("--area-of-interest"));

        let err = Args::try_parse_from(["eodal_basetiffs", "-h"]).unwrap_err();
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["eodal_basetiffs", "-o", "out"]).unwrap();
        assert_eq!(args.output_dir, Some(PathBuf::from("out")));
        assert_eq!(args.area_of_interest, None);
        assert_eq!(args.temporal_increment_days, 7);
        assert_eq!(args.target_crs, 2056);
        assert_eq!(args.platform, Platform::Sentinel2);
        assert!(!args.run_till_complete);
        assert_eq!(args.settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_all_options() {
        let args = Args::try_parse_from([
            "eodal_basetiffs",
            "-a",
            "aoi.gpkg",
            "-o",
            "out",
            "-t",
            "14",
            "-c",
            "32632",
            "-p",
            "landsat-c2-l2",
            "-r",
            "True",
        ])
        .unwrap();
        assert_eq!(args.area_of_interest, Some(PathBuf::from("aoi.gpkg")));
        assert_eq!(args.temporal_increment_days, 14);
        assert_eq!(args.target_crs, 32632);
        assert_eq!(args.platform, Platform::LandsatC2L2);
        assert!(args.run_till_complete);

        let args =
            Args::try_parse_from(["eodal_basetiffs", "--run-till-complete", "false"]).unwrap();
        assert!(!args.run_till_complete);
    }

    #[test]
    fn test_unknown_platform_is_rejected() {
        let err = Args::try_parse_from(["eodal_basetiffs", "-p", "sentinel-1"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_non_boolean_run_till_complete_is_rejected() {
        for value in ["yes", "1", "maybe"] {
            let err = Args::try_parse_from(["eodal_basetiffs", "-r", value]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidValue);
        }
    }

    #[test]
    fn test_zero_increment_is_rejected() {
        assert!(Args::try_parse_from(["eodal_basetiffs", "-t", "0"]).is_err());
        assert!(Args::try_parse_from(["eodal_basetiffs", "-t", "-3"]).is_err());
    }

    #[test]
    fn test_settings_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basetiffs.toml");
        std::fs::write(&path, "access = \"stream\"\nmax_retries = 5\n").unwrap();
        let args = Args::try_parse_from([
            "eodal_basetiffs",
            "--config",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let settings = args.settings().unwrap();
        assert_eq!(settings.max_retries, 5);
    }
}
