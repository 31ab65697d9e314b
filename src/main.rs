use anyhow::Result;
use basetiffs::aoi::Aoi;
use basetiffs::cli::Args;
use basetiffs::config::Settings;
use basetiffs::error::BasetiffsError;
use basetiffs::monitor::{self, Context};
use clap::{CommandFactory, Parser};
use std::fs;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.print_config {
        print!("{}", Settings::default().to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let Some(output_dir) = args.output_dir.clone() else {
        Args::command().print_help()?;
        return Ok(ExitCode::SUCCESS);
    };
    let aoi_path = args
        .area_of_interest
        .clone()
        .ok_or(BasetiffsError::MissingAreaOfInterest)?;

    fs::create_dir_all(&output_dir)?;
    let settings = args.settings()?;
    let profile = args.platform.profile()?.with_overrides(&settings);
    let aoi = Aoi::load(&aoi_path, args.target_crs)?;
    info!(
        "Monitoring {} for {} in EPSG:{}",
        output_dir.display(),
        profile.name,
        args.target_crs
    );

    let ctx = Context::new(settings, profile, aoi, output_dir)?;
    let summary =
        monitor::monitor_folder(&ctx, args.temporal_increment_days, args.run_till_complete)
            .await?;
    info!(
        "Queried {} windows: {} scenes written, {} skipped, {} failed",
        summary.windows, summary.scenes_written, summary.scenes_skipped, summary.scenes_failed
    );

    if summary.windows_failed > 0 {
        warn!("{} windows failed", summary.windows_failed);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
