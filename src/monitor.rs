//! Keeps an output folder up to date: query the catalogue one time window at
//! a time, starting the day after the latest processed scene, and turn every
//! sensing date found into a scene directory.
use crate::aoi::Aoi;
use crate::archive::{self, SceneDir};
use crate::config::{AssetAccess, Settings};
use crate::download_plan::{DownloadPlan, DownloadTask};
use crate::error::BasetiffsError;
use crate::outputs;
use crate::platform::PlatformProfile;
use crate::provider::{HttpStore, RemoteStore, S3Store};
use crate::raster;
use crate::s3::S3Object;
use crate::scene::{Scene, SceneLayer, SourceItem};
use crate::signing::Signer;
use crate::stac_operations::{self, AssetInfo};
use crate::warp::Grid;
use anyhow::{Context as _, Result};
use chrono::{Days, NaiveDate, Utc};
use stac::Item;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DOWNLOADS: &str = ".downloads";

pub struct Context {
    pub settings: Settings,
    pub profile: PlatformProfile,
    pub aoi: Aoi,
    pub output_dir: PathBuf,
    client: reqwest::Client,
    signer: Signer,
    store: RemoteStore,
}

impl Context {
    pub fn new(
        settings: Settings,
        profile: PlatformProfile,
        aoi: Aoi,
        output_dir: PathBuf,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        let sas_api = settings.sign_assets.then(|| settings.sas_api.to_owned());
        let signer = Signer::new(client.clone(), sas_api);
        let store = RemoteStore::new(
            HttpStore::new(client.clone()),
            S3Store::new(
                settings.s3_profile.clone(),
                &settings.s3_region,
                settings.requester_pays,
            ),
        );
        if settings.access == AssetAccess::Stream {
            raster::configure_streaming(&settings)?;
        }
        Ok(Self {
            settings,
            profile,
            aoi,
            output_dir,
            client,
            signer,
            store,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    pub windows: usize,
    pub windows_failed: usize,
    pub scenes_written: usize,
    pub scenes_skipped: usize,
    pub scenes_failed: usize,
}

/// Window following `latest`, or `None` once it would start after `today`.
pub fn next_window(
    latest: NaiveDate,
    increment_days: u32,
    today: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let start = latest.checked_add_days(Days::new(1))?;
    if start > today {
        return None;
    }
    let end = start.checked_add_days(Days::new(increment_days as u64))?;
    Some((start, end))
}

pub async fn monitor_folder(
    ctx: &Context,
    increment_days: u32,
    run_till_complete: bool,
) -> Result<MonitorSummary> {
    let mut summary = MonitorSummary::default();
    loop {
        let today = Utc::now().date_naive();
        let recorded = archive::get_latest_scene(&ctx.output_dir)?;
        let latest = recorded.unwrap_or(ctx.profile.start_date);

        let Some((start, end)) = next_window(latest, increment_days, today) else {
            info!("Start date {} is in the future", latest + Days::new(1));
            break;
        };

        summary.windows += 1;
        info!("Querying {} from {} to {}", ctx.profile.collection, start, end);
        if let Err(err) = fetch_data(ctx, start, end, today, &mut summary).await {
            error!("Error while fetching data from {} to {}: {:#}", start, end, err);
            summary.windows_failed += 1;
        }

        if !run_till_complete {
            break;
        }
        if archive::get_latest_scene(&ctx.output_dir)? == recorded {
            warn!("No progress beyond {}, stopping", latest);
            break;
        }
    }
    Ok(summary)
}

pub async fn fetch_data(
    ctx: &Context,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
    summary: &mut MonitorSummary,
) -> Result<()> {
    let body = stac_operations::search_body(
        &ctx.profile,
        &ctx.aoi.geojson,
        start,
        end,
        ctx.settings.page_size,
    );
    let items = stac_operations::search(&ctx.client, &ctx.settings.stac_api, &body).await?;
    if items.is_empty() {
        archive::set_latest_scene(&ctx.output_dir, end, today)?;
        info!("No data found between {} and {}", start, end);
        return Ok(());
    }
    info!("Found {} items", items.len());

    for (date, items) in stac_operations::group_by_date(items)? {
        let scene_dir = match archive::make_output_dir_scene(&ctx.output_dir, date)? {
            SceneDir::Complete(_) => {
                info!("Scene {} already processed", date);
                archive::set_latest_scene(&ctx.output_dir, date, today)?;
                summary.scenes_skipped += 1;
                continue;
            }
            SceneDir::Fresh(dir) => dir,
        };

        let cache_dir = ctx
            .output_dir
            .join(DOWNLOADS)
            .join(date.format(archive::DATE_FORMAT).to_string());
        match process_scene(ctx, date, &items, &scene_dir, &cache_dir).await {
            Ok(SceneOutcome::Written) => {
                archive::set_latest_scene(&ctx.output_dir, date, today)?;
                archive::indicate_complete(&scene_dir)?;
                info!("Processed scene {}", date);
                summary.scenes_written += 1;
                remove_downloads(ctx, &cache_dir);
            }
            Ok(SceneOutcome::Empty) => {
                warn!("Scene {} has no valid pixels inside the area of interest", date);
                archive::set_latest_scene(&ctx.output_dir, date, today)?;
                summary.scenes_skipped += 1;
                remove_downloads(ctx, &cache_dir);
            }
            // Partial downloads stay behind for the next attempt to resume.
            Err(err) => {
                error!("Error while post-processing scene {}: {:#}", date, err);
                summary.scenes_failed += 1;
            }
        }
    }
    Ok(())
}

fn remove_downloads(ctx: &Context, cache_dir: &Path) {
    if ctx.settings.keep_downloads || !cache_dir.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(cache_dir) {
        warn!("Unable to remove {}: {}", cache_dir.display(), err);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SceneOutcome {
    Written,
    Empty,
}

/// Everything needed to sample one item, as local (or GDAL virtual) paths.
#[derive(Debug, Clone)]
struct ItemInput {
    source: SourceItem,
    band_paths: Vec<String>,
    quality_path: String,
    scaling: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct SceneJob {
    date: NaiveDate,
    grid: Grid,
    epsg: u32,
    profile: PlatformProfile,
    inside: Vec<bool>,
    items: Vec<ItemInput>,
    scene_dir: PathBuf,
}

async fn process_scene(
    ctx: &Context,
    date: NaiveDate,
    items: &[Item],
    scene_dir: &Path,
    cache_dir: &Path,
) -> Result<SceneOutcome> {
    let mut tasks = vec![];
    let mut inputs = vec![];
    for item in items {
        let (input, item_tasks) = resolve_item(ctx, item, cache_dir).await?;
        tasks.extend(item_tasks);
        inputs.push(input);
    }

    if !tasks.is_empty() {
        fs::create_dir_all(cache_dir)?;
        let plan = DownloadPlan::new(tasks);
        info!("Downloading {} assets for {}", plan.tasks().len(), date);
        plan.write(cache_dir.join("download_plan.json"))?;
        plan.execute(
            &ctx.store,
            ctx.settings.concurrent_downloads,
            ctx.settings.max_retries,
        )
        .await?;
    }

    let grid = ctx.aoi.grid(ctx.profile.target_resolution)?;
    let job = SceneJob {
        date,
        grid,
        epsg: ctx.aoi.target_epsg,
        profile: ctx.profile.clone(),
        inside: ctx.aoi.rasterize(&grid),
        items: inputs,
        scene_dir: scene_dir.to_path_buf(),
    };
    tokio::task::spawn_blocking(move || build_scene(job)).await?
}

/// Sign the assets of `item` and decide where GDAL will read them from.
async fn resolve_item(
    ctx: &Context,
    item: &Item,
    cache_dir: &Path,
) -> Result<(ItemInput, Vec<DownloadTask>)> {
    let profile = &ctx.profile;
    let baseline_offset = profile.baseline_offset.as_ref().and_then(|b| {
        b.offset_for(stac_operations::item_property(item, &b.property).as_deref())
    });

    let mut tasks = vec![];
    let mut paths = vec![];
    let mut scaling = vec![];
    for key in profile.asset_keys() {
        let info = AssetInfo::from_item(item, key)?;
        if let Some(spec) = profile.bands.iter().find(|b| b.asset == key) {
            scaling.push(band_scaling(&info, baseline_offset, spec.scale, spec.offset));
        }
        let href = ctx.signer.sign(&profile.collection, &info.href).await?;
        let path = match ctx.settings.access {
            AssetAccess::Stream => stream_path(&href)?,
            AssetAccess::Download => {
                let output = cache_dir.join(&item.id).join(info.file_name());
                let output = output.to_string_lossy().to_string();
                tasks.push(DownloadTask::new(&href, &output).with_size(info.size));
                output
            }
        };
        paths.push(path);
    }

    let quality_path = paths
        .pop()
        .ok_or_else(|| BasetiffsError::MissingAsset {
            item: item.id.to_owned(),
            asset: profile.quality.asset.to_owned(),
        })?;
    let source = SourceItem {
        id: item.id.to_owned(),
        product_uri: stac_operations::product_uri(item, &profile.product_uri_property),
        datetime: stac_operations::item_datetime(item)?,
    };
    debug!("Resolved {} assets of {}", paths.len() + 1, item.id);
    Ok((
        ItemInput {
            source,
            band_paths: paths,
            quality_path,
            scaling,
        },
        tasks,
    ))
}

/// Scale and offset of a band: the catalogue's own values first, then the
/// processing baseline offset, then the platform defaults.
fn band_scaling(
    info: &AssetInfo,
    baseline_offset: Option<f64>,
    default_scale: f64,
    default_offset: f64,
) -> (f64, f64) {
    (
        info.scale.unwrap_or(default_scale),
        info.offset.or(baseline_offset).unwrap_or(default_offset),
    )
}

/// GDAL virtual file system path for reading `href` in place.
fn stream_path(href: &str) -> Result<String> {
    if let Ok(object) = S3Object::from_url(href) {
        return Ok(object.vsi_path());
    }
    if href.starts_with("https://") || href.starts_with("http://") {
        return Ok(format!("/vsicurl/{href}"));
    }
    Err(BasetiffsError::UnsupportedHref(href.to_owned()).into())
}

fn sample_item(job: &SceneJob, item: &ItemInput) -> Result<SceneLayer> {
    let bands = job
        .profile
        .bands
        .iter()
        .zip(&item.band_paths)
        .map(|(spec, path)| raster::sample_asset(path, &job.grid, job.epsg, spec.nodata as f32))
        .collect::<Result<Vec<_>>>()?;
    let quality = raster::sample_asset(&item.quality_path, &job.grid, job.epsg, 0.0)?;
    Ok(SceneLayer {
        source: item.source.clone(),
        bands,
        quality,
        scaling: item.scaling.clone(),
    })
}

fn build_scene(job: SceneJob) -> Result<SceneOutcome> {
    let mut scene = Scene::new(job.date, job.grid, job.epsg, &job.profile);
    for item in &job.items {
        match sample_item(&job, item) {
            Ok(layer) => scene.merge(layer),
            Err(err) if matches!(err.downcast_ref(), Some(BasetiffsError::NoOverlap(_))) => {
                debug!("Skipping {}: {}", item.source.id, err);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Unable to read {}", item.source.id))
            }
        }
    }

    scene.clip(&job.inside);
    if scene.valid_pixel_count() == 0 {
        return Ok(SceneOutcome::Empty);
    }

    outputs::write_cloud_products(&scene, &job.scene_dir)?;
    scene.mask_clouds_and_shadows();
    outputs::write_reflectance_products(&scene, &job.profile, &job.scene_dir)?;
    Ok(SceneOutcome::Written)
}
