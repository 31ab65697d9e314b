//! State of the output folder. `latest_scene` holds the last date that is
//! done; every scene lives in a `YYYY-MM-DD` directory that is complete once
//! it holds `complete.txt`.
use crate::error::BasetiffsError;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LATEST_SCENE: &str = "latest_scene";
pub const COMPLETE: &str = "complete.txt";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Date recorded in `latest_scene`, `None` for a fresh output folder.
pub fn get_latest_scene(output_dir: &Path) -> Result<Option<NaiveDate>> {
    let path = output_dir.join(LATEST_SCENE);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Unable to read {}", path.display()))?;
    let date = NaiveDate::parse_from_str(content.trim(), DATE_FORMAT).map_err(|_| {
        BasetiffsError::MalformedLatestScene {
            path: path.to_owned(),
            content: content.to_owned(),
        }
    })?;
    Ok(Some(date))
}

/// Record `date` as done. Dates after `today` are recorded as `today`, so the
/// next window never starts in the future. Returns the recorded date.
pub fn set_latest_scene(output_dir: &Path, date: NaiveDate, today: NaiveDate) -> Result<NaiveDate> {
    let date = date.min(today);
    let path = output_dir.join(LATEST_SCENE);
    fs::write(&path, date.format(DATE_FORMAT).to_string())
        .with_context(|| format!("Unable to write {}", path.display()))?;
    debug!("Latest scene set to {}", date);
    Ok(date)
}

#[derive(Debug, PartialEq)]
pub enum SceneDir {
    /// Not processed yet (possibly left over from an earlier failed attempt).
    Fresh(PathBuf),
    Complete(PathBuf),
}

pub fn make_output_dir_scene(output_dir: &Path, date: NaiveDate) -> Result<SceneDir> {
    let scene_dir = output_dir.join(date.format(DATE_FORMAT).to_string());
    if scene_dir.join(COMPLETE).exists() {
        return Ok(SceneDir::Complete(scene_dir));
    }
    fs::create_dir_all(&scene_dir)
        .with_context(|| format!("Unable to create {}", scene_dir.display()))?;
    Ok(SceneDir::Fresh(scene_dir))
}

pub fn indicate_complete(scene_dir: &Path) -> Result<()> {
    fs::write(scene_dir.join(COMPLETE), "complete")?;
    Ok(())
}
