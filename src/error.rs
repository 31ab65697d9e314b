use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BasetiffsError {
    #[error("{0} does not exist")]
    AoiNotFound(PathBuf),

    #[error("No area of interest given")]
    MissingAreaOfInterest,

    #[error("Area of interest in {0} contains no polygons")]
    EmptyAoi(PathBuf),

    #[error("Malformed latest scene marker {path}: {content:?}")]
    MalformedLatestScene { path: PathBuf, content: String },

    #[error("Item {item} has no asset '{asset}'")]
    MissingAsset { item: String, asset: String },

    #[error("Unsupported asset href: {0}")]
    UnsupportedHref(String),

    #[error("Asset {0} does not overlap the output grid")]
    NoOverlap(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}
