#![allow(async_fn_in_trait)]
pub mod aoi;
pub mod archive;
pub mod cli;
pub mod config;
pub mod download_plan;
pub mod error;
pub mod monitor;
pub mod outputs;
pub mod platform;
pub mod provider;
pub mod raster;
pub mod s3;
pub mod scene;
pub mod signing;
pub mod stac_operations;
pub mod warp;

#[cfg(test)]
mod test_server;
