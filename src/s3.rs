//! Utility functions for creating s3 clients and recognising s3 hrefs
use anyhow::{anyhow, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use regex::Regex;
use std::sync::OnceLock;

pub async fn client_from_profile(profile_name: &str, region: &str) -> Client {
    let base_config = aws_config::defaults(BehaviorVersion::latest())
        .profile_name(profile_name)
        .region(Region::new(region.to_owned()))
        .load()
        .await;
    Client::new(&base_config)
}

pub async fn anon_client(region: &str) -> Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .no_credentials()
        .region(Region::new(region.to_owned()))
        .load()
        .await;
    Client::new(&config)
}

#[derive(Debug, PartialEq)]
pub struct S3Object {
    /// Only known for virtual-hosted style URLs.
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
}

fn https_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^https://(?<bucket>[\d\w.-]+)\.s3\.(?<region>[\d\w-]+)\.amazonaws\.com/(?<key>[^?#]+)",
        )
        .expect("Regex pattern should always compile")
    })
}

fn s3_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^s3://(?<bucket>[^/]+)/(?<key>.+)")
            .expect("Regex pattern should always compile")
    })
}

impl S3Object {
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(captures) = https_pattern().captures(url) {
            let (_, [bucket, region, key]) = captures.extract();
            return Ok(Self {
                region: Some(region.to_string()),
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        let captures = s3_pattern()
            .captures(url)
            .ok_or(anyhow!("No regex matches found for: {}", url))?;
        let (_, [bucket, key]) = captures.extract();
        Ok(Self {
            region: None,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Path GDAL's S3 virtual file system understands.
    pub fn vsi_path(self: &Self) -> String {
        format!("/vsis3/{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_object_from_url() {
        let url = "https://e84-earth-search-sentinel-data.s3.us-west-2.amazonaws.com/sentinel-2-c1-l2a/7/V/DG/2024/5/S2A_T07VDG_20240529T205023_L2A/B08.tif";
        let object = S3Object::from_url(url).unwrap();
        assert_eq!(
            object,
            S3Object {
                bucket: "e84-earth-search-sentinel-data".to_string(),
                region: Some("us-west-2".to_string()),
                key: "sentinel-2-c1-l2a/7/V/DG/2024/5/S2A_T07VDG_20240529T205023_L2A/B08.tif"
                    .to_string()
            }
        );
    }

    #[test]
    fn test_s3_object_from_s3_url() {
        let url = "s3://usgs-landsat/collection02/level-2/standard/oli-tirs/2024/195/027/LC09_L2SP_195027_20240529_20240530_02_T1_SR_B4.TIF";
        let object = S3Object::from_url(url).unwrap();
        assert_eq!(object.region, None);
        assert_eq!(object.bucket, "usgs-landsat");
        assert!(object.key.ends_with("SR_B4.TIF"));
        assert_eq!(
            object.vsi_path(),
            format!("/vsis3/usgs-landsat/{}", object.key)
        );
    }

    #[test]
    fn test_query_is_not_part_of_key() {
        let object =
            S3Object::from_url("https://bucket.s3.eu-central-1.amazonaws.com/a/b.tif?x=1").unwrap();
        assert_eq!(object.key, "a/b.tif");
    }

    #[test]
    fn test_other_urls_are_rejected() {
        assert!(S3Object::from_url("https://sentinel2l2a01.blob.core.windows.net/x.tif").is_err());
        assert!(S3Object::from_url("/tmp/x.tif").is_err());
    }
}
