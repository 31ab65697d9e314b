use crate::s3::{self, S3Object};
use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::types::RequestPayer;
use aws_sdk_s3::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use tokio::sync::Mutex;
use tracing::debug;

/// Somewhere asset bytes can be fetched from.
pub trait ObjectStore {
    async fn content_length(self: &Self, href: &str) -> Result<u64>;

    /// Append bytes `start..=end` of `href` to `file`. Returns the number of
    /// bytes the file grew by.
    async fn copy_range(self: &Self, href: &str, start: u64, end: u64, file: &mut File)
        -> Result<u64>;
}

pub struct HttpStore {
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ObjectStore for HttpStore {
    async fn content_length(self: &Self, href: &str) -> Result<u64> {
        let response = self.client.head(href).send().await?.error_for_status()?;
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(anyhow!("Error reading size of remote object"))?;
        Ok(length)
    }

    async fn copy_range(
        self: &Self,
        href: &str,
        start: u64,
        end: u64,
        file: &mut File,
    ) -> Result<u64> {
        let mut response = self
            .client
            .get(href)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?
            .error_for_status()?;

        // Servers ignoring the range send the whole body.
        if start > 0 && response.status() == StatusCode::OK {
            debug!("Range ignored by server, restarting {}", href);
            file.set_len(0)?;
        }

        let mut byte_count = 0_u64;
        while let Some(bytes) = response.chunk().await? {
            file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }
        Ok(byte_count)
    }
}

pub struct S3Store {
    profile: Option<String>,
    default_region: String,
    requester_pays: bool,
    clients: Mutex<HashMap<String, Client>>,
}

impl S3Store {
    pub fn new(profile: Option<String>, default_region: &str, requester_pays: bool) -> Self {
        Self {
            profile,
            default_region: default_region.to_owned(),
            requester_pays,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(self: &Self, object: &S3Object) -> Client {
        let region = object
            .region
            .clone()
            .unwrap_or_else(|| self.default_region.to_owned());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&region) {
            return client.clone();
        }
        let client = match &self.profile {
            Some(profile) => s3::client_from_profile(profile, &region).await,
            None => s3::anon_client(&region).await,
        };
        clients.insert(region, client.clone());
        client
    }

    fn request_payer(self: &Self) -> Option<RequestPayer> {
        self.requester_pays.then_some(RequestPayer::Requester)
    }
}

impl ObjectStore for S3Store {
    async fn content_length(self: &Self, href: &str) -> Result<u64> {
        let object = S3Object::from_url(href)?;
        let head_object = self
            .client(&object)
            .await
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_request_payer(self.request_payer())
            .send()
            .await
            .with_context(|| format!("HEAD {href}"))?;
        let total_size = head_object
            .content_length()
            .ok_or(anyhow!("Error reading size of remote object"))?;
        Ok(total_size as u64)
    }

    async fn copy_range(
        self: &Self,
        href: &str,
        start: u64,
        end: u64,
        file: &mut File,
    ) -> Result<u64> {
        let object = S3Object::from_url(href)?;
        let mut response = self
            .client(&object)
            .await
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .range(format!("bytes={}-{}", start, end))
            .set_request_payer(self.request_payer())
            .send()
            .await
            .with_context(|| format!("GET {href}"))?;

        let mut byte_count = 0_u64;
        while let Some(bytes) = response.body.try_next().await? {
            file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }
        Ok(byte_count)
    }
}

/// Sends S3 hrefs to the AWS SDK and everything else over plain HTTP.
pub struct RemoteStore {
    http: HttpStore,
    s3: S3Store,
}

impl RemoteStore {
    pub fn new(http: HttpStore, s3: S3Store) -> Self {
        Self { http, s3 }
    }
}

pub fn is_s3_href(href: &str) -> bool {
    S3Object::from_url(href).is_ok()
}

impl ObjectStore for RemoteStore {
    async fn content_length(self: &Self, href: &str) -> Result<u64> {
        if is_s3_href(href) {
            self.s3.content_length(href).await
        } else {
            self.http.content_length(href).await
        }
    }

    async fn copy_range(
        self: &Self,
        href: &str,
        start: u64,
        end: u64,
        file: &mut File,
    ) -> Result<u64> {
        if is_s3_href(href) {
            self.s3.copy_range(href, start, end, file).await
        } else {
            self.http.copy_range(href, start, end, file).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{serve, Reply, Request};
    use std::fs::{self, OpenOptions};

    const OBJECT: &[u8] = b"0123456789";

    fn open_partial(path: &std::path::Path, content: &[u8]) -> File {
        fs::write(path, content).unwrap();
        OpenOptions::new().read(true).append(true).open(path).unwrap()
    }

    /// Answers range requests with 206 and the requested slice.
    fn ranged(request: &Request) -> Reply {
        match request.header("range").and_then(|r| r.strip_prefix("bytes=")) {
            Some(range) => {
                let (start, end) = range.split_once('-').unwrap();
                let (start, end) = (start.parse::<usize>().unwrap(), end.parse::<usize>().unwrap());
                Reply::new(206, &OBJECT[start..=end])
            }
            None => Reply::new(200, OBJECT),
        }
    }

    #[tokio::test]
    async fn test_http_content_length() {
        let (url, _) = serve(ranged).await;
        let store = HttpStore::new(reqwest::Client::builder().no_proxy().build().unwrap());
        assert_eq!(store.content_length(&format!("{url}/B04.tif")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_http_range_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("B04.tif.partial");
        let mut file = open_partial(&path, b"0123");
        let (url, _) = serve(ranged).await;

        let store = HttpStore::new(reqwest::Client::builder().no_proxy().build().unwrap());
        let written = store.copy_range(&format!("{url}/B04.tif"), 4, 9, &mut file).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(fs::read(&path).unwrap(), OBJECT);
    }

    #[tokio::test]
    async fn test_http_ignored_range_restarts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("B04.tif.partial");
        let mut file = open_partial(&path, b"0123");
        let (url, requests) = serve(|_: &Request| Reply::new(200, OBJECT)).await;

        let store = HttpStore::new(reqwest::Client::builder().no_proxy().build().unwrap());
        let written = store.copy_range(&format!("{url}/B04.tif"), 4, 9, &mut file).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(fs::read(&path).unwrap(), OBJECT);
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = open_partial(&dir.path().join("SCL.tif.partial"), b"");
        let (url, _) = serve(|_: &Request| Reply::new(404, "")).await;

        let store = HttpStore::new(reqwest::Client::builder().no_proxy().build().unwrap());
        assert!(store.copy_range(&format!("{url}/SCL.tif"), 0, 9, &mut file).await.is_err());
    }

    #[test]
    fn test_s3_hrefs_are_routed_to_s3() {
        assert!(is_s3_href("s3://usgs-landsat/collection02/x.TIF"));
        assert!(is_s3_href(
            "https://usgs-landsat.s3.us-west-2.amazonaws.com/collection02/x.TIF"
        ));
        assert!(!is_s3_href(
            "https://landsateuwest.blob.core.windows.net/landsat-c2/x.TIF?sig=abc"
        ));
    }

    #[test]
    fn test_request_payer() {
        let store = S3Store::new(None, "us-west-2", true);
        assert_eq!(store.request_payer(), Some(RequestPayer::Requester));
        let store = S3Store::new(None, "us-west-2", false);
        assert_eq!(store.request_payer(), None);
    }
}
