//! Planetary Computer hands out blob storage assets only with a shared access
//! signature. Tokens are per collection and cached until shortly before they
//! expire.
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

const BLOB_STORAGE_SUFFIX: &str = ".blob.core.windows.net";

#[derive(Deserialize, Debug, Clone)]
pub struct SasToken {
    pub token: String,
    #[serde(rename = "msft:expiry")]
    pub expiry: DateTime<Utc>,
}

impl SasToken {
    fn is_fresh(self: &Self, now: DateTime<Utc>) -> bool {
        self.expiry - Duration::minutes(1) > now
    }
}

pub struct Signer {
    client: reqwest::Client,
    sas_api: Option<String>,
    tokens: Mutex<HashMap<String, SasToken>>,
}

impl Signer {
    /// A signer that leaves hrefs untouched when `sas_api` is `None`.
    pub fn new(client: reqwest::Client, sas_api: Option<String>) -> Self {
        Self {
            client,
            sas_api,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub async fn sign(self: &Self, collection: &str, href: &str) -> Result<String> {
        let Some(sas_api) = self.sas_api.as_deref() else {
            return Ok(href.to_owned());
        };
        if !needs_signing(href) {
            return Ok(href.to_owned());
        }
        let token = self.token(sas_api, collection).await?;
        append_token(href, &token)
    }

    async fn token(self: &Self, sas_api: &str, collection: &str) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(collection) {
            if token.is_fresh(Utc::now()) {
                return Ok(token.token.to_owned());
            }
        }
        let url = format!("{}/{}", sas_api.trim_end_matches('/'), collection);
        debug!("Requesting SAS token from {}", url);
        let token: SasToken = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("Unable to parse SAS token from {url}"))?;
        let value = token.token.to_owned();
        tokens.insert(collection.to_owned(), token);
        Ok(value)
    }
}

/// True for blob storage hrefs that do not carry a signature yet.
pub fn needs_signing(href: &str) -> bool {
    let Ok(url) = Url::parse(href) else {
        return false;
    };
    let on_blob_storage = url
        .host_str()
        .is_some_and(|host| host.ends_with(BLOB_STORAGE_SUFFIX));
    let signed = url.query_pairs().any(|(key, _)| key == "sig");
    on_blob_storage && !signed
}

/// Append a token (`key=value&...`) to the query of `href`.
pub fn append_token(href: &str, token: &str) -> Result<String> {
    let mut url = Url::parse(href).with_context(|| format!("Invalid href {href}"))?;
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
        _ => token.to_owned(),
    };
    url.set_query(Some(&query));
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HREF: &str =
        "https://sentinel2l2a01.blob.core.windows.net/sentinel2-l2/32/T/MT/B04_10m.tif";

    #[test]
    fn test_needs_signing() {
        assert!(needs_signing(HREF));
        assert!(!needs_signing(&format!("{HREF}?st=2024&sig=abc")));
        assert!(!needs_signing("https://landsateuwest.s3.eu-west-1.amazonaws.com/x.tif"));
        assert!(!needs_signing("s3://usgs-landsat/collection02/x.tif"));
        assert!(!needs_signing("not a url"));
    }

    #[test]
    fn test_append_token() {
        let signed = append_token(HREF, "st=2024-05-29&se=2024-05-30&sig=abc%3D").unwrap();
        assert_eq!(signed, format!("{HREF}?st=2024-05-29&se=2024-05-30&sig=abc%3D"));

        let signed = append_token(&format!("{HREF}?a=1"), "sig=abc").unwrap();
        assert!(signed.ends_with("?a=1&sig=abc"));
    }

    #[test]
    fn test_token_freshness() {
        let token: SasToken = serde_json::from_str(
            r#"{"msft:expiry": "2024-05-29T12:00:00Z", "token": "sig=abc"}"#,
        )
        .unwrap();
        let before = "2024-05-29T11:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let almost = "2024-05-29T11:59:30Z".parse::<DateTime<Utc>>().unwrap();
        assert!(token.is_fresh(before));
        assert!(!token.is_fresh(almost));
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let signer = Signer::new(reqwest::Client::new(), Some("http://127.0.0.1:9/token".into()));
        signer.tokens.lock().await.insert(
            "sentinel-2-l2a".to_string(),
            SasToken {
                token: "sig=cached".to_string(),
                expiry: Utc::now() + Duration::hours(1),
            },
        );
        let signed = signer.sign("sentinel-2-l2a", HREF).await.unwrap();
        assert_eq!(signed, format!("{HREF}?sig=cached"));
    }

    #[tokio::test]
    async fn test_signing_disabled() {
        let signer = Signer::new(reqwest::Client::new(), None);
        assert_eq!(signer.sign("sentinel-2-l2a", HREF).await.unwrap(), HREF);
    }
}
