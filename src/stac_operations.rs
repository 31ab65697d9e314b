use crate::error::BasetiffsError;
use crate::platform::PlatformProfile;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use stac::{Asset, Item};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    pub key: String,
    pub href: String,
    /// `file:size` in bytes.
    pub size: Option<u64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

impl AssetInfo {
    pub fn from_item(item: &Item, key: &str) -> Result<Self, BasetiffsError> {
        let asset = item
            .assets
            .get(key)
            .ok_or_else(|| BasetiffsError::MissingAsset {
                item: item.id.to_owned(),
                asset: key.to_owned(),
            })?;
        let raster_band = Self::extract_raster_band(asset);
        Ok(Self {
            key: key.to_owned(),
            href: asset.href.to_owned(),
            size: Self::extract_file_size(asset),
            scale: raster_band
                .as_ref()
                .and_then(|b| b.get("scale")?.as_f64()),
            offset: raster_band
                .as_ref()
                .and_then(|b| b.get("offset")?.as_f64()),
        })
    }

    fn extract_file_size(asset: &Asset) -> Option<u64> {
        let size = asset.additional_fields.get("file:size")?.as_u64()?;
        Some(size)
    }

    /// First entry of the `raster:bands` extension, if the catalogue has it.
    fn extract_raster_band(asset: &Asset) -> Option<Map<String, Value>> {
        let band = asset
            .additional_fields
            .get("raster:bands")?
            .as_array()?
            .first()?
            .as_object()?
            .to_owned();
        Some(band)
    }

    /// File name the asset is cached under, keeping the remote extension.
    pub fn file_name(&self) -> String {
        let path = self.href.split(['?', '#']).next().unwrap_or_default();
        match path.rsplit('/').next().and_then(|name| name.rsplit_once('.')) {
            Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => {
                format!("{}.{}", self.key, ext)
            }
            _ => self.key.to_owned(),
        }
    }
}

/// Body of a POST `/search` request for one platform, area and time window.
pub fn search_body(
    profile: &PlatformProfile,
    intersects: &Value,
    start: NaiveDate,
    end: NaiveDate,
    limit: u32,
) -> Value {
    let mut query = Map::new();
    query.insert(
        profile.cloud_cover_property.to_owned(),
        json!({"lt": profile.max_cloud_cover}),
    );
    json!({
        "collections": [profile.collection],
        "intersects": intersects,
        "datetime": format!("{}T00:00:00Z/{}T23:59:59Z", start, end),
        "query": query,
        "limit": limit,
    })
}

#[derive(Deserialize, Debug, Clone)]
pub struct SearchLink {
    pub rel: String,
    pub href: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub merge: bool,
}

#[derive(Deserialize, Debug)]
pub struct SearchPage {
    #[serde(default)]
    pub features: Vec<Item>,
    #[serde(default)]
    pub links: Vec<SearchLink>,
}

impl SearchPage {
    pub fn next_link(self: &Self) -> Option<&SearchLink> {
        self.links.iter().find(|link| link.rel == "next")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchRequest {
    Get(String),
    Post(String, Value),
}

impl SearchRequest {
    /// Request that fetches the page a `next` link points to. POST links
    /// carry their own body, optionally merged over the previous one.
    pub fn follow(link: &SearchLink, previous: &SearchRequest) -> Self {
        let is_post = link
            .method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("POST"));
        if !is_post {
            return Self::Get(link.href.to_owned());
        }
        let body = match (&link.body, previous) {
            (Some(Value::Object(next)), Self::Post(_, Value::Object(prev))) if link.merge => {
                let mut merged = prev.clone();
                merged.extend(next.clone());
                Value::Object(merged)
            }
            (Some(body), _) => body.clone(),
            (None, Self::Post(_, prev)) => prev.clone(),
            (None, Self::Get(_)) => json!({}),
        };
        Self::Post(link.href.to_owned(), body)
    }

    async fn send(self: &Self, client: &reqwest::Client) -> Result<SearchPage> {
        let request = match self {
            Self::Get(url) => client.get(url),
            Self::Post(url, body) => client.post(url).json(body),
        };
        let page: SearchPage = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Unable to parse STAC search response")?;
        Ok(page)
    }
}

/// Run a search and follow `next` links until the result is exhausted.
pub async fn search(client: &reqwest::Client, url: &str, body: &Value) -> Result<Vec<Item>> {
    let mut request = SearchRequest::Post(url.to_owned(), body.clone());
    let mut items = vec![];
    loop {
        let page = request.send(client).await?;
        debug!("Search page returned {} items", page.features.len());
        let next = page.next_link().map(|link| SearchRequest::follow(link, &request));
        let empty = page.features.is_empty();
        items.extend(page.features);
        match next {
            Some(next) if !empty && next != request => request = next,
            _ => break,
        }
    }
    Ok(items)
}

fn properties(item: &Item) -> Result<Map<String, Value>> {
    match serde_json::to_value(&item.properties)? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Properties of {} are not an object", item.id)),
    }
}

/// A property rendered as text, whether the catalogue stores it as a string
/// or a number.
pub fn item_property(item: &Item, key: &str) -> Option<String> {
    match properties(item).ok()?.get(key)? {
        Value::String(s) => Some(s.to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn item_datetime(item: &Item) -> Result<DateTime<Utc>> {
    let properties = properties(item)?;
    let text = ["datetime", "start_datetime"]
        .iter()
        .find_map(|key| properties.get(*key)?.as_str())
        .ok_or_else(|| anyhow!("Item {} has no datetime", item.id))?;
    let datetime = DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("Invalid datetime {text} on item {}", item.id))?;
    Ok(datetime.with_timezone(&Utc))
}

/// Product identifier of an item, the item id when the catalogue lacks one.
pub fn product_uri(item: &Item, property: &str) -> String {
    item_property(item, property).unwrap_or_else(|| item.id.to_owned())
}

/// Items keyed by UTC sensing date, each day ordered by acquisition time.
pub fn group_by_date(items: Vec<Item>) -> Result<BTreeMap<NaiveDate, Vec<Item>>> {
    let mut dated = items
        .into_iter()
        .map(|item| Ok((item_datetime(&item)?, item)))
        .collect::<Result<Vec<_>>>()?;
    dated.sort_by(|(a, ia), (b, ib)| a.cmp(b).then_with(|| ia.id.cmp(&ib.id)));

    let mut grouped: BTreeMap<NaiveDate, Vec<Item>> = BTreeMap::new();
    for (datetime, item) in dated {
        grouped.entry(datetime.date_naive()).or_default().push(item);
    }
    Ok(grouped)
}
