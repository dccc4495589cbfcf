//! Anonymous S3-compatible bucket access over HTTP
//!
//! Listing uses ListObjectsV2 (`?list-type=2`) with continuation-token
//! pagination. Objects are streamed into `<local>.part` and renamed into place
//! once the body has been fully written.

use super::{ObjectStore, partial_path};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::types::ObjectRef;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use url::Url;

/// One page of a ListObjectsV2 response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    size: u64,
}

/// Path-style HTTP client for a public bucket
#[derive(Clone, Debug)]
pub struct HttpBucketStore {
    client: reqwest::Client,
    bucket_url: Url,
}

impl HttpBucketStore {
    /// Build a store for `config.bucket` at `config.endpoint`
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut bucket_url = Url::parse(&config.endpoint)
            .map_err(|e| Error::config("store.endpoint", format!("invalid URL: {e}")))?;
        bucket_url
            .path_segments_mut()
            .map_err(|_| Error::config("store.endpoint", "endpoint cannot hold a path"))?
            .pop_if_empty()
            .push(&config.bucket);

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, bucket_url })
    }

    fn object_url(&self, key: &str) -> Url {
        let mut url = self.bucket_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.split('/'));
        }
        url
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListBucketResult> {
        let mut url = self.bucket_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2").append_pair("prefix", prefix);
            if let Some(token) = token {
                query.append_pair("continuation-token", token);
            }
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Store {
                status: status.as_u16(),
                key: prefix.to_string(),
            });
        }

        let body = response.text().await?;
        Ok(quick_xml::de::from_str(&body)?)
    }

    async fn stream_to(&self, key: &str, part: &Path) -> Result<u64> {
        let mut response = self.client.get(self.object_url(key)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Store {
                status: status.as_u16(),
                key: key.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for HttpBucketStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.list_page(prefix, token.as_deref()).await?;
            objects.extend(page.contents.into_iter().map(|o| ObjectRef {
                key: o.key,
                size: o.size,
            }));

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }

        tracing::debug!(prefix, count = objects.len(), "Listed bucket prefix");
        Ok(objects)
    }

    async fn fetch(&self, key: &str, local_path: &Path) -> Result<u64> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = partial_path(local_path);
        let result = match self.stream_to(key, &part).await {
            Ok(written) => tokio::fs::rename(&part, local_path)
                .await
                .map(|()| written)
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        result
    }
}
