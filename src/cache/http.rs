//! Query fetcher backed by the HostPilot REST API.
//!
//! Raw response bodies go through the [`FastCache`] keyed by the full request
//! URL, so an invalidation pass purges both the parsed and the raw copy.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderValue};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::fast::FastCache;
use super::keys::{QueryKey, QueryKeyPart};
use super::query::{QueryError, QueryFetcher};

#[derive(Clone)]
pub struct HttpQueryFetcher {
    client: reqwest::Client,
    base_url: Url,
    fast: Arc<FastCache>,
}

impl HttpQueryFetcher {
    pub fn new(client: reqwest::Client, base_url: Url, fast: Arc<FastCache>) -> Self {
        Self {
            client,
            base_url,
            fast,
        }
    }

    /// Resolve a key to its request URL: the first text part is the path,
    /// scalar fields of object parts become query parameters.
    pub fn url_for(&self, key: &QueryKey) -> Result<Url, QueryError> {
        let path = key
            .parts()
            .iter()
            .find_map(|part| match part {
                QueryKeyPart::Text(text) => Some(text.as_str()),
                QueryKeyPart::Param(_) => None,
            })
            .ok_or_else(|| QueryError::fetch(key, "key has no endpoint part"))?;

        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| QueryError::fetch(key, err.to_string()))?;

        let mut params = Vec::new();
        for part in key.parts() {
            let QueryKeyPart::Param(Value::Object(map)) = part else {
                continue;
            };
            for (name, value) in map {
                match value {
                    Value::String(text) => params.push((name.clone(), text.clone())),
                    Value::Number(number) => params.push((name.clone(), number.to_string())),
                    Value::Bool(flag) => params.push((name.clone(), flag.to_string())),
                    _ => trace!(param = %name, "Skipping non-scalar query parameter"),
                }
            }
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }
}

#[async_trait]
impl QueryFetcher for HttpQueryFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, QueryError> {
        let url = self.url_for(key)?;

        if let Some(body) = self.fast.get(url.as_str()) {
            return serde_json::from_slice(&body)
                .map_err(|err| QueryError::fetch(key, err.to_string()));
        }

        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(|err| QueryError::fetch(key, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::fetch(key, format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| QueryError::fetch(key, err.to_string()))?;
        let value =
            serde_json::from_slice(&body).map_err(|err| QueryError::fetch(key, err.to_string()))?;

        debug!(url = %url, bytes = body.len(), "Fetched query");
        self.fast.set(url.as_str(), body);
        Ok(value)
    }
}
