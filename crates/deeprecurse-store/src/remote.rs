use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{ContextStore, StoreError};

/// Client for a store exposed over HTTP by another gateway:
/// `GET /store/context?key=..`, `POST /store/append?key=..` and
/// `GET /store/keys?prefix=..`.
#[derive(Clone)]
pub struct RemoteContextStore {
    base_url: String,
    client: Client,
}

impl RemoteContextStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, route: &str, param: &str, value: &str) -> String {
        format!(
            "{}/store/{route}?{param}={}",
            self.base_url,
            urlencoding::encode(value)
        )
    }

    async fn post_append(&self, key: &str, separator: &str, text: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
        }
        let res = self
            .client
            .post(self.url("append", "key", key))
            .json(&AppendRequest { text, separator })
            .send()
            .await?;
        let status = res.status().as_u16();
        if !res.status().is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Remote { status, body });
        }
        let parsed: AppendResponse = res.json().await?;
        if !parsed.ok {
            return Err(StoreError::Remote {
                status,
                body: "append was not acknowledged".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    context: String,
}

#[derive(Debug, Serialize)]
struct AppendRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    separator: &'a str,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    #[serde(default)]
    ok: bool,
}

#[async_trait]
impl ContextStore for RemoteContextStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn read(&self, key: &str) -> Result<String, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
        }
        let res = self.client.get(self.url("context", "key", key)).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Remote { status, body });
        }
        let parsed: ReadResponse = res.json().await?;
        Ok(parsed.context)
    }

    async fn append(&self, key: &str, text: &str) -> Result<(), StoreError> {
        self.post_append(key, "", text).await
    }

    async fn append_separated(
        &self,
        key: &str,
        separator: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        self.post_append(key, separator, text).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let res = self.client.get(self.url("keys", "prefix", prefix)).send().await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Remote { status, body });
        }
        let parsed: KeysResponse = res.json().await?;
        Ok(parsed.keys)
    }
}
