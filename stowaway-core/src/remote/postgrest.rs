//! HTTP client for PostgREST-compatible REST endpoints.
//!
//! Every collection lives at `<base>/rest/v1/<collection>`:
//! - insert: `POST`
//! - upsert: `POST ?on_conflict=<cols>` with `Prefer: resolution=merge-duplicates`
//! - update: `PATCH ?id=eq.<id>`
//! - delete: `DELETE ?id=eq.<id>` (or `?<field>=eq.<value>`)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};

use super::{RemoteError, RemoteStore};
use crate::action::{Document, ID_FIELD};

/// Remote store backed by a PostgREST (or Supabase) server.
#[derive(Debug, Clone)]
pub struct PostgrestRemote {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl PostgrestRemote {
    /// Creates a client for `base_url`. `timeout` bounds every request.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into(),
            api_key,
            timeout,
            client,
        })
    }

    /// Returns the server URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds the endpoint URL for a collection with query parameters.
    fn endpoint(&self, collection: &str, params: &[(&str, String)]) -> Result<Url, RemoteError> {
        let url = format!(
            "{}/rest/v1/{}",
            self.base_url.trim_end_matches('/'),
            collection
        );
        Url::parse_with_params(&url, params)
            .map_err(|e| RemoteError::Network(format!("invalid URL '{}': {}", url, e)))
    }

    fn request(&self, method: Method, url: Url, prefer: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Prefer", prefer);

        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {}", key));
        }

        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<(), RemoteError> {
        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn classify(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl RemoteStore for PostgrestRemote {
    async fn insert(&self, collection: &str, document: &Document) -> Result<(), RemoteError> {
        let url = self.endpoint(collection, &[])?;
        let request = self
            .request(Method::POST, url, "return=minimal")
            .json(document);
        self.send(request).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Document,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(collection, &[(ID_FIELD, eq(id))])?;
        let request = self
            .request(Method::PATCH, url, "return=minimal")
            .json(patch);
        self.send(request).await
    }

    async fn upsert(
        &self,
        collection: &str,
        document: &Document,
        conflict_key: &[String],
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(collection, &[("on_conflict", conflict_key.join(","))])?;
        let request = self
            .request(
                Method::POST,
                url,
                "resolution=merge-duplicates,return=minimal",
            )
            .json(document);
        self.send(request).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.delete_matching(collection, ID_FIELD, id).await
    }

    async fn delete_matching(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(collection, &[(field, eq(value))])?;
        let request = self.request(Method::DELETE, url, "return=minimal");
        self.send(request).await
    }
}
