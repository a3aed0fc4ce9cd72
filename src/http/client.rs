//! Low-level HTTP client — `PrimeHttp`.
//!
//! A signed request helper, not an endpoint catalogue: callers pass the
//! resource path and their own request/response types. Every request gets a
//! fresh timestamp and signature. No retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Request, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{rest_headers, Credentials};
use crate::error::HttpError;

/// Low-level HTTP client for the REST API.
#[derive(Clone)]
pub struct PrimeHttp {
    base_url: String,
    client: Client,
    credentials: Arc<Credentials>,
}

impl PrimeHttp {
    pub fn new(
        base_url: &str,
        credentials: Arc<Credentials>,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base_url}{path}`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpError> {
        let request = self.build_request(Method::GET, path, None::<&()>, None::<&()>)?;
        self.execute(request).await
    }

    /// `GET` with URL-encoded query parameters. The query is not signed.
    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, HttpError> {
        let request = self.build_request(Method::GET, path, Some(query), None::<&()>)?;
        self.execute(request).await
    }

    /// `POST` a JSON body. The serialized body is what gets signed.
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        let request = self.build_request(Method::POST, path, None::<&()>, Some(body))?;
        self.execute(request).await
    }

    fn build_request<Q: Serialize, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<Request, HttpError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| HttpError::Encode(format!("Invalid URL for {}: {}", path, e)))?;

        if let Some(query) = query {
            let encoded =
                serde_urlencoded::to_string(query).map_err(|e| HttpError::Encode(e.to_string()))?;
            if !encoded.is_empty() {
                url.set_query(Some(&encoded));
            }
        }

        let body = match body {
            Some(b) => Some(serde_json::to_string(b).map_err(|e| HttpError::Encode(e.to_string()))?),
            None => None,
        };

        let signed = rest_headers(
            &self.credentials,
            method.as_str(),
            url.path(),
            body.as_deref().unwrap_or(""),
            Utc::now().timestamp(),
        );

        let mut headers = HeaderMap::new();
        for (name, value) in signed.pairs() {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HttpError::InvalidHeader { name })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| HttpError::InvalidHeader { name })?;
            headers.insert(header_name, header_value);
        }

        let mut req = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(body);
        }
        Ok(req.build()?)
    }

    async fn execute<T: DeserializeOwned>(&self, request: Request) -> Result<T, HttpError> {
        tracing::debug!("{} {}", request.method(), request.url());

        let resp = self.client.execute(request).await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::warn!("Request failed with status {}: {}", status.as_u16(), body);
        Err(HttpError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl std::fmt::Debug for PrimeHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimeHttp")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}
