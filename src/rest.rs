//! REST helper (spec §6): the "deliberately out of scope" HTTP-endpoint
//! helper whose interface is nonetheless pinned by the spec. A small, real
//! implementation rather than an omission, since callers need *something*
//! concrete to build requests against while exercising the transfer
//! coordinators in the same process.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{looks_like_html, TransferError};

/// Where cookies set by a response should be stored. `reqwest` without its
/// `cookies` feature has no jar to plug in, so this is tracked but not
/// wired to a real store yet; present for interface fidelity (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieStorage {
    Shared,
    None,
}

/// `baseUrlString + path + params + body + headers + method +
/// timeoutInterval + cookieStorage` (§6).
#[derive(Debug, Clone)]
pub struct RestDescriptor {
    pub base_url: String,
    pub path: String,
    pub params: Option<HashMap<String, String>>,
    pub body: Option<Vec<u8>>,
    pub headers: HeaderMap,
    pub method: Method,
    pub timeout: Duration,
    pub cookie_storage: CookieStorage,
    /// Response date format, default `yyyy-MM-dd HH:mm:ss` (§6). Exposed for
    /// callers' own `Deserialize` impls; this module does not itself parse
    /// dates out of response bodies.
    pub date_format: String,
}

impl RestDescriptor {
    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
            params: None,
            body: None,
            headers: HeaderMap::new(),
            method: Method::GET,
            timeout: Duration::from_secs(30),
            cookie_storage: CookieStorage::None,
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `endpointURL = baseUrl ⊕ path`, with `params` encoded as query items
    /// (§6).
    pub fn endpoint_url(&self) -> Result<Url, TransferError> {
        let mut url = Url::parse(&self.base_url).map_err(|_| TransferError::InvalidUrl)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| TransferError::InvalidUrl)?;
            segments.pop_if_empty();
            for segment in self.path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        if let Some(params) = &self.params {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Raw, undecoded response (§6 `request() -> RawResponse`).
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Thin wrapper over a `reqwest::Client` implementing the pinned REST
/// contract. One instance is cheap to share (reqwest's client is itself a
/// cheaply-clonable handle over a connection pool).
#[derive(Clone)]
pub struct RestClient {
    client: Client,
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RestClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// `request() -> RawResponse` (§6). A status outside `[200, 300)` fails
    /// with `ServerError` or `ServerErrorHtml` depending on whether the body
    /// looks like an HTML error page.
    pub async fn request(&self, descriptor: &RestDescriptor) -> Result<RawResponse, TransferError> {
        let url = descriptor.endpoint_url()?;
        let mut builder = self
            .client
            .request(descriptor.method.clone(), url)
            .headers(descriptor.headers.clone())
            .timeout(descriptor.timeout);
        if let Some(body) = &descriptor.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            let text = String::from_utf8_lossy(&body).to_string();
            return Err(if looks_like_html(&text) {
                TransferError::ServerErrorHtml { status, body: text }
            } else {
                TransferError::ServerError(status)
            });
        }

        Ok(RawResponse { status, body })
    }

    /// `request(responseAs: T) -> T` (§6): decodes the body as JSON.
    pub async fn request_as<T: DeserializeOwned>(&self, descriptor: &RestDescriptor) -> Result<T, TransferError> {
        let raw = self.request(descriptor).await?;
        serde_json::from_slice(&raw.body).map_err(|e| TransferError::DecodingError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_joins_base_and_path_and_encodes_params() {
        let descriptor = RestDescriptor::new("https://api.example.com/v1", "users/42").with_params(
            HashMap::from([("verbose".to_string(), "true".to_string())]),
        );
        let url = descriptor.endpoint_url().unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/42?verbose=true");
    }

    #[test]
    fn endpoint_url_rejects_unparsable_base() {
        let descriptor = RestDescriptor::new("not a url", "x");
        assert_eq!(descriptor.endpoint_url(), Err(TransferError::InvalidUrl));
    }
}
