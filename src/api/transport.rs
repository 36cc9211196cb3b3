//! Request/response seam between the API clients and the network.
//!
//! The clients only ever see an [`ApiRequest`] going out and an
//! [`ApiResponse`] (status + body text) coming back. [`HttpTransport`] backs
//! this with `reqwest`; tests substitute a scripted transport.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Outgoing request. `path` is relative to the transport's base URL, or an
/// absolute `http(s)://` URL for endpoints living elsewhere.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(path)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

// ---

/// `reqwest`-backed transport with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        // ---
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        // ---
        let url = self.url_for(&request.path);
        tracing::debug!("{:?} {}", request.method, url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        builder = builder.query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;

        tracing::debug!("{} -> HTTP {} ({} bytes)", url, status, body.len());
        Ok(ApiResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_url_for_relative_and_absolute() {
        // ---
        let transport =
            HttpTransport::new("https://api.example.com/api/v0-1/", Duration::from_secs(5))
                .unwrap();

        assert_eq!(
            transport.url_for("/auth"),
            "https://api.example.com/api/v0-1/auth"
        );
        assert_eq!(
            transport.url_for("virtualentity"),
            "https://api.example.com/api/v0-1/virtualentity"
        );
        assert_eq!(
            transport.url_for("https://shelly-1-eu.shelly.cloud/device/status"),
            "https://shelly-1-eu.shelly.cloud/device/status"
        );
    }

    #[test]
    fn test_request_builder_lookup() {
        // ---
        let req = ApiRequest::get("resource/r1/readings")
            .query("period", "PT30M")
            .header("applicationid", "app");

        assert_eq!(req.method, Method::Get);
        assert_eq!(req.query_value("period"), Some("PT30M"));
        assert_eq!(req.header_value("ApplicationId"), Some("app"));
        assert_eq!(req.query_value("from"), None);
    }

    #[test]
    fn test_response_success_range() {
        // ---
        let ok = ApiResponse {
            status: 204,
            body: String::new(),
        };
        let bad = ApiResponse {
            status: 401,
            body: String::new(),
        };

        assert!(ok.is_success());
        assert!(!bad.is_success());
    }
}
