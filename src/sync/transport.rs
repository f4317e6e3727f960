//! HTTP transport seam shared by the reconciler and the interceptor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
    }
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("unsupported method '{}'", other)),
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  /// Top-level page navigation rather than a subresource fetch
  pub navigation: bool,
}

impl HttpRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      headers: Vec::new(),
      body: None,
      navigation: false,
    }
  }

  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      ..Self::get(url)
    }
  }

  pub fn json(mut self, body: &serde_json::Value) -> Result<Self, SyncError> {
    self.body = Some(serde_json::to_vec(body)?);
    Ok(self.header("Content-Type", "application/json"))
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigation = true;
    self
  }
}

/// A response as seen by the engine: status, content type, body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, content_type: Option<&str>, body: Vec<u8>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, SyncError> {
    Ok(serde_json::from_slice(&self.body)?)
  }
}

/// Sends requests to the network.
///
/// Any HTTP status is a successful send; only transport failures are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SyncError>;
}

/// `reqwest` backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, SyncError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SyncError> {
    let mut builder = self
      .client
      .request(request.method.into(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await?.to_vec();

    tracing::debug!(url = %request.url, status, bytes = body.len(), "network response");

    Ok(HttpResponse {
      status,
      content_type,
      body,
    })
  }
}
