//! Plain request/response snapshots exchanged with the remote API and the cache.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

pub use reqwest::Method;

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

/// An outbound request intercepted by the dispatcher or replayed by the drainer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      body: Some(body),
      ..Self::new(Method::POST, url)
    }
  }

  /// Add a header, normalizing the name to lower case.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_headers(mut self, headers: &Headers) -> Self {
    for (name, value) in headers {
      self.headers.insert(name.to_ascii_lowercase(), value.clone());
    }
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Cache key for this request. Only meaningful for GET.
  pub fn cache_key(&self) -> String {
    request_key(&self.url)
  }
}

/// A response snapshot. `synthetic` marks responses produced locally rather than by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub synthetic: bool,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
      synthetic: false,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx is the only success class the core recognizes.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Plain 503 returned when a static resource is neither cached nor reachable.
  pub fn offline() -> Self {
    Self {
      synthetic: true,
      ..Self::new(503, "Offline").with_header("content-type", "text/plain")
    }
  }

  /// JSON 503 returned when an API read is neither reachable nor cached.
  pub fn offline_json() -> Self {
    let body = serde_json::json!({
      "error": "Offline",
      "message": "This action requires an internet connection",
    });
    Self {
      synthetic: true,
      ..Self::new(503, body.to_string()).with_header("content-type", "application/json")
    }
  }
}

/// Stable cache key for a GET of `url`: hex SHA-256 of `"GET <url>"`.
pub fn request_key(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(format!("GET {}", url).as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse `target` as an absolute URL, or join it onto `base` when it is a path.
pub fn resolve_url(base: &Url, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => base
      .join(target)
      .map_err(|e| eyre!("Invalid path '{}': {}", target, e)),
    Err(e) => Err(eyre!("Invalid URL '{}': {}", target, e)),
  }
}
