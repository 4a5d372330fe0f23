//! Request classification: which strategy (if any) handles a request.

use serde::Deserialize;

use crate::cache::Tier;
use crate::remote::{Method, Request};

/// Path rules used to classify requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteRules {
  /// Path prefixes whose contents are static assets
  pub asset_dirs: Vec<String>,
  /// File extensions (without the dot) treated as static assets
  pub static_extensions: Vec<String>,
  /// File names treated as web app manifests
  pub manifest_files: Vec<String>,
  /// Path prefixes of idempotent API reads worth caching
  pub api_cache_prefixes: Vec<String>,
  /// Path prefixes of live-event streams, never intercepted
  pub stream_prefixes: Vec<String>,
}

impl Default for RouteRules {
  fn default() -> Self {
    let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    Self {
      asset_dirs: strings(&["/assets/"]),
      static_extensions: strings(&[
        "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
      ]),
      manifest_files: strings(&["manifest.json", "site.webmanifest"]),
      api_cache_prefixes: strings(&["/api/list", "/api/keys"]),
      stream_prefixes: strings(&["/api/events"]),
    }
  }
}

/// Why a request bypasses the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThrough {
  Method,
  Streaming,
  NoCache,
}

/// Caching policy applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl Strategy {
  /// The tier a strategy reads and writes.
  pub fn tier(&self) -> Tier {
    match self {
      Strategy::CacheFirst => Tier::Static,
      Strategy::NetworkFirst => Tier::Api,
      Strategy::StaleWhileRevalidate => Tier::General,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  PassThrough(PassThrough),
  Intercept(Strategy),
}

impl RouteRules {
  /// Classify a request. The first matching rule wins.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if request.method != Method::GET {
      return RequestClass::PassThrough(PassThrough::Method);
    }

    let path = request.url.path();
    if self.is_stream(path) {
      return RequestClass::PassThrough(PassThrough::Streaming);
    }
    if wants_no_cache(request) {
      return RequestClass::PassThrough(PassThrough::NoCache);
    }

    if self.is_static(path) {
      RequestClass::Intercept(Strategy::CacheFirst)
    } else if self.is_cacheable_api(path) {
      RequestClass::Intercept(Strategy::NetworkFirst)
    } else {
      RequestClass::Intercept(Strategy::StaleWhileRevalidate)
    }
  }

  fn is_stream(&self, path: &str) -> bool {
    self
      .stream_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
  }

  fn is_static(&self, path: &str) -> bool {
    if self
      .asset_dirs
      .iter()
      .any(|dir| path.starts_with(dir.as_str()))
    {
      return true;
    }

    let file_name = path.rsplit('/').next().unwrap_or_default();
    if self.manifest_files.iter().any(|m| m == file_name) || file_name.ends_with(".webmanifest") {
      return true;
    }

    match file_name.rsplit_once('.') {
      Some((_, ext)) => self
        .static_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(ext)),
      None => false,
    }
  }

  fn is_cacheable_api(&self, path: &str) -> bool {
    self
      .api_cache_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
  }
}

/// `Cache-Control: no-cache|no-store` or an `X-No-Cache` header.
fn wants_no_cache(request: &Request) -> bool {
  if request.header("x-no-cache").is_some() {
    return true;
  }
  request
    .header("cache-control")
    .map(|value| {
      value
        .split(',')
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store")
    })
    .unwrap_or(false)
}
