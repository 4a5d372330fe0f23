//! Cache tiers and the versioned generations that partition them.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

use crate::remote::Response;

/// The closed set of cache tiers. Each tier has exactly one live generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
  /// Shell assets and icons, served cache-first
  Static,
  /// Idempotent API reads, served network-first
  Api,
  /// Everything else, served stale-while-revalidate
  General,
}

impl Tier {
  pub const ALL: [Tier; 3] = [Tier::Static, Tier::Api, Tier::General];

  pub fn as_str(&self) -> &'static str {
    match self {
      Tier::Static => "static",
      Tier::Api => "api",
      Tier::General => "general",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A tier pinned to a deploy version, e.g. `static-v2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheGeneration {
  pub tier: Tier,
  pub version: String,
}

impl CacheGeneration {
  pub fn new(tier: Tier, version: impl Into<String>) -> Self {
    Self {
      tier,
      version: version.into(),
    }
  }

  /// Storage name of this generation.
  pub fn name(&self) -> String {
    format!("{}-{}", self.tier, self.version)
  }
}

/// One version per tier for the current deploy.
///
/// Holding a field per tier (rather than a list) is what keeps "exactly one
/// active generation per tier" true.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheManifest {
  #[serde(rename = "static")]
  pub static_version: String,
  #[serde(rename = "api")]
  pub api_version: String,
  #[serde(rename = "general")]
  pub general_version: String,
}

impl Default for CacheManifest {
  fn default() -> Self {
    Self {
      static_version: "v1".to_string(),
      api_version: "v1".to_string(),
      general_version: "v1".to_string(),
    }
  }
}

impl CacheManifest {
  pub fn generation(&self, tier: Tier) -> CacheGeneration {
    let version = match tier {
      Tier::Static => &self.static_version,
      Tier::Api => &self.api_version,
      Tier::General => &self.general_version,
    };
    CacheGeneration::new(tier, version.clone())
  }

  pub fn current(&self) -> [CacheGeneration; 3] {
    Tier::ALL.map(|tier| self.generation(tier))
  }

  pub fn current_names(&self) -> Vec<String> {
    self.current().iter().map(CacheGeneration::name).collect()
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub url: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}
