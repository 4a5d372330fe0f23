//! Strategy dispatcher: resolves intercepted requests against cache and network.

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::cache::{CacheManifest, CacheTiers, CachedEntry, GenerationHandle, Tier};
use crate::remote::{Request, Response, Transport};
use crate::routes::{RequestClass, RouteRules, Strategy};

/// Routes each request to cache-first, network-first, or stale-while-revalidate.
///
/// Cache writes and revalidations run on a `TaskTracker` and never delay the
/// response. Cache failures are logged and read as misses.
pub struct Dispatcher {
  rules: RouteRules,
  tiers: CacheTiers,
  handles: [GenerationHandle; 3],
  transport: Arc<dyn Transport>,
  background: TaskTracker,
}

impl Dispatcher {
  pub fn new(
    rules: RouteRules,
    manifest: &CacheManifest,
    tiers: CacheTiers,
    transport: Arc<dyn Transport>,
    background: TaskTracker,
  ) -> Self {
    let handles = manifest.current().map(|generation| GenerationHandle::from(&generation));
    Self {
      rules,
      tiers,
      handles,
      transport,
      background,
    }
  }

  fn handle(&self, tier: Tier) -> &GenerationHandle {
    match tier {
      Tier::Static => &self.handles[0],
      Tier::Api => &self.handles[1],
      Tier::General => &self.handles[2],
    }
  }

  /// Resolve one request.
  pub async fn dispatch(&self, request: Request) -> Response {
    match self.rules.classify(&request) {
      RequestClass::PassThrough(reason) => {
        debug!(?reason, url = %request.url, "passing request through");
        self.pass_through(&request).await
      }
      RequestClass::Intercept(strategy) => {
        let handle = self.handle(strategy.tier());
        match strategy {
          Strategy::CacheFirst => self.cache_first(handle, &request).await,
          Strategy::NetworkFirst => self.network_first(handle, &request).await,
          Strategy::StaleWhileRevalidate => self.stale_while_revalidate(handle, &request).await,
        }
      }
    }
  }

  /// Send straight to the network without touching the cache.
  pub async fn pass_through(&self, request: &Request) -> Response {
    match self.transport.send(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "pass-through request failed");
        Response::offline()
      }
    }
  }

  async fn cache_first(&self, handle: &GenerationHandle, request: &Request) -> Response {
    if let Some(entry) = self.lookup(handle, request).await {
      return entry.response;
    }

    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_in_background(handle, request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "cache miss while offline");
        Response::offline()
      }
    }
  }

  async fn network_first(&self, handle: &GenerationHandle, request: &Request) -> Response {
    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_in_background(handle, request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, falling back to cache");
        match self.lookup(handle, request).await {
          Some(entry) => entry.response,
          None => Response::offline_json(),
        }
      }
    }
  }

  async fn stale_while_revalidate(&self, handle: &GenerationHandle, request: &Request) -> Response {
    if let Some(entry) = self.lookup(handle, request).await {
      let transport = Arc::clone(&self.transport);
      let tiers = self.tiers.clone();
      let handle = handle.clone();
      let request = request.clone();
      self.background.spawn(async move {
        revalidate(transport.as_ref(), &tiers, &handle, &request).await;
      });
      return entry.response;
    }

    match self.transport.send(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_in_background(handle, request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "no cached copy and network failed");
        Response::offline()
      }
    }
  }

  async fn lookup(&self, handle: &GenerationHandle, request: &Request) -> Option<CachedEntry> {
    match self.tiers.match_entry(handle, &request.cache_key()).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(generation = handle.name(), error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  fn store_in_background(&self, handle: &GenerationHandle, request: &Request, response: &Response) {
    let tiers = self.tiers.clone();
    let handle = handle.clone();
    let key = request.cache_key();
    let url = request.url.to_string();
    let response = response.clone();
    self.background.spawn(async move {
      store(&tiers, &handle, &key, &url, &response).await;
    });
  }

  /// Wait for every background write and revalidation started so far.
  pub async fn settle(&self) {
    self.background.close();
    self.background.wait().await;
    self.background.reopen();
  }
}

async fn store(tiers: &CacheTiers, handle: &GenerationHandle, key: &str, url: &str, response: &Response) {
  if let Err(e) = tiers.put(handle, key, url, response).await {
    warn!(generation = handle.name(), url, error = %e, "cache write failed");
  }
}

/// Refresh a cached entry. Failures are swallowed: the stale copy was already served.
async fn revalidate(
  transport: &dyn Transport,
  tiers: &CacheTiers,
  handle: &GenerationHandle,
  request: &Request,
) {
  match transport.send(request).await {
    Ok(response) if response.is_success() => {
      store(tiers, handle, &request.cache_key(), request.url.as_str(), &response).await;
    }
    Ok(response) => {
      debug!(url = %request.url, status = response.status, "revalidation returned non-success");
    }
    Err(e) => {
      debug!(url = %request.url, error = %e, "revalidation failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::remote::mock::MockTransport;
  use color_eyre::{eyre::eyre, Result};
  use url::Url;

  struct Fixture {
    dispatcher: Dispatcher,
    transport: Arc<MockTransport>,
    tiers: CacheTiers,
  }

  fn fixture() -> Fixture {
    fixture_with(CacheTiers::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn fixture_with(tiers: CacheTiers) -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let dispatcher = Dispatcher::new(
      RouteRules::default(),
      &CacheManifest::default(),
      tiers.clone(),
      transport.clone(),
      TaskTracker::new(),
    );
    Fixture {
      dispatcher,
      transport,
      tiers,
    }
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://files.example").unwrap().join(path).unwrap())
  }

  async fn cached(f: &Fixture, tier: Tier, path: &str) -> Option<String> {
    f.tiers
      .match_entry(f.dispatcher.handle(tier), &get(path).cache_key())
      .await
      .unwrap()
      .map(|entry| entry.response.text())
  }

  async fn seed(f: &Fixture, tier: Tier, path: &str, body: &str) {
    f.tiers
      .put(
        f.dispatcher.handle(tier),
        &get(path).cache_key(),
        path,
        &Response::new(200, body),
      )
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let f = fixture();
    seed(&f, Tier::Static, "/assets/app.js", "cached").await;
    f.transport.respond("/assets/app.js", 200, "fresh");

    let response = f.dispatcher.dispatch(get("/assets/app.js")).await;

    assert_eq!(response.text(), "cached");
    assert_eq!(f.transport.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let f = fixture();
    f.transport.respond("/app.css", 200, "body{}");

    let response = f.dispatcher.dispatch(get("/app.css")).await;
    f.dispatcher.settle().await;

    assert_eq!(response.text(), "body{}");
    assert_eq!(cached(&f, Tier::Static, "/app.css").await.as_deref(), Some("body{}"));

    f.dispatcher.dispatch(get("/app.css")).await;
    assert_eq!(f.transport.calls_to("/app.css"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let f = fixture();

    let response = f.dispatcher.dispatch(get("/missing.png")).await;
    f.dispatcher.settle().await;

    assert_eq!(response.status, 404);
    assert!(cached(&f, Tier::Static, "/missing.png").await.is_none());
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_is_503() {
    let f = fixture();
    f.transport.set_online(false);

    let response = f.dispatcher.dispatch(get("/favicon.ico")).await;

    assert_eq!(response.status, 503);
    assert!(response.synthetic);
    assert_eq!(response.text(), "Offline");
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache() {
    let f = fixture();
    seed(&f, Tier::Api, "/api/list", "old").await;
    f.transport.respond("/api/list", 200, "new");

    let response = f.dispatcher.dispatch(get("/api/list")).await;
    f.dispatcher.settle().await;

    assert_eq!(response.text(), "new");
    assert_eq!(cached(&f, Tier::Api, "/api/list").await.as_deref(), Some("new"));
  }

  #[tokio::test]
  async fn test_network_first_failure_serves_cache() {
    let f = fixture();
    seed(&f, Tier::Api, "/api/keys", "prior").await;
    f.transport.fail("/api/keys");

    let response = f.dispatcher.dispatch(get("/api/keys")).await;

    assert_eq!(response.text(), "prior");
    assert_eq!(f.transport.calls_to("/api/keys"), 1);
  }

  #[tokio::test]
  async fn test_network_first_failure_without_cache_is_json_503() {
    let f = fixture();
    f.transport.set_online(false);

    let response = f.dispatcher.dispatch(get("/api/list?path=/")).await;

    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_stale_then_fresh() {
    let f = fixture();
    seed(&f, Tier::General, "/index.html", "E").await;
    f.transport.respond("/index.html", 200, "F");

    let first = f.dispatcher.dispatch(get("/index.html")).await;
    assert_eq!(first.text(), "E");

    f.dispatcher.settle().await;

    let second = f.dispatcher.dispatch(get("/index.html")).await;
    assert_eq!(second.text(), "F");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_for_network() {
    let f = fixture();
    f.transport.respond("/browse/docs", 200, "page");

    let response = f.dispatcher.dispatch(get("/browse/docs")).await;
    f.dispatcher.settle().await;

    assert_eq!(response.text(), "page");
    assert_eq!(cached(&f, Tier::General, "/browse/docs").await.as_deref(), Some("page"));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_swallows_revalidation_failure() {
    let f = fixture();
    seed(&f, Tier::General, "/", "stale").await;
    f.transport.fail("/");

    let response = f.dispatcher.dispatch(get("/")).await;
    f.dispatcher.settle().await;

    assert_eq!(response.text(), "stale");
    assert_eq!(cached(&f, Tier::General, "/").await.as_deref(), Some("stale"));
  }

  #[tokio::test]
  async fn test_pass_through_never_cached() {
    let f = fixture();
    f.transport.respond("/api/events", 200, "data: x");
    f.transport.respond("/api/list", 200, "[]");

    let streaming = get("/api/events");
    let no_cache = get("/api/list").with_header("Cache-Control", "no-cache");
    f.dispatcher.dispatch(streaming).await;
    f.dispatcher.dispatch(no_cache).await;
    f.dispatcher.settle().await;

    for tier in Tier::ALL {
      assert!(cached(&f, tier, "/api/events").await.is_none());
      assert!(cached(&f, tier, "/api/list").await.is_none());
    }
    assert_eq!(f.transport.total_calls(), 2);
  }

  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn create_generation(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn generations(&self) -> Result<Vec<String>> {
      Err(eyre!("disk full"))
    }

    fn delete_generation(&self, _name: &str) -> Result<bool> {
      Err(eyre!("disk full"))
    }

    fn get_entry(&self, _generation: &str, _request_key: &str) -> Result<Option<CachedEntry>> {
      Err(eyre!("disk full"))
    }

    fn put_entry(&self, _generation: &str, _key: &str, _entry: &CachedEntry) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn put_entries(&self, _generation: &str, _entries: &[(String, CachedEntry)]) -> Result<()> {
      Err(eyre!("disk full"))
    }
  }

  #[tokio::test]
  async fn test_storage_errors_degrade_to_network() {
    let f = fixture_with(CacheTiers::new(BrokenStorage));
    f.transport.respond("/app.js", 200, "js");
    f.transport.respond("/api/keys", 200, "keys");

    assert_eq!(f.dispatcher.dispatch(get("/app.js")).await.text(), "js");
    assert_eq!(f.dispatcher.dispatch(get("/api/keys")).await.text(), "keys");
    f.dispatcher.settle().await;

    f.transport.set_online(false);
    assert_eq!(f.dispatcher.dispatch(get("/app.js")).await.status, 503);
  }
}
