//! Scripted transport for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::client::Transport;
use super::types::{Request, Response};

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
}

/// Replies per URL path. Unscripted paths answer 404; `set_online(false)` fails everything.
pub struct MockTransport {
  replies: Mutex<HashMap<String, Reply>>,
  calls: Mutex<Vec<Request>>,
  online: AtomicBool,
  delay: Option<Duration>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self {
      replies: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
      online: AtomicBool::new(true),
      delay: None,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(path.to_string(), Reply::Respond(Response::new(status, body)));
  }

  pub fn fail(&self, path: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(path.to_string(), Reply::Fail);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }

    let reply = self.replies.lock().unwrap().get(request.url.path()).cloned();
    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Fail) => Err(eyre!("connection reset")),
      None => Ok(Response::new(404, "not found")),
    }
  }
}
