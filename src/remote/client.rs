use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::types::{Headers, Request, Response};

/// Anything that can carry a request to the remote API.
///
/// `Err` means the request never produced an HTTP response (DNS, refused
/// connection, reset). Non-2xx statuses are `Ok` and left to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed transport used outside of tests.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(connect_timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
      builder = builder.connect_timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

    let status = response.status().as_u16();
    // Repeated headers are folded into one comma-separated value
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      let Ok(value) = value.to_str() else {
        continue;
      };
      headers
        .entry(name.as_str().to_string())
        .and_modify(|folded: &mut String| {
          folded.push_str(", ");
          folded.push_str(value);
        })
        .or_insert_with(|| value.to_string());
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
      synthetic: false,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;
  use wiremock::matchers::{body_bytes, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_get_returns_status_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/list"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header("content-type", "application/json")
          .set_body_string("[]"),
      )
      .mount(&server)
      .await;

    let transport = HttpTransport::new(None).unwrap();
    let url = Url::parse(&format!("{}/api/list", server.uri())).unwrap();
    let response = transport.send(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert_eq!(response.text(), "[]");
    assert!(!response.synthetic);
  }

  #[tokio::test]
  async fn test_repeated_headers_are_folded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(
        ResponseTemplate::new(200)
          .append_header("set-cookie", "session=abc")
          .append_header("set-cookie", "theme=dark"),
      )
      .mount(&server)
      .await;

    let transport = HttpTransport::new(None).unwrap();
    let url = Url::parse(&server.uri()).unwrap();
    let response = transport.send(&Request::get(url)).await.unwrap();

    assert_eq!(
      response.header("set-cookie"),
      Some("session=abc, theme=dark")
    );
  }

  #[tokio::test]
  async fn test_post_sends_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/upload"))
      .and(header("x-upload-path", "/docs"))
      .and(body_bytes(b"payload".to_vec()))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let transport = HttpTransport::new(None).unwrap();
    let url = Url::parse(&format!("{}/api/upload", server.uri())).unwrap();
    let request = Request::post(url, b"payload".to_vec()).with_header("X-Upload-Path", "/docs");
    let response = transport.send(&request).await.unwrap();

    assert_eq!(response.status, 201);
    assert!(response.is_success());
  }

  #[tokio::test]
  async fn test_non_success_status_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let transport = HttpTransport::new(None).unwrap();
    let url = Url::parse(&server.uri()).unwrap();
    let response = transport.send(&Request::get(url)).await.unwrap();

    assert_eq!(response.status, 500);
    assert!(!response.is_success());
  }

  #[tokio::test]
  async fn test_connection_failure_is_an_error() {
    let transport = HttpTransport::new(Some(Duration::from_millis(200))).unwrap();
    // Port 9 (discard) is closed on test hosts.
    let url = Url::parse("http://127.0.0.1:9/").unwrap();

    assert!(transport.send(&Request::get(url)).await.is_err());
  }
}
