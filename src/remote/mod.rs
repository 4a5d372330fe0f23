//! Remote API boundary: request/response model and the transport that reaches the server.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::{HttpTransport, Transport};
pub use types::{request_key, resolve_url, Headers, Method, Request, Response};
