use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::error::Result;

/// A fully built `POST` to the registry.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request. Any HTTP status is a response; only failures to
    /// get one (connect, TLS, timeout, body read) are errors.
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse>;
}
