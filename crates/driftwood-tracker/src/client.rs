//! HTTP announce round trip. Runs on worker tasks, never on the scheduler.

use std::time::Duration;

use reqwest::{Client, Proxy};

use crate::error::{TrackerError, TrackerResult};

/// Shared HTTP client for tracker announces.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: Client,
}

impl TrackerClient {
    /// Build a client with a request timeout and optional proxy.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Client`] if the proxy URL is invalid or the
    /// client cannot be built.
    pub fn new(timeout: Duration, proxy: Option<&str>) -> TrackerResult<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("driftwood/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(Proxy::all(proxy).map_err(|source| TrackerError::Client { source })?);
        }
        let http = builder
            .build()
            .map_err(|source| TrackerError::Client { source })?;
        Ok(Self { http })
    }

    /// Fetch a fully built announce URL and return the raw body.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn announce(&self, url: &str) -> TrackerResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| TrackerError::Request { source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Status {
                status: status.as_u16(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| TrackerError::Request { source })?;
        Ok(body.to_vec())
    }
}
