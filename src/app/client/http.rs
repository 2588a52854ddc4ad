//! Core HTTP operations with rate limiting
//!
//! This module provides the single-attempt request primitives behind the
//! [`ArchiveTransport`] trait. Every request waits on a shared `governor`
//! limiter; retry decisions live in the fetcher.

use std::num::NonZeroU32;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use governor::{clock::DefaultClock, state::InMemoryState, Jitter, Quota, RateLimiter};
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::ArchiveTransport;
use crate::constants::limits;
use crate::errors::{AttemptError, ConfigError, ConfigResult};

type DirectLimiter = RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>;

/// HTTP operations handler with client-side rate limiting
#[derive(Debug)]
pub struct HttpHandler {
    client: Client,
    rate_limiter: DirectLimiter,
}

impl HttpHandler {
    /// Creates a new HttpHandler with the given client and rate limiting
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `rate_limit_rps` is zero
    pub fn new(client: Client, rate_limit_rps: u32) -> ConfigResult<Self> {
        let rate_limiter = Self::build_rate_limiter(rate_limit_rps)?;
        Ok(Self {
            client,
            rate_limiter,
        })
    }

    fn build_rate_limiter(rate_limit_rps: u32) -> ConfigResult<DirectLimiter> {
        let rps = NonZeroU32::new(rate_limit_rps).ok_or_else(|| ConfigError::InvalidValue {
            field: "client.rate_limit_rps".to_string(),
            value: rate_limit_rps.to_string(),
            reason: "Rate limit must be non-zero".to_string(),
        })?;
        Ok(RateLimiter::direct(Quota::per_second(rps)))
    }

    /// Sends one rate-limited GET and checks the status code
    async fn get_response(&self, url: &Url) -> Result<reqwest::Response, AttemptError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(limits::RATE_LIMIT_JITTER))
            .await;

        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!("GET {} returned {}", url, status);
            return Err(AttemptError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Get a reference to the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ArchiveTransport for HttpHandler {
    async fn fetch_page(&self, url: &Url) -> Result<String, AttemptError> {
        let response = self.get_response(url).await?;
        let text = response.text().await?;
        debug!("Fetched page {} ({} bytes)", url, text.len());
        Ok(text)
    }

    async fn fetch_body(&self, url: &Url) -> Result<Bytes, AttemptError> {
        let response = self.get_response(url).await?;
        let expected = response.content_length();

        let mut body = match expected {
            Some(len) => BytesMut::with_capacity(len as usize),
            None => BytesMut::new(),
        };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Incomplete {
                        received: body.len() as u64,
                        expected: expected.unwrap_or(0),
                    }
                }
            })?;
            body.extend_from_slice(&chunk);
        }

        let received = body.len() as u64;
        verify_length(received, expected)?;
        debug!("Fetched {} ({} bytes)", url, received);
        Ok(body.freeze())
    }
}

/// Checks a drained body against the advertised `Content-Length`
pub(crate) fn verify_length(received: u64, expected: Option<u64>) -> Result<(), AttemptError> {
    match expected {
        Some(expected) if expected != received => {
            Err(AttemptError::Incomplete { received, expected })
        }
        _ => Ok(()),
    }
}
