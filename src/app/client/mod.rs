//! HTTP access to the GSOD directory tree
//!
//! The module is organized into specialized components:
//! - `config`: HTTP client configuration and building
//! - `http`: rate-limited single-attempt requests
//! - `listing`: directory listing discovery and parsing
//! - `download`: archive fetches with retry, backoff and decompression
//!
//! Everything above the transport talks to the network through
//! [`ArchiveTransport`], so the engine can be driven by a scripted transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::errors::{AttemptError, ListingError, ListingResult, Result};

pub mod config;
pub mod download;
pub mod http;
pub mod listing;

pub use config::ClientConfig;
pub use download::{ArchiveFetcher, RetryPolicy};
pub use http::HttpHandler;
pub use listing::DirectoryLister;

/// One HTTP attempt against the remote tree
///
/// Implementations perform exactly one request per call and never retry.
#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    /// GET a page and return its body as text
    async fn fetch_page(&self, url: &Url) -> std::result::Result<String, AttemptError>;

    /// GET a file and return its complete body
    ///
    /// A body shorter than the advertised `Content-Length` is reported as
    /// `AttemptError::Incomplete`.
    async fn fetch_body(&self, url: &Url) -> std::result::Result<Bytes, AttemptError>;
}

/// Builds the production transport from client settings
pub fn build_transport(config: &ClientConfig) -> Result<Arc<dyn ArchiveTransport>> {
    let client = config.build_http_client()?;
    let handler = HttpHandler::new(client, config.rate_limit_rps)?;
    tracing::debug!(
        "Created HTTP transport ({} req/s, timeout {:?})",
        config.rate_limit_rps,
        config.request_timeout
    );
    Ok(Arc::new(handler))
}

/// URL of a year directory: `<base>/<year>/`
pub fn year_url(base_url: &Url, year: i32) -> ListingResult<Url> {
    join(base_url, &format!("{}/", year))
}

/// URL of an archive: `<base>/<year>/<file_name>`
pub fn archive_url(base_url: &Url, year: i32, file_name: &str) -> ListingResult<Url> {
    join(base_url, &format!("{}/{}", year, file_name))
}

fn join(base_url: &Url, path: &str) -> ListingResult<Url> {
    base_url.join(path).map_err(|e| ListingError::InvalidUrl {
        url: format!("{}{}", base_url, path),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let base = Url::parse("https://www1.ncdc.noaa.gov/pub/data/gsod/").unwrap();

        assert_eq!(
            year_url(&base, 2023).unwrap().as_str(),
            "https://www1.ncdc.noaa.gov/pub/data/gsod/2023/"
        );
        assert_eq!(
            archive_url(&base, 2023, "010010-99999-2023.op.gz")
                .unwrap()
                .as_str(),
            "https://www1.ncdc.noaa.gov/pub/data/gsod/2023/010010-99999-2023.op.gz"
        );
    }
}
