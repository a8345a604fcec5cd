//! Fetching complete catalog contents from a catalog HTTP backend.
//!
//! The backend serves the full FBC stream of one catalog at a single
//! endpoint (typically `/api/v1/all`). Responses are returned as raw text
//! and parsed by the catalog module so fetch and decode failures surface
//! separately.

use std::time::Duration;

use super::Result;

/// Per-request timeout for catalog fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// What: Fetch the full content stream of one catalog.
///
/// Inputs:
/// - `url`: Endpoint serving the catalog's FBC stream.
///
/// Output:
/// - The raw response body, or an error for connection failures and
///   non-success statuses.
pub async fn fetch_catalog_contents(url: &str) -> Result<String> {
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(format!("catalog endpoint {url} returned {}", response.status()).into());
    }
    Ok(response.text().await?)
}
