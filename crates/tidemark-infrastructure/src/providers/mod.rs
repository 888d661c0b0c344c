pub mod binance;
pub mod fmp;

use std::time::Duration;
use tidemark_domain::repositories::source::FetchError;

pub fn build_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, String> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .use_rustls_tls()
        .build()
        .map_err(|err| format!("failed to build http client: {err}"))
}

/// Maps an HTTP status to the retry class the orchestrator acts on. 418 is
/// Binance's "banned for repeated 429s" status and must back off, not fail.
pub(crate) fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> FetchError {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        418 | 429 => FetchError::RateLimited(format!("{provider} returned {status}")),
        401 | 403 => FetchError::Authentication(format!("{provider} rejected credentials ({status})")),
        404 => FetchError::SymbolNotFound(format!("{provider} returned 404")),
        500..=599 => FetchError::TransientNetwork(format!("{provider} returned {status}: {snippet}")),
        _ => FetchError::MalformedResponse(format!(
            "{provider} returned unexpected {status}: {snippet}"
        )),
    }
}

/// Transport failures (DNS, connect, timeout, mid-body resets) are all
/// retryable from the crawler's point of view.
pub(crate) fn classify_transport(provider: &str, err: &reqwest::Error) -> FetchError {
    FetchError::TransientNetwork(format!("{provider} request failed: {err}"))
}
