use crate::value_objects::record::CanonicalRecord;
use crate::value_objects::symbol::SymbolDescriptor;
use crate::value_objects::timeframe::Timeframe;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    RateLimited(String),
    Authentication(String),
    SymbolNotFound(String),
    TransientNetwork(String),
    MalformedResponse(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::TransientNetwork(_))
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::Authentication(msg) => write!(f, "authentication: {msg}"),
            Self::SymbolNotFound(msg) => write!(f, "symbol not found: {msg}"),
            Self::TransientNetwork(msg) => write!(f, "transient network: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub descriptor: SymbolDescriptor,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Run-level control surface visible to adapters. Adapters check it between
/// fetch pages and return what they already have; a later run re-fetches and
/// re-deduplicates by key, so partial output is safe.
pub trait CrawlControl: Sync {
    fn is_cancelled(&self) -> bool;

    /// Blocks until the provider's next request slot is available. Adapters
    /// call this before every outbound request, including pages and chunks
    /// after the first, so multi-page fetches stay inside the provider's
    /// rate limit. Defaults to a no-op for controls with no pacing.
    fn throttle(&self) {}
}

/// One implementation per upstream provider family. `fetch` returns the
/// normalized records for the requested window, already in canonical shape
/// but before window-level post-processing (returns, VWAP fill).
pub trait SourceAdapter: Send + Sync {
    fn provider(&self) -> &str;

    fn fetch(
        &self,
        request: &FetchRequest,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError>;
}
