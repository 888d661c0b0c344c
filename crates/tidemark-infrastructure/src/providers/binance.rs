use chrono::{TimeZone, Utc};
use tidemark_domain::repositories::source::{CrawlControl, FetchError, FetchRequest, SourceAdapter};
use tidemark_domain::value_objects::record::{CanonicalRecord, ClassFields};
use tidemark_domain::value_objects::timeframe::Timeframe;

/// Binance spot klines, paged forward by open time. Each page holds at most
/// `PAGE_LIMIT` bars; the cursor advances to the last open time plus one
/// millisecond so consecutive pages never overlap.
pub struct BinanceAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
}

const PAGE_LIMIT: usize = 1000;

impl BinanceAdapter {
    pub fn new(client: reqwest::blocking::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn interval(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::Minute => "1m",
            Timeframe::Hour => "1h",
            Timeframe::Day => "1d",
        }
    }

    fn fetch_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<serde_json::Value>, FetchError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("interval", interval),
                ("startTime", &start_ms.to_string()),
                ("endTime", &end_ms.to_string()),
                ("limit", &PAGE_LIMIT.to_string()),
            ])
            .send()
            .map_err(|err| super::classify_transport("Binance", &err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| super::classify_transport("Binance", &err))?;
        if status == reqwest::StatusCode::BAD_REQUEST {
            // -1121 "Invalid symbol" comes back as a 400, not a 404.
            return Err(FetchError::SymbolNotFound(format!(
                "Binance rejected symbol {symbol}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        if !status.is_success() {
            return Err(super::classify_status("Binance", status, &body));
        }
        serde_json::from_str(&body).map_err(|err| {
            FetchError::MalformedResponse(format!("Binance klines payload for {symbol}: {err}"))
        })
    }
}

impl SourceAdapter for BinanceAdapter {
    fn provider(&self) -> &str {
        "Binance"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        let symbol = &request.descriptor.symbol;
        let interval = Self::interval(request.timeframe);
        let end_ms = request.end.timestamp_millis();
        let mut cursor_ms = request.start.timestamp_millis();

        let mut records = Vec::new();
        let mut dropped = 0usize;
        let mut first_page = true;
        while cursor_ms < end_ms {
            if ctrl.is_cancelled() {
                break;
            }
            ctrl.throttle();
            let rows = self.fetch_page(symbol, interval, cursor_ms, end_ms)?;
            if first_page && rows.is_empty() {
                return Err(FetchError::SymbolNotFound(format!(
                    "Binance has no {interval} klines for {symbol} in the requested window"
                )));
            }
            first_page = false;
            let page_len = rows.len();

            for row in &rows {
                match parse_kline(request, self.provider(), row) {
                    Some(record) => records.push(record),
                    None => dropped += 1,
                }
            }
            let Some(last_open_ms) = rows.last().and_then(|row| row.get(0)).and_then(|v| v.as_i64())
            else {
                break;
            };
            cursor_ms = last_open_ms + 1;
            if page_len < PAGE_LIMIT {
                break;
            }
        }

        if dropped > 0 {
            tracing::warn!(symbol, dropped, "dropped malformed Binance klines");
            metrics::counter!("tidemark.provider.rows_dropped_total", "provider" => "binance")
                .increment(dropped as u64);
        }
        Ok(records)
    }
}

/// One kline is a positional array: open time (ms), open, high, low, close,
/// base volume, close time, quote volume, then fields this pipeline ignores.
/// Prices and volumes arrive as JSON strings.
fn parse_kline(
    request: &FetchRequest,
    provider: &str,
    row: &serde_json::Value,
) -> Option<CanonicalRecord> {
    let cells = row.as_array()?;
    let open_ms = cells.first()?.as_i64()?;
    let timestamp = Utc.timestamp_millis_opt(open_ms).single()?;
    let open = str_cell(cells, 1)?;
    let high = str_cell(cells, 2)?;
    let low = str_cell(cells, 3)?;
    let close = str_cell(cells, 4)?;
    let volume = str_cell(cells, 5)?;
    let turnover = str_cell(cells, 7);

    Some(CanonicalRecord {
        symbol: request.descriptor.symbol.clone(),
        asset_class: request.descriptor.asset_class,
        index_membership: request.descriptor.index_membership.clone(),
        timestamp,
        timeframe: request.timeframe,
        open,
        high,
        low,
        close,
        volume,
        class_fields: ClassFields::Crypto { turnover },
        vwap: None,
        simple_return: None,
        log_return: None,
        source: provider.to_string(),
        ingested_at: Utc::now(),
    })
}

fn str_cell(cells: &[serde_json::Value], index: usize) -> Option<f64> {
    cells.get(index)?.as_str()?.parse::<f64>().ok()
}
