use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tidemark_domain::repositories::source::{CrawlControl, FetchError, FetchRequest, SourceAdapter};
use tidemark_domain::value_objects::asset_class::AssetClass;
use tidemark_domain::value_objects::record::{CanonicalRecord, ClassFields};
use tidemark_domain::value_objects::timeframe::Timeframe;

/// Financial Modeling Prep covers the equity, ETF and commodity side of the
/// registry. Daily history comes from `/historical-price-full/{symbol}`,
/// intraday from `/historical-chart/{interval}/{symbol}`.
pub struct FmpAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

/// FMP caps intraday history regardless of the requested window.
const INTRADAY_HISTORY_DAYS: i64 = 365;
/// Intraday responses are truncated server-side, so wide windows are walked
/// in chunks.
const MINUTE_CHUNK_DAYS: i64 = 30;
const HOUR_CHUNK_DAYS: i64 = 90;

#[derive(Debug, Deserialize)]
struct FmpDailyEnvelope {
    #[serde(default)]
    historical: Vec<FmpDailyRow>,
}

#[derive(Debug, Deserialize)]
struct FmpDailyRow {
    date: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
    #[serde(rename = "adjClose")]
    adj_close: Option<f64>,
    vwap: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FmpIntradayRow {
    date: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

impl FmpAdapter {
    pub fn new(
        client: reqwest::blocking::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn get_json(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .map_err(|err| super::classify_transport("FMP", &err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| super::classify_transport("FMP", &err))?;
        if !status.is_success() {
            return Err(super::classify_status("FMP", status, &body));
        }
        Ok(body)
    }

    fn fetch_daily(
        &self,
        request: &FetchRequest,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        let symbol = &request.descriptor.symbol;
        let url = format!(
            "{}/historical-price-full/{}?from={}&to={}",
            self.base_url,
            symbol,
            request.start.format("%Y-%m-%d"),
            request.end.format("%Y-%m-%d"),
        );
        ctrl.throttle();
        let body = self.get_json(&url)?;
        let envelope: FmpDailyEnvelope = serde_json::from_str(&body).map_err(|err| {
            FetchError::MalformedResponse(format!("FMP daily payload for {symbol}: {err}"))
        })?;
        if envelope.historical.is_empty() {
            return Err(FetchError::SymbolNotFound(format!(
                "FMP has no daily history for {symbol}"
            )));
        }

        let mut records = Vec::with_capacity(envelope.historical.len());
        let mut dropped = 0usize;
        for row in envelope.historical {
            let (Some(open), Some(high), Some(low), Some(close)) =
                (row.open, row.high, row.low, row.close)
            else {
                dropped += 1;
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") else {
                dropped += 1;
                continue;
            };
            let Some(timestamp) = date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt))
            else {
                dropped += 1;
                continue;
            };
            records.push(self.record(
                request,
                timestamp,
                open,
                high,
                low,
                close,
                row.volume.unwrap_or(0.0),
                row.adj_close,
                row.vwap,
            ));
        }
        if dropped > 0 {
            tracing::warn!(symbol, dropped, "dropped malformed FMP daily rows");
            metrics::counter!("tidemark.provider.rows_dropped_total", "provider" => "fmp")
                .increment(dropped as u64);
        }
        Ok(records)
    }

    fn fetch_intraday(
        &self,
        request: &FetchRequest,
        interval: &str,
        chunk_days: i64,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        let symbol = &request.descriptor.symbol;
        let floor = request.end - ChronoDuration::days(INTRADAY_HISTORY_DAYS);
        let mut cursor = request.start.max(floor);
        if cursor > request.start {
            tracing::debug!(
                symbol,
                interval,
                "clamped intraday window to FMP history limit"
            );
        }

        let mut records = Vec::new();
        let mut dropped = 0usize;
        while cursor < request.end {
            if ctrl.is_cancelled() {
                break;
            }
            let chunk_end = (cursor + ChronoDuration::days(chunk_days)).min(request.end);
            let url = format!(
                "{}/historical-chart/{}/{}?from={}&to={}",
                self.base_url,
                interval,
                symbol,
                cursor.format("%Y-%m-%d"),
                chunk_end.format("%Y-%m-%d"),
            );
            ctrl.throttle();
            let body = self.get_json(&url)?;
            let rows: Vec<FmpIntradayRow> = serde_json::from_str(&body).map_err(|err| {
                FetchError::MalformedResponse(format!("FMP intraday payload for {symbol}: {err}"))
            })?;
            for row in rows {
                let (Some(open), Some(high), Some(low), Some(close)) =
                    (row.open, row.high, row.low, row.close)
                else {
                    dropped += 1;
                    continue;
                };
                let Ok(naive) = NaiveDateTime::parse_from_str(&row.date, "%Y-%m-%d %H:%M:%S")
                else {
                    dropped += 1;
                    continue;
                };
                records.push(self.record(
                    request,
                    Utc.from_utc_datetime(&naive),
                    open,
                    high,
                    low,
                    close,
                    row.volume.unwrap_or(0.0),
                    None,
                    None,
                ));
            }
            cursor = chunk_end;
        }

        if dropped > 0 {
            tracing::warn!(symbol, dropped, "dropped malformed FMP intraday rows");
            metrics::counter!("tidemark.provider.rows_dropped_total", "provider" => "fmp")
                .increment(dropped as u64);
        }
        if records.is_empty() && !ctrl.is_cancelled() {
            return Err(FetchError::SymbolNotFound(format!(
                "FMP has no {interval} history for {symbol}"
            )));
        }
        Ok(records)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        request: &FetchRequest,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        adj_close: Option<f64>,
        vwap: Option<f64>,
    ) -> CanonicalRecord {
        let class_fields = match request.descriptor.asset_class {
            AssetClass::Commodity => ClassFields::Commodity,
            // Crypto never routes here; FMP serves the equity-shaped classes.
            _ => ClassFields::Equity { adj_close },
        };
        CanonicalRecord {
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
            class_fields,
            vwap,
            simple_return: None,
            log_return: None,
            source: self.provider().to_string(),
            ingested_at: Utc::now(),
        }
    }
}

impl SourceAdapter for FmpAdapter {
    fn provider(&self) -> &str {
        "FMP"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        ctrl: &dyn CrawlControl,
    ) -> Result<Vec<CanonicalRecord>, FetchError> {
        match request.timeframe {
            Timeframe::Day => self.fetch_daily(request, ctrl),
            Timeframe::Minute => self.fetch_intraday(request, "1min", MINUTE_CHUNK_DAYS, ctrl),
            Timeframe::Hour => self.fetch_intraday(request, "1hour", HOUR_CHUNK_DAYS, ctrl),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_rows_parse_and_keep_adjusted_close() {
        let body = r#"{"symbol":"AAPL","historical":[
            {"date":"2026-01-02","open":100.0,"high":101.0,"low":99.0,"close":100.5,
             "adjClose":100.1,"volume":1000000,"vwap":100.2},
            {"date":"not-a-date","open":1.0,"high":1.0,"low":1.0,"close":1.0}
        ]}"#;
        let envelope: FmpDailyEnvelope = serde_json::from_str(body).expect("parse");
        assert_eq!(envelope.historical.len(), 2);
        assert_eq!(envelope.historical[0].adj_close, Some(100.1));
        assert_eq!(envelope.historical[0].vwap, Some(100.2));
        // The second row has a bad date and gets dropped at conversion time.
        assert!(NaiveDate::parse_from_str(&envelope.historical[1].date, "%Y-%m-%d").is_err());
    }

    #[test]
    fn intraday_rows_parse_naive_timestamps() {
        let body = r#"[
            {"date":"2026-01-02 15:30:00","open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}
        ]"#;
        let rows: Vec<FmpIntradayRow> = serde_json::from_str(body).expect("parse");
        assert_eq!(rows.len(), 1);
        let naive = NaiveDateTime::parse_from_str(&rows[0].date, "%Y-%m-%d %H:%M:%S").expect("ts");
        assert_eq!(naive.format("%H:%M").to_string(), "15:30");
    }

    #[test]
    fn every_intraday_chunk_reserves_a_request_slot() {
        use crate::providers::testserver::{serve, ThrottleCounter};
        use tidemark_domain::value_objects::symbol::SymbolDescriptor;

        // A 60-day minute window walks two 30-day chunks.
        let chunk1 = r#"[{"date":"2026-01-10 15:30:00","open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}]"#;
        let chunk2 = r#"[{"date":"2026-02-10 15:30:00","open":1.5,"high":2.0,"low":1.0,"close":1.8,"volume":12.0}]"#;
        let base = serve(vec![chunk1.to_string(), chunk2.to_string()]);
        let adapter = FmpAdapter::new(
            crate::providers::build_client(5).expect("client"),
            base,
            "test-key",
        );

        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("end");
        let request = FetchRequest {
            descriptor: SymbolDescriptor {
                symbol: "SPY".to_string(),
                name: "SPY".to_string(),
                asset_class: AssetClass::Etf,
                index_membership: "SP500".to_string(),
                sector: "N/A".to_string(),
                industry: "N/A".to_string(),
                timeframes: vec![Timeframe::Minute],
                years: 1,
                priority: 1,
            },
            timeframe: Timeframe::Minute,
            start: end - ChronoDuration::days(60),
            end,
        };

        let ctrl = ThrottleCounter::default();
        let records = adapter.fetch(&request, &ctrl).expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(ctrl.count(), 2);
    }

    #[test]
    fn empty_daily_history_is_symbol_not_found() {
        let body = r#"{}"#;
        let envelope: FmpDailyEnvelope = serde_json::from_str(body).expect("parse");
        assert!(envelope.historical.is_empty());
    }
}
