//! Windowed retrieval of long reading ranges.
//!
//! The readings endpoint caps the span of a single request, so a wide range
//! is cut into contiguous half-open windows computed from `start` alone. Each
//! window is one request; results are stitched back in window order. Requests
//! may run concurrently (bounded), but `buffered` yields them in submission
//! order so the output never depends on completion timing.
//!
//! Any failed window fails the whole range. There is no partial result and no
//! retry: the caller re-runs the range if it wants to.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;

use crate::api::session::SessionClient;
use crate::api::transport::{ApiRequest, Transport};
use crate::error::{ConfigError, FetchError, FetchErrorKind, Result};
use crate::models::{EnergyReading, EnergySeries, GridInterval, Token, Window};

const API_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// ---

/// What to do when the first row of a window repeats the last row of the
/// previous one (the upstream `to` bound is inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryPolicy {
    /// Drop the repeated row.
    #[default]
    Deduplicate,
    /// Keep it, exactly as served.
    Preserve,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum in-flight window requests.
    pub concurrency: usize,
    pub boundary: BoundaryPolicy,
    /// Deadline for the whole range, not per window.
    pub range_timeout: Option<Duration>,
    /// Aggregation applied server-side per period.
    pub function: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            boundary: BoundaryPolicy::Deduplicate,
            range_timeout: None,
            function: "sum".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadingsBody {
    data: Vec<(i64, f64)>,
}

/// Cut `[start, end)` into consecutive windows of `span`, the last clipped to `end`.
pub fn partition(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    span: TimeDelta,
) -> std::result::Result<Vec<Window>, ConfigError> {
    // ---
    if span <= TimeDelta::zero() {
        return Err(ConfigError::InvalidDuration {
            name: "window span",
            seconds: span.num_seconds(),
        });
    }
    if start > end {
        return Err(ConfigError::InvertedRange {
            start: start.to_rfc3339(),
            end: end.to_rfc3339(),
        });
    }

    let mut windows = Vec::new();
    let mut index = 0;
    loop {
        let Some(window_start) = span.checked_mul(index).and_then(|o| start.checked_add_signed(o))
        else {
            break;
        };
        if window_start >= end {
            break;
        }
        let window_end = window_start
            .checked_add_signed(span)
            .map_or(end, |e| e.min(end));
        windows.push(Window {
            start: window_start,
            end: window_end,
        });
        index += 1;
    }
    Ok(windows)
}

/// Concatenate per-window rows in window order.
pub fn stitch(chunks: Vec<Vec<EnergyReading>>, policy: BoundaryPolicy) -> EnergySeries {
    // ---
    let mut readings: Vec<EnergyReading> = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    let mut duplicates = 0usize;

    for chunk in chunks {
        for (i, row) in chunk.into_iter().enumerate() {
            let repeats_boundary =
                i == 0 && readings.last().is_some_and(|last| last.timestamp == row.timestamp);
            if repeats_boundary {
                duplicates += 1;
                if policy == BoundaryPolicy::Deduplicate {
                    continue;
                }
            }
            readings.push(row);
        }
    }

    if duplicates > 0 {
        match policy {
            BoundaryPolicy::Deduplicate => {
                tracing::debug!("Dropped {} duplicated window boundary row(s)", duplicates)
            }
            BoundaryPolicy::Preserve => {
                tracing::warn!("Kept {} duplicated window boundary row(s)", duplicates)
            }
        }
    }
    EnergySeries { readings }
}

pub struct WindowedFetcher<'a, T> {
    client: &'a SessionClient<T>,
    options: FetchOptions,
}

impl<'a, T: Transport> WindowedFetcher<'a, T> {
    pub fn new(client: &'a SessionClient<T>, options: FetchOptions) -> Self {
        Self { client, options }
    }

    /// Fetch `[start, end)` for one resource, one request per window.
    ///
    /// `start == end` returns an empty series without issuing any request.
    #[tracing::instrument(skip_all, fields(resource_id = %resource_id, start = %start, end = %end))]
    pub async fn fetch_range(
        &self,
        resource_id: &str,
        token: &Token,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        window_span: TimeDelta,
        grid: GridInterval,
    ) -> Result<EnergySeries> {
        // ---
        let windows = partition(start, end, window_span)?;
        if windows.is_empty() {
            tracing::debug!("Empty range, nothing to fetch");
            return Ok(EnergySeries::default());
        }
        tracing::info!("Fetching {} window(s)", windows.len());

        let work = self.fetch_windows(resource_id, token, &windows, grid);
        let chunks = match self.options.range_timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| FetchError {
                resource_id: resource_id.to_string(),
                window: Window { start, end },
                kind: FetchErrorKind::Timeout,
            })??,
            None => work.await?,
        };

        let series = stitch(chunks, self.options.boundary);
        tracing::info!("Fetched {} reading(s)", series.len());
        Ok(series)
    }

    async fn fetch_windows(
        &self,
        resource_id: &str,
        token: &Token,
        windows: &[Window],
        grid: GridInterval,
    ) -> std::result::Result<Vec<Vec<EnergyReading>>, FetchError> {
        // ---
        stream::iter(windows.iter().copied())
            .map(|window| self.get_window(resource_id, token, window, grid))
            .buffered(self.options.concurrency.max(1))
            .try_collect()
            .await
    }

    /// `GET /resource/{id}/readings` for a single window.
    pub async fn get_window(
        &self,
        resource_id: &str,
        token: &Token,
        window: Window,
        grid: GridInterval,
    ) -> std::result::Result<Vec<EnergyReading>, FetchError> {
        // ---
        let fail = |kind| FetchError {
            resource_id: resource_id.to_string(),
            window,
            kind,
        };

        let request = ApiRequest::get(format!("resource/{}/readings", resource_id))
            .query("from", window.start.format(API_TIME_FORMAT).to_string())
            .query("to", window.end.format(API_TIME_FORMAT).to_string())
            .query("period", grid.as_iso8601())
            .query("function", self.options.function.as_str())
            .query("offset", "0");
        let request = self.client.stamp(request, Some(token));

        tracing::debug!("Requesting window {}", window);
        let response = self
            .client
            .transport()
            .send(request)
            .await
            .map_err(|e| fail(FetchErrorKind::Transport(e)))?;

        if !response.is_success() {
            return Err(fail(FetchErrorKind::Status(response.status)));
        }

        let body: ReadingsBody = serde_json::from_str(&response.body)
            .map_err(|e| fail(FetchErrorKind::Payload(e.to_string())))?;

        body.data
            .into_iter()
            .map(|(epoch, kwh)| {
                DateTime::from_timestamp(epoch, 0)
                    .map(|timestamp| EnergyReading { timestamp, kwh })
                    .ok_or_else(|| fail(FetchErrorKind::Payload(format!("timestamp {} out of range", epoch))))
            })
            .collect()
    }
}
