//! Derived comfort and completeness metrics.
//!
//! Degree-days accumulate the internal/external temperature differential over
//! time as a proxy for heating demand. A bucket with no differential adds
//! nothing to the running sum but does not reset it; that fill is an explicit
//! step here ([`fill_missing`]) rather than a side effect of summing.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::models::{GridInterval, RawReading};
use crate::transform::pivot::WideTable;

// ---

/// Readings with a numeric temperature in one grid bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityBucket {
    pub bucket: DateTime<Utc>,
    pub count: usize,
}

/// A reading that reached the log later than the lag threshold allows.
#[derive(Debug, Clone, PartialEq)]
pub struct LaggedReading {
    pub reading: RawReading,
    pub lag: TimeDelta,
}

pub fn fill_missing<I>(values: I, fill: f64) -> Vec<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    values.into_iter().map(|v| v.unwrap_or(fill)).collect()
}

/// Running sum of `temperature_diff_avg`, in days (divided by buckets per day).
///
/// Rows are taken in table order, which is ascending by bucket.
pub fn cumulative_degree_days(table: &WideTable) -> Vec<f64> {
    // ---
    let per_day = table.grid.buckets_per_day();
    let diffs = fill_missing(table.rows.iter().map(|r| r.temperature_diff_avg), 0.0);

    diffs
        .iter()
        .scan(0.0, |sum, diff| {
            *sum += diff;
            Some(*sum / per_day)
        })
        .collect()
}

/// Straight line from 0 at the first bucket to `final_value` at the last,
/// proportional to elapsed time. `None` everywhere when the series spans no
/// time, since the slope is undefined.
pub fn average_degree_days(buckets: &[DateTime<Utc>], final_value: f64) -> Vec<Option<f64>> {
    // ---
    let (Some(first), Some(last)) = (buckets.iter().min(), buckets.iter().max()) else {
        return Vec::new();
    };
    let span = (*last - *first).num_seconds();
    if span == 0 {
        return vec![None; buckets.len()];
    }
    buckets
        .iter()
        .map(|t| Some(final_value * (*t - *first).num_seconds() as f64 / span as f64))
        .collect()
}

/// Fill `cum_degree_days` and `avg_degree_days` on every row.
pub fn add_degree_days(mut table: WideTable) -> WideTable {
    // ---
    let cumulative = cumulative_degree_days(&table);
    let Some(final_value) = cumulative.last().copied() else {
        return table;
    };
    let buckets: Vec<DateTime<Utc>> = table.rows.iter().map(|r| r.logged_at_rounded).collect();
    let average = average_degree_days(&buckets, final_value);

    for ((row, cum), avg) in table.rows.iter_mut().zip(cumulative).zip(average) {
        row.cum_degree_days = Some(cum);
        row.avg_degree_days = avg;
    }
    tracing::info!("Accumulated {:.2} degree-days over {} row(s)", final_value, table.len());
    table
}

/// Mean differential over rows where it is present.
pub fn mean_temperature_diff(table: &WideTable) -> Option<f64> {
    // ---
    let present: Vec<f64> = table.rows.iter().filter_map(|r| r.temperature_diff_avg).collect();
    if present.is_empty() {
        return None;
    }
    Some(present.iter().sum::<f64>() / present.len() as f64)
}

/// Per-bucket count of readings carrying a temperature, all devices together.
pub fn density(readings: &[RawReading], grid: GridInterval) -> Vec<DensityBucket> {
    // ---
    let mut counts: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
    for reading in readings {
        let count = counts.entry(grid.floor(reading.logged_at)).or_default();
        if reading.temperature.is_some() {
            *count += 1;
        }
    }
    counts
        .into_iter()
        .map(|(bucket, count)| DensityBucket { bucket, count })
        .collect()
}

/// Readings whose `logged_at - measured_at` exceeds `threshold`.
pub fn lagged(readings: &[RawReading], threshold: TimeDelta) -> Vec<LaggedReading> {
    // ---
    let lagged: Vec<LaggedReading> = readings
        .iter()
        .filter(|r| r.lag() > threshold)
        .map(|r| LaggedReading {
            reading: r.clone(),
            lag: r.lag(),
        })
        .collect();

    if !lagged.is_empty() {
        tracing::warn!(
            "{} of {} reading(s) logged more than {}h after measurement",
            lagged.len(),
            readings.len(),
            threshold.num_hours()
        );
    }
    lagged
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Role;
    use crate::transform::pivot::{bucket_and_pivot, RoleAssignment};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn create_test_raw_reading(device_id: &str, logged_at: DateTime<Utc>, temp: Option<f64>) -> RawReading {
        // ---
        RawReading {
            device_id: device_id.to_string(),
            measured_at: logged_at,
            temperature: temp,
            humidity: None,
            logged_at,
            battery: None,
        }
    }

    /// Two internals keep every bucket; differentials 15, missing, 12.
    fn sample_table() -> WideTable {
        // ---
        let roles = RoleAssignment::new([
            ("caaeb0", Role::External),
            ("701878", Role::Internal),
            ("edbc1f", Role::Internal),
        ])
        .unwrap();
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 0), Some(5.0)),
            create_test_raw_reading("701878", at(0, 0), Some(20.0)),
            create_test_raw_reading("701878", at(0, 20), Some(21.0)),
            create_test_raw_reading("caaeb0", at(1, 0), Some(8.0)),
            create_test_raw_reading("edbc1f", at(1, 0), Some(20.0)),
        ];
        bucket_and_pivot(readings, &roles, GridInterval::minutes(20).unwrap())
    }

    #[test]
    fn test_fill_missing() {
        // ---
        assert_eq!(fill_missing([Some(1.0), None, Some(2.5)], 0.0), vec![1.0, 0.0, 2.5]);
    }

    #[test]
    fn test_cumulative_treats_missing_as_zero() {
        // ---
        let table = sample_table();
        let diffs: Vec<_> = table.rows.iter().map(|r| r.temperature_diff_avg).collect();
        assert_eq!(diffs, vec![Some(15.0), None, Some(12.0)]);

        let cumulative = cumulative_degree_days(&table);
        assert_eq!(cumulative, vec![15.0 / 72.0, 15.0 / 72.0, 27.0 / 72.0]);
    }

    #[test]
    fn test_add_degree_days_endpoints() {
        // ---
        let table = add_degree_days(sample_table());
        let first = table.rows.first().unwrap();
        let last = table.rows.last().unwrap();

        assert_eq!(first.avg_degree_days, Some(0.0));
        assert_eq!(last.cum_degree_days, Some(27.0 / 72.0));
        assert_eq!(last.avg_degree_days, last.cum_degree_days);

        // 00:20 is a third of the way from 00:00 to 01:00.
        let middle = table.rows[1].avg_degree_days.unwrap();
        assert!((middle - 27.0 / 72.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_cumulative_is_monotonic_for_non_negative_diffs() {
        // ---
        let cumulative = cumulative_degree_days(&sample_table());

        assert!(cumulative.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_average_degree_days_zero_span() {
        // ---
        assert_eq!(average_degree_days(&[at(0, 0), at(0, 0)], 3.0), vec![None, None]);
        assert!(average_degree_days(&[], 3.0).is_empty());
    }

    #[test]
    fn test_add_degree_days_empty_table() {
        // ---
        let mut table = sample_table();
        table.rows.clear();

        assert!(add_degree_days(table).is_empty());
    }

    #[test]
    fn test_mean_temperature_diff() {
        // ---
        assert_eq!(mean_temperature_diff(&sample_table()), Some(13.5));
    }

    #[test]
    fn test_density_counts_numeric_temperatures() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 1), Some(5.0)),
            create_test_raw_reading("701878", at(0, 2), Some(20.0)),
            create_test_raw_reading("edbc1f", at(0, 3), None),
            create_test_raw_reading("caaeb0", at(0, 21), None),
        ];

        let buckets = density(&readings, GridInterval::minutes(20).unwrap());

        assert_eq!(
            buckets,
            vec![
                DensityBucket { bucket: at(0, 0), count: 2 },
                DensityBucket { bucket: at(0, 20), count: 0 },
            ]
        );
    }

    #[test]
    fn test_lagged_threshold_is_exclusive() {
        // ---
        let mut on_time = create_test_raw_reading("caaeb0", at(12, 0), Some(5.0));
        on_time.measured_at = at(6, 0);
        let mut late = create_test_raw_reading("701878", at(12, 0), Some(20.0));
        late.measured_at = at(5, 0);

        let flagged = lagged(&[on_time, late], TimeDelta::hours(6));

        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].reading.device_id, "701878");
        assert_eq!(flagged[0].lag, TimeDelta::hours(7));
    }
}
