//! CSV artifacts: per-resource consumption series, the wide sensor table,
//! collection diagnostics and the combined report with fixed human-readable
//! headers. Also reads back locally exported metering CSVs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{Error, MalformedRecordError, Result};
use crate::models::{EnergySeries, GridInterval, MeterReading};
use crate::transform::ingest::{format_timestamp, parse_timestamp};
use crate::transform::metrics::{DensityBucket, LaggedReading};
use crate::transform::pivot::{WideRecord, WideTable};

const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Value per timestamp, unique and ascending.
pub type Timeline = BTreeMap<DateTime<Utc>, f64>;

// ---

fn time_cell(ts: DateTime<Utc>) -> String {
    ts.format(CSV_TIME_FORMAT).to_string()
}

fn value_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn series_timeline(series: &EnergySeries) -> Timeline {
    series.iter().map(|r| (r.timestamp, r.kwh)).collect()
}

pub fn meter_timeline(readings: &[MeterReading]) -> Timeline {
    readings.iter().map(|r| (r.measured_at, r.reading)).collect()
}

/// `timestamp,kWh` rows for one resource.
pub fn write_energy_csv<W: Write>(writer: W, series: &EnergySeries) -> Result<()> {
    // ---
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["timestamp", "kWh"])?;
    for reading in series.iter() {
        out.write_record([time_cell(reading.timestamp), reading.kwh.to_string()])?;
    }
    out.flush()?;
    Ok(())
}

/// Every wide-table column, `logged_at_rounded` first, missing cells empty.
pub fn write_wide_csv<W: Write>(writer: W, table: &WideTable) -> Result<()> {
    // ---
    let mut out = csv::Writer::from_writer(writer);
    let mut header = vec!["logged_at_rounded".to_string()];
    header.extend(table.value_columns());
    out.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![time_cell(row.logged_at_rounded)];
        record.extend(row.cells().into_iter().map(value_cell));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_density_csv<W: Write>(writer: W, buckets: &[DensityBucket]) -> Result<()> {
    // ---
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["logged_at_rounded", "count"])?;
    for b in buckets {
        out.write_record([time_cell(b.bucket), b.count.to_string()])?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_lagged_csv<W: Write>(writer: W, lagged: &[LaggedReading]) -> Result<()> {
    // ---
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(["device_id", "measured_at", "logged_at", "lag_seconds", "temperature", "humidity"])?;
    for l in lagged {
        out.write_record([
            l.reading.device_id.clone(),
            format_timestamp(l.reading.measured_at),
            format_timestamp(l.reading.logged_at),
            l.lag.num_seconds().to_string(),
            value_cell(l.reading.temperature),
            value_cell(l.reading.humidity),
        ])?;
    }
    out.flush()?;
    Ok(())
}

/// Two-column metering CSV: timestamp, cumulative reading. Extra columns are ignored.
pub fn load_meter_csv<R: Read>(reader: R, has_header: bool) -> Result<Vec<MeterReading>> {
    // ---
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut readings = Vec::new();
    for (index, record) in rdr.records().enumerate() {
        let record = record?;
        let line = record
            .position()
            .map_or(index + 1 + usize::from(has_header), |p| p.line() as usize);
        let malformed = |reason: String| Error::from(MalformedRecordError { line, reason });

        let (Some(raw_time), Some(raw_value)) = (record.get(0), record.get(1)) else {
            return Err(malformed("expected timestamp and reading columns".to_string()));
        };
        let measured_at = parse_timestamp(raw_time)
            .ok_or_else(|| malformed(format!("not a timestamp: {:?}", raw_time)))?;
        let reading = raw_value
            .parse::<f64>()
            .map_err(|_| malformed(format!("not a number: {:?}", raw_value)))?;
        readings.push(MeterReading {
            measured_at,
            reading,
        });
    }
    tracing::info!("Loaded {} meter reading(s)", readings.len());
    Ok(readings)
}

/// Consumption CSV previously written by [`write_energy_csv`], as a timeline.
pub fn load_meter_timeline(path: &Path) -> Result<Timeline> {
    // ---
    let readings = load_meter_csv(File::open(path)?, true)?;
    Ok(meter_timeline(&readings))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<Option<f64>>,
}

/// Sensor and consumption data on the energy period, ready for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedReport {
    pub headers: Vec<String>,
    pub rows: Vec<ReportRow>,
}

/// Last non-missing value per column within each `period` bin.
fn resample_last(table: &WideTable, period: GridInterval) -> BTreeMap<DateTime<Utc>, Vec<Option<f64>>> {
    // ---
    let mut bins: BTreeMap<DateTime<Utc>, Vec<Option<f64>>> = BTreeMap::new();
    for row in &table.rows {
        let cells = report_cells(row);
        let bin = bins
            .entry(period.floor(row.logged_at_rounded))
            .or_insert_with(|| vec![None; cells.len()]);
        for (slot, cell) in bin.iter_mut().zip(cells) {
            if cell.is_some() {
                *slot = cell;
            }
        }
    }
    bins
}

/// Internal temperatures, internal humidities, external temperature.
fn report_cells(row: &WideRecord) -> Vec<Option<f64>> {
    // ---
    let mut cells: Vec<Option<f64>> = row.internal.iter().map(|c| c.temperature).collect();
    cells.extend(row.internal.iter().map(|c| c.humidity));
    cells.push(row.external.temperature);
    cells
}

/// Join the sensor table, resampled to `period`, with gas and electricity.
///
/// Energy timestamps are the outer union of both series; only those on a
/// sensor bin between the first and last sensor bin survive, clipped to
/// `[start, end]` inclusive. Bins with no sensor data keep empty cells.
pub fn combined_report(
    table: &WideTable,
    gas: &Timeline,
    electricity: &Timeline,
    period: GridInterval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CombinedReport {
    // ---
    let internal_count = table.roles.internal().len();
    let mut headers = vec![
        "Date/time (UTC)".to_string(),
        "Gas consumption (kWh)".to_string(),
        "Electricity consumption (kWh)".to_string(),
    ];
    headers.extend((1..=internal_count).map(|n| format!("Internal temperature {} (°C)", n)));
    headers.extend((1..=internal_count).map(|n| format!("Humidity {} (%)", n)));
    headers.push("External temperature (°C)".to_string());

    let bins = resample_last(table, period);
    let (Some(first_bin), Some(last_bin)) = (bins.keys().next().copied(), bins.keys().last().copied())
    else {
        return CombinedReport {
            headers,
            rows: Vec::new(),
        };
    };
    let empty_bin = vec![None; 2 * internal_count + 1];

    let mut timestamps: Vec<DateTime<Utc>> = gas.keys().chain(electricity.keys()).copied().collect();
    timestamps.sort();
    timestamps.dedup();

    let rows: Vec<ReportRow> = timestamps
        .into_iter()
        .filter(|t| *t >= first_bin && *t <= last_bin && period.floor(*t) == *t)
        .filter(|t| *t >= start && *t <= end)
        .map(|t| {
            let mut values = vec![gas.get(&t).copied(), electricity.get(&t).copied()];
            values.extend(bins.get(&t).unwrap_or(&empty_bin).iter().copied());
            ReportRow {
                timestamp: t,
                values,
            }
        })
        .collect();

    tracing::info!("Combined report has {} row(s)", rows.len());
    CombinedReport { headers, rows }
}

pub fn write_report_csv<W: Write>(writer: W, report: &CombinedReport) -> Result<()> {
    // ---
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(&report.headers)?;
    for row in &report.rows {
        let mut record = vec![time_cell(row.timestamp)];
        record.extend(row.values.iter().copied().map(value_cell));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}
