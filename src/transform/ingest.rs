//! Sensor-log ingestion.
//!
//! The log is append-only text, one record per line:
//! `device_id, measured_at, temperature, humidity, logged_at[, battery]`.
//! Older lines have no battery column; that is recorded as `None`, never as
//! zero. Parsing aborts on the first bad line since a partial log is not
//! usable downstream.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, MalformedRecordError};
use crate::models::RawReading;

const MIN_FIELDS: usize = 5;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

// ---

/// Parse an ISO 8601 timestamp. Offset-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Empty cells and `nan`/`None` placeholders are missing values.
fn parse_value(raw: &str, name: &str, line: usize) -> Result<Option<f64>, MalformedRecordError> {
    // ---
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_nan() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(MalformedRecordError {
            line,
            reason: format!("{} is not a number: {:?}", name, raw),
        }),
    }
}

fn parse_time_field(raw: &str, name: &str, line: usize) -> Result<DateTime<Utc>, MalformedRecordError> {
    parse_timestamp(raw).ok_or_else(|| MalformedRecordError {
        line,
        reason: format!("{} is not a timestamp: {:?}", name, raw),
    })
}

/// Parse log lines into readings, optionally keeping only `known_device_ids`.
///
/// Blank lines are skipped. Fields past the sixth are ignored.
pub fn parse_log<I, S>(
    lines: I,
    known_device_ids: Option<&HashSet<String>>,
) -> Result<Vec<RawReading>, MalformedRecordError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    // ---
    let text = lines
        .into_iter()
        .map(|l| l.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    read_log(text.as_bytes(), known_device_ids)
}

/// Parse a sensor log from any reader. Line numbers in errors are 1-based.
pub fn read_log<R: Read>(
    reader: R,
    known_device_ids: Option<&HashSet<String>>,
) -> Result<Vec<RawReading>, MalformedRecordError> {
    // ---
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut readings = Vec::new();
    let mut dropped = 0usize;

    for record in rdr.records() {
        let record = record.map_err(|e| MalformedRecordError {
            line: e.position().map_or(0, |p| p.line() as usize),
            reason: e.to_string(),
        })?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        if record.iter().all(str::is_empty) {
            continue;
        }

        if record.len() < MIN_FIELDS {
            return Err(MalformedRecordError {
                line,
                reason: format!("expected at least {} fields, found {}", MIN_FIELDS, record.len()),
            });
        }

        let device_id = &record[0];
        if known_device_ids.is_some_and(|known| !known.contains(device_id)) {
            dropped += 1;
            continue;
        }

        readings.push(RawReading {
            device_id: device_id.to_string(),
            measured_at: parse_time_field(&record[1], "measured_at", line)?,
            temperature: parse_value(&record[2], "temperature", line)?,
            humidity: parse_value(&record[3], "humidity", line)?,
            logged_at: parse_time_field(&record[4], "logged_at", line)?,
            battery: match record.get(5) {
                Some(raw) => parse_value(raw, "battery", line)?,
                None => None,
            },
        });
    }

    if dropped > 0 {
        tracing::warn!("Dropped {} line(s) from unconfigured devices", dropped);
    }
    tracing::info!("Parsed {} sensor reading(s)", readings.len());
    Ok(readings)
}

/// Read and parse a sensor-log file.
pub fn load_log(path: &Path, known_device_ids: Option<&HashSet<String>>) -> Result<Vec<RawReading>, Error> {
    // ---
    Ok(read_log(File::open(path)?, known_device_ids)?)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_five_field_line_has_missing_battery() {
        // ---
        let readings =
            parse_log(["701878,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00"], None).unwrap();

        assert_eq!(readings.len(), 1);
        let r = &readings[0];
        assert_eq!(r.device_id, "701878");
        assert_eq!(r.measured_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(r.logged_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
        assert_eq!(r.temperature, Some(20.0));
        assert_eq!(r.humidity, Some(40.0));
        assert_eq!(r.battery, None);
    }

    #[test]
    fn test_six_field_line_with_spaces() {
        // ---
        let readings = parse_log(
            ["caaeb0, 2024-01-01 00:00:00, 5.5, 80, 2024-01-01T00:01:00, 93"],
            None,
        )
        .unwrap();

        assert_eq!(readings[0].device_id, "caaeb0");
        assert_eq!(readings[0].temperature, Some(5.5));
        assert_eq!(readings[0].battery, Some(93.0));
    }

    #[test]
    fn test_zero_battery_is_not_missing() {
        // ---
        let readings = parse_log(
            ["caaeb0,2024-01-01T00:00:00,5.5,80,2024-01-01T00:01:00,0"],
            None,
        )
        .unwrap();

        assert_eq!(readings[0].battery, Some(0.0));
    }

    #[test]
    fn test_extra_trailing_fields_ignored() {
        // ---
        let readings = parse_log(
            ["caaeb0,2024-01-01T00:00:00,5.5,80,2024-01-01T00:01:00,90,junk,more"],
            None,
        )
        .unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].battery, Some(90.0));
    }

    #[test]
    fn test_missing_measurements() {
        // ---
        let readings = parse_log(
            ["caaeb0,2024-01-01T00:00:00,nan,,2024-01-01T00:01:00,None"],
            None,
        )
        .unwrap();

        assert_eq!(readings[0].temperature, None);
        assert_eq!(readings[0].humidity, None);
        assert_eq!(readings[0].battery, None);
    }

    #[test]
    fn test_too_few_fields_is_malformed() {
        // ---
        let err = parse_log(
            [
                "701878,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00",
                "701878,2024-01-01T00:00:00,20.0",
            ],
            None,
        )
        .unwrap_err();

        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        // ---
        let err = parse_log(["701878,yesterday,20.0,40.0,2024-01-01T00:01:00"], None).unwrap_err();

        assert_eq!(err.line, 1);
        assert!(err.reason.contains("measured_at"));
    }

    #[test]
    fn test_bad_number_is_malformed() {
        // ---
        let err = parse_log(["701878,2024-01-01T00:00:00,warm,40.0,2024-01-01T00:01:00"], None)
            .unwrap_err();

        assert!(err.reason.contains("temperature"));
    }

    #[test]
    fn test_device_filter() {
        // ---
        let lines = [
            "701878,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00",
            "",
            "ffffff,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00",
            "caaeb0,2024-01-01T00:00:00,5.0,80.0,2024-01-01T00:01:00",
        ];

        let filtered = parse_log(lines, Some(&known(&["701878", "caaeb0"]))).unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|r| r.device_id != "ffffff"));

        let unfiltered = parse_log(lines, None).unwrap();
        assert_eq!(unfiltered.len(), 3);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        // ---
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 6, 7, 8).unwrap();

        assert_eq!(parse_timestamp("2024-03-05T06:07:08"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05 06:07:08"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T06:07:08.000"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T07:07:08+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T06:07:08Z"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-05"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("05/03/2024"), None);
    }

    #[test]
    fn test_whitespace_line_skipped_and_line_numbers_kept() {
        // ---
        let text = "701878,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00\n   \n\n701878,oops,20.0,40.0,2024-01-01T00:01:00\n";

        let err = read_log(text.as_bytes(), None).unwrap_err();

        assert_eq!(err.line, 4);
        assert!(err.reason.contains("measured_at"));
    }

    #[test]
    fn test_load_log_from_file() {
        // ---
        let path = std::env::temp_dir().join(format!("heatflow-ingest-{}.csv", std::process::id()));
        std::fs::write(
            &path,
            "caaeb0, 2024-01-01T00:00:00, 5.0, 80.0, 2024-01-01T00:01:00\n\
             701878, 2024-01-01T00:00:00, 20.0, nan, 2024-01-01T00:01:00, 88\n",
        )
        .unwrap();

        let readings = load_log(&path, Some(&known(&["701878"]))).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].humidity, None);
        assert_eq!(readings[0].battery, Some(88.0));
    }
}
