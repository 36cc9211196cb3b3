//! Sensor cloud status poll.
//!
//! Each configured device is polled for its latest status and turned into one
//! line of the append-only sensor log, in the exact format
//! [`crate::transform::ingest::parse_log`] reads back. Running the poll on a
//! schedule and archiving the log are left to the caller.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::transport::{ApiRequest, Transport};
use crate::config::ShellySite;
use crate::error::ProtocolError;
use crate::transform::ingest::{format_timestamp, parse_timestamp};

// ---

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    data: StatusData,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    device_status: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(rename = "_updated")]
    updated: String,
    tmp: Option<Measured>,
    hum: Option<Measured>,
    bat: Option<Measured>,
}

#[derive(Debug, Deserialize)]
struct Measured {
    value: Option<f64>,
}

/// `GET {url}?id={device_id}&auth_key={auth_key}`.
pub async fn fetch_device_status<T: Transport>(
    transport: &T,
    url: &str,
    auth_key: &str,
    device_id: &str,
) -> Result<DeviceStatus, ProtocolError> {
    // ---
    let request = ApiRequest::get(url)
        .query("id", device_id)
        .query("auth_key", auth_key);

    let response = transport
        .send(request)
        .await
        .map_err(|source| ProtocolError::Transport {
            path: url.to_string(),
            source,
        })?;
    if !response.is_success() {
        return Err(ProtocolError::Status {
            path: url.to_string(),
            status: response.status,
        });
    }

    let malformed = |reason: String| ProtocolError::Malformed {
        path: url.to_string(),
        reason,
    };
    let body: StatusBody = serde_json::from_str(&response.body).map_err(|e| malformed(e.to_string()))?;
    let status = body.data.device_status;
    let updated_at = parse_timestamp(&status.updated)
        .ok_or_else(|| malformed(format!("bad _updated timestamp {:?}", status.updated)))?;

    tracing::debug!("Device {} last updated {}", device_id, updated_at);
    Ok(DeviceStatus {
        device_id: device_id.to_string(),
        updated_at,
        temperature: status.tmp.and_then(|m| m.value),
        humidity: status.hum.and_then(|m| m.value),
        battery: status.bat.and_then(|m| m.value),
    })
}

/// One sensor-log line: `device_id, measured_at, temperature, humidity, logged_at[, battery]`.
pub fn format_log_line(status: &DeviceStatus, read_time: DateTime<Utc>) -> String {
    // ---
    let cell = |v: Option<f64>| v.map_or_else(|| "nan".to_string(), |v| v.to_string());
    let mut line = format!(
        "{}, {}, {}, {}, {}",
        status.device_id,
        format_timestamp(status.updated_at),
        cell(status.temperature),
        cell(status.humidity),
        format_timestamp(read_time),
    );
    if let Some(battery) = status.battery {
        line.push_str(&format!(", {}", battery));
    }
    line
}

/// Poll every device of every site once and append one log line per device.
///
/// A device that cannot be read is logged and skipped so one offline sensor
/// does not cost the others their sample. Returns the number of lines written.
pub async fn poll_sites<T: Transport, W: Write>(
    transport: &T,
    sites: &[ShellySite],
    mut out: W,
) -> crate::error::Result<usize> {
    // ---
    let mut written = 0usize;
    for site in sites {
        for device_id in &site.device_ids {
            match fetch_device_status(transport, &site.url, &site.token, device_id).await {
                Ok(status) => {
                    writeln!(out, "{}", format_log_line(&status, Utc::now()))?;
                    written += 1;
                }
                Err(e) => tracing::error!("Skipping device {} ({}): {}", device_id, site.home, e),
            }
        }
    }
    out.flush()?;
    Ok(written)
}
