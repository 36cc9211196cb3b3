//! Data models shared by the remote and local halves of the pipeline.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---

/// Login for the metering API. Held in memory only.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Opaque session token returned by `/auth`.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(****)")
    }
}

/// Account scope that owns the metered resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resource classifiers we keep. Anything else the server reports is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Classifier {
    #[serde(rename = "gas.consumption")]
    GasConsumption,
    #[serde(rename = "electricity.consumption")]
    ElectricityConsumption,
}

impl Classifier {
    pub const ALL: [Classifier; 2] = [Classifier::GasConsumption, Classifier::ElectricityConsumption];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classifier::GasConsumption => "gas.consumption",
            Classifier::ElectricityConsumption => "electricity.consumption",
        }
    }

    /// Map a server label onto the allow-list, `None` for anything else.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == label)
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ResourceMap = std::collections::BTreeMap<Classifier, String>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Fixed alignment step, a positive whole number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridInterval(TimeDelta);

impl GridInterval {
    pub fn new(step: TimeDelta) -> Result<Self, ConfigError> {
        // ---
        let seconds = step.num_seconds();
        if seconds <= 0 || step.subsec_nanos() != 0 {
            return Err(ConfigError::InvalidDuration {
                name: "grid interval",
                seconds,
            });
        }
        Ok(Self(step))
    }

    pub fn minutes(minutes: u32) -> Result<Self, ConfigError> {
        Self::new(TimeDelta::seconds(i64::from(minutes) * 60))
    }

    pub fn as_delta(&self) -> TimeDelta {
        self.0
    }

    /// Floor `ts` onto the grid, counting cells from the Unix epoch.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        let step = self.0.num_seconds();
        let floored = ts.timestamp().div_euclid(step) * step;
        DateTime::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// 72 for a 20 minute grid, 48 for 30 minutes.
    pub fn buckets_per_day(&self) -> f64 {
        86_400.0 / self.0.num_seconds() as f64
    }

    /// ISO 8601 duration as the readings endpoint expects it (`PT30M`, `P1D`).
    pub fn as_iso8601(&self) -> String {
        // ---
        let seconds = self.0.num_seconds();
        if seconds % 86_400 == 0 {
            format!("P{}D", seconds / 86_400)
        } else if seconds % 3_600 == 0 {
            format!("PT{}H", seconds / 3_600)
        } else if seconds % 60 == 0 {
            format!("PT{}M", seconds / 60)
        } else {
            format!("PT{}S", seconds)
        }
    }
}

/// One line of the sensor log.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub device_id: String,
    pub measured_at: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub logged_at: DateTime<Utc>,
    /// `None` when the line had no battery column at all.
    pub battery: Option<f64>,
}

impl RawReading {
    /// Delay between the device measuring and our poller logging it.
    pub fn lag(&self) -> TimeDelta {
        self.logged_at - self.measured_at
    }
}

/// One consumption sample from the metering API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyReading {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "kWh")]
    pub kwh: f64,
}

/// Consumption series ordered by timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergySeries {
    pub readings: Vec<EnergyReading>,
}

impl EnergySeries {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnergyReading> {
        self.readings.iter()
    }

    pub fn is_strictly_ascending(&self) -> bool {
        self.readings
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    }
}

/// Row of a locally exported metering CSV: cumulative register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub measured_at: DateTime<Utc>,
    pub reading: f64,
}

/// Where a sensor sits relative to the building envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Internal,
    External,
}

impl Role {
    /// Column-name infix, e.g. `temperature_int_701878`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Internal => "int",
            Role::External => "ext",
        }
    }
}
