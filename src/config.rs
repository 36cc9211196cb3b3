//! Configuration loader for the `heatflow` batch pipeline.
//!
//! Site layout (devices, their homes, local paths, meter endpoint) lives in a
//! YAML file; per-run values (which home, meter credentials, date range) come
//! from environment variables, with optional `.env` support provided by the
//! caller. Everything is validated here once, so the pipeline stages receive
//! typed, immutable settings.
//!
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::api::session::{ApiSettings, DEFAULT_APPLICATION_ID, DEFAULT_BASE_URL};
use crate::api::window::{BoundaryPolicy, FetchOptions};
use crate::error::ConfigError;
use crate::models::{Classifier, Credential, GridInterval, Role};
use crate::transform::ingest::parse_timestamp;
use crate::transform::pivot::RoleAssignment;

/// The `shelly[].home` value that marks outdoor sensors.
pub const EXTERNAL_HOME: &str = "External";

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Parse an optional timestamp environment variable.
macro_rules! parse_env_time {
    ($var_name:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| parse_timestamp(&v).ok_or_else(|| anyhow!("Invalid {}: {:?}", $var_name, v)))
            .transpose()?
    };
}

// ---

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LocalSettings {
    pub data_dir: PathBuf,
    pub archive_period_hours: u32,
}

/// One site of the sensor cloud: its devices and how to poll them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ShellySite {
    pub home: String,
    pub url: String,
    pub token: String,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeterSettings {
    pub base_url: String,
    pub application_id: String,
    pub window_days: u32,
    pub period_minutes: u32,
    pub concurrency: u32,
    pub range_timeout_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub keep_boundary_duplicates: bool,
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            window_days: 10,
            period_minutes: 30,
            concurrency: 4,
            range_timeout_secs: None,
            request_timeout_secs: 60,
            keep_boundary_duplicates: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridSettings {
    pub interval_minutes: u32,
    pub lag_threshold_hours: u32,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 20,
            lag_threshold_hours: 6,
        }
    }
}

/// The YAML site file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SiteFile {
    pub local: LocalSettings,
    pub shelly: Vec<ShellySite>,
    #[serde(default)]
    pub meter: MeterSettings,
    #[serde(default)]
    pub grid: GridSettings,
}

impl SiteFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse site configuration")
    }

    /// External devices from the `External` site, internal ones from `home`.
    pub fn role_assignment(&self, home: &str) -> std::result::Result<RoleAssignment, ConfigError> {
        // ---
        if !self.shelly.iter().any(|s| s.home == home) {
            return Err(ConfigError::UnknownHome(home.to_string()));
        }
        let pick = |name: &str, role: Role| {
            self.shelly
                .iter()
                .filter(move |s| s.home == name)
                .flat_map(move |s| s.device_ids.iter().map(move |id| (id.clone(), role)))
                .collect::<Vec<_>>()
        };
        RoleAssignment::new(pick(EXTERNAL_HOME, Role::External).into_iter().chain(pick(home, Role::Internal)))
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Parsed site file.
    pub site: SiteFile,

    /// Home whose sensors are the internal devices.
    pub home: String,

    /// Meter login; energy retrieval is skipped without it.
    pub credential: Option<Credential>,

    /// Requested energy range, `[meter_start, meter_end)`.
    pub meter_start: Option<DateTime<Utc>>,
    pub meter_end: Option<DateTime<Utc>>,

    /// Previously exported consumption CSVs, read when nothing is fetched.
    pub gas_meter_log: Option<PathBuf>,
    pub electricity_meter_log: Option<PathBuf>,
}

/// Read the site file named by `HEATFLOW_CONFIG`. Enough for the sensor poll.
pub fn load_site_from_env() -> Result<SiteFile> {
    // ---
    let path = require_env!("HEATFLOW_CONFIG");
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    SiteFile::from_yaml(&text)
}

/// Load configuration from environment variables and the site file.
///
/// Required:
/// - `HEATFLOW_CONFIG` – path to the YAML site file
/// - `HEATFLOW_HOME` – home whose devices are internal
///
/// Optional:
/// - `METER_USERNAME`, `METER_PASSWORD` – metering API login
/// - `METER_START`, `METER_END` – ISO 8601 range to fetch
/// - `HEATFLOW_CONCURRENCY` – overrides `meter.concurrency`
/// - `GAS_METER_LOG`, `ELECTRICITY_METER_LOG` – consumption CSVs to report on
///   when nothing is fetched (default: `{data_dir}/{METER_USERNAME}-{classifier}.csv`)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let mut site = load_site_from_env()?;
    let home = require_env!("HEATFLOW_HOME");
    site.meter.concurrency = parse_env_u32!("HEATFLOW_CONCURRENCY", site.meter.concurrency);

    let username = env::var("METER_USERNAME").ok();
    let credential = match (&username, env::var("METER_PASSWORD")) {
        (Some(user), Ok(password)) => Some(Credential::new(user.as_str(), password)),
        _ => None,
    };
    let meter_start = parse_env_time!("METER_START");
    let meter_end = parse_env_time!("METER_END");

    let meter_log = |var: &str, classifier: Classifier| {
        env::var(var).ok().map(PathBuf::from).or_else(|| {
            username
                .as_ref()
                .map(|user| site.local.data_dir.join(energy_file_name(user, classifier)))
        })
    };
    let gas_meter_log = meter_log("GAS_METER_LOG", Classifier::GasConsumption);
    let electricity_meter_log = meter_log("ELECTRICITY_METER_LOG", Classifier::ElectricityConsumption);

    let config = Config {
        site,
        home,
        credential,
        meter_start,
        meter_end,
        gas_meter_log,
        electricity_meter_log,
    };
    // Fail fast on role and duration problems.
    config.role_assignment()?;
    config.grid()?;
    config.period()?;
    Ok(config)
}

/// `{username}-{classifier}.csv`, the name consumption exports are written under.
pub fn energy_file_name(username: &str, classifier: Classifier) -> String {
    format!("{}-{}.csv", username, classifier)
}

impl Config {
    pub fn role_assignment(&self) -> std::result::Result<RoleAssignment, ConfigError> {
        self.site.role_assignment(&self.home)
    }

    pub fn grid(&self) -> std::result::Result<GridInterval, ConfigError> {
        GridInterval::minutes(self.site.grid.interval_minutes)
    }

    /// Energy reading period, e.g. `PT30M`.
    pub fn period(&self) -> std::result::Result<GridInterval, ConfigError> {
        GridInterval::minutes(self.site.meter.period_minutes)
    }

    pub fn window_span(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.site.meter.window_days))
    }

    pub fn lag_threshold(&self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.site.grid.lag_threshold_hours))
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            base_url: self.site.meter.base_url.clone(),
            application_id: self.site.meter.application_id.clone(),
        }
    }

    pub fn meter_log(&self, classifier: Classifier) -> Option<&Path> {
        match classifier {
            Classifier::GasConsumption => self.gas_meter_log.as_deref(),
            Classifier::ElectricityConsumption => self.electricity_meter_log.as_deref(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.site.meter.request_timeout_secs)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            concurrency: self.site.meter.concurrency as usize,
            boundary: if self.site.meter.keep_boundary_duplicates {
                BoundaryPolicy::Preserve
            } else {
                BoundaryPolicy::Deduplicate
            },
            range_timeout: self.site.meter.range_timeout_secs.map(Duration::from_secs),
            ..FetchOptions::default()
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the sensor cloud tokens and the meter password while showing
    /// every other value that was loaded.
    pub fn log_config(&self) {
        // ---
        let mask = |secret: &str| {
            let visible: String = secret.chars().take(4).collect();
            format!("{}****", visible)
        };
        let fmt_time = |t: Option<DateTime<Utc>>| t.map_or_else(|| "-".to_string(), |t| t.to_rfc3339());

        tracing::info!("Configuration loaded:");
        tracing::info!("  HOME            : {}", self.home);
        tracing::info!("  DATA_DIR        : {}", self.site.local.data_dir.display());
        tracing::info!("  ARCHIVE_PERIOD  : {}h", self.site.local.archive_period_hours);
        for site in &self.site.shelly {
            tracing::info!(
                "  SITE {:<10} : {} token={} devices={:?}",
                site.home,
                site.url,
                mask(&site.token),
                site.device_ids
            );
        }
        tracing::info!("  METER_URL       : {}", self.site.meter.base_url);
        tracing::info!(
            "  METER_USER      : {}",
            self.credential.as_ref().map_or("-", |c| c.username.as_str())
        );
        tracing::info!("  METER_RANGE     : {} .. {}", fmt_time(self.meter_start), fmt_time(self.meter_end));
        for classifier in Classifier::ALL {
            tracing::info!(
                "  METER_LOG       : {} = {}",
                classifier,
                self.meter_log(classifier).map_or_else(|| "-".to_string(), |p| p.display().to_string())
            );
        }
        tracing::info!(
            "  WINDOW          : {}d, period {}m, concurrency {}",
            self.site.meter.window_days,
            self.site.meter.period_minutes,
            self.site.meter.concurrency
        );
        tracing::info!(
            "  GRID            : {}m, lag threshold {}h",
            self.site.grid.interval_minutes,
            self.site.grid.lag_threshold_hours
        );
    }
}
