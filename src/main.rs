//! Application entry point for the `heatflow` batch pipeline.
//!
//! `heatflow` runs one batch, end to end:
//! - Loading configuration from the site file and environment or `.env`
//! - Initializing structured logging/tracing
//! - Fetching gas/electricity consumption for the requested range (when
//!   meter credentials are configured) and writing one CSV per resource
//! - Parsing the sensor log, pivoting it onto the grid and adding degree-days
//! - Writing the wide table, collection diagnostics and the combined report,
//!   taking consumption from previously exported CSVs when nothing was fetched
//!
//! `heatflow poll` instead reads every configured sensor once and appends the
//! readings to `{data_dir}/log.csv`. It needs only `HEATFLOW_CONFIG`.
//!
//! # Environment Variables
//! - `HEATFLOW_CONFIG` (**required**) – path to the YAML site file
//! - `HEATFLOW_HOME` (**required**) – home whose sensors are internal
//! - `METER_USERNAME`, `METER_PASSWORD`, `METER_START`, `METER_END` (optional)
//! - `GAS_METER_LOG`, `ELECTRICITY_METER_LOG` (optional) – exported consumption CSVs
//! - `HEATFLOW_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `HEATFLOW_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Scheduling, retries and log archiving are left to whatever runs this binary.
use std::env;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use heatflow::api::{shelly, HttpTransport, SessionClient, WindowedFetcher};
use heatflow::config::SiteFile;
use heatflow::export::{self, Timeline};
use heatflow::transform::{self, metrics};
use heatflow::{Classifier, Config, Credential, EnergySeries};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    if env::args().nth(1).as_deref() == Some("poll") {
        return poll(&heatflow::config::load_site_from_env()?).await;
    }

    let cfg = heatflow::config::load_from_env()?;
    cfg.log_config();

    let data_dir = cfg.site.local.data_dir.clone();
    let energy = match (&cfg.credential, cfg.meter_start, cfg.meter_end) {
        (Some(credential), Some(start), Some(end)) => {
            let energy = fetch_energy(&cfg, credential, start, end).await?;
            for (classifier, series) in &energy {
                let name = heatflow::config::energy_file_name(&credential.username, *classifier);
                let path = data_dir.join(name);
                export::write_energy_csv(create(&path)?, series)?;
                tracing::info!("Wrote {}", path.display());
            }
            energy
        }
        _ => {
            tracing::info!("Meter credentials or range not set, skipping energy fetch");
            Vec::new()
        }
    };

    let roles = cfg.role_assignment()?;
    let grid = cfg.grid()?;
    let readings = transform::load_log(&data_dir.join(SENSOR_LOG), None)?;

    export::write_density_csv(
        create(&data_dir.join("metrics-density.csv"))?,
        &metrics::density(&readings, grid),
    )?;
    export::write_lagged_csv(
        create(&data_dir.join("metrics-lagged.csv"))?,
        &metrics::lagged(&readings, cfg.lag_threshold()),
    )?;

    let table = transform::add_degree_days(transform::bucket_and_pivot(readings, &roles, grid));
    if let Some(mean) = transform::mean_temperature_diff(&table) {
        tracing::info!("Mean temperature difference: {:.1} °C", mean);
    }
    export::write_wide_csv(create(&data_dir.join(format!("wide-{}.csv", cfg.home)))?, &table)?;

    if let (Some(start), Some(end)) = (cfg.meter_start, cfg.meter_end) {
        let timeline = |wanted: Classifier| -> Result<Timeline> {
            if let Some((_, series)) = energy.iter().find(|(c, _)| *c == wanted) {
                return Ok(export::series_timeline(series));
            }
            match cfg.meter_log(wanted) {
                Some(path) if path.exists() => {
                    tracing::info!("Reading {} from {}", wanted, path.display());
                    export::load_meter_timeline(path)
                        .with_context(|| format!("Failed to load {}", path.display()))
                }
                _ => {
                    tracing::warn!("No {} data for the report", wanted);
                    Ok(Timeline::new())
                }
            }
        };
        let report = export::combined_report(
            &table,
            &timeline(Classifier::GasConsumption)?,
            &timeline(Classifier::ElectricityConsumption)?,
            cfg.period()?,
            start,
            end,
        );
        export::write_report_csv(create(&data_dir.join(format!("combined-{}.csv", cfg.home)))?, &report)?;
    }

    tracing::info!("Batch complete");
    Ok(())
}

// ---

const SENSOR_LOG: &str = "log.csv";

/// Read each configured sensor once and append to the sensor log.
async fn poll(site: &SiteFile) -> Result<()> {
    // ---
    let transport = HttpTransport::new("", Duration::from_secs(site.meter.request_timeout_secs))?;
    let path = site.local.data_dir.join(SENSOR_LOG);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let written = shelly::poll_sites(&transport, &site.shelly, log).await?;
    tracing::info!("Appended {} line(s) to {}", written, path.display());
    Ok(())
}

/// Log in, discover resources and fetch each over `[start, end)`.
async fn fetch_energy(
    cfg: &Config,
    credential: &Credential,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<(Classifier, EnergySeries)>> {
    // ---
    let settings = cfg.api_settings();
    let transport = HttpTransport::new(settings.base_url.as_str(), cfg.request_timeout())?;
    let session = SessionClient::new(transport, settings);

    let token = session.authenticate(credential).await?;
    let entity = session.resolve_entity(&token).await?;
    let resources = session.list_resources(&entity, &token).await?;

    let fetcher = WindowedFetcher::new(&session, cfg.fetch_options());
    let mut energy = Vec::with_capacity(resources.len());
    for (classifier, resource_id) in resources {
        let series = fetcher
            .fetch_range(&resource_id, &token, start, end, cfg.window_span(), cfg.period()?)
            .await
            .with_context(|| format!("Failed to fetch {}", classifier))?;
        energy.push((classifier, series));
    }
    Ok(energy)
}

fn create(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `HEATFLOW_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `HEATFLOW_LOG_LEVEL` env var
///
/// This should be called once at startup before any logging or tracing
/// macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("HEATFLOW_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to HEATFLOW_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("HEATFLOW_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},reqwest=info,hyper=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
