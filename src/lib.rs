//! `heatflow`: aligns multi-device temperature/humidity logs and smart-meter
//! consumption on a common time grid for comparison and reporting.
//!
//! The crate follows the Explicit Module Boundary Pattern (EMBP): `api` and
//! `transform` are gateways over their sibling files, and callers go through
//! the re-exports below rather than reaching into submodules.

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod transform;

pub use config::Config;
pub use error::{AuthError, ConfigError, Error, FetchError, MalformedRecordError, ProtocolError, Result};
pub use models::{
    Classifier, Credential, EnergyReading, EnergySeries, EntityId, GridInterval, MeterReading, RawReading,
    ResourceMap, Role, Token, Window,
};
