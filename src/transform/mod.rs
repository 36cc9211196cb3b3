//! Local side of the pipeline: sensor-log ingestion, grid bucketing with the
//! device pivot, and the metrics derived from the wide table.

pub mod ingest;
pub mod metrics;
pub mod pivot;

pub use ingest::{load_log, parse_log, read_log};
pub use metrics::{add_degree_days, density, lagged, mean_temperature_diff};
pub use pivot::{bucket_and_pivot, JoinMode, RoleAssignment, WideRecord, WideTable};
