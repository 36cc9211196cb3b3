//! Grid bucketing and device pivot.
//!
//! Readings from several sensors arrive at uneven times. Each reading is
//! floored onto a fixed grid by `logged_at`, then the long per-device rows are
//! reshaped into one wide row per bucket:
//!
//! 1. one row per external-device reading,
//! 2. each internal device merged in on the bucket, in configured order.
//!
//! With several internal devices the merge is a full outer join, so a bucket
//! seen by any device survives with the other devices' cells missing. With a
//! single internal device it is an inner join and only buckets both sensors
//! logged survive. Duplicate readings in a bucket multiply out, as a
//! relational join does. Rows come out in ascending bucket order.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::ConfigError;
use crate::models::{GridInterval, RawReading, Role};

// ---

/// Static device-to-role mapping: one external sensor, one or more internal.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleAssignment {
    external: String,
    internal: Vec<String>,
}

impl RoleAssignment {
    /// Validate a device/role listing. Internal order is kept for column order.
    pub fn new<I, S>(assignments: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, Role)>,
        S: Into<String>,
    {
        // ---
        let mut external: Vec<String> = Vec::new();
        let mut internal: Vec<String> = Vec::new();

        for (device_id, role) in assignments {
            let device_id = device_id.into();
            let (same, other) = match role {
                Role::External => (&mut external, &internal),
                Role::Internal => (&mut internal, &external),
            };
            if other.contains(&device_id) {
                return Err(ConfigError::ConflictingRole(device_id));
            }
            if !same.contains(&device_id) {
                same.push(device_id);
            }
        }

        let external = match external.len() {
            0 => return Err(ConfigError::NoExternal),
            1 => external.remove(0),
            _ => return Err(ConfigError::MultipleExternal(external)),
        };
        if internal.is_empty() {
            return Err(ConfigError::NoInternal);
        }
        Ok(Self { external, internal })
    }

    pub fn external(&self) -> &str {
        &self.external
    }

    pub fn internal(&self) -> &[String] {
        &self.internal
    }

    pub fn role_of(&self, device_id: &str) -> Option<Role> {
        if self.external == device_id {
            Some(Role::External)
        } else if self.internal.iter().any(|id| id == device_id) {
            Some(Role::Internal)
        } else {
            None
        }
    }

    pub fn device_ids(&self) -> HashSet<String> {
        std::iter::once(self.external.clone())
            .chain(self.internal.iter().cloned())
            .collect()
    }

    pub fn join_mode(&self) -> JoinMode {
        if self.internal.len() > 1 {
            JoinMode::Outer
        } else {
            JoinMode::Inner
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Keep buckets seen by either side.
    Outer,
    /// Keep only buckets seen by both sides.
    Inner,
}

/// Measurements of one device within one wide row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceCells {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
}

impl From<&RawReading> for DeviceCells {
    fn from(r: &RawReading) -> Self {
        Self {
            temperature: r.temperature,
            humidity: r.humidity,
            battery: r.battery,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRecord {
    pub logged_at_rounded: DateTime<Utc>,
    pub external: DeviceCells,
    /// Aligned with [`RoleAssignment::internal`].
    pub internal: Vec<DeviceCells>,
    pub temperature_int_avg: Option<f64>,
    pub temperature_diff_avg: Option<f64>,
    pub cum_degree_days: Option<f64>,
    pub avg_degree_days: Option<f64>,
}

impl WideRecord {
    fn empty(bucket: DateTime<Utc>, internal_count: usize) -> Self {
        Self {
            logged_at_rounded: bucket,
            external: DeviceCells::default(),
            internal: vec![DeviceCells::default(); internal_count],
            temperature_int_avg: None,
            temperature_diff_avg: None,
            cum_degree_days: None,
            avg_degree_days: None,
        }
    }

    /// Value cells in [`WideTable::value_columns`] order.
    pub fn cells(&self) -> Vec<Option<f64>> {
        // ---
        let device = |c: &DeviceCells| [c.temperature, c.humidity, c.battery];
        let mut cells = Vec::with_capacity(3 * (self.internal.len() + 1) + 4);
        cells.extend(device(&self.external));
        for c in &self.internal {
            cells.extend(device(c));
        }
        cells.extend([
            self.temperature_int_avg,
            self.temperature_diff_avg,
            self.cum_degree_days,
            self.avg_degree_days,
        ]);
        cells
    }
}

/// Wide per-bucket table produced by [`bucket_and_pivot`].
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    pub roles: RoleAssignment,
    pub grid: GridInterval,
    pub rows: Vec<WideRecord>,
}

impl WideTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Names of the numeric columns, e.g. `temperature_ext_caaeb0`, ..., `avg_degree_days`.
    pub fn value_columns(&self) -> Vec<String> {
        // ---
        let device = |role: Role, id: &str| {
            ["temperature", "humidity", "battery"]
                .map(|measure| format!("{}_{}_{}", measure, role.prefix(), id))
        };
        let mut columns: Vec<String> = device(Role::External, &self.roles.external).into();
        for id in &self.roles.internal {
            columns.extend(device(Role::Internal, id));
        }
        columns.extend(
            ["temperature_int_avg", "temperature_diff_avg", "cum_degree_days", "avg_degree_days"]
                .map(String::from),
        );
        columns
    }

    /// One named numeric column, `None` if no such column exists.
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let index = self.value_columns().iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row.cells()[index]).collect())
    }
}

/// Row-wise mean of the internal temperatures present; `None` if none are.
fn internal_average(cells: &[DeviceCells]) -> Option<f64> {
    // ---
    let present: Vec<f64> = cells.iter().filter_map(|c| c.temperature).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

type Buckets<T> = BTreeMap<DateTime<Utc>, Vec<T>>;

/// Merge one internal device's buckets into the rows built so far.
fn merge_internal(
    rows: Buckets<WideRecord>,
    device: &Buckets<DeviceCells>,
    slot: usize,
    internal_count: usize,
    mode: JoinMode,
) -> Buckets<WideRecord> {
    // ---
    let mut keys: Vec<DateTime<Utc>> = rows.keys().copied().collect();
    if mode == JoinMode::Outer {
        keys.extend(device.keys().copied());
        keys.sort();
        keys.dedup();
    }

    let mut rows = rows;
    let mut merged = Buckets::new();
    for bucket in keys {
        let left = rows.remove(&bucket);
        let right = device.get(&bucket);
        let out: Vec<WideRecord> = match (left, right) {
            (Some(left), Some(right)) => left
                .iter()
                .flat_map(|row| {
                    right.iter().map(move |cells| {
                        let mut row = row.clone();
                        row.internal[slot] = *cells;
                        row
                    })
                })
                .collect(),
            (Some(left), None) if mode == JoinMode::Outer => left,
            (None, Some(right)) if mode == JoinMode::Outer => right
                .iter()
                .map(|cells| {
                    let mut row = WideRecord::empty(bucket, internal_count);
                    row.internal[slot] = *cells;
                    row
                })
                .collect(),
            _ => Vec::new(),
        };
        if !out.is_empty() {
            merged.insert(bucket, out);
        }
    }
    merged
}

/// Floor readings onto `grid` and pivot them into one wide row per bucket.
///
/// Readings from devices not in `roles` are ignored.
pub fn bucket_and_pivot(
    readings: Vec<RawReading>,
    roles: &RoleAssignment,
    grid: GridInterval,
) -> WideTable {
    // ---
    let mut by_device: HashMap<String, Buckets<DeviceCells>> = HashMap::new();
    let mut ignored = 0usize;
    for reading in &readings {
        if roles.role_of(&reading.device_id).is_none() {
            ignored += 1;
            continue;
        }
        by_device
            .entry(reading.device_id.clone())
            .or_default()
            .entry(grid.floor(reading.logged_at))
            .or_default()
            .push(DeviceCells::from(reading));
    }
    if ignored > 0 {
        tracing::warn!("Ignored {} reading(s) from devices without a role", ignored);
    }

    let internal_count = roles.internal.len();
    let mode = roles.join_mode();
    let empty = Buckets::new();

    let mut rows: Buckets<WideRecord> = by_device
        .get(&roles.external)
        .unwrap_or(&empty)
        .iter()
        .map(|(bucket, cells)| {
            let rows: Vec<WideRecord> = cells
                .iter()
                .map(|c| WideRecord {
                    external: *c,
                    ..WideRecord::empty(*bucket, internal_count)
                })
                .collect();
            (*bucket, rows)
        })
        .collect();

    for (slot, device_id) in roles.internal.iter().enumerate() {
        let device = by_device.get(device_id).unwrap_or(&empty);
        rows = merge_internal(rows, device, slot, internal_count, mode);
    }

    let rows: Vec<WideRecord> = rows
        .into_values()
        .flatten()
        .map(|mut row| {
            row.temperature_int_avg = internal_average(&row.internal);
            row.temperature_diff_avg = row
                .temperature_int_avg
                .zip(row.external.temperature)
                .map(|(int, ext)| int - ext);
            row
        })
        .collect();

    tracing::info!(
        "Pivoted {} reading(s) into {} row(s) ({:?} join, {} internal device(s))",
        readings.len(),
        rows.len(),
        mode,
        internal_count
    );
    WideTable {
        roles: roles.clone(),
        grid,
        rows,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transform::ingest::parse_log;
    use chrono::{TimeDelta, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn create_test_raw_reading(device_id: &str, logged_at: DateTime<Utc>, temp: Option<f64>) -> RawReading {
        // ---
        RawReading {
            device_id: device_id.to_string(),
            measured_at: logged_at - TimeDelta::minutes(1),
            temperature: temp,
            humidity: Some(50.0),
            logged_at,
            battery: None,
        }
    }

    fn roles(internal: &[&str]) -> RoleAssignment {
        RoleAssignment::new(
            std::iter::once(("caaeb0", Role::External))
                .chain(internal.iter().map(|id| (*id, Role::Internal))),
        )
        .unwrap()
    }

    fn grid() -> GridInterval {
        GridInterval::minutes(20).unwrap()
    }

    #[test]
    fn test_role_assignment_validation() {
        // ---
        assert_eq!(
            RoleAssignment::new([("a", Role::Internal)]).unwrap_err(),
            ConfigError::NoExternal
        );
        assert_eq!(
            RoleAssignment::new([("e", Role::External)]).unwrap_err(),
            ConfigError::NoInternal
        );
        assert_eq!(
            RoleAssignment::new([("e", Role::External), ("e", Role::Internal)]).unwrap_err(),
            ConfigError::ConflictingRole("e".to_string())
        );
        assert!(matches!(
            RoleAssignment::new([("e", Role::External), ("f", Role::External), ("a", Role::Internal)]),
            Err(ConfigError::MultipleExternal(_))
        ));

        let ok = roles(&["701878", "edbc1f"]);
        assert_eq!(ok.external(), "caaeb0");
        assert_eq!(ok.internal(), ["701878", "edbc1f"]);
        assert_eq!(ok.role_of("edbc1f"), Some(Role::Internal));
        assert_eq!(ok.role_of("nope"), None);
        assert_eq!(ok.join_mode(), JoinMode::Outer);
        assert_eq!(roles(&["701878"]).join_mode(), JoinMode::Inner);
    }

    #[test]
    fn test_single_bucket_scenario() {
        // ---
        let readings = parse_log(
            [
                "701878,2024-01-01T00:00:00,20.0,40.0,2024-01-01T00:01:00",
                "caaeb0,2024-01-01T00:00:00,5.0,80.0,2024-01-01T00:01:00",
            ],
            None,
        )
        .unwrap();

        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());

        assert_eq!(table.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.logged_at_rounded, at(0, 0));
        assert_eq!(row.temperature_int_avg, Some(20.0));
        assert_eq!(row.temperature_diff_avg, Some(15.0));
        assert_eq!(row.external.humidity, Some(80.0));
        assert_eq!(row.internal[0].humidity, Some(40.0));
    }

    #[test]
    fn test_inner_join_drops_unmatched_buckets() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 5), Some(5.0)),
            create_test_raw_reading("caaeb0", at(0, 25), Some(6.0)),
            create_test_raw_reading("701878", at(0, 10), Some(20.0)),
            create_test_raw_reading("701878", at(0, 45), Some(21.0)),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].logged_at_rounded, at(0, 0));
    }

    #[test]
    fn test_outer_join_keeps_all_buckets() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 5), Some(5.0)),
            create_test_raw_reading("701878", at(0, 10), Some(20.0)),
            create_test_raw_reading("701878", at(0, 25), Some(22.0)),
            create_test_raw_reading("edbc1f", at(0, 15), Some(18.0)),
            create_test_raw_reading("edbc1f", at(0, 45), Some(19.0)),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878", "edbc1f"]), grid());

        let buckets: Vec<_> = table.rows.iter().map(|r| r.logged_at_rounded).collect();
        assert_eq!(buckets, vec![at(0, 0), at(0, 20), at(0, 40)]);

        // Both internals and the external share the first bucket.
        assert_eq!(table.rows[0].temperature_int_avg, Some(19.0));
        assert_eq!(table.rows[0].temperature_diff_avg, Some(14.0));

        // Only 701878 at 00:20, no external reading.
        assert_eq!(table.rows[1].external, DeviceCells::default());
        assert_eq!(table.rows[1].temperature_int_avg, Some(22.0));
        assert_eq!(table.rows[1].temperature_diff_avg, None);

        // Only edbc1f at 00:40.
        assert_eq!(table.rows[2].internal[0].temperature, None);
        assert_eq!(table.rows[2].internal[1].temperature, Some(19.0));
    }

    #[test]
    fn test_external_only_bucket_has_missing_average() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(1, 0), Some(5.0)),
            create_test_raw_reading("701878", at(0, 0), Some(20.0)),
            create_test_raw_reading("edbc1f", at(0, 0), None),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878", "edbc1f"]), grid());

        let last = table.rows.last().unwrap();
        assert_eq!(last.logged_at_rounded, at(1, 0));
        assert_eq!(last.external.temperature, Some(5.0));
        assert_eq!(last.temperature_int_avg, None);
        assert_eq!(last.temperature_diff_avg, None);

        // Missing internal readings are skipped, not averaged as zero.
        assert_eq!(table.rows[0].temperature_int_avg, Some(20.0));
    }

    #[test]
    fn test_duplicate_readings_multiply_out() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 1), Some(5.0)),
            create_test_raw_reading("caaeb0", at(0, 11), Some(6.0)),
            create_test_raw_reading("701878", at(0, 2), Some(20.0)),
            create_test_raw_reading("701878", at(0, 12), Some(21.0)),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());

        assert_eq!(table.len(), 4);
        assert!(table.rows.iter().all(|r| r.logged_at_rounded == at(0, 0)));
    }

    #[test]
    fn test_rebucketing_is_idempotent() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(3, 7), Some(5.0)),
            create_test_raw_reading("701878", at(3, 19), Some(20.0)),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());
        let bucket = table.rows[0].logged_at_rounded;

        assert_eq!(grid().floor(bucket), bucket);
    }

    #[test]
    fn test_unknown_devices_ignored() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 0), Some(5.0)),
            create_test_raw_reading("701878", at(0, 0), Some(20.0)),
            create_test_raw_reading("ffffff", at(0, 0), Some(99.0)),
        ];

        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].temperature_int_avg, Some(20.0));
    }

    #[test]
    fn test_column_names_and_lookup() {
        // ---
        let readings = vec![
            create_test_raw_reading("caaeb0", at(0, 0), Some(5.0)),
            create_test_raw_reading("701878", at(0, 0), Some(20.0)),
        ];
        let table = bucket_and_pivot(readings, &roles(&["701878"]), grid());

        assert_eq!(
            table.value_columns(),
            vec![
                "temperature_ext_caaeb0",
                "humidity_ext_caaeb0",
                "battery_ext_caaeb0",
                "temperature_int_701878",
                "humidity_int_701878",
                "battery_int_701878",
                "temperature_int_avg",
                "temperature_diff_avg",
                "cum_degree_days",
                "avg_degree_days",
            ]
        );
        assert_eq!(table.column("temperature_int_701878"), Some(vec![Some(20.0)]));
        assert_eq!(table.column("battery_ext_caaeb0"), Some(vec![None]));
        assert_eq!(table.column("nope"), None);
    }
}
