// Persister: shape clustered rows into store records and upsert them one at
// a time.

use std::collections::BTreeMap;
use std::str::FromStr;

use comps_baseball::table::{ClusteredPlayerRow, ClusteredTable};
use comps_core::config::MetricConfig;
use comps_core::db::{PersistedPlayerRecord, PlayerStore, StoreError};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{info, warn};

/// Decimal places kept for every persisted metric.
pub const METRIC_PRECISION: u32 = 2;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("player {player_id}: display name `{display_name}` is not in \"last, first\" form")]
    RecordShape {
        player_id: u64,
        display_name: String,
    },

    #[error("player {player_id}: metric `{metric}` has no finite combined value")]
    InvalidMetric { player_id: u64, metric: String },

    #[error("failed to write player {player_id}: {source}")]
    Store {
        player_id: u64,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistSummary {
    pub written: usize,
}

/// Split `"last, first"` on the first comma into `(last, first)`, trimmed.
/// Anything after the first comma belongs to the first name.
pub fn split_display_name(display_name: &str) -> Option<(String, String)> {
    let (last, first) = display_name.split_once(',')?;
    Some((last.trim().to_string(), first.trim().to_string()))
}

/// Round half-up (away from zero on ties) to `places` decimals.
///
/// Rounds the shortest decimal representation of `value`, so `12.345`
/// becomes `12.35` even though its binary value sits just below the tie.
/// The result always carries exactly `places` decimals.
pub fn round_half_up(value: f64, places: u32) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    let exact = Decimal::from_str(&value.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(value))?;
    let mut rounded = exact.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(places);
    Some(rounded)
}

/// Build the durable record for one clustered row.
pub fn to_record(
    row: &ClusteredPlayerRow,
    metrics: &[MetricConfig],
) -> Result<PersistedPlayerRecord, PersistError> {
    let player_id = row.row.player_id();
    let display_name = row.row.display_name();
    let (last_name, first_name) =
        split_display_name(display_name).ok_or_else(|| PersistError::RecordShape {
            player_id,
            display_name: display_name.to_string(),
        })?;

    let mut values = BTreeMap::new();
    for metric in metrics {
        let value = row
            .row
            .combined
            .get(&metric.key)
            .copied()
            .flatten()
            .and_then(|v| round_half_up(v, METRIC_PRECISION))
            .ok_or_else(|| PersistError::InvalidMetric {
                player_id,
                metric: metric.key.clone(),
            })?;
        values.insert(metric.field.clone(), value);
    }

    Ok(PersistedPlayerRecord {
        player_id: player_id.to_string(),
        first_name,
        last_name,
        metrics: values,
        cluster: row.cluster as i64,
    })
}

/// Upsert every row in table order.
///
/// Rows are written independently: the first failure stops the run, and rows
/// written before it stay in the store.
pub fn persist_all(
    table: &ClusteredTable,
    metrics: &[MetricConfig],
    store: &PlayerStore,
) -> Result<PersistSummary, PersistError> {
    let mut written = 0;
    for row in &table.rows {
        let result = to_record(row, metrics).and_then(|record| {
            store.upsert(&record).map_err(|source| PersistError::Store {
                player_id: row.row.player_id(),
                source,
            })
        });
        if let Err(e) = result {
            warn!("persist stopped after {} of {} rows", written, table.rows.len());
            return Err(e);
        }
        written += 1;
    }
    info!("persisted {} players to `{}`", written, store.table());
    Ok(PersistSummary { written })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use comps_baseball::table::{CombinedPlayerRow, MergedPlayerRow};

    fn metrics() -> Vec<MetricConfig> {
        vec![
            MetricConfig {
                key: "avg_hit_speed".into(),
                field: "exit_velocity".into(),
            },
            MetricConfig {
                key: "brl_percent".into(),
                field: "brl_percent".into(),
            },
        ]
    }

    fn fields() -> Vec<String> {
        metrics().into_iter().map(|m| m.field).collect()
    }

    fn row(id: u64, name: &str, ev: Option<f64>, brl: Option<f64>, cluster: usize) -> ClusteredPlayerRow {
        ClusteredPlayerRow {
            row: CombinedPlayerRow {
                merged: MergedPlayerRow {
                    player_id: id,
                    display_name: name.into(),
                    seasons: BTreeMap::new(),
                },
                combined: BTreeMap::from([
                    ("avg_hit_speed".to_string(), ev),
                    ("brl_percent".to_string(), brl),
                ]),
            },
            cluster,
        }
    }

    fn table(rows: Vec<ClusteredPlayerRow>) -> ClusteredTable {
        ClusteredTable {
            seasons: vec![],
            metrics: vec!["avg_hit_speed".into(), "brl_percent".into()],
            rows,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn rounding_is_half_up_at_two_places() {
        assert_eq!(round_half_up(12.345, 2), Some(dec("12.35")));
        assert_eq!(round_half_up(12.344, 2), Some(dec("12.34")));
        assert_eq!(round_half_up(12.345, 2).unwrap().to_string(), "12.35");
        assert_eq!(round_half_up(0.125, 2).unwrap().to_string(), "0.13");
        assert_eq!(round_half_up(-2.675, 2).unwrap().to_string(), "-2.68");
    }

    #[test]
    fn rounding_pads_to_fixed_precision() {
        assert_eq!(round_half_up(95.0, 2).unwrap().to_string(), "95.00");
        assert_eq!(round_half_up(8.5, 2).unwrap().to_string(), "8.50");
    }

    #[test]
    fn rounding_rejects_non_finite() {
        assert_eq!(round_half_up(f64::NAN, 2), None);
        assert_eq!(round_half_up(f64::INFINITY, 2), None);
    }

    #[test]
    fn display_name_split_on_first_comma() {
        assert_eq!(
            split_display_name("Judge, Aaron"),
            Some(("Judge".into(), "Aaron".into()))
        );
        assert_eq!(
            split_display_name("Guerrero Jr., Vladimir, II"),
            Some(("Guerrero Jr.".into(), "Vladimir, II".into()))
        );
        assert_eq!(split_display_name("Ichiro"), None);
    }

    #[test]
    fn record_carries_rounded_metrics_and_names() {
        let record = to_record(&row(592450, "Judge, Aaron", Some(95.345), Some(26.9), 4), &metrics())
            .unwrap();
        assert_eq!(record.player_id, "592450");
        assert_eq!(record.first_name, "Aaron");
        assert_eq!(record.last_name, "Judge");
        assert_eq!(record.cluster, 4);
        assert_eq!(record.metrics["exit_velocity"].to_string(), "95.35");
        assert_eq!(record.metrics["brl_percent"].to_string(), "26.90");
    }

    #[test]
    fn record_rejects_missing_metric() {
        let err = to_record(&row(1, "A, B", Some(90.0), None, 0), &metrics()).unwrap_err();
        assert!(matches!(
            err,
            PersistError::InvalidMetric { player_id: 1, ref metric } if metric == "brl_percent"
        ));
    }

    #[test]
    fn persisting_twice_is_idempotent() {
        let store = PlayerStore::open(":memory:", "players", &fields()).unwrap();
        let t = table(vec![
            row(1, "Judge, Aaron", Some(96.0), Some(22.0), 0),
            row(2, "Soto, Juan", Some(92.5), Some(12.0), 1),
        ]);

        assert_eq!(persist_all(&t, &metrics(), &store).unwrap().written, 2);
        let first = store.get("1").unwrap().unwrap();
        assert_eq!(persist_all(&t, &metrics(), &store).unwrap().written, 2);

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get("1").unwrap().unwrap(), first);
    }

    #[test]
    fn store_rejection_is_reported_with_its_cause() {
        let store = PlayerStore::open(":memory:", "players", &fields()).unwrap();
        let first = table(vec![
            row(1, "Judge, Aaron", Some(96.0), Some(22.0), 0),
            row(2, "Soto, Juan", Some(92.5), Some(12.0), 1),
        ]);
        persist_all(&first, &metrics(), &store).unwrap();
        let judge = store.get("1").unwrap().unwrap();

        // Records shaped with only exit_velocity lack a column the store has.
        let second = table(vec![row(3, "Kwan, Steven", Some(84.0), Some(1.0), 1)]);
        let err = persist_all(&second, &metrics()[..1], &store).unwrap_err();
        match &err {
            PersistError::Store { player_id, source } => {
                assert_eq!(*player_id, 3);
                assert!(matches!(
                    source,
                    StoreError::MissingField { player_id, field }
                        if player_id == "3" && field == "brl_percent"
                ));
            }
            other => panic!("expected Store error, got {other:?}"),
        }
        let cause = std::error::Error::source(&err)
            .and_then(|e| e.downcast_ref::<StoreError>())
            .unwrap();
        assert!(matches!(cause, StoreError::MissingField { .. }));

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get("1").unwrap().unwrap(), judge);
        assert!(store.get("3").unwrap().is_none());
    }

    #[test]
    fn malformed_name_stops_without_touching_earlier_rows() {
        let store = PlayerStore::open(":memory:", "players", &fields()).unwrap();
        let t = table(vec![
            row(1, "Judge, Aaron", Some(96.0), Some(22.0), 0),
            row(2, "Ichiro", Some(88.0), Some(3.0), 1),
            row(3, "Soto, Juan", Some(92.5), Some(12.0), 1),
        ]);

        let err = persist_all(&t, &metrics(), &store).unwrap_err();
        assert!(matches!(
            err,
            PersistError::RecordShape { player_id: 2, ref display_name } if display_name == "Ichiro"
        ));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.get("1").unwrap().unwrap().last_name, "Judge");
        assert!(store.get("3").unwrap().is_none());
    }
}
