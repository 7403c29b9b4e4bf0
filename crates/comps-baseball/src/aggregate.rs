// Attempts-weighted aggregation of per-season metrics.

use std::collections::BTreeMap;

use comps_core::Season;
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{
    column_name, CombinedPlayerRow, CombinedTable, ExcludedPlayer, ExclusionReason, MergedTable,
    ATTEMPTS,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("metric `{metric}` was not merged")]
    UnknownMetric { metric: String },

    #[error("merged table has no column `{column}`")]
    MissingColumn { column: String },

    #[error("player {player_id} ({display_name}) has no usable attempts for season {season}")]
    MissingAttempts {
        player_id: u64,
        display_name: String,
        season: Season,
    },
}

/// Attempts-weighted mean of `(value, attempts)` pairs:
/// `Σ(value * attempts) / Σ(attempts)`.
///
/// Returns `None` when total attempts is zero.
pub fn weighted_average(samples: &[(f64, u32)]) -> Option<f64> {
    let total: u64 = samples.iter().map(|&(_, a)| a as u64).sum();
    if total == 0 {
        return None;
    }
    let weighted: f64 = samples.iter().map(|&(v, a)| v * a as f64).sum();
    Some(weighted / total as f64)
}

/// Collapse each metric's per-season values into one attempts-weighted value
/// per player.
///
/// Players with zero attempts across all `seasons` have no defined average;
/// they are moved to `CombinedTable::excluded` rather than carried forward.
/// A player whose attempts for any season could not be read fails the whole
/// step with `MissingAttempts`. A blank per-season value leaves that combined
/// metric as `None`.
pub fn combine_weighted(
    table: MergedTable,
    metrics: &[String],
    seasons: &[Season],
) -> Result<CombinedTable, AggregationError> {
    if let Some(metric) = metrics.iter().find(|m| !table.metrics.contains(m)) {
        return Err(AggregationError::UnknownMetric {
            metric: metric.clone(),
        });
    }
    if let Some(&season) = seasons.iter().find(|s| !table.seasons.contains(s)) {
        return Err(AggregationError::MissingColumn {
            column: column_name(ATTEMPTS, season),
        });
    }

    let mut rows = Vec::with_capacity(table.rows.len());
    let mut excluded = Vec::new();

    for merged in table.rows {
        let mut per_season = Vec::with_capacity(seasons.len());
        for &season in seasons {
            let values = merged
                .seasons
                .get(&season)
                .ok_or_else(|| AggregationError::MissingColumn {
                    column: column_name(ATTEMPTS, season),
                })?;
            let attempts = values
                .attempts
                .ok_or_else(|| AggregationError::MissingAttempts {
                    player_id: merged.player_id,
                    display_name: merged.display_name.clone(),
                    season,
                })?;
            per_season.push((season, attempts, values));
        }

        let total_attempts: u64 = per_season.iter().map(|&(_, a, _)| a as u64).sum();
        if total_attempts == 0 {
            warn!(
                "excluding {} ({}): zero attempts across {} seasons",
                merged.display_name,
                merged.player_id,
                seasons.len()
            );
            excluded.push(ExcludedPlayer {
                player_id: merged.player_id,
                display_name: merged.display_name.clone(),
                reason: ExclusionReason::ZeroAttempts,
            });
            continue;
        }

        let mut combined = BTreeMap::new();
        for metric in metrics {
            let mut samples = Vec::with_capacity(per_season.len());
            let mut complete = true;
            for &(season, attempts, values) in &per_season {
                let value = values.metrics.get(metric).ok_or_else(|| {
                    AggregationError::MissingColumn {
                        column: column_name(metric, season),
                    }
                })?;
                match value {
                    Some(v) => samples.push((*v, attempts)),
                    None => complete = false,
                }
            }
            let value = if complete {
                weighted_average(&samples)
            } else {
                None
            };
            combined.insert(metric.clone(), value);
        }

        rows.push(CombinedPlayerRow { merged, combined });
    }

    info!(
        "combined {} metrics for {} players ({} excluded)",
        metrics.len(),
        rows.len(),
        excluded.len()
    );

    Ok(CombinedTable {
        seasons: seasons.to_vec(),
        metrics: metrics.to_vec(),
        rows,
        excluded,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
