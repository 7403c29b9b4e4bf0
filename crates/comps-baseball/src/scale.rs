// Feature standardization over the current batch of combined metrics.

use thiserror::Error;
use tracing::debug;

use crate::table::{combined_name, CombinedTable};

// ---------------------------------------------------------------------------
// Pool statistics
// ---------------------------------------------------------------------------

/// Mean and standard deviation for one feature across the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub mean: f64,
    pub stdev: f64,
}

/// Threshold below which standard deviation is treated as zero.
const STDEV_EPSILON: f64 = 1e-9;

/// Compute mean and standard deviation for a slice of values.
///
/// Returns `PoolStats { mean: 0.0, stdev: 0.0 }` for an empty slice.
/// Uses the population standard deviation (N denominator): the batch is the
/// whole universe being grouped, not a sample of it.
pub fn compute_pool_stats(values: &[f64]) -> PoolStats {
    if values.is_empty() {
        return PoolStats {
            mean: 0.0,
            stdev: 0.0,
        };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    PoolStats {
        mean,
        stdev: variance.sqrt(),
    }
}

/// Compute a z-score given a value and pool stats.
///
/// Returns 0.0 if the standard deviation is approximately zero, so a
/// constant feature contributes nothing to distances.
pub fn compute_zscore(value: f64, stats: &PoolStats) -> f64 {
    if stats.stdev < STDEV_EPSILON {
        return 0.0;
    }
    (value - stats.mean) / stats.stdev
}

// ---------------------------------------------------------------------------
// Feature matrix
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScalingError {
    #[error("no players to scale")]
    Empty,

    #[error("no features selected")]
    NoFeatures,

    #[error("feature `{feature}` is not a combined metric")]
    UnknownFeature { feature: String },

    #[error("player {player_id} has no value for `{feature}`")]
    MissingValue { player_id: u64, feature: String },

    #[error("player {player_id} has a non-finite value for `{feature}`")]
    NonFinite { player_id: u64, feature: String },
}

/// Standardized features, one row per player in table order.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub features: Vec<String>,
    pub player_ids: Vec<u64>,
    pub rows: Vec<Vec<f64>>,
    /// Fitted statistics per feature column, refit on every call.
    pub stats: Vec<PoolStats>,
}

/// Standardize `features` (combined metric keys) to zero mean and unit
/// variance over the players in `table`.
///
/// Every value must be present and finite.
pub fn standardize(
    table: &CombinedTable,
    features: &[String],
) -> Result<FeatureMatrix, ScalingError> {
    if features.is_empty() {
        return Err(ScalingError::NoFeatures);
    }
    if table.rows.is_empty() {
        return Err(ScalingError::Empty);
    }
    if let Some(feature) = features.iter().find(|f| !table.metrics.contains(f)) {
        return Err(ScalingError::UnknownFeature {
            feature: combined_name(feature),
        });
    }

    // Column-major raw values, validated.
    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(table.rows.len()); features.len()];
    for row in &table.rows {
        for (col, feature) in features.iter().enumerate() {
            let value = row
                .combined
                .get(feature)
                .copied()
                .flatten()
                .ok_or_else(|| ScalingError::MissingValue {
                    player_id: row.player_id(),
                    feature: combined_name(feature),
                })?;
            if !value.is_finite() {
                return Err(ScalingError::NonFinite {
                    player_id: row.player_id(),
                    feature: combined_name(feature),
                });
            }
            columns[col].push(value);
        }
    }

    let stats: Vec<PoolStats> = columns.iter().map(|c| compute_pool_stats(c)).collect();
    for (feature, s) in features.iter().zip(&stats) {
        debug!(
            "{}: mean {:.4}, stdev {:.4}",
            combined_name(feature),
            s.mean,
            s.stdev
        );
    }

    let rows = (0..table.rows.len())
        .map(|i| {
            columns
                .iter()
                .zip(&stats)
                .map(|(column, s)| compute_zscore(column[i], s))
                .collect()
        })
        .collect();

    Ok(FeatureMatrix {
        features: features.to_vec(),
        player_ids: table.rows.iter().map(|r| r.player_id()).collect(),
        rows,
        stats,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
