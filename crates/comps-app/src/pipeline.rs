// Pipeline orchestration: acquire -> merge -> combine -> scale -> cluster ->
// persist.

use chrono::{DateTime, Utc};
use comps_baseball::aggregate::{combine_weighted, AggregationError};
use comps_baseball::cluster::{assign_clusters, kmeans, ClusterFit, ClusteringError, KMeansParams};
use comps_baseball::merge::{merge_seasons, MergeError};
use comps_baseball::savant::{acquire_all, AcquireError, SeasonSource};
use comps_baseball::scale::{standardize, ScalingError};
use comps_baseball::table::{ClusteredTable, ExcludedPlayer, SeasonTable};
use comps_core::config::Config;
use comps_core::db::PlayerStore;
use comps_core::Season;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::persist::{persist_all, PersistError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A failed run, tagged with the stage that failed. The stage error is the
/// `source()`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetching season statistics failed")]
    Acquire(#[from] AcquireError),

    #[error("merging seasons failed")]
    Merge(#[from] MergeError),

    #[error("computing weighted averages failed")]
    Aggregation(#[from] AggregationError),

    #[error("scaling features failed")]
    Scaling(#[from] ScalingError),

    #[error("clustering players failed")]
    Clustering(#[from] ClusteringError),

    #[error("writing players to the store failed")]
    Persistence(#[from] PersistError),
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Clustered table plus the fit that produced it.
#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    pub table: ClusteredTable,
    pub fit: ClusterFit,
    pub excluded: Vec<ExcludedPlayer>,
    pub merged_players: usize,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub seasons: Vec<Season>,
    pub merged_players: usize,
    pub excluded_players: Vec<ExcludedPlayer>,
    pub clustered_players: usize,
    pub cluster_sizes: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
    pub inertia: f64,
    pub rows_written: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn kmeans_params(config: &Config) -> KMeansParams {
    KMeansParams {
        clusters: config.pipeline.cluster_count,
        seed: config.pipeline.seed,
        max_iterations: config.pipeline.max_iterations,
        tolerance: config.pipeline.tolerance,
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Run the in-memory stages over already-fetched season tables.
pub fn cluster_seasons(
    tables: Vec<SeasonTable>,
    config: &Config,
) -> Result<ClusteringOutcome, PipelineError> {
    let metrics = config.metric_keys();
    let seasons = &config.pipeline.seasons;

    let merged = merge_seasons(tables, &metrics)?;
    let merged_players = merged.rows.len();

    let mut combined = combine_weighted(merged, &metrics, seasons)?;
    let excluded = std::mem::take(&mut combined.excluded);

    let matrix = standardize(&combined, &metrics)?;
    let fit = kmeans(&matrix.rows, &kmeans_params(config))?;
    let table = assign_clusters(combined, &fit.labels)?;

    Ok(ClusteringOutcome {
        table,
        fit,
        excluded,
        merged_players,
    })
}

/// Run the full pipeline against `source`, writing into `store`.
///
/// Seasons are fetched one at a time in configured order. Any stage failure
/// aborts the run; store rows written before a persistence failure remain.
pub async fn run(
    config: &Config,
    source: &dyn SeasonSource,
    store: &PlayerStore,
) -> Result<PipelineReport, PipelineError> {
    let started_at = Utc::now();
    info!(
        "pipeline starting: seasons {:?}, {} metrics, k={}",
        config
            .pipeline
            .seasons
            .iter()
            .map(|s| s.year())
            .collect::<Vec<_>>(),
        config.metrics.len(),
        config.pipeline.cluster_count
    );

    let tables = acquire_all(source, &config.pipeline.seasons, &config.metric_keys()).await?;
    let outcome = cluster_seasons(tables, config)?;
    let summary = persist_all(&outcome.table, &config.metrics, store)?;

    let report = PipelineReport {
        seasons: config.pipeline.seasons.clone(),
        merged_players: outcome.merged_players,
        excluded_players: outcome.excluded,
        clustered_players: outcome.table.rows.len(),
        cluster_sizes: outcome.fit.sizes(),
        iterations: outcome.fit.iterations,
        converged: outcome.fit.converged,
        inertia: outcome.fit.inertia,
        rows_written: summary.written,
        started_at,
        finished_at: Utc::now(),
    };
    info!(
        "pipeline finished: {} players in {} groups, {} written",
        report.clustered_players,
        report.cluster_sizes.len(),
        report.rows_written
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
