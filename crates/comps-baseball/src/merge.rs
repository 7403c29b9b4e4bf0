// Season merging: inner-join per-season leaderboards into one row per player.

use std::collections::{BTreeMap, HashMap, HashSet};

use comps_core::Season;
use thiserror::Error;
use tracing::{debug, info};

use crate::table::{
    MergedPlayerRow, MergedTable, SeasonStatRow, SeasonTable, SeasonValues, ATTEMPTS,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("no seasons to merge")]
    NoSeasons,

    #[error("season {season} is listed more than once")]
    DuplicateSeason { season: Season },

    #[error("season {season} is missing column `{column}`")]
    SchemaMismatch { season: Season, column: String },

    #[error("season {season} lists player {player_id} ({display_name}) more than once")]
    DuplicatePlayer {
        season: Season,
        player_id: u64,
        display_name: String,
    },

    #[error("joining season {season} left no players")]
    EmptyJoin { season: Season },
}

type PlayerKey = (String, u64);

fn key_of(row: &SeasonStatRow) -> PlayerKey {
    (row.display_name.clone(), row.player_id)
}

fn values_of(row: SeasonStatRow, metrics: &[String]) -> SeasonValues {
    let mut source = row.metrics;
    let metrics = metrics
        .iter()
        .map(|m| (m.clone(), source.remove(m).flatten()))
        .collect();
    SeasonValues {
        attempts: row.attempts,
        metrics,
    }
}

/// Check every season's header before any join runs.
fn validate_schemas(tables: &[SeasonTable], metrics: &[String]) -> Result<(), MergeError> {
    let mut seen = HashSet::new();
    for table in tables {
        if !seen.insert(table.season) {
            return Err(MergeError::DuplicateSeason {
                season: table.season,
            });
        }
        let required = std::iter::once(ATTEMPTS).chain(metrics.iter().map(String::as_str));
        for column in required {
            if !table.has_column(column) {
                return Err(MergeError::SchemaMismatch {
                    season: table.season,
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Index a season's rows by `(display_name, player_id)`, rejecting duplicate
/// keys.
fn index_rows(
    season: Season,
    rows: Vec<SeasonStatRow>,
) -> Result<HashMap<PlayerKey, SeasonStatRow>, MergeError> {
    let mut by_key = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = key_of(&row);
        if by_key.contains_key(&key) {
            return Err(MergeError::DuplicatePlayer {
                season,
                player_id: row.player_id,
                display_name: row.display_name,
            });
        }
        by_key.insert(key, row);
    }
    Ok(by_key)
}

/// Inner-join the seasons on `(display_name, player_id)` in the order given.
///
/// The first table seeds the result; each following table keeps only the
/// players it shares with everything joined so far. Output rows keep the
/// first season's row order. Either every season merges or nothing does.
pub fn merge_seasons(
    tables: Vec<SeasonTable>,
    metrics: &[String],
) -> Result<MergedTable, MergeError> {
    if tables.is_empty() {
        return Err(MergeError::NoSeasons);
    }
    validate_schemas(&tables, metrics)?;

    let seasons: Vec<Season> = tables.iter().map(|t| t.season).collect();
    let mut tables = tables.into_iter();
    let Some(first) = tables.next() else {
        return Err(MergeError::NoSeasons);
    };

    let first_season = first.season;
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(first.rows.len());
    for row in first.rows {
        if !seen.insert(key_of(&row)) {
            return Err(MergeError::DuplicatePlayer {
                season: first_season,
                player_id: row.player_id,
                display_name: row.display_name,
            });
        }
        let player_id = row.player_id;
        let display_name = row.display_name.clone();
        let mut by_season = BTreeMap::new();
        by_season.insert(first_season, values_of(row, metrics));
        rows.push(MergedPlayerRow {
            player_id,
            display_name,
            seasons: by_season,
        });
    }
    if rows.is_empty() {
        return Err(MergeError::EmptyJoin {
            season: first_season,
        });
    }

    for table in tables {
        let season = table.season;
        let mut by_key = index_rows(season, table.rows)?;
        let before = rows.len();
        rows = rows
            .into_iter()
            .filter_map(|mut merged| {
                let key = (merged.display_name.clone(), merged.player_id);
                let row = by_key.remove(&key)?;
                merged.seasons.insert(season, values_of(row, metrics));
                Some(merged)
            })
            .collect();
        debug!(
            "season {}: {} of {} players matched",
            season,
            rows.len(),
            before
        );
        if rows.is_empty() {
            return Err(MergeError::EmptyJoin { season });
        }
    }

    let merged = MergedTable {
        seasons,
        metrics: metrics.to_vec(),
        rows,
    };
    info!(
        "merged {} seasons: {} players, {} columns",
        merged.seasons.len(),
        merged.rows.len(),
        merged.column_names().len()
    );
    Ok(merged)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
