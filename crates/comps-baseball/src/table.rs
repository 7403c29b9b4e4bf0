// Typed tables passed between pipeline stages.
//
// Each stage consumes one table shape and produces the next:
// SeasonTable -> MergedTable -> CombinedTable -> ClusteredTable.

use std::collections::{BTreeMap, BTreeSet};

use comps_core::Season;
use serde::Serialize;

/// Column holding the per-season batted-ball event count.
pub const ATTEMPTS: &str = "attempts";

/// Season-suffixed column name, e.g. `avg_hit_speed_2023`.
pub fn column_name(metric: &str, season: Season) -> String {
    format!("{metric}_{season}")
}

/// Name of the multi-season combined column for a metric.
pub fn combined_name(metric: &str) -> String {
    format!("{metric}_combined")
}

// ---------------------------------------------------------------------------
// Single season
// ---------------------------------------------------------------------------

/// One player's raw metrics for one season. A blank source cell is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonStatRow {
    pub player_id: u64,
    /// "last, first"
    pub display_name: String,
    /// `None` when the cell was blank or not a non-negative whole number.
    pub attempts: Option<u32>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// All rows fetched for one season, plus the header columns the source
/// actually provided.
#[derive(Debug, Clone)]
pub struct SeasonTable {
    pub season: Season,
    pub columns: BTreeSet<String>,
    pub rows: Vec<SeasonStatRow>,
}

impl SeasonTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }
}

// ---------------------------------------------------------------------------
// Merged across seasons
// ---------------------------------------------------------------------------

/// Attempts and requested metrics for one player in one merged season.
#[derive(Debug, Clone, PartialEq)]
pub struct SeasonValues {
    pub attempts: Option<u32>,
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// One player present in every merged season.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPlayerRow {
    pub player_id: u64,
    pub display_name: String,
    pub seasons: BTreeMap<Season, SeasonValues>,
}

#[derive(Debug, Clone)]
pub struct MergedTable {
    pub seasons: Vec<Season>,
    pub metrics: Vec<String>,
    pub rows: Vec<MergedPlayerRow>,
}

impl MergedTable {
    /// Flat season-suffixed column names (`attempts_<year>`, `<metric>_<year>`).
    pub fn column_names(&self) -> Vec<String> {
        self.seasons
            .iter()
            .flat_map(|&season| {
                std::iter::once(column_name(ATTEMPTS, season)).chain(
                    self.metrics
                        .iter()
                        .map(move |metric| column_name(metric, season)),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Combined
// ---------------------------------------------------------------------------

/// A merged row plus one attempts-weighted value per tracked metric. A
/// combined value is `None` when any season's value was missing.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedPlayerRow {
    pub merged: MergedPlayerRow,
    pub combined: BTreeMap<String, Option<f64>>,
}

impl CombinedPlayerRow {
    pub fn player_id(&self) -> u64 {
        self.merged.player_id
    }

    pub fn display_name(&self) -> &str {
        &self.merged.display_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// No batted-ball events across all merged seasons.
    ZeroAttempts,
}

/// A merged player dropped before clustering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedPlayer {
    pub player_id: u64,
    pub display_name: String,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone)]
pub struct CombinedTable {
    pub seasons: Vec<Season>,
    pub metrics: Vec<String>,
    pub rows: Vec<CombinedPlayerRow>,
    pub excluded: Vec<ExcludedPlayer>,
}

// ---------------------------------------------------------------------------
// Clustered
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredPlayerRow {
    pub row: CombinedPlayerRow,
    pub cluster: usize,
}

#[derive(Debug, Clone)]
pub struct ClusteredTable {
    pub seasons: Vec<Season>,
    pub metrics: Vec<String>,
    pub rows: Vec<ClusteredPlayerRow>,
}
