// Season statistics acquisition.
//
// Reads the Baseball Savant "exit velocity & barrels" batter leaderboard CSV:
// one row per qualified hitter with a `last_name, first_name` column, a
// `player_id`, an `attempts` count of batted-ball events, and metric columns
// such as `avg_hit_speed`, `avg_hit_angle`, and `brl_percent`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use comps_core::config::{default_cache_dir, SavantConfig, SourceConfig};
use comps_core::Season;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::table::{SeasonStatRow, SeasonTable, ATTEMPTS};

/// Header of the combined display-name column.
pub const NAME_COLUMN: &str = "last_name, first_name";
/// Older leaderboard exports use this header for the same column.
const NAME_COLUMN_ALIAS: &str = "player_name";
pub const PLAYER_ID_COLUMN: &str = "player_id";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("request for season {season} failed: {source}")]
    Http {
        season: Season,
        source: reqwest::Error,
    },

    #[error("request for season {season} returned HTTP {status}")]
    Status {
        season: Season,
        status: reqwest::StatusCode,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV error in season {season}: {source}")]
    Csv { season: Season, source: csv::Error },

    #[error("season {season} has no `{column}` column")]
    MissingIdentity { season: Season, column: &'static str },

    #[error("no data available for season {0}")]
    NoData(Season),
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Provider of one season's batted-ball leaderboard.
#[async_trait]
pub trait SeasonSource: Send + Sync {
    /// Fetch one season, reading `metrics` as numeric columns.
    async fn fetch_season(
        &self,
        season: Season,
        metrics: &[String],
    ) -> Result<SeasonTable, AcquireError>;
}

/// Fetch every season in order, one at a time. Fails on the first season
/// that cannot be fetched.
pub async fn acquire_all(
    source: &dyn SeasonSource,
    seasons: &[Season],
    metrics: &[String],
) -> Result<Vec<SeasonTable>, AcquireError> {
    let mut tables = Vec::with_capacity(seasons.len());
    for &season in seasons {
        let table = source.fetch_season(season, metrics).await?;
        info!("fetched season {}: {} players", season, table.rows.len());
        tables.push(table);
    }
    Ok(tables)
}

/// Build the source described by the config.
pub fn build_source(config: &SourceConfig) -> Result<Box<dyn SeasonSource>, AcquireError> {
    match config {
        SourceConfig::Savant(savant) => Ok(Box::new(SavantClient::new(savant)?)),
        SourceConfig::CsvDir { dir } => Ok(Box::new(CsvDirSource::new(dir))),
    }
}

// ---------------------------------------------------------------------------
// CSV parsing
// ---------------------------------------------------------------------------

fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok()
}

/// Attempts count from a raw cell. "401" and "401.0" are accepted; blank,
/// negative, fractional, or out-of-range values are not.
fn parse_attempts(raw: &str) -> Option<u32> {
    let value = parse_number(raw)?;
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return None;
    }
    Some(value as u32)
}

/// Parse one season's leaderboard CSV.
///
/// The display-name and `player_id` columns are required. Requested metric
/// columns and `attempts` are read when present; which ones were present is
/// recorded in `SeasonTable::columns` so the merger can reject the season.
/// Rows whose identity cannot be parsed are skipped. A row whose attempts
/// cell is blank or not a non-negative whole number is kept with `None`
/// attempts so the aggregation stage can reject it by name.
pub fn parse_season_csv<R: Read>(
    season: Season,
    rdr: R,
    metrics: &[String],
) -> Result<SeasonTable, AcquireError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(rdr);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|source| AcquireError::Csv { season, source })?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.as_str(), i))
        .collect();

    let name_idx = index
        .get(NAME_COLUMN)
        .or_else(|| index.get(NAME_COLUMN_ALIAS))
        .copied()
        .ok_or(AcquireError::MissingIdentity {
            season,
            column: NAME_COLUMN,
        })?;
    let id_idx = index
        .get(PLAYER_ID_COLUMN)
        .copied()
        .ok_or(AcquireError::MissingIdentity {
            season,
            column: PLAYER_ID_COLUMN,
        })?;
    let attempts_idx = index.get(ATTEMPTS).copied();
    let metric_idx: Vec<(&String, usize)> = metrics
        .iter()
        .filter_map(|m| index.get(m.as_str()).map(|&i| (m, i)))
        .collect();

    let columns: BTreeSet<String> = headers.iter().cloned().collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!("season {}: skipping malformed row: {}", season, e);
                continue;
            }
        };
        let field = |i: usize| record.get(i).unwrap_or("");

        let display_name = field(name_idx).to_string();
        if display_name.is_empty() {
            warn!("season {}: skipping row with empty player name", season);
            continue;
        }
        let Ok(player_id) = field(id_idx).parse::<u64>() else {
            warn!(
                "season {}: skipping '{}': unparseable player_id '{}'",
                season,
                display_name,
                field(id_idx)
            );
            continue;
        };
        let attempts = attempts_idx.and_then(|i| {
            let parsed = parse_attempts(field(i));
            if parsed.is_none() {
                warn!(
                    "season {}: '{}' has invalid attempts '{}'",
                    season,
                    display_name,
                    field(i)
                );
            }
            parsed
        });

        let mut values = BTreeMap::new();
        for &(metric, i) in &metric_idx {
            let raw = field(i);
            let value = parse_number(raw);
            if value.is_none() && !raw.is_empty() {
                warn!(
                    "season {}: '{}' has non-numeric {} '{}'",
                    season, display_name, metric, raw
                );
            }
            values.insert(metric.clone(), value);
        }

        rows.push(SeasonStatRow {
            player_id,
            display_name,
            attempts,
            metrics: values,
        });
    }

    Ok(SeasonTable {
        season,
        columns,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Baseball Savant client
// ---------------------------------------------------------------------------

/// Whether a cache file last modified at `modified` may still be served at
/// `now`. A modification time in the future counts as zero age.
pub fn cache_is_fresh(modified: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    now.duration_since(modified).unwrap_or(Duration::ZERO) < max_age
}

/// Downloads leaderboards from Baseball Savant, caching each season's CSV on
/// disk. A cached file is reused until it is older than `cache_max_age`.
pub struct SavantClient {
    http: reqwest::Client,
    base_url: String,
    min_bbe: String,
    cache_dir: Option<PathBuf>,
    cache_max_age: Duration,
}

impl SavantClient {
    pub fn new(config: &SavantConfig) -> Result<Self, AcquireError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(AcquireError::Client)?;
        let cache_dir = if config.cache {
            config
                .cache_dir
                .as_ref()
                .map(PathBuf::from)
                .or_else(default_cache_dir)
        } else {
            None
        };
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            min_bbe: config.min_bbe.clone(),
            cache_dir,
            cache_max_age: Duration::from_secs(config.cache_max_age_secs),
        })
    }

    pub fn leaderboard_url(&self, season: Season) -> String {
        format!(
            "{}?type=batter&year={}&position=&team=&min={}&csv=true",
            self.base_url, season, self.min_bbe
        )
    }

    fn cache_path(&self, season: Season) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("exitvelo_{}_{}.csv", season, self.min_bbe)))
    }

    async fn download(&self, season: Season) -> Result<String, AcquireError> {
        let url = self.leaderboard_url(season);
        debug!("requesting {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| AcquireError::Http { season, source })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AcquireError::Status { season, status });
        }
        response
            .text()
            .await
            .map_err(|source| AcquireError::Http { season, source })
    }

    /// Cached body for `season` if the file exists and is fresh enough.
    async fn read_fresh_cache(
        &self,
        season: Season,
        path: &Path,
    ) -> Result<Option<String>, AcquireError> {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return Ok(None),
        };
        if !cache_is_fresh(modified, SystemTime::now(), self.cache_max_age) {
            debug!("season {}: cached {} is stale", season, path.display());
            return Ok(None);
        }
        debug!("season {}: using cached {}", season, path.display());
        tokio::fs::read_to_string(path)
            .await
            .map(Some)
            .map_err(|source| AcquireError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn store_cache(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create cache directory {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, body).await {
            warn!("could not write cache file {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl SeasonSource for SavantClient {
    async fn fetch_season(
        &self,
        season: Season,
        metrics: &[String],
    ) -> Result<SeasonTable, AcquireError> {
        let cache_path = self.cache_path(season);

        let cached = match &cache_path {
            Some(path) => self.read_fresh_cache(season, path).await?,
            None => None,
        };
        let body = match cached {
            Some(body) => body,
            None => {
                let body = self.download(season).await?;
                if let Some(path) = &cache_path {
                    Self::store_cache(path, &body).await;
                }
                body
            }
        };

        parse_season_csv(season, body.as_bytes(), metrics)
    }
}

// ---------------------------------------------------------------------------
// Local sources
// ---------------------------------------------------------------------------

/// Reads `<dir>/<year>.csv` for each season.
pub struct CsvDirSource {
    dir: PathBuf,
}

impl CsvDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SeasonSource for CsvDirSource {
    async fn fetch_season(
        &self,
        season: Season,
        metrics: &[String],
    ) -> Result<SeasonTable, AcquireError> {
        let path = self.dir.join(format!("{season}.csv"));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| AcquireError::Io {
                path: path.display().to_string(),
                source,
            })?;
        parse_season_csv(season, bytes.as_slice(), metrics)
    }
}

/// In-memory leaderboards keyed by season. Records the order seasons were
/// requested in.
#[derive(Default)]
pub struct StaticSource {
    seasons: HashMap<Season, String>,
    requested: Mutex<Vec<Season>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_season(mut self, season: Season, csv: impl Into<String>) -> Self {
        self.seasons.insert(season, csv.into());
        self
    }

    /// Seasons fetched so far, in request order.
    pub fn requested(&self) -> Vec<Season> {
        self.requested
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeasonSource for StaticSource {
    async fn fetch_season(
        &self,
        season: Season,
        metrics: &[String],
    ) -> Result<SeasonTable, AcquireError> {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(season);
        }
        let csv = self
            .seasons
            .get(&season)
            .ok_or(AcquireError::NoData(season))?;
        parse_season_csv(season, csv.as_bytes(), metrics)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
