// Configuration loading and parsing (pipeline.toml).

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::is_sql_identifier;
use crate::season::Season;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "pipeline.toml";

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub metrics: Vec<MetricConfig>,
    pub source: SourceConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Source column names of the tracked metrics, in configured order.
    pub fn metric_keys(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.key.clone()).collect()
    }

    /// Persisted field names of the tracked metrics, in configured order.
    pub fn metric_fields(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.field.clone()).collect()
    }
}

/// Run-level clustering parameters. Seasons are already normalized to
/// four-digit years.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub seasons: Vec<Season>,
    pub cluster_count: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

/// A tracked metric: `key` is the leaderboard column, `field` the name it is
/// persisted under.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricConfig {
    pub key: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Baseball Savant exit velocity & barrels leaderboard.
    Savant(SavantConfig),
    /// Pre-downloaded leaderboard CSVs named `<year>.csv`.
    CsvDir { dir: String },
}

impl SourceConfig {
    /// Copy of this source that never serves a cached leaderboard.
    pub fn without_cache_reuse(&self) -> SourceConfig {
        match self {
            SourceConfig::Savant(savant) => SourceConfig::Savant(SavantConfig {
                cache_max_age_secs: 0,
                ..savant.clone()
            }),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SavantConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Minimum batted-ball events; `"q"` means qualified hitters only.
    #[serde(default = "default_min_bbe")]
    pub min_bbe: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Overrides the platform cache directory when set.
    #[serde(default)]
    pub cache_dir: Option<String>,
    /// Cached leaderboards older than this are downloaded again. Zero always
    /// refetches.
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    pub path: String,
    pub table: String,
}

// ---------------------------------------------------------------------------
// pipeline.toml raw structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire pipeline.toml file.
#[derive(Debug, Clone, Deserialize)]
struct PipelineFile {
    pipeline: PipelineSection,
    metrics: Vec<MetricConfig>,
    source: SourceConfig,
    store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineSection {
    seasons: Vec<u16>,
    #[serde(default = "default_cluster_count")]
    cluster_count: usize,
    #[serde(default = "default_seed")]
    seed: u64,
    #[serde(default = "default_max_iterations")]
    max_iterations: usize,
    #[serde(default = "default_tolerance")]
    tolerance: f64,
}

fn default_cluster_count() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_max_iterations() -> usize {
    300
}

fn default_tolerance() -> f64 {
    1e-4
}

fn default_base_url() -> String {
    "https://baseballsavant.mlb.com/leaderboard/statcast".into()
}

fn default_min_bbe() -> String {
    "q".into()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/pipeline.toml` relative to
/// `base_dir`. Does not copy defaults; see `load_config_in`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    parse_config(&text, &path)
}

/// Parse and validate pipeline.toml text. `path` is only used for error
/// messages.
pub fn parse_config(text: &str, path: &Path) -> Result<Config, ConfigError> {
    let file: PipelineFile = toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut seasons = Vec::with_capacity(file.pipeline.seasons.len());
    for raw in &file.pipeline.seasons {
        let season = Season::from_configured(*raw).map_err(|e| ConfigError::ValidationError {
            field: "pipeline.seasons".into(),
            message: e.to_string(),
        })?;
        seasons.push(season);
    }

    let config = Config {
        pipeline: PipelineConfig {
            seasons,
            cluster_count: file.pipeline.cluster_count,
            seed: file.pipeline.seed,
            max_iterations: file.pipeline.max_iterations,
            tolerance: file.pipeline.tolerance,
        },
        metrics: file.metrics,
        source: file.source,
        store: file.store,
    };

    validate(&config)?;

    Ok(config)
}

/// Seed `config/pipeline.toml` from `defaults/pipeline.toml` when it is
/// missing. Returns the written path, or `None` if a config was already
/// there. Nothing else under `defaults/` is touched.
pub fn ensure_config_file(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.is_file() {
        return Ok(None);
    }
    let default = base_dir.join("defaults").join(CONFIG_FILE);
    let copy_error = |message: String| ConfigError::DefaultsCopyError { message };

    let mut src = std::fs::File::open(&default).map_err(|e| {
        copy_error(format!(
            "no {} and cannot read {}: {e}; run from the project root or pass --base-dir",
            target.display(),
            default.display()
        ))
    })?;
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| copy_error(format!("failed to create {}: {e}", dir.display())))?;
    }

    // create_new so a config written concurrently is never clobbered.
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(copy_error(format!("failed to create {}: {e}", target.display()))),
    };
    std::io::copy(&mut src, &mut dest)
        .map_err(|e| copy_error(format!("failed to write {}: {e}", target.display())))?;
    Ok(Some(target))
}

/// Seed `base_dir/config/pipeline.toml` from defaults if needed, then load.
pub fn load_config_in(base_dir: &Path) -> Result<Config, ConfigError> {
    ensure_config_file(base_dir)?;
    load_config_from(base_dir)
}

/// Platform cache directory for downloaded leaderboards, if one exists.
pub fn default_cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "comps").map(|dirs| dirs.cache_dir().to_path_buf())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let pipeline = &config.pipeline;

    if pipeline.seasons.is_empty() {
        return Err(invalid("pipeline.seasons", "must list at least one season"));
    }
    let mut seen = HashSet::new();
    for season in &pipeline.seasons {
        if !seen.insert(*season) {
            return Err(invalid(
                "pipeline.seasons",
                format!("season {season} is listed more than once"),
            ));
        }
    }

    if pipeline.cluster_count == 0 {
        return Err(invalid("pipeline.cluster_count", "must be greater than 0"));
    }
    if pipeline.max_iterations == 0 {
        return Err(invalid("pipeline.max_iterations", "must be greater than 0"));
    }
    if !pipeline.tolerance.is_finite() || pipeline.tolerance < 0.0 {
        return Err(invalid(
            "pipeline.tolerance",
            format!("must be a finite value >= 0, got {}", pipeline.tolerance),
        ));
    }

    if config.metrics.is_empty() {
        return Err(invalid("metrics", "must track at least one metric"));
    }
    let mut keys = HashSet::new();
    let mut fields = HashSet::new();
    for metric in &config.metrics {
        if metric.key.trim().is_empty() {
            return Err(invalid("metrics.key", "must not be empty"));
        }
        if !keys.insert(metric.key.as_str()) {
            return Err(invalid(
                "metrics.key",
                format!("metric `{}` is listed more than once", metric.key),
            ));
        }
        if !is_sql_identifier(&metric.field) {
            return Err(invalid(
                "metrics.field",
                format!("`{}` is not a valid column name", metric.field),
            ));
        }
        if matches!(
            metric.field.as_str(),
            "player_id" | "first_name" | "last_name" | "cluster" | "updated_at"
        ) {
            return Err(invalid(
                "metrics.field",
                format!("`{}` collides with a reserved record column", metric.field),
            ));
        }
        if !fields.insert(metric.field.as_str()) {
            return Err(invalid(
                "metrics.field",
                format!("field `{}` is listed more than once", metric.field),
            ));
        }
    }

    if !is_sql_identifier(&config.store.table) {
        return Err(invalid(
            "store.table",
            format!("`{}` is not a valid table name", config.store.table),
        ));
    }
    if config.store.path.trim().is_empty() {
        return Err(invalid("store.path", "must not be empty"));
    }

    match &config.source {
        SourceConfig::Savant(savant) => {
            if savant.timeout_secs == 0 {
                return Err(invalid("source.timeout_secs", "must be greater than 0"));
            }
            if savant.base_url.trim().is_empty() {
                return Err(invalid("source.base_url", "must not be empty"));
            }
        }
        SourceConfig::CsvDir { dir } => {
            if dir.trim().is_empty() {
                return Err(invalid("source.dir", "must not be empty"));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
