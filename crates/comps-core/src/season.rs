// Season identifiers. Configured seasons may be written as two-digit years
// (`23`), which are read as 2000 + N.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

const EARLIEST_SEASON: u16 = 1900;
const LATEST_SEASON: u16 = 2100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeasonError {
    #[error("season {raw} normalizes to {year}, outside 1900..=2100")]
    OutOfRange { raw: u16, year: u16 },
}

/// A four-digit MLB season year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Season(u16);

impl Season {
    /// Build a season from a configured value. Values below 100 are treated
    /// as two-digit years in the 2000s.
    pub fn from_configured(raw: u16) -> Result<Self, SeasonError> {
        let year = if raw < 100 { 2000 + raw } else { raw };
        if !(EARLIEST_SEASON..=LATEST_SEASON).contains(&year) {
            return Err(SeasonError::OutOfRange { raw, year });
        }
        Ok(Self(year))
    }

    pub fn year(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
