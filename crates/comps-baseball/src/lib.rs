// Batted-ball statistics pipeline stages: acquisition, season merging,
// attempts-weighted aggregation, feature scaling, and clustering.

pub mod aggregate;
pub mod cluster;
pub mod merge;
pub mod savant;
pub mod scale;
pub mod table;
