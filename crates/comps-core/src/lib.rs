// Shared foundation for the comps workspace: configuration, season
// identifiers, and the SQLite-backed player store.

pub mod config;
pub mod db;
pub mod season;

pub use season::Season;

/// Returns true if `name` can be spliced into SQL as a bare identifier
/// (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
