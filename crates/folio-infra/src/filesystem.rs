//! Data directory layout.

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FOLIO_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `FOLIO_DATA_DIR` environment variable
/// 2. `~/.folio`
/// 3. `.folio` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".folio");
    }

    PathBuf::from(".folio")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(dir: &std::path::Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(dir).await
}
