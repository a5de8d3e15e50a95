use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings read from `lite3.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Lite3Config {
    /// Database file; in-memory when absent. Relative paths in a config file
    /// are resolved against the file's directory.
    pub database: Option<String>,
    /// strftime pattern for date columns
    pub date_format: Option<String>,
    pub statement_cache_capacity: Option<usize>,
}

impl Lite3Config {
    /// Database file, `None` for an in-memory database
    pub fn database_path(&self) -> Option<&Path> {
        self.database.as_deref().map(Path::new)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("lite3.toml")
}

/// Read a config file; `Ok(None)` when it does not exist
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<Lite3Config>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let mut config: Lite3Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;

    if let (Some(database), Some(base)) = (config.database.as_deref(), path.parent()) {
        let database = Path::new(database);
        if database.is_relative() && !base.as_os_str().is_empty() {
            config.database = Some(base.join(database).to_string_lossy().into_owned());
        }
    }
    Ok(Some(config))
}

/// Create the parent directory of a database file
pub fn ensure_db_dir(db_path: &Path) -> std::io::Result<()> {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
