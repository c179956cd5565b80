use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::{ChatStore, InMemoryChatStore, SqliteChatStore};
use crate::tree::{DEFAULT_MAX_DEPTH, ReconstructOptions};

/// Where conversations are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// SQLite database file
    Sqlite { path: PathBuf },
    /// Nothing survives the process
    Memory,
}

impl StoreConfig {
    pub fn sqlite(path: PathBuf) -> Self {
        Self::Sqlite { path }
    }

    pub fn default_sqlite() -> Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            Error::Configuration("Could not determine home directory".to_string())
        })?;
        Ok(Self::sqlite(home_dir.join(".arbor").join("arbor.db")))
    }

    pub async fn open(&self) -> Result<Arc<dyn ChatStore>> {
        match self {
            Self::Sqlite { path } => Ok(Arc::new(SqliteChatStore::new(path).await?)),
            Self::Memory => Ok(Arc::new(InMemoryChatStore::new())),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::default_sqlite().unwrap_or_else(|_| Self::sqlite(PathBuf::from("./arbor.db")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub timeout_secs: u64,
    pub max_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub max_depth: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub tree: TreeConfig,
}

impl ArborConfig {
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join("arbor").join("config.toml"))
    }

    /// Load the config file, or defaults if there is none
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    target: "arbor::config",
                    "Failed to parse config file at {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion.timeout_secs)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval.timeout_secs)
    }

    pub fn reconstruct_options(&self) -> ReconstructOptions {
        ReconstructOptions {
            max_depth: self.tree.max_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArborConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.completion.timeout_secs, 30);
        assert_eq!(config.retrieval.max_results, 5);
        assert_eq!(config.tree.max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[store]\ntype = \"memory\"\n\n[retrieval]\nmax_results = 2\n",
        )
        .unwrap();

        let config = ArborConfig::load_from(&path).unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.retrieval.max_results, 2);
        assert_eq!(config.retrieval.timeout_secs, 10);
        assert_eq!(config.completion_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "store = [not toml").unwrap();

        let config = ArborConfig::load_from(&path).unwrap();
        assert_eq!(config.tree, TreeConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ArborConfig {
            store: StoreConfig::sqlite(dir.path().join("chat.db")),
            tree: TreeConfig { max_depth: 50 },
            ..ArborConfig::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(ArborConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn default_store_lives_under_home() {
        let StoreConfig::Sqlite { path } = StoreConfig::default() else {
            unreachable!("expected SQLite config")
        };
        assert!(path.to_string_lossy().ends_with("arbor.db"));
    }
}
